//! Compile-time build metadata for the CLI version surface.

/// Semver package version from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commit the binary was built from (`unknown` outside a git checkout).
pub const GIT_COMMIT: &str = env!("CREEDS_BUILD_GIT_HASH");

/// Cargo profile (`debug`/`release`) used for the build.
pub const BUILD_PROFILE: &str = env!("CREEDS_BUILD_PROFILE");

/// Multi-line block shown by `creeds --version` after the binary name.
pub const CLI_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("CREEDS_BUILD_GIT_HASH"),
    "\nprofile: ",
    env!("CREEDS_BUILD_PROFILE"),
);
