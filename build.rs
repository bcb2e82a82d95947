//! Embeds commit and build-profile metadata for `creeds --version`.
//!
//! Both values may be pinned through `CREEDS_BUILD_*` env vars for
//! reproducible builds; otherwise git is consulted and failures degrade to
//! `unknown`.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-env-changed=CREEDS_BUILD_GIT_HASH");
    println!("cargo:rerun-if-env-changed=CREEDS_BUILD_PROFILE");

    let commit = env::var("CREEDS_BUILD_GIT_HASH").unwrap_or_else(|_| commit_label());
    let profile = env::var("CREEDS_BUILD_PROFILE")
        .or_else(|_| env::var("PROFILE"))
        .unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=CREEDS_BUILD_GIT_HASH={commit}");
    println!("cargo:rustc-env=CREEDS_BUILD_PROFILE={profile}");
}

/// Short commit hash with a `-dirty` suffix when the worktree has changes.
fn commit_label() -> String {
    let Some(hash) = git(&["rev-parse", "--short=10", "HEAD"]) else {
        return "unknown".to_string();
    };
    match git(&["status", "--porcelain", "--untracked-files=no"]) {
        Some(changes) if !changes.is_empty() => format!("{hash}-dirty"),
        _ => hash,
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    // `status --porcelain` prints nothing for a clean tree; keep the empty
    // string so the caller can tell clean from "git unavailable".
    String::from_utf8(output.stdout)
        .ok()
        .map(|text| text.trim().to_string())
}
