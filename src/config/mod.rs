//! Configuration loading from TOML files and environment variables.
//!
//! Precedence (highest wins):
//! 1. Environment variables (`CREEDS_BASE_URL`, `CREEDS_API_TOKEN`,
//!    `CREEDS_API_TIMEOUT_SECS`, `CREEDS_SESSION_DIR`)
//! 2. TOML file given via `--config`
//! 3. `./creeds.toml`
//! 4. `$XDG_CONFIG_HOME/creeds/creeds.toml` (or `~/.config/creeds/creeds.toml`)
//! 5. Built-in defaults

use crate::error::ConfigError;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

mod defaults;
mod env;
mod types;

use defaults::DEFAULT_CONFIG_TEMPLATE;
use env::apply_env_overrides;
pub use types::{Config, DisplayConfig, ServerConfig, SessionsConfig, StreamConfig};

/// Placeholder substituted into `server.history_path`.
pub const THREAD_ID_PLACEHOLDER: &str = "{thread_id}";

/// Which file (if any) the configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    Local,
    Global(PathBuf),
    BuiltInDefaults,
}

/// Load configuration from disk and environment.
///
/// `path_override` is an explicit config file path (from `--config`).
pub fn load_config(path_override: Option<&str>) -> Result<Config, ConfigError> {
    Ok(load_config_with_source(path_override)?.0)
}

/// Load configuration and report where it was read from.
pub fn load_config_with_source(path_override: Option<&str>) -> Result<(Config, ConfigSource), ConfigError> {
    load_config_from_sources(
        path_override,
        |path| std::fs::read_to_string(path),
        |name| std::env::var(name).ok(),
        config_root_dir,
    )
}

fn load_config_from_sources<FRead, FEnv, FRoot>(
    path_override: Option<&str>,
    read_file: FRead,
    env_lookup: FEnv,
    config_root: FRoot,
) -> Result<(Config, ConfigSource), ConfigError>
where
    FRead: Fn(&Path) -> Result<String, std::io::Error>,
    FEnv: Fn(&str) -> Option<String>,
    FRoot: Fn() -> Option<PathBuf>,
{
    let (text, source) = read_config_text(path_override, &read_file, &config_root)?;
    let mut config: Config = toml::from_str(&text)?;
    apply_env_overrides(&mut config, &env_lookup)?;
    normalize(&mut config);
    validate(&config)?;
    tracing::debug!(source = ?source, base_url = %config.server.base_url, "config loaded");
    Ok((config, source))
}

fn read_config_text<FRead, FRoot>(
    path_override: Option<&str>,
    read_file: &FRead,
    config_root: &FRoot,
) -> Result<(String, ConfigSource), ConfigError>
where
    FRead: Fn(&Path) -> Result<String, std::io::Error>,
    FRoot: Fn() -> Option<PathBuf>,
{
    if let Some(p) = path_override {
        let path = PathBuf::from(p);
        let text = read_file(&path)?;
        return Ok((text, ConfigSource::Explicit(path)));
    }
    if let Ok(text) = read_file(Path::new("creeds.toml")) {
        return Ok((text, ConfigSource::Local));
    }
    if let Some(dir) = config_root() {
        let global = dir.join("creeds").join("creeds.toml");
        if let Ok(text) = read_file(&global) {
            return Ok((text, ConfigSource::Global(global)));
        }
    }
    Ok((String::new(), ConfigSource::BuiltInDefaults))
}

fn normalize(config: &mut Config) {
    config.server.base_url = config.server.base_url.trim().trim_end_matches('/').to_string();
    config.server.api_token = config
        .server
        .api_token
        .take()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());
    config.server.timeout_secs = config.server.timeout_secs.max(1);
    config.stream.connect_timeout_secs = config.stream.connect_timeout_secs.max(1);
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let base = &config.server.base_url;
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(ConfigError::Invalid(format!(
            "server.base_url `{base}` must start with http:// or https://"
        )));
    }
    for (key, path) in [
        ("server.stream_path", &config.server.stream_path),
        ("server.history_path", &config.server.history_path),
    ] {
        if !path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "{key} `{path}` must start with '/'"
            )));
        }
    }
    if !config.server.history_path.contains(THREAD_ID_PLACEHOLDER) {
        return Err(ConfigError::Invalid(format!(
            "server.history_path must contain `{THREAD_ID_PLACEHOLDER}`"
        )));
    }
    if config.stream.finalize_attempts == 0 {
        return Err(ConfigError::Invalid(
            "stream.finalize_attempts must be at least 1".to_string(),
        ));
    }
    if config.sessions.dir.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "sessions.dir must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Write the default config template to `path` unless a file already exists.
///
/// Returns `false` when the file was already present.
pub fn write_default_config(path: &Path) -> Result<bool, ConfigError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    // create_new avoids clobbering a file created concurrently.
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(DEFAULT_CONFIG_TEMPLATE.as_bytes())?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Root for per-user config (`$XDG_CONFIG_HOME` or `~/.config`).
pub fn config_root_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".config"))
        .or_else(dirs::config_dir)
}
