//! Environment variable overrides.

use crate::error::ConfigError;

use super::Config;

pub(super) const ENV_BASE_URL: &str = "CREEDS_BASE_URL";
pub(super) const ENV_API_TOKEN: &str = "CREEDS_API_TOKEN";
pub(super) const ENV_API_TIMEOUT_SECS: &str = "CREEDS_API_TIMEOUT_SECS";
pub(super) const ENV_SESSION_DIR: &str = "CREEDS_SESSION_DIR";

pub(super) fn apply_env_overrides<FEnv>(config: &mut Config, env_lookup: &FEnv) -> Result<(), ConfigError>
where
    FEnv: Fn(&str) -> Option<String>,
{
    if let Some(url) = non_blank(env_lookup, ENV_BASE_URL) {
        config.server.base_url = url;
    }
    if let Some(token) = non_blank(env_lookup, ENV_API_TOKEN) {
        config.server.api_token = Some(token);
    }
    if let Some(timeout) = non_blank(env_lookup, ENV_API_TIMEOUT_SECS) {
        let parsed = timeout.parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid {ENV_API_TIMEOUT_SECS} value `{timeout}`: expected positive integer seconds"
            ))
        })?;
        // Clamp to at least one second.
        config.server.timeout_secs = parsed.max(1);
    }
    if let Some(dir) = non_blank(env_lookup, ENV_SESSION_DIR) {
        config.sessions.dir = dir;
    }
    Ok(())
}

fn non_blank<FEnv>(env_lookup: &FEnv, name: &str) -> Option<String>
where
    FEnv: Fn(&str) -> Option<String>,
{
    env_lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
