//! Persistent session registry snapshots stored under `.creeds/` by default.
//!
//! The CLI has no long-lived process to hold the registry, so each command
//! loads the last snapshot, works against it, and saves it back.

use crate::store::SessionState;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Subdirectory under the session root holding registry files.
const SESSIONS_DIR: &str = "sessions";
/// File name of the registry snapshot.
const REGISTRY_FILE: &str = "registry.json";
/// On-disk schema version for [`PersistedRegistry`].
const REGISTRY_FILE_VERSION: u32 = 1;
/// Default session root relative to the working directory.
pub const DEFAULT_SESSION_ROOT: &str = ".creeds";

/// Filesystem-backed storage for the session registry.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions_dir: PathBuf,
}

/// On-disk payload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedRegistry {
    version: u32,
    updated_at_millis: u64,
    state: SessionState,
}

impl SessionStore {
    /// Open/create a store rooted under the given directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, String> {
        let sessions_dir = root.as_ref().join(SESSIONS_DIR);
        fs::create_dir_all(&sessions_dir).map_err(|e| {
            format!(
                "failed to create session directory {}: {e}",
                sessions_dir.display()
            )
        })?;
        Ok(Self { sessions_dir })
    }

    /// Save a registry snapshot.
    pub fn save(&self, state: &SessionState) -> Result<(), String> {
        let payload = PersistedRegistry {
            version: REGISTRY_FILE_VERSION,
            updated_at_millis: now_unix_millis(),
            state: state.clone(),
        };
        let json = serde_json::to_vec_pretty(&payload)
            .map_err(|e| format!("failed to serialize session registry: {e}"))?;
        let path = self.registry_path();
        // Write beside the target and rename so a crash mid-write keeps the
        // previous snapshot intact.
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| {
            format!(
                "failed to write temporary registry file {}: {e}",
                tmp_path.display()
            )
        })?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            format!(
                "failed to move registry file into place {}: {e}",
                path.display()
            )
        })?;
        Ok(())
    }

    /// Load the last saved snapshot, or `None` when nothing was saved yet.
    pub fn load(&self) -> Result<Option<SessionState>, String> {
        let path = self.registry_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        let payload: PersistedRegistry = serde_json::from_str(&raw)
            .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
        if payload.version != REGISTRY_FILE_VERSION {
            return Err(format!(
                "unsupported registry file version {} for {}",
                payload.version,
                path.display()
            ));
        }
        Ok(Some(payload.state))
    }

    fn registry_path(&self) -> PathBuf {
        self.sessions_dir.join(REGISTRY_FILE)
    }
}

/// Validate a user-supplied session id (`sessions use <id>`).
pub fn validate_session_id(session_id: &str) -> Result<(), String> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() {
        return Err("session id cannot be empty".to_string());
    }
    if trimmed
        .chars()
        .any(|ch| !(ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'))
    {
        return Err("session id can only contain ASCII letters, numbers, '-', '_'".to_string());
    }
    Ok(())
}

fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate an opaque grouped-hex session id (`xxxx-xxxx-xxxx-xxxx`).
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    let hex = format!("{:016x}", u64::from_be_bytes(bytes));
    format!(
        "{}-{}-{}-{}",
        &hex[0..4],
        &hex[4..8],
        &hex[8..12],
        &hex[12..16]
    )
}
