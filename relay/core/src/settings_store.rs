//! Settings Store
//!
//! Small key-value persistence contract used for values that must outlive
//! the process: the credential rotation cursor and locked keys.
//!
//! Two implementations ship with the crate: an in-memory map for tests and
//! embedding, and a single JSON document on disk for the CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use parking_lot::Mutex;
use serde_json::Value;

use crate::messages::SessionId;

/// Key under which the rotation cursor is persisted
pub const ROTATION_CURSOR_KEY: &str = "credentials.last_used_index";

/// Prefix of the per-session locked key entries
pub const LOCKED_KEY_PREFIX: &str = "credentials.locked_key.";

/// Key under which a session's locked key is persisted
pub fn locked_key_slot(session_id: &SessionId) -> String {
    format!("{LOCKED_KEY_PREFIX}{session_id}")
}

/// Key-value persistence
pub trait SettingsStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Option<Value>;

    /// Write a value
    fn put(&self, key: &str, value: Value) -> anyhow::Result<()>;
}

/// Settings kept in memory only
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemorySettingsStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }
}

/// Settings persisted as one JSON object on disk
///
/// The whole document is loaded on open and rewritten on every `put`.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    values: Mutex<HashMap<String, Value>>,
}

impl FileSettingsStore {
    /// Open (or lazily create) the store at `path`
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading settings from {}", path.display()))?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing settings in {}", path.display()))?
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Default state file location (`$XDG_DATA_HOME/relay/state.json`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("relay").join("state.json"))
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &HashMap<String, Value>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("writing settings to {}", self.path.display()))
    }
}

impl SettingsStore for FileSettingsStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value);
        self.flush(&values)
    }
}
