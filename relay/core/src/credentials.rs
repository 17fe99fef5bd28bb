//! Credential Broker
//!
//! Chooses which API key serves each request.
//!
//! # Selection Order
//!
//! ```text
//! acquire(pool, locked, skip_advance)
//!   │
//!   ├─ pool empty ──────────────────────────────► NoKeysConfigured
//!   ├─ locked ∈ pool ───────────────────────────► locked      (not new)
//!   ├─ locked ∉ pool ── debug!("stale") ──┐
//!   ├─ exactly one key ───────────────────┴─────► key         (new iff != locked)
//!   └─ rotate: (last_used + 1) mod n, persist ──► pool[next]  (new)
//! ```
//!
//! The rotation cursor lives in the [`SettingsStore`] so it survives
//! restarts. Reading, advancing and persisting it happens under one lock,
//! which keeps concurrent dispatches from landing on the same index.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use crate::settings_store::{SettingsStore, ROTATION_CURSOR_KEY};

/// Credential errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// The pool has no keys
    #[error("no API keys configured")]
    NoKeysConfigured,
}

/// Ordered set of distinct API keys
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyPool {
    keys: Vec<String>,
}

impl KeyPool {
    /// Build a pool from keys, dropping blanks and duplicates
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pool = Vec::new();
        for key in keys {
            let key = key.as_ref().trim();
            if !key.is_empty() && !pool.iter().any(|k: &String| k == key) {
                pool.push(key.to_string());
            }
        }
        Self { keys: pool }
    }

    /// Parse a newline- or comma-separated key list
    pub fn parse(raw: &str) -> Self {
        Self::new(raw.split(|c| c == ',' || c == '\n' || c == '\r'))
    }

    /// Keys in rotation order
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Number of keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the pool is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether `key` is in the pool
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

/// Result of a key acquisition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySelection {
    /// The key to use
    pub key: String,
    /// The key differs from the session's locked key
    pub is_newly_selected: bool,
}

/// Persisted rotation position
///
/// Stores the index of the last key handed out, or nothing before the first
/// rotation.
pub struct RotationCursor {
    settings: Arc<dyn SettingsStore>,
    last_used: Mutex<Option<usize>>,
}

impl RotationCursor {
    /// Load the cursor from the settings store
    pub fn load(settings: Arc<dyn SettingsStore>) -> Self {
        let last_used = settings
            .get(ROTATION_CURSOR_KEY)
            .and_then(|v| v.as_u64())
            .and_then(|v| usize::try_from(v).ok());
        Self {
            settings,
            last_used: Mutex::new(last_used),
        }
    }

    /// Last index handed out
    #[must_use]
    pub fn last_used(&self) -> Option<usize> {
        *self.last_used.lock()
    }

    /// Current position for a pool of `n` keys, without advancing
    fn peek(&self, n: usize) -> usize {
        self.last_used().map_or(0, |i| i % n)
    }

    /// Advance and persist; returns the new index for a pool of `n` keys
    fn advance(&self, n: usize) -> usize {
        let mut last = self.last_used.lock();
        let next = last.map_or(0, |i| (i + 1) % n);
        *last = Some(next);
        if let Err(e) = self.settings.put(ROTATION_CURSOR_KEY, Value::from(next as u64)) {
            tracing::warn!(error = %e, "Failed to persist rotation cursor");
        }
        next
    }
}

/// Selects and rotates API keys
pub struct CredentialBroker {
    cursor: RotationCursor,
    usage: DashMap<String, u64>,
}

impl CredentialBroker {
    /// Create a broker over a persisted cursor
    pub fn new(cursor: RotationCursor) -> Self {
        Self {
            cursor,
            usage: DashMap::new(),
        }
    }

    /// Create a broker loading its cursor from `settings`
    pub fn from_settings(settings: Arc<dyn SettingsStore>) -> Self {
        Self::new(RotationCursor::load(settings))
    }

    /// Pick a key for the next request
    ///
    /// `skip_advance` returns the key at the current cursor position without
    /// moving or persisting the cursor (used by token-count probes).
    pub fn acquire(
        &self,
        pool: &KeyPool,
        locked: Option<&str>,
        skip_advance: bool,
    ) -> Result<KeySelection, CredentialError> {
        if pool.is_empty() {
            return Err(CredentialError::NoKeysConfigured);
        }

        let mut stale = false;
        if let Some(locked) = locked {
            if pool.contains(locked) {
                return Ok(self.hand_out(locked.to_string(), false));
            }
            tracing::debug!("Locked key is no longer in the pool, rotating");
            stale = true;
        }

        if pool.len() == 1 {
            let key = pool.keys()[0].clone();
            let is_new = stale || locked != Some(key.as_str());
            return Ok(self.hand_out(key, is_new));
        }

        let index = if skip_advance {
            self.cursor.peek(pool.len())
        } else {
            self.cursor.advance(pool.len())
        };
        tracing::debug!(index, pool_size = pool.len(), skip_advance, "Rotated API key");
        Ok(self.hand_out(pool.keys()[index].clone(), true))
    }

    /// Requests served by `key` since startup
    #[must_use]
    pub fn usage(&self, key: &str) -> u64 {
        self.usage.get(key).map_or(0, |v| *v)
    }

    /// Usage of every key seen so far
    #[must_use]
    pub fn usage_snapshot(&self) -> Vec<(String, u64)> {
        let mut all: Vec<(String, u64)> = self
            .usage
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort();
        all
    }

    /// The rotation cursor
    #[must_use]
    pub fn cursor(&self) -> &RotationCursor {
        &self.cursor
    }

    fn hand_out(&self, key: String, is_newly_selected: bool) -> KeySelection {
        *self.usage.entry(key.clone()).or_insert(0) += 1;
        KeySelection {
            key,
            is_newly_selected,
        }
    }
}
