//! Identifiers and Roles
//!
//! Small value types shared by every other module: session, entry and job
//! identifiers, the generation correlation key, and transcript roles.
//!
//! # Design Philosophy
//!
//! Every identifier is a newtype so a `JobId` can never be passed where a
//! `SessionId` is expected. Identifiers are generated from process-wide atomic
//! counters, which keeps them unique even when many are created in the same
//! millisecond.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new unique session ID
    ///
    /// Uses an atomic counter combined with timestamp to ensure uniqueness
    /// even when multiple sessions are created in the same millisecond.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let count = COUNTER.fetch_add(1, Ordering::SeqCst);
        Self(format!("session_{}_{count}", now_ms()))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transcript entry identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(pub String);

impl EntryId {
    /// Generate a new unique entry ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        Self(format!("entry_{id}"))
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

/// Generation job identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl JobId {
    /// Generate a new unique job ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job_{}", self.0)
    }
}

/// Correlation key shared by every transcript entry a single job produces
///
/// The value is the job's start time in Unix milliseconds, bumped forward
/// when needed so that keys are strictly increasing across the process.
/// Entries are always matched to their job by equality on this key, never
/// by position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GenerationKey(pub i64);

impl GenerationKey {
    /// Allocate the next key: `max(now, last + 1)`
    pub fn next() -> Self {
        static LAST: AtomicI64 = AtomicI64::new(0);
        let now = now_ms();
        let mut last = LAST.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last + 1);
            match LAST.compare_exchange_weak(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Self(candidate),
                Err(actual) => last = actual,
            }
        }
    }

    /// Start time in Unix milliseconds
    #[must_use]
    pub fn started_at_ms(self) -> i64 {
        self.0
    }
}

impl fmt::Display for GenerationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who produced a transcript entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    /// User input
    User,
    /// Model output (text, code, media)
    Model,
    /// Output of a tool the model invoked (code execution result)
    ToolResult,
    /// Failure shown in place of a model reply
    Error,
}

impl EntryRole {
    /// Wire role for history contents
    ///
    /// Tool results are replayed as model turns; errors never reach history.
    #[must_use]
    pub fn wire_role(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model | Self::ToolResult | Self::Error => "model",
        }
    }
}

/// Current time in Unix milliseconds
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
