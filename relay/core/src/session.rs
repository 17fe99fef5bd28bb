//! Session Data Model
//!
//! Sessions, their transcript entries, per-session generation settings and
//! attached file references.
//!
//! # Design Philosophy
//!
//! A session is a plain value. It is owned by the [`SessionStore`] and only
//! ever changed through a store update, so every type here is `Clone` and
//! carries no interior mutability. Entries produced by one generation job are
//! tied together by their [`GenerationKey`]; an entry is final once
//! `is_loading` is cleared.
//!
//! [`SessionStore`]: crate::store::SessionStore

use serde::{Deserialize, Serialize};

use crate::messages::{now_ms, EntryId, EntryRole, GenerationKey, SessionId};

/// Maximum number of characters used for a derived session title
pub const TITLE_MAX_CHARS: usize = 48;

/// Title given to a session before its first user turn
pub const DEFAULT_TITLE: &str = "New chat";

// ============================================================================
// Files
// ============================================================================

/// Upload lifecycle of an attached file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum FileState {
    /// Bytes are still being sent to the file service
    Uploading,
    /// Uploaded, the service is still processing it
    Processing,
    /// Ready to be referenced by a request
    Active,
    /// Upload or processing failed
    Failed(String),
}

impl FileState {
    /// Whether a turn carrying this file may be dispatched
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// A file attached to a transcript entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Unique file ID
    pub id: String,
    /// Display name
    pub name: String,
    /// MIME type
    pub mime_type: String,
    /// Upload state
    pub state: FileState,
    /// Handle of an externally hosted copy, bound to the key that uploaded it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_uri: Option<String>,
    /// Base64 payload for inline files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<String>,
    /// Size of the original payload in bytes
    #[serde(default)]
    pub size_bytes: u64,
}

impl FileRef {
    /// An active file carried inline as base64
    pub fn inline(name: impl Into<String>, mime_type: impl Into<String>, data_b64: String, size_bytes: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            mime_type: mime_type.into(),
            state: FileState::Active,
            remote_uri: None,
            inline_data: Some(data_b64),
            size_bytes,
        }
    }

    /// An active file hosted by the file service
    pub fn remote(name: impl Into<String>, mime_type: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            mime_type: mime_type.into(),
            state: FileState::Active,
            remote_uri: Some(uri.into()),
            inline_data: None,
            size_bytes: 0,
        }
    }

    /// Builder: override the upload state
    #[must_use]
    pub fn with_state(mut self, state: FileState) -> Self {
        self.state = state;
        self
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Reasoning depth for models that accept a discrete level
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    /// Minimal reasoning
    Low,
    /// Full reasoning
    #[default]
    High,
}

impl ThinkingLevel {
    /// Wire representation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::High => "HIGH",
        }
    }
}

/// Content safety blocking threshold
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyThreshold {
    /// Never block
    #[default]
    BlockNone,
    /// Block high-probability harm only
    BlockOnlyHigh,
    /// Block medium and above
    BlockMediumAndAbove,
    /// Block low and above
    BlockLowAndAbove,
}

impl SafetyThreshold {
    /// Wire representation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlockNone => "BLOCK_NONE",
            Self::BlockOnlyHigh => "BLOCK_ONLY_HIGH",
            Self::BlockMediumAndAbove => "BLOCK_MEDIUM_AND_ABOVE",
            Self::BlockLowAndAbove => "BLOCK_LOW_AND_ABOVE",
        }
    }
}

/// Resolution used for media inputs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaResolution {
    /// Let the service decide
    #[default]
    Unspecified,
    /// Low resolution
    Low,
    /// Medium resolution
    Medium,
    /// High resolution
    High,
}

impl MediaResolution {
    /// Wire representation, `None` when unspecified
    #[must_use]
    pub fn as_wire(self) -> Option<&'static str> {
        match self {
            Self::Unspecified => None,
            Self::Low => Some("MEDIA_RESOLUTION_LOW"),
            Self::Medium => Some("MEDIA_RESOLUTION_MEDIUM"),
            Self::High => Some("MEDIA_RESOLUTION_HIGH"),
        }
    }
}

/// Mutable per-session generation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Model identifier
    pub model_id: String,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Nucleus sampling
    pub top_p: Option<f32>,
    /// Top-k sampling
    pub top_k: Option<u32>,
    /// Output token cap
    pub max_output_tokens: Option<u32>,
    /// User-provided system instruction
    pub system_instruction: String,
    /// Attach the web search tool
    pub use_web_search: bool,
    /// Attach the code execution tool
    pub use_code_execution: bool,
    /// Attach the URL context tool
    pub use_url_context: bool,
    /// Deep search mode (web search plus research instruction)
    pub deep_search: bool,
    /// Explicit reasoning budget; positive values win over `thinking_level`
    pub thinking_budget: i32,
    /// Discrete reasoning level
    pub thinking_level: Option<ThinkingLevel>,
    /// Ask the model to return its reasoning
    pub show_thoughts: bool,
    /// Constrain the response to JSON
    pub json_output: bool,
    /// Safety blocking threshold
    pub safety_threshold: SafetyThreshold,
    /// Aspect ratio for image generation models
    pub image_aspect_ratio: String,
    /// Voice for speech generation models
    pub tts_voice: String,
    /// Resolution for media inputs
    pub media_resolution: MediaResolution,
    /// Key pinned because the session references files hosted under it
    pub locked_key: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model_id: crate::config::DEFAULT_MODEL.to_string(),
            temperature: None,
            top_p: None,
            top_k: None,
            max_output_tokens: None,
            system_instruction: String::new(),
            use_web_search: false,
            use_code_execution: false,
            use_url_context: false,
            deep_search: false,
            thinking_budget: 0,
            thinking_level: None,
            show_thoughts: false,
            json_output: false,
            safety_threshold: SafetyThreshold::default(),
            image_aspect_ratio: "1:1".to_string(),
            tts_voice: "Kore".to_string(),
            media_resolution: MediaResolution::default(),
            locked_key: None,
        }
    }
}

impl SessionSettings {
    /// Builder: set the model
    #[must_use]
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }
}

// ============================================================================
// Transcript
// ============================================================================

/// Token accounting reported with a completed generation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u64,
    /// Tokens in the visible completion
    pub completion_tokens: u64,
    /// Total billed tokens
    pub total_tokens: u64,
    /// Tokens spent on reasoning
    #[serde(default)]
    pub thought_tokens: u64,
    /// Tokens served from cache
    #[serde(default)]
    pub cached_tokens: u64,
}

/// One entry of a session transcript
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Unique entry ID
    pub id: EntryId,
    /// Who produced it
    pub role: EntryRole,
    /// Text content
    pub content: String,
    /// Attached or generated files
    #[serde(default)]
    pub files: Vec<FileRef>,
    /// Generated audio
    #[serde(default)]
    pub audio: Option<FileRef>,
    /// Still receiving content
    pub is_loading: bool,
    /// Key of the job that produced this entry
    #[serde(default)]
    pub generation_start: Option<GenerationKey>,
    /// When the job finished (Unix ms)
    #[serde(default)]
    pub generation_end_ms: Option<i64>,
    /// Accumulated reasoning text
    #[serde(default)]
    pub thoughts: String,
    /// Latency until the first meaningful fragment
    #[serde(default)]
    pub thinking_time_ms: Option<i64>,
    /// Latency until the first fragment of any kind
    #[serde(default)]
    pub first_token_time_ms: Option<i64>,
    /// Token accounting
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    /// Running total of tokens in the session up to this entry
    #[serde(default)]
    pub cumulative_total_tokens: Option<u64>,
    /// Search grounding metadata, opaque
    #[serde(default)]
    pub grounding: Option<serde_json::Value>,
    /// URL context metadata, opaque
    #[serde(default)]
    pub url_context: Option<serde_json::Value>,
    /// Opaque reasoning signatures replayed with history
    #[serde(default)]
    pub thought_signatures: Vec<String>,
    /// When the entry was created (Unix ms)
    pub created_at: i64,
}

impl TranscriptEntry {
    fn blank(role: EntryRole) -> Self {
        Self {
            id: EntryId::new(),
            role,
            content: String::new(),
            files: Vec::new(),
            audio: None,
            is_loading: false,
            generation_start: None,
            generation_end_ms: None,
            thoughts: String::new(),
            thinking_time_ms: None,
            first_token_time_ms: None,
            usage: None,
            cumulative_total_tokens: None,
            grounding: None,
            url_context: None,
            thought_signatures: Vec::new(),
            created_at: now_ms(),
        }
    }

    /// A user turn
    pub fn user(content: impl Into<String>, files: Vec<FileRef>) -> Self {
        Self {
            content: content.into(),
            files,
            ..Self::blank(EntryRole::User)
        }
    }

    /// An empty model entry receiving a job's output
    pub fn loading(key: GenerationKey) -> Self {
        Self {
            is_loading: true,
            generation_start: Some(key),
            ..Self::blank(EntryRole::Model)
        }
    }

    /// A loading sibling of the given role for the same job
    pub fn sibling(role: EntryRole, key: GenerationKey, content: String) -> Self {
        Self {
            content,
            is_loading: true,
            generation_start: Some(key),
            ..Self::blank(role)
        }
    }

    /// A final error entry
    pub fn error(message: impl Into<String>, key: Option<GenerationKey>) -> Self {
        Self {
            content: message.into(),
            generation_start: key,
            ..Self::blank(EntryRole::Error)
        }
    }

    /// Whether this entry belongs to the job with `key`
    #[must_use]
    pub fn belongs_to(&self, key: GenerationKey) -> bool {
        self.generation_start == Some(key)
    }

    /// Model entry with nothing to show: no text, media, or reasoning
    #[must_use]
    pub fn is_empty_model(&self) -> bool {
        self.role == EntryRole::Model
            && self.content.trim().is_empty()
            && self.files.is_empty()
            && self.audio.is_none()
            && self.thoughts.trim().is_empty()
    }
}

/// A conversation session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID
    pub id: SessionId,
    /// Display title, derived from the first user turn
    pub title: String,
    /// Ordered transcript
    pub entries: Vec<TranscriptEntry>,
    /// Generation settings
    pub settings: SessionSettings,
    /// When the session was created (Unix ms)
    pub created_at: i64,
}

impl Session {
    /// Create an empty session
    pub fn new(settings: SessionSettings) -> Self {
        Self::with_id(SessionId::new(), settings)
    }

    /// Create an empty session with a caller-chosen ID
    pub fn with_id(id: SessionId, settings: SessionSettings) -> Self {
        Self {
            id,
            title: DEFAULT_TITLE.to_string(),
            entries: Vec::new(),
            settings,
            created_at: now_ms(),
        }
    }

    /// Append a user entry, deriving the title from the first one
    pub fn push_user(&mut self, entry: TranscriptEntry) {
        if self.title == DEFAULT_TITLE && !entry.content.trim().is_empty() {
            self.title = derive_title(&entry.content);
        }
        self.entries.push(entry);
    }

    /// Indices of every entry produced by the job with `key`
    #[must_use]
    pub fn indices_for(&self, key: GenerationKey) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.belongs_to(key))
            .map(|(i, _)| i)
            .collect()
    }

    /// Index of the last entry produced by the job with `key`
    #[must_use]
    pub fn last_index_for(&self, key: GenerationKey) -> Option<usize> {
        self.entries.iter().rposition(|e| e.belongs_to(key))
    }

    /// Whether any entry of this session is still loading
    #[must_use]
    pub fn has_loading(&self) -> bool {
        self.entries.iter().any(|e| e.is_loading)
    }

    /// Cumulative token total of the last entry before `index` that has one
    #[must_use]
    pub fn cumulative_before(&self, index: usize) -> u64 {
        self.entries[..index]
            .iter()
            .rev()
            .find_map(|e| e.cumulative_total_tokens)
            .unwrap_or(0)
    }
}

fn derive_title(text: &str) -> String {
    let line = text.trim().lines().next().unwrap_or_default();
    let mut title: String = line.chars().take(TITLE_MAX_CHARS).collect();
    if line.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_from_first_user_turn() {
        let mut session = Session::new(SessionSettings::default());
        assert_eq!(session.title, DEFAULT_TITLE);

        session.push_user(TranscriptEntry::user("What is Rust?\nmore", vec![]));
        assert_eq!(session.title, "What is Rust?");

        session.push_user(TranscriptEntry::user("second", vec![]));
        assert_eq!(session.title, "What is Rust?");
    }

    #[test]
    fn test_long_title_truncated() {
        let mut session = Session::new(SessionSettings::default());
        session.push_user(TranscriptEntry::user("x".repeat(100), vec![]));
        assert_eq!(session.title.chars().count(), TITLE_MAX_CHARS + 1);
    }

    #[test]
    fn test_entries_located_by_key() {
        let a = GenerationKey(100);
        let b = GenerationKey(200);
        let mut session = Session::new(SessionSettings::default());
        session.entries.push(TranscriptEntry::loading(a));
        session.entries.push(TranscriptEntry::loading(b));
        session.entries.push(TranscriptEntry::sibling(EntryRole::ToolResult, a, "r".into()));

        assert_eq!(session.indices_for(a), vec![0, 2]);
        assert_eq!(session.last_index_for(b), Some(1));
        assert_eq!(session.last_index_for(GenerationKey(300)), None);
    }

    #[test]
    fn test_empty_model_detection() {
        let mut entry = TranscriptEntry::loading(GenerationKey(1));
        assert!(entry.is_empty_model());
        entry.thoughts.push_str("hmm");
        assert!(!entry.is_empty_model());

        let err = TranscriptEntry::error("boom", None);
        assert!(!err.is_empty_model());
    }

    #[test]
    fn test_cumulative_before() {
        let mut session = Session::new(SessionSettings::default());
        let mut first = TranscriptEntry::loading(GenerationKey(1));
        first.cumulative_total_tokens = Some(10);
        session.entries.push(first);
        session.entries.push(TranscriptEntry::user("hi", vec![]));
        session.entries.push(TranscriptEntry::loading(GenerationKey(2)));

        assert_eq!(session.cumulative_before(2), 10);
        assert_eq!(session.cumulative_before(0), 0);
    }

    #[test]
    fn test_file_state_ready() {
        assert!(FileState::Active.is_ready());
        assert!(!FileState::Processing.is_ready());
        assert!(!FileState::Failed("bad".into()).is_ready());
    }

    #[test]
    fn test_session_round_trips_through_json() {
        let mut session = Session::new(SessionSettings::default());
        session.push_user(TranscriptEntry::user("hello", vec![]));
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}
