//! Transcript Reducers
//!
//! Pure functions that fold one transport event into a session. They never
//! block, never touch the clock (callers pass `now_ms`) and never look at
//! entries of another job, which makes them safe to run inside a store
//! update and easy to test.
//!
//! # Locating Entries
//!
//! Every entry a job creates carries the job's [`GenerationKey`]. The job's
//! *current* entry is the last entry carrying that key; new siblings are
//! inserted right after it. Position alone is never trusted, because other
//! jobs and the user may append to the same session meanwhile.

use crate::backend::{encode_inline, Fragment, Outcome};
use crate::messages::{EntryRole, GenerationKey, JobId, SessionId};
use crate::session::{FileRef, Session, TranscriptEntry};

/// Opening line of a code execution result entry
pub const TOOL_RESULT_MARKER: &str = "**Execution result**";

const CODE_FENCE: &str = "```";

/// MIME families accepted as generated media
const SUPPORTED_MEDIA_PREFIXES: [&str; 4] = ["image/", "audio/", "video/", "application/pdf"];

/// Whether entry content is a tool entry (code block or execution result)
#[must_use]
pub fn is_tool_content(content: &str) -> bool {
    let content = content.trim_start();
    content.starts_with(CODE_FENCE) || content.starts_with(TOOL_RESULT_MARKER)
}

/// Whether generated media of this type is kept
#[must_use]
pub fn is_supported_media(mime_type: &str) -> bool {
    SUPPORTED_MEDIA_PREFIXES
        .iter()
        .any(|prefix| mime_type.starts_with(prefix))
}

/// Lifecycle of a generation job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPhase {
    /// Request sent, nothing received yet
    Dispatched,
    /// Receiving fragments
    Streaming,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Stopped by the user
    Cancelled,
}

impl JobPhase {
    /// Whether the job has finished
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Reconciliation state of one job
#[derive(Clone, Debug)]
pub struct JobState {
    /// Job ID
    pub job_id: JobId,
    /// Session the job writes into
    pub session_id: SessionId,
    /// Correlation key of the job's entries
    pub generation_start: GenerationKey,
    /// Any fragment or thought has arrived
    pub first_token_seen: bool,
    /// A fragment with visible content has arrived
    pub first_meaningful_seen: bool,
    /// Current phase
    pub phase: JobPhase,
}

impl JobState {
    /// State of a freshly dispatched job
    pub fn new(job_id: JobId, session_id: SessionId, generation_start: GenerationKey) -> Self {
        Self {
            job_id,
            session_id,
            generation_start,
            first_token_seen: false,
            first_meaningful_seen: false,
            phase: JobPhase::Dispatched,
        }
    }

    fn latency(&self, now_ms: i64) -> i64 {
        (now_ms - self.generation_start.started_at_ms()).max(0)
    }
}

// ============================================================================
// Reducers
// ============================================================================

/// Fold one fragment into the session; false once the job is finished
pub fn apply_fragment(session: &mut Session, job: &mut JobState, fragment: Fragment, now_ms: i64) -> bool {
    if job.phase.is_terminal() {
        return false;
    }
    job.phase = JobPhase::Streaming;
    mark_first_token(session, job, now_ms);

    let key = job.generation_start;
    match fragment {
        Fragment::Text(text) => {
            if text.is_empty() {
                return true;
            }
            let idx = writable_entry(session, key);
            session.entries[idx].content.push_str(&text);
            mark_meaningful(session, job, idx, now_ms);
        }
        Fragment::ExecutableCode { language, code } => {
            let content = format!("{CODE_FENCE}{language}\n{}\n{CODE_FENCE}", code.trim_end());
            let idx = insert_sibling(session, key, EntryRole::Model, content);
            mark_meaningful(session, job, idx, now_ms);
        }
        Fragment::CodeExecutionResult { outcome, output } => {
            let content = format!(
                "{TOOL_RESULT_MARKER} ({outcome})\n{CODE_FENCE}\n{}\n{CODE_FENCE}",
                output.trim_end()
            );
            let idx = insert_sibling(session, key, EntryRole::ToolResult, content);
            mark_meaningful(session, job, idx, now_ms);
        }
        Fragment::InlineMedia { mime_type, data } => {
            if !is_supported_media(&mime_type) {
                tracing::trace!(mime_type = %mime_type, "Dropping unsupported media fragment");
                return true;
            }
            let name = media_name(&mime_type, session.indices_for(key).len());
            let size = data.len() as u64;
            let file = FileRef::inline(name, mime_type.clone(), encode_inline(&data), size);
            let idx = writable_entry(session, key);
            if mime_type.starts_with("audio/") {
                session.entries[idx].audio = Some(file);
            } else {
                session.entries[idx].files.push(file);
            }
            mark_meaningful(session, job, idx, now_ms);
        }
        Fragment::ReasoningSignature(signature) => {
            let idx = current_or_new(session, key);
            let signatures = &mut session.entries[idx].thought_signatures;
            if !signatures.contains(&signature) {
                signatures.push(signature);
            }
        }
    }
    true
}

/// Fold reasoning text into the session; false once the job is finished
pub fn apply_thought(session: &mut Session, job: &mut JobState, text: &str, now_ms: i64) -> bool {
    if job.phase.is_terminal() {
        return false;
    }
    job.phase = JobPhase::Streaming;
    mark_first_token(session, job, now_ms);

    let idx = writable_entry(session, job.generation_start);
    session.entries[idx].thoughts.push_str(text);
    true
}

/// Finish a job successfully or after cancellation
///
/// Every loading entry of the job is closed. Unless cancelled, empty model
/// entries are removed; if nothing else is left, the last one becomes an
/// error entry carrying `empty_message`. Usage and grounding go on the
/// job's last entry.
pub fn finalize(
    session: &mut Session,
    job: &mut JobState,
    outcome: Option<&Outcome>,
    cancelled: bool,
    empty_message: &str,
    now_ms: i64,
) -> bool {
    if job.phase.is_terminal() {
        return false;
    }
    job.phase = if cancelled {
        JobPhase::Cancelled
    } else {
        JobPhase::Completed
    };

    let key = job.generation_start;
    close_loading(session, key, now_ms);

    if !cancelled {
        remove_empty_entries(session, key, empty_message);
    }

    if let (Some(outcome), Some(last)) = (outcome, session.last_index_for(key)) {
        let previous = session.cumulative_before(last);
        let entry = &mut session.entries[last];
        if let Some(usage) = outcome.usage {
            entry.usage = Some(usage);
            entry.cumulative_total_tokens = Some(previous + usage.total_tokens);
        }
        if outcome.grounding.is_some() {
            entry.grounding.clone_from(&outcome.grounding);
        }
        if outcome.url_context.is_some() {
            entry.url_context.clone_from(&outcome.url_context);
        }
    }
    true
}

/// Finish a job with an error
///
/// Partial content is kept: an empty last entry becomes the error entry,
/// otherwise an error sibling is inserted after it.
pub fn fail(session: &mut Session, job: &mut JobState, message: &str, now_ms: i64) -> bool {
    if job.phase.is_terminal() {
        return false;
    }
    job.phase = JobPhase::Failed;

    let key = job.generation_start;
    close_loading(session, key, now_ms);

    match session.last_index_for(key) {
        Some(idx) if session.entries[idx].is_empty_model() => {
            let entry = &mut session.entries[idx];
            entry.role = EntryRole::Error;
            entry.content = message.to_string();
        }
        Some(idx) => {
            let mut error = TranscriptEntry::error(message, Some(key));
            error.generation_end_ms = Some(now_ms);
            session.entries.insert(idx + 1, error);
        }
        None => {
            let mut error = TranscriptEntry::error(message, Some(key));
            error.generation_end_ms = Some(now_ms);
            session.entries.push(error);
        }
    }
    true
}

// ============================================================================
// Helpers
// ============================================================================

fn mark_first_token(session: &mut Session, job: &mut JobState, now_ms: i64) {
    if job.first_token_seen {
        return;
    }
    job.first_token_seen = true;
    if let Some(idx) = session.last_index_for(job.generation_start) {
        session.entries[idx].first_token_time_ms = Some(job.latency(now_ms));
    }
}

fn mark_meaningful(session: &mut Session, job: &mut JobState, idx: usize, now_ms: i64) {
    if job.first_meaningful_seen {
        return;
    }
    job.first_meaningful_seen = true;
    session.entries[idx].thinking_time_ms = Some(job.latency(now_ms));
}

/// Current entry if it can take more text or media, otherwise a new sibling
fn writable_entry(session: &mut Session, key: GenerationKey) -> usize {
    match session.last_index_for(key) {
        Some(idx) => {
            let entry = &session.entries[idx];
            if entry.is_loading && entry.role == EntryRole::Model && !is_tool_content(&entry.content) {
                idx
            } else {
                insert_sibling(session, key, EntryRole::Model, String::new())
            }
        }
        None => insert_sibling(session, key, EntryRole::Model, String::new()),
    }
}

fn current_or_new(session: &mut Session, key: GenerationKey) -> usize {
    match session.last_index_for(key) {
        Some(idx) => idx,
        None => insert_sibling(session, key, EntryRole::Model, String::new()),
    }
}

/// Insert a loading entry right after the job's last entry
fn insert_sibling(session: &mut Session, key: GenerationKey, role: EntryRole, content: String) -> usize {
    let at = session
        .last_index_for(key)
        .map_or(session.entries.len(), |idx| idx + 1);
    session
        .entries
        .insert(at, TranscriptEntry::sibling(role, key, content));
    at
}

fn close_loading(session: &mut Session, key: GenerationKey, now_ms: i64) {
    for entry in session.entries.iter_mut().filter(|e| e.belongs_to(key)) {
        if entry.is_loading {
            entry.is_loading = false;
            entry.generation_end_ms = Some(now_ms);
        }
    }
}

fn remove_empty_entries(session: &mut Session, key: GenerationKey, empty_message: &str) {
    let indices = session.indices_for(key);
    let empty: Vec<usize> = indices
        .iter()
        .copied()
        .filter(|&i| session.entries[i].is_empty_model())
        .collect();
    if empty.is_empty() {
        return;
    }

    let all_empty = empty.len() == indices.len();
    let keep = if all_empty { empty.last().copied() } else { None };
    for &idx in empty.iter().rev() {
        if Some(idx) != keep {
            session.entries.remove(idx);
        }
    }

    if all_empty {
        if let Some(idx) = session.last_index_for(key) {
            let entry = &mut session.entries[idx];
            entry.role = EntryRole::Error;
            entry.content = empty_message.to_string();
        }
    }
}

fn media_name(mime_type: &str, ordinal: usize) -> String {
    let extension = mime_type
        .rsplit('/')
        .next()
        .unwrap_or("bin")
        .split(';')
        .next()
        .unwrap_or("bin");
    format!("generated-{}.{extension}", ordinal + 1)
}
