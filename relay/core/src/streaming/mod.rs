//! Stream Reconciliation
//!
//! Folds streamed model output into transcripts while several jobs write to
//! the same or different sessions at once.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          Reconciler                           │
//! │                                                               │
//! │   job A ──events──► run() ─┐                                  │
//! │   job B ──events──► run() ─┼──► reducers ──► SessionStore     │
//! │   job C ──events──► run() ─┘    (pure, keyed by               │
//! │                                  GenerationKey)               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Isolation**: a job only ever touches entries carrying its own key
//! - **Order**: events of one job are applied in transport order
//! - **Single settlement**: a job reaches exactly one terminal phase

mod reconciler;
mod reducer;

pub use reconciler::{Reconciler, Termination, STREAM_ENDED_UNEXPECTEDLY};
pub use reducer::{
    apply_fragment, apply_thought, fail, finalize, is_supported_media, is_tool_content, JobPhase,
    JobState, TOOL_RESULT_MARKER,
};
