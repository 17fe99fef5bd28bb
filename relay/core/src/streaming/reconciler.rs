//! Job Reconciler
//!
//! Drives one generation job: reads the transport's events, folds each into
//! the session store through the pure reducers, and settles the job exactly
//! once.
//!
//! ```text
//!   transport ──TransportEvent──► Reconciler::run ──update_session──► SessionStore
//!                                      │
//!   CancellationToken ────────────────►│ (select!)
//!                                      ▼
//!                              JobRegistry::complete (once)
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::reducer::{apply_fragment, apply_thought, fail, finalize, JobPhase, JobState};
use crate::backend::{Outcome, TransportEvent};
use crate::config::Messages;
use crate::jobs::JobRegistry;
use crate::messages::now_ms;
use crate::notify::{snippet, Notifier};
use crate::store::SessionStore;

const NOTIFICATION_BODY_CHARS: usize = 120;

/// Error shown when a stream closes without a terminal event
pub const STREAM_ENDED_UNEXPECTEDLY: &str = "Stream ended unexpectedly";

/// How a job ended
#[derive(Clone, Debug, PartialEq)]
pub enum Termination {
    /// Generation finished
    Completed(Outcome),
    /// Generation failed with a provider message
    Failed(String),
    /// Stopped by the user
    Cancelled,
}

/// Applies transport events of running jobs to the session store
pub struct Reconciler {
    store: Arc<SessionStore>,
    registry: Arc<JobRegistry>,
    notifier: Arc<dyn Notifier>,
    messages: Messages,
    notify_on_completion: bool,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(
        store: Arc<SessionStore>,
        registry: Arc<JobRegistry>,
        notifier: Arc<dyn Notifier>,
        messages: Messages,
        notify_on_completion: bool,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            messages,
            notify_on_completion,
        }
    }

    /// Consume a job's events until it settles; returns its final phase
    pub async fn run(
        &self,
        mut job: JobState,
        mut events: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> JobPhase {
        let session_id = job.session_id.clone();

        let termination = loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break Termination::Cancelled,
                event = events.recv() => event,
            };

            let applied = match event {
                Some(TransportEvent::Fragment(fragment)) => {
                    tracing::trace!(job_id = %job.job_id, "Fragment");
                    self.store
                        .update_session(&session_id, |s| apply_fragment(s, &mut job, fragment, now_ms()))
                }
                Some(TransportEvent::Thought(text)) => self
                    .store
                    .update_session(&session_id, |s| apply_thought(s, &mut job, &text, now_ms())),
                Some(TransportEvent::Complete(outcome)) => break Termination::Completed(outcome),
                Some(TransportEvent::Error(message)) if cancel.is_cancelled() => {
                    tracing::debug!(job_id = %job.job_id, error = %message, "Error after cancellation");
                    break Termination::Cancelled;
                }
                Some(TransportEvent::Error(message)) => break Termination::Failed(message),
                None if cancel.is_cancelled() => break Termination::Cancelled,
                None => break Termination::Failed(STREAM_ENDED_UNEXPECTEDLY.to_string()),
            };

            if applied.is_none() {
                tracing::warn!(job_id = %job.job_id, session_id = %session_id, "Session removed while generating");
                break Termination::Cancelled;
            }
        };

        self.settle(&mut job, termination);
        job.phase
    }

    /// Settle a job that never produced a stream (or finished one)
    ///
    /// Applies the terminal reducer, removes the job from the registry and
    /// notifies the host. Does nothing for a job that already settled.
    pub fn settle(&self, job: &mut JobState, termination: Termination) {
        if job.phase.is_terminal() {
            return;
        }
        let session_id = job.session_id.clone();

        match &termination {
            Termination::Completed(outcome) => {
                self.store.update_session(&session_id, |s| {
                    finalize(s, job, Some(outcome), false, &self.messages.empty_response, now_ms())
                });
                tracing::info!(job_id = %job.job_id, session_id = %session_id, "Generation completed");
            }
            Termination::Cancelled => {
                self.store
                    .update_session(&session_id, |s| finalize(s, job, None, true, "", now_ms()));
                tracing::info!(job_id = %job.job_id, session_id = %session_id, "Generation cancelled");
            }
            Termination::Failed(message) => {
                self.store
                    .update_session(&session_id, |s| fail(s, job, message, now_ms()));
                tracing::warn!(job_id = %job.job_id, session_id = %session_id, error = %message, "Generation failed");
            }
        }

        // The session may be gone; the job is finished either way.
        if !job.phase.is_terminal() {
            job.phase = match termination {
                Termination::Completed(_) => JobPhase::Completed,
                Termination::Failed(_) => JobPhase::Failed,
                Termination::Cancelled => JobPhase::Cancelled,
            };
        }

        self.registry.complete(job.job_id);

        if job.phase == JobPhase::Completed {
            self.notify(job);
        }
    }

    fn notify(&self, job: &JobState) {
        if !self.notify_on_completion || self.notifier.is_foreground() {
            return;
        }
        let Some(session) = self.store.get(&job.session_id) else {
            return;
        };
        let body = session
            .last_index_for(job.generation_start)
            .map(|idx| snippet(&session.entries[idx].content, NOTIFICATION_BODY_CHARS))
            .unwrap_or_default();
        self.notifier.show(&self.messages.notification_title, &body);
    }
}
