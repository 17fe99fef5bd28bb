//! Job Registry
//!
//! Tracks every in-flight generation and the cancellation handle that stops
//! it. A session is "generating" exactly while it has a registered job.
//!
//! Cancelling only fires the token. The job stays registered until its
//! reconciler settles it and calls [`JobRegistry::complete`], so a session
//! keeps reporting as generating until its transcript is final.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::messages::{GenerationKey, JobId, SessionId};

/// A registered generation job
#[derive(Clone, Debug)]
pub struct JobHandle {
    /// Job ID
    pub job_id: JobId,
    /// Session the job writes into
    pub session_id: SessionId,
    /// Correlation key of the job's entries
    pub generation_start: GenerationKey,
    /// Cancellation handle shared with the transport and reconciler
    pub cancel: CancellationToken,
    /// When the job was registered
    pub started_at: Instant,
}

impl JobHandle {
    /// Time since registration
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// In-flight generation jobs
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, JobHandle>,
}

impl JobRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job
    pub fn register(
        &self,
        job_id: JobId,
        session_id: SessionId,
        generation_start: GenerationKey,
        cancel: CancellationToken,
    ) -> JobHandle {
        let handle = JobHandle {
            job_id,
            session_id,
            generation_start,
            cancel,
            started_at: Instant::now(),
        };
        tracing::debug!(job_id = %job_id, session_id = %handle.session_id, "Job registered");
        self.jobs.insert(job_id, handle.clone());
        handle
    }

    /// Cancel a job; returns false if it is not registered or already cancelled
    ///
    /// Fires the cancellation token. Calling it again, or after the job
    /// completed, does nothing.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let Some((token, session_id)) = self
            .jobs
            .get(&job_id)
            .map(|h| (h.cancel.clone(), h.session_id.clone()))
        else {
            return false;
        };
        if token.is_cancelled() {
            return false;
        }
        token.cancel();
        tracing::info!(job_id = %job_id, session_id = %session_id, "Job cancelled");
        true
    }

    /// Cancel every job of a session; returns how many were cancelled
    pub fn cancel_session(&self, session_id: &SessionId) -> usize {
        self.jobs_for_session(session_id)
            .into_iter()
            .filter(|job_id| self.cancel(*job_id))
            .count()
    }

    /// Remove a finished job; returns false if it was already removed
    pub fn complete(&self, job_id: JobId) -> bool {
        let removed = self.jobs.remove(&job_id).is_some();
        if removed {
            tracing::debug!(job_id = %job_id, "Job completed");
        }
        removed
    }

    /// Whether a session has a job in flight
    #[must_use]
    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.jobs.iter().any(|j| &j.session_id == session_id)
    }

    /// Whether a specific job is registered
    #[must_use]
    pub fn contains(&self, job_id: JobId) -> bool {
        self.jobs.contains_key(&job_id)
    }

    /// Jobs of a session
    #[must_use]
    pub fn jobs_for_session(&self, session_id: &SessionId) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|j| &j.session_id == session_id)
            .map(|j| j.job_id)
            .collect()
    }

    /// Number of jobs in flight
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &JobRegistry, session: &SessionId) -> (JobId, CancellationToken) {
        let job_id = JobId::new();
        let token = CancellationToken::new();
        registry.register(job_id, session.clone(), GenerationKey::next(), token.clone());
        (job_id, token)
    }

    #[test]
    fn test_register_marks_session_active() {
        let registry = JobRegistry::new();
        let session = SessionId::new();
        assert!(!registry.is_active(&session));

        let (job_id, _) = register(&registry, &session);
        assert!(registry.is_active(&session));
        assert!(registry.contains(job_id));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let registry = JobRegistry::new();
        let session = SessionId::new();
        let (job_id, token) = register(&registry, &session);

        assert!(registry.cancel(job_id));
        assert!(token.is_cancelled());
        assert!(!registry.cancel(job_id));
        assert!(registry.complete(job_id));
        assert!(!registry.complete(job_id));
        assert!(!registry.cancel(job_id));
    }

    #[test]
    fn test_cancelled_job_stays_active_until_complete() {
        let registry = JobRegistry::new();
        let session = SessionId::new();
        let (job_id, _) = register(&registry, &session);

        registry.cancel(job_id);
        assert!(registry.is_active(&session));
        assert!(registry.contains(job_id));
        assert_eq!(registry.cancel_session(&session), 0);

        registry.complete(job_id);
        assert!(!registry.is_active(&session));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_complete_does_not_cancel() {
        let registry = JobRegistry::new();
        let session = SessionId::new();
        let (job_id, token) = register(&registry, &session);

        assert!(registry.complete(job_id));
        assert!(!token.is_cancelled());
        assert!(!registry.cancel(job_id));
    }

    #[test]
    fn test_cancel_session_leaves_others() {
        let registry = JobRegistry::new();
        let a = SessionId::new();
        let b = SessionId::new();
        let (_, token_a) = register(&registry, &a);
        let (_, token_b) = register(&registry, &b);

        assert_eq!(registry.cancel_session(&a), 1);
        assert!(token_a.is_cancelled());
        assert!(!token_b.is_cancelled());
        assert!(registry.is_active(&b));
    }
}
