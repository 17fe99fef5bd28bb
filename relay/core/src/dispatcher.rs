//! Dispatch Orchestrator
//!
//! Entry point of the engine. Validates a user turn, picks a key, builds the
//! request, appends the turn and a loading placeholder to the session in one
//! store update, registers the job and spawns its transport call and
//! reconciler.
//!
//! # Dispatch Steps
//!
//! ```text
//! dispatch(turn, target)
//!   1. validate turn ─────────────► EmptyTurn / FilesNotReady (nothing registered)
//!   2. acquire key ───────────────► no keys: user entry + error entry, KeysMissing
//!   3. lock key if it hosts files
//!   4. history + turn parts + config
//!   5. one store update: [user entry, loading entry]
//!   6. register job, spawn transport + reconciler
//! ```
//!
//! The dispatcher never awaits the generation itself; callers observe
//! progress through [`SessionStore::subscribe`] or wait on the returned
//! [`DispatchHandle`].

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    build_history, Content, DefaultPartsBuilder, GenerationRequest, TransportAdapter,
    TransportError, TurnPartsBuilder,
};
use crate::config::{Messages, RelayConfig};
use crate::credentials::{CredentialBroker, CredentialError, KeyPool};
use crate::generation::{build_generation_config, ModelProfile};
use crate::jobs::JobRegistry;
use crate::messages::{GenerationKey, JobId, SessionId};
use crate::notify::Notifier;
use crate::session::{FileRef, Session, SessionSettings, TranscriptEntry};
use crate::settings_store::{locked_key_slot, SettingsStore};
use crate::store::SessionStore;
use crate::streaming::{JobPhase, JobState, Reconciler, Termination};

// ============================================================================
// Types
// ============================================================================

/// Engine-wide options
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Stream responses incrementally
    pub stream: bool,
    /// Notify when a background generation completes
    pub notify_on_completion: bool,
    /// User-visible strings
    pub messages: Messages,
    /// Settings for sessions created by the dispatcher
    pub session_defaults: SessionSettings,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            stream: true,
            notify_on_completion: true,
            messages: Messages::default(),
            session_defaults: SessionSettings::default(),
        }
    }
}

impl EngineOptions {
    /// Options derived from loaded configuration
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            stream: config.stream,
            notify_on_completion: config.notify_on_completion,
            messages: config.messages.clone(),
            session_defaults: config.session_defaults(),
        }
    }
}

/// A user turn to dispatch
#[derive(Clone, Debug, Default)]
pub struct Turn {
    /// Typed text
    pub text: String,
    /// Attached files
    pub files: Vec<FileRef>,
}

impl Turn {
    /// A text-only turn
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            files: Vec::new(),
        }
    }

    /// Builder: attach a file
    #[must_use]
    pub fn with_file(mut self, file: FileRef) -> Self {
        self.files.push(file);
        self
    }
}

/// Errors returned by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Nothing to send
    #[error("turn has no content")]
    EmptyTurn,
    /// Some attached files are not ready yet
    #[error("files not ready: {}", files.join(", "))]
    FilesNotReady {
        /// Names of the files still uploading, processing or failed
        files: Vec<String>,
    },
    /// The target session does not exist
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    /// Key selection failed (token count probe only)
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// Transport failed (token count probe only)
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A started generation
#[derive(Debug)]
pub struct DispatchHandle {
    /// Session the job writes into
    pub session_id: SessionId,
    /// Job ID
    pub job_id: JobId,
    /// Correlation key of the job's entries
    pub generation_start: GenerationKey,
    task: JoinHandle<JobPhase>,
}

impl DispatchHandle {
    /// Wait for the job to settle
    pub async fn wait(self) -> JobPhase {
        match self.task.await {
            Ok(phase) => phase,
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Generation task panicked");
                JobPhase::Failed
            }
        }
    }
}

/// Result of a dispatch that passed validation
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A job was started
    Started(DispatchHandle),
    /// No keys are configured; an error entry was recorded instead
    KeysMissing {
        /// Session holding the turn and the error entry
        session_id: SessionId,
    },
}

impl DispatchOutcome {
    /// Session the turn was recorded in
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Started(handle) => &handle.session_id,
            Self::KeysMissing { session_id } => session_id,
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Orchestrates generation jobs over a transport
pub struct Dispatcher<T: TransportAdapter> {
    transport: Arc<T>,
    store: Arc<SessionStore>,
    registry: Arc<JobRegistry>,
    broker: Arc<CredentialBroker>,
    settings: Arc<dyn SettingsStore>,
    parts: Arc<dyn TurnPartsBuilder>,
    reconciler: Arc<Reconciler>,
    keys: RwLock<KeyPool>,
    options: EngineOptions,
}

impl<T: TransportAdapter + 'static> Dispatcher<T> {
    /// Create a dispatcher
    pub fn new(
        transport: T,
        store: Arc<SessionStore>,
        settings: Arc<dyn SettingsStore>,
        notifier: Arc<dyn Notifier>,
        keys: KeyPool,
        options: EngineOptions,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let broker = Arc::new(CredentialBroker::from_settings(Arc::clone(&settings)));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            notifier,
            options.messages.clone(),
            options.notify_on_completion,
        ));

        Self {
            transport: Arc::new(transport),
            store,
            registry,
            broker,
            settings,
            parts: Arc::new(DefaultPartsBuilder),
            reconciler,
            keys: RwLock::new(keys),
            options,
        }
    }

    /// Builder: replace the turn parts collaborator
    #[must_use]
    pub fn with_parts_builder(mut self, parts: Arc<dyn TurnPartsBuilder>) -> Self {
        self.parts = parts;
        self
    }

    /// Transport in use
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Session store
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Job registry
    #[must_use]
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Credential broker
    #[must_use]
    pub fn broker(&self) -> &Arc<CredentialBroker> {
        &self.broker
    }

    /// Engine options
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Current key pool
    #[must_use]
    pub fn keys(&self) -> KeyPool {
        self.keys.read().clone()
    }

    /// Replace the key pool
    pub fn set_keys(&self, keys: KeyPool) {
        tracing::info!(count = keys.len(), "Key pool updated");
        *self.keys.write() = keys;
    }

    /// Create an empty session with the default settings
    pub fn new_session(&self) -> SessionId {
        let session = Session::new(self.options.session_defaults.clone());
        let id = session.id.clone();
        self.store.insert(session);
        id
    }

    /// Dispatch a user turn to `target`, or to a new session
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::EmptyTurn`] or [`DispatchError::FilesNotReady`]
    /// for invalid turns, and [`DispatchError::SessionNotFound`] for an unknown
    /// target. Nothing is recorded or registered in those cases.
    pub fn dispatch(&self, turn: Turn, target: Option<&SessionId>) -> Result<DispatchOutcome, DispatchError> {
        let existing = match target {
            Some(id) => Some(
                self.store
                    .get(id)
                    .ok_or_else(|| DispatchError::SessionNotFound(id.clone()))?,
            ),
            None => None,
        };
        let mut settings = self.resolve_settings(existing.as_deref());
        let model = settings.model_id.clone();

        validate_turn(&turn, ModelProfile::for_model(&model))?;

        let session_id = existing
            .as_ref()
            .map_or_else(SessionId::new, |s| s.id.clone());

        let selection = match self
            .broker
            .acquire(&self.keys.read(), settings.locked_key.as_deref(), false)
        {
            Ok(selection) => selection,
            Err(CredentialError::NoKeysConfigured) => {
                tracing::warn!(session_id = %session_id, "Dispatch without configured keys");
                self.record_missing_keys(&session_id, settings, turn);
                return Ok(DispatchOutcome::KeysMissing { session_id });
            }
        };

        let lock = selection.is_newly_selected && turn.files.iter().any(|f| f.remote_uri.is_some());
        if lock {
            settings.locked_key = Some(selection.key.clone());
            if let Err(e) = self.settings.put(
                &locked_key_slot(&session_id),
                serde_json::Value::from(selection.key.clone()),
            ) {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to persist locked key");
            }
        }

        let history = existing
            .as_ref()
            .map(|s| build_history(&s.entries, self.parts.as_ref(), &model))
            .unwrap_or_default();
        let parts = self
            .parts
            .build_turn_parts(&turn.text, &turn.files, &model, settings.media_resolution);
        let request = GenerationRequest {
            key: selection.key,
            model: model.clone(),
            history,
            turn: Content::user(parts),
            config: build_generation_config(&model, &settings),
            stream: self.options.stream,
        };

        let key = GenerationKey::next();
        let locked_key = settings.locked_key.clone();
        self.store.update(|sessions| {
            let session = upsert(sessions, &session_id, settings);
            if locked_key.is_some() {
                session.settings.locked_key = locked_key;
            }
            session.push_user(TranscriptEntry::user(turn.text, turn.files));
            session.entries.push(TranscriptEntry::loading(key));
        });

        let job_id = JobId::new();
        let cancel = CancellationToken::new();
        self.registry
            .register(job_id, session_id.clone(), key, cancel.clone());
        let job = JobState::new(job_id, session_id.clone(), key);

        tracing::info!(
            job_id = %job_id,
            session_id = %session_id,
            model = %model,
            transport = self.transport.name(),
            "Dispatching generation"
        );

        let transport = Arc::clone(&self.transport);
        let reconciler = Arc::clone(&self.reconciler);
        let task = tokio::spawn(async move {
            let started = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(TransportError::Cancelled),
                result = transport.generate(request, cancel.clone()) => result,
            };

            let mut job = job;
            match started {
                Ok(events) => reconciler.run(job, events, cancel).await,
                Err(e) => {
                    let termination = if cancel.is_cancelled() || e == TransportError::Cancelled {
                        Termination::Cancelled
                    } else {
                        Termination::Failed(e.to_string())
                    };
                    reconciler.settle(&mut job, termination);
                    job.phase
                }
            }
        });

        Ok(DispatchOutcome::Started(DispatchHandle {
            session_id,
            job_id,
            generation_start: key,
            task,
        }))
    }

    /// Cancel every job of a session; returns how many were cancelled
    pub fn cancel(&self, session_id: &SessionId) -> usize {
        self.registry.cancel_session(session_id)
    }

    /// Cancel one job
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        self.registry.cancel(job_id)
    }

    /// Whether a session has a job in flight
    #[must_use]
    pub fn is_generating(&self, session_id: &SessionId) -> bool {
        self.registry.is_active(session_id)
    }

    /// Change a session's settings
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::SessionNotFound`] for an unknown session.
    pub fn update_settings(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut SessionSettings),
    ) -> Result<(), DispatchError> {
        self.store
            .update_session(session_id, |s| f(&mut s.settings))
            .ok_or_else(|| DispatchError::SessionNotFound(session_id.clone()))
    }

    /// Switch a session to another model, cancelling its running job first
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::SessionNotFound`] for an unknown session.
    pub fn switch_model(&self, session_id: &SessionId, model_id: &str) -> Result<usize, DispatchError> {
        if !self.store.contains(session_id) {
            return Err(DispatchError::SessionNotFound(session_id.clone()));
        }
        let cancelled = self.cancel(session_id);
        self.update_settings(session_id, |s| s.model_id = model_id.to_string())?;
        tracing::info!(session_id = %session_id, model = model_id, cancelled, "Model switched");
        Ok(cancelled)
    }

    /// Count the tokens a turn would consume, without advancing key rotation
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Credential`] with an empty pool and
    /// [`DispatchError::Transport`] when the probe fails.
    pub async fn count_tokens(&self, session_id: Option<&SessionId>, text: &str) -> Result<u64, DispatchError> {
        let existing = match session_id {
            Some(id) => Some(
                self.store
                    .get(id)
                    .ok_or_else(|| DispatchError::SessionNotFound(id.clone()))?,
            ),
            None => None,
        };
        let settings = self.resolve_settings(existing.as_deref());
        let model = settings.model_id.clone();

        let selection = self
            .broker
            .acquire(&self.keys.read(), settings.locked_key.as_deref(), true)?;

        let mut contents = existing
            .as_ref()
            .map(|s| build_history(&s.entries, self.parts.as_ref(), &model))
            .unwrap_or_default();
        let parts = self
            .parts
            .build_turn_parts(text, &[], &model, settings.media_resolution);
        if !parts.is_empty() {
            contents.push(Content::user(parts));
        }

        let config = build_generation_config(&model, &settings);
        let count = self
            .transport
            .count_tokens(&selection.key, &model, &contents, &config)
            .await?;
        tracing::debug!(model = %model, count, "Counted tokens");
        Ok(count)
    }

    /// Insert a session loaded by the host, restoring its persisted key lock
    pub fn load_session(&self, mut session: Session) -> SessionId {
        if session.settings.locked_key.is_none() {
            session.settings.locked_key = self.persisted_lock(&session.id);
        }
        let id = session.id.clone();
        self.store.insert(session);
        id
    }

    /// Settings of `existing`, or the defaults, with the persisted lock filled in
    fn resolve_settings(&self, existing: Option<&Session>) -> SessionSettings {
        match existing {
            Some(session) => {
                let mut settings = session.settings.clone();
                if settings.locked_key.is_none() {
                    settings.locked_key = self.persisted_lock(&session.id);
                }
                settings
            }
            None => self.options.session_defaults.clone(),
        }
    }

    fn persisted_lock(&self, session_id: &SessionId) -> Option<String> {
        self.settings
            .get(&locked_key_slot(session_id))
            .and_then(|v| v.as_str().map(str::to_string))
    }

    fn record_missing_keys(&self, session_id: &SessionId, settings: SessionSettings, turn: Turn) {
        let message = self.options.messages.keys_not_configured.clone();
        self.store.update(|sessions| {
            let session = upsert(sessions, session_id, settings);
            session.push_user(TranscriptEntry::user(turn.text, turn.files));
            session.entries.push(TranscriptEntry::error(message, None));
        });
    }
}

fn validate_turn(turn: &Turn, profile: ModelProfile) -> Result<(), DispatchError> {
    let has_text = !turn.text.trim().is_empty();
    let has_files = !turn.files.is_empty();
    if !has_text && !(has_files && profile.allows_media_only_turn()) {
        return Err(DispatchError::EmptyTurn);
    }

    let not_ready: Vec<String> = turn
        .files
        .iter()
        .filter(|f| !f.state.is_ready())
        .map(|f| f.name.clone())
        .collect();
    if !not_ready.is_empty() {
        return Err(DispatchError::FilesNotReady { files: not_ready });
    }
    Ok(())
}

/// Find a session by ID, creating it when it does not exist
fn upsert<'a>(sessions: &'a mut Vec<Arc<Session>>, id: &SessionId, settings: SessionSettings) -> &'a mut Session {
    let idx = match sessions.iter().position(|s| &s.id == id) {
        Some(idx) => idx,
        None => {
            sessions.push(Arc::new(Session::with_id(id.clone(), settings)));
            sessions.len() - 1
        }
    };
    Arc::make_mut(&mut sessions[idx])
}
