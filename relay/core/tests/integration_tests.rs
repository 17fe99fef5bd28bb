//! Integration tests for dispatch and stream reconciliation
//!
//! These tests drive the public engine API end to end against a scripted
//! transport:
//! - A turn streamed to completion with token accounting
//! - Dispatch with no keys configured
//! - Cancellation isolated to one session
//! - Two concurrent jobs writing into the same session
//! - Key rotation across dispatches and across restarts

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use relay_core::backend::{Content, Fragment, GenerationRequest, Outcome, TransportEvent};
use relay_core::{
    DispatchHandle, DispatchOutcome, Dispatcher, EngineOptions, EntryRole, FileSettingsStore,
    GenerationConfig, JobPhase, KeyPool, MemorySettingsStore, Messages, NoopNotifier,
    SessionStore, SettingsStore, TokenUsage, TransportAdapter, TransportError, Turn,
};

// =============================================================================
// Scripted Transport
// =============================================================================

/// What the transport does for one `generate` call
enum Script {
    /// Send the events immediately
    Events(Vec<TransportEvent>),
    /// Send the events once the gate opens
    Gated(Vec<TransportEvent>, Arc<Notify>),
    /// Keep the stream open until cancelled
    Hold,
    /// Fail before streaming
    Reject(TransportError),
}

/// Plays back one script per call, in order
#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    keys: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            keys: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl TransportAdapter for ScriptedTransport {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.keys.lock().push(request.key.clone());
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Script::Events(reply("ok", None)));

        let (tx, rx) = mpsc::channel(16);
        match script {
            Script::Reject(e) => return Err(e),
            Script::Events(events) => {
                tokio::spawn(async move {
                    for event in events {
                        let _ = tx.send(event).await;
                    }
                });
            }
            Script::Gated(events, gate) => {
                tokio::spawn(async move {
                    gate.notified().await;
                    for event in events {
                        let _ = tx.send(event).await;
                    }
                });
            }
            Script::Hold => {
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    let _ = tx.send(TransportEvent::Error("aborted".into())).await;
                });
            }
        }
        Ok(rx)
    }

    async fn count_tokens(
        &self,
        _key: &str,
        _model: &str,
        contents: &[Content],
        _config: &GenerationConfig,
    ) -> Result<u64, TransportError> {
        Ok(contents.len() as u64)
    }
}

fn usage(prompt: u64, completion: u64) -> TokenUsage {
    TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
        ..Default::default()
    }
}

fn reply(text: &str, usage: Option<TokenUsage>) -> Vec<TransportEvent> {
    vec![
        TransportEvent::Fragment(Fragment::Text(text.to_string())),
        TransportEvent::Complete(Outcome {
            usage,
            ..Default::default()
        }),
    ]
}

fn engine(keys: &str, scripts: Vec<Script>) -> Dispatcher<ScriptedTransport> {
    engine_with_settings(keys, scripts, Arc::new(MemorySettingsStore::new()))
}

fn engine_with_settings(
    keys: &str,
    scripts: Vec<Script>,
    settings: Arc<dyn SettingsStore>,
) -> Dispatcher<ScriptedTransport> {
    Dispatcher::new(
        ScriptedTransport::new(scripts),
        Arc::new(SessionStore::new()),
        settings,
        Arc::new(NoopNotifier),
        KeyPool::parse(keys),
        EngineOptions::default(),
    )
}

fn started(outcome: DispatchOutcome) -> DispatchHandle {
    match outcome {
        DispatchOutcome::Started(handle) => handle,
        DispatchOutcome::KeysMissing { .. } => panic!("expected a started job"),
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_hello_streams_to_completion() {
    let d = engine("k1", vec![Script::Events(reply("Hi!", Some(usage(3, 2))))]);

    let handle = started(d.dispatch(Turn::new("Hello"), None).unwrap());
    let session_id = handle.session_id.clone();
    assert!(d.is_generating(&session_id));
    assert_eq!(handle.wait().await, JobPhase::Completed);

    let session = d.store().get(&session_id).unwrap();
    assert_eq!(session.entries.len(), 2);
    let model = &session.entries[1];
    assert_eq!(model.role, EntryRole::Model);
    assert_eq!(model.content, "Hi!");
    assert!(!model.is_loading);
    assert_eq!(model.usage.map(|u| u.total_tokens), Some(5));
    assert_eq!(model.cumulative_total_tokens, Some(5));
    assert!(model.generation_end_ms.is_some());
    assert!(!d.is_generating(&session_id));
}

#[tokio::test]
async fn test_cumulative_tokens_across_turns() {
    let d = engine(
        "k1",
        vec![
            Script::Events(reply("one", Some(usage(3, 2)))),
            Script::Events(reply("two", Some(usage(5, 2)))),
        ],
    );

    let first = started(d.dispatch(Turn::new("first"), None).unwrap());
    let session_id = first.session_id.clone();
    first.wait().await;
    started(d.dispatch(Turn::new("second"), Some(&session_id)).unwrap())
        .wait()
        .await;

    let session = d.store().get(&session_id).unwrap();
    let cumulative: Vec<Option<u64>> = session
        .entries
        .iter()
        .filter(|e| e.role == EntryRole::Model)
        .map(|e| e.cumulative_total_tokens)
        .collect();
    assert_eq!(cumulative, vec![Some(5), Some(12)]);
}

#[tokio::test]
async fn test_empty_pool_records_single_error() {
    let d = engine("", vec![]);

    let outcome = d.dispatch(Turn::new("Hello"), None).unwrap();
    let session = d.store().get(outcome.session_id()).unwrap();

    let errors = session
        .entries
        .iter()
        .filter(|e| e.role == EntryRole::Error)
        .count();
    assert_eq!(errors, 1);
    assert!(!session.has_loading());
    assert_eq!(d.registry().active_count(), 0);
    assert_eq!(
        session.entries.last().unwrap().content,
        Messages::default().keys_not_configured
    );
}

#[tokio::test]
async fn test_cancel_is_isolated_per_session() {
    let gate = Arc::new(Notify::new());
    let d = engine(
        "k1",
        vec![
            Script::Hold,
            Script::Gated(reply("B done", None), Arc::clone(&gate)),
        ],
    );

    let a = started(d.dispatch(Turn::new("A"), None).unwrap());
    let b = started(d.dispatch(Turn::new("B"), None).unwrap());
    let (a_id, b_id) = (a.session_id.clone(), b.session_id.clone());

    assert_eq!(d.cancel(&a_id), 1);
    assert!(d.is_generating(&b_id));
    gate.notify_one();

    assert_eq!(a.wait().await, JobPhase::Cancelled);
    assert_eq!(b.wait().await, JobPhase::Completed);

    let a_session = d.store().get(&a_id).unwrap();
    assert!(!a_session.has_loading());
    assert!(a_session.entries.iter().all(|e| e.role != EntryRole::Error));

    let b_session = d.store().get(&b_id).unwrap();
    assert_eq!(b_session.entries[1].content, "B done");
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let d = engine("k1", vec![Script::Hold]);
    let handle = started(d.dispatch(Turn::new("wait"), None).unwrap());
    let session_id = handle.session_id.clone();
    let job_id = handle.job_id;

    assert_eq!(d.cancel(&session_id), 1);
    assert_eq!(d.cancel(&session_id), 0);
    assert!(!d.cancel_job(job_id));
    // still generating until the reconciler closes the transcript
    assert!(d.is_generating(&session_id));
    assert_eq!(handle.wait().await, JobPhase::Cancelled);
    assert!(!d.is_generating(&session_id));
    assert!(!d.store().get(&session_id).unwrap().has_loading());

    // cancelling a settled job changes nothing
    let before = d.store().get(&session_id).unwrap();
    assert_eq!(d.cancel(&session_id), 0);
    assert_eq!(d.store().get(&session_id).unwrap(), before);
}

#[tokio::test]
async fn test_concurrent_jobs_in_one_session() {
    let first_gate = Arc::new(Notify::new());
    let second_gate = Arc::new(Notify::new());
    let d = engine(
        "k1",
        vec![
            Script::Gated(reply("first answer", None), Arc::clone(&first_gate)),
            Script::Gated(reply("second answer", None), Arc::clone(&second_gate)),
        ],
    );

    let session_id = d.new_session();
    let first = started(d.dispatch(Turn::new("q1"), Some(&session_id)).unwrap());
    let second = started(d.dispatch(Turn::new("q2"), Some(&session_id)).unwrap());
    let (k1, k2) = (first.generation_start, second.generation_start);
    assert!(k2 > k1);

    // finish in reverse order
    second_gate.notify_one();
    assert_eq!(second.wait().await, JobPhase::Completed);
    first_gate.notify_one();
    assert_eq!(first.wait().await, JobPhase::Completed);

    let session = d.store().get(&session_id).unwrap();
    let first_entry = &session.entries[session.last_index_for(k1).unwrap()];
    let second_entry = &session.entries[session.last_index_for(k2).unwrap()];
    assert_eq!(first_entry.content, "first answer");
    assert_eq!(second_entry.content, "second answer");
    assert!(!session.has_loading());
}

#[tokio::test]
async fn test_transport_rejection_becomes_error_entry() {
    let d = engine(
        "k1",
        vec![Script::Reject(TransportError::Http {
            status: 429,
            message: "Resource exhausted".into(),
        })],
    );

    let handle = started(d.dispatch(Turn::new("Hello"), None).unwrap());
    let session_id = handle.session_id.clone();
    assert_eq!(handle.wait().await, JobPhase::Failed);

    let session = d.store().get(&session_id).unwrap();
    let last = session.entries.last().unwrap();
    assert_eq!(last.role, EntryRole::Error);
    assert!(last.content.contains("Resource exhausted"));
    assert!(!session.has_loading());
    assert!(!d.is_generating(&session_id));
}

#[tokio::test]
async fn test_rotation_is_fair() {
    let d = engine("k1,k2,k3", vec![]);

    for _ in 0..6 {
        started(d.dispatch(Turn::new("hi"), None).unwrap()).wait().await;
    }

    let keys = d.transport_keys();
    assert_eq!(keys, vec!["k1", "k2", "k3", "k1", "k2", "k3"]);
    for key in ["k1", "k2", "k3"] {
        assert_eq!(d.broker().usage(key), 2);
    }
}

#[tokio::test]
async fn test_rotation_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    {
        let settings = Arc::new(FileSettingsStore::open(&path).unwrap());
        let d = engine_with_settings("k1,k2", vec![], settings);
        started(d.dispatch(Turn::new("one"), None).unwrap()).wait().await;
        assert_eq!(d.transport_keys(), vec!["k1"]);
    }

    let settings = Arc::new(FileSettingsStore::open(&path).unwrap());
    let d = engine_with_settings("k1,k2", vec![], settings);
    started(d.dispatch(Turn::new("two"), None).unwrap()).wait().await;
    assert_eq!(d.transport_keys(), vec!["k2"]);
}

#[tokio::test]
async fn test_store_notifies_subscribers() {
    let d = engine("k1", vec![Script::Events(reply("done", None))]);
    let mut rx = d.store().subscribe();
    let before = *rx.borrow_and_update();

    started(d.dispatch(Turn::new("Hello"), None).unwrap()).wait().await;

    assert!(rx.has_changed().unwrap());
    assert!(*rx.borrow_and_update() > before);
}

#[tokio::test]
async fn test_no_loading_entries_after_settlement() {
    let d = engine(
        "k1",
        vec![
            Script::Events(reply("fine", None)),
            Script::Events(vec![TransportEvent::Error("boom".into())]),
            Script::Events(vec![TransportEvent::Complete(Outcome::default())]),
            Script::Hold,
        ],
    );
    let session_id = d.new_session();

    for text in ["a", "b", "c"] {
        started(d.dispatch(Turn::new(text), Some(&session_id)).unwrap())
            .wait()
            .await;
    }
    let held = started(d.dispatch(Turn::new("d"), Some(&session_id)).unwrap());
    d.cancel(&session_id);
    held.wait().await;

    let session = d.store().get(&session_id).unwrap();
    assert!(!session.has_loading());
    assert_eq!(d.registry().active_count(), 0);
    // empty completion turns into the configured message
    assert!(session
        .entries
        .iter()
        .any(|e| e.content == Messages::default().empty_response));
}

/// Keys seen by the scripted transport
trait TransportKeys {
    fn transport_keys(&self) -> Vec<String>;
}

impl TransportKeys for Dispatcher<ScriptedTransport> {
    fn transport_keys(&self) -> Vec<String> {
        self.transport().keys.lock().clone()
    }
}
