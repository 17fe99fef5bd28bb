//! Relay Core - Generation Dispatch and Stream Reconciliation
//!
//! This crate is the headless engine behind a multi-session chat client for
//! hosted generative models. It picks API keys, shapes requests, runs many
//! generations at once and folds their streamed output back into the right
//! transcript, without any UI dependency.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Host (CLI, UI)                        │
//! │        dispatch / cancel / settings            subscribe()       │
//! └───────────────┬────────────────────────────────────▲─────────────┘
//!                 │                                    │
//! ┌───────────────▼────────────────────────────────────┴─────────────┐
//! │                          RELAY CORE                              │
//! │  ┌────────────┐   ┌────────────────┐   ┌──────────────────────┐  │
//! │  │ Dispatcher │──►│ CredentialBroker│  │     SessionStore     │  │
//! │  │            │──►│ build_generation│  │ (snapshots + version)│  │
//! │  │            │   │ _config         │  └──────────▲───────────┘  │
//! │  │            │──►└────────────────┘              │              │
//! │  │            │──► JobRegistry                    │              │
//! │  │            │──► TransportAdapter ──events──► Reconciler        │
//! │  └────────────┘    (GeminiTransport)                             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Dispatcher`]: Entry point; starts, cancels and configures generations
//! - [`SessionStore`]: Shared, observable list of sessions
//! - [`CredentialBroker`]: Key rotation, locking and usage counting
//! - [`JobRegistry`]: In-flight jobs and their cancellation tokens
//! - [`Reconciler`]: Applies streamed events to transcripts
//! - [`TransportAdapter`]: Provider boundary, implemented by [`GeminiTransport`]
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{
//!     load_config, Dispatcher, EngineOptions, GeminiTransport, LogNotifier,
//!     MemorySettingsStore, SessionStore, Turn,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let transport = GeminiTransport::new(&config.base_url, config.connect_timeout)?;
//!     let dispatcher = Dispatcher::new(
//!         transport,
//!         Arc::new(SessionStore::new()),
//!         Arc::new(MemorySettingsStore::new()),
//!         Arc::new(LogNotifier),
//!         config.keys.clone(),
//!         EngineOptions::from_config(&config),
//!     );
//!
//!     if let relay_core::DispatchOutcome::Started(handle) =
//!         dispatcher.dispatch(Turn::new("Hello"), None)?
//!     {
//!         handle.wait().await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Transport boundary, request parts and the Gemini REST client
//! - [`config`]: Layered configuration (CLI > env > TOML > defaults)
//! - [`credentials`]: Key pool and rotation
//! - [`dispatcher`]: Dispatch orchestration
//! - [`generation`]: Per-model generation config
//! - [`jobs`]: Job registry
//! - [`messages`]: Identifiers and entry roles
//! - [`notify`]: Completion notification hook
//! - [`session`]: Session and transcript model
//! - [`settings_store`]: Persisted engine state
//! - [`store`]: Session store
//! - [`streaming`]: Stream reconciliation

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod generation;
pub mod jobs;
pub mod messages;
pub mod notify;
pub mod session;
pub mod settings_store;
pub mod store;
pub mod streaming;

// Re-exports for convenience
pub use backend::{
    Content, ContentPart, DefaultPartsBuilder, Fragment, GeminiTransport, GenerationRequest,
    Outcome, TransportAdapter, TransportError, TransportEvent, TurnPartsBuilder,
};
pub use credentials::{CredentialBroker, CredentialError, KeyPool, KeySelection};
pub use dispatcher::{
    DispatchError, DispatchHandle, DispatchOutcome, Dispatcher, EngineOptions, Turn,
};
pub use generation::{build_generation_config, GenerationConfig, ModelProfile};
pub use jobs::{JobHandle, JobRegistry};
pub use messages::{EntryId, EntryRole, GenerationKey, JobId, SessionId};
pub use notify::{LogNotifier, NoopNotifier, Notifier};
pub use session::{
    FileRef, FileState, MediaResolution, SafetyThreshold, Session, SessionSettings,
    ThinkingLevel, TokenUsage, TranscriptEntry,
};
pub use settings_store::{FileSettingsStore, MemorySettingsStore, SettingsStore};
pub use store::SessionStore;
pub use streaming::{JobPhase, JobState, Reconciler, Termination};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, Messages, RelayConfig, RelayToml,
};
