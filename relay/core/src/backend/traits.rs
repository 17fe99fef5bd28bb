//! Transport Traits
//!
//! The contract between the engine and whatever carries a request to the
//! generation service.
//!
//! # Design Philosophy
//!
//! A transport turns one [`GenerationRequest`] into an ordered stream of
//! [`TransportEvent`]s on an `mpsc` channel. Streaming and batched responses
//! look the same to the engine: a batched response is simply a stream that
//! delivers all of its fragments at once. Every stream ends with exactly one
//! `Complete` or `Error` event, or the channel closes early, which the
//! reconciler treats as a failure.
//!
//! Implementations handle wire details (URLs, auth headers, SSE framing).

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::parts::Content;
use crate::generation::GenerationConfig;
use crate::session::TokenUsage;

/// One reconcilable unit of model output
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fragment {
    /// Visible text
    Text(String),
    /// Code the model asked to run
    ExecutableCode {
        /// Programming language
        language: String,
        /// Source code
        code: String,
    },
    /// Result of running code
    CodeExecutionResult {
        /// Outcome label (e.g. `OUTCOME_OK`)
        outcome: String,
        /// Captured output
        output: String,
    },
    /// Generated media
    InlineMedia {
        /// MIME type
        mime_type: String,
        /// Raw bytes
        data: Vec<u8>,
    },
    /// Opaque reasoning signature to replay with history
    ReasoningSignature(String),
}

/// Terminal metadata of a successful generation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outcome {
    /// Token accounting
    pub usage: Option<TokenUsage>,
    /// Search grounding metadata
    pub grounding: Option<serde_json::Value>,
    /// URL context metadata
    pub url_context: Option<serde_json::Value>,
}

/// Events a transport emits for one request
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Model output
    Fragment(Fragment),
    /// Reasoning text
    Thought(String),
    /// Generation finished successfully
    Complete(Outcome),
    /// Generation failed; the message is shown to the user
    Error(String),
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The service answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code
        status: u16,
        /// Provider message
        message: String,
    },
    /// The request never reached the service
    #[error("network error: {0}")]
    Network(String),
    /// The response could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),
    /// The request was cancelled before it was sent
    #[error("request cancelled")]
    Cancelled,
}

/// Everything a transport needs for one generation
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    /// API key
    pub key: String,
    /// Model identifier
    pub model: String,
    /// Prior turns
    pub history: Vec<Content>,
    /// The new user turn
    pub turn: Content,
    /// Request configuration
    pub config: GenerationConfig,
    /// Stream the response incrementally
    pub stream: bool,
}

impl GenerationRequest {
    /// History followed by the new turn
    #[must_use]
    pub fn contents(&self) -> Vec<Content> {
        let mut contents = self.history.clone();
        contents.push(self.turn.clone());
        contents
    }
}

/// Carries requests to a generation service
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &str;

    /// Start a generation
    ///
    /// Returns once the request is accepted; events follow on the channel.
    /// Implementations must stop producing events once `cancel` fires.
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Count the tokens `contents` would consume
    async fn count_tokens(
        &self,
        key: &str,
        model: &str,
        contents: &[Content],
        config: &GenerationConfig,
    ) -> Result<u64, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::parts::ContentPart;

    #[test]
    fn test_contents_appends_turn() {
        let request = GenerationRequest {
            key: "k".into(),
            model: "m".into(),
            history: vec![Content::user(vec![ContentPart::text("a")])],
            turn: Content::user(vec![ContentPart::text("b")]),
            config: crate::generation::build_generation_config("m", &Default::default()),
            stream: true,
        };
        let contents = request.contents();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[1], request.turn);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Http {
            status: 429,
            message: "RESOURCE_EXHAUSTED: quota".into(),
        };
        assert_eq!(err.to_string(), "HTTP 429: RESOURCE_EXHAUSTED: quota");
    }
}
