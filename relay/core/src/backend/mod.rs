//! Generation Service Transports
//!
//! Abstracted access to the remote generation service through a common
//! trait, plus the request content types shared by every transport.
//!
//! # Available Transports
//!
//! - **Gemini**: generative language REST API (default)
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{GeminiTransport, TransportAdapter, DEFAULT_BASE_URL};
//!
//! let transport = GeminiTransport::new(DEFAULT_BASE_URL, Duration::from_secs(10))?;
//! let rx = transport.generate(request, CancellationToken::new()).await?;
//! ```

mod gemini;
mod parts;
mod traits;

pub use gemini::{parse_chunk, request_body, GeminiTransport, DEFAULT_BASE_URL};
pub use parts::{
    build_history, encode_inline, Content, ContentPart, DefaultPartsBuilder, FileData, InlineData,
    TurnPartsBuilder,
};
pub use traits::{
    Fragment, GenerationRequest, Outcome, TransportAdapter, TransportError, TransportEvent,
};
