//! Gemini Transport
//!
//! HTTP transport for the Gemini generative language API.
//!
//! # Endpoints
//!
//! - `POST {base}/{model}:streamGenerateContent?alt=sse` - streamed generation
//! - `POST {base}/{model}:generateContent` - batched generation
//! - `POST {base}/{model}:countTokens` - token count probe
//!
//! The key travels in the `x-goog-api-key` header. Streamed responses are
//! server-sent events whose `data:` lines each carry one
//! `GenerateContentResponse` chunk; a batched response is a single chunk.

use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::parts::Content;
use super::traits::{
    Fragment, GenerationRequest, Outcome, TransportAdapter, TransportError, TransportEvent,
};
use crate::generation::{GenerationConfig, ModelProfile, ThinkingControl, ToolDeclaration, HARM_CATEGORIES};
use crate::session::TokenUsage;

/// Default API base URL
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const API_KEY_HEADER: &str = "x-goog-api-key";
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Gemini HTTP transport
#[derive(Clone)]
pub struct GeminiTransport {
    base_url: String,
    http_client: reqwest::Client,
}

impl GeminiTransport {
    /// Create a transport against `base_url`
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Base URL in use
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/{model}:{method}", self.base_url)
    }

    async fn post(
        &self,
        url: String,
        key: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, TransportError> {
        let send = self
            .http_client
            .post(url)
            .header(API_KEY_HEADER, key)
            .json(body)
            .send();

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = send => result.map_err(|e| TransportError::Network(e.to_string()))?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(map_http_error(status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl TransportAdapter for GeminiTransport {
    fn name(&self) -> &str {
        "Gemini"
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let body = request_body(&request.contents(), &request.config);
        let url = if request.stream {
            format!("{}?alt=sse", self.endpoint(&request.model, "streamGenerateContent"))
        } else {
            self.endpoint(&request.model, "generateContent")
        };

        tracing::debug!(model = %request.model, stream = request.stream, "Sending generation request");
        let response = self.post(url, &request.key, &body, &cancel).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        if request.stream {
            tokio::spawn(pump_sse(response, tx, cancel));
        } else {
            tokio::spawn(pump_batch(response, tx, cancel));
        }
        Ok(rx)
    }

    async fn count_tokens(
        &self,
        key: &str,
        model: &str,
        contents: &[Content],
        config: &GenerationConfig,
    ) -> Result<u64, TransportError> {
        let mut inner = request_body(contents, config);
        if let Some(obj) = inner.as_object_mut() {
            // countTokens rejects generation parameters
            obj.remove("generationConfig");
            obj.remove("safetySettings");
            obj.insert("model".to_string(), json!(format!("models/{model}")));
        }
        let body = json!({ "generateContentRequest": inner });

        let response = self
            .post(self.endpoint(model, "countTokens"), key, &body, &CancellationToken::new())
            .await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct CountTokensResponse {
            total_tokens: u64,
        }

        let parsed: CountTokensResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(parsed.total_tokens)
    }
}

// ============================================================================
// Response pumps
// ============================================================================

async fn pump_sse(response: reqwest::Response, tx: mpsc::Sender<TransportEvent>, cancel: CancellationToken) {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut outcome = Outcome::default();

    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Stream cancelled, dropping connection");
                return;
            }
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                buffer.extend_from_slice(&bytes);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if !forward_line(&line, &mut outcome, &tx).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                let _ = tx.send(TransportEvent::Error(format!("Stream error: {e}"))).await;
                return;
            }
            None => break,
        }
    }

    if !buffer.is_empty() && !forward_line(&buffer, &mut outcome, &tx).await {
        return;
    }
    let _ = tx.send(TransportEvent::Complete(outcome)).await;
}

/// Parse one SSE line and forward its events; false once the stream must stop
async fn forward_line(line: &[u8], outcome: &mut Outcome, tx: &mpsc::Sender<TransportEvent>) -> bool {
    let line = String::from_utf8_lossy(line);
    let Some(data) = line.trim().strip_prefix("data:") else {
        return true;
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return true;
    }

    let events = match serde_json::from_str::<Value>(data) {
        Ok(chunk) => parse_chunk(&chunk, outcome),
        Err(e) => vec![TransportEvent::Error(format!("Malformed stream chunk: {e}"))],
    };
    for event in events {
        let terminal = matches!(event, TransportEvent::Error(_));
        if tx.send(event).await.is_err() || terminal {
            return false;
        }
    }
    true
}

async fn pump_batch(response: reqwest::Response, tx: mpsc::Sender<TransportEvent>, cancel: CancellationToken) {
    let body = tokio::select! {
        () = cancel.cancelled() => return,
        body = response.json::<Value>() => body,
    };

    let chunk = match body {
        Ok(chunk) => chunk,
        Err(e) => {
            let _ = tx
                .send(TransportEvent::Error(format!("Failed to decode response: {e}")))
                .await;
            return;
        }
    };

    let mut outcome = Outcome::default();
    for event in parse_chunk(&chunk, &mut outcome) {
        let terminal = matches!(event, TransportEvent::Error(_));
        if tx.send(event).await.is_err() || terminal {
            return;
        }
    }
    let _ = tx.send(TransportEvent::Complete(outcome)).await;
}

// ============================================================================
// Wire format
// ============================================================================

/// Build the JSON body of a generation request
pub fn request_body(contents: &[Content], config: &GenerationConfig) -> Value {
    let mut body = Map::new();
    body.insert("contents".to_string(), json!(contents));

    let mut gen = Map::new();
    if let Some(t) = config.temperature {
        gen.insert("temperature".into(), json!(t));
    }
    if let Some(p) = config.top_p {
        gen.insert("topP".into(), json!(p));
    }
    if let Some(k) = config.top_k {
        gen.insert("topK".into(), json!(k));
    }
    if let Some(max) = config.max_output_tokens {
        gen.insert("maxOutputTokens".into(), json!(max));
    }
    if let Some(mime) = &config.response_mime_type {
        gen.insert("responseMimeType".into(), json!(mime));
    }
    if !config.response_modalities.is_empty() {
        let modalities: Vec<&str> = config.response_modalities.iter().map(|m| m.as_str()).collect();
        gen.insert("responseModalities".into(), json!(modalities));
    }
    if let Some(resolution) = config.media_resolution.as_wire() {
        gen.insert("mediaResolution".into(), json!(resolution));
    }
    if let Some(thinking) = config.thinking {
        let levels = matches!(config.profile, Some(ModelProfile::Reasoning { levels: true }));
        let mut tc = match thinking {
            ThinkingControl::Budget(n) => json!({ "thinkingBudget": n }),
            ThinkingControl::Level(level) if levels => json!({ "thinkingLevel": level.as_str() }),
            // Budget-only models get a dynamic budget
            ThinkingControl::Level(_) => json!({ "thinkingBudget": -1 }),
        };
        tc["includeThoughts"] = json!(config.include_thoughts);
        gen.insert("thinkingConfig".into(), tc);
    }
    if let Some(ratio) = &config.aspect_ratio {
        gen.insert("imageConfig".into(), json!({ "aspectRatio": ratio }));
    }
    if let Some(voice) = &config.voice {
        gen.insert(
            "speechConfig".into(),
            json!({ "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } } }),
        );
    }
    if !gen.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(gen));
    }

    if let Some(instruction) = &config.system_instruction {
        body.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": instruction }] }),
        );
    }

    if !config.tools.is_empty() {
        let tools: Vec<Value> = config
            .tools
            .iter()
            .map(|tool| match tool {
                ToolDeclaration::GoogleSearch => json!({ "googleSearch": {} }),
                ToolDeclaration::CodeExecution => json!({ "codeExecution": {} }),
                ToolDeclaration::UrlContext => json!({ "urlContext": {} }),
            })
            .collect();
        body.insert("tools".to_string(), json!(tools));
    }

    if let Some(threshold) = config.safety {
        let settings: Vec<Value> = HARM_CATEGORIES
            .iter()
            .map(|category| json!({ "category": category, "threshold": threshold.as_str() }))
            .collect();
        body.insert("safetySettings".to_string(), json!(settings));
    }

    Value::Object(body)
}

/// Turn one response chunk into events, folding metadata into `outcome`
pub fn parse_chunk(chunk: &Value, outcome: &mut Outcome) -> Vec<TransportEvent> {
    let mut events = Vec::new();

    if let Some(error) = chunk.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        events.push(TransportEvent::Error(message.to_string()));
        return events;
    }

    if let Some(usage) = chunk.get("usageMetadata") {
        outcome.usage = Some(parse_usage(usage));
    }

    let candidate = chunk.get("candidates").and_then(|c| c.get(0));
    let Some(candidate) = candidate else {
        if let Some(reason) = chunk
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
        {
            events.push(TransportEvent::Error(format!("Prompt blocked: {reason}")));
        }
        return events;
    };

    if let Some(grounding) = candidate.get("groundingMetadata") {
        outcome.grounding = Some(grounding.clone());
    }
    if let Some(url_context) = candidate.get("urlContextMetadata") {
        outcome.url_context = Some(url_context.clone());
    }

    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for part in parts {
        parse_part(part, &mut events);
    }
    events
}

fn parse_part(part: &Value, events: &mut Vec<TransportEvent>) {
    let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);

    if let Some(text) = part.get("text").and_then(Value::as_str) {
        if is_thought {
            events.push(TransportEvent::Thought(text.to_string()));
        } else {
            events.push(TransportEvent::Fragment(Fragment::Text(text.to_string())));
        }
    }

    if let Some(code) = part.get("executableCode") {
        events.push(TransportEvent::Fragment(Fragment::ExecutableCode {
            language: str_field(code, "language").to_ascii_lowercase(),
            code: str_field(code, "code"),
        }));
    }

    if let Some(result) = part.get("codeExecutionResult") {
        events.push(TransportEvent::Fragment(Fragment::CodeExecutionResult {
            outcome: str_field(result, "outcome"),
            output: str_field(result, "output"),
        }));
    }

    if let Some(inline) = part.get("inlineData") {
        let mime_type = str_field(inline, "mimeType");
        match BASE64_STANDARD.decode(str_field(inline, "data")) {
            Ok(data) => events.push(TransportEvent::Fragment(Fragment::InlineMedia { mime_type, data })),
            Err(e) => tracing::warn!(mime_type = %mime_type, error = %e, "Dropping undecodable inline media"),
        }
    }

    if let Some(signature) = part.get("thoughtSignature").and_then(Value::as_str) {
        events.push(TransportEvent::Fragment(Fragment::ReasoningSignature(signature.to_string())));
    }
}

fn parse_usage(usage: &Value) -> TokenUsage {
    let count = |field: &str| usage.get(field).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        prompt_tokens: count("promptTokenCount"),
        completion_tokens: count("candidatesTokenCount"),
        total_tokens: count("totalTokenCount"),
        thought_tokens: count("thoughtsTokenCount"),
        cached_tokens: count("cachedContentTokenCount"),
    }
}

fn str_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[derive(Deserialize)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
}

fn map_http_error(status: StatusCode, body: &str) -> TransportError {
    let message = serde_json::from_str::<ErrorWrapper>(body)
        .map(|wrapper| {
            let status_text = wrapper.error.status.unwrap_or_default();
            let msg = wrapper.error.message.unwrap_or_else(|| body.to_string());
            if status_text.is_empty() {
                msg
            } else {
                format!("{status_text}: {msg}")
            }
        })
        .unwrap_or_else(|_| body.to_string());

    TransportError::Http {
        status: status.as_u16(),
        message,
    }
}
