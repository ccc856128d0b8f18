//! Upstream completion executors.
//!
//! An executor performs exactly one call against an OpenAI-compatible
//! chat-completions endpoint, either blocking or streaming, and normalizes
//! the result. It never retries.

pub mod mock;
pub mod openai;

pub use mock::MockExecutor;
pub use openai::OpenAiExecutor;

use crate::error::GatewayError;
use crate::models::{ChatMessage, Credential, TokenUsage};
use async_trait::async_trait;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;

/// Parameters of a single upstream call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    /// Overrides the executor's default timeout.
    pub timeout: Option<Duration>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            timeout: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Normalized result of a blocking call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub images: Vec<String>,
    pub usage: TokenUsage,
}

/// Stream chunk for streaming responses.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Content delta, in upstream order.
    Text(String),

    /// Generated images (URLs or data URIs).
    Images(Vec<String>),

    /// Terminal chunk, sent after the `[DONE]` sentinel.
    Complete { usage: TokenUsage },
}

/// Raw upstream reply to a pass-through call, status and body untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Forwarded {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Read from a JSON body's `usage`; zero otherwise.
    pub usage: TokenUsage,
}

/// Type alias for executor streams.
pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<StreamChunk, GatewayError>> + Send>>;

#[async_trait]
pub trait CompletionExecutor: Send + Sync {
    async fn complete(
        &self,
        credential: &Credential,
        request: &CompletionRequest,
    ) -> Result<Completion, GatewayError>;

    /// Fails before yielding anything when the upstream rejects the call.
    /// A stream that ends without the sentinel yields a transport error.
    async fn stream(
        &self,
        credential: &Credential,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, GatewayError>;

    /// Send an arbitrary chat-completions body as-is. Any HTTP status is a
    /// successful forward; only transport failures are errors.
    async fn forward(
        &self,
        credential: &Credential,
        body: &serde_json::Value,
    ) -> Result<Forwarded, GatewayError>;
}
