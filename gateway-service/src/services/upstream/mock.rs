//! Scripted executor for tests and local runs without an upstream.

use super::{
    Completion, CompletionExecutor, CompletionRequest, CompletionStream, Forwarded, StreamChunk,
};
use crate::error::GatewayError;
use crate::models::{ChatMessage, Credential, TokenUsage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Behavior {
    Reply {
        chunks: Vec<String>,
        images: Vec<String>,
        usage: TokenUsage,
    },
    Fail {
        status: u16,
    },
    /// Streams the first `after` chunks, then breaks.
    BreakMidStream {
        chunks: Vec<String>,
        after: usize,
    },
}

/// A call the mock received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub credential_id: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub stream: bool,
}

/// Replies per model id. Unscripted models answer
/// `"Mock response from <model>"`.
#[derive(Default)]
pub struct MockExecutor {
    behaviors: HashMap<String, Behavior>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, model: &str, content: &str, usage: TokenUsage) -> Self {
        self.with_chunks(model, &[content], usage)
    }

    /// Reply streamed as the given deltas; the blocking reply is their
    /// concatenation.
    pub fn with_chunks(mut self, model: &str, chunks: &[&str], usage: TokenUsage) -> Self {
        self.behaviors.insert(
            model.to_string(),
            Behavior::Reply {
                chunks: chunks.iter().map(|c| c.to_string()).collect(),
                images: Vec::new(),
                usage,
            },
        );
        self
    }

    pub fn with_images(mut self, model: &str, images: &[&str]) -> Self {
        if let Some(Behavior::Reply { images: slot, .. }) = self.behaviors.get_mut(model) {
            *slot = images.iter().map(|i| i.to_string()).collect();
        }
        self
    }

    pub fn with_failure(mut self, model: &str, status: u16) -> Self {
        self.behaviors
            .insert(model.to_string(), Behavior::Fail { status });
        self
    }

    pub fn with_broken_stream(mut self, model: &str, chunks: &[&str], after: usize) -> Self {
        self.behaviors.insert(
            model.to_string(),
            Behavior::BreakMidStream {
                chunks: chunks.iter().map(|c| c.to_string()).collect(),
                after,
            },
        );
        self
    }

    pub fn with_delay(mut self, model: &str, delay: Duration) -> Self {
        self.delays.insert(model.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_for(&self, model: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.model == model)
            .collect()
    }

    async fn begin(
        &self,
        credential: &Credential,
        request: &CompletionRequest,
        stream: bool,
    ) -> Behavior {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                credential_id: credential.id.clone(),
                model: request.model.clone(),
                messages: request.messages.clone(),
                temperature: request.temperature,
                stream,
            });

        if let Some(delay) = self.delays.get(&request.model) {
            tokio::time::sleep(*delay).await;
        }

        self.behaviors
            .get(&request.model)
            .cloned()
            .unwrap_or_else(|| Behavior::Reply {
                chunks: vec![format!("Mock response from {}", request.model)],
                images: Vec::new(),
                usage: TokenUsage::new(10, 5),
            })
    }
}

fn failure(status: u16) -> GatewayError {
    GatewayError::Upstream {
        status,
        body: "mock failure".to_string(),
    }
}

#[async_trait]
impl CompletionExecutor for MockExecutor {
    async fn complete(
        &self,
        credential: &Credential,
        request: &CompletionRequest,
    ) -> Result<Completion, GatewayError> {
        match self.begin(credential, request, false).await {
            Behavior::Reply {
                chunks,
                images,
                usage,
            } => Ok(Completion {
                content: chunks.concat(),
                images,
                usage,
            }),
            Behavior::Fail { status } => Err(failure(status)),
            Behavior::BreakMidStream { .. } => Err(GatewayError::UpstreamTransport(
                "mock connection reset".to_string(),
            )),
        }
    }

    async fn stream(
        &self,
        credential: &Credential,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, GatewayError> {
        let items: Vec<Result<StreamChunk, GatewayError>> =
            match self.begin(credential, request, true).await {
                Behavior::Reply {
                    chunks,
                    images,
                    usage,
                } => {
                    let mut items: Vec<_> =
                        chunks.into_iter().map(|c| Ok(StreamChunk::Text(c))).collect();
                    if !images.is_empty() {
                        items.push(Ok(StreamChunk::Images(images)));
                    }
                    items.push(Ok(StreamChunk::Complete { usage }));
                    items
                }
                Behavior::Fail { status } => return Err(failure(status)),
                Behavior::BreakMidStream { chunks, after } => {
                    let mut items: Vec<_> = chunks
                        .into_iter()
                        .take(after)
                        .map(|c| Ok(StreamChunk::Text(c)))
                        .collect();
                    items.push(Err(GatewayError::UpstreamTransport(
                        "mock connection reset".to_string(),
                    )));
                    items
                }
            };

        Ok(Box::pin(tokio_stream::iter(items)))
    }

    /// Answers like the blocking call, wrapped in an OpenAI-shaped body.
    async fn forward(
        &self,
        credential: &Credential,
        body: &serde_json::Value,
    ) -> Result<Forwarded, GatewayError> {
        let model = body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        let request = CompletionRequest::new(model, Vec::new());

        match self.begin(credential, &request, false).await {
            Behavior::Reply { chunks, usage, .. } => Ok(Forwarded {
                status: 200,
                content_type: Some("application/json".to_string()),
                body: serde_json::json!({
                    "model": model,
                    "choices": [{"message": {"role": "assistant", "content": chunks.concat()}}],
                    "usage": usage,
                })
                .to_string()
                .into_bytes(),
                usage,
            }),
            Behavior::Fail { status } => Ok(Forwarded {
                status,
                content_type: Some("text/plain".to_string()),
                body: b"mock failure".to_vec(),
                usage: TokenUsage::default(),
            }),
            Behavior::BreakMidStream { .. } => Err(GatewayError::UpstreamTransport(
                "mock connection reset".to_string(),
            )),
        }
    }
}
