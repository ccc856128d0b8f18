//! Streaming relay protocol.
//!
//! A relayed turn is `start`, any number of `content` deltas, optional
//! `images`, then exactly one of `done` or `error`.

use crate::error::GatewayError;
use crate::models::{Mode, TokenUsage};
use crate::services::upstream::{CompletionStream, StreamChunk};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    Start {
        conversation_id: String,
        model: String,
        title: String,
        sources: Vec<String>,
        mode: Mode,
    },
    Content {
        delta: String,
    },
    Images {
        images: Vec<String>,
    },
    Done {
        conversation_id: String,
        model: String,
        usage: TokenUsage,
        cost: f64,
    },
    Error {
        message: String,
        status: u16,
    },
}

impl RelayEvent {
    pub fn error(err: &GatewayError) -> Self {
        RelayEvent::Error {
            message: err.to_string(),
            status: err.status_code().as_u16(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayEvent::Done { .. } | RelayEvent::Error { .. })
    }
}

/// Where relayed events go. Delivery is best effort: a gone receiver must not
/// stop the upstream from being drained.
#[async_trait]
pub trait RelaySink: Send + Sync {
    async fn emit(&self, event: RelayEvent);
}

#[async_trait]
impl RelaySink for mpsc::Sender<RelayEvent> {
    async fn emit(&self, event: RelayEvent) {
        if self.send(event).await.is_err() {
            tracing::debug!("Relay receiver gone, continuing to drain upstream");
        }
    }
}

/// Everything a finished stream produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamedTurn {
    pub content: String,
    pub images: Vec<String>,
    pub usage: TokenUsage,
}

/// Forward deltas to `sink` in upstream order and collect the turn.
///
/// Returns once the executor reports completion. Terminal events are left to
/// the caller, which still has to persist the turn.
pub async fn relay_stream(
    mut stream: CompletionStream,
    sink: &dyn RelaySink,
) -> Result<StreamedTurn, GatewayError> {
    let mut turn = StreamedTurn::default();

    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::Text(delta) => {
                turn.content.push_str(&delta);
                sink.emit(RelayEvent::Content { delta }).await;
            }
            StreamChunk::Images(images) => {
                turn.images.extend(images.iter().cloned());
                sink.emit(RelayEvent::Images { images }).await;
            }
            StreamChunk::Complete { usage } => {
                turn.usage = usage;
                return Ok(turn);
            }
        }
    }

    Err(GatewayError::UpstreamTransport(
        "stream ended before completion".to_string(),
    ))
}
