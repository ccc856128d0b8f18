//! OpenAI-compatible chat-completions executor.

use super::{
    Completion, CompletionExecutor, CompletionRequest, CompletionStream, Forwarded, StreamChunk,
};
use crate::error::GatewayError;
use crate::models::{ChatMessage, Credential, ImageUrl, MessageContent, Role, TokenUsage};
use crate::services::metrics;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::observability::TracedClientExt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const MAX_ERROR_BODY: usize = 500;

pub struct OpenAiExecutor {
    client: Client,
    base_url: String,
    default_timeout: Duration,
}

impl OpenAiExecutor {
    pub fn new(base_url: &str, default_timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(
        &self,
        credential: &Credential,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, GatewayError> {
        let body = ChatCompletionBody {
            model: &request.model,
            messages: request.messages.iter().map(WireMessage::from).collect(),
            temperature: request.temperature,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        };

        tracing::debug!(
            model = %request.model,
            credential_id = %credential.id,
            messages = request.messages.len(),
            stream,
            "Sending request upstream"
        );

        let response = self
            .client
            .traced_post(&self.endpoint())
            .bearer_auth(&credential.secret)
            .json(&body)
            .timeout(request.timeout.unwrap_or(self.default_timeout))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(model = %request.model, "Upstream request failed: {}", e);
                GatewayError::UpstreamTransport(e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            tracing::error!(
                model = %request.model,
                credential_id = %credential.id,
                status,
                "Upstream returned an error"
            );
            return Err(GatewayError::Upstream {
                status,
                body: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionExecutor for OpenAiExecutor {
    async fn complete(
        &self,
        credential: &Credential,
        request: &CompletionRequest,
    ) -> Result<Completion, GatewayError> {
        let started = Instant::now();

        let result = async {
            let response = self.send(credential, request, false).await?;
            let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
                GatewayError::UpstreamTransport(format!("Failed to parse response: {}", e))
            })?;

            let output = parsed.choices.into_iter().next().and_then(|c| c.message);
            Ok(Completion {
                content: output
                    .as_ref()
                    .and_then(|o| o.content.clone())
                    .unwrap_or_default(),
                images: output.map(WireOutput::image_urls).unwrap_or_default(),
                usage: parsed.usage.map(TokenUsage::from).unwrap_or_default(),
            })
        }
        .await;

        match &result {
            Ok(completion) => {
                metrics::record_upstream_call(&request.model, "success", started.elapsed());
                metrics::record_tokens(&request.model, &completion.usage);
            }
            Err(e) => metrics::record_upstream_call(&request.model, outcome(e), started.elapsed()),
        }
        result
    }

    async fn stream(
        &self,
        credential: &Credential,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, GatewayError> {
        let started = Instant::now();
        let response = match self.send(credential, request, true).await {
            Ok(response) => response,
            Err(e) => {
                metrics::record_upstream_call(&request.model, outcome(&e), started.elapsed());
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(32);
        let model = request.model.clone();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut usage = TokenUsage::default();

            while let Some(chunk_result) = body.next().await {
                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::error!(model = %model, "Upstream stream broke: {}", e);
                        metrics::record_upstream_call(&model, "transport", started.elapsed());
                        let _ = tx
                            .send(Err(GatewayError::UpstreamTransport(e.to_string())))
                            .await;
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                // Lines are decoded only once complete so multi-byte
                // characters split across chunks survive.
                while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    if forward_line(&line, &tx, &mut usage).await {
                        metrics::record_upstream_call(&model, "success", started.elapsed());
                        metrics::record_tokens(&model, &usage);
                        return;
                    }
                }
            }

            // The last line may arrive without a trailing newline.
            if !buffer.is_empty() && forward_line(&buffer, &tx, &mut usage).await {
                metrics::record_upstream_call(&model, "success", started.elapsed());
                metrics::record_tokens(&model, &usage);
                return;
            }

            tracing::error!(model = %model, "Upstream stream ended without [DONE]");
            metrics::record_upstream_call(&model, "transport", started.elapsed());
            let _ = tx
                .send(Err(GatewayError::UpstreamTransport(
                    "stream ended before completion".to_string(),
                )))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)) as CompletionStream)
    }

    async fn forward(
        &self,
        credential: &Credential,
        body: &serde_json::Value,
    ) -> Result<Forwarded, GatewayError> {
        let model = body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown")
            .to_string();
        let started = Instant::now();

        let response = self
            .client
            .traced_post(&self.endpoint())
            .bearer_auth(&credential.secret)
            .json(body)
            .timeout(self.default_timeout)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(model = %model, "Proxied request failed: {}", e);
                metrics::record_upstream_call(&model, "transport", started.elapsed());
                GatewayError::UpstreamTransport(e.to_string())
            })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(|e| {
            metrics::record_upstream_call(&model, "transport", started.elapsed());
            GatewayError::UpstreamTransport(e.to_string())
        })?;

        let usage = content_type
            .as_deref()
            .filter(|ct| ct.contains("application/json"))
            .and_then(|_| serde_json::from_slice::<ChatCompletionResponse>(&bytes).ok())
            .and_then(|parsed| parsed.usage)
            .map(TokenUsage::from)
            .unwrap_or_default();

        let outcome = if (200..300).contains(&status) {
            "success"
        } else {
            "upstream_error"
        };
        metrics::record_upstream_call(&model, outcome, started.elapsed());
        metrics::record_tokens(&model, &usage);

        Ok(Forwarded {
            status,
            content_type,
            body: bytes.to_vec(),
            usage,
        })
    }
}

/// Forward one SSE line. Returns true once the `[DONE]` sentinel was seen
/// and the completion chunk sent.
async fn forward_line(
    line: &[u8],
    tx: &mpsc::Sender<Result<StreamChunk, GatewayError>>,
    usage: &mut TokenUsage,
) -> bool {
    match parse_frame(&String::from_utf8_lossy(line)) {
        Frame::Skip => false,
        Frame::Done => {
            let _ = tx.send(Ok(StreamChunk::Complete { usage: *usage })).await;
            true
        }
        Frame::Chunk(frame) => {
            if let Some(u) = frame.usage {
                *usage = u.into();
            }
            for choice in frame.choices {
                let Some(delta) = choice.delta else { continue };
                if let Some(text) = delta.content.clone().filter(|t| !t.is_empty()) {
                    let _ = tx.send(Ok(StreamChunk::Text(text))).await;
                }
                let images = delta.image_urls();
                if !images.is_empty() {
                    let _ = tx.send(Ok(StreamChunk::Images(images))).await;
                }
            }
            false
        }
    }
}

fn outcome(e: &GatewayError) -> &'static str {
    match e {
        GatewayError::Upstream { .. } => "upstream_error",
        _ => "transport",
    }
}

/// One line of an SSE body.
#[derive(Debug)]
pub(crate) enum Frame {
    Chunk(ChatCompletionResponse),
    Done,
    /// Blank lines, comments, non-data fields and unparseable payloads.
    Skip,
}

pub(crate) fn parse_frame(line: &str) -> Frame {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Frame::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Frame::Done;
    }
    match serde_json::from_str(data) {
        Ok(frame) => Frame::Chunk(frame),
        Err(e) => {
            tracing::debug!("Skipping malformed upstream frame: {}", e);
            Frame::Skip
        }
    }
}

// Wire types

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a MessageContent,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(m: &'a ChatMessage) -> Self {
        Self {
            role: m.role,
            content: &m.content,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: Option<WireOutput>,
    #[serde(default)]
    delta: Option<WireOutput>,
}

#[derive(Debug, Deserialize)]
struct WireOutput {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    images: Vec<WireImage>,
}

impl WireOutput {
    fn image_urls(self) -> Vec<String> {
        self.images.into_iter().map(|i| i.image_url.url).collect()
    }
}

#[derive(Debug, Deserialize)]
struct WireImage {
    image_url: ImageUrl,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u
                .total_tokens
                .unwrap_or(u.prompt_tokens + u.completion_tokens),
        }
    }
}
