//! One-to-one chat: quota, entitlement, routing, execution and persistence of
//! a conversation turn, blocking or streamed.

use crate::error::GatewayError;
use crate::models::{
    CandidateExcerpt, ChatMessage, Conversation, ConversationSummary, MessageContent,
    MessageMetadata, Mode, TokenUsage,
};
use crate::services::context::{EntitlementCheck, WebContextProvider, WebSnippet};
use crate::services::engine::Engine;
use crate::services::ensemble::{clip, CallUsage, EnsembleOutcome, EnsembleRequest, ENSEMBLE_MODEL};
use crate::services::relay::{relay_stream, RelayEvent, RelaySink};
use crate::services::router::{RouteDecision, RouteRequest};
use crate::services::upstream::CompletionRequest;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

const EXCERPT_CHARS: usize = 300;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub user_id: String,
    /// Continue this conversation; a new one is created when absent.
    pub conversation_id: Option<String>,
    pub content: MessageContent,
    pub mode: Mode,
    /// Explicit model choice, honoured in `general` and `manual` mode.
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub web_search: bool,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub title: String,
    pub model: String,
    pub mode: Mode,
    pub content: String,
    pub images: Vec<String>,
    pub usage: TokenUsage,
    pub cost: f64,
    pub sources: Vec<String>,
    pub candidates: Vec<CandidateExcerpt>,
}

/// Everything decided before the upstream call.
struct PreparedTurn {
    request_id: String,
    user_id: String,
    conversation: Conversation,
    /// Not stored yet; created on finish together with its first turn.
    is_new: bool,
    user_message: ChatMessage,
    prompt: String,
    messages: Vec<ChatMessage>,
    snippets: Vec<WebSnippet>,
    mode: Mode,
    decision: RouteDecision,
    /// Already recorded during prepare; kept for the turn totals.
    router_call: Option<CallUsage>,
    router_cost: f64,
}

impl PreparedTurn {
    fn planned_model(&self) -> String {
        match &self.decision {
            RouteDecision::Single(model) => model.clone(),
            RouteDecision::Ensemble => ENSEMBLE_MODEL.to_string(),
        }
    }

    fn sources(&self) -> Vec<String> {
        self.snippets.iter().map(|s| s.url.clone()).collect()
    }
}

/// What the upstream produced for a turn.
struct TurnOutput {
    content: String,
    images: Vec<String>,
    model: String,
    calls: Vec<CallUsage>,
    candidates: Vec<CandidateExcerpt>,
}

impl From<EnsembleOutcome> for TurnOutput {
    fn from(outcome: EnsembleOutcome) -> Self {
        Self {
            candidates: outcome
                .candidates
                .iter()
                .map(|c| CandidateExcerpt {
                    model: c.model.clone(),
                    excerpt: clip(&c.content, EXCERPT_CHARS),
                })
                .collect(),
            content: outcome.content,
            images: outcome.images,
            model: outcome.model,
            calls: outcome.calls,
        }
    }
}

#[derive(Clone)]
pub struct ChatService {
    engine: Engine,
    web: Arc<dyn WebContextProvider>,
    entitlement: Arc<dyn EntitlementCheck>,
    requests_per_minute: u32,
}

impl ChatService {
    pub fn new(
        engine: Engine,
        web: Arc<dyn WebContextProvider>,
        entitlement: Arc<dyn EntitlementCheck>,
        requests_per_minute: u32,
    ) -> Self {
        Self {
            engine,
            web,
            entitlement,
            requests_per_minute,
        }
    }

    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id, mode = %request.mode))]
    pub async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, GatewayError> {
        let turn = self.prepare(request).await?;
        let output = self.execute(&turn).await?;
        self.finish(turn, output).await
    }

    /// Validation, quota and entitlement failures are returned directly;
    /// anything after `start` arrives as the terminal `error` event.
    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id, mode = %request.mode))]
    pub async fn stream(
        &self,
        request: ChatRequest,
    ) -> Result<ReceiverStream<RelayEvent>, GatewayError> {
        let turn = self.prepare(request).await?;
        let (tx, rx) = mpsc::channel(64);
        let service = self.clone();

        tokio::spawn(
            async move {
                tx.emit(RelayEvent::Start {
                    conversation_id: turn.conversation.conversation_id.clone(),
                    model: turn.planned_model(),
                    title: turn.conversation.title.clone(),
                    sources: turn.sources(),
                    mode: turn.mode,
                })
                .await;

                let conversation_id = turn.conversation.conversation_id.clone();
                let result = match service.execute_streaming(&turn, &tx).await {
                    Ok(output) => service.finish(turn, output).await,
                    Err(e) => Err(e),
                };

                match result {
                    Ok(response) => {
                        tx.emit(RelayEvent::Done {
                            conversation_id: response.conversation_id,
                            model: response.model,
                            usage: response.usage,
                            cost: response.cost,
                        })
                        .await;
                    }
                    Err(e) => {
                        tracing::error!(
                            conversation_id = %conversation_id,
                            error = %e,
                            "Streamed turn failed, nothing persisted"
                        );
                        tx.emit(RelayEvent::error(&e)).await;
                    }
                }
            }
            .in_current_span(),
        );

        Ok(ReceiverStream::new(rx))
    }

    pub async fn list_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, GatewayError> {
        Ok(self.engine.stores.conversations.list(user_id).await?)
    }

    pub async fn get_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, GatewayError> {
        self.engine
            .stores
            .conversations
            .load(user_id, conversation_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("conversation {}", conversation_id)))
    }

    async fn prepare(&self, request: ChatRequest) -> Result<PreparedTurn, GatewayError> {
        if request.content.is_empty() {
            return Err(GatewayError::InvalidRequest("message is required".to_string()));
        }

        self.engine
            .check_caller_quota(&request.user_id, self.requests_per_minute)
            .await?;

        if !self.entitlement.is_entitled(&request.user_id, request.mode) {
            return Err(GatewayError::EntitlementDenied(format!(
                "{} mode is not enabled for this account",
                request.mode
            )));
        }

        let prompt = request.content.text();
        let (conversation, is_new) = match &request.conversation_id {
            Some(id) => (
                self.engine
                    .stores
                    .conversations
                    .load(&request.user_id, id)
                    .await?
                    .ok_or_else(|| GatewayError::NotFound(format!("conversation {}", id)))?,
                false,
            ),
            None => (Conversation::new(&request.user_id, &prompt), true),
        };

        let snippets = if request.web_search {
            self.web.snippets(&prompt).await
        } else {
            Vec::new()
        };

        let user_message = ChatMessage::user(request.content.clone());
        let messages = build_messages(
            request.system_prompt.as_deref(),
            &snippets,
            &conversation.messages,
            &user_message,
        );

        let routed = self
            .engine
            .router
            .resolve(RouteRequest {
                text: &prompt,
                has_attachments: request.content.has_images(),
                mode: request.mode,
                explicit_model: request.model.as_deref(),
            })
            .await;

        // The router call used a credential whatever happens to the turn.
        let request_id = uuid::Uuid::new_v4().to_string();
        let router_cost = match &routed.call {
            Some(call) => {
                self.engine
                    .record_calls(&request_id, Some(&request.user_id), std::slice::from_ref(call))
                    .await?
            }
            None => 0.0,
        };

        Ok(PreparedTurn {
            request_id,
            user_id: request.user_id,
            conversation,
            is_new,
            user_message,
            prompt,
            messages,
            snippets,
            mode: request.mode,
            decision: routed.decision,
            router_call: routed.call,
            router_cost,
        })
    }

    async fn execute(&self, turn: &PreparedTurn) -> Result<TurnOutput, GatewayError> {
        match &turn.decision {
            RouteDecision::Single(model) => {
                let credential = self.engine.gate.admit().await?;
                let completion = self
                    .engine
                    .executor
                    .complete(&credential, &self.single_request(model, turn))
                    .await?;
                Ok(TurnOutput {
                    content: completion.content,
                    images: completion.images,
                    model: model.clone(),
                    calls: vec![CallUsage {
                        credential_id: credential.id,
                        model: model.clone(),
                        usage: completion.usage,
                    }],
                    candidates: Vec::new(),
                })
            }
            RouteDecision::Ensemble => Ok(self.run_ensemble(turn).await?.into()),
        }
    }

    async fn execute_streaming(
        &self,
        turn: &PreparedTurn,
        sink: &dyn RelaySink,
    ) -> Result<TurnOutput, GatewayError> {
        match &turn.decision {
            RouteDecision::Single(model) => {
                let credential = self.engine.gate.admit().await?;
                let stream = self
                    .engine
                    .executor
                    .stream(&credential, &self.single_request(model, turn))
                    .await?;
                let streamed = relay_stream(stream, sink).await?;
                Ok(TurnOutput {
                    content: streamed.content,
                    images: streamed.images,
                    model: model.clone(),
                    calls: vec![CallUsage {
                        credential_id: credential.id,
                        model: model.clone(),
                        usage: streamed.usage,
                    }],
                    candidates: Vec::new(),
                })
            }
            RouteDecision::Ensemble => {
                // Fusion is not streamed upstream; the answer goes out as one delta.
                let outcome = self.run_ensemble(turn).await?;
                if !outcome.content.is_empty() {
                    sink.emit(RelayEvent::Content {
                        delta: outcome.content.clone(),
                    })
                    .await;
                }
                if !outcome.images.is_empty() {
                    sink.emit(RelayEvent::Images {
                        images: outcome.images.clone(),
                    })
                    .await;
                }
                Ok(outcome.into())
            }
        }
    }

    fn single_request(&self, model: &str, turn: &PreparedTurn) -> CompletionRequest {
        CompletionRequest::new(model, turn.messages.clone())
            .with_timeout(self.engine.completion_timeout)
    }

    async fn run_ensemble(&self, turn: &PreparedTurn) -> Result<EnsembleOutcome, GatewayError> {
        self.engine
            .ensemble
            .run(&EnsembleRequest {
                messages: turn.messages.clone(),
                prompt: turn.prompt.clone(),
                snippets: turn.snippets.iter().map(|s| s.text.clone()).collect(),
            })
            .await
    }

    /// Record usage for the upstream calls of the turn, then append both new
    /// messages to the conversation.
    async fn finish(
        &self,
        turn: PreparedTurn,
        output: TurnOutput,
    ) -> Result<ChatResponse, GatewayError> {
        let cost = turn.router_cost
            + self
                .engine
                .record_calls(&turn.request_id, Some(&turn.user_id), &output.calls)
                .await?;

        let mut calls: Vec<CallUsage> = turn.router_call.clone().into_iter().collect();
        calls.extend(output.calls.iter().cloned());
        let usage = Engine::total_usage(&calls);

        let mut assistant = ChatMessage::assistant(output.content.clone(), output.model.clone());
        assistant.images = output.images.clone();
        assistant.metadata = Some(MessageMetadata {
            mode: Some(turn.mode),
            usage: Some(usage),
            candidates: output.candidates.clone(),
        });

        let mut conversation = turn.conversation;
        let new_messages = [turn.user_message, assistant];
        let now = Utc::now();
        if turn.is_new {
            conversation.messages.extend(new_messages);
            conversation.updated_at = now;
            self.engine.stores.conversations.create(&conversation).await?;
        } else if !self
            .engine
            .stores
            .conversations
            .append_messages(
                &turn.user_id,
                &conversation.conversation_id,
                &new_messages,
                now,
            )
            .await?
        {
            return Err(GatewayError::NotFound(format!(
                "conversation {}",
                conversation.conversation_id
            )));
        }

        tracing::info!(
            conversation_id = %conversation.conversation_id,
            model = %output.model,
            total_tokens = usage.total_tokens,
            cost,
            "Chat turn completed"
        );

        Ok(ChatResponse {
            sources: turn.snippets.iter().map(|s| s.url.clone()).collect(),
            conversation_id: conversation.conversation_id,
            title: conversation.title,
            model: output.model,
            mode: turn.mode,
            content: output.content,
            images: output.images,
            usage,
            cost,
            candidates: output.candidates,
        })
    }
}

/// Upstream message list: system prompt, web context, history, new turn.
fn build_messages(
    system_prompt: Option<&str>,
    snippets: &[WebSnippet],
    history: &[ChatMessage],
    user_message: &ChatMessage,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 3);

    if let Some(prompt) = system_prompt.map(str::trim).filter(|p| !p.is_empty()) {
        messages.push(ChatMessage::system(prompt));
    }

    if !snippets.is_empty() {
        let context: Vec<String> = snippets
            .iter()
            .enumerate()
            .map(|(i, s)| format!("[{}] {} ({})", i + 1, s.text, s.url))
            .collect();
        messages.push(ChatMessage::system(format!(
            "Web results that may help:\n{}",
            context.join("\n")
        )));
    }

    messages.extend(history.iter().map(ChatMessage::for_upstream));
    messages.push(user_message.for_upstream());
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::services::context::{AllowlistEntitlement, NoWebContext};
    use crate::services::store::MemoryStore;
    use crate::services::testing::{self, DEFAULT_MODEL, FUSION_MODEL};
    use crate::services::upstream::MockExecutor;
    use futures::StreamExt;

    fn service(executor: MockExecutor) -> (ChatService, Arc<MemoryStore>, Arc<MockExecutor>) {
        service_with(executor, |_| {})
    }

    fn service_with(
        executor: MockExecutor,
        tweak: impl FnOnce(&mut crate::config::GatewayConfig),
    ) -> (ChatService, Arc<MemoryStore>, Arc<MockExecutor>) {
        let mut config = testing::test_config();
        tweak(&mut config);
        let (engine, store, executor) = testing::engine(&config, executor);
        let service = ChatService::new(
            engine,
            Arc::new(NoWebContext),
            Arc::new(AllowlistEntitlement::new(
                config.quota.ultimate_allowed_users.clone(),
            )),
            config.quota.requests_per_minute,
        );
        (service, store, executor)
    }

    fn ask(text: &str, mode: Mode) -> ChatRequest {
        ChatRequest {
            user_id: "alice".into(),
            conversation_id: None,
            content: text.into(),
            mode,
            model: None,
            system_prompt: None,
            web_search: false,
        }
    }

    #[tokio::test]
    async fn complete_persists_turn_and_usage() {
        let (service, store, _) = service(MockExecutor::new().with_reply(
            DEFAULT_MODEL,
            "Ownership moves values.",
            TokenUsage::new(12, 4),
        ));

        let response = service
            .complete(ask("Explain ownership in Rust please", Mode::General))
            .await
            .unwrap();

        assert_eq!(response.model, DEFAULT_MODEL);
        assert_eq!(response.content, "Ownership moves values.");
        assert_eq!(response.title, "Explain ownership in Rust plea");

        let conversation = service
            .get_conversation("alice", &response.conversation_id)
            .await
            .unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, Role::User);
        assert_eq!(conversation.messages[1].model.as_deref(), Some(DEFAULT_MODEL));

        // Router call plus the answer, both under one request id.
        let records = store.usage_records().await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.request_id == records[0].request_id));
        let recorded: TokenUsage = records.iter().map(|r| r.usage()).sum();
        assert_eq!(recorded, response.usage);
    }

    #[tokio::test]
    async fn continuing_a_conversation_sends_history() {
        let (service, _, executor) = service(MockExecutor::new());
        let first = service.complete(ask("first", Mode::Turbo)).await.unwrap();

        let mut follow_up = ask("second", Mode::Turbo);
        follow_up.conversation_id = Some(first.conversation_id.clone());
        service.complete(follow_up).await.unwrap();

        let last = executor.calls_for("turbo/model").pop().unwrap();
        let texts: Vec<String> = last.messages.iter().map(|m| m.content.text()).collect();
        assert_eq!(
            texts,
            vec!["first", "Mock response from turbo/model", "second"]
        );
        assert!(last.messages.iter().all(|m| m.metadata.is_none()));
    }

    #[tokio::test]
    async fn foreign_conversation_is_not_found() {
        let (service, _, _) = service(MockExecutor::new());
        let first = service.complete(ask("mine", Mode::Turbo)).await.unwrap();

        let mut intruder = ask("hi", Mode::Turbo);
        intruder.user_id = "mallory".into();
        intruder.conversation_id = Some(first.conversation_id);

        assert!(matches!(
            service.complete(intruder).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (service, _, executor) = service(MockExecutor::new());
        assert!(matches!(
            service.complete(ask("   ", Mode::Turbo)).await,
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn caller_quota_limits_requests() {
        let (service, _, _) = service_with(MockExecutor::new(), |c| {
            c.quota.requests_per_minute = 2
        });

        service.complete(ask("one", Mode::Turbo)).await.unwrap();
        service.complete(ask("two", Mode::Turbo)).await.unwrap();

        assert!(matches!(
            service.complete(ask("three", Mode::Turbo)).await,
            Err(GatewayError::RateLimited { retry_after: 60 })
        ));
    }

    #[tokio::test]
    async fn ultimate_requires_entitlement() {
        let (service, _, executor) = service_with(MockExecutor::new(), |c| {
            c.quota.ultimate_allowed_users = vec!["bob".into()]
        });

        assert!(matches!(
            service.complete(ask("hi", Mode::Ultimate)).await,
            Err(GatewayError::EntitlementDenied(_))
        ));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn ultimate_records_every_call() {
        let (service, store, _) = service(
            MockExecutor::new()
                .with_reply("cand/a", "a says", TokenUsage::new(10, 1))
                .with_reply("cand/b", "b says", TokenUsage::new(20, 2))
                .with_reply(FUSION_MODEL, "merged", TokenUsage::new(30, 3)),
        );

        let response = service.complete(ask("hard question", Mode::Ultimate)).await.unwrap();

        assert_eq!(response.model, ENSEMBLE_MODEL);
        assert_eq!(response.content, "merged");
        assert_eq!(response.usage, TokenUsage::new(60, 6));
        assert_eq!(response.candidates.len(), 2);
        assert_eq!(store.usage_records().await.len(), 3);
    }

    #[tokio::test]
    async fn exhausted_ensemble_persists_nothing() {
        let (service, store, _) = service(
            MockExecutor::new()
                .with_failure("cand/a", 500)
                .with_failure("cand/b", 500),
        );

        let err = service.complete(ask("hi", Mode::Ultimate)).await.unwrap_err();

        assert!(matches!(err, GatewayError::EnsembleExhausted { .. }));
        assert!(store.usage_records().await.is_empty());
        assert!(service.list_conversations("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn streamed_content_matches_blocking_content() {
        let executor = MockExecutor::new().with_chunks(
            "precise/model",
            &["The ", "answer ", "is 42."],
            TokenUsage::new(5, 5),
        );
        let (service, _, _) = service(executor);

        let blocking = service.complete(ask("q", Mode::Precise)).await.unwrap();
        let events: Vec<RelayEvent> = service
            .stream(ask("q", Mode::Precise))
            .await
            .unwrap()
            .collect()
            .await;

        assert!(matches!(events.first(), Some(RelayEvent::Start { model, .. }) if model == "precise/model"));
        assert!(matches!(events.last(), Some(RelayEvent::Done { .. })));
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Content { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, blocking.content);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_error_and_persists_nothing() {
        let (service, store, _) = service(MockExecutor::new().with_broken_stream(
            "turbo/model",
            &["par", "tial", "never"],
            2,
        ));

        let events: Vec<RelayEvent> = service
            .stream(ask("q", Mode::Turbo))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], RelayEvent::Start { .. }));
        assert!(matches!(events[3], RelayEvent::Error { status: 502, .. }));
        assert!(store.usage_records().await.is_empty());
        assert!(service.list_conversations("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn streamed_ultimate_sends_fused_answer_once() {
        let (service, _, _) = service(
            MockExecutor::new()
                .with_reply("cand/a", "a", TokenUsage::default())
                .with_reply("cand/b", "b", TokenUsage::default())
                .with_reply(FUSION_MODEL, "fused answer", TokenUsage::default()),
        );

        let events: Vec<RelayEvent> = service
            .stream(ask("q", Mode::Ultimate))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(
            events[1],
            RelayEvent::Content {
                delta: "fused answer".into()
            }
        );
        assert!(matches!(&events[2], RelayEvent::Done { model, .. } if model == ENSEMBLE_MODEL));
    }

    #[test]
    fn messages_include_system_and_web_context() {
        let snippets = vec![WebSnippet {
            url: "https://doc.rust-lang.org".into(),
            text: "The Rust book".into(),
        }];
        let history = vec![ChatMessage::user("earlier")];
        let messages = build_messages(
            Some("Be brief"),
            &snippets,
            &history,
            &ChatMessage::user("now"),
        );

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content.text(), "Be brief");
        assert!(messages[1].content.text().contains("[1] The Rust book (https://doc.rust-lang.org)"));
        assert_eq!(messages[3].content.text(), "now");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_turns_on_one_conversation_both_persist() {
        let (service, _, _) = service(
            MockExecutor::new()
                .with_reply("turbo/model", "ok", TokenUsage::new(1, 1))
                .with_delay("turbo/model", std::time::Duration::from_millis(50)),
        );
        let first = service.complete(ask("first", Mode::Turbo)).await.unwrap();

        let mut a = ask("a", Mode::Turbo);
        a.conversation_id = Some(first.conversation_id.clone());
        let mut b = ask("b", Mode::Turbo);
        b.conversation_id = Some(first.conversation_id.clone());
        let (ra, rb) = tokio::join!(service.complete(a), service.complete(b));
        ra.unwrap();
        rb.unwrap();

        let conversation = service
            .get_conversation("alice", &first.conversation_id)
            .await
            .unwrap();
        let texts: Vec<String> = conversation
            .messages
            .iter()
            .map(|m| m.content.text())
            .collect();
        assert_eq!(texts.len(), 6);
        assert!(texts.contains(&"a".to_string()));
        assert!(texts.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn router_call_is_recorded_when_the_turn_fails() {
        let (service, store, _) = service(MockExecutor::new().with_failure(DEFAULT_MODEL, 500));

        let err = service.complete(ask("hi", Mode::General)).await.unwrap_err();

        assert!(matches!(err, GatewayError::Upstream { status: 500, .. }));
        let records = store.usage_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].model, testing::ROUTER_MODEL);
        assert_eq!(records[0].user_id.as_deref(), Some("alice"));
        assert!(service.list_conversations("alice").await.unwrap().is_empty());
    }
}
