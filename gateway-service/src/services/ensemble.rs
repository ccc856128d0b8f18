//! Ensemble fan-out and fusion.
//!
//! Every configured candidate model gets the same conversation concurrently.
//! With two or more answers a single fusion call merges them; with one the
//! answer is returned as is.

use crate::config::EnsembleConfig;
use crate::error::GatewayError;
use crate::models::{ChatMessage, Credential, Role, TokenUsage};
use crate::services::admission::AdmissionGate;
use crate::services::metrics;
use crate::services::upstream::{Completion, CompletionExecutor, CompletionRequest};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

/// Model label reported for fused answers.
pub const ENSEMBLE_MODEL: &str = "ensemble";

const FUSION_INSTRUCTION: &str = "\
You merge several candidate answers to the same request into one final answer.
Keep what the candidates agree on, resolve contradictions in favour of the best supported claim, \
and drop anything unsupported. Answer the user directly in the language they used. \
Do not mention the candidates or that several answers existed.";

#[derive(Debug, Clone)]
pub struct EnsembleRequest {
    /// Full message list sent to every candidate, latest user turn last.
    pub messages: Vec<ChatMessage>,
    /// Text of the latest user turn.
    pub prompt: String,
    /// Optional retrieval snippets, most relevant first.
    pub snippets: Vec<String>,
}

/// One successful candidate answer.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleCandidate {
    pub model: String,
    pub content: String,
    pub images: Vec<String>,
    pub usage: TokenUsage,
}

/// Usage of one successful upstream call made for the turn.
#[derive(Debug, Clone, PartialEq)]
pub struct CallUsage {
    pub credential_id: String,
    pub model: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct EnsembleOutcome {
    pub content: String,
    pub images: Vec<String>,
    /// `ensemble` when fused, otherwise the single candidate's id.
    pub model: String,
    /// Sum of every successful call, fusion included.
    pub usage: TokenUsage,
    /// Successful candidates in configured order.
    pub candidates: Vec<EnsembleCandidate>,
    pub fused: bool,
    pub calls: Vec<CallUsage>,
}

pub struct EnsembleOrchestrator {
    executor: Arc<dyn CompletionExecutor>,
    gate: Arc<AdmissionGate>,
    config: EnsembleConfig,
    call_timeout: Duration,
}

impl EnsembleOrchestrator {
    pub fn new(
        executor: Arc<dyn CompletionExecutor>,
        gate: Arc<AdmissionGate>,
        config: EnsembleConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            gate,
            config,
            call_timeout,
        }
    }

    /// Candidate ids in configured order, duplicates dropped.
    pub fn candidates(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for model in &self.config.models {
            if !seen.contains(model) {
                seen.push(model.clone());
            }
        }
        seen
    }

    #[tracing::instrument(skip_all, fields(candidates = self.config.models.len()))]
    pub async fn run(&self, request: &EnsembleRequest) -> Result<EnsembleOutcome, GatewayError> {
        let models = self.candidates();
        if models.is_empty() {
            return Err(GatewayError::EnsembleExhausted { attempted: 0 });
        }

        let credentials = self.gate.eligible().await?;

        let handles: Vec<_> = models
            .iter()
            .enumerate()
            .map(|(i, model)| {
                let executor = self.executor.clone();
                let credential = credentials[i % credentials.len()].clone();
                let call = CompletionRequest::new(model, request.messages.clone())
                    .with_timeout(self.call_timeout);
                let timeout = self.call_timeout;

                tokio::spawn(async move {
                    let result =
                        match tokio::time::timeout(timeout, executor.complete(&credential, &call))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(GatewayError::UpstreamTransport(format!(
                                "timed out after {}s",
                                timeout.as_secs()
                            ))),
                        };
                    (credential, result)
                })
            })
            .collect();

        // join_all keeps spawn order, which is the configured order.
        let mut candidates = Vec::new();
        let mut calls = Vec::new();
        for (model, joined) in models.iter().zip(join_all(handles).await) {
            match joined {
                Ok((credential, Ok(completion))) => {
                    metrics::record_candidate("success");
                    calls.push(CallUsage {
                        credential_id: credential.id.clone(),
                        model: model.clone(),
                        usage: completion.usage,
                    });
                    candidates.push(EnsembleCandidate {
                        model: model.clone(),
                        content: completion.content,
                        images: completion.images,
                        usage: completion.usage,
                    });
                }
                Ok((credential, Err(e))) => {
                    metrics::record_candidate("failure");
                    tracing::warn!(
                        model = %model,
                        credential_id = %credential.id,
                        error = %e,
                        "Ensemble candidate failed"
                    );
                }
                Err(e) => {
                    metrics::record_candidate("failure");
                    tracing::warn!(model = %model, "Ensemble candidate task aborted: {}", e);
                }
            }
        }

        match candidates.len() {
            0 => {
                tracing::error!(attempted = models.len(), "Every ensemble candidate failed");
                Err(GatewayError::EnsembleExhausted {
                    attempted: models.len(),
                })
            }
            1 => Ok(single(candidates, calls)),
            _ => Ok(self.fuse(request, candidates, calls).await),
        }
    }

    async fn fuse(
        &self,
        request: &EnsembleRequest,
        candidates: Vec<EnsembleCandidate>,
        mut calls: Vec<CallUsage>,
    ) -> EnsembleOutcome {
        let fusion = CompletionRequest::new(
            &self.config.fusion_model,
            vec![
                ChatMessage::system(FUSION_INSTRUCTION),
                ChatMessage::user(self.fusion_prompt(request, &candidates)),
            ],
        )
        .with_temperature(self.config.fusion_temperature)
        .with_timeout(self.call_timeout);

        match self.call_fusion(&fusion).await {
            Ok((credential, completion)) => {
                calls.push(CallUsage {
                    credential_id: credential.id,
                    model: self.config.fusion_model.clone(),
                    usage: completion.usage,
                });
                let images = if completion.images.is_empty() {
                    candidates.iter().flat_map(|c| c.images.clone()).collect()
                } else {
                    completion.images
                };
                EnsembleOutcome {
                    content: completion.content,
                    images,
                    model: ENSEMBLE_MODEL.to_string(),
                    usage: calls.iter().map(|c| c.usage).sum(),
                    candidates,
                    fused: true,
                    calls,
                }
            }
            Err(e) => {
                tracing::warn!(
                    model = %self.config.fusion_model,
                    error = %e,
                    "Fusion failed, answering with the first candidate"
                );
                let first = candidates[0].clone();
                EnsembleOutcome {
                    content: first.content,
                    images: first.images,
                    model: first.model,
                    usage: calls.iter().map(|c| c.usage).sum(),
                    candidates,
                    fused: false,
                    calls,
                }
            }
        }
    }

    async fn call_fusion(
        &self,
        request: &CompletionRequest,
    ) -> Result<(Credential, Completion), GatewayError> {
        let credential = self.gate.admit().await?;
        let completion = tokio::time::timeout(
            self.call_timeout,
            self.executor.complete(&credential, request),
        )
        .await
        .map_err(|_| GatewayError::UpstreamTransport("fusion timed out".to_string()))??;
        Ok((credential, completion))
    }

    fn fusion_prompt(&self, request: &EnsembleRequest, candidates: &[EnsembleCandidate]) -> String {
        let cfg = &self.config;
        let mut prompt = String::new();

        // Earlier turns only; the latest user turn is quoted separately.
        let earlier = match request.messages.last() {
            Some(last) if last.role == Role::User => &request.messages[..request.messages.len() - 1],
            _ => &request.messages[..],
        };
        let turns: Vec<&ChatMessage> = earlier
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        let recent = &turns[turns.len().saturating_sub(cfg.history_turns)..];
        if !recent.is_empty() {
            prompt.push_str("Conversation so far:\n");
            for turn in recent {
                let role = match turn.role {
                    Role::User => "user",
                    _ => "assistant",
                };
                prompt.push_str(&format!(
                    "{}: {}\n",
                    role,
                    clip(&turn.content.text(), cfg.turn_chars)
                ));
            }
            prompt.push('\n');
        }

        prompt.push_str("Latest request:\n");
        prompt.push_str(&request.prompt);
        prompt.push_str("\n\n");

        if !request.snippets.is_empty() && cfg.max_snippets > 0 {
            prompt.push_str("Web context:\n");
            for (i, snippet) in request.snippets.iter().take(cfg.max_snippets).enumerate() {
                prompt.push_str(&format!("[{}] {}\n", i + 1, clip(snippet, cfg.snippet_chars)));
            }
            prompt.push('\n');
        }

        prompt.push_str("Candidate answers:\n");
        for (i, candidate) in candidates.iter().enumerate() {
            prompt.push_str(&format!(
                "#{} ({}):\n{}\n\n",
                i + 1,
                candidate.model,
                clip(&candidate.content, cfg.answer_chars)
            ));
        }

        prompt.push_str("Write the final answer.");
        prompt
    }
}

fn single(mut candidates: Vec<EnsembleCandidate>, calls: Vec<CallUsage>) -> EnsembleOutcome {
    let only = candidates.remove(0);
    EnsembleOutcome {
        content: only.content.clone(),
        images: only.images.clone(),
        model: only.model.clone(),
        usage: only.usage,
        candidates: vec![only],
        fused: false,
        calls,
    }
}

/// At most `max` characters, with an ellipsis when something was cut.
pub(crate) fn clip(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let mut clipped: String = trimmed.chars().take(max).collect();
    clipped.push('…');
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::upstream::MockExecutor;

    const FUSION: &str = "fusion/model";

    fn config(models: &[&str]) -> EnsembleConfig {
        EnsembleConfig {
            models: models.iter().map(|m| m.to_string()).collect(),
            fusion_model: FUSION.into(),
            fusion_temperature: 0.2,
            history_turns: 2,
            turn_chars: 20,
            answer_chars: 50,
            max_snippets: 1,
            snippet_chars: 10,
        }
    }

    fn orchestrator(executor: MockExecutor, models: &[&str]) -> (EnsembleOrchestrator, Arc<MockExecutor>) {
        let executor = Arc::new(executor);
        let orchestrator = EnsembleOrchestrator::new(
            executor.clone(),
            Arc::new(AdmissionGate::static_key("sk")),
            config(models),
            Duration::from_secs(120),
        );
        (orchestrator, executor)
    }

    fn request() -> EnsembleRequest {
        EnsembleRequest {
            messages: vec![
                ChatMessage::user("first question"),
                ChatMessage::assistant("first answer", "m"),
                ChatMessage::user("what is rust?"),
            ],
            prompt: "what is rust?".into(),
            snippets: vec!["Rust is a systems language".into(), "ignored".into()],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn two_of_three_succeed_and_are_fused() {
        let (orchestrator, executor) = orchestrator(
            MockExecutor::new()
                .with_reply("a", "answer a", TokenUsage::new(10, 5))
                .with_reply("b", "answer b", TokenUsage::new(20, 10))
                .with_delay("c", Duration::from_secs(600))
                .with_reply(FUSION, "fused", TokenUsage::new(100, 20)),
            &["a", "b", "c"],
        );

        let outcome = orchestrator.run(&request()).await.unwrap();

        assert_eq!(outcome.model, ENSEMBLE_MODEL);
        assert!(outcome.fused);
        assert_eq!(outcome.content, "fused");
        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(
            outcome.usage,
            TokenUsage::new(10, 5) + TokenUsage::new(20, 10) + TokenUsage::new(100, 20)
        );
        assert_eq!(outcome.calls.len(), 3);

        let fusion_calls = executor.calls_for(FUSION);
        assert_eq!(fusion_calls.len(), 1);
        assert_eq!(fusion_calls[0].temperature, Some(0.2));
    }

    #[tokio::test]
    async fn single_success_is_returned_without_fusion() {
        let (orchestrator, executor) = orchestrator(
            MockExecutor::new().with_reply("only", "just me", TokenUsage::new(4, 4)),
            &["only"],
        );

        let outcome = orchestrator.run(&request()).await.unwrap();

        assert_eq!(outcome.model, "only");
        assert_eq!(outcome.content, "just me");
        assert!(!outcome.fused);
        assert_eq!(outcome.usage, TokenUsage::new(4, 4));
        assert!(executor.calls_for(FUSION).is_empty());
    }

    #[tokio::test]
    async fn all_failures_exhaust_the_ensemble() {
        let (orchestrator, executor) = orchestrator(
            MockExecutor::new().with_failure("a", 500).with_failure("b", 503),
            &["a", "b"],
        );

        let err = orchestrator.run(&request()).await.unwrap_err();

        assert!(matches!(err, GatewayError::EnsembleExhausted { attempted: 2 }));
        assert!(executor.calls_for(FUSION).is_empty());
    }

    #[tokio::test]
    async fn candidates_follow_configured_order_not_arrival() {
        let (orchestrator, _) = orchestrator(
            MockExecutor::new()
                .with_reply("slow", "s", TokenUsage::default())
                .with_delay("slow", Duration::from_millis(50))
                .with_reply("fast", "f", TokenUsage::default()),
            &["slow", "fast", "slow"],
        );

        let outcome = orchestrator.run(&request()).await.unwrap();
        let order: Vec<&str> = outcome.candidates.iter().map(|c| c.model.as_str()).collect();

        assert_eq!(order, vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn fusion_failure_falls_back_to_first_candidate() {
        let (orchestrator, _) = orchestrator(
            MockExecutor::new()
                .with_reply("a", "answer a", TokenUsage::new(1, 1))
                .with_reply("b", "answer b", TokenUsage::new(2, 2))
                .with_failure(FUSION, 502),
            &["a", "b"],
        );

        let outcome = orchestrator.run(&request()).await.unwrap();

        assert_eq!(outcome.model, "a");
        assert_eq!(outcome.content, "answer a");
        assert!(!outcome.fused);
        assert_eq!(outcome.usage, TokenUsage::new(3, 3));
    }

    #[tokio::test]
    async fn fusion_prompt_is_bounded_and_labelled() {
        let long_answer = "x".repeat(200);
        let (orchestrator, executor) = orchestrator(
            MockExecutor::new()
                .with_reply("a", &long_answer, TokenUsage::default())
                .with_reply("b", "short", TokenUsage::default()),
            &["a", "b"],
        );

        orchestrator.run(&request()).await.unwrap();

        let fusion = &executor.calls_for(FUSION)[0];
        assert_eq!(fusion.messages[0].role, Role::System);
        let prompt = fusion.messages[1].content.text();
        assert!(prompt.contains("#1 (a):"));
        assert!(prompt.contains("#2 (b):\nshort"));
        assert!(prompt.contains(&format!("{}…", "x".repeat(50))));
        assert!(!prompt.contains(&"x".repeat(51)));
        assert!(prompt.contains("[1] Rust is a …"));
        assert!(!prompt.contains("ignored"));
        assert!(prompt.contains("user: first question"));
        assert!(prompt.contains("Latest request:\nwhat is rust?"));
    }

    #[test]
    fn clip_counts_characters() {
        assert_eq!(clip("héllo wörld", 5), "héllo…");
        assert_eq!(clip("  short ", 10), "short");
    }
}
