//! Model selection per request and mode.
//!
//! In `general` and `manual` mode without an explicit choice a small, fast
//! model is asked to pick from the catalog. Whatever goes wrong there is
//! absorbed as a [`RouterFallback`] and the default model is used.

use crate::config::{CatalogModel, RoutingConfig};
use crate::models::{ChatMessage, Mode};
use crate::services::admission::AdmissionGate;
use crate::services::ensemble::CallUsage;
use crate::services::metrics;
use crate::services::upstream::{CompletionExecutor, CompletionRequest};
use serde_json::json;
use std::sync::Arc;

const MAX_ROUTED_TEXT: usize = 2000;

const SELECTION_RULES: &str = "\
You route chat requests to the best model from the catalog below.
Rules:
- If the user asks to generate, draw or edit an image, pick a model with modality \"image\".
- If the request has attachments, pick a model with modality \"multimodal\".
- If the request needs careful reasoning, maths or code, pick the strongest reasoning model.
- Otherwise pick a fast general model.
Reply with the model id only, nothing else.";

/// What the caller asked for.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    pub text: &'a str,
    pub has_attachments: bool,
    pub mode: Mode,
    pub explicit_model: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Single(String),
    /// Fan out to the configured ensemble.
    Ensemble,
}

/// A routing decision plus the router call it cost, if one was made.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub decision: RouteDecision,
    pub call: Option<CallUsage>,
}

impl Routed {
    fn fixed(decision: RouteDecision) -> Self {
        Self {
            decision,
            call: None,
        }
    }
}

/// Why the router model could not decide. Never surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterFallback {
    Admission,
    Upstream(String),
    Timeout,
    Unparseable(String),
}

impl RouterFallback {
    fn reason(&self) -> &'static str {
        match self {
            RouterFallback::Admission => "admission",
            RouterFallback::Upstream(_) => "upstream",
            RouterFallback::Timeout => "timeout",
            RouterFallback::Unparseable(_) => "unparseable",
        }
    }
}

pub struct ModelRouter {
    executor: Arc<dyn CompletionExecutor>,
    gate: Arc<AdmissionGate>,
    config: RoutingConfig,
}

impl ModelRouter {
    pub fn new(
        executor: Arc<dyn CompletionExecutor>,
        gate: Arc<AdmissionGate>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            executor,
            gate,
            config,
        }
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    #[tracing::instrument(skip(self, request), fields(mode = %request.mode))]
    pub async fn resolve(&self, request: RouteRequest<'_>) -> Routed {
        let explicit = request
            .explicit_model
            .map(str::trim)
            .filter(|m| !m.is_empty());

        match request.mode {
            Mode::Ultimate => Routed::fixed(RouteDecision::Ensemble),
            Mode::Precise => Routed::fixed(RouteDecision::Single(self.config.precise_model.clone())),
            Mode::Turbo => Routed::fixed(RouteDecision::Single(self.config.turbo_model.clone())),
            Mode::General | Mode::Manual => {
                if let Some(model) = explicit {
                    return Routed::fixed(RouteDecision::Single(model.to_string()));
                }
                self.ask_router(request.text, request.has_attachments).await
            }
        }
    }

    async fn ask_router(&self, text: &str, has_attachments: bool) -> Routed {
        let mut call = None;
        match self.query_router(text, has_attachments, &mut call).await {
            Ok(model) => {
                tracing::debug!(model = %model, "Router selected model");
                Routed {
                    decision: RouteDecision::Single(model),
                    call,
                }
            }
            Err(fallback) => {
                tracing::warn!(
                    ?fallback,
                    model = %self.config.default_model,
                    "Router fell back to default model"
                );
                metrics::record_router_fallback(fallback.reason());
                Routed {
                    decision: RouteDecision::Single(self.config.default_model.clone()),
                    call,
                }
            }
        }
    }

    /// `call` is filled in as soon as the router model answered, even when
    /// the answer turns out to be unusable.
    async fn query_router(
        &self,
        text: &str,
        has_attachments: bool,
        call: &mut Option<CallUsage>,
    ) -> Result<String, RouterFallback> {
        let credential = self
            .gate
            .admit()
            .await
            .map_err(|_| RouterFallback::Admission)?;

        let request = CompletionRequest::new(
            &self.config.router_model,
            vec![
                ChatMessage::system(router_prompt(&self.config.catalog)),
                ChatMessage::user(describe_request(text, has_attachments)),
            ],
        )
        .with_temperature(0.0)
        .with_timeout(self.config.router_timeout());

        let completion = tokio::time::timeout(
            self.config.router_timeout(),
            self.executor.complete(&credential, &request),
        )
        .await
        .map_err(|_| RouterFallback::Timeout)?
        .map_err(|e| RouterFallback::Upstream(e.to_string()))?;

        *call = Some(CallUsage {
            credential_id: credential.id.clone(),
            model: self.config.router_model.clone(),
            usage: completion.usage,
        });

        pick_model(&completion.content, &self.config.catalog)
            .ok_or(RouterFallback::Unparseable(completion.content))
    }
}

fn router_prompt(catalog: &[CatalogModel]) -> String {
    let entries: Vec<_> = catalog
        .iter()
        .map(|m| json!({ "id": m.id, "name": m.name, "modality": m.modality.as_str() }))
        .collect();
    format!(
        "{}\n\nCatalog:\n{}",
        SELECTION_RULES,
        serde_json::Value::Array(entries)
    )
}

fn describe_request(text: &str, has_attachments: bool) -> String {
    let clipped: String = text.chars().take(MAX_ROUTED_TEXT).collect();
    if has_attachments {
        format!("[request has image attachments]\n{}", clipped)
    } else {
        clipped
    }
}

/// Catalog id named by the router reply. An exact answer wins; otherwise the
/// longest id mentioned anywhere in the reply.
pub(crate) fn pick_model(reply: &str, catalog: &[CatalogModel]) -> Option<String> {
    let cleaned = reply
        .trim()
        .trim_matches(|c: char| c == '`' || c == '"' || c == '\'' || c == '.')
        .trim();
    if cleaned.is_empty() {
        return None;
    }

    if let Some(exact) = catalog.iter().find(|m| m.id == cleaned) {
        return Some(exact.id.clone());
    }

    catalog
        .iter()
        .filter(|m| cleaned.contains(m.id.as_str()))
        .max_by_key(|m| m.id.len())
        .map(|m| m.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Modality;
    use crate::models::TokenUsage;
    use crate::services::upstream::MockExecutor;
    use std::time::Duration;

    const ROUTER: &str = "router/fast";

    fn catalog() -> Vec<CatalogModel> {
        vec![
            CatalogModel {
                id: "openai/gpt-4o".into(),
                name: "GPT-4o".into(),
                modality: Modality::Multimodal,
            },
            CatalogModel {
                id: "openai/gpt-4o-mini".into(),
                name: "GPT-4o mini".into(),
                modality: Modality::Text,
            },
        ]
    }

    fn config() -> RoutingConfig {
        RoutingConfig {
            router_model: ROUTER.into(),
            router_timeout_secs: 10,
            default_model: "default/model".into(),
            precise_model: "precise/model".into(),
            turbo_model: "turbo/model".into(),
            catalog: catalog(),
        }
    }

    fn router(executor: MockExecutor) -> (ModelRouter, Arc<MockExecutor>) {
        let executor = Arc::new(executor);
        let router = ModelRouter::new(
            executor.clone(),
            Arc::new(AdmissionGate::static_key("sk")),
            config(),
        );
        (router, executor)
    }

    fn general(text: &str) -> RouteRequest<'_> {
        RouteRequest {
            text,
            has_attachments: false,
            mode: Mode::General,
            explicit_model: None,
        }
    }

    #[test]
    fn pick_model_prefers_exact_then_longest_mention() {
        let catalog = catalog();
        assert_eq!(
            pick_model("`openai/gpt-4o`", &catalog).as_deref(),
            Some("openai/gpt-4o")
        );
        assert_eq!(
            pick_model("I would use openai/gpt-4o-mini here.", &catalog).as_deref(),
            Some("openai/gpt-4o-mini")
        );
        assert_eq!(pick_model("no idea", &catalog), None);
        assert_eq!(pick_model("   ", &catalog), None);
    }

    #[tokio::test]
    async fn fixed_modes_skip_the_router_model() {
        let (router, executor) = router(MockExecutor::new());

        for (mode, expected) in [
            (Mode::Precise, RouteDecision::Single("precise/model".into())),
            (Mode::Turbo, RouteDecision::Single("turbo/model".into())),
            (Mode::Ultimate, RouteDecision::Ensemble),
        ] {
            let routed = router
                .resolve(RouteRequest {
                    mode,
                    ..general("hello")
                })
                .await;
            assert_eq!(routed.decision, expected);
            assert!(routed.call.is_none());
        }

        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn explicit_choice_is_used_verbatim() {
        let (router, executor) = router(MockExecutor::new());
        let routed = router
            .resolve(RouteRequest {
                mode: Mode::Manual,
                explicit_model: Some("vendor/custom"),
                ..general("hello")
            })
            .await;

        assert_eq!(routed.decision, RouteDecision::Single("vendor/custom".into()));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn router_reply_selects_catalog_model() {
        let (router, executor) = router(
            MockExecutor::new().with_reply(ROUTER, "openai/gpt-4o", TokenUsage::new(50, 3)),
        );

        let routed = router
            .resolve(RouteRequest {
                has_attachments: true,
                ..general("what is in this picture?")
            })
            .await;

        assert_eq!(routed.decision, RouteDecision::Single("openai/gpt-4o".into()));
        assert_eq!(
            routed.call.map(|c| c.usage),
            Some(TokenUsage::new(50, 3))
        );
        let calls = executor.calls_for(ROUTER);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].temperature, Some(0.0));
        assert!(calls[0].messages[1].content.text().contains("attachments"));
    }

    #[tokio::test]
    async fn garbled_reply_falls_back() {
        let (router, _) = router(MockExecutor::new().with_reply(
            ROUTER,
            "I think a big model",
            TokenUsage::default(),
        ));
        assert_eq!(
            router.resolve(general("hi")).await.decision,
            RouteDecision::Single("default/model".into())
        );
    }

    #[tokio::test]
    async fn upstream_failure_falls_back() {
        let (router, _) = router(MockExecutor::new().with_failure(ROUTER, 500));
        assert_eq!(
            router.resolve(general("hi")).await.decision,
            RouteDecision::Single("default/model".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_router_falls_back_after_timeout() {
        let (router, _) = router(
            MockExecutor::new()
                .with_reply(ROUTER, "openai/gpt-4o", TokenUsage::default())
                .with_delay(ROUTER, Duration::from_secs(30)),
        );
        assert_eq!(
            router.resolve(general("hi")).await.decision,
            RouteDecision::Single("default/model".into())
        );
    }
}
