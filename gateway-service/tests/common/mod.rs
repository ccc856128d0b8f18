#![allow(dead_code)]

use gateway_service::config::{CatalogModel, GatewayConfig, Modality};
use gateway_service::models::Credential;
use gateway_service::startup::Application;
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_USER_ID: &str = "test_user_123";
pub const ROUTER_MODEL: &str = "test/router";
pub const DEFAULT_MODEL: &str = "test/default";
pub const PRECISE_MODEL: &str = "test/precise";
pub const TURBO_MODEL: &str = "test/turbo";
pub const FUSION_MODEL: &str = "test/fusion";
pub const ENSEMBLE_MODELS: [&str; 2] = ["test/cand-a", "test/cand-b"];

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub upstream: MockServer,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn against a fresh wiremock upstream. `tweak` runs after the
    /// test defaults are applied.
    pub async fn spawn_with(tweak: impl FnOnce(&mut GatewayConfig)) -> Self {
        std::env::set_var("STORE_BACKEND", "memory");

        let upstream = MockServer::start().await;

        let mut config = GatewayConfig::load().expect("Failed to load configuration");
        config.common.port = 0; // Random port for testing
        config.upstream.base_url = upstream.uri();
        config.upstream.api_key = None;
        config.upstream.credentials = vec![Credential::new("key-1", "sk-test")];
        config.upstream.timeout_secs = 5;
        config.routing.router_model = ROUTER_MODEL.into();
        config.routing.default_model = DEFAULT_MODEL.into();
        config.routing.precise_model = PRECISE_MODEL.into();
        config.routing.turbo_model = TURBO_MODEL.into();
        config.routing.catalog = [DEFAULT_MODEL, PRECISE_MODEL, TURBO_MODEL]
            .iter()
            .map(|id| CatalogModel {
                id: id.to_string(),
                name: id.to_string(),
                modality: Modality::Text,
            })
            .collect();
        config.ensemble.models = ENSEMBLE_MODELS.iter().map(|m| m.to_string()).collect();
        config.ensemble.fusion_model = FUSION_MODEL.into();
        config.quota.requests_per_minute = 60;
        config.quota.ultimate_allowed_users = vec!["*".into()];
        config.rooms.heartbeat_secs = 20;
        tweak(&mut config);

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");
        let port = app.http_port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            upstream,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub async fn post_json(&self, path: &str, user: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("X-User-ID", user)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get(&self, path: &str, user: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("X-User-ID", user)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Blocking reply for `model`.
    pub async fn mock_reply(&self, model: &str, content: &str, prompt: u32, completion: u32) {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"model": model, "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": content}}],
                "usage": {
                    "prompt_tokens": prompt,
                    "completion_tokens": completion,
                    "total_tokens": prompt + completion
                }
            })))
            .mount(&self.upstream)
            .await;
    }

    /// Streamed reply for `model`, one frame per delta, ending in `[DONE]`.
    pub async fn mock_stream(&self, model: &str, deltas: &[&str], prompt: u32, completion: u32) {
        let mut body: String = deltas
            .iter()
            .map(|d| {
                format!(
                    "data: {}\n\n",
                    json!({"choices": [{"delta": {"content": d}}]})
                )
            })
            .collect();
        body.push_str(&format!(
            "data: {}\n\n",
            json!({"choices": [], "usage": {
                "prompt_tokens": prompt,
                "completion_tokens": completion,
                "total_tokens": prompt + completion
            }})
        ));
        body.push_str("data: [DONE]\n\n");

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"model": model, "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&self.upstream)
            .await;
    }

    pub async fn mock_failure(&self, model: &str, status: u16) {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"model": model})))
            .respond_with(ResponseTemplate::new(status).set_body_string("upstream exploded"))
            .mount(&self.upstream)
            .await;
    }

    /// Router model picks `choice`.
    pub async fn mock_router(&self, choice: &str) {
        self.mock_reply(ROUTER_MODEL, choice, 20, 2).await;
    }
}

/// Split an SSE body into its JSON `data` payloads.
pub fn sse_payloads(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty())
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect()
}
