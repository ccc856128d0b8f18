//! Pass-through of raw chat-completions bodies for API clients that speak
//! the OpenAI protocol themselves.

use crate::error::GatewayError;
use crate::services::engine::Engine;
use crate::services::ensemble::CallUsage;
use crate::services::upstream::Forwarded;
use serde_json::Value;

#[derive(Clone)]
pub struct ProxyService {
    engine: Engine,
    requests_per_minute: u32,
}

impl ProxyService {
    pub fn new(engine: Engine, requests_per_minute: u32) -> Self {
        Self {
            engine,
            requests_per_minute,
        }
    }

    /// Forward `body` unchanged on an admitted credential and record the
    /// upstream-reported usage. The upstream status is passed back as-is.
    #[tracing::instrument(skip(self, body))]
    pub async fn forward(&self, user_id: &str, body: Value) -> Result<Forwarded, GatewayError> {
        if !body.is_object() {
            return Err(GatewayError::InvalidRequest(
                "request body must be a JSON object".to_string(),
            ));
        }

        self.engine
            .check_caller_quota(user_id, self.requests_per_minute)
            .await?;
        let credential = self.engine.gate.admit().await?;
        let forwarded = self.engine.executor.forward(&credential, &body).await?;

        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let request_id = uuid::Uuid::new_v4().to_string();
        self.engine
            .record_calls(
                &request_id,
                Some(user_id),
                &[CallUsage {
                    credential_id: credential.id,
                    model: model.clone(),
                    usage: forwarded.usage,
                }],
            )
            .await?;

        tracing::info!(
            model = %model,
            status = forwarded.status,
            total_tokens = forwarded.usage.total_tokens,
            "Proxied completion"
        );
        Ok(forwarded)
    }
}
