//! The shared request-orchestration components, wired once from config.

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::models::{TokenUsage, UsageRecord};
use crate::services::admission::AdmissionGate;
use crate::services::ensemble::{CallUsage, EnsembleOrchestrator};
use crate::services::pricing::{PricingCatalog, StaticPricing};
use crate::services::router::ModelRouter;
use crate::services::store::Stores;
use crate::services::upstream::CompletionExecutor;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

const QUOTA_WINDOW_SECS: i64 = 60;

#[derive(Clone)]
pub struct Engine {
    pub stores: Stores,
    pub gate: Arc<AdmissionGate>,
    pub router: Arc<ModelRouter>,
    pub ensemble: Arc<EnsembleOrchestrator>,
    pub executor: Arc<dyn CompletionExecutor>,
    pub pricing: Arc<dyn PricingCatalog>,
    pub completion_timeout: Duration,
}

impl Engine {
    pub fn new(
        config: &GatewayConfig,
        stores: Stores,
        executor: Arc<dyn CompletionExecutor>,
    ) -> Self {
        let gate = Arc::new(match &config.upstream.api_key {
            Some(key) => {
                tracing::info!("Static upstream key configured, credential rotation disabled");
                AdmissionGate::static_key(key)
            }
            None => AdmissionGate::pooled(stores.credentials.clone(), stores.usage.clone()),
        });

        let completion_timeout = config.upstream.timeout();
        let router = Arc::new(ModelRouter::new(
            executor.clone(),
            gate.clone(),
            config.routing.clone(),
        ));
        let ensemble = Arc::new(EnsembleOrchestrator::new(
            executor.clone(),
            gate.clone(),
            config.ensemble.clone(),
            completion_timeout,
        ));

        Self {
            stores,
            gate,
            router,
            ensemble,
            executor,
            pricing: Arc::new(StaticPricing::new(config.pricing.clone())),
            completion_timeout,
        }
    }

    /// Append one usage record per call. Returns the summed cost.
    pub async fn record_calls(
        &self,
        request_id: &str,
        user_id: Option<&str>,
        calls: &[CallUsage],
    ) -> Result<f64, GatewayError> {
        let mut total = 0.0;
        for call in calls {
            let cost = self.pricing.cost(&call.model, &call.usage);
            total += cost;
            self.stores
                .usage
                .record(&UsageRecord::new(
                    request_id,
                    call.credential_id.as_str(),
                    user_id.map(str::to_string),
                    call.model.as_str(),
                    call.usage,
                    cost,
                ))
                .await?;
        }
        Ok(total)
    }

    /// Fails with `RateLimited` once `user_id` made `requests_per_minute`
    /// requests in the trailing minute. 0 means unlimited.
    pub async fn check_caller_quota(
        &self,
        user_id: &str,
        requests_per_minute: u32,
    ) -> Result<(), GatewayError> {
        if requests_per_minute == 0 {
            return Ok(());
        }

        let since = Utc::now() - chrono::Duration::seconds(QUOTA_WINDOW_SECS);
        let recent = self
            .stores
            .usage
            .count_user_requests_since(user_id, since)
            .await?;

        if recent >= requests_per_minute as u64 {
            tracing::warn!(user_id = %user_id, recent, "Caller quota exceeded");
            return Err(GatewayError::RateLimited {
                retry_after: QUOTA_WINDOW_SECS as u64,
            });
        }
        Ok(())
    }

    pub fn total_usage(calls: &[CallUsage]) -> TokenUsage {
        calls.iter().map(|c| c.usage).sum()
    }
}
