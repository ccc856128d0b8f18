//! Admission control over upstream credentials.
//!
//! Usage is never cached: every decision re-reads the usage store, so two
//! gateway replicas sharing one store agree on what is eligible.

use crate::error::GatewayError;
use crate::models::Credential;
use crate::services::store::{CredentialStore, UsageStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

/// Identifier used for the static override credential in usage records.
pub const STATIC_CREDENTIAL_ID: &str = "static";

enum AdmissionMode {
    /// One configured key, no rotation and no caps.
    Static(Credential),
    Pooled {
        credentials: Arc<dyn CredentialStore>,
        usage: Arc<dyn UsageStore>,
    },
}

pub struct AdmissionGate {
    mode: AdmissionMode,
}

impl AdmissionGate {
    pub fn static_key(secret: &str) -> Self {
        Self {
            mode: AdmissionMode::Static(Credential::new(STATIC_CREDENTIAL_ID, secret)),
        }
    }

    pub fn pooled(credentials: Arc<dyn CredentialStore>, usage: Arc<dyn UsageStore>) -> Self {
        Self {
            mode: AdmissionMode::Pooled { credentials, usage },
        }
    }

    /// Eligible credentials, least loaded first.
    ///
    /// A credential is excluded once its trailing-60 s request count or its
    /// tokens for the current UTC day reach a non-zero cap.
    #[tracing::instrument(skip(self))]
    pub async fn eligible(&self) -> Result<Vec<Credential>, GatewayError> {
        let (credentials, usage) = match &self.mode {
            AdmissionMode::Static(credential) => return Ok(vec![credential.clone()]),
            AdmissionMode::Pooled { credentials, usage } => (credentials, usage),
        };

        let now = Utc::now();
        let minute_ago = now - Duration::seconds(60);
        let day_start = start_of_day(now);

        let mut ranked: Vec<(Credential, u64, u64)> = Vec::new();
        for credential in credentials.list_credentials().await? {
            if !credential.enabled {
                continue;
            }

            let window_count = usage
                .count_requests_since(&credential.id, minute_ago)
                .await?;
            if credential.requests_per_minute > 0
                && window_count >= credential.requests_per_minute as u64
            {
                tracing::debug!(
                    credential_id = %credential.id,
                    window_count,
                    "Credential at per-minute cap"
                );
                continue;
            }

            let day_tokens = usage.sum_tokens_since(&credential.id, day_start).await?;
            if credential.tokens_per_day > 0 && day_tokens >= credential.tokens_per_day {
                tracing::debug!(
                    credential_id = %credential.id,
                    day_tokens,
                    "Credential at daily token cap"
                );
                continue;
            }

            ranked.push((credential, window_count, day_tokens));
        }

        ranked.sort_by_key(|(_, count, tokens)| (*count, *tokens));

        if ranked.is_empty() {
            tracing::warn!("No eligible upstream credential");
            return Err(GatewayError::AdmissionDenied);
        }

        Ok(ranked.into_iter().map(|(c, _, _)| c).collect())
    }

    /// The least loaded eligible credential.
    pub async fn admit(&self) -> Result<Credential, GatewayError> {
        let credential = self
            .eligible()
            .await?
            .into_iter()
            .next()
            .ok_or(GatewayError::AdmissionDenied)?;
        tracing::debug!(credential_id = %credential.id, "Credential admitted");
        Ok(credential)
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(now)
}
