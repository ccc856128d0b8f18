use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use service_core::error::{error_response, AppError, ErrorResponse};
use thiserror::Error;

/// Failures visible to callers of the gateway.
///
/// A router failure is deliberately absent: it is absorbed inside the model
/// router and never reaches this type.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No upstream credential is currently available")]
    AdmissionDenied,

    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("All {attempted} ensemble candidates failed")]
    EnsembleExhausted { attempted: usize },

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: u64 },

    #[error("Not entitled: {0}")]
    EntitlementDenied(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Internal(#[from] AppError),
}

impl GatewayError {
    /// HTTP status of the upstream reply, when one was received.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            GatewayError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Status code used in error payloads, including terminal stream events.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AdmissionDenied => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream { .. }
            | GatewayError::UpstreamTransport(_)
            | GatewayError::EnsembleExhausted { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::EntitlementDenied(_) | GatewayError::Forbidden(_) => {
                StatusCode::FORBIDDEN
            }
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Internal(err) = self {
            return err.into_response();
        }

        let status = self.status_code();
        let retry_after = match &self {
            GatewayError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        let details = match &self {
            GatewayError::Upstream { body, .. } if !body.is_empty() => Some(body.clone()),
            _ => None,
        };
        let error = match &self {
            GatewayError::Upstream { status, .. } => format!("Upstream returned {}", status),
            other => other.to_string(),
        };

        error_response(
            status,
            ErrorResponse {
                error,
                details,
                upstream_status: self.upstream_status(),
            },
            retry_after,
        )
    }
}

impl From<validator::ValidationErrors> for GatewayError {
    fn from(err: validator::ValidationErrors) -> Self {
        GatewayError::Internal(AppError::ValidationError(err))
    }
}
