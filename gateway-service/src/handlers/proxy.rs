use crate::error::GatewayError;
use crate::middleware::UserId;
use crate::startup::AppState;
use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;

/// Raw OpenAI-compatible pass-through. The upstream status, content type and
/// body come back unchanged.
#[tracing::instrument(skip(state, user_id, body), fields(user_id = %user_id.0))]
pub async fn chat_completions(
    State(state): State<AppState>,
    user_id: UserId,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    let forwarded = state.proxy.forward(&user_id.0, body).await?;

    let status = StatusCode::from_u16(forwarded.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = forwarded
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));

    Ok((status, [(header::CONTENT_TYPE, content_type)], forwarded.body).into_response())
}
