use crate::dtos::{
    ChatCompletionRequest, ChatCompletionResponse, ConversationListResponse, ConversationResponse,
};
use crate::error::GatewayError;
use crate::handlers::sse_event;
use crate::middleware::UserId;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use std::convert::Infallible;
use validator::Validate;

/// Blocking completion, or an SSE relay when `stream` is set.
#[tracing::instrument(skip(state, user_id, request), fields(user_id = %user_id.0, mode = %request.mode, stream = request.stream))]
pub async fn completions(
    State(state): State<AppState>,
    user_id: UserId,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, GatewayError> {
    request.validate()?;
    let streaming = request.stream;
    let request = request.into_chat_request(user_id.0);

    if streaming {
        let events = state.chat.stream(request).await?;
        let frames = events.map(|event| Ok::<_, Infallible>(sse_event(&event)));
        return Ok(Sse::new(frames)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let response = state.chat.complete(request).await?;
    Ok(Json(ChatCompletionResponse::from(response)).into_response())
}

pub async fn list_conversations(
    State(state): State<AppState>,
    user_id: UserId,
) -> Result<Json<ConversationListResponse>, GatewayError> {
    let conversations = state.chat.list_conversations(&user_id.0).await?;
    Ok(Json(ConversationListResponse { conversations }))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    user_id: UserId,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationResponse>, GatewayError> {
    let conversation = state
        .chat
        .get_conversation(&user_id.0, &conversation_id)
        .await?;
    Ok(Json(conversation.into()))
}
