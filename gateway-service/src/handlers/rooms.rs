use crate::dtos::{
    CreateRoomRequest, JoinRoomRequest, PostMessageRequest, RoomListResponse, RoomResponse,
    SystemPromptRequest, SystemPromptResponse,
};
use crate::error::GatewayError;
use crate::handlers::sse_event;
use crate::middleware::UserId;
use crate::models::RoomMessage;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{sse::Sse, IntoResponse},
    Json,
};
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use validator::Validate;

#[tracing::instrument(skip(state, user_id, request), fields(user_id = %user_id.0))]
pub async fn create_room(
    State(state): State<AppState>,
    user_id: UserId,
    Json(request): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomResponse>), GatewayError> {
    request.validate()?;
    let room = state
        .rooms
        .create(&user_id.0, &request.name, request.system_prompt)
        .await?;
    Ok((StatusCode::CREATED, Json(room.into())))
}

pub async fn list_rooms(
    State(state): State<AppState>,
    user_id: UserId,
) -> Result<Json<RoomListResponse>, GatewayError> {
    let rooms = state.rooms.list(&user_id.0).await?;
    Ok(Json(RoomListResponse { rooms }))
}

pub async fn join_room(
    State(state): State<AppState>,
    user_id: UserId,
    Json(request): Json<JoinRoomRequest>,
) -> Result<Json<RoomResponse>, GatewayError> {
    request.validate()?;
    let room = state.rooms.join(&user_id.0, &request.code).await?;
    Ok(Json(room.into()))
}

pub async fn get_room(
    State(state): State<AppState>,
    user_id: UserId,
    Path(code): Path<String>,
) -> Result<Json<RoomResponse>, GatewayError> {
    let view = state.rooms.get(&user_id.0, &code).await?;
    Ok(Json(view.into()))
}

pub async fn leave_room(
    State(state): State<AppState>,
    user_id: UserId,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    state.rooms.leave(&user_id.0, &code).await?;
    Ok(Json(json!({ "status": "left", "code": code })))
}

/// Returns once the message is stored and broadcast; the agent reply follows
/// on the live feed.
pub async fn post_message(
    State(state): State<AppState>,
    user_id: UserId,
    Path(code): Path<String>,
    Json(request): Json<PostMessageRequest>,
) -> Result<(StatusCode, Json<RoomMessage>), GatewayError> {
    request.validate()?;
    let message = state
        .rooms
        .post_message(&user_id.0, &code, &request.content)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(message)))
}

pub async fn update_system_prompt(
    State(state): State<AppState>,
    user_id: UserId,
    Path(code): Path<String>,
    Json(request): Json<SystemPromptRequest>,
) -> Result<Json<SystemPromptResponse>, GatewayError> {
    request.validate()?;
    let system_prompt = state
        .rooms
        .update_system_prompt(&user_id.0, &code, request.system_prompt)
        .await?;
    Ok(Json(SystemPromptResponse { system_prompt }))
}

pub async fn clear_room(
    State(state): State<AppState>,
    user_id: UserId,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let removed = state.rooms.clear(&user_id.0, &code).await?;
    Ok(Json(json!({ "status": "cleared", "removed": removed })))
}

/// Live room feed. Heartbeats are `ping` events from the bus itself.
pub async fn room_stream(
    State(state): State<AppState>,
    user_id: UserId,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let events = state.rooms.subscribe(&user_id.0, &code).await?;
    let frames = events.map(|event| Ok::<_, Infallible>(sse_event(&event)));
    Ok(Sse::new(frames))
}
