use crate::models::{Room, RoomMessage, RoomSummary};
use crate::services::RoomView;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRoomRequest {
    #[validate(length(min = 1, max = 100, message = "Room name must be 1-100 characters"))]
    pub name: String,

    #[validate(length(max = 8000, message = "System prompt is too long"))]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct JoinRoomRequest {
    #[validate(length(min = 1, max = 16, message = "Invalid room code"))]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PostMessageRequest {
    #[validate(length(min = 1, max = 16000, message = "Message must be 1-16000 characters"))]
    pub content: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SystemPromptRequest {
    /// `null` or blank clears the prompt.
    #[validate(length(max = 8000, message = "System prompt is too long"))]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SystemPromptResponse {
    pub system_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub code: String,
    pub name: String,
    pub system_prompt: Option<String>,
    pub members: Vec<String>,
    pub created_by: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<RoomMessage>>,
}

impl From<Room> for RoomResponse {
    fn from(room: Room) -> Self {
        Self {
            code: room.code,
            name: room.name,
            system_prompt: room.system_prompt,
            members: room.members,
            created_by: room.created_by,
            created_at: room.created_at.to_rfc3339(),
            messages: None,
        }
    }
}

impl From<RoomView> for RoomResponse {
    fn from(view: RoomView) -> Self {
        Self {
            messages: Some(view.messages),
            ..Self::from(view.room)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RoomListResponse {
    pub rooms: Vec<RoomSummary>,
}
