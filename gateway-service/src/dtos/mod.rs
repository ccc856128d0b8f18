pub mod chat;
pub mod rooms;

pub use chat::{
    ChatCompletionRequest, ChatCompletionResponse, ConversationListResponse, ConversationResponse,
};
pub use rooms::{
    CreateRoomRequest, JoinRoomRequest, PostMessageRequest, RoomListResponse, RoomResponse,
    SystemPromptRequest, SystemPromptResponse,
};
