//! Domain models for the gateway service.

pub mod conversation;
pub mod credential;
pub mod message;
pub mod mode;
pub mod room;
pub mod usage;

pub use conversation::{Conversation, ConversationSummary};
pub use credential::Credential;
pub use message::{
    CandidateExcerpt, ChatMessage, ContentPart, ImageUrl, MessageContent, MessageMetadata, Role,
};
pub use mode::Mode;
pub use room::{Room, RoomMessage, RoomSummary};
pub use usage::{TokenUsage, UsageRecord};
