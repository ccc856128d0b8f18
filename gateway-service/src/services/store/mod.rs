//! Persistence seams.
//!
//! The gateway never talks to a database directly; it goes through these
//! traits so the MongoDB backend and the in-memory backend are
//! interchangeable.

pub mod database;
pub mod memory;

pub use database::GatewayDb;
pub use memory::MemoryStore;

use crate::models::{
    ChatMessage, Conversation, ConversationSummary, Credential, Room, RoomMessage, UsageRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;

/// Append-only usage log queried by sliding windows.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn record(&self, record: &UsageRecord) -> Result<(), AppError>;

    /// Upstream calls made with `credential_id` at or after `since`.
    async fn count_requests_since(
        &self,
        credential_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    /// Total tokens billed to `credential_id` at or after `since`.
    async fn sum_tokens_since(
        &self,
        credential_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    /// Distinct gateway requests made by `user_id` at or after `since`.
    async fn count_user_requests_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, AppError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, AppError>;

    /// Insert a conversation that does not exist yet.
    async fn create(&self, conversation: &Conversation) -> Result<(), AppError>;

    /// Append messages to the end of an existing conversation and bump
    /// `updated_at`. Concurrent appends never overwrite each other. Returns
    /// `false` when the conversation does not exist.
    async fn append_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
        messages: &[ChatMessage],
        updated_at: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Most recently updated first.
    async fn list(&self, user_id: &str) -> Result<Vec<ConversationSummary>, AppError>;
}

/// Outcome of removing a member from a room.
#[derive(Debug, Clone)]
pub enum MemberRemoval {
    NotFound,
    Remaining(Room),
    /// The last member left; the room and its history are gone.
    Deleted,
}

#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Fails with `Conflict` when the code is already taken.
    async fn create_room(&self, room: &Room) -> Result<(), AppError>;

    async fn find_room(&self, code: &str) -> Result<Option<Room>, AppError>;

    async fn rooms_for_member(&self, user_id: &str) -> Result<Vec<Room>, AppError>;

    /// Idempotent. Returns the updated room, or `None` if it does not exist.
    async fn add_member(&self, code: &str, user_id: &str) -> Result<Option<Room>, AppError>;

    /// Deletes the room together with its history when the member set
    /// becomes empty.
    async fn remove_member(&self, code: &str, user_id: &str) -> Result<MemberRemoval, AppError>;

    async fn set_system_prompt(
        &self,
        code: &str,
        system_prompt: Option<String>,
    ) -> Result<bool, AppError>;

    async fn append_message(&self, message: &RoomMessage) -> Result<(), AppError>;

    /// Oldest first. With a limit, only the newest `limit` messages.
    async fn list_messages(
        &self,
        code: &str,
        limit: Option<usize>,
    ) -> Result<Vec<RoomMessage>, AppError>;

    async fn last_message(&self, code: &str) -> Result<Option<RoomMessage>, AppError>;

    async fn clear_messages(&self, code: &str) -> Result<u64, AppError>;
}

/// Upstream credential pool. Read-only to the gateway.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn list_credentials(&self) -> Result<Vec<Credential>, AppError>;
}

#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn ping(&self) -> Result<(), AppError>;
}

/// All store handles, backed by one concrete backend.
#[derive(Clone)]
pub struct Stores {
    pub usage: Arc<dyn UsageStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub rooms: Arc<dyn RoomStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub health: Arc<dyn StoreHealth>,
}

impl Stores {
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: UsageStore + ConversationStore + RoomStore + CredentialStore + StoreHealth + 'static,
    {
        Self {
            usage: backend.clone(),
            conversations: backend.clone(),
            rooms: backend.clone(),
            credentials: backend.clone(),
            health: backend,
        }
    }
}
