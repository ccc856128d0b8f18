//! In-process store for tests and single-node deployments without MongoDB.

use super::{
    ConversationStore, CredentialStore, MemberRemoval, RoomStore, StoreHealth, UsageStore,
};
use crate::models::{
    ChatMessage, Conversation, ConversationSummary, Credential, Room, RoomMessage, UsageRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct RoomTables {
    rooms: HashMap<String, Room>,
    messages: HashMap<String, Vec<RoomMessage>>,
}

#[derive(Default)]
pub struct MemoryStore {
    usage: RwLock<Vec<UsageRecord>>,
    conversations: RwLock<HashMap<String, Conversation>>,
    // Rooms and their history share one lock so deletion cascades atomically.
    rooms: RwLock<RoomTables>,
    credentials: RwLock<Vec<Credential>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Vec<Credential>) -> Self {
        Self {
            credentials: RwLock::new(credentials),
            ..Self::default()
        }
    }

    /// Snapshot of every usage record, oldest first.
    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.read().await.clone()
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn record(&self, record: &UsageRecord) -> Result<(), AppError> {
        self.usage.write().await.push(record.clone());
        Ok(())
    }

    async fn count_requests_since(
        &self,
        credential_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let usage = self.usage.read().await;
        Ok(usage
            .iter()
            .filter(|r| r.credential_id == credential_id && r.timestamp >= since)
            .count() as u64)
    }

    async fn sum_tokens_since(
        &self,
        credential_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let usage = self.usage.read().await;
        Ok(usage
            .iter()
            .filter(|r| r.credential_id == credential_id && r.timestamp >= since)
            .map(|r| r.total_tokens as u64)
            .sum())
    }

    async fn count_user_requests_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let usage = self.usage.read().await;
        let requests: HashSet<&str> = usage
            .iter()
            .filter(|r| r.user_id.as_deref() == Some(user_id) && r.timestamp >= since)
            .map(|r| r.request_id.as_str())
            .collect();
        Ok(requests.len() as u64)
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn load(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, AppError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .filter(|c| c.user_id == user_id)
            .cloned())
    }

    async fn create(&self, conversation: &Conversation) -> Result<(), AppError> {
        let mut conversations = self.conversations.write().await;
        if conversations.contains_key(&conversation.conversation_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Conversation {} already exists",
                conversation.conversation_id
            )));
        }
        conversations.insert(conversation.conversation_id.clone(), conversation.clone());
        Ok(())
    }

    async fn append_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
        messages: &[ChatMessage],
        updated_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut conversations = self.conversations.write().await;
        match conversations
            .get_mut(conversation_id)
            .filter(|c| c.user_id == user_id)
        {
            Some(conversation) => {
                conversation.messages.extend_from_slice(messages);
                conversation.updated_at = updated_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ConversationSummary>, AppError> {
        let conversations = self.conversations.read().await;
        let mut summaries: Vec<ConversationSummary> = conversations
            .values()
            .filter(|c| c.user_id == user_id)
            .map(ConversationSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn create_room(&self, room: &Room) -> Result<(), AppError> {
        let mut tables = self.rooms.write().await;
        if tables.rooms.contains_key(&room.code) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Room code {} already exists",
                room.code
            )));
        }
        tables.rooms.insert(room.code.clone(), room.clone());
        Ok(())
    }

    async fn find_room(&self, code: &str) -> Result<Option<Room>, AppError> {
        Ok(self.rooms.read().await.rooms.get(code).cloned())
    }

    async fn rooms_for_member(&self, user_id: &str) -> Result<Vec<Room>, AppError> {
        let tables = self.rooms.read().await;
        let mut rooms: Vec<Room> = tables
            .rooms
            .values()
            .filter(|r| r.is_member(user_id))
            .cloned()
            .collect();
        rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rooms)
    }

    async fn add_member(&self, code: &str, user_id: &str) -> Result<Option<Room>, AppError> {
        let mut tables = self.rooms.write().await;
        Ok(tables.rooms.get_mut(code).map(|room| {
            if !room.is_member(user_id) {
                room.members.push(user_id.to_string());
            }
            room.clone()
        }))
    }

    async fn remove_member(&self, code: &str, user_id: &str) -> Result<MemberRemoval, AppError> {
        let mut tables = self.rooms.write().await;
        let Some(room) = tables.rooms.get_mut(code) else {
            return Ok(MemberRemoval::NotFound);
        };

        room.members.retain(|m| m != user_id);
        if !room.members.is_empty() {
            return Ok(MemberRemoval::Remaining(room.clone()));
        }

        tables.rooms.remove(code);
        tables.messages.remove(code);
        Ok(MemberRemoval::Deleted)
    }

    async fn set_system_prompt(
        &self,
        code: &str,
        system_prompt: Option<String>,
    ) -> Result<bool, AppError> {
        let mut tables = self.rooms.write().await;
        match tables.rooms.get_mut(code) {
            Some(room) => {
                room.system_prompt = system_prompt;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append_message(&self, message: &RoomMessage) -> Result<(), AppError> {
        let mut tables = self.rooms.write().await;
        if !tables.rooms.contains_key(&message.room_code) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Room {} not found",
                message.room_code
            )));
        }
        tables
            .messages
            .entry(message.room_code.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn list_messages(
        &self,
        code: &str,
        limit: Option<usize>,
    ) -> Result<Vec<RoomMessage>, AppError> {
        let tables = self.rooms.read().await;
        let messages = tables.messages.get(code).map(Vec::as_slice).unwrap_or(&[]);
        let skip = limit.map_or(0, |l| messages.len().saturating_sub(l));
        Ok(messages[skip..].to_vec())
    }

    async fn last_message(&self, code: &str) -> Result<Option<RoomMessage>, AppError> {
        let tables = self.rooms.read().await;
        Ok(tables.messages.get(code).and_then(|m| m.last().cloned()))
    }

    async fn clear_messages(&self, code: &str) -> Result<u64, AppError> {
        let mut tables = self.rooms.write().await;
        Ok(tables
            .messages
            .remove(code)
            .map_or(0, |m| m.len() as u64))
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn list_credentials(&self) -> Result<Vec<Credential>, AppError> {
        Ok(self.credentials.read().await.clone())
    }
}

#[async_trait]
impl StoreHealth for MemoryStore {
    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenUsage;
    use chrono::Duration;

    #[tokio::test]
    async fn last_member_leaving_deletes_room_and_history() {
        let store = MemoryStore::new();
        let room = Room::new("r", "alice", None);
        let code = room.code.clone();
        store.create_room(&room).await.unwrap();
        store.add_member(&code, "bob").await.unwrap();
        store
            .append_message(&RoomMessage::from_user(&code, "alice", "hi"))
            .await
            .unwrap();

        assert!(matches!(
            store.remove_member(&code, "alice").await.unwrap(),
            MemberRemoval::Remaining(r) if r.members == vec!["bob".to_string()]
        ));
        assert!(matches!(
            store.remove_member(&code, "bob").await.unwrap(),
            MemberRemoval::Deleted
        ));
        assert!(store.find_room(&code).await.unwrap().is_none());
        assert!(store.list_messages(&code, None).await.unwrap().is_empty());
        assert!(matches!(
            store.remove_member(&code, "bob").await.unwrap(),
            MemberRemoval::NotFound
        ));
    }

    #[tokio::test]
    async fn usage_windows() {
        let store = MemoryStore::new();
        let mut old = UsageRecord::new("r0", "k1", None, "m", TokenUsage::new(100, 0), 0.0);
        old.timestamp = Utc::now() - Duration::minutes(5);
        store.record(&old).await.unwrap();
        store
            .record(&UsageRecord::new("r1", "k1", Some("u".into()), "m", TokenUsage::new(10, 5), 0.0))
            .await
            .unwrap();
        store
            .record(&UsageRecord::new("r1", "k1", Some("u".into()), "m", TokenUsage::new(1, 1), 0.0))
            .await
            .unwrap();

        let minute_ago = Utc::now() - Duration::seconds(60);
        assert_eq!(store.count_requests_since("k1", minute_ago).await.unwrap(), 2);
        assert_eq!(
            store
                .sum_tokens_since("k1", Utc::now() - Duration::hours(1))
                .await
                .unwrap(),
            117
        );
        assert_eq!(store.count_user_requests_since("u", minute_ago).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_messages_limit_keeps_newest() {
        let store = MemoryStore::new();
        let room = Room::new("r", "alice", None);
        store.create_room(&room).await.unwrap();
        for i in 0..5 {
            store
                .append_message(&RoomMessage::from_user(&room.code, "alice", format!("m{}", i)))
                .await
                .unwrap();
        }

        let recent = store.list_messages(&room.code, Some(2)).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn appended_messages_accumulate_for_the_owner_only() {
        let store = MemoryStore::new();
        let conversation = Conversation::new("alice", "hello");
        let id = conversation.conversation_id.clone();
        store.create(&conversation).await.unwrap();
        assert!(matches!(
            store.create(&conversation).await,
            Err(AppError::Conflict(_))
        ));

        let later = Utc::now() + Duration::seconds(5);
        assert!(store
            .append_messages("alice", &id, &[ChatMessage::user("one")], later)
            .await
            .unwrap());
        assert!(store
            .append_messages("alice", &id, &[ChatMessage::user("two")], later)
            .await
            .unwrap());
        assert!(!store
            .append_messages("mallory", &id, &[ChatMessage::user("nope")], later)
            .await
            .unwrap());

        let stored = store.load("alice", &id).await.unwrap().unwrap();
        let texts: Vec<String> = stored.messages.iter().map(|m| m.content.text()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(stored.updated_at, later);
    }

    #[tokio::test]
    async fn append_to_deleted_room_is_not_found() {
        let store = MemoryStore::new();
        let room = Room::new("r", "alice", None);
        store.create_room(&room).await.unwrap();
        store.remove_member(&room.code, "alice").await.unwrap();

        assert!(matches!(
            store
                .append_message(&RoomMessage::from_agent(&room.code, "late", "m"))
                .await,
            Err(AppError::NotFound(_))
        ));
        assert!(store.list_messages(&room.code, None).await.unwrap().is_empty());
    }
}
