//! MongoDB backend.
//!
//! Usage timestamps are stored as BSON dates so the sliding-window queries can
//! range over them; everything else keeps millisecond timestamps.

use super::{
    ConversationStore, CredentialStore, MemberRemoval, RoomStore, StoreHealth, UsageStore,
};
use crate::models::{
    ChatMessage, Conversation, ConversationSummary, Credential, Room, RoomMessage, UsageRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, to_bson, Bson, DateTime as BsonDateTime},
    error::{ErrorKind, WriteFailure},
    options::{
        FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument,
    },
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;

const DUPLICATE_KEY: i32 = 11000;

#[derive(Clone)]
pub struct GatewayDb {
    client: MongoClient,
    db: Database,
}

fn db_error(op: &str, e: mongodb::error::Error) -> AppError {
    tracing::error!("Failed to {}: {}", op, e);
    AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    matches!(
        e.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY
    )
}

fn room_gone(code: &str) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Room {} not found", code))
}

fn bson_time(t: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(t.timestamp_millis())
}

impl GatewayDb {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!("Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let db = client.database(database);
        tracing::info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { client, db })
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for gateway-service");

        self.create_index(
            &self.usage(),
            doc! { "credential_id": 1, "timestamp": -1 },
            "credential_time_idx",
            false,
        )
        .await?;
        self.create_index(
            &self.usage(),
            doc! { "user_id": 1, "timestamp": -1 },
            "user_time_idx",
            false,
        )
        .await?;

        self.create_index(
            &self.conversations(),
            doc! { "conversation_id": 1 },
            "conversation_id_idx",
            true,
        )
        .await?;
        self.create_index(
            &self.conversations(),
            doc! { "user_id": 1, "updated_at": -1 },
            "user_updated_idx",
            false,
        )
        .await?;

        self.create_index(&self.rooms(), doc! { "code": 1 }, "code_idx", true)
            .await?;
        self.create_index(&self.rooms(), doc! { "members": 1 }, "members_idx", false)
            .await?;
        self.create_index(
            &self.room_messages(),
            doc! { "room_code": 1, "created_at": 1 },
            "room_created_idx",
            false,
        )
        .await?;

        self.create_index(&self.credentials(), doc! { "id": 1 }, "credential_id_idx", true)
            .await?;

        tracing::info!("Successfully created all MongoDB indexes");
        Ok(())
    }

    async fn create_index<T>(
        &self,
        collection: &Collection<T>,
        keys: mongodb::bson::Document,
        name: &str,
        unique: bool,
    ) -> Result<(), AppError> {
        let index = IndexModel::builder()
            .keys(keys)
            .options(
                IndexOptions::builder()
                    .name(name.to_string())
                    .unique(unique)
                    .build(),
            )
            .build();

        collection
            .create_index(index, None)
            .await
            .map_err(|e| db_error(&format!("create {} index", name), e))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!("MongoDB health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(())
    }

    // Collection accessors

    pub fn usage(&self) -> Collection<UsageRecord> {
        self.db.collection("usage")
    }

    pub fn conversations(&self) -> Collection<Conversation> {
        self.db.collection("conversations")
    }

    pub fn rooms(&self) -> Collection<Room> {
        self.db.collection("rooms")
    }

    pub fn room_messages(&self) -> Collection<RoomMessage> {
        self.db.collection("room_messages")
    }

    pub fn credentials(&self) -> Collection<Credential> {
        self.db.collection("credentials")
    }
}

#[async_trait]
impl UsageStore for GatewayDb {
    async fn record(&self, record: &UsageRecord) -> Result<(), AppError> {
        self.usage()
            .insert_one(record, None)
            .await
            .map_err(|e| db_error("record usage", e))?;
        Ok(())
    }

    async fn count_requests_since(
        &self,
        credential_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        self.usage()
            .count_documents(
                doc! { "credential_id": credential_id, "timestamp": { "$gte": bson_time(since) } },
                None,
            )
            .await
            .map_err(|e| db_error("count credential requests", e))
    }

    async fn sum_tokens_since(
        &self,
        credential_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let pipeline = vec![
            doc! { "$match": {
                "credential_id": credential_id,
                "timestamp": { "$gte": bson_time(since) },
            }},
            doc! { "$group": { "_id": Bson::Null, "total": { "$sum": "$total_tokens" } } },
        ];

        let mut cursor = self
            .usage()
            .aggregate(pipeline, None)
            .await
            .map_err(|e| db_error("aggregate token usage", e))?;

        let total = match cursor
            .try_next()
            .await
            .map_err(|e| db_error("read token aggregate", e))?
        {
            Some(group) => match group.get("total") {
                Some(Bson::Int32(n)) => (*n).max(0) as u64,
                Some(Bson::Int64(n)) => (*n).max(0) as u64,
                Some(Bson::Double(n)) => n.max(0.0) as u64,
                _ => 0,
            },
            None => 0,
        };
        Ok(total)
    }

    async fn count_user_requests_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let request_ids = self
            .usage()
            .distinct(
                "request_id",
                doc! { "user_id": user_id, "timestamp": { "$gte": bson_time(since) } },
                None,
            )
            .await
            .map_err(|e| db_error("count user requests", e))?;
        Ok(request_ids.len() as u64)
    }
}

#[async_trait]
impl ConversationStore for GatewayDb {
    async fn load(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, AppError> {
        self.conversations()
            .find_one(
                doc! { "conversation_id": conversation_id, "user_id": user_id },
                None,
            )
            .await
            .map_err(|e| db_error("find conversation", e))
    }

    async fn create(&self, conversation: &Conversation) -> Result<(), AppError> {
        match self.conversations().insert_one(conversation, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(AppError::Conflict(anyhow::anyhow!(
                "Conversation {} already exists",
                conversation.conversation_id
            ))),
            Err(e) => Err(db_error("insert conversation", e)),
        }
    }

    async fn append_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
        messages: &[ChatMessage],
        updated_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let messages = to_bson(messages).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to encode messages: {}", e))
        })?;

        let result = self
            .conversations()
            .update_one(
                doc! { "conversation_id": conversation_id, "user_id": user_id },
                doc! {
                    "$push": { "messages": { "$each": messages } },
                    "$set": { "updated_at": updated_at.timestamp_millis() },
                },
                None,
            )
            .await
            .map_err(|e| db_error("append conversation messages", e))?;
        Ok(result.matched_count > 0)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ConversationSummary>, AppError> {
        let cursor = self
            .conversations()
            .find(
                doc! { "user_id": user_id },
                FindOptions::builder().sort(doc! { "updated_at": -1 }).build(),
            )
            .await
            .map_err(|e| db_error("list conversations", e))?;

        let conversations: Vec<Conversation> = cursor
            .try_collect()
            .await
            .map_err(|e| db_error("collect conversations", e))?;

        Ok(conversations.iter().map(ConversationSummary::from).collect())
    }
}

#[async_trait]
impl RoomStore for GatewayDb {
    async fn create_room(&self, room: &Room) -> Result<(), AppError> {
        match self.rooms().insert_one(room, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(AppError::Conflict(anyhow::anyhow!(
                "Room code {} already exists",
                room.code
            ))),
            Err(e) => Err(db_error("insert room", e)),
        }
    }

    async fn find_room(&self, code: &str) -> Result<Option<Room>, AppError> {
        self.rooms()
            .find_one(doc! { "code": code }, None)
            .await
            .map_err(|e| db_error("find room", e))
    }

    async fn rooms_for_member(&self, user_id: &str) -> Result<Vec<Room>, AppError> {
        let cursor = self
            .rooms()
            .find(
                doc! { "members": user_id },
                FindOptions::builder().sort(doc! { "created_at": -1 }).build(),
            )
            .await
            .map_err(|e| db_error("list rooms", e))?;

        cursor
            .try_collect()
            .await
            .map_err(|e| db_error("collect rooms", e))
    }

    async fn add_member(&self, code: &str, user_id: &str) -> Result<Option<Room>, AppError> {
        self.rooms()
            .find_one_and_update(
                doc! { "code": code },
                doc! { "$addToSet": { "members": user_id } },
                FindOneAndUpdateOptions::builder()
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await
            .map_err(|e| db_error("add room member", e))
    }

    async fn remove_member(&self, code: &str, user_id: &str) -> Result<MemberRemoval, AppError> {
        let updated = self
            .rooms()
            .find_one_and_update(
                doc! { "code": code },
                doc! { "$pull": { "members": user_id } },
                FindOneAndUpdateOptions::builder()
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await
            .map_err(|e| db_error("remove room member", e))?;

        let Some(room) = updated else {
            return Ok(MemberRemoval::NotFound);
        };
        if !room.members.is_empty() {
            return Ok(MemberRemoval::Remaining(room));
        }

        // Only delete while still empty; a concurrent join keeps the room alive.
        let deleted = self
            .rooms()
            .delete_one(doc! { "code": code, "members": { "$size": 0 } }, None)
            .await
            .map_err(|e| db_error("delete room", e))?;

        if deleted.deleted_count == 0 {
            return Ok(match self.find_room(code).await? {
                Some(room) => MemberRemoval::Remaining(room),
                None => MemberRemoval::NotFound,
            });
        }

        self.room_messages()
            .delete_many(doc! { "room_code": code }, None)
            .await
            .map_err(|e| db_error("delete room messages", e))?;

        Ok(MemberRemoval::Deleted)
    }

    async fn set_system_prompt(
        &self,
        code: &str,
        system_prompt: Option<String>,
    ) -> Result<bool, AppError> {
        let update = match system_prompt {
            Some(prompt) => doc! { "$set": { "system_prompt": prompt } },
            None => doc! { "$unset": { "system_prompt": "" } },
        };

        let result = self
            .rooms()
            .update_one(doc! { "code": code }, update, None)
            .await
            .map_err(|e| db_error("update system prompt", e))?;
        Ok(result.matched_count > 0)
    }

    /// Fails with `NotFound` when the room is gone, including when it is
    /// deleted while the insert is in flight.
    async fn append_message(&self, message: &RoomMessage) -> Result<(), AppError> {
        let code = message.room_code.as_str();
        if self.find_room(code).await?.is_none() {
            return Err(room_gone(code));
        }

        let inserted = self
            .room_messages()
            .insert_one(message, None)
            .await
            .map_err(|e| db_error("insert room message", e))?;

        if self.find_room(code).await?.is_none() {
            self.room_messages()
                .delete_one(doc! { "_id": inserted.inserted_id }, None)
                .await
                .map_err(|e| db_error("delete orphaned room message", e))?;
            return Err(room_gone(code));
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        code: &str,
        limit: Option<usize>,
    ) -> Result<Vec<RoomMessage>, AppError> {
        let options = match limit {
            // Newest first so the limit keeps the tail, reversed below.
            Some(limit) => FindOptions::builder()
                .sort(doc! { "created_at": -1 })
                .limit(limit as i64)
                .build(),
            None => FindOptions::builder().sort(doc! { "created_at": 1 }).build(),
        };

        let cursor = self
            .room_messages()
            .find(doc! { "room_code": code }, options)
            .await
            .map_err(|e| db_error("list room messages", e))?;

        let mut messages: Vec<RoomMessage> = cursor
            .try_collect()
            .await
            .map_err(|e| db_error("collect room messages", e))?;

        if limit.is_some() {
            messages.reverse();
        }
        Ok(messages)
    }

    async fn last_message(&self, code: &str) -> Result<Option<RoomMessage>, AppError> {
        Ok(self.list_messages(code, Some(1)).await?.pop())
    }

    async fn clear_messages(&self, code: &str) -> Result<u64, AppError> {
        let result = self
            .room_messages()
            .delete_many(doc! { "room_code": code }, None)
            .await
            .map_err(|e| db_error("clear room messages", e))?;
        Ok(result.deleted_count)
    }
}

#[async_trait]
impl CredentialStore for GatewayDb {
    async fn list_credentials(&self) -> Result<Vec<Credential>, AppError> {
        let cursor = self
            .credentials()
            .find(doc! {}, None)
            .await
            .map_err(|e| db_error("list credentials", e))?;

        cursor
            .try_collect()
            .await
            .map_err(|e| db_error("collect credentials", e))
    }
}

#[async_trait]
impl StoreHealth for GatewayDb {
    async fn ping(&self) -> Result<(), AppError> {
        self.health_check().await
    }
}
