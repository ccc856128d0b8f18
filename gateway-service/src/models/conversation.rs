//! Persistent one-to-one conversations.

use super::ChatMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const TITLE_CHARS: usize = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,

    /// Owner. Other callers never see the conversation.
    pub user_id: String,

    pub title: String,

    pub messages: Vec<ChatMessage>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// A fresh conversation titled after its first message.
    pub fn new(user_id: impl Into<String>, first_message: &str) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title_for(first_message),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// First 30 characters of the opening message.
pub fn title_for(message: &str) -> String {
    let title: String = message.trim().chars().take(TITLE_CHARS).collect();
    if title.is_empty() {
        "New chat".to_string()
    } else {
        title
    }
}

/// Listing entry without the message bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub title: String,
    pub message_count: usize,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl From<&Conversation> for ConversationSummary {
    fn from(c: &Conversation) -> Self {
        Self {
            conversation_id: c.conversation_id.clone(),
            title: c.title.clone(),
            message_count: c.messages.len(),
            updated_at: c.updated_at,
        }
    }
}
