//! Multi-user rooms and their message history.

use super::Role;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

const CODE_LEN: usize = 6;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    /// Short join code, unique among live rooms.
    pub code: String,

    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Never empty while the room exists.
    pub members: Vec<String>,

    pub created_by: String,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(name: impl Into<String>, creator: impl Into<String>, system_prompt: Option<String>) -> Self {
        let creator = creator.into();
        Self {
            code: generate_code(),
            name: name.into(),
            system_prompt: system_prompt.filter(|p| !p.trim().is_empty()),
            members: vec![creator.clone()],
            created_by: creator,
            created_at: Utc::now(),
        }
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }
}

/// Random join code from an alphabet without look-alike characters.
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub message_id: String,

    pub room_code: String,

    pub role: Role,

    /// Posting user. Absent for agent replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    pub content: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl RoomMessage {
    pub fn from_user(room_code: &str, sender: &str, content: impl Into<String>) -> Self {
        Self::build(room_code, Role::User, Some(sender.to_string()), content.into(), None)
    }

    pub fn from_agent(room_code: &str, content: impl Into<String>, model: impl Into<String>) -> Self {
        Self::build(room_code, Role::Assistant, None, content.into(), Some(model.into()))
    }

    fn build(
        room_code: &str,
        role: Role,
        sender: Option<String>,
        content: String,
        model: Option<String>,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            room_code: room_code.to_string(),
            role,
            sender,
            content,
            model,
            created_at: Utc::now(),
        }
    }
}

/// Listing entry for the caller's rooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub code: String,
    pub name: String,
    pub member_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_restricted_alphabet() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LEN);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn creator_is_first_member() {
        let room = Room::new("Study group", "alice", Some("  ".into()));
        assert_eq!(room.members, vec!["alice".to_string()]);
        assert!(room.system_prompt.is_none());
        assert!(room.is_member("alice"));
        assert!(!room.is_member("bob"));
    }
}
