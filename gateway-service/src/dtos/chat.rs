use crate::models::{
    CandidateExcerpt, ChatMessage, Conversation, ConversationSummary, MessageContent, Mode,
    TokenUsage,
};
use crate::services::{ChatRequest, ChatResponse};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct ChatCompletionRequest {
    /// Plain text or a list of text and image parts.
    pub message: MessageContent,

    #[validate(length(min = 1, max = 64, message = "Invalid conversation id"))]
    pub conversation_id: Option<String>,

    #[serde(default)]
    pub mode: Mode,

    #[validate(length(min = 1, max = 200, message = "Invalid model id"))]
    pub model: Option<String>,

    #[validate(length(max = 8000, message = "System prompt is too long"))]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub web_search: bool,

    #[serde(default)]
    pub stream: bool,
}

impl ChatCompletionRequest {
    pub fn into_chat_request(self, user_id: String) -> ChatRequest {
        ChatRequest {
            user_id,
            conversation_id: self.conversation_id,
            content: self.message,
            mode: self.mode,
            model: self.model,
            system_prompt: self.system_prompt,
            web_search: self.web_search,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub conversation_id: String,
    pub title: String,
    pub model: String,
    pub mode: Mode,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    pub usage: TokenUsage,
    pub cost: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<CandidateExcerpt>,
}

impl From<ChatResponse> for ChatCompletionResponse {
    fn from(r: ChatResponse) -> Self {
        Self {
            conversation_id: r.conversation_id,
            title: r.title,
            model: r.model,
            mode: r.mode,
            content: r.content,
            images: r.images,
            usage: r.usage,
            cost: r.cost,
            sources: r.sources,
            candidates: r.candidates,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub conversation_id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Conversation> for ConversationResponse {
    fn from(c: Conversation) -> Self {
        Self {
            conversation_id: c.conversation_id,
            title: c.title,
            messages: c.messages,
            created_at: c.created_at.to_rfc3339(),
            updated_at: c.updated_at.to_rfc3339(),
        }
    }
}
