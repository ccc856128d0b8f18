//! Multi-user rooms: membership, history and the background agent that
//! answers every human post while viewers watch it stream.

use crate::error::GatewayError;
use crate::models::{ChatMessage, Mode, Role, Room, RoomMessage, RoomSummary};
use crate::services::bus::{BroadcastBus, RoomEvent};
use crate::services::engine::Engine;
use crate::services::ensemble::CallUsage;
use crate::services::relay::{relay_stream, RelayEvent, RelaySink};
use crate::services::router::{RouteDecision, RouteRequest};
use crate::services::store::MemberRemoval;
use crate::services::upstream::CompletionRequest;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::Instrument;

const CODE_ATTEMPTS: usize = 5;
const AGENT_HISTORY: usize = 30;
const LAST_MESSAGE_CHARS: usize = 80;
const AGENT_PERSONA: &str = "You are a helpful assistant taking part in a group chat. \
Messages from people are prefixed with their name. Answer the latest message.";

/// A room together with its history, as shown to a member.
#[derive(Debug, Clone)]
pub struct RoomView {
    pub room: Room,
    pub messages: Vec<RoomMessage>,
}

#[derive(Clone)]
pub struct RoomService {
    engine: Engine,
    bus: BroadcastBus,
    turns: Arc<DashMap<String, Arc<Mutex<()>>>>,
    heartbeat: Duration,
}

impl RoomService {
    pub fn new(engine: Engine, bus: BroadcastBus, heartbeat: Duration) -> Self {
        Self {
            engine,
            bus,
            turns: Arc::new(DashMap::new()),
            heartbeat,
        }
    }

    #[tracing::instrument(skip(self, system_prompt))]
    pub async fn create(
        &self,
        user_id: &str,
        name: &str,
        system_prompt: Option<String>,
    ) -> Result<Room, GatewayError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GatewayError::InvalidRequest("room name is required".to_string()));
        }

        for _ in 0..CODE_ATTEMPTS {
            let room = Room::new(name, user_id, system_prompt.clone());
            match self.engine.stores.rooms.create_room(&room).await {
                Ok(()) => {
                    tracing::info!(room = %room.code, "Room created");
                    return Ok(room);
                }
                Err(AppError::Conflict(_)) => {
                    tracing::debug!(room = %room.code, "Room code taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(GatewayError::Internal(AppError::InternalError(anyhow::anyhow!(
            "could not allocate a room code after {} attempts",
            CODE_ATTEMPTS
        ))))
    }

    #[tracing::instrument(skip(self))]
    pub async fn join(&self, user_id: &str, code: &str) -> Result<Room, GatewayError> {
        let code = normalize(code);
        let existing = self.find(&code).await?;
        if existing.is_member(user_id) {
            return Ok(existing);
        }

        let room = self
            .engine
            .stores
            .rooms
            .add_member(&code, user_id)
            .await?
            .ok_or_else(|| room_not_found(&code))?;

        self.bus.publish(
            &code,
            RoomEvent::MemberJoined {
                user_id: user_id.to_string(),
                members: room.members.clone(),
            },
        );
        tracing::info!(room = %code, member_count = room.members.len(), "Member joined");
        Ok(room)
    }

    /// Leaving as the last member deletes the room and its history.
    #[tracing::instrument(skip(self))]
    pub async fn leave(&self, user_id: &str, code: &str) -> Result<(), GatewayError> {
        let code = &normalize(code);
        self.member_room(user_id, code).await?;

        match self.engine.stores.rooms.remove_member(code, user_id).await? {
            MemberRemoval::NotFound => Err(room_not_found(code)),
            MemberRemoval::Remaining(room) => {
                self.bus.publish(
                    code,
                    RoomEvent::MemberLeft {
                        user_id: user_id.to_string(),
                        members: room.members,
                    },
                );
                Ok(())
            }
            MemberRemoval::Deleted => {
                self.turns.remove(code);
                self.bus.publish(code, RoomEvent::RoomDeleted);
                tracing::info!(room = %code, "Last member left, room deleted");
                Ok(())
            }
        }
    }

    pub async fn get(&self, user_id: &str, code: &str) -> Result<RoomView, GatewayError> {
        let code = &normalize(code);
        let room = self.member_room(user_id, code).await?;
        let messages = self.engine.stores.rooms.list_messages(code, None).await?;
        Ok(RoomView { room, messages })
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<RoomSummary>, GatewayError> {
        let rooms = self.engine.stores.rooms.rooms_for_member(user_id).await?;

        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let last_message = self
                .engine
                .stores
                .rooms
                .last_message(&room.code)
                .await?
                .map(|m| m.content.chars().take(LAST_MESSAGE_CHARS).collect());
            summaries.push(RoomSummary {
                member_count: room.members.len(),
                code: room.code,
                name: room.name,
                last_message,
            });
        }
        Ok(summaries)
    }

    #[tracing::instrument(skip(self, system_prompt))]
    pub async fn update_system_prompt(
        &self,
        user_id: &str,
        code: &str,
        system_prompt: Option<String>,
    ) -> Result<Option<String>, GatewayError> {
        let code = &normalize(code);
        self.member_room(user_id, code).await?;

        let system_prompt = system_prompt
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        if !self
            .engine
            .stores
            .rooms
            .set_system_prompt(code, system_prompt.clone())
            .await?
        {
            return Err(room_not_found(code));
        }

        self.bus.publish(
            code,
            RoomEvent::SystemPromptUpdated {
                system_prompt: system_prompt.clone(),
            },
        );
        Ok(system_prompt)
    }

    #[tracing::instrument(skip(self))]
    pub async fn clear(&self, user_id: &str, code: &str) -> Result<u64, GatewayError> {
        let code = &normalize(code);
        self.member_room(user_id, code).await?;

        let removed = self.engine.stores.rooms.clear_messages(code).await?;
        self.bus.publish(code, RoomEvent::ChatCleared);
        tracing::info!(room = %code, removed, "Room history cleared");
        Ok(removed)
    }

    /// Persist and broadcast a human message, then hand the reply to a
    /// detached agent. Returns without waiting for the agent.
    #[tracing::instrument(skip(self, content))]
    pub async fn post_message(
        &self,
        user_id: &str,
        code: &str,
        content: &str,
    ) -> Result<RoomMessage, GatewayError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(GatewayError::InvalidRequest("message is required".to_string()));
        }
        let code = &normalize(code);
        self.member_room(user_id, code).await?;

        let message = RoomMessage::from_user(code, user_id, content);
        self.engine.stores.rooms.append_message(&message).await?;
        self.bus.publish(
            code,
            RoomEvent::Message {
                message: message.clone(),
            },
        );

        let service = self.clone();
        let room = code.to_string();
        tokio::spawn(
            async move { service.run_agent(room).await }
                .instrument(tracing::info_span!("room_agent", room = %code)),
        );

        Ok(message)
    }

    /// Live feed for a member.
    pub async fn subscribe(
        &self,
        user_id: &str,
        code: &str,
    ) -> Result<BoxStream<'static, RoomEvent>, GatewayError> {
        let code = &normalize(code);
        self.member_room(user_id, code).await?;
        Ok(self.bus.subscribe(code).into_stream(self.heartbeat).boxed())
    }

    async fn run_agent(&self, code: String) {
        let turn = self.turns.entry(code.clone()).or_default().clone();
        let _guard = turn.lock().await;

        tracing::info!("Agent turn started");
        match self.answer(&code).await {
            Ok(Some(reply)) => {
                tracing::info!(model = ?reply.model, "Agent turn completed");
            }
            Ok(None) => {
                self.turns.remove(&code);
                tracing::debug!("Room gone, agent reply dropped");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Agent turn failed");
                self.bus.publish(
                    &code,
                    RoomEvent::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    async fn answer(&self, code: &str) -> Result<Option<RoomMessage>, GatewayError> {
        let Some(room) = self.engine.stores.rooms.find_room(code).await? else {
            return Ok(None);
        };
        let history = self
            .engine
            .stores
            .rooms
            .list_messages(code, Some(AGENT_HISTORY))
            .await?;
        let latest = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let routed = self
            .engine
            .router
            .resolve(RouteRequest {
                text: &latest,
                has_attachments: false,
                mode: Mode::General,
                explicit_model: None,
            })
            .await;
        let turn_id = uuid::Uuid::new_v4().to_string();
        if let Some(call) = &routed.call {
            self.engine
                .record_calls(&turn_id, None, std::slice::from_ref(call))
                .await?;
        }
        let model = match routed.decision {
            RouteDecision::Single(model) => model,
            RouteDecision::Ensemble => self.engine.router.default_model().to_string(),
        };

        let credential = self.engine.gate.admit().await?;
        let request = CompletionRequest::new(&model, transcript(&room, &history))
            .with_timeout(self.engine.completion_timeout);
        let stream = self.engine.executor.stream(&credential, &request).await?;

        self.bus.publish(
            code,
            RoomEvent::AiStart {
                model: model.clone(),
            },
        );
        let sink = RoomSink {
            bus: &self.bus,
            room: code,
        };
        let streamed = relay_stream(stream, &sink).await?;

        self.engine
            .record_calls(
                &turn_id,
                None,
                &[CallUsage {
                    credential_id: credential.id,
                    model: model.clone(),
                    usage: streamed.usage,
                }],
            )
            .await?;

        let mut reply = RoomMessage::from_agent(code, streamed.content, model.as_str());
        reply.message_id = turn_id;
        match self.engine.stores.rooms.append_message(&reply).await {
            Ok(()) => {}
            // The last member left while the reply was streaming.
            Err(AppError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.bus.publish(
            code,
            RoomEvent::Message {
                message: reply.clone(),
            },
        );

        Ok(Some(reply))
    }

    async fn find(&self, code: &str) -> Result<Room, GatewayError> {
        self.engine
            .stores
            .rooms
            .find_room(code)
            .await?
            .ok_or_else(|| room_not_found(code))
    }

    async fn member_room(&self, user_id: &str, code: &str) -> Result<Room, GatewayError> {
        let room = self.find(code).await?;
        if !room.is_member(user_id) {
            return Err(GatewayError::Forbidden(format!(
                "not a member of room {}",
                code
            )));
        }
        Ok(room)
    }
}

/// Forwards streamed deltas to the room as `ai_delta` events.
struct RoomSink<'a> {
    bus: &'a BroadcastBus,
    room: &'a str,
}

#[async_trait]
impl RelaySink for RoomSink<'_> {
    async fn emit(&self, event: RelayEvent) {
        // Room messages are text only; image parts are not relayed.
        if let RelayEvent::Content { delta } = event {
            self.bus
                .publish(self.room, RoomEvent::AiDelta { content: delta });
        }
    }
}

fn transcript(room: &Room, history: &[RoomMessage]) -> Vec<ChatMessage> {
    let persona = room
        .system_prompt
        .as_deref()
        .map(|p| format!("{}\n\n{}", AGENT_PERSONA, p))
        .unwrap_or_else(|| AGENT_PERSONA.to_string());

    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::system(persona));
    messages.extend(history.iter().map(|m| match (&m.role, &m.sender) {
        (Role::User, Some(sender)) => ChatMessage::user(format!("{}: {}", sender, m.content)),
        (role, _) => ChatMessage::new(*role, m.content.as_str()),
    }));
    messages
}

fn normalize(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

fn room_not_found(code: &str) -> GatewayError {
    GatewayError::NotFound(format!("room {}", code))
}
