//! Per-room publish/subscribe fan-out to live viewers.
//!
//! Publishing never waits: each subscriber has a bounded buffer and a full or
//! closed buffer simply misses the event.

use crate::models::RoomMessage;
use crate::services::metrics;
use futures::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    Ready {
        room: String,
    },
    Ping,
    Message {
        message: RoomMessage,
    },
    AiStart {
        model: String,
    },
    AiDelta {
        content: String,
    },
    MemberJoined {
        user_id: String,
        members: Vec<String>,
    },
    MemberLeft {
        user_id: String,
        members: Vec<String>,
    },
    SystemPromptUpdated {
        system_prompt: Option<String>,
    },
    ChatCleared,
    RoomDeleted,
    Error {
        message: String,
    },
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<RoomEvent>,
}

struct BusInner {
    rooms: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    capacity: usize,
}

#[derive(Clone)]
pub struct BroadcastBus {
    inner: Arc<BusInner>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                rooms: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn subscribe(&self, room: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);

        self.lock()
            .entry(room.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        tracing::debug!(room = %room, subscriber = id, "Subscribed to room");

        Subscription {
            id,
            room: room.to_string(),
            rx,
            bus: self.clone(),
        }
    }

    pub fn unsubscribe(&self, room: &str, id: u64) {
        let mut rooms = self.lock();
        if let Some(subscribers) = rooms.get_mut(room) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                rooms.remove(room);
            }
        }
        tracing::debug!(room = %room, subscriber = id, "Unsubscribed from room");
    }

    /// Deliver `event` to every live subscriber of `room`. Returns how many
    /// received it.
    pub fn publish(&self, room: &str, event: RoomEvent) -> usize {
        let mut rooms = self.lock();
        let Some(subscribers) = rooms.get_mut(room) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|s| match s.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                metrics::record_room_event_dropped();
                tracing::debug!(room = %room, subscriber = s.id, "Subscriber lagging, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if subscribers.is_empty() {
            rooms.remove(room);
        }
        delivered
    }

    pub fn subscriber_count(&self, room: &str) -> usize {
        self.lock().get(room).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.inner
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live registration. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    room: String,
    rx: mpsc::Receiver<RoomEvent>,
    bus: BroadcastBus,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<RoomEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RoomEvent> {
        self.rx.try_recv().ok()
    }

    /// Live feed: `ready` first, then events, with a `ping` after every
    /// `heartbeat` of silence. Ends once the room is deleted.
    pub fn into_stream(self, heartbeat: Duration) -> impl Stream<Item = RoomEvent> + Send {
        futures::stream::unfold((self, State::Starting), move |(mut sub, state)| async move {
            match state {
                State::Starting => {
                    let ready = RoomEvent::Ready {
                        room: sub.room.clone(),
                    };
                    Some((ready, (sub, State::Live)))
                }
                State::Closing => None,
                State::Live => match tokio::time::timeout(heartbeat, sub.rx.recv()).await {
                    Ok(Some(RoomEvent::RoomDeleted)) => {
                        Some((RoomEvent::RoomDeleted, (sub, State::Closing)))
                    }
                    Ok(Some(event)) => Some((event, (sub, State::Live))),
                    Ok(None) => None,
                    Err(_) => Some((RoomEvent::Ping, (sub, State::Live))),
                },
            }
        })
    }
}

#[derive(Clone, Copy)]
enum State {
    Starting,
    Live,
    Closing,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.room, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscriber_receives_exactly_one_copy() {
        let bus = BroadcastBus::new(8);
        let mut sub = bus.subscribe("ROOM01");

        assert_eq!(bus.publish("ROOM01", RoomEvent::ChatCleared), 1);

        assert_eq!(sub.recv().await, Some(RoomEvent::ChatCleared));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn dropped_subscription_receives_nothing() {
        let bus = BroadcastBus::new(8);
        let sub = bus.subscribe("ROOM01");
        let mut other = bus.subscribe("ROOM01");
        drop(sub);

        assert_eq!(bus.subscriber_count("ROOM01"), 1);
        assert_eq!(bus.publish("ROOM01", RoomEvent::Ping), 1);
        assert_eq!(other.recv().await, Some(RoomEvent::Ping));
    }

    #[test]
    fn publish_to_empty_room_is_a_no_op() {
        let bus = BroadcastBus::new(8);
        assert_eq!(bus.publish("NOBODY", RoomEvent::RoomDeleted), 0);
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let bus = BroadcastBus::new(8);
        let mut a = bus.subscribe("A");
        let mut b = bus.subscribe("B");

        bus.publish("A", RoomEvent::ChatCleared);

        assert_eq!(a.try_recv(), Some(RoomEvent::ChatCleared));
        assert_eq!(b.try_recv(), None);
    }

    #[tokio::test]
    async fn full_subscriber_does_not_block_publisher() {
        let bus = BroadcastBus::new(1);
        let mut slow = bus.subscribe("R");
        let mut fast = bus.subscribe("R");

        bus.publish("R", RoomEvent::AiDelta { content: "1".into() });
        fast.recv().await;
        let delivered = bus.publish("R", RoomEvent::AiDelta { content: "2".into() });

        assert_eq!(delivered, 1);
        assert_eq!(fast.recv().await, Some(RoomEvent::AiDelta { content: "2".into() }));
        assert_eq!(slow.recv().await, Some(RoomEvent::AiDelta { content: "1".into() }));
        assert_eq!(slow.try_recv(), None);
        assert_eq!(bus.subscriber_count("R"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_starts_ready_and_pings_when_idle() {
        let bus = BroadcastBus::new(8);
        let stream = bus.subscribe("R").into_stream(Duration::from_secs(20));
        tokio::pin!(stream);

        assert_eq!(
            stream.next().await,
            Some(RoomEvent::Ready { room: "R".into() })
        );
        assert_eq!(stream.next().await, Some(RoomEvent::Ping));

        bus.publish("R", RoomEvent::ChatCleared);
        assert_eq!(stream.next().await, Some(RoomEvent::ChatCleared));
    }

    #[tokio::test]
    async fn stream_ends_after_room_deleted() {
        let bus = BroadcastBus::new(8);
        let stream = bus.subscribe("R").into_stream(Duration::from_secs(20));
        tokio::pin!(stream);
        stream.next().await;

        bus.publish("R", RoomEvent::RoomDeleted);

        assert_eq!(stream.next().await, Some(RoomEvent::RoomDeleted));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn dropping_stream_unsubscribes() {
        let bus = BroadcastBus::new(8);
        let stream = bus.subscribe("R").into_stream(Duration::from_secs(20));
        assert_eq!(bus.subscriber_count("R"), 1);

        drop(stream);
        assert_eq!(bus.subscriber_count("R"), 0);
    }
}
