pub mod chat;
pub mod health;
pub mod proxy;
pub mod rooms;

pub use health::{health_check, metrics_endpoint, readiness_check};

use axum::response::sse::Event;
use serde::Serialize;

/// One SSE frame whose `data` is the JSON encoding of `payload`.
pub(crate) fn sse_event<T: Serialize>(payload: &T) -> Event {
    Event::default().data(serde_json::to_string(payload).unwrap_or_default())
}
