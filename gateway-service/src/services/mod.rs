pub mod admission;
pub mod bus;
pub mod chat;
pub mod context;
pub mod engine;
pub mod ensemble;
pub mod metrics;
pub mod pricing;
pub mod proxy;
pub mod relay;
pub mod rooms;
pub mod router;
pub mod store;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

pub use admission::AdmissionGate;
pub use bus::{BroadcastBus, RoomEvent};
pub use chat::{ChatRequest, ChatResponse, ChatService};
pub use engine::Engine;
pub use proxy::ProxyService;
pub use relay::RelayEvent;
pub use rooms::{RoomService, RoomView};
pub use store::Stores;
