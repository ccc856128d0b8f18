//! LLM request gateway: credential admission, model routing, ensemble
//! fusion, streaming relay and live multi-user rooms.

pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

pub use startup::{AppState, Application};
