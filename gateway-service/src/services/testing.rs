//! Fixtures shared by the service unit tests.

use crate::config::{
    CatalogModel, EnsembleConfig, GatewayConfig, Modality, QuotaConfig, RoomConfig,
    RoutingConfig, StoreBackend, StoreConfig, UpstreamConfig,
};
use crate::models::Credential;
use crate::services::engine::Engine;
use crate::services::store::{MemoryStore, Stores};
use crate::services::upstream::MockExecutor;
use service_core::config::Config as CoreConfig;
use std::collections::HashMap;
use std::sync::Arc;

pub const ROUTER_MODEL: &str = "router/fast";
pub const DEFAULT_MODEL: &str = "default/model";
pub const FUSION_MODEL: &str = "fusion/model";

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        common: CoreConfig::with_port(0),
        store: StoreConfig {
            backend: StoreBackend::Memory,
            mongodb_uri: None,
            mongodb_database: "gateway_test".into(),
        },
        upstream: UpstreamConfig {
            base_url: "http://127.0.0.1:9".into(),
            api_key: None,
            credentials: Vec::new(),
            timeout_secs: 120,
        },
        routing: RoutingConfig {
            router_model: ROUTER_MODEL.into(),
            router_timeout_secs: 10,
            default_model: DEFAULT_MODEL.into(),
            precise_model: "precise/model".into(),
            turbo_model: "turbo/model".into(),
            catalog: vec![CatalogModel {
                id: DEFAULT_MODEL.into(),
                name: "Default".into(),
                modality: Modality::Text,
            }],
        },
        ensemble: EnsembleConfig {
            models: vec!["cand/a".into(), "cand/b".into()],
            fusion_model: FUSION_MODEL.into(),
            fusion_temperature: 0.2,
            history_turns: 6,
            turn_chars: 600,
            answer_chars: 4000,
            max_snippets: 3,
            snippet_chars: 400,
        },
        rooms: RoomConfig {
            heartbeat_secs: 20,
            channel_capacity: 64,
        },
        quota: QuotaConfig {
            requests_per_minute: 60,
            ultimate_allowed_users: vec!["*".into()],
        },
        pricing: HashMap::new(),
        cors_allowed_origins: vec!["*".into()],
        otlp_endpoint: None,
    }
}

/// Engine over a memory store holding one unlimited credential. The router
/// model is scripted to pick the default model.
pub fn engine(
    config: &GatewayConfig,
    executor: MockExecutor,
) -> (Engine, Arc<MemoryStore>, Arc<MockExecutor>) {
    let store = Arc::new(MemoryStore::with_credentials(vec![Credential::new(
        "key-1", "sk-1",
    )]));
    let executor = Arc::new(executor.with_reply(
        ROUTER_MODEL,
        DEFAULT_MODEL,
        Default::default(),
    ));
    let engine = Engine::new(config, Stores::from_backend(store.clone()), executor.clone());
    (engine, store, executor)
}
