//! Application startup and lifecycle management.

use crate::config::{GatewayConfig, StoreBackend};
use crate::handlers;
use crate::services::context::{AllowlistEntitlement, NoWebContext};
use crate::services::store::{GatewayDb, MemoryStore, Stores};
use crate::services::upstream::{CompletionExecutor, OpenAiExecutor};
use crate::services::{BroadcastBus, ChatService, Engine, ProxyService, RoomService};
use axum::http::HeaderValue;
use axum::middleware::from_fn;
use axum::{
    routing::{get, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware, REQUEST_ID_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub stores: Stores,
    pub chat: ChatService,
    pub proxy: ProxyService,
    pub rooms: RoomService,
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: GatewayConfig) -> Result<Self, AppError> {
        let stores = connect_stores(&config).await?;

        let executor: Arc<dyn CompletionExecutor> = Arc::new(
            OpenAiExecutor::new(&config.upstream.base_url, config.upstream.timeout()).map_err(
                |e| {
                    tracing::error!("Failed to build upstream client: {}", e);
                    e
                },
            )?,
        );
        tracing::info!(
            upstream = %config.upstream.base_url,
            ensemble = config.ensemble.models.len(),
            "Initialized upstream executor"
        );

        Self::with_executor(config, stores, executor).await
    }

    /// Build around an existing store and executor. Port 0 binds a random port.
    pub async fn with_executor(
        config: GatewayConfig,
        stores: Stores,
        executor: Arc<dyn CompletionExecutor>,
    ) -> Result<Self, AppError> {
        let engine = Engine::new(&config, stores.clone(), executor);
        let chat = ChatService::new(
            engine.clone(),
            Arc::new(NoWebContext),
            Arc::new(AllowlistEntitlement::new(
                config.quota.ultimate_allowed_users.clone(),
            )),
            config.quota.requests_per_minute,
        );
        let proxy = ProxyService::new(engine.clone(), config.quota.requests_per_minute);
        let rooms = RoomService::new(
            engine,
            BroadcastBus::new(config.rooms.channel_capacity),
            config.rooms.heartbeat(),
        );

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", http_addr, e);
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();
        tracing::info!("Gateway service: HTTP on port {}", http_port);

        Ok(Self {
            http_port,
            http_listener,
            state: AppState {
                config,
                stores,
                chat,
                proxy,
                rooms,
            },
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);
        axum::serve(self.http_listener, router).await
    }
}

async fn connect_stores(config: &GatewayConfig) -> Result<Stores, AppError> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!(
                credentials = config.upstream.credentials.len(),
                "Using in-memory store, nothing survives a restart"
            );
            Ok(Stores::from_backend(Arc::new(MemoryStore::with_credentials(
                config.upstream.credentials.clone(),
            ))))
        }
        StoreBackend::Mongo => {
            let uri = config.store.mongodb_uri.as_deref().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!("MONGODB_URI is required for mongo store"))
            })?;
            let db = GatewayDb::connect(uri, &config.store.mongodb_database)
                .await
                .map_err(|e| {
                    tracing::error!("Failed to connect to MongoDB: {}", e);
                    e
                })?;
            db.initialize_indexes().await.map_err(|e| {
                tracing::error!("Failed to initialize database indexes: {}", e);
                e
            })?;
            Ok(Stores::from_backend(Arc::new(db)))
        }
    }
}

fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_allowed_origins);

    let api = Router::new()
        .route("/api/chat/completions", post(handlers::chat::completions))
        .route(
            "/api/chat/conversations",
            get(handlers::chat::list_conversations),
        )
        .route(
            "/api/chat/conversations/:id",
            get(handlers::chat::get_conversation),
        )
        .route(
            "/api/proxy/chat/completions",
            post(handlers::proxy::chat_completions),
        )
        .route(
            "/api/rooms",
            post(handlers::rooms::create_room).get(handlers::rooms::list_rooms),
        )
        .route("/api/rooms/join", post(handlers::rooms::join_room))
        .route("/api/rooms/:code", get(handlers::rooms::get_room))
        .route("/api/rooms/:code/leave", post(handlers::rooms::leave_room))
        .route(
            "/api/rooms/:code/messages",
            post(handlers::rooms::post_message),
        )
        .route(
            "/api/rooms/:code/system-prompt",
            put(handlers::rooms::update_system_prompt),
        )
        .route("/api/rooms/:code/clear", post(handlers::rooms::clear_room))
        .route("/api/rooms/:code/stream", get(handlers::rooms::room_stream));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .merge(api)
        .layer(cors)
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(allowed)
}
