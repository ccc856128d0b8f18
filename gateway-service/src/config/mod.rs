use crate::models::Credential;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

const DEFAULT_UPSTREAM_URL: &str = "https://ai.hackclub.com/proxy/v1";

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub store: StoreConfig,
    pub upstream: UpstreamConfig,
    pub routing: RoutingConfig,
    pub ensemble: EnsembleConfig,
    pub rooms: RoomConfig,
    pub quota: QuotaConfig,
    /// Model id -> prices. Models missing here cost nothing.
    pub pricing: HashMap<String, ModelPrice>,
    pub cors_allowed_origins: Vec<String>,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub mongodb_uri: Option<String>,
    pub mongodb_database: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Mongo,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StoreBackend::Mongo),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(format!("Invalid store backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base of the OpenAI-compatible API, without `/chat/completions`.
    pub base_url: String,
    /// Static override credential. When set, admission control is bypassed.
    pub api_key: Option<String>,
    /// Credentials seeded into the in-memory store. Ignored by MongoDB,
    /// which reads its own `credentials` collection.
    pub credentials: Vec<Credential>,
    pub timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Fast model asked to pick a model in `general`/`manual` mode.
    pub router_model: String,
    pub router_timeout_secs: u64,
    /// Used whenever the router cannot produce an answer.
    pub default_model: String,
    pub precise_model: String,
    pub turbo_model: String,
    pub catalog: Vec<CatalogModel>,
}

impl RoutingConfig {
    pub fn router_timeout(&self) -> Duration {
        Duration::from_secs(self.router_timeout_secs)
    }
}

/// One entry of the model catalog shown to the router model.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CatalogModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub modality: Modality,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    #[default]
    Text,
    Multimodal,
    Image,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Multimodal => "multimodal",
            Modality::Image => "image",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnsembleConfig {
    /// Candidate models in display order. Duplicates are dropped at call time.
    pub models: Vec<String>,
    pub fusion_model: String,
    pub fusion_temperature: f32,
    pub history_turns: usize,
    pub turn_chars: usize,
    pub answer_chars: usize,
    pub max_snippets: usize,
    pub snippet_chars: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomConfig {
    pub heartbeat_secs: u64,
    /// Per-subscriber buffer. A full buffer drops events for that subscriber.
    pub channel_capacity: usize,
}

impl RoomConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Caller requests per trailing minute. 0 disables the check.
    pub requests_per_minute: u32,
    /// Users allowed to use `ultimate` mode. `*` allows everyone.
    pub ultimate_allowed_users: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct ModelPrice {
    pub prompt_per_million: f64,
    pub completion_per_million: f64,
}

impl GatewayConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let backend: StoreBackend = get_env("STORE_BACKEND", Some("mongo"), is_prod)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let mongodb_uri = match backend {
            StoreBackend::Mongo => Some(get_env("MONGODB_URI", None, is_prod)?),
            StoreBackend::Memory => None,
        };

        let default_model = get_env("DEFAULT_MODEL", Some("openai/gpt-4o-mini"), is_prod)?;
        let precise_model = get_env("PRECISE_MODEL", Some("openai/gpt-4o"), is_prod)?;
        let turbo_model = get_env("TURBO_MODEL", Some("google/gemini-2.0-flash-001"), is_prod)?;
        let ensemble_models = split_list(&get_env(
            "ENSEMBLE_MODELS",
            Some("openai/gpt-4o,anthropic/claude-3.5-sonnet,google/gemini-2.0-flash-001"),
            is_prod,
        )?);

        let catalog = match env::var("MODEL_CATALOG") {
            Ok(raw) => parse_json("MODEL_CATALOG", &raw)?,
            Err(_) => default_catalog(&[&default_model, &precise_model, &turbo_model], &ensemble_models),
        };

        let pricing = match env::var("MODEL_PRICING") {
            Ok(raw) => parse_json("MODEL_PRICING", &raw)?,
            Err(_) => HashMap::new(),
        };

        Ok(GatewayConfig {
            common: common_config,
            store: StoreConfig {
                backend,
                mongodb_uri,
                mongodb_database: get_env("MONGODB_DATABASE", Some("gateway_db"), is_prod)?,
            },
            upstream: UpstreamConfig {
                base_url: get_env("UPSTREAM_URL", Some(DEFAULT_UPSTREAM_URL), is_prod)?,
                api_key: env::var("UPSTREAM_API_KEY").ok().filter(|k| !k.trim().is_empty()),
                credentials: match env::var("UPSTREAM_CREDENTIALS") {
                    Ok(raw) => parse_json("UPSTREAM_CREDENTIALS", &raw)?,
                    Err(_) => Vec::new(),
                },
                timeout_secs: parse_env("UPSTREAM_TIMEOUT_SECS", 120)?,
            },
            routing: RoutingConfig {
                router_model: get_env("ROUTER_MODEL", Some("google/gemini-2.0-flash-001"), is_prod)?,
                router_timeout_secs: parse_env("ROUTER_TIMEOUT_SECS", 10)?,
                default_model,
                precise_model,
                turbo_model,
                catalog,
            },
            ensemble: EnsembleConfig {
                models: ensemble_models,
                fusion_model: get_env("FUSION_MODEL", Some("openai/gpt-4o"), is_prod)?,
                fusion_temperature: parse_env("FUSION_TEMPERATURE", 0.2)?,
                history_turns: parse_env("ENSEMBLE_HISTORY_TURNS", 6)?,
                turn_chars: parse_env("ENSEMBLE_TURN_CHARS", 600)?,
                answer_chars: parse_env("ENSEMBLE_ANSWER_CHARS", 4000)?,
                max_snippets: parse_env("ENSEMBLE_MAX_SNIPPETS", 3)?,
                snippet_chars: parse_env("ENSEMBLE_SNIPPET_CHARS", 400)?,
            },
            rooms: RoomConfig {
                heartbeat_secs: parse_env("ROOM_HEARTBEAT_SECS", 20)?,
                channel_capacity: parse_env("ROOM_CHANNEL_CAPACITY", 64)?,
            },
            quota: QuotaConfig {
                requests_per_minute: parse_env("QUOTA_REQUESTS_PER_MINUTE", 60)?,
                ultimate_allowed_users: split_list(
                    &env::var("ULTIMATE_ALLOWED_USERS").unwrap_or_default(),
                ),
            },
            pricing,
            cors_allowed_origins: split_list(
                &env::var("CORS_ALLOWED_ORIGINS").unwrap_or_else(|_| "*".to_string()),
            ),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

/// Numeric settings always have a default, even in production.
fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} is not valid: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}

pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_json<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T, AppError> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("{} is not valid JSON: {}", key, e)))
}

/// Catalog built from the configured models when none is given explicitly.
fn default_catalog(fixed: &[&String], ensemble: &[String]) -> Vec<CatalogModel> {
    let mut catalog: Vec<CatalogModel> = Vec::new();
    for id in fixed.iter().copied().chain(ensemble.iter()) {
        if catalog.iter().any(|m| &m.id == id) {
            continue;
        }
        catalog.push(CatalogModel {
            id: id.clone(),
            name: id.rsplit('/').next().unwrap_or(id).to_string(),
            modality: Modality::Text,
        });
    }
    catalog
}
