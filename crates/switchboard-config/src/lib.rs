use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("missing secret: environment variable {0} is not set")]
    MissingSecret(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub webhook: Webhook,
    pub store: Store,
    pub sessions: Sessions,
    pub responder: Responder,
    pub delivery: Delivery,
    pub fallback: Fallback,
    #[serde(default)]
    pub logging: Logging,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
    #[serde(default = "default_ack_mode")]
    pub ack_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub secret_env: String,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sessions {
    pub max_history: usize,
    pub timeout_ms: u64,
    #[serde(default = "default_max_processed_ids")]
    pub max_processed_ids: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_human_agent_prefix")]
    pub human_agent_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Responder {
    pub kind: String,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub instructions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub base_url: String,
    pub service_id: String,
    pub account_id_env: String,
    pub auth_token_env: String,
    #[serde(default = "default_author")]
    pub author: String,
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_typing_indicator")]
    pub typing_indicator: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fallback {
    pub rate_limited: String,
    pub unavailable: String,
    pub token_limit_exceeded: String,
    pub unknown: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub format: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
    #[serde(default)]
    pub immutable_mirror_path: Option<String>,
}

/// Credentials resolved from the environment variables named in [`Config`].
/// Kept apart from `Config` so the config stays serializable and secrets
/// never reach a log line.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub webhook_secret: SecretString,
    pub responder_api_key: Option<SecretString>,
    pub delivery_account_id: SecretString,
    pub delivery_auth_token: SecretString,
}

impl Secrets {
    pub fn from_env(cfg: &Config) -> Result<Self, ConfigError> {
        Self::resolve(cfg, |name| std::env::var(name).ok())
    }

    /// Resolves secrets through `lookup`; `from_env` passes the process environment.
    pub fn resolve(
        cfg: &Config,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let required = |name: &str| -> Result<SecretString, ConfigError> {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from)
                .ok_or_else(|| ConfigError::MissingSecret(name.to_string()))
        };

        let responder_api_key = match cfg.responder.api_key_env.as_deref() {
            Some(name) if cfg.responder.kind == "openai" => Some(required(name)?),
            Some(name) => lookup(name)
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            None => None,
        };

        Ok(Self {
            webhook_secret: required(&cfg.webhook.secret_env)?,
            responder_api_key,
            delivery_account_id: required(&cfg.delivery.account_id_env)?,
            delivery_auth_token: required(&cfg.delivery.auth_token_env)?,
        })
    }
}

fn default_ack_mode() -> String {
    "deferred".to_string()
}

fn default_signature_header() -> String {
    "x-switchboard-signature".to_string()
}

fn default_max_processed_ids() -> usize {
    256
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_human_agent_prefix() -> String {
    "human_agent_".to_string()
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f64 {
    0.7
}

fn default_author() -> String {
    "assistant".to_string()
}

fn default_retry_max_attempts() -> usize {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_typing_indicator() -> bool {
    true
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

/// Rules the schema cannot express, re-checked so that configs built in code
/// (tests, embedders) get the same guarantees as files.
pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server.ack_mode != "inline" && cfg.server.ack_mode != "deferred" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "server.ack_mode={} is not implemented; supported: inline, deferred",
            cfg.server.ack_mode
        )));
    }
    if cfg.webhook.signature_header.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "webhook.signature_header must not be empty".to_string(),
        ));
    }
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.sessions.max_history == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "sessions.max_history must be >= 1".to_string(),
        ));
    }
    if cfg.sessions.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "sessions.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.sessions.max_processed_ids == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "sessions.max_processed_ids must be >= 1".to_string(),
        ));
    }
    if cfg.sessions.sweep_interval_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "sessions.sweep_interval_ms must be >= 1".to_string(),
        ));
    }
    match cfg.responder.kind.as_str() {
        "openai" => {
            if cfg.responder.api_key_env.is_none() {
                return Err(ConfigError::UnsupportedConfig(
                    "responder.api_key_env is required when responder.kind=openai".to_string(),
                ));
            }
            if cfg
                .responder
                .model
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "responder.model is required when responder.kind=openai".to_string(),
                ));
            }
        }
        "agent_http" => {
            if cfg
                .responder
                .endpoint
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "responder.endpoint is required when responder.kind=agent_http".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "responder.kind={other} is not implemented; supported: openai, agent_http"
            )));
        }
    }
    if cfg.responder.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "responder.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.delivery.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "delivery.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.delivery.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "delivery.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.delivery.author.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "delivery.author must not be empty".to_string(),
        ));
    }
    for (name, text) in [
        ("rate_limited", &cfg.fallback.rate_limited),
        ("unavailable", &cfg.fallback.unavailable),
        ("token_limit_exceeded", &cfg.fallback.token_limit_exceeded),
        ("unknown", &cfg.fallback.unknown),
    ] {
        if text.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(format!(
                "fallback.{name} must not be empty"
            )));
        }
    }
    if !matches!(cfg.logging.format.as_str(), "compact" | "pretty" | "json") {
        return Err(ConfigError::UnsupportedConfig(format!(
            "logging.format={} is not implemented; supported: compact, pretty, json",
            cfg.logging.format
        )));
    }
    Ok(())
}
