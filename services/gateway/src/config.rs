//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/zapgate/gateway.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `private_key` (64-char hex seed or bech32 `nsec...` envelope)
//! - `relays`: at least one WebSocket URL
//! - `ai.api_key`

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    /// Signer seed exactly as configured; decoded by the signer.
    pub private_key: String,
    pub bot_name: String,
    pub relays: Vec<String>,
    /// Pause before publishing a reply, to space out public responses.
    pub response_delay_ms: u64,
    /// Dashboard port; parsed for the out-of-process dashboard, unused here.
    pub web_port: u16,
    pub ai: AiConfig,
    pub queue: QueueSettings,
    pub rate_limit: RateLimitSettings,
    pub costs: CostSettings,
    pub circuit: CircuitSettings,
    pub storage: StorageSettings,
    pub relay_tuning: RelayTuning,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_ms: u64,
    /// Returned verbatim when the backend is unavailable.
    pub fallback_message: String,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub task_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub max_tokens: u32,
    /// Tokens regained per second.
    pub refill_rate: f64,
    /// Idle buckets older than this are swept.
    pub window_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CostSettings {
    pub dm_cost: u64,
    pub public_cost: u64,
}

#[derive(Debug, Clone)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct RelayTuning {
    pub reconnect_base_ms: u64,
    pub reconnect_ceiling_ms: u64,
    pub max_reconnect_attempts: u32,
    pub startup_timeout_ms: u64,
}

impl RelayTuning {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }
    pub fn reconnect_ceiling(&self) -> Duration {
        Duration::from_millis(self.reconnect_ceiling_ms)
    }
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    private_key: Option<String>,
    bot_name: Option<String>,
    relays: Option<Vec<String>>,
    response_delay_ms: Option<u64>,
    web_port: Option<u16>,
    ai: Option<RawAiConfig>,
    queue: Option<RawQueueSettings>,
    rate_limit: Option<RawRateLimitSettings>,
    costs: Option<RawCostSettings>,
    circuit: Option<RawCircuitSettings>,
    storage: Option<RawStorageSettings>,
    relay: Option<RawRelayTuning>,
}

#[derive(Debug, Deserialize)]
struct RawAiConfig {
    api_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_ms: Option<u64>,
    fallback_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQueueSettings {
    max_concurrent: Option<usize>,
    max_queue_size: Option<usize>,
    task_timeout_ms: Option<u64>,
    retry_attempts: Option<u32>,
    retry_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawRateLimitSettings {
    max_tokens: Option<u32>,
    refill_rate: Option<f64>,
    window_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawCostSettings {
    dm_cost: Option<u64>,
    public_cost: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawCircuitSettings {
    failure_threshold: Option<u32>,
    success_threshold: Option<u32>,
    reset_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawStorageSettings {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRelayTuning {
    reconnect_base_ms: Option<u64>,
    reconnect_ceiling_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    startup_timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub const DEFAULT_CONFIG_PATH: &str = "/etc/zapgate/gateway.toml";

/// Load gateway config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load gateway config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let private_key = raw
        .private_key
        .ok_or_else(|| ConfigError::MissingField("private_key".to_owned()))?;
    if private_key.trim().is_empty() {
        return Err(ConfigError::InvalidValue(
            "private_key must not be empty".to_owned(),
        ));
    }

    let relays = raw
        .relays
        .ok_or_else(|| ConfigError::MissingField("relays".to_owned()))?;
    if relays.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one relay URL is required".to_owned(),
        ));
    }
    for url in &relays {
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(format!(
                "relay URL '{}' must be ws:// or wss://",
                url
            )));
        }
    }

    let raw_ai = raw.ai.ok_or_else(|| ConfigError::MissingField("ai".to_owned()))?;
    let api_key = raw_ai
        .api_key
        .ok_or_else(|| ConfigError::MissingField("ai.api_key".to_owned()))?;
    let ai = AiConfig {
        api_url: raw_ai
            .api_url
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_owned()),
        api_key,
        model: raw_ai.model.unwrap_or_else(|| "gpt-4o-mini".to_owned()),
        timeout_ms: raw_ai.timeout_ms.unwrap_or(55_000),
        fallback_message: raw_ai.fallback_message.unwrap_or_else(|| {
            "I'm having trouble reaching my brain right now. Please try again in a minute."
                .to_owned()
        }),
    };

    let queue = match raw.queue {
        Some(q) => QueueSettings {
            max_concurrent: q.max_concurrent.unwrap_or(10),
            max_queue_size: q.max_queue_size.unwrap_or(10_000),
            task_timeout_ms: q.task_timeout_ms.unwrap_or(60_000),
            retry_attempts: q.retry_attempts.unwrap_or(3),
            retry_delay_ms: q.retry_delay_ms.unwrap_or(1_000),
        },
        None => QueueSettings {
            max_concurrent: 10,
            max_queue_size: 10_000,
            task_timeout_ms: 60_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
        },
    };
    if queue.max_concurrent == 0 {
        return Err(ConfigError::InvalidValue(
            "queue.max_concurrent must be at least 1".to_owned(),
        ));
    }

    let rate_limit = match raw.rate_limit {
        Some(r) => RateLimitSettings {
            max_tokens: r.max_tokens.unwrap_or(50),
            refill_rate: r.refill_rate.unwrap_or(5.0),
            window_ms: r.window_ms.unwrap_or(60_000),
        },
        None => RateLimitSettings {
            max_tokens: 50,
            refill_rate: 5.0,
            window_ms: 60_000,
        },
    };

    let costs = match raw.costs {
        Some(c) => CostSettings {
            dm_cost: c.dm_cost.unwrap_or(20),
            public_cost: c.public_cost.unwrap_or(50),
        },
        None => CostSettings {
            dm_cost: 20,
            public_cost: 50,
        },
    };

    let circuit = match raw.circuit {
        Some(c) => CircuitSettings {
            failure_threshold: c.failure_threshold.unwrap_or(3),
            success_threshold: c.success_threshold.unwrap_or(2),
            reset_timeout_ms: c.reset_timeout_ms.unwrap_or(15_000),
        },
        None => CircuitSettings {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout_ms: 15_000,
        },
    };

    let storage = StorageSettings {
        sqlite_path: raw
            .storage
            .and_then(|s| s.sqlite_path)
            .unwrap_or_else(|| "/var/lib/zapgate/gateway.sqlite3".to_owned()),
    };

    let relay_tuning = match raw.relay {
        Some(r) => RelayTuning {
            reconnect_base_ms: r.reconnect_base_ms.unwrap_or(5_000),
            reconnect_ceiling_ms: r.reconnect_ceiling_ms.unwrap_or(60_000),
            max_reconnect_attempts: r.max_reconnect_attempts.unwrap_or(5),
            startup_timeout_ms: r.startup_timeout_ms.unwrap_or(15_000),
        },
        None => RelayTuning {
            reconnect_base_ms: 5_000,
            reconnect_ceiling_ms: 60_000,
            max_reconnect_attempts: 5,
            startup_timeout_ms: 15_000,
        },
    };

    Ok(GatewayConfig {
        schema_version,
        private_key,
        bot_name: raw.bot_name.unwrap_or_else(|| "ZapAI".to_owned()),
        relays,
        response_delay_ms: raw.response_delay_ms.unwrap_or(2_000),
        web_port: raw.web_port.unwrap_or(8081),
        ai,
        queue,
        rate_limit,
        costs,
        circuit,
        storage,
        relay_tuning,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
