use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use config::{Config as ConfigLib, ConfigBuilder, ConfigError, Environment, builder::DefaultState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub signature: SignatureConfig,
    pub dispatch: DispatchConfig,
    pub safety: SafetyConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
}

#[derive(Clone, Deserialize)]
pub struct SignatureConfig {
    pub secret: String,
    /// Replay window in seconds.
    pub ttl_secs: u64,
}

impl fmt::Debug for SignatureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureConfig")
            .field("secret", &"<redacted>")
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub shard_count: usize,
    pub batch_size: usize,
    pub max_concurrent_requests: usize,
    pub http_timeout_secs: u64,
    pub retry_interval_secs: u64,
    pub max_retry_count: u32,
    pub poll_interval_ms: u64,
    /// Upstream endpoint polled for order query tasks.
    #[serde(default)]
    pub order_query_url: Option<String>,
    /// Run the delivery workers in this process. Producer-only nodes turn
    /// this off.
    pub consume: bool,
}

impl DispatchConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub allowed_path_prefixes: Vec<String>,
    pub skipped_path_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub json: bool,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults()?;
        // If env_vars is provided, we use it instead of system environment
        // This is to avoid systems variables pollution across tests
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Use system environment variables
            // Should be in the format APP_DISPATCH__SHARD_COUNT or APP_SIGNATURE__SECRET
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("safety.allowed_path_prefixes")
                    .with_list_parse_key("safety.skipped_path_prefixes"),
            );
        }

        builder.build()?.try_deserialize()
    }

    /// Set default values for the configuration.
    /// This is used when no environment variables or config file are provided
    fn set_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        ConfigLib::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("store.backend", "memory")?
            .set_default("store.url", "redis://127.0.0.1:6379")?
            .set_default("signature.secret", "dev-secret")?
            .set_default("signature.ttl_secs", 5)?
            .set_default("dispatch.shard_count", 10)?
            .set_default("dispatch.batch_size", 20)?
            .set_default("dispatch.max_concurrent_requests", 50)?
            .set_default("dispatch.http_timeout_secs", 5)?
            .set_default("dispatch.retry_interval_secs", 60)?
            .set_default("dispatch.max_retry_count", 3)?
            .set_default("dispatch.poll_interval_ms", 500)?
            .set_default("dispatch.consume", true)?
            .set_default("safety.allowed_path_prefixes", vec!["/api".to_string()])?
            .set_default("safety.skipped_path_prefixes", Vec::<String>::new())?
            .set_default("telemetry.json", false)
    }
}
