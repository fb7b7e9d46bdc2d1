use std::time::Duration;

use serde::Deserialize;

/// Engine-level configuration.
///
/// Controls operator defaults (applied when an operator definition omits the
/// corresponding property) and logging.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Identifier for this engine instance, attached to log spans.
    pub node_id: String,
    /// Default number of keys remembered by a `dedup` operator.
    pub dedup_window: usize,
    /// Default time a `joiner` waits for its correlated message, in milliseconds.
    pub join_timeout_ms: u64,
    /// Default number of unmatched right-side messages a `joiner` buffers.
    pub join_buffer_size: usize,
    /// Default timeout for `rpc` operator calls, in milliseconds.
    pub rpc_timeout_ms: u64,
    /// Logging settings.
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            dedup_window: 1024,
            join_timeout_ms: 5_000,
            join_buffer_size: 1024,
            rpc_timeout_ms: 3_000,
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Builds a config from `RELAY_*` environment variables, falling back to
    /// defaults for unset or unparsable values.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            node_id: env_or("RELAY_NODE_ID", defaults.node_id),
            dedup_window: env_or_parse("RELAY_DEDUP_WINDOW", defaults.dedup_window),
            join_timeout_ms: env_or_parse("RELAY_JOIN_TIMEOUT_MS", defaults.join_timeout_ms),
            join_buffer_size: env_or_parse("RELAY_JOIN_BUFFER_SIZE", defaults.join_buffer_size),
            rpc_timeout_ms: env_or_parse("RELAY_RPC_TIMEOUT_MS", defaults.rpc_timeout_ms),
            log: LogConfig {
                filter: env_or("RELAY_LOG", defaults.log.filter),
                json: env_or_parse("RELAY_LOG_JSON", defaults.log.json),
            },
        }
    }

    /// Parses a JSON config document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON for this structure.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Logging configuration consumed by [`init_tracing`](crate::logging::init_tracing).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    /// `EnvFilter` directive string used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
