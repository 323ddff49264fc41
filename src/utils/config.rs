// src/utils/config.rs
//! Bootstrap configuration
//!
//! The bootstrap document is JSON. It is loaded through the `config` crate
//! so that any key can be overridden from the environment with the `RTB`
//! prefix and `__` as separator, e.g. `RTB__ENGINE__QUEUE_CAPACITY=8192`.

use crate::filter::AgentFilter;
use crate::utils::backoff::BackoffConfig;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Runtime and queueing settings
    #[serde(default)]
    pub engine: RuntimeSettings,

    /// Exchange endpoints delivering bid requests
    #[serde(default)]
    pub exchanges: Vec<ExchangeEndpoint>,

    /// Optional HTTP endpoint receiving win/loss notifications
    #[serde(default)]
    pub adserver: Option<AdServerEndpoint>,

    /// Agents registered at startup
    #[serde(default)]
    pub agents: Vec<AgentDeclaration>,

    /// Limits applied to every outbound bid
    #[serde(default)]
    pub risk: RiskLimits,

    /// Reconnect policy for outbound exchange connections
    #[serde(default)]
    pub reconnect: BackoffConfig,

    /// Logging and metrics export
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Runtime, queue and auction bookkeeping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Tokio worker threads for transport I/O and dispatch
    pub worker_threads: usize,

    /// Capacity of each agent's event queue
    pub queue_capacity: usize,

    /// Response budget applied when a bid request carries no deadline
    pub default_tmax_ms: u64,

    /// How often expired auctions are evicted
    pub sweep_interval_ms: u64,

    /// How long a forwarded bid stays routable for win/loss notifications
    pub win_window_secs: u64,

    /// Maximum length of a single wire frame
    pub max_frame_bytes: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            queue_capacity: 4096,
            default_tmax_ms: 100,
            sweep_interval_ms: 50,
            win_window_secs: 900,
            max_frame_bytes: 64 * 1024,
        }
    }
}

impl RuntimeSettings {
    pub fn default_tmax(&self) -> Duration {
        Duration::from_millis(self.default_tmax_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn win_window(&self) -> Duration {
        Duration::from_secs(self.win_window_secs)
    }
}

/// Whether the engine accepts or initiates an exchange connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointMode {
    Listen,
    Connect,
}

/// One exchange endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeEndpoint {
    /// Exchange name, matched by `exchange=` filters
    pub name: String,

    pub mode: EndpointMode,

    /// `host:port`; port 0 picks an ephemeral port in listen mode
    pub address: String,

    /// Connect timeout for `connect` mode
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

/// HTTP ad server connector endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdServerEndpoint {
    pub address: String,
}

/// Agent registered at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDeclaration {
    pub name: String,

    /// Filter expression, e.g. `campaign=42,exchange=mock`
    #[serde(default)]
    pub filter: String,
}

/// Risk limits checked on `send_event`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Highest price (CPM) a single bid may carry
    pub max_bid_price: f64,

    /// Maximum number of spot bids in one response
    pub max_bids_per_response: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_bid_price: 50.0,
            max_bids_per_response: 16,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_format: LogFormat,

    /// Default directive when `RUST_LOG` is unset
    pub log_level: String,

    /// Prometheus scrape address, disabled when absent
    pub prometheus_listen: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            log_level: "info".to_string(),
            prometheus_listen: None,
        }
    }
}

impl EngineConfig {
    /// Load the bootstrap file at `path`, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.is_file() {
            return Err(EngineError::Config(format!(
                "bootstrap file not found: {}",
                path.display()
            )));
        }

        info!("Loading bootstrap configuration from {}", path.display());

        let config: EngineConfig = Config::builder()
            .add_source(File::from(path).format(FileFormat::Json).required(true))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()?;

        config.validate()?;
        debug!("Configuration loaded: {:?}", config);

        Ok(config)
    }

    /// Parse a bootstrap document held in memory
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = Config::builder()
            .add_source(File::from_str(json, FileFormat::Json))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn environment() -> Environment {
        Environment::with_prefix("RTB")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.engine.worker_threads == 0 {
            return Err(EngineError::Config("worker_threads must be at least 1".into()));
        }
        if self.engine.queue_capacity < 2 {
            return Err(EngineError::Config("queue_capacity must be at least 2".into()));
        }
        if self.engine.sweep_interval_ms == 0 {
            return Err(EngineError::Config("sweep_interval_ms must be positive".into()));
        }

        let mut names = HashSet::new();
        for exchange in &self.exchanges {
            if exchange.name.is_empty() {
                return Err(EngineError::Config("exchange name cannot be empty".into()));
            }
            if !names.insert(exchange.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate exchange name: {}",
                    exchange.name
                )));
            }
            if exchange.mode == EndpointMode::Listen {
                exchange.address.parse::<SocketAddr>().map_err(|e| {
                    EngineError::Config(format!(
                        "invalid listen address {} for {}: {}",
                        exchange.address, exchange.name, e
                    ))
                })?;
            } else if exchange.address.is_empty() {
                return Err(EngineError::Config(format!(
                    "missing address for {}",
                    exchange.name
                )));
            }
        }

        if let Some(adserver) = &self.adserver {
            adserver.address.parse::<SocketAddr>().map_err(|e| {
                EngineError::Config(format!("invalid adserver address {}: {}", adserver.address, e))
            })?;
        }

        let mut agents = HashSet::new();
        for agent in &self.agents {
            if agent.name.is_empty() {
                return Err(EngineError::Config("agent name cannot be empty".into()));
            }
            if !agents.insert(agent.name.as_str()) {
                return Err(EngineError::Config(format!("duplicate agent: {}", agent.name)));
            }
            agent.filter.parse::<AgentFilter>().map_err(|e| {
                EngineError::Config(format!("agent {}: {}", agent.name, e))
            })?;
        }

        if !(self.risk.max_bid_price > 0.0) {
            return Err(EngineError::Config("max_bid_price must be positive".into()));
        }
        if self.risk.max_bids_per_response == 0 {
            return Err(EngineError::Config("max_bids_per_response must be positive".into()));
        }

        self.reconnect.validate().map_err(EngineError::Config)?;

        Ok(())
    }
}
