//! MeshBase Configuration
//!
//! This module provides configuration structures for a MeshBase
//! replication node.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main MeshBase configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshBaseConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Identifier resolution configuration
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Per-peer proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Known peers (identifier to socket address)
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Replica eviction configuration
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identifier of this mesh base (resolved with protocol guessing)
    pub identifier: String,

    /// Address to bind for peer communication
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Identifier resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Recognized schemes, in match order
    #[serde(default = "default_schemes")]
    pub schemes: Vec<String>,

    /// Scheme inserted when guessing a bare host name
    #[serde(default = "default_scheme")]
    pub default_scheme: String,
}

/// Per-peer proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Deadline for a request to be answered, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long a local mutation waits for a queued lock grant, in milliseconds
    #[serde(default = "default_lock_wait_timeout_ms")]
    pub lock_wait_timeout_ms: u64,

    /// Consecutive request timeouts before the peer is treated as failed (0 = never)
    #[serde(default = "default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delivery attempts before a peer is reported as unreachable
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial retry delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum retry delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Port used when a peer identifier has no address book entry
    #[serde(default = "default_peer_port")]
    pub default_port: u16,

    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// A known peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer mesh base identifier
    pub identifier: String,

    /// Socket address (host:port) of the peer's transport
    pub address: String,
}

/// Replica eviction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Enable periodic sweeping
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sweep interval in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_schemes() -> Vec<String> {
    vec!["http".to_string(), "https".to_string(), "file".to_string()]
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_lock_wait_timeout_ms() -> u64 {
    10000
}

fn default_max_consecutive_timeouts() -> u32 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_peer_port() -> u16 {
    7654
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            schemes: default_schemes(),
            default_scheme: default_scheme(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            lock_wait_timeout_ms: default_lock_wait_timeout_ms(),
            max_consecutive_timeouts: default_max_consecutive_timeouts(),
        }
    }
}

impl ProxyConfig {
    /// Get the request deadline as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get the lock wait deadline as Duration
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            default_port: default_peer_port(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl TransportConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Backoff delay before the given retry (1-indexed), capped at `max_backoff_ms`
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl SweeperConfig {
    /// Get sweep interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl MeshBaseConfig {
    /// Minimal configuration for a node, all other sections defaulted
    pub fn for_node(identifier: impl Into<String>, bind_address: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                identifier: identifier.into(),
                bind_address: bind_address.into(),
                advertise_address: None,
            },
            resolver: ResolverConfig::default(),
            proxy: ProxyConfig::default(),
            transport: TransportConfig::default(),
            peers: Vec::new(),
            sweeper: SweeperConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: MeshBaseConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.identifier.trim().is_empty() {
            return Err(crate::Error::Config("node.identifier cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.resolver.schemes.is_empty() {
            return Err(crate::Error::Config("resolver.schemes cannot be empty".into()));
        }

        if !self
            .resolver
            .schemes
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&self.resolver.default_scheme))
        {
            return Err(crate::Error::Config(format!(
                "resolver.default_scheme '{}' is not one of the configured schemes",
                self.resolver.default_scheme
            )));
        }

        if self.transport.max_attempts == 0 {
            return Err(crate::Error::Config("transport.max_attempts must be at least 1".into()));
        }

        for peer in &self.peers {
            if peer.identifier.trim().is_empty() || peer.address.is_empty() {
                return Err(crate::Error::Config(
                    "every [[peers]] entry needs an identifier and an address".into(),
                ));
            }
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }
}
