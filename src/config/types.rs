// Configuration types module
// Defines all configuration-related data structures

use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub grace: GraceConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// `tcp`, `tcp4` or `tcp6`
    pub network: String,
    /// `host:port`; an empty host binds the wildcard address
    pub address: String,
    pub workers: Option<usize>,
    #[serde(default)]
    pub reuse_port: bool,
}

/// Graceful close and restart configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GraceConfig {
    /// Upper bound on waiting for connections to drain; 0 waits forever
    pub close_timeout_secs: u64,
    /// Ask the parent process to drain once a restarted child is serving
    pub notify_parent: bool,
}

impl GraceConfig {
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

/// HTTP configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub server_name: String,
    pub keep_alive: bool,
    /// Per-connection lifetime bound; 0 disables it
    pub connection_timeout_secs: u64,
}

/// Log output format
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
    Json,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    pub access_log: bool,
}
