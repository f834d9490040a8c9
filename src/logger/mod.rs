//! Logger module
//!
//! Provides logging utilities for the server including:
//! - Subscriber setup from the `[logging]` configuration section
//! - Server lifecycle logging (listener acquisition, signals, restarts)
//! - Access logging with structured fields
//! - Error and warning logging

mod access;

pub use access::AccessLogEntry;

use std::net::SocketAddr;
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat, LoggingConfig};

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once is a no-op.
pub fn init(config: &LoggingConfig) -> Result<(), String> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| format!("Invalid log level '{}': {e}", config.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match config.format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| format!("Failed to install log subscriber: {e}"))?;

    let _ = INITIALIZED.set(());
    Ok(())
}

pub fn log_server_start(addr: &SocketAddr, config: &Config, inherited: bool) {
    tracing::info!(
        pid = std::process::id(),
        ppid = nix::unistd::getppid().as_raw(),
        %addr,
        inherited,
        close_timeout_secs = config.grace.close_timeout_secs,
        "serving"
    );
}

pub fn log_listener_acquired(addr: &SocketAddr, inherited: bool) {
    if inherited {
        tracing::info!(%addr, "inherited listener from parent process");
    } else {
        tracing::info!(%addr, "bound new listener");
    }
}

pub fn log_inherit_failed(err: &impl std::fmt::Display) {
    tracing::warn!(error = %err, "listener inheritance failed, binding fresh");
}

pub fn log_signal(name: &str, action: &str) {
    tracing::info!(signal = name, action, "signal received");
}

pub fn log_restart_spawned(child_pid: u32) {
    tracing::info!(child_pid, "replacement process started, waiting for it to take over");
}

pub fn log_connection_accepted(peer_addr: &SocketAddr) {
    tracing::debug!(peer = %peer_addr, "connection accepted");
}

pub fn log_connection_error(err: &impl std::fmt::Debug) {
    tracing::error!("Failed to serve connection: {err:?}");
}

pub fn log_error(message: &str) {
    tracing::error!("{message}");
}

pub fn log_warning(message: &str) {
    tracing::warn!("{message}");
}

/// Log a completed request.
pub fn log_access(entry: &AccessLogEntry) {
    tracing::info!(
        target: "access",
        remote_addr = %entry.remote_addr,
        method = %entry.method,
        path = %entry.path,
        query = entry.query.as_deref().unwrap_or("-"),
        http_version = %entry.http_version,
        status = entry.status,
        body_bytes = entry.body_bytes,
        user_agent = entry.user_agent.as_deref().unwrap_or("-"),
        request_time_us = entry.request_time_us,
        "request"
    );
}
