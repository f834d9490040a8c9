// Error types
// Every fallible operation of the listener, controller and restart path returns GraceError

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Errors produced by the graceful-restart machinery.
#[derive(Debug, thiserror::Error)]
pub enum GraceError {
    /// The listener was used after `close`. Callers treat this as "stop accepting".
    #[error("listener already closed")]
    AlreadyClosed,

    /// A network token other than `tcp`, `tcp4` or `tcp6` was requested.
    #[error("network type {0:?} is not supported")]
    NotSupportedNetwork(String),

    /// `restart` was called without a listener to hand over.
    #[error("no listener for restart")]
    RestartListenerMissing,

    /// Draining did not finish within the configured close timeout.
    /// The close itself keeps running in the background.
    #[error("listener close timed out after {0:?}")]
    ListenerCloseTimeout(Duration),

    #[error("failed to resolve {network} address {address:?}: {source}")]
    Resolve {
        network: String,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot inherit listener from fd {fd}: {reason}")]
    Inherit { fd: i32, reason: String },

    #[error("cannot locate executable {name:?}: {source}")]
    Executable {
        name: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn replacement process {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl GraceError {
    /// `true` for the expected "listener closed" outcome of an accept loop.
    pub const fn is_already_closed(&self) -> bool {
        matches!(self, Self::AlreadyClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_closed_helper() {
        assert!(GraceError::AlreadyClosed.is_already_closed());
        assert!(!GraceError::RestartListenerMissing.is_already_closed());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            GraceError::NotSupportedNetwork("udp".to_string()).to_string(),
            "network type \"udp\" is not supported"
        );
        assert_eq!(
            GraceError::RestartListenerMissing.to_string(),
            "no listener for restart"
        );
        let err = GraceError::ListenerCloseTimeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "listener close timed out after 10s");
    }
}
