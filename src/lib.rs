//! Graceful restart for TCP servers.
//!
//! A [`server::DrainableListener`] stops accepting on close and waits for
//! every accepted connection to finish. The [`server::ServiceController`]
//! hands the listening socket to a replacement process on `SIGHUP`, drains on
//! `SIGQUIT` and stops on `SIGTERM`/`SIGINT`.

#[cfg(not(unix))]
compile_error!("grace_server relies on POSIX signals and descriptor inheritance");

pub mod config;
pub mod error;
pub mod handler;
pub mod logger;
pub mod server;

pub use error::GraceError;
