// Service controller module
// Listener acquisition, serving, draining and restart driven by signals

use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::unistd::getppid;

use super::handle::{ListenerHandle, TcpHandle};
use super::listener::DrainableListener;
use super::restart::{
    count_markers, inherit_from_fd, notify_drain, parent_is_init, restart_requested, Relaunch,
    INHERITED_FD,
};
use super::server_loop::{Handler, HttpServer, ServerLoopConfig};
use super::signal::{ControllerState, OsSignals, SignalAction, SignalSource};
use crate::config::Config;
use crate::error::GraceError;
use crate::logger;

/// Owns the close-timeout policy and the serving engine of one process.
pub struct ServiceController {
    close_timeout: Duration,
    reuse_port: bool,
    loop_config: ServerLoopConfig,
    /// Command line for replacement processes; `None` re-runs this one.
    command: Option<Vec<OsString>>,
    engine: Mutex<Option<Arc<HttpServer>>>,
    last_restart: Mutex<Option<u32>>,
}

impl ServiceController {
    /// `close_timeout` of zero waits for the drain indefinitely.
    pub fn new(close_timeout: Duration, loop_config: ServerLoopConfig) -> Self {
        Self {
            close_timeout,
            reuse_port: false,
            loop_config,
            command: None,
            engine: Mutex::new(None),
            last_restart: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            close_timeout: config.grace.close_timeout(),
            reuse_port: config.server.reuse_port,
            loop_config: ServerLoopConfig::from_http(&config.http, config.logging.access_log),
            command: None,
            engine: Mutex::new(None),
            last_restart: Mutex::new(None),
        }
    }

    /// Start replacement processes with `args` instead of this process's own
    /// command line. `args[0]` is resolved like `argv[0]`.
    #[must_use]
    pub fn with_command(mut self, args: Vec<OsString>) -> Self {
        self.command = Some(args);
        self
    }

    /// Pid of the most recent replacement process started by `restart`.
    pub fn last_restart_pid(&self) -> Option<u32> {
        *self.last_restart.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Listener for `network`/`address`: the inherited one after a restart,
    /// a freshly bound one otherwise.
    ///
    /// Returns the listener and whether it was inherited.
    pub fn get_listener(
        &self,
        network: &str,
        address: &str,
    ) -> Result<(DrainableListener, bool), GraceError> {
        if restart_requested() {
            match self.inherit_listener() {
                Ok(listener) => {
                    logger::log_listener_acquired(&listener.local_addr(), true);
                    return Ok((listener, true));
                }
                Err(err) => logger::log_inherit_failed(&err),
            }
        }

        let listener = DrainableListener::bind(network, address, self.reuse_port)?;
        logger::log_listener_acquired(&listener.local_addr(), false);
        Ok((listener, false))
    }

    /// Adopt the listener passed down at descriptor slot 3.
    pub fn inherit_listener(&self) -> Result<DrainableListener, GraceError> {
        let listener = inherit_from_fd(INHERITED_FD)?;
        Ok(DrainableListener::new(TcpHandle::from_std(listener)?))
    }

    /// Serve `handler` on `listener` until it is closed.
    ///
    /// Returns the terminal error, [`GraceError::AlreadyClosed`] after a
    /// graceful close.
    pub async fn serve<L, H>(&self, listener: Arc<DrainableListener<L>>, handler: H) -> GraceError
    where
        L: ListenerHandle,
        H: Handler,
    {
        let engine = Arc::new(HttpServer::new(self.loop_config.clone()));
        *self.lock_engine() = Some(Arc::clone(&engine));

        let err = engine.serve(listener, handler).await;

        self.lock_engine().take();
        err
    }

    /// Ask the parent process to drain (`SIGQUIT`). A no-op once the parent
    /// has exited.
    pub fn close_parent_service(&self) -> Result<(), GraceError> {
        if parent_is_init() {
            return Ok(());
        }
        let parent = getppid();
        tracing::info!(ppid = parent.as_raw(), "asking parent process to drain");
        notify_drain(parent)
    }

    /// Stop accepting and wait for connections to drain, bounded by the
    /// close timeout. On timeout the close keeps running in the background.
    pub async fn close_listener<L: ListenerHandle>(
        &self,
        listener: &Arc<DrainableListener<L>>,
    ) -> Result<(), GraceError> {
        if let Some(engine) = self.lock_engine().as_ref() {
            engine.set_keep_alives_enabled(false);
        }

        let closing = tokio::spawn({
            let listener = Arc::clone(listener);
            async move { listener.close().await }
        });

        if self.close_timeout.is_zero() {
            return closing.await.map_err(join_error)?;
        }

        tokio::select! {
            result = closing => result.map_err(join_error)?,
            () = tokio::time::sleep(self.close_timeout) => {
                tracing::warn!(
                    timeout = ?self.close_timeout,
                    outstanding = listener.outstanding(),
                    "listener did not drain in time"
                );
                Err(GraceError::ListenerCloseTimeout(self.close_timeout))
            }
        }
    }

    /// Start a replacement process that inherits `listener` and return its pid.
    pub fn restart<L: ListenerHandle>(
        &self,
        listener: Option<&DrainableListener<L>>,
    ) -> Result<u32, GraceError> {
        let listener = listener.ok_or(GraceError::RestartListenerMissing)?;
        let listener_fd = listener.file()?;
        let relaunch = match &self.command {
            Some(args) => Relaunch::with_args(listener_fd, args.clone())?,
            None => Relaunch::current(listener_fd)?,
        };
        tracing::debug!(
            program = %relaunch.program.display(),
            cwd = %relaunch.cwd.display(),
            markers = count_markers(&relaunch.env),
            "spawning replacement process"
        );
        let pid = relaunch.spawn()?;
        *self.last_restart.lock().unwrap_or_else(PoisonError::into_inner) = Some(pid);
        logger::log_restart_spawned(pid);
        Ok(pid)
    }

    /// Block on OS signals and drive the controller until it terminates or
    /// finishes a graceful close.
    pub async fn wait_signal<L: ListenerHandle>(
        &self,
        listener: Option<&Arc<DrainableListener<L>>>,
    ) -> Result<ControllerState, GraceError> {
        let signals = OsSignals::install()?;
        self.run_signal_loop(signals, listener).await
    }

    /// Handle signals from `signals` strictly one at a time.
    pub async fn run_signal_loop<S, L>(
        &self,
        mut signals: S,
        listener: Option<&Arc<DrainableListener<L>>>,
    ) -> Result<ControllerState, GraceError>
    where
        S: SignalSource,
        L: ListenerHandle,
    {
        loop {
            let Some(sig) = signals.recv().await else {
                tracing::debug!("signal source closed");
                return Ok(ControllerState::Terminating);
            };

            let action = sig.action();
            logger::log_signal(sig.name(), action.as_str());

            match action {
                SignalAction::Shutdown => {
                    signals.stop();
                }
                SignalAction::GracefulClose => {
                    signals.stop();
                    if let Some(listener) = listener {
                        self.close_listener(listener).await?;
                    }
                }
                SignalAction::Restart => {
                    self.restart(listener.map(Arc::as_ref))?;
                }
            }

            let state = action.next_state();
            if state != ControllerState::Running {
                return Ok(state);
            }
        }
    }

    fn lock_engine(&self) -> std::sync::MutexGuard<'_, Option<Arc<HttpServer>>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn join_error(err: tokio::task::JoinError) -> GraceError {
    GraceError::Io(std::io::Error::other(err))
}
