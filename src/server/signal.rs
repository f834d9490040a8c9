// Signal handling module
//
// Supported signals:
// - SIGTERM: Shutdown
// - SIGINT:  Shutdown (Ctrl+C)
// - SIGQUIT: Graceful close (drain connections, then exit)
// - SIGHUP:  Restart (hand the listener to a new process)

use std::future::Future;
use std::io;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tokio::signal::unix::{signal, SignalKind};

/// Signals the controller reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Terminate,
    Interrupt,
    Quit,
    Hangup,
}

/// What the controller does with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Stop receiving signals and return.
    Shutdown,
    /// Stop receiving signals, close the listener and wait for it to drain.
    GracefulClose,
    /// Spawn a replacement process and keep listening.
    Restart,
}

/// Controller state after handling a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    Terminating,
    GracefullyClosing,
}

impl ControlSignal {
    pub const ALL: [Self; 4] = [Self::Terminate, Self::Interrupt, Self::Quit, Self::Hangup];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Interrupt => "SIGINT",
            Self::Quit => "SIGQUIT",
            Self::Hangup => "SIGHUP",
        }
    }

    /// | Signal  | Action        |
    /// |---------|---------------|
    /// | SIGTERM | Shutdown      |
    /// | SIGINT  | Shutdown      |
    /// | SIGQUIT | GracefulClose |
    /// | SIGHUP  | Restart       |
    pub const fn action(self) -> SignalAction {
        match self {
            Self::Terminate | Self::Interrupt => SignalAction::Shutdown,
            Self::Quit => SignalAction::GracefulClose,
            Self::Hangup => SignalAction::Restart,
        }
    }

    const fn os_signal(self) -> Signal {
        match self {
            Self::Terminate => Signal::SIGTERM,
            Self::Interrupt => Signal::SIGINT,
            Self::Quit => Signal::SIGQUIT,
            Self::Hangup => Signal::SIGHUP,
        }
    }
}

impl SignalAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::GracefulClose => "graceful close",
            Self::Restart => "restart",
        }
    }

    /// State entered once the action has completed successfully.
    pub const fn next_state(self) -> ControllerState {
        match self {
            Self::Shutdown => ControllerState::Terminating,
            Self::GracefulClose => ControllerState::GracefullyClosing,
            Self::Restart => ControllerState::Running,
        }
    }
}

/// Stream of control signals consumed one at a time by the controller.
pub trait SignalSource: Send {
    /// Next signal, or `None` once the source is exhausted.
    fn recv(&mut self) -> impl Future<Output = Option<ControlSignal>> + Send;

    /// Stop delivering signals. Signals arriving afterwards get the default
    /// behaviour of the process.
    fn stop(&mut self);
}

struct Streams {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

/// OS signal source for `SIGTERM`, `SIGINT`, `SIGQUIT` and `SIGHUP`.
pub struct OsSignals {
    streams: Option<Streams>,
}

impl OsSignals {
    /// Register the handlers. Must run inside a Tokio runtime.
    pub fn install() -> io::Result<Self> {
        let streams = Streams {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
        };
        tracing::debug!(pid = std::process::id(), "signal handlers registered");
        Ok(Self {
            streams: Some(streams),
        })
    }
}

impl SignalSource for OsSignals {
    async fn recv(&mut self) -> Option<ControlSignal> {
        let streams = self.streams.as_mut()?;
        tokio::select! {
            Some(()) = streams.terminate.recv() => Some(ControlSignal::Terminate),
            Some(()) = streams.interrupt.recv() => Some(ControlSignal::Interrupt),
            Some(()) = streams.quit.recv() => Some(ControlSignal::Quit),
            Some(()) = streams.hangup.recv() => Some(ControlSignal::Hangup),
            else => None,
        }
    }

    fn stop(&mut self) {
        if self.streams.take().is_none() {
            return;
        }
        for sig in ControlSignal::ALL {
            if let Err(err) = restore_default(sig.os_signal()) {
                tracing::warn!(signal = sig.name(), error = %err, "failed to restore default disposition");
            }
        }
    }
}

impl Drop for OsSignals {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(unsafe_code)]
fn restore_default(sig: Signal) -> nix::Result<()> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: SIG_DFL runs no code in signal context.
    unsafe { sigaction(sig, &action) }.map(drop)
}
