// Listener capability module
// The four operations a listener must offer to take part in a graceful restart

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A listening socket that can be drained and handed to a successor process.
///
/// Exactly these four operations are required:
///
/// | Operation      | Used by                                    |
/// |----------------|--------------------------------------------|
/// | `accept`       | the serving engine's accept loop            |
/// | `close`        | hard close while the original parent lives |
/// | `file`         | descriptor extraction for restart          |
/// | `set_deadline` | soft close once re-parented to init        |
pub trait ListenerHandle: Send + Sync + 'static {
    /// Stream type produced by `accept`.
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next connection.
    ///
    /// Fails with a `TimedOut` error once the deadline set by `set_deadline`
    /// has passed, and with a closed-socket error after `close`.
    fn accept(&self) -> impl Future<Output = io::Result<(Self::Conn, SocketAddr)>> + Send;

    /// Close the socket in this process. A second call returns an error.
    fn close(&self) -> io::Result<()>;

    /// Duplicate the underlying descriptor.
    fn file(&self) -> io::Result<OwnedFd>;

    /// Make pending and future `accept` calls time out at `deadline`.
    fn set_deadline(&self, deadline: Instant) -> io::Result<()>;
}

/// Marker carried inside the `io::Error` returned by a closed handle.
#[derive(Debug)]
struct HandleClosed;

impl fmt::Display for HandleClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(CLOSED_MESSAGE)
    }
}

impl std::error::Error for HandleClosed {}

const CLOSED_MESSAGE: &str = "use of closed network connection";

/// The error a closed handle reports.
pub fn closed_error() -> io::Error {
    io::Error::other(HandleClosed)
}

/// Classify an accept error as "the socket is closed".
///
/// Checks the structured marker first, then the errno values the kernel uses
/// for a closed or shut down listening socket, and only then the message text.
pub fn is_closed_error(err: &io::Error) -> bool {
    if err
        .get_ref()
        .is_some_and(|inner| inner.is::<HandleClosed>())
    {
        return true;
    }
    if let Some(code) = err.raw_os_error() {
        return code == nix::libc::EBADF || code == nix::libc::EINVAL;
    }
    err.to_string().ends_with(CLOSED_MESSAGE)
}

/// `ListenerHandle` over a Tokio `TcpListener`.
///
/// Closing drops this handle's reference to the socket and wakes every
/// pending `accept`; the descriptor is released once the last in-flight
/// accept unwinds.
pub struct TcpHandle {
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    closed: CancellationToken,
    deadline: watch::Sender<Option<Instant>>,
}

impl TcpHandle {
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (deadline, _) = watch::channel(None);
        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            closed: CancellationToken::new(),
            deadline,
        })
    }

    /// Adopt a blocking std listener. Must run inside a Tokio runtime.
    pub fn from_std(listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Self::new(TcpListener::from_std(listener)?)
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn current(&self) -> io::Result<Arc<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(closed_error)
    }
}

impl ListenerHandle for TcpHandle {
    type Conn = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        async move {
            let listener = self.current()?;
            let mut deadline_rx = self.deadline.subscribe();

            loop {
                let deadline = *deadline_rx.borrow_and_update();
                let expired = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at.into()).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    biased;

                    () = self.closed.cancelled() => return Err(closed_error()),

                    accepted = listener.accept() => return accepted,

                    () = expired => {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "accept deadline exceeded",
                        ));
                    }

                    changed = deadline_rx.changed() => {
                        // sender lives as long as self; treat a drop as closure
                        if changed.is_err() {
                            return Err(closed_error());
                        }
                    }
                }
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        let taken = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.cancel();
        match taken {
            Some(_) => Ok(()),
            None => Err(closed_error()),
        }
    }

    fn file(&self) -> io::Result<OwnedFd> {
        self.current()?.as_fd().try_clone_to_owned()
    }

    fn set_deadline(&self, deadline: Instant) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.deadline.send_replace(Some(deadline));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn local_handle() -> TcpHandle {
        TcpHandle::new(TcpListener::bind("127.0.0.1:0").await.unwrap()).unwrap()
    }

    #[test]
    fn test_closed_error_classification() {
        assert!(is_closed_error(&closed_error()));
        assert!(is_closed_error(&io::Error::from_raw_os_error(
            nix::libc::EBADF
        )));
        assert!(is_closed_error(&io::Error::new(
            io::ErrorKind::Other,
            "accept tcp [::]:6086: use of closed network connection"
        )));
        assert!(!is_closed_error(&io::Error::from_raw_os_error(
            nix::libc::ECONNABORTED
        )));
        assert!(!is_closed_error(&io::Error::new(
            io::ErrorKind::TimedOut,
            "accept deadline exceeded"
        )));
    }

    #[tokio::test]
    async fn test_accept_returns_connection() {
        let handle = local_handle().await;
        let addr = handle.local_addr();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (_stream, peer) = handle.accept().await.unwrap();
        let client = client.await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_accept() {
        let handle = Arc::new(local_handle().await);
        let pending = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move { handle.accept().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.close().unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(is_closed_error(&err));
    }

    #[tokio::test]
    async fn test_second_close_reports_closed() {
        let handle = local_handle().await;
        handle.close().unwrap();
        assert!(is_closed_error(&handle.close().unwrap_err()));
        assert!(handle.file().is_err());
        assert!(handle.set_deadline(Instant::now()).is_err());
    }

    #[tokio::test]
    async fn test_deadline_times_out_pending_accept() {
        let handle = Arc::new(local_handle().await);
        let pending = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move { handle.accept().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.set_deadline(Instant::now()).unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_file_duplicates_descriptor() {
        use std::os::fd::AsRawFd;

        let handle = local_handle().await;
        let fd = handle.file().unwrap();
        let original = handle.current().unwrap();
        assert_ne!(fd.as_raw_fd(), original.as_fd().as_raw_fd());

        let socket = socket2::Socket::from(fd);
        let addr = socket.local_addr().unwrap().as_socket().unwrap();
        assert_eq!(addr, handle.local_addr());
    }
}
