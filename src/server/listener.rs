// Drainable listener module
// Wraps a listener handle with a closed flag and outstanding-connection tracking

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::OwnedFd;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};

use super::connection::{DrainableConnection, Outstanding};
use super::handle::{is_closed_error, ListenerHandle, TcpHandle};
use super::restart::parent_is_init;
use crate::error::GraceError;

/// TCP address families accepted by `get_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpNetwork {
    /// `tcp`: any family, IPv4 wildcard for an empty host
    Any,
    /// `tcp4`
    V4,
    /// `tcp6`
    V6,
}

impl TcpNetwork {
    pub fn parse(network: &str) -> Result<Self, GraceError> {
        match network {
            "tcp" => Ok(Self::Any),
            "tcp4" => Ok(Self::V4),
            "tcp6" => Ok(Self::V6),
            other => Err(GraceError::NotSupportedNetwork(other.to_string())),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Any => "tcp",
            Self::V4 => "tcp4",
            Self::V6 => "tcp6",
        }
    }

    const fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }
}

/// Resolve `host:port` for the given family.
///
/// An empty host (`":6086"`) means the wildcard address of the family.
pub fn resolve_tcp_addr(network: TcpNetwork, address: &str) -> Result<SocketAddr, GraceError> {
    let resolve_err = |source: io::Error| GraceError::Resolve {
        network: network.as_str().to_string(),
        address: address.to_string(),
        source,
    };

    if let Some(port) = address.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|e| {
            resolve_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid port: {e}"),
            ))
        })?;
        let ip = match network {
            TcpNetwork::Any | TcpNetwork::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            TcpNetwork::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        return Ok(SocketAddr::new(ip, port));
    }

    address
        .to_socket_addrs()
        .map_err(resolve_err)?
        .find(|addr| network.admits(addr))
        .ok_or_else(|| {
            resolve_err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no address of the requested family",
            ))
        })
}

/// Create a `std::net::TcpListener` with `SO_REUSEADDR` (and optionally
/// `SO_REUSEPORT`) set, bound and listening on `addr`.
pub fn create_reusable_listener(
    addr: SocketAddr,
    reuse_port: bool,
) -> Result<std::net::TcpListener, GraceError> {
    let bind = || -> io::Result<std::net::TcpListener> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

        // lets a successor bind while connections of the old socket sit in TIME_WAIT
        socket.set_reuse_address(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        Ok(socket.into())
    };
    bind().map_err(|source| GraceError::Bind { addr, source })
}

/// A listener that refuses new connections once closed and whose `close`
/// waits until every accepted connection has been closed.
pub struct DrainableListener<H: ListenerHandle = TcpHandle> {
    handle: H,
    closed: RwLock<bool>,
    outstanding: Arc<Outstanding>,
}

impl<H: ListenerHandle> DrainableListener<H> {
    pub fn new(handle: H) -> Self {
        Self {
            handle,
            closed: RwLock::new(false),
            outstanding: Arc::new(Outstanding::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connections accepted and not yet closed, plus accepts in progress.
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// Wait for the next connection.
    ///
    /// Fails with [`GraceError::AlreadyClosed`] without blocking once the
    /// listener is closed, and normalises the errors a closing socket
    /// produces (closed descriptor, soft-close timeout) to the same variant.
    pub async fn accept(&self) -> Result<DrainableConnection<H::Conn>, GraceError> {
        let reservation = self.outstanding.reserve();

        if self.is_closed() {
            return Err(GraceError::AlreadyClosed);
        }

        match self.handle.accept().await {
            Ok((stream, peer_addr)) => Ok(DrainableConnection::new(
                stream,
                peer_addr,
                reservation.commit(),
            )),
            Err(err) if is_closed_error(&err) => Err(GraceError::AlreadyClosed),
            Err(err) if err.kind() == io::ErrorKind::TimedOut && self.is_closed() => {
                Err(GraceError::AlreadyClosed)
            }
            Err(err) => Err(GraceError::Io(err)),
        }
    }

    /// Stop accepting and wait until all outstanding connections are closed.
    ///
    /// Once the process has been re-parented to init the socket may be shared
    /// with a freshly spawned successor, so pending accepts are woken with an
    /// immediate deadline instead of closing the descriptor.
    pub async fn close(&self) -> Result<(), GraceError> {
        self.close_with(parent_is_init()).await
    }

    /// `close` with the re-parenting decision made by the caller: `soft`
    /// sets an immediate deadline, otherwise the handle is closed.
    pub(crate) async fn close_with(&self, soft: bool) -> Result<(), GraceError> {
        *self.closed.write().unwrap_or_else(PoisonError::into_inner) = true;

        let result = if soft {
            tracing::debug!("re-parented to init, soft-closing listener via deadline");
            self.handle.set_deadline(Instant::now())
        } else {
            self.handle.close()
        };

        tracing::debug!(
            outstanding = self.outstanding(),
            "listener closed, waiting for connections to drain"
        );
        self.outstanding.wait_zero().await;

        result.map_err(GraceError::Io)
    }

    /// Duplicate the listening descriptor for a successor process.
    pub fn file(&self) -> Result<OwnedFd, GraceError> {
        self.handle.file().map_err(GraceError::Io)
    }
}

impl DrainableListener<TcpHandle> {
    /// Bind a fresh TCP listener. Must run inside a Tokio runtime.
    pub fn bind(network: &str, address: &str, reuse_port: bool) -> Result<Self, GraceError> {
        let network = TcpNetwork::parse(network)?;
        let addr = resolve_tcp_addr(network, address)?;
        let listener = create_reusable_listener(addr, reuse_port)?;
        Ok(Self::new(TcpHandle::from_std(listener)?))
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn local_listener() -> Arc<DrainableListener> {
        Arc::new(DrainableListener::bind("tcp4", "127.0.0.1:0", false).unwrap())
    }

    #[test]
    fn test_network_tokens() {
        assert_eq!(TcpNetwork::parse("tcp").unwrap(), TcpNetwork::Any);
        assert_eq!(TcpNetwork::parse("tcp4").unwrap(), TcpNetwork::V4);
        assert_eq!(TcpNetwork::parse("tcp6").unwrap(), TcpNetwork::V6);
        assert!(matches!(
            TcpNetwork::parse("udp"),
            Err(GraceError::NotSupportedNetwork(n)) if n == "udp"
        ));
        assert!(TcpNetwork::parse("unix").is_err());
    }

    #[test]
    fn test_resolve_empty_host_is_wildcard() {
        let addr = resolve_tcp_addr(TcpNetwork::Any, ":6086").unwrap();
        assert_eq!(addr, "0.0.0.0:6086".parse().unwrap());
        let addr = resolve_tcp_addr(TcpNetwork::V6, ":6086").unwrap();
        assert_eq!(addr, "[::]:6086".parse().unwrap());
    }

    #[test]
    fn test_resolve_filters_family() {
        let addr = resolve_tcp_addr(TcpNetwork::V4, "127.0.0.1:80").unwrap();
        assert!(addr.is_ipv4());
        assert!(resolve_tcp_addr(TcpNetwork::V6, "127.0.0.1:80").is_err());
        assert!(resolve_tcp_addr(TcpNetwork::Any, ":notaport").is_err());
    }

    #[tokio::test]
    async fn test_accept_counts_outstanding() {
        let listener = local_listener();
        let addr = listener.local_addr();

        let _client = TcpStream::connect(addr).await.unwrap();
        let mut conn = listener.accept().await.unwrap();
        assert_eq!(listener.outstanding(), 1);

        conn.close().unwrap();
        assert!(conn.close().is_err());
        drop(conn);
        assert_eq!(listener.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_accept_after_close_fails_immediately() {
        let listener = local_listener();
        listener.close().await.unwrap();
        assert!(listener.is_closed());

        for _ in 0..3 {
            let result = tokio::time::timeout(Duration::from_millis(100), listener.accept())
                .await
                .expect("accept must not block after close");
            assert!(matches!(result, Err(GraceError::AlreadyClosed)));
        }
        assert_eq!(listener.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_wakes_blocked_accept() {
        let listener = local_listener();
        let accepting = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.accept().await.map(|_| ()) }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(2), listener.close())
            .await
            .expect("close must not wait on a blocked accept")
            .unwrap();

        let result = accepting.await.unwrap();
        assert!(matches!(result, Err(GraceError::AlreadyClosed)));
        assert_eq!(listener.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_waits_for_open_connections() {
        let listener = local_listener();
        let addr = listener.local_addr();

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        let conn1 = listener.accept().await.unwrap();
        let conn2 = listener.accept().await.unwrap();
        assert_eq!(listener.outstanding(), 2);

        let closing = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.close().await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!closing.is_finished());

        drop(conn1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closing.is_finished());

        drop(conn2);
        tokio::time::timeout(Duration::from_millis(500), closing)
            .await
            .expect("close must return once connections are gone")
            .unwrap()
            .unwrap();
    }

    /// Handle whose `accept` fails with a chosen error, optionally only
    /// after `close` or `set_deadline` was called.
    struct ScriptedHandle {
        error: fn() -> io::Error,
        wait_for_interrupt: bool,
        interrupted: tokio::sync::watch::Sender<bool>,
        calls: std::sync::Mutex<Vec<&'static str>>,
    }

    impl ScriptedHandle {
        fn new(error: fn() -> io::Error, wait_for_interrupt: bool) -> Self {
            let (interrupted, _) = tokio::sync::watch::channel(false);
            Self {
                error,
                wait_for_interrupt,
                interrupted,
                calls: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
            self.interrupted.send_replace(true);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ListenerHandle for ScriptedHandle {
        type Conn = tokio::io::DuplexStream;

        async fn accept(&self) -> io::Result<(Self::Conn, SocketAddr)> {
            if self.wait_for_interrupt {
                let mut rx = self.interrupted.subscribe();
                let _ = rx.wait_for(|interrupted| *interrupted).await;
            }
            Err((self.error)())
        }

        fn close(&self) -> io::Result<()> {
            self.record("close");
            Ok(())
        }

        fn file(&self) -> io::Result<OwnedFd> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        fn set_deadline(&self, _deadline: Instant) -> io::Result<()> {
            self.record("set_deadline");
            Ok(())
        }
    }

    fn timed_out() -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, "accept deadline exceeded")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_soft_close_turns_pending_timeout_into_closed() {
        let listener = Arc::new(DrainableListener::new(ScriptedHandle::new(timed_out, true)));
        let accepting = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.accept().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.outstanding(), 1);

        listener.close_with(true).await.unwrap();

        assert_eq!(listener.handle.calls(), ["set_deadline"]);
        let result = accepting.await.unwrap();
        assert!(matches!(result, Err(GraceError::AlreadyClosed)));
        assert_eq!(listener.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_hard_close_closes_handle() {
        let listener = DrainableListener::new(ScriptedHandle::new(timed_out, true));
        listener.close_with(false).await.unwrap();
        assert_eq!(listener.handle.calls(), ["close"]);
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn test_timeout_while_open_is_passed_through() {
        let listener = DrainableListener::new(ScriptedHandle::new(timed_out, false));
        let result = listener.accept().await;
        assert!(matches!(result, Err(GraceError::Io(e)) if e.kind() == io::ErrorKind::TimedOut));
        assert!(!listener.is_closed());
        assert_eq!(listener.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_other_accept_error_rolls_back_outstanding() {
        let listener = DrainableListener::new(ScriptedHandle::new(
            || io::Error::from_raw_os_error(nix::libc::EMFILE),
            false,
        ));
        for _ in 0..3 {
            let result = listener.accept().await;
            assert!(
                matches!(result, Err(GraceError::Io(e)) if e.raw_os_error() == Some(nix::libc::EMFILE))
            );
        }
        assert_eq!(listener.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_closed_socket_errors_normalise() {
        for error in [
            crate::server::handle::closed_error as fn() -> io::Error,
            || io::Error::from_raw_os_error(nix::libc::EBADF),
        ] {
            let listener = DrainableListener::new(ScriptedHandle::new(error, false));
            assert!(matches!(listener.accept().await, Err(GraceError::AlreadyClosed)));
            assert_eq!(listener.outstanding(), 0);
        }
    }

    #[tokio::test]
    async fn test_file_reports_closed_listener() {
        let listener = local_listener();
        assert!(listener.file().is_ok());
        listener.close().await.unwrap();
        assert!(listener.file().is_err());
    }
}
