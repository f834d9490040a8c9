// Connection accounting module
// Outstanding-connection counter and the connection wrapper that releases it exactly once

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;

use super::handle::closed_error;

/// Number of accepted connections that have not been closed yet.
///
/// Works like a wait group: `add` before handing a connection out, `done`
/// when it is closed, `wait_zero` blocks until every connection is gone.
#[derive(Debug, Default)]
pub struct Outstanding {
    count: AtomicUsize,
    drained: Notify,
}

impl Outstanding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement, never below zero. Wakes `wait_zero` callers on the last one.
    pub fn done(&self) {
        let prev = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match prev {
            Ok(1) => self.drained.notify_waiters(),
            Ok(_) => {}
            Err(_) => tracing::warn!("outstanding connection counter released below zero"),
        }
    }

    /// Reserve a slot that is rolled back unless committed.
    pub fn reserve(self: &Arc<Self>) -> Reservation {
        self.add();
        Reservation {
            outstanding: Arc::clone(self),
            committed: false,
        }
    }

    pub async fn wait_zero(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // register before reading the count so a concurrent `done` is not lost
            notified.as_mut().enable();
            if self.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// A speculative increment of [`Outstanding`].
///
/// Dropping it without [`Reservation::commit`] undoes the increment, which
/// also covers an accept future that is cancelled mid-flight.
pub struct Reservation {
    outstanding: Arc<Outstanding>,
    committed: bool,
}

impl Reservation {
    pub fn commit(mut self) -> Arc<Outstanding> {
        self.committed = true;
        Arc::clone(&self.outstanding)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.outstanding.done();
        }
    }
}

/// An accepted connection tied to its listener's outstanding counter.
///
/// The counter is released exactly once: on the first `close`, or on drop if
/// `close` was never called. Serving engines that close a connection on more
/// than one code path cannot double-count.
pub struct DrainableConnection<S> {
    stream: Option<S>,
    peer_addr: SocketAddr,
    outstanding: Arc<Outstanding>,
    released: AtomicBool,
}

impl<S> DrainableConnection<S> {
    pub(crate) fn new(stream: S, peer_addr: SocketAddr, outstanding: Arc<Outstanding>) -> Self {
        Self {
            stream: Some(stream),
            peer_addr,
            outstanding,
            released: AtomicBool::new(false),
        }
    }

    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Close the stream. Later calls fail but never release the counter again.
    pub fn close(&mut self) -> io::Result<()> {
        let stream = self.stream.take();
        self.release();
        match stream {
            Some(stream) => {
                drop(stream);
                Ok(())
            }
            None => Err(closed_error()),
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.outstanding.done();
        }
    }
}

impl<S> Drop for DrainableConnection<S> {
    fn drop(&mut self) {
        // stream first, so the peer sees the close before the drain can finish
        drop(self.stream.take());
        self.release();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DrainableConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DrainableConnection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            None => Poll::Ready(Err(not_connected())),
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(AsyncWrite::is_write_vectored)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection already closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn connection(outstanding: &Arc<Outstanding>) -> DrainableConnection<tokio::io::DuplexStream> {
        let (stream, _peer) = tokio::io::duplex(64);
        DrainableConnection::new(
            stream,
            "127.0.0.1:9".parse().unwrap(),
            outstanding.reserve().commit(),
        )
    }

    #[test]
    fn test_reservation_rolls_back_unless_committed() {
        let outstanding = Arc::new(Outstanding::new());
        let reservation = outstanding.reserve();
        assert_eq!(outstanding.get(), 1);
        drop(reservation);
        assert_eq!(outstanding.get(), 0);

        let committed = outstanding.reserve().commit();
        assert_eq!(committed.get(), 1);
    }

    #[test]
    fn test_done_never_goes_negative() {
        let outstanding = Outstanding::new();
        outstanding.done();
        assert_eq!(outstanding.get(), 0);
    }

    #[tokio::test]
    async fn test_repeated_close_releases_once() {
        let outstanding = Arc::new(Outstanding::new());
        let mut first = connection(&outstanding);
        let _second = connection(&outstanding);
        assert_eq!(outstanding.get(), 2);

        first.close().unwrap();
        assert_eq!(outstanding.get(), 1);
        assert!(first.close().is_err());
        assert!(first.close().is_err());
        assert_eq!(outstanding.get(), 1);

        drop(first);
        assert_eq!(outstanding.get(), 1);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let outstanding = Arc::new(Outstanding::new());
        let conn = connection(&outstanding);
        assert_eq!(outstanding.get(), 1);
        drop(conn);
        assert_eq!(outstanding.get(), 0);
    }

    #[tokio::test]
    async fn test_io_after_close() {
        let outstanding = Arc::new(Outstanding::new());
        let mut conn = connection(&outstanding);
        conn.close().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        let err = conn.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_wait_zero_blocks_until_drained() {
        let outstanding = Arc::new(Outstanding::new());
        let conn = connection(&outstanding);

        let waiter = tokio::spawn({
            let outstanding = Arc::clone(&outstanding);
            async move { outstanding.wait_zero().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(conn);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
