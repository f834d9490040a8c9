// Server loop module
// HTTP/1.1 accept-and-dispatch engine driven by a drainable listener

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::sync::watch;

use super::connection::DrainableConnection;
use super::handle::ListenerHandle;
use super::listener::DrainableListener;
use crate::config::HttpConfig;
use crate::error::GraceError;
use crate::logger::{self, AccessLogEntry};

/// Request handler accepted by [`HttpServer::serve`].
pub trait Handler: Clone + Send + Sync + 'static {
    type Future: Future<Output = Response<Full<Bytes>>> + Send + 'static;

    fn call(&self, req: Request<Incoming>) -> Self::Future;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    type Future = Fut;

    fn call(&self, req: Request<Incoming>) -> Fut {
        self(req)
    }
}

/// Engine configuration, taken from the `[http]` section.
#[derive(Debug, Clone)]
pub struct ServerLoopConfig {
    pub server_name: String,
    pub keep_alive: bool,
    /// Upper bound on a single connection's lifetime; `None` means unbounded.
    pub connection_timeout: Option<Duration>,
    pub access_log: bool,
}

impl ServerLoopConfig {
    pub fn from_http(http: &HttpConfig, access_log: bool) -> Self {
        Self {
            server_name: http.server_name.clone(),
            keep_alive: http.keep_alive,
            connection_timeout: (http.connection_timeout_secs > 0)
                .then(|| Duration::from_secs(http.connection_timeout_secs)),
            access_log,
        }
    }
}

impl Default for ServerLoopConfig {
    fn default() -> Self {
        Self {
            server_name: "grace-server".to_string(),
            keep_alive: true,
            connection_timeout: None,
            access_log: false,
        }
    }
}

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// HTTP/1.1 serving engine.
///
/// Keep-alive can be switched off at runtime: new connections then serve a
/// single request, and live connections finish their in-flight request and
/// close.
pub struct HttpServer {
    config: ServerLoopConfig,
    keep_alive: watch::Sender<bool>,
}

impl HttpServer {
    pub fn new(config: ServerLoopConfig) -> Self {
        let (keep_alive, _) = watch::channel(config.keep_alive);
        Self { config, keep_alive }
    }

    pub fn set_keep_alives_enabled(&self, enabled: bool) {
        self.keep_alive.send_if_modified(|current| {
            let changed = *current != enabled;
            *current = enabled;
            changed
        });
    }

    pub fn keep_alives_enabled(&self) -> bool {
        *self.keep_alive.borrow()
    }

    /// Accept and dispatch until the listener stops.
    ///
    /// Always returns an error: [`GraceError::AlreadyClosed`] after a
    /// graceful close, anything else for a fatal accept failure.
    pub async fn serve<H, L>(&self, listener: Arc<DrainableListener<L>>, handler: H) -> GraceError
    where
        H: Handler,
        L: ListenerHandle,
    {
        let mut backoff: Option<Duration> = None;

        loop {
            match listener.accept().await {
                Ok(conn) => {
                    backoff = None;
                    if self.config.access_log {
                        logger::log_connection_accepted(&conn.peer_addr());
                    }
                    self.spawn_connection(conn, handler.clone());
                }
                Err(GraceError::AlreadyClosed) => return GraceError::AlreadyClosed,
                Err(GraceError::Io(err)) if is_transient(&err) => {
                    let delay = backoff.map_or(MIN_BACKOFF, |d| (d * 2).min(MAX_BACKOFF));
                    backoff = Some(delay);
                    tracing::warn!(error = %err, retry_in = ?delay, "accept failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    logger::log_error(&format!("accept failed: {err}"));
                    return err;
                }
            }
        }
    }

    fn spawn_connection<H, S>(&self, conn: DrainableConnection<S>, handler: H)
    where
        H: Handler,
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let peer_addr = conn.peer_addr();
        let mut keep_alive_rx = self.keep_alive.subscribe();
        let keep_alive = *keep_alive_rx.borrow_and_update();
        let config = self.config.clone();

        tokio::spawn(async move {
            let server_name = config.server_name.clone();
            let access_log = config.access_log;
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                let server_name = server_name.clone();
                async move {
                    let started = Instant::now();
                    let mut entry = access_log.then(|| AccessLogEntry::from_request(peer_addr, &req));
                    let mut response = handler.call(req).await;
                    if let Ok(value) = server_name.parse() {
                        response.headers_mut().insert(hyper::header::SERVER, value);
                    }
                    if let Some(entry) = entry.as_mut() {
                        entry.finish(&response, started.elapsed());
                        logger::log_access(entry);
                    }
                    Ok::<_, Infallible>(response)
                }
            });

            let mut builder = http1::Builder::new();
            builder.keep_alive(keep_alive);
            let connection = builder.serve_connection(TokioIo::new(conn), service);
            tokio::pin!(connection);

            let deadline = async {
                match config.connection_timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);

            let mut draining = !keep_alive;
            loop {
                tokio::select! {
                    result = connection.as_mut() => {
                        if let Err(err) = result {
                            logger::log_connection_error(&err);
                        }
                        break;
                    }
                    changed = keep_alive_rx.changed(), if !draining => {
                        // a dropped engine counts as keep-alive off
                        if changed.is_err() || !*keep_alive_rx.borrow_and_update() {
                            draining = true;
                            connection.as_mut().graceful_shutdown();
                        }
                    }
                    () = &mut deadline => {
                        logger::log_warning(&format!(
                            "connection from {peer_addr} exceeded {:?}, closing",
                            config.connection_timeout.unwrap_or_default()
                        ));
                        break;
                    }
                }
            }
        });
    }
}

/// Accept errors worth retrying: the listener is fine, the system is busy or
/// the peer went away before the handshake completed.
fn is_transient(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::TimedOut || err.kind() == io::ErrorKind::ConnectionAborted {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(code) if code == nix::libc::EMFILE
            || code == nix::libc::ENFILE
            || code == nix::libc::ENOBUFS
            || code == nix::libc::ENOMEM
            || code == nix::libc::ECONNABORTED
    )
}
