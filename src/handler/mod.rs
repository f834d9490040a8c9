//! Request handler module
//!
//! Demo handler served by the binary: a greeting carrying the pid, so a
//! restart is visible from the client side, and a JSON status endpoint.

use std::future::{ready, Ready};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;

use crate::server::{DrainableListener, Handler};

/// Snapshot reported by `/status`.
#[derive(Debug, Serialize)]
pub struct Status {
    pub pid: u32,
    pub ppid: i32,
    pub restarted: bool,
    pub outstanding: usize,
}

/// Handler for `/` and `/status`.
#[derive(Clone)]
pub struct DemoHandler {
    listener: Arc<DrainableListener>,
    restarted: bool,
}

impl DemoHandler {
    pub const fn new(listener: Arc<DrainableListener>, restarted: bool) -> Self {
        Self {
            listener,
            restarted,
        }
    }

    fn status(&self) -> Status {
        Status {
            pid: std::process::id(),
            ppid: nix::unistd::getppid().as_raw(),
            restarted: self.restarted,
            outstanding: self.listener.outstanding(),
        }
    }
}

impl Handler for DemoHandler {
    type Future = Ready<Response<Full<Bytes>>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        ready(route(req.uri().path(), || self.status()))
    }
}

/// Build the response for `path`; `status` is only evaluated for `/status`.
pub fn route(path: &str, status: impl FnOnce() -> Status) -> Response<Full<Bytes>> {
    match path {
        "/" => text(
            StatusCode::OK,
            format!("Welcome to the home page!{}", std::process::id()),
        ),
        "/status" => match serde_json::to_vec(&status()) {
            Ok(body) => build(StatusCode::OK, "application/json", body),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        _ => text(StatusCode::NOT_FOUND, "404 Not Found".to_string()),
    }
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    build(status, "text/plain; charset=utf-8", body.into_bytes())
}

fn build(status: StatusCode, content_type: &'static str, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    response
}
