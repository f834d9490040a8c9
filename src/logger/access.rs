//! Access log entry
//!
//! Collected per request by the serving engine and emitted through
//! [`super::log_access`] as structured fields.

use std::net::SocketAddr;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};

/// Access log entry containing all request/response information
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    /// Client address
    pub remote_addr: SocketAddr,
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Request URI path
    pub path: String,
    /// Query string (without leading ?)
    pub query: Option<String>,
    /// HTTP version as reported by hyper
    pub http_version: String,
    /// Response status code
    pub status: u16,
    /// Response body size in bytes
    pub body_bytes: u64,
    /// User-Agent header
    pub user_agent: Option<String>,
    /// Request processing time in microseconds
    pub request_time_us: u64,
}

impl AccessLogEntry {
    pub fn from_request<B>(remote_addr: SocketAddr, req: &Request<B>) -> Self {
        Self {
            remote_addr,
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            http_version: format!("{:?}", req.version()),
            status: 0,
            body_bytes: 0,
            user_agent: req
                .headers()
                .get(hyper::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            request_time_us: 0,
        }
    }

    /// Fill in the response side.
    pub fn finish(&mut self, response: &Response<Full<Bytes>>, elapsed: Duration) {
        self.status = response.status().as_u16();
        self.body_bytes = response.body().size_hint().exact().unwrap_or(0);
        self.request_time_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    #[test]
    fn test_entry_from_request_and_response() {
        let req = Request::builder()
            .uri("/status?verbose=1")
            .header("user-agent", "curl/8.0")
            .body(())
            .unwrap();
        let mut entry = AccessLogEntry::from_request("10.0.0.1:5000".parse().unwrap(), &req);
        assert_eq!(entry.method, "GET");
        assert_eq!(entry.path, "/status");
        assert_eq!(entry.query.as_deref(), Some("verbose=1"));
        assert_eq!(entry.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(entry.http_version, "HTTP/1.1");

        let response = Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"missing")))
            .unwrap();
        entry.finish(&response, Duration::from_micros(250));
        assert_eq!(entry.status, 404);
        assert_eq!(entry.body_bytes, 7);
        assert_eq!(entry.request_time_us, 250);
    }
}
