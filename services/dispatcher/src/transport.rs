use std::{
    collections::HashMap,
    net::{TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use schema::{ParameterStore, Request, SessionStore};

use crate::{
    config::{DEFAULT_HINT_PARAMETER, DEFAULT_SESSION_COOKIE, DispatcherConfig},
    registry::ServerRegistry,
    session::SessionRegistry,
};

mod http;
mod request;
mod routes;
mod server_runtime;
#[cfg(test)]
mod tests;

pub(crate) use http::{HttpRequest, HttpResponse};
use http::{render_response_bytes, write_backpressure_response, write_response};
pub(crate) use request::build_dispatch_request;
use request::{parse_request_line, read_http_request};
pub(crate) use routes::handle_request;
pub use server_runtime::serve_http_with_workers;

pub(crate) const MAX_HTTP_BODY_BYTES: usize = 16 * 1024 * 1024;
const SOCKET_TIMEOUT_SECS: u64 = 5;
const DEFAULT_HTTP_WORKERS: usize = 4;

#[derive(Debug)]
pub(crate) struct TransportBackpressureMetrics {
    pub(crate) queue_depth: AtomicUsize,
    pub(crate) queue_capacity: usize,
    pub(crate) queue_full_reject_total: AtomicU64,
}

impl TransportBackpressureMetrics {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        Self {
            queue_depth: AtomicUsize::new(0),
            queue_capacity,
            queue_full_reject_total: AtomicU64::new(0),
        }
    }

    pub(crate) fn observe_enqueued(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_dequeued(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            });
    }

    pub(crate) fn observe_rejected(&self) {
        self.queue_full_reject_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by every transport worker: the application registry plus
/// the HTTP-to-request mapping settings.
pub struct DispatchRuntime {
    registry: Arc<ServerRegistry>,
    sessions: Arc<SessionRegistry>,
    hint_parameter: String,
    session_cookie: String,
    queue_capacity: usize,
    transport_backpressure: RwLock<Option<Arc<TransportBackpressureMetrics>>>,
    http_requests_total: AtomicU64,
    http_bad_request_total: AtomicU64,
    started_at: Instant,
}

pub type SharedRuntime = Arc<DispatchRuntime>;

impl DispatchRuntime {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self {
            registry,
            sessions: Arc::new(SessionRegistry::new()),
            hint_parameter: DEFAULT_HINT_PARAMETER.to_string(),
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            queue_capacity: 0,
            transport_backpressure: RwLock::new(None),
            http_requests_total: AtomicU64::new(0),
            http_bad_request_total: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn from_config(registry: Arc<ServerRegistry>, config: &DispatcherConfig) -> Self {
        Self::new(registry)
            .with_hint_parameter(&config.dataset_hint_parameter)
            .with_session_cookie(&config.session_cookie)
            .with_queue_capacity(config.http_queue_capacity)
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_hint_parameter(mut self, parameter: &str) -> Self {
        self.hint_parameter = parameter.to_string();
        self
    }

    pub fn with_session_cookie(mut self, cookie: &str) -> Self {
        self.session_cookie = cookie.to_string();
        self
    }

    /// Zero lets the worker pool size the queue from its worker count.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub(crate) fn set_transport_backpressure_metrics(
        &self,
        metrics: Arc<TransportBackpressureMetrics>,
    ) {
        *self.transport_backpressure.write() = Some(metrics);
    }

    fn observe_http_request(&self) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_bad_request(&self) {
        self.http_bad_request_total.fetch_add(1, Ordering::Relaxed);
    }

    fn metrics_text(&self) -> String {
        let (queue_depth, queue_capacity, queue_full_reject_total) =
            match self.transport_backpressure.read().as_ref() {
                Some(metrics) => (
                    metrics.queue_depth.load(Ordering::Relaxed),
                    metrics.queue_capacity,
                    metrics.queue_full_reject_total.load(Ordering::Relaxed),
                ),
                None => (0, 0, 0),
            };
        format!(
            "{}# TYPE dispatch_http_requests_total counter\n\
dispatch_http_requests_total {}\n\
# TYPE dispatch_http_bad_request_total counter\n\
dispatch_http_bad_request_total {}\n\
# TYPE dispatch_transport_queue_depth gauge\n\
dispatch_transport_queue_depth {}\n\
# TYPE dispatch_transport_queue_capacity gauge\n\
dispatch_transport_queue_capacity {}\n\
# TYPE dispatch_transport_queue_full_reject_total counter\n\
dispatch_transport_queue_full_reject_total {}\n\
# TYPE dispatch_sessions gauge\n\
dispatch_sessions {}\n\
# TYPE dispatch_uptime_seconds gauge\n\
dispatch_uptime_seconds {:.3}\n",
            self.registry.metrics_text(),
            self.http_requests_total.load(Ordering::Relaxed),
            self.http_bad_request_total.load(Ordering::Relaxed),
            queue_depth,
            queue_capacity,
            queue_full_reject_total,
            self.sessions.len(),
            self.started_at.elapsed().as_secs_f64()
        )
    }
}

pub fn serve_http(runtime: DispatchRuntime, bind_addr: &str) -> std::io::Result<()> {
    serve_http_with_workers(runtime, bind_addr, DEFAULT_HTTP_WORKERS)
}

/// Parses one complete HTTP/1.x request and returns the rendered response.
pub fn handle_http_request_bytes(
    runtime: &SharedRuntime,
    raw_request: &[u8],
) -> Result<Vec<u8>, String> {
    let terminator = raw_request
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| "missing HTTP header terminator".to_string())?;
    let header_block = std::str::from_utf8(&raw_request[..terminator])
        .map_err(|_| "request headers must be valid UTF-8".to_string())?;
    let body = &raw_request[terminator + 4..];

    let mut lines = header_block.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| "missing request line".to_string())?;
    let (method, target) = parse_request_line(request_line)?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| "invalid HTTP header".to_string())?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    let content_length = match headers.get("content-length") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| "invalid content-length header".to_string())?,
        None => 0,
    };
    if content_length > MAX_HTTP_BODY_BYTES {
        return Err(format!(
            "content-length exceeds max body size ({MAX_HTTP_BODY_BYTES} bytes)"
        ));
    }
    if content_length != body.len() {
        return Err("content-length does not match body size".to_string());
    }

    let request = HttpRequest {
        method,
        target,
        headers,
        body: body.to_vec(),
    };
    let response = handle_request(runtime, &request);
    Ok(render_response_bytes(&response))
}

fn handle_connection(runtime: &SharedRuntime, mut stream: TcpStream) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)))?;
    stream.set_write_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)))?;

    let request = match read_http_request(&mut stream) {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) => {
            runtime.observe_bad_request();
            return write_response(&mut stream, HttpResponse::bad_request(&err));
        }
    };

    let response = handle_request(runtime, &request);
    write_response(&mut stream, response)
}
