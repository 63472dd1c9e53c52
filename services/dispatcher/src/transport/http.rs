use std::{collections::HashMap, io::Write, net::TcpStream, time::Duration};

use schema::Response;

const BACKPRESSURE_QUEUE_FULL_MESSAGE: &str = "service unavailable: dispatch worker queue full";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpRequest {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpResponse {
    pub(crate) status: u16,
    pub(crate) content_type: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
}

impl HttpResponse {
    fn with_body(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            headers: Vec::new(),
            body,
        }
    }

    fn error(status: u16, message: &str) -> Self {
        let body = serde_json::json!({ "error": message }).to_string();
        Self::with_body(status, "application/json", body.into_bytes())
    }

    pub(crate) fn ok_json(body: String) -> Self {
        Self::with_body(200, "application/json", body.into_bytes())
    }

    pub(crate) fn ok_text(body: String) -> Self {
        Self::with_body(
            200,
            "text/plain; version=0.0.4; charset=utf-8",
            body.into_bytes(),
        )
    }

    pub(crate) fn bad_request(message: &str) -> Self {
        Self::error(400, message)
    }

    pub(crate) fn method_not_allowed(message: &str) -> Self {
        Self::error(405, message)
    }

    pub(crate) fn service_unavailable(message: &str) -> Self {
        Self::error(503, message)
    }

    #[cfg_attr(not(feature = "async-transport"), allow(dead_code))]
    pub(crate) fn internal_server_error(message: &str) -> Self {
        Self::error(500, message)
    }

    /// Carries a dispatched [`Response`] onto the wire unchanged.
    pub(crate) fn from_dispatch(response: Response) -> Self {
        Self {
            status: response.status,
            content_type: response.content_type,
            headers: response.headers.into_iter().collect(),
            body: response.body,
        }
    }
}

pub(crate) fn backpressure_rejection_response() -> HttpResponse {
    HttpResponse::service_unavailable(BACKPRESSURE_QUEUE_FULL_MESSAGE)
}

pub(crate) fn write_backpressure_response(
    mut stream: TcpStream,
    socket_timeout_secs: u64,
) -> std::io::Result<()> {
    stream.set_write_timeout(Some(Duration::from_secs(socket_timeout_secs)))?;
    stream.write_all(&render_response_bytes(&backpressure_rejection_response()))
}

pub(crate) fn write_response(
    stream: &mut TcpStream,
    response: HttpResponse,
) -> std::io::Result<()> {
    stream.write_all(&render_response_bytes(&response))?;
    stream.flush()
}

pub(crate) fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

pub(crate) fn render_response_bytes(response: &HttpResponse) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        response.content_type,
        response.body.len()
    );
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("content-type") || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    let mut out = head.into_bytes();
    out.extend_from_slice(&response.body);
    out
}
