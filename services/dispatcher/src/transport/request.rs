use std::io::{BufRead, BufReader, Read};

use percent_encoding::percent_decode_str;
use url::{Url, form_urlencoded};

use super::*;

pub(super) fn read_http_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>, String> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    let bytes = reader
        .read_line(&mut request_line)
        .map_err(|e| e.to_string())?;
    if bytes == 0 {
        return Ok(None);
    }

    let (method, target) = parse_request_line(&request_line)?;

    let mut headers = HashMap::new();
    loop {
        let mut header_line = String::new();
        let bytes = reader
            .read_line(&mut header_line)
            .map_err(|e| e.to_string())?;
        if bytes == 0 || header_line == "\r\n" {
            break;
        }
        let (name, value) = header_line
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
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).map_err(|e| e.to_string())?;
    }

    Ok(Some(HttpRequest {
        method,
        target,
        headers,
        body,
    }))
}

pub(super) fn parse_request_line(line: &str) -> Result<(String, String), String> {
    let line = line.trim();
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| "missing HTTP method".to_string())?;
    let target = parts
        .next()
        .ok_or_else(|| "missing HTTP target".to_string())?;
    let version = parts
        .next()
        .ok_or_else(|| "missing HTTP version".to_string())?;
    if !version.starts_with("HTTP/1.") {
        return Err("unsupported HTTP version".to_string());
    }
    Ok((method.to_string(), target.to_string()))
}

/// Normalized, percent-decoded path plus the decoded query pairs in order.
pub(super) fn split_target(target: &str) -> Result<(String, Vec<(String, String)>), String> {
    let base = Url::parse("http://localhost/").map_err(|e| e.to_string())?;
    let url = base
        .join(target)
        .map_err(|e| format!("invalid request target: {e}"))?;
    let path = percent_decode_str(url.path())
        .decode_utf8()
        .map_err(|_| "request path must be valid UTF-8".to_string())?
        .into_owned();
    let query = url
        .query_pairs()
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    Ok((path, query))
}

fn parse_cookies(raw: &str) -> impl Iterator<Item = (&str, &str)> {
    raw.split(';').filter_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        (!name.is_empty()).then(|| (name, value.trim().trim_matches('"')))
    })
}

fn is_form_body(request: &HttpRequest) -> bool {
    request
        .headers
        .get("content-type")
        .is_some_and(|value| {
            value
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        })
}

/// Maps an HTTP request onto the dispatch request model.
pub(crate) fn build_dispatch_request(
    runtime: &DispatchRuntime,
    http: &HttpRequest,
) -> Result<Request, String> {
    let (path, query) = split_target(&http.target)?;
    let mut request = Request::from_url_path(&path);

    for (name, value) in query {
        request.append_parameter(&name, value);
    }
    if is_form_body(http) {
        for (name, value) in form_urlencoded::parse(&http.body) {
            request.append_parameter(&name, value.into_owned());
        }
    } else if !http.body.is_empty() {
        request = request.with_input_document(http.body.clone());
    }

    for (name, value) in &http.headers {
        request.set_header(name, value);
    }
    if let Some(raw) = http.headers.get("cookie") {
        for (name, value) in parse_cookies(raw) {
            request.set_cookie(name, value);
        }
    }

    let session_id = http
        .headers
        .get("x-session-id")
        .map(String::as_str)
        .or_else(|| request.cookie(&runtime.session_cookie))
        .map(str::to_string);
    if let Some(session_id) = session_id
        && let Some(session) = runtime.sessions.get(&session_id)
    {
        let session: Arc<dyn SessionStore> = session;
        request.set_session(Some(session));
    }

    let secure = http
        .headers
        .get("x-forwarded-proto")
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));
    request = request.with_secure(secure);

    let hint = request
        .parameter(&runtime.hint_parameter)
        .map(str::to_string)
        .filter(|hint| !hint.trim().is_empty());
    request.set_dataset_hint(hint);

    Ok(request)
}
