use super::http::{backpressure_rejection_response, status_text};
use super::request::split_target;
use super::*;
use crate::{application::ApplicationContext, handler::BuiltinHandlerFactory};
use schema::{
    AccessLevel, Acl, AclEntryKind, ApplicationDefinition, CachePolicyDefinition,
    DataEncryption, DatasetDefinition, Principal,
};
use std::io::{Read, Write};

fn catalog_definition() -> ApplicationDefinition {
    let mut app = ApplicationDefinition::new(1, "catalog", "catalog", 4);
    app.acl = Acl::default().with_entry("anyone", AclEntryKind::Anyone, AccessLevel::QUERY);
    app.default_page = Some("index.html".to_string());
    let mut search = DatasetDefinition::new(1, "Search", "search.xml", "echo");
    search.cache = Some(CachePolicyDefinition {
        enabled: true,
        key_parameters: vec!["q".into()],
        ..CachePolicyDefinition::default()
    });
    app.datasets.push(search);
    app.datasets
        .push(DatasetDefinition::new(2, "Report", "report.xml", "echo"));
    app
}

fn members_definition() -> ApplicationDefinition {
    let mut app = ApplicationDefinition::new(2, "members", "members", 2);
    app.acl = Acl::default().with_entry("alice", AclEntryKind::User, AccessLevel::QUERY);
    app.encryption = DataEncryption::RequireSecure;
    app.datasets
        .push(DatasetDefinition::new(1, "Profile", "profile.xml", "echo"));
    app
}

fn sample_runtime() -> SharedRuntime {
    let registry = Arc::new(ServerRegistry::new(ApplicationContext::new(Arc::new(
        BuiltinHandlerFactory,
    ))));
    registry.start_application(catalog_definition()).unwrap();
    registry.start_application(members_definition()).unwrap();
    Arc::new(DispatchRuntime::new(registry))
}

fn get(runtime: &SharedRuntime, target: &str, extra_headers: &str) -> String {
    let request = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n{extra_headers}\r\n");
    let response = handle_http_request_bytes(runtime, request.as_bytes())
        .expect("request should parse and return response");
    String::from_utf8(response).expect("response should be UTF-8")
}

#[test]
fn health_reports_registered_applications() {
    let runtime = sample_runtime();
    let response = get(&runtime, "/health", "");
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("\"status\":\"ok\""));
    assert!(response.contains("\"applications\":2"));
}

#[test]
fn query_string_becomes_multi_valued_decoded_parameters() {
    let runtime = sample_runtime();
    let response = get(&runtime, "/catalog/search.xml?q=red+shoes&tag=a&tag=b%26c", "");
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("Content-Type: application/json"));
    assert!(response.contains("\"q\":[\"red shoes\"]"));
    assert!(response.contains("\"tag\":[\"a\",\"b&c\"]"));
}

#[test]
fn hint_parameter_selects_dataset_by_name() {
    let runtime = sample_runtime();
    let response = get(&runtime, "/catalog/search.xml?dataset=report", "");
    assert!(response.contains("\"dataset\":\"Report\""));
}

#[test]
fn form_body_adds_parameters_and_other_bodies_become_input() {
    let runtime = sample_runtime();
    let form = "q=boots&page=2";
    let request = format!(
        "POST /catalog/search.xml HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{form}",
        form.len()
    );
    let response =
        String::from_utf8(handle_http_request_bytes(&runtime, request.as_bytes()).unwrap())
            .unwrap();
    assert!(response.contains("\"q\":[\"boots\"]"));
    assert!(response.contains("\"input_bytes\":0"));

    let document = "<doc/>";
    let request = format!(
        "POST /catalog/report.xml HTTP/1.1\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n{document}",
        document.len()
    );
    let response =
        String::from_utf8(handle_http_request_bytes(&runtime, request.as_bytes()).unwrap())
            .unwrap();
    assert!(response.contains("\"input_bytes\":6"));
}

#[test]
fn unknown_root_and_page_render_not_found() {
    let runtime = sample_runtime();
    let response = get(&runtime, "/orders/list.xml", "");
    assert!(response.starts_with("HTTP/1.1 404 Not Found"));
    assert!(response.contains("route_not_found"));

    let response = get(&runtime, "/catalog/missing.xml", "");
    assert!(response.starts_with("HTTP/1.1 404 Not Found"));
}

#[test]
fn empty_page_redirects_to_default_page() {
    let runtime = sample_runtime();
    let response = get(&runtime, "/catalog/", "");
    assert!(response.starts_with("HTTP/1.1 302 Found"));
    assert!(response.contains("location: /catalog/index.html\r\n"));
}

#[test]
fn session_header_and_forwarded_proto_drive_access() {
    let runtime = sample_runtime();
    runtime
        .sessions()
        .authenticate("s-alice", Principal::new("alice", &[]));
    runtime.sessions().fail_authentication("s-bad", "expired");

    let insecure = get(&runtime, "/members/profile.xml", "x-session-id: s-alice\r\n");
    assert!(insecure.starts_with("HTTP/1.1 403 Forbidden"));
    assert!(insecure.contains("encryption_required"));

    let anonymous = get(&runtime, "/members/profile.xml", "X-Forwarded-Proto: https\r\n");
    assert!(anonymous.starts_with("HTTP/1.1 401 Unauthorized"));
    assert!(anonymous.contains("authentication_required"));

    let failed = get(
        &runtime,
        "/members/profile.xml",
        "X-Forwarded-Proto: https\r\nCookie: theme=dark; session=s-bad\r\n",
    );
    assert!(failed.starts_with("HTTP/1.1 401 Unauthorized"));
    assert!(failed.contains("authentication_failed"));

    let allowed = get(
        &runtime,
        "/members/profile.xml",
        "X-Forwarded-Proto: https\r\nCookie: session=s-alice\r\n",
    );
    assert!(allowed.starts_with("HTTP/1.1 200 OK"));
}

#[test]
fn metrics_and_statistics_cover_dispatch_and_transport() {
    let runtime = sample_runtime();
    get(&runtime, "/catalog/search.xml?q=a", "");
    get(&runtime, "/catalog/search.xml?q=a", "");

    let metrics = get(&runtime, "/metrics", "");
    assert!(metrics.contains("Content-Type: text/plain; version=0.0.4; charset=utf-8"));
    assert!(metrics.contains("dispatch_requests_total{application=\"catalog\"} 2"));
    assert!(metrics.contains("dispatch_response_cache_hit_total 1"));
    assert!(metrics.contains("dispatch_http_requests_total 3"));

    let statistics = get(&runtime, "/statistics", "");
    assert!(statistics.starts_with("HTTP/1.1 200 OK"));
    assert!(statistics.contains("\"name\":\"catalog\""));
    assert!(statistics.contains("\"lifecycle\":\"running\""));
}

#[test]
fn builtin_endpoints_reject_other_methods() {
    let runtime = sample_runtime();
    let request = b"DELETE /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n";
    let response = String::from_utf8(handle_http_request_bytes(&runtime, request).unwrap()).unwrap();
    assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed"));
}

#[test]
fn malformed_requests_are_rejected_before_dispatch() {
    let runtime = sample_runtime();
    assert!(
        handle_http_request_bytes(&runtime, b"GET /health HTTP/1.1\r\n")
            .unwrap_err()
            .contains("terminator")
    );
    assert!(
        handle_http_request_bytes(&runtime, b"GET /health HTTP/2\r\n\r\n")
            .unwrap_err()
            .contains("unsupported HTTP version")
    );
    assert!(
        handle_http_request_bytes(
            &runtime,
            b"POST /catalog/search.xml HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc"
        )
        .unwrap_err()
        .contains("does not match")
    );
}

#[test]
fn split_target_normalizes_dot_segments() {
    let (path, query) = split_target("/catalog/docs/../search%20page.xml?q=%C3%A9").unwrap();
    assert_eq!(path, "/catalog/search page.xml");
    assert_eq!(query, vec![("q".to_string(), "é".to_string())]);
}

#[test]
fn backpressure_response_is_service_unavailable() {
    let response = backpressure_rejection_response();
    assert_eq!(response.status, 503);
    assert_eq!(status_text(response.status), "Service Unavailable");
    assert!(String::from_utf8_lossy(&response.body).contains("queue full"));

    let metrics = TransportBackpressureMetrics::new(2);
    metrics.observe_enqueued();
    metrics.observe_dequeued();
    metrics.observe_dequeued();
    metrics.observe_rejected();
    assert_eq!(metrics.queue_depth.load(Ordering::Relaxed), 0);
    assert_eq!(metrics.queue_full_reject_total.load(Ordering::Relaxed), 1);
}

#[test]
fn handle_connection_serves_one_request_over_tcp() {
    let runtime = sample_runtime();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /catalog/search.xml?q=tcp HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    });

    let (stream, _) = listener.accept().unwrap();
    handle_connection(&runtime, stream).unwrap();
    let response = client.join().unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("\"q\":[\"tcp\"]"));
}

#[test]
fn connection_queue_rejects_when_full_and_reports_closed_workers() {
    use super::server_runtime::{ConnectionQueue, Offer};

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (sender, receiver) = std::sync::mpsc::sync_channel::<TcpStream>(1);
    let queue = ConnectionQueue {
        sender,
        metrics: Arc::new(TransportBackpressureMetrics::new(1)),
    };

    let _waiting = TcpStream::connect(addr).unwrap();
    let mut turned_away = TcpStream::connect(addr).unwrap();
    let (first, _) = listener.accept().unwrap();
    let (second, _) = listener.accept().unwrap();
    assert_eq!(queue.offer(first), Offer::Queued);
    assert_eq!(queue.offer(second), Offer::Rejected);

    let mut response = String::new();
    turned_away.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 503"));
    assert!(response.contains("queue full"));
    assert_eq!(queue.metrics.queue_depth.load(Ordering::Relaxed), 1);
    assert_eq!(queue.metrics.queue_full_reject_total.load(Ordering::Relaxed), 1);

    drop(receiver);
    let _late = TcpStream::connect(addr).unwrap();
    let (third, _) = listener.accept().unwrap();
    assert_eq!(queue.offer(third), Offer::Closed);
    assert_eq!(queue.metrics.queue_depth.load(Ordering::Relaxed), 1);
}
