use super::*;

pub(crate) fn handle_request(runtime: &SharedRuntime, request: &HttpRequest) -> HttpResponse {
    runtime.observe_http_request();
    let path = request.target.split('?').next().unwrap_or_default();
    match (request.method.as_str(), path) {
        ("GET", "/health") => HttpResponse::ok_json(
            serde_json::json!({
                "status": "ok",
                "applications": runtime.registry.applications().len(),
            })
            .to_string(),
        ),
        ("GET", "/metrics") => HttpResponse::ok_text(runtime.metrics_text()),
        ("GET", "/statistics") => {
            HttpResponse::ok_json(runtime.registry.statistics_json().to_string())
        }
        (_, "/health" | "/metrics" | "/statistics") => {
            HttpResponse::method_not_allowed("only GET is supported on this endpoint")
        }
        ("GET" | "POST" | "HEAD", _) => dispatch(runtime, request),
        _ => HttpResponse::method_not_allowed("unsupported HTTP method"),
    }
}

fn dispatch(runtime: &SharedRuntime, http: &HttpRequest) -> HttpResponse {
    let mut request = match build_dispatch_request(runtime, http) {
        Ok(request) => request,
        Err(err) => {
            runtime.observe_bad_request();
            return HttpResponse::bad_request(&err);
        }
    };
    // Failures are already rendered into the response.
    let _ = runtime.registry.dispatch(&mut request);
    let mut response = HttpResponse::from_dispatch(request.take_response());
    if http.method == "HEAD" {
        response.body.clear();
    }
    response
}
