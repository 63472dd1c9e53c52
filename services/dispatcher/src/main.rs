use std::sync::Arc;

use cache::ResponseCache;
use dispatcher::{
    ApplicationContext, AuditSink, BuiltinHandlerFactory, DeploymentFile, DispatcherConfig,
    FanoutAuditSink, JsonLinesAuditSink, LogAuditSink, LogStatisticsSink, ServerRegistry,
    TransportRuntime, load_deployment,
    transport::{DispatchRuntime, serve_http_with_workers},
};
use log::{error, info};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let serve_mode = std::env::args().any(|arg| arg == "--serve");
    let config = DispatcherConfig::from_env();

    let deployment = match config.applications_file.as_deref() {
        Some(path) => match load_deployment(path) {
            Ok(deployment) => deployment,
            Err(err) => {
                eprintln!("dispatcher failed loading deployment: {err}");
                std::process::exit(1);
            }
        },
        None => DeploymentFile::default(),
    };

    let audit: Arc<dyn AuditSink> = match config.audit_log_path.as_deref() {
        Some(path) => match JsonLinesAuditSink::open(path) {
            Ok(sink) => Arc::new(
                FanoutAuditSink::new()
                    .with_sink(Arc::new(LogAuditSink))
                    .with_sink(Arc::new(sink)),
            ),
            Err(err) => {
                eprintln!(
                    "dispatcher failed opening audit log '{}': {err}",
                    path.display()
                );
                std::process::exit(1);
            }
        },
        None => Arc::new(LogAuditSink),
    };

    let context = ApplicationContext::new(Arc::new(BuiltinHandlerFactory))
        .with_cache(Arc::new(ResponseCache::new(config.cache_max_entries)))
        .with_audit_sink(audit)
        .with_statistics_sink(Arc::new(LogStatisticsSink))
        .with_settings(config.settings());
    let registry = Arc::new(ServerRegistry::new(context));

    for extension in deployment.extension {
        registry.register_extension(extension);
    }
    let declared = deployment.application.len();
    for application in deployment.application {
        let name = application.name.clone();
        match registry.start_application(application) {
            Ok(app) => info!(
                "application '{name}' registered at /{} ({})",
                app.request_root().trim_matches('/'),
                app.lifecycle().as_str()
            ),
            Err(err) => error!("application '{name}' did not start: {err}"),
        }
    }
    let registered = registry.applications().len();

    if !serve_mode {
        println!(
            "dispatcher ready: applications={registered}/{declared}, extensions={} (pass --serve to listen; set DISPATCH_APPLICATIONS_FILE to load applications)",
            registry.extensions().names().len()
        );
        registry.shutdown_all();
        return;
    }

    let bind_addr = config.bind_addr.clone();
    let http_workers = config.http_workers;
    println!("dispatcher transport listening on http://{bind_addr}");
    println!("dispatcher transport workers: {http_workers}");
    println!(
        "dispatcher transport queue capacity: {}",
        config.http_queue_capacity
    );
    println!(
        "dispatcher transport runtime: {}",
        config.transport_runtime.as_str()
    );
    println!("dispatcher applications: {registered}/{declared}");
    println!("dispatcher health endpoint: http://{bind_addr}/health");
    println!("dispatcher metrics endpoint: http://{bind_addr}/metrics");
    println!("dispatcher statistics endpoint: http://{bind_addr}/statistics");
    if let Some(document_root) = config.document_root.as_deref() {
        println!("dispatcher document root: {}", document_root.display());
    }

    let runtime = DispatchRuntime::from_config(registry, &config);
    match config.transport_runtime {
        TransportRuntime::Std => {
            if let Err(err) = serve_http_with_workers(runtime, &bind_addr, http_workers) {
                eprintln!("dispatcher transport failed: {err}");
                std::process::exit(1);
            }
        }
        TransportRuntime::Axum => {
            #[cfg(feature = "async-transport")]
            {
                if let Err(err) =
                    dispatcher::transport_axum::serve_http_with_axum(runtime, &bind_addr, http_workers)
                {
                    eprintln!("dispatcher transport failed: {err}");
                    std::process::exit(1);
                }
            }
            #[cfg(not(feature = "async-transport"))]
            {
                drop(runtime);
                eprintln!(
                    "dispatcher transport runtime 'axum' requires build feature 'async-transport'"
                );
                std::process::exit(2);
            }
        }
    }
}
