use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use schema::{ApplicationDefinition, ExtensionDescriptor, validate_application};
use serde::Deserialize;

use crate::{
    application::{DEFAULT_RESTART_ROUND_WAIT, DEFAULT_RESTART_ROUNDS, DispatchSettings},
    error::ConfigError,
};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8090";
pub const DEFAULT_HINT_PARAMETER: &str = "dataset";
pub const DEFAULT_SESSION_COOKIE: &str = "session";
const DEFAULT_HTTP_QUEUE_CAPACITY_PER_WORKER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRuntime {
    Std,
    Axum,
}

impl TransportRuntime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Std => "std",
            Self::Axum => "axum",
        }
    }
}

/// Server-level settings resolved from `DISPATCH_*` (or legacy `DISPATCHER_*`)
/// environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub bind_addr: String,
    pub http_workers: usize,
    pub http_queue_capacity: usize,
    pub transport_runtime: TransportRuntime,
    pub document_root: Option<PathBuf>,
    pub dataset_hint_parameter: String,
    pub session_cookie: String,
    pub restart_rounds: u32,
    pub restart_round_wait: Duration,
    pub cache_max_entries: usize,
    pub audit_log_path: Option<PathBuf>,
    pub applications_file: Option<PathBuf>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let http_workers = default_http_workers();
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            http_workers,
            http_queue_capacity: default_queue_capacity(http_workers),
            transport_runtime: TransportRuntime::Std,
            document_root: None,
            dataset_hint_parameter: DEFAULT_HINT_PARAMETER.to_string(),
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            restart_rounds: DEFAULT_RESTART_ROUNDS,
            restart_round_wait: DEFAULT_RESTART_ROUND_WAIT,
            cache_max_entries: cache::DEFAULT_MAX_ENTRIES,
            audit_log_path: None,
            applications_file: None,
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let http_workers = parse_http_workers();
        Self {
            bind_addr: env_with_fallback("DISPATCH_BIND", "DISPATCHER_BIND")
                .unwrap_or(defaults.bind_addr),
            http_workers,
            http_queue_capacity: resolve_http_queue_capacity(http_workers),
            transport_runtime: parse_transport_runtime(),
            document_root: non_empty_env("DISPATCH_DOCUMENT_ROOT", "DISPATCHER_DOCUMENT_ROOT")
                .map(PathBuf::from),
            dataset_hint_parameter: non_empty_env(
                "DISPATCH_DATASET_HINT_PARAMETER",
                "DISPATCHER_DATASET_HINT_PARAMETER",
            )
            .unwrap_or(defaults.dataset_hint_parameter),
            session_cookie: non_empty_env("DISPATCH_SESSION_COOKIE", "DISPATCHER_SESSION_COOKIE")
                .unwrap_or(defaults.session_cookie),
            restart_rounds: parse_env_first_u64(&[
                "DISPATCH_RESTART_ROUNDS",
                "DISPATCHER_RESTART_ROUNDS",
            ])
            .filter(|value| *value > 0)
            .map(|value| value.min(u32::MAX as u64) as u32)
            .unwrap_or(defaults.restart_rounds),
            restart_round_wait: parse_env_first_u64(&[
                "DISPATCH_RESTART_ROUND_WAIT_MS",
                "DISPATCHER_RESTART_ROUND_WAIT_MS",
            ])
            .filter(|value| *value > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.restart_round_wait),
            cache_max_entries: parse_env_first_usize(&[
                "DISPATCH_CACHE_MAX_ENTRIES",
                "DISPATCHER_CACHE_MAX_ENTRIES",
            ])
            .unwrap_or(defaults.cache_max_entries),
            audit_log_path: non_empty_env("DISPATCH_AUDIT_LOG_PATH", "DISPATCHER_AUDIT_LOG_PATH")
                .map(PathBuf::from),
            applications_file: non_empty_env(
                "DISPATCH_APPLICATIONS_FILE",
                "DISPATCHER_APPLICATIONS_FILE",
            )
            .map(PathBuf::from),
        }
    }

    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            restart_rounds: self.restart_rounds,
            restart_round_wait: self.restart_round_wait,
            document_root: self.document_root.clone(),
        }
    }
}

/// Extensions and applications declared for one server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeploymentFile {
    #[serde(default)]
    pub extension: Vec<ExtensionDescriptor>,
    #[serde(default)]
    pub application: Vec<ApplicationDefinition>,
}

pub fn load_deployment(path: &Path) -> Result<DeploymentFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_deployment(path, &text)
}

pub fn parse_deployment(path: &Path, text: &str) -> Result<DeploymentFile, ConfigError> {
    let deployment: DeploymentFile = toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let invalid = |reason: String| ConfigError::Invalid {
        path: path.to_path_buf(),
        reason,
    };

    let mut ids = HashSet::new();
    for application in &deployment.application {
        validate_application(application)
            .map_err(|err| invalid(format!("application '{}': {err}", application.name)))?;
        if !ids.insert(application.id) {
            return Err(invalid(format!(
                "application id {} is declared more than once",
                application.id
            )));
        }
    }
    let mut extensions = HashSet::new();
    for extension in &deployment.extension {
        if extension.name.trim().is_empty() {
            return Err(invalid("extension name must not be empty".to_string()));
        }
        if !extensions.insert(extension.name.to_ascii_lowercase()) {
            return Err(invalid(format!(
                "extension '{}' is declared more than once",
                extension.name
            )));
        }
    }
    Ok(deployment)
}

pub fn env_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .or_else(|| std::env::var(fallback).ok())
}

fn non_empty_env(primary: &str, fallback: &str) -> Option<String> {
    env_with_fallback(primary, fallback)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn parse_env_first_usize(keys: &[&str]) -> Option<usize> {
    for key in keys {
        if let Ok(value) = std::env::var(key)
            && let Ok(parsed) = value.trim().parse::<usize>()
        {
            return Some(parsed);
        }
    }
    None
}

pub fn parse_env_first_u64(keys: &[&str]) -> Option<u64> {
    for key in keys {
        if let Ok(value) = std::env::var(key)
            && let Ok(parsed) = value.trim().parse::<u64>()
        {
            return Some(parsed);
        }
    }
    None
}

pub fn parse_http_workers() -> usize {
    parse_env_first_usize(&["DISPATCH_HTTP_WORKERS", "DISPATCHER_HTTP_WORKERS"])
        .filter(|workers| *workers > 0)
        .unwrap_or_else(default_http_workers)
}

fn default_http_workers() -> usize {
    std::thread::available_parallelism()
        .map(|parallelism| parallelism.get().clamp(1, 32))
        .unwrap_or(4)
}

fn default_queue_capacity(worker_count: usize) -> usize {
    worker_count
        .saturating_mul(DEFAULT_HTTP_QUEUE_CAPACITY_PER_WORKER)
        .max(worker_count)
}

pub fn resolve_http_queue_capacity(worker_count: usize) -> usize {
    parse_env_first_usize(&[
        "DISPATCH_HTTP_QUEUE_CAPACITY",
        "DISPATCHER_HTTP_QUEUE_CAPACITY",
    ])
    .filter(|value| *value > 0)
    .unwrap_or_else(|| default_queue_capacity(worker_count))
}

pub fn parse_transport_runtime() -> TransportRuntime {
    let runtime_raw = env_with_fallback(
        "DISPATCH_TRANSPORT_RUNTIME",
        "DISPATCHER_TRANSPORT_RUNTIME",
    );
    match runtime_raw.as_deref().map(str::trim) {
        Some("axum") => TransportRuntime::Axum,
        _ => TransportRuntime::Std,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{AccessLevel, ExtensionCapabilities};
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[allow(unused_unsafe)]
    fn set_env_var_for_tests(key: &str, value: &str) {
        unsafe {
            std::env::set_var(key, value);
        }
    }

    #[allow(unused_unsafe)]
    fn restore_env_var_for_tests(key: &str, value: Option<&std::ffi::OsStr>) {
        match value {
            Some(value) => unsafe {
                std::env::set_var(key, value);
            },
            None => unsafe {
                std::env::remove_var(key);
            },
        }
    }

    const DEPLOYMENT: &str = r#"
        [[extension]]
        name = "Highlighter"
        capabilities = "RESULT_DOCUMENT_PROCESSOR"

        [[application]]
        id = 1
        name = "catalog"
        request_root = "catalog"
        max_threads = 8
        max_queued_requests = 4
        default_page = "index.html"

        [[application.acl.entries]]
        name = "anyone"
        kind = "anyone"
        access = "QUERY"

        [[application.datasets]]
        id = 1
        name = "Search"
        page = "search.xml"
        handler = "echo"

        [application.datasets.cache]
        enabled = true
        key_parameters = ["q"]

        [[application.datasets.extensions]]
        name = "highlighter"
        requires = "RESULT_DOCUMENT_PROCESSOR"
    "#;

    #[test]
    fn deployment_file_parses_extensions_and_applications() {
        let deployment = parse_deployment(Path::new("deploy.toml"), DEPLOYMENT).unwrap();
        assert_eq!(deployment.extension.len(), 1);
        assert_eq!(
            deployment.extension[0].capabilities,
            ExtensionCapabilities::RESULT_DOCUMENT_PROCESSOR
        );
        let app = &deployment.application[0];
        assert_eq!(app.admission_ceiling(), 4);
        assert_eq!(app.acl.entries[0].access, AccessLevel::QUERY);
        assert_eq!(app.datasets[0].extensions[0].name, "highlighter");
        assert!(app.datasets[0].cache.as_ref().is_some_and(|cache| cache.enabled));
    }

    #[test]
    fn deployment_file_rejects_duplicate_ids_and_invalid_apps() {
        let duplicated = r#"
            [[application]]
            id = 1
            name = "catalog"
            request_root = "catalog"
            max_threads = 2

            [[application]]
            id = 1
            name = "orders"
            request_root = "orders"
            max_threads = 2
        "#;
        let err = parse_deployment(Path::new("deploy.toml"), duplicated).unwrap_err();
        assert!(err.to_string().contains("declared more than once"));

        let zero_threads = r#"
            [[application]]
            id = 1
            name = "catalog"
            request_root = "catalog"
            max_threads = 0
        "#;
        assert!(matches!(
            parse_deployment(Path::new("deploy.toml"), zero_threads),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            parse_deployment(Path::new("deploy.toml"), "[[application]]\nid = \"x\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn load_deployment_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            load_deployment(&missing),
            Err(ConfigError::Io { .. })
        ));

        let present = dir.path().join("deploy.toml");
        std::fs::write(&present, DEPLOYMENT).unwrap();
        assert_eq!(load_deployment(&present).unwrap().application.len(), 1);
    }

    #[test]
    fn config_from_env_prefers_primary_keys() {
        let _guard = env_lock().lock().unwrap();
        let keys = [
            "DISPATCH_BIND",
            "DISPATCHER_BIND",
            "DISPATCH_HTTP_WORKERS",
            "DISPATCH_RESTART_ROUNDS",
            "DISPATCHER_RESTART_ROUND_WAIT_MS",
            "DISPATCH_DATASET_HINT_PARAMETER",
            "DISPATCH_TRANSPORT_RUNTIME",
            "DISPATCH_HTTP_QUEUE_CAPACITY",
        ];
        let previous: Vec<_> = keys.iter().map(|key| std::env::var_os(key)).collect();

        set_env_var_for_tests("DISPATCH_BIND", "0.0.0.0:9000");
        set_env_var_for_tests("DISPATCHER_BIND", "0.0.0.0:9999");
        set_env_var_for_tests("DISPATCH_HTTP_WORKERS", "3");
        set_env_var_for_tests("DISPATCH_RESTART_ROUNDS", "0");
        set_env_var_for_tests("DISPATCHER_RESTART_ROUND_WAIT_MS", "250");
        set_env_var_for_tests("DISPATCH_DATASET_HINT_PARAMETER", " ");
        set_env_var_for_tests("DISPATCH_TRANSPORT_RUNTIME", "axum");
        set_env_var_for_tests("DISPATCH_HTTP_QUEUE_CAPACITY", "0");

        let config = DispatcherConfig::from_env();

        for (key, value) in keys.iter().zip(previous) {
            restore_env_var_for_tests(key, value.as_deref());
        }

        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.http_workers, 3);
        assert_eq!(config.http_queue_capacity, 3 * 64);
        assert_eq!(config.restart_rounds, DEFAULT_RESTART_ROUNDS);
        assert_eq!(config.restart_round_wait, Duration::from_millis(250));
        assert_eq!(config.dataset_hint_parameter, DEFAULT_HINT_PARAMETER);
        assert_eq!(config.transport_runtime, TransportRuntime::Axum);
        assert_eq!(config.settings().restart_round_wait, Duration::from_millis(250));
    }
}
