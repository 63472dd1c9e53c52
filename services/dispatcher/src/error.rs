use std::path::PathBuf;

use auth::AccessError;
use request_router::RouteError;
use schema::{ExtensionCapabilities, ResponseSink};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("i/o failure: {0}")]
    Io(String),
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Every failure a request or an application lifecycle operation can surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("application '{application}' is too busy ({in_flight}/{ceiling} requests in flight)")]
    CapacityExceeded {
        application: String,
        in_flight: usize,
        ceiling: usize,
    },
    #[error("application '{application}' is not available ({state})")]
    ApplicationUnavailable {
        application: String,
        state: &'static str,
    },
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("application '{application}' has no dataset or file for '{path}'")]
    RouteNotFound { application: String, path: String },
    #[error("application '{application}' defines dataset '{dataset}' more than once")]
    DuplicateDataset { application: String, dataset: String },
    #[error(
        "dataset '{dataset}' needs extension '{extension}' with {required:?}, found {declared:?}"
    )]
    ExtensionCapabilityMismatch {
        dataset: String,
        extension: String,
        required: ExtensionCapabilities,
        declared: Option<ExtensionCapabilities>,
    },
    #[error("dataset '{dataset}' failed: {reason}")]
    DownstreamHandlerFailure { dataset: String, reason: String },
    #[error(
        "restart of application '{application}' abandoned after {rounds} rounds with {in_flight} requests in flight"
    )]
    RestartAbandoned {
        application: String,
        in_flight: usize,
        rounds: u32,
    },
    #[error("cannot build handler for dataset '{dataset}': {reason}")]
    HandlerSetup { dataset: String, reason: String },
    #[error("application '{name}' conflicts with a registered application")]
    ApplicationExists { name: String },
    #[error("application '{name}' is not registered")]
    ApplicationNotFound { name: String },
    #[error("invalid application definition: {0}")]
    InvalidDefinition(String),
}

impl DispatchError {
    pub fn from_route_error(application: &str, err: RouteError) -> Self {
        match err {
            RouteError::DuplicateDataset { dataset } => Self::DuplicateDataset {
                application: application.to_string(),
                dataset,
            },
            RouteError::RouteNotFound { application, path } => {
                Self::RouteNotFound { application, path }
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::ApplicationUnavailable { .. } => "application_unavailable",
            Self::Access(err) => err.code(),
            Self::RouteNotFound { .. } => "route_not_found",
            Self::DuplicateDataset { .. } => "duplicate_dataset",
            Self::ExtensionCapabilityMismatch { .. } => "extension_capability_mismatch",
            Self::DownstreamHandlerFailure { .. } => "downstream_handler_failure",
            Self::RestartAbandoned { .. } => "restart_abandoned",
            Self::HandlerSetup { .. } => "handler_setup_failed",
            Self::ApplicationExists { .. } => "application_exists",
            Self::ApplicationNotFound { .. } => "application_not_found",
            Self::InvalidDefinition(_) => "invalid_definition",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::CapacityExceeded { .. } | Self::ApplicationUnavailable { .. } => 503,
            Self::Access(err) => err.status(),
            Self::RouteNotFound { .. } | Self::ApplicationNotFound { .. } => 404,
            Self::ApplicationExists { .. } => 409,
            _ => 500,
        }
    }

    /// Replaces whatever the handler wrote. Downstream failures render a
    /// generic body; the detail stays in the log.
    pub fn write_response(&self, response: &mut impl ResponseSink) {
        response.clear();
        if let Self::Access(err) = self {
            err.write_response(response);
            return;
        }
        let message = match self {
            Self::DownstreamHandlerFailure { .. } => "internal error while processing request".to_string(),
            other => other.to_string(),
        };
        let body = serde_json::json!({
            "error": self.code(),
            "message": message,
        });
        response.set_status(self.status());
        response.set_content("application/json", body.to_string().into_bytes());
        response.mark_error(self.code());
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading '{}' failed: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing '{}' failed: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid definition in '{}': {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::Response;

    #[test]
    fn error_kinds_map_to_distinct_statuses_and_codes() {
        let busy = DispatchError::CapacityExceeded {
            application: "catalog".into(),
            in_flight: 2,
            ceiling: 2,
        };
        let missing = DispatchError::RouteNotFound {
            application: "catalog".into(),
            path: "/catalog/x.xml".into(),
        };
        let required = DispatchError::from(AccessError::AuthenticationRequired {
            resource: "/catalog".into(),
            session_id: None,
        });
        assert_eq!((busy.status(), busy.code()), (503, "capacity_exceeded"));
        assert_eq!((missing.status(), missing.code()), (404, "route_not_found"));
        assert_eq!(
            (required.status(), required.code()),
            (401, "authentication_required")
        );
    }

    #[test]
    fn downstream_failure_hides_detail_in_response() {
        let err = DispatchError::DownstreamHandlerFailure {
            dataset: "Search".into(),
            reason: "connection refused to db-7".into(),
        };
        let mut response = Response::default();
        err.write_response(&mut response);
        assert_eq!(response.status, 500);
        assert!(response.is_error_response());
        assert!(!response.body_text().contains("db-7"));
        assert!(response.body_text().contains("downstream_handler_failure"));
    }

    #[test]
    fn error_response_drops_headers_left_by_the_handler() {
        let mut response = Response::default();
        response.set_header("location", "/catalog/next.xml");
        response.set_header("cache-control", "max-age=60");
        response.set_content("text/xml", b"<partial/>".to_vec());

        DispatchError::DownstreamHandlerFailure {
            dataset: "Search".into(),
            reason: "timeout".into(),
        }
        .write_response(&mut response);
        assert_eq!(response.status, 500);
        assert!(response.headers.is_empty());
        assert_eq!(response.content_type, "application/json");
        assert!(!response.body_text().contains("partial"));
    }
}
