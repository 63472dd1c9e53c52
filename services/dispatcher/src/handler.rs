use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use cache::CacheContext;
use request_router::is_safe_relative_path;
use schema::{
    ApplicationDefinition, ApplicationId, CachePolicyDefinition, DatasetClass, DatasetDefinition,
    DatasetId, Request, RequestType, Response, ResponseSink,
};

use crate::error::HandlerError;

/// Executes one dataset's pipeline against a request, writing its response.
pub trait DataHandler: Send + Sync {
    fn dataset_name(&self) -> &str;

    fn class(&self) -> DatasetClass {
        DatasetClass::Query
    }

    fn process_request(&self, request: &mut Request) -> Result<(), HandlerError>;

    fn shutdown(&self) {}

    fn cache_policy(&self) -> Option<&dyn CachePolicy> {
        None
    }
}

pub type HandlerRef = Arc<dyn DataHandler>;

pub trait CachePolicy: Send + Sync {
    fn is_request_cacheable(&self, _request: &Request, request_type: RequestType) -> bool {
        request_type.is_read_only()
    }

    fn build_cache_context(
        &self,
        application_id: ApplicationId,
        dataset_id: DatasetId,
        request: &Request,
    ) -> CacheContext;

    /// Checked after the handler ran; cacheability may depend on the result.
    fn is_response_cacheable(&self, response: &Response) -> bool;
}

/// Cache policy driven by a dataset's `cache` definition block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredCachePolicy {
    definition: CachePolicyDefinition,
}

impl ConfiguredCachePolicy {
    pub fn new(definition: CachePolicyDefinition) -> Self {
        Self { definition }
    }

    pub fn from_dataset(dataset: &DatasetDefinition) -> Option<Self> {
        dataset
            .cache
            .as_ref()
            .filter(|definition| definition.enabled)
            .map(|definition| Self::new(definition.clone()))
    }
}

impl CachePolicy for ConfiguredCachePolicy {
    fn build_cache_context(
        &self,
        application_id: ApplicationId,
        dataset_id: DatasetId,
        request: &Request,
    ) -> CacheContext {
        CacheContext::from_request(
            application_id,
            dataset_id,
            request,
            &self.definition.key_parameters,
            &self.definition.key_headers,
        )
    }

    fn is_response_cacheable(&self, response: &Response) -> bool {
        let no_store = response
            .headers
            .get("cache-control")
            .is_some_and(|value| value.to_ascii_lowercase().contains("no-store"));
        response.status == 200
            && !no_store
            && (self.definition.cache_empty_results || !response.body.is_empty())
    }
}

pub trait DataHandlerFactory: Send + Sync {
    fn create(
        &self,
        application: &ApplicationDefinition,
        dataset: &DatasetDefinition,
    ) -> Result<HandlerRef, HandlerError>;
}

impl<F> DataHandlerFactory for F
where
    F: Fn(&ApplicationDefinition, &DatasetDefinition) -> Result<HandlerRef, HandlerError>
        + Send
        + Sync,
{
    fn create(
        &self,
        application: &ApplicationDefinition,
        dataset: &DatasetDefinition,
    ) -> Result<HandlerRef, HandlerError> {
        self(application, dataset)
    }
}

/// Knows the `echo` and `static` handler kinds.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinHandlerFactory;

impl DataHandlerFactory for BuiltinHandlerFactory {
    fn create(
        &self,
        application: &ApplicationDefinition,
        dataset: &DatasetDefinition,
    ) -> Result<HandlerRef, HandlerError> {
        match dataset.handler.to_ascii_lowercase().as_str() {
            "echo" => Ok(Arc::new(EchoHandler::from_definition(dataset)?)),
            "static" => Ok(Arc::new(StaticFileHandler::new(
                &dataset.name,
                application.static_root.clone(),
            ))),
            other => Err(HandlerError::Failed(format!(
                "unknown handler kind '{other}' for dataset '{}'",
                dataset.name
            ))),
        }
    }
}

/// Renders the request parameters back as JSON.
///
/// Settings: `delay_ms` sleeps before answering, `cacheable = "false"`
/// marks every response `no-store`.
#[derive(Debug)]
pub struct EchoHandler {
    dataset: String,
    class: DatasetClass,
    delay: Option<Duration>,
    no_store: bool,
    cache_policy: Option<ConfiguredCachePolicy>,
}

impl EchoHandler {
    pub fn new(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            class: DatasetClass::Query,
            delay: None,
            no_store: false,
            cache_policy: None,
        }
    }

    pub fn from_definition(dataset: &DatasetDefinition) -> Result<Self, HandlerError> {
        let delay = match dataset.settings.get("delay_ms") {
            Some(raw) => Some(Duration::from_millis(raw.trim().parse::<u64>().map_err(
                |_| HandlerError::Failed(format!("delay_ms must be an integer, got '{raw}'")),
            )?)),
            None => None,
        };
        let no_store = dataset
            .settings
            .get("cacheable")
            .is_some_and(|value| value.eq_ignore_ascii_case("false"));
        Ok(Self {
            dataset: dataset.name.clone(),
            class: dataset.class,
            delay,
            no_store,
            cache_policy: ConfiguredCachePolicy::from_dataset(dataset),
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_cache_policy(mut self, definition: CachePolicyDefinition) -> Self {
        self.cache_policy = Some(ConfiguredCachePolicy::new(definition));
        self
    }
}

impl DataHandler for EchoHandler {
    fn dataset_name(&self) -> &str {
        &self.dataset
    }

    fn class(&self) -> DatasetClass {
        self.class
    }

    fn process_request(&self, request: &mut Request) -> Result<(), HandlerError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let params: BTreeMap<&str, &[String]> = request.params().iter().collect();
        let body = serde_json::json!({
            "dataset": self.dataset,
            "page": request.page_path(),
            "params": params,
            "input_bytes": request.input_document().map(<[u8]>::len).unwrap_or(0),
        });
        let no_store = self.no_store;
        let response = request.response_mut();
        response.set_status(200);
        response.set_content("application/json", body.to_string().into_bytes());
        if no_store {
            response.set_header("cache-control", "no-store");
        }
        Ok(())
    }

    fn cache_policy(&self) -> Option<&dyn CachePolicy> {
        self.cache_policy
            .as_ref()
            .map(|policy| policy as &dyn CachePolicy)
    }
}

/// Serves files from a root directory; also used for fallback resolution.
#[derive(Debug, Clone)]
pub struct StaticFileHandler {
    dataset: String,
    root: Option<PathBuf>,
}

impl StaticFileHandler {
    pub fn new(dataset: &str, root: Option<PathBuf>) -> Self {
        Self {
            dataset: dataset.to_string(),
            root,
        }
    }

    pub fn serve_path(&self, path: &Path, response: &mut Response) -> Result<(), HandlerError> {
        let body = fs::read(path)?;
        response.set_status(200);
        response.set_content(content_type_for(path), body);
        Ok(())
    }
}

impl DataHandler for StaticFileHandler {
    fn dataset_name(&self) -> &str {
        &self.dataset
    }

    fn process_request(&self, request: &mut Request) -> Result<(), HandlerError> {
        let page = request.page_path().to_string();
        let Some(root) = self.root.as_ref() else {
            return Err(HandlerError::NotFound(format!(
                "dataset '{}' has no static root",
                self.dataset
            )));
        };
        if !is_safe_relative_path(&page) {
            return Err(HandlerError::NotFound(page));
        }
        self.serve_path(&root.join(&page), request.response_mut())
    }
}

pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}
