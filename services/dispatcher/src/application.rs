use std::{
    any::Any,
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use auth::AccessController;
use cache::ResponseCache;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use request_router::{
    FallbackPolicy, Route, RouteError, RouteMatch, RouteResolution, RouteTable, Selector,
};
use schema::{
    ApplicationDefinition, ApplicationId, DatasetClass, DatasetDefinition, Request, RequestType,
    ResponseSink, validate_application,
};

use crate::{
    admission::{AdmissionError, AdmissionGate, Lifecycle},
    audit::{AuditEvent, AuditSink, LogAuditSink, RouteAuditBridge},
    cache_coordinator::{CacheCoordinator, CacheLookup},
    error::{DispatchError, HandlerError},
    extension::{ExtensionEvent, ExtensionRegistry},
    handler::{DataHandler, DataHandlerFactory, HandlerRef, StaticFileHandler},
    statistics::{
        ApplicationStatistics, CacheOutcome, RequestStatistics, StatisticsSink, StatisticsSnapshot,
    },
};

pub const DEFAULT_RESTART_ROUNDS: u32 = 5;
pub const DEFAULT_RESTART_ROUND_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub restart_rounds: u32,
    pub restart_round_wait: Duration,
    /// Root for synthesized `<document_root>/<request_root>/<page>` lookups.
    pub document_root: Option<PathBuf>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            restart_rounds: DEFAULT_RESTART_ROUNDS,
            restart_round_wait: DEFAULT_RESTART_ROUND_WAIT,
            document_root: None,
        }
    }
}

/// Collaborators shared by every application of one registry.
#[derive(Clone)]
pub struct ApplicationContext {
    pub cache: Arc<ResponseCache>,
    pub audit: Arc<dyn AuditSink>,
    pub statistics_sink: Option<Arc<dyn StatisticsSink>>,
    pub factory: Arc<dyn DataHandlerFactory>,
    pub extensions: Arc<ExtensionRegistry>,
    pub settings: DispatchSettings,
}

impl ApplicationContext {
    pub fn new(factory: Arc<dyn DataHandlerFactory>) -> Self {
        Self {
            cache: Arc::new(ResponseCache::default()),
            audit: Arc::new(LogAuditSink),
            statistics_sink: None,
            factory,
            extensions: Arc::new(ExtensionRegistry::new()),
            settings: DispatchSettings::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_statistics_sink(mut self, sink: Arc<dyn StatisticsSink>) -> Self {
        self.statistics_sink = Some(sink);
        self
    }

    pub fn with_extensions(mut self, extensions: Arc<ExtensionRegistry>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Everything `init` derives from the definition; replaced wholesale on restart.
struct ApplicationRuntime {
    routes: RouteTable<HandlerRef>,
    handlers: Vec<HandlerRef>,
    access: AccessController,
    fallback: FallbackPolicy,
    static_files: StaticFileHandler,
    extension_versions: HashMap<String, u64>,
}

/// Per-application orchestrator: admission, access, routing, caching and
/// handler invocation for every request addressed to one request root.
pub struct ApplicationHandler {
    id: ApplicationId,
    name: Arc<RwLock<String>>,
    definition: RwLock<ApplicationDefinition>,
    runtime: ArcSwapOption<ApplicationRuntime>,
    gate: AdmissionGate,
    statistics: ApplicationStatistics,
    cache: CacheCoordinator,
    context: ApplicationContext,
    restart_lock: Mutex<()>,
}

impl std::fmt::Debug for ApplicationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationHandler")
            .field("id", &self.id)
            .field("name", &*self.name.read())
            .finish_non_exhaustive()
    }
}

impl ApplicationHandler {
    pub fn new(definition: ApplicationDefinition, context: ApplicationContext) -> Self {
        Self {
            id: definition.id,
            name: Arc::new(RwLock::new(definition.name.clone())),
            gate: AdmissionGate::new(definition.admission_ceiling()),
            cache: CacheCoordinator::new(definition.id, Arc::clone(&context.cache)),
            definition: RwLock::new(definition),
            runtime: ArcSwapOption::empty(),
            statistics: ApplicationStatistics::new(),
            context,
            restart_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> ApplicationId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn request_root(&self) -> String {
        self.definition.read().request_root.trim_matches('/').to_string()
    }

    pub fn definition(&self) -> ApplicationDefinition {
        self.definition.read().clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.gate.lifecycle()
    }

    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    pub fn ceiling(&self) -> usize {
        self.gate.ceiling()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.gate.peak_in_flight()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    pub fn metrics_text(&self) -> String {
        self.statistics
            .snapshot()
            .metrics_text(&self.name(), self.in_flight(), self.ceiling())
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.runtime
            .load_full()
            .map(|runtime| runtime.routes.dataset_names())
            .unwrap_or_default()
    }

    pub fn uses_extension(&self, name: &str) -> bool {
        self.definition
            .read()
            .extension_names()
            .any(|candidate| candidate.eq_ignore_ascii_case(name))
    }

    /// Registry version of `name` the live runtime was built against.
    pub fn bound_extension_version(&self, name: &str) -> Option<u64> {
        self.runtime
            .load_full()?
            .extension_versions
            .get(&name.to_ascii_lowercase())
            .copied()
    }

    /// Builds routes and handlers, then opens admission. A no-op while running.
    pub fn init(&self) -> Result<(), DispatchError> {
        let _guard = self.restart_lock.lock();
        if self.gate.lifecycle() == Lifecycle::Running {
            return Ok(());
        }
        self.start_locked()
    }

    /// Stops admission, waits a bounded time for in-flight requests, then
    /// releases handlers and the cache scope. Returns whether it drained.
    pub fn shutdown(&self) -> bool {
        let _guard = self.restart_lock.lock();
        if self.gate.begin_drain() == Lifecycle::Stopped {
            return true;
        }
        let settings = &self.context.settings;
        let drain_timeout = settings
            .restart_round_wait
            .saturating_mul(settings.restart_rounds.max(1));
        let drained = self.gate.wait_idle(drain_timeout);
        if !drained {
            warn!(
                "application '{}' stopped with {} requests still in flight",
                self.name(),
                self.gate.in_flight()
            );
        }
        self.teardown();
        self.gate.mark_stopped();
        info!("application '{}' stopped", self.name());
        drained
    }

    /// Quiesce-and-restart. Waits for the admission counter to reach zero in
    /// bounded rounds; on exhaustion the current runtime keeps serving.
    pub fn restart(&self, reason: &str) -> Result<(), DispatchError> {
        let _guard = self.restart_lock.lock();
        let application = self.name();
        if self.gate.lifecycle() != Lifecycle::Running {
            debug!("application '{application}' is not running; skipping restart ({reason})");
            return Ok(());
        }

        let settings = &self.context.settings;
        let rounds = settings.restart_rounds.max(1);
        let mut in_flight = 0;
        for round in 1..=rounds {
            match self.gate.try_begin_restart(settings.restart_round_wait) {
                Ok(()) => {
                    self.teardown();
                    if let Err(err) = self.start_locked() {
                        self.gate.mark_stopped();
                        error!("application '{application}' failed to restart ({reason}): {err}");
                        return Err(err);
                    }
                    self.statistics.observe_restart();
                    self.context.audit.record(&AuditEvent::ApplicationRestarted {
                        application: application.clone(),
                        reason: reason.to_string(),
                    });
                    info!("application '{application}' restarted after {round} round(s): {reason}");
                    return Ok(());
                }
                Err(remaining) => {
                    in_flight = remaining;
                    debug!(
                        "application '{application}' restart round {round}/{rounds}: {remaining} requests in flight"
                    );
                }
            }
        }

        warn!(
            "application '{application}' restart abandoned after {rounds} rounds with {in_flight} requests in flight; keeping current bindings ({reason})"
        );
        self.statistics.observe_restart_abandoned();
        self.context.audit.record(&AuditEvent::RestartAbandoned {
            application: application.clone(),
            in_flight,
            rounds,
            reason: reason.to_string(),
        });
        Err(DispatchError::RestartAbandoned {
            application,
            in_flight,
            rounds,
        })
    }

    /// Restarts when the changed extension is referenced. `Ok(false)` when not.
    pub fn handle_extension_change(&self, event: &ExtensionEvent) -> Result<bool, DispatchError> {
        if !self.uses_extension(&event.name) {
            return Ok(false);
        }
        self.restart(&format!(
            "extension '{}' {}",
            event.name,
            event.change.as_str()
        ))?;
        Ok(true)
    }

    /// Returns the previous name.
    pub fn rename(&self, new_name: &str) -> String {
        let previous = {
            let mut definition = self.definition.write();
            std::mem::replace(&mut definition.name, new_name.to_string())
        };
        *self.name.write() = new_name.to_string();
        info!("application '{previous}' renamed to '{new_name}'");
        previous
    }

    /// Every failure is written to the request's response before returning;
    /// the admission slot is released on every path, panics included.
    pub fn process_request(&self, request: &mut Request) -> Result<(), DispatchError> {
        let started = Instant::now();
        let mut record = RequestStatistics::begin(self.id, &self.name(), request.request_id());

        let permit = match self.gate.acquire() {
            Ok(permit) => permit,
            Err(rejection) => {
                let err = self.reject(rejection);
                err.write_response(request.response_mut());
                self.report(&mut record, request, started, false);
                return Err(err);
            }
        };
        self.statistics.request_started();

        let outcome = match self.runtime.load_full() {
            Some(runtime) => catch_unwind(AssertUnwindSafe(|| {
                self.dispatch_admitted(&runtime, request, &mut record)
            }))
            .unwrap_or_else(|payload| {
                let dataset = record
                    .dataset
                    .clone()
                    .unwrap_or_else(|| request.page_path().to_string());
                let reason = format!("dispatch panicked: {}", panic_message(payload.as_ref()));
                error!(
                    "application '{}' request {} ({dataset}): {reason}",
                    self.name(),
                    request.request_id()
                );
                Err(DispatchError::DownstreamHandlerFailure { dataset, reason })
            }),
            None => Err(DispatchError::ApplicationUnavailable {
                application: self.name(),
                state: Lifecycle::Stopped.as_str(),
            }),
        };
        drop(permit);

        if let Err(err) = &outcome {
            err.write_response(request.response_mut());
        }
        self.report(&mut record, request, started, true);
        outcome
    }

    fn reject(&self, rejection: AdmissionError) -> DispatchError {
        let application = self.name();
        match rejection {
            AdmissionError::Saturated { in_flight, ceiling } => {
                self.statistics.observe_capacity_rejection();
                debug!("application '{application}' at capacity ({in_flight}/{ceiling})");
                self.context.audit.record(&AuditEvent::CapacityExceeded {
                    application: application.clone(),
                    in_flight,
                    ceiling,
                });
                DispatchError::CapacityExceeded {
                    application,
                    in_flight,
                    ceiling,
                }
            }
            AdmissionError::Unavailable { state } => {
                self.statistics.observe_unavailable_rejection();
                DispatchError::ApplicationUnavailable {
                    application,
                    state: state.as_str(),
                }
            }
        }
    }

    fn report(
        &self,
        record: &mut RequestStatistics,
        request: &Request,
        started: Instant,
        admitted: bool,
    ) {
        let elapsed = started.elapsed();
        let response = request.response();
        record.finish(
            response.status,
            response.error_code.clone(),
            elapsed.as_micros() as u64,
        );
        if admitted {
            let limit_ms = self.definition.read().max_request_time_ms;
            if limit_ms > 0 && elapsed > Duration::from_millis(limit_ms) {
                record.slow = true;
                warn!(
                    "request {} to application '{}' took {}ms (max request time {limit_ms}ms)",
                    record.request_id,
                    record.application,
                    elapsed.as_millis()
                );
            }
            self.statistics.record(record);
        }
        if let Some(sink) = &self.context.statistics_sink {
            sink.record(record);
        }
    }

    fn dispatch_admitted(
        &self,
        runtime: &ApplicationRuntime,
        request: &mut Request,
        record: &mut RequestStatistics,
    ) -> Result<(), DispatchError> {
        runtime.access.check_encryption(request)?;

        let resolution = runtime
            .routes
            .resolve_with_fallback(request, &runtime.fallback)
            .map_err(|err| match err {
                RouteError::RouteNotFound { path, .. } => DispatchError::RouteNotFound {
                    application: self.name(),
                    path,
                },
                other => DispatchError::from_route_error(&self.name(), other),
            })?;

        match resolution {
            RouteResolution::DefaultPage(location) => {
                let response = request.response_mut();
                response.set_status(302);
                response.set_header("location", &location);
                response.set_content("text/plain; charset=utf-8", Vec::new());
                Ok(())
            }
            RouteResolution::StaticFile(path) => {
                self.authorize(runtime, request, RequestType::Query)?;
                runtime
                    .static_files
                    .serve_path(&path, request.response_mut())
                    .map_err(|err| match err {
                        HandlerError::NotFound(_) => DispatchError::RouteNotFound {
                            application: self.name(),
                            path: format!("/{}/{}", request.request_root(), request.page_path()),
                        },
                        other => DispatchError::DownstreamHandlerFailure {
                            dataset: runtime.static_files.dataset_name().to_string(),
                            reason: other.to_string(),
                        },
                    })
            }
            RouteResolution::Dataset(found) => {
                self.dispatch_dataset(runtime, request, found, record)
            }
        }
    }

    fn dispatch_dataset(
        &self,
        runtime: &ApplicationRuntime,
        request: &mut Request,
        found: RouteMatch<HandlerRef>,
        record: &mut RequestStatistics,
    ) -> Result<(), DispatchError> {
        let route = found.route;
        let handler = route.handler.as_ref();
        record.dataset = Some(route.dataset_name.clone());

        let request_type = runtime.access.classify_request_type(request);
        // Update pipelines enforce row-level grants themselves.
        if handler.class() != DatasetClass::Update {
            self.authorize(runtime, request, request_type)?;
        }

        let ticket = match self
            .cache
            .lookup(route.dataset_id, handler, request, request_type)
        {
            CacheLookup::Hit => {
                record.cache = CacheOutcome::Hit;
                return Ok(());
            }
            CacheLookup::Bypass => None,
            CacheLookup::Miss(ticket) => {
                record.cache = CacheOutcome::Miss;
                Some(ticket)
            }
        };

        let failure = match catch_unwind(AssertUnwindSafe(|| handler.process_request(request))) {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(format!("handler panicked: {}", panic_message(payload.as_ref()))),
        };
        if let Some(reason) = failure {
            error!(
                "dataset '{}' of application '{}' failed on request {} ({}/{}): {reason}",
                route.dataset_name,
                self.name(),
                request.request_id(),
                request.request_root(),
                request.page_path()
            );
            return Err(DispatchError::DownstreamHandlerFailure {
                dataset: route.dataset_name.clone(),
                reason,
            });
        }

        if let Some(ticket) = ticket {
            record.cache_stored = self.cache.complete(ticket, handler, request);
        }
        Ok(())
    }

    fn authorize(
        &self,
        runtime: &ApplicationRuntime,
        request: &mut Request,
        request_type: RequestType,
    ) -> Result<(), DispatchError> {
        let decision = runtime.access.check_access(request, request_type, true);
        let Some(denial) = decision.denial else {
            return Ok(());
        };
        self.statistics.observe_access_denied();
        warn!(
            "application '{}' denied {} on '{}' ({}) principal={:?} session={:?}",
            self.name(),
            request_type.as_str(),
            decision.resource,
            denial.code(),
            decision.principal,
            decision.session_id
        );
        self.context.audit.record(&AuditEvent::AccessDenied {
            application: self.name(),
            code: denial.code().to_string(),
            principal: decision.principal,
            resource: decision.resource,
            session_id: decision.session_id,
            requested: decision.requested,
            held: decision.held,
        });
        Err(DispatchError::Access(denial))
    }

    fn start_locked(&self) -> Result<(), DispatchError> {
        let definition = self.definition.read().clone();
        validate_application(&definition).map_err(|err| {
            DispatchError::InvalidDefinition(format!("application '{}': {err}", definition.name))
        })?;
        let runtime = self.build_runtime(&definition)?;
        let datasets = runtime.handlers.len();
        self.runtime.store(Some(Arc::new(runtime)));
        self.gate.open(definition.admission_ceiling());
        info!(
            "application '{}' running at /{} with {datasets} datasets (ceiling {})",
            definition.name,
            definition.request_root.trim_matches('/'),
            definition.admission_ceiling()
        );
        Ok(())
    }

    fn build_runtime(
        &self,
        definition: &ApplicationDefinition,
    ) -> Result<ApplicationRuntime, DispatchError> {
        let bridge = RouteAuditBridge {
            application: Arc::clone(&self.name),
            sink: Arc::clone(&self.context.audit),
        };
        let routes = RouteTable::new().with_audit_sink(Arc::new(bridge));
        let mut handlers: Vec<HandlerRef> = Vec::with_capacity(definition.datasets.len());
        let mut extension_versions = HashMap::new();

        for dataset in &definition.datasets {
            match self.bind_dataset(definition, dataset, &routes) {
                Ok(handler) => handlers.push(handler),
                Err(err) => {
                    for handler in &handlers {
                        handler.shutdown();
                    }
                    error!(
                        "application '{}' failed to initialize: {err}",
                        definition.name
                    );
                    return Err(err);
                }
            }
            for reference in &dataset.extensions {
                if let Some(version) = self.context.extensions.version(&reference.name) {
                    extension_versions.insert(reference.name.to_ascii_lowercase(), version);
                }
            }
        }

        Ok(ApplicationRuntime {
            routes,
            handlers,
            access: AccessController::new(definition),
            fallback: FallbackPolicy {
                application: definition.name.clone(),
                request_root: definition.request_root.trim_matches('/').to_string(),
                default_page: definition.default_page.clone(),
                static_root: definition.static_root.clone(),
                document_root: self.context.settings.document_root.clone(),
            },
            static_files: StaticFileHandler::new("static", definition.static_root.clone()),
            extension_versions,
        })
    }

    fn bind_dataset(
        &self,
        definition: &ApplicationDefinition,
        dataset: &DatasetDefinition,
        routes: &RouteTable<HandlerRef>,
    ) -> Result<HandlerRef, DispatchError> {
        if routes.route(&dataset.name).is_some() {
            return Err(DispatchError::DuplicateDataset {
                application: definition.name.clone(),
                dataset: dataset.name.clone(),
            });
        }
        self.context.extensions.check_references(dataset)?;
        let handler = self
            .context
            .factory
            .create(definition, dataset)
            .map_err(|err| DispatchError::HandlerSetup {
                dataset: dataset.name.clone(),
                reason: err.to_string(),
            })?;
        let route = Route::new(
            dataset.id,
            &dataset.name,
            &dataset.page,
            Selector::from_conditions(dataset.selector.clone()),
            Arc::clone(&handler),
        );
        if let Err(err) = routes.add_route(route) {
            handler.shutdown();
            return Err(DispatchError::from_route_error(&definition.name, err));
        }
        Ok(handler)
    }

    fn teardown(&self) {
        if let Some(runtime) = self.runtime.swap(None) {
            for handler in &runtime.handlers {
                handler.shutdown();
            }
        }
        self.cache.flush();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::handler::{BuiltinHandlerFactory, EchoHandler};
    use schema::{AccessLevel, Acl, AclEntryKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn catalog() -> ApplicationDefinition {
        let mut app = ApplicationDefinition::new(3, "catalog", "catalog", 2);
        app.acl = Acl::default().with_entry("anyone", AclEntryKind::Anyone, AccessLevel::QUERY);
        app.datasets
            .push(DatasetDefinition::new(1, "Search", "search.xml", "echo"));
        app
    }

    #[test]
    fn failed_init_shuts_down_handlers_already_built() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        struct Counting(Arc<AtomicUsize>, String);
        impl DataHandler for Counting {
            fn dataset_name(&self) -> &str {
                &self.1
            }
            fn process_request(&self, _request: &mut Request) -> Result<(), HandlerError> {
                Ok(())
            }
            fn shutdown(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let counter = Arc::clone(&shutdowns);
        let factory = move |_: &ApplicationDefinition,
                            dataset: &DatasetDefinition|
              -> Result<HandlerRef, HandlerError> {
            Ok(Arc::new(Counting(Arc::clone(&counter), dataset.name.clone())))
        };
        let mut definition = catalog();
        definition
            .datasets
            .push(DatasetDefinition::new(2, "Browse", "browse.xml", "echo"));
        definition
            .datasets
            .push(DatasetDefinition::new(3, "SEARCH", "other.xml", "echo"));

        let app = ApplicationHandler::new(definition, ApplicationContext::new(Arc::new(factory)));
        let err = app.init().unwrap_err();
        assert_eq!(err.code(), "duplicate_dataset");
        assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
        assert_eq!(app.lifecycle(), Lifecycle::Stopped);

        let mut request = Request::new("catalog", "search.xml");
        assert!(matches!(
            app.process_request(&mut request),
            Err(DispatchError::ApplicationUnavailable { .. })
        ));
        assert_eq!(request.response().status, 503);
    }

    #[test]
    fn rename_changes_audit_and_statistics_identity() {
        let audit = Arc::new(RecordingAuditSink::new());
        let context = ApplicationContext::new(Arc::new(BuiltinHandlerFactory))
            .with_audit_sink(audit.clone());
        let app = ApplicationHandler::new(catalog(), context);
        app.init().unwrap();

        assert_eq!(app.rename("products"), "catalog");
        assert_eq!(app.name(), "products");
        assert_eq!(app.definition().name, "products");

        let mut denied = Request::new("catalog", "search.xml").with_param("DBActionType", "DELETE");
        assert!(app.process_request(&mut denied).is_err());
        assert_eq!(audit.events()[0].application(), "products");
        assert!(app.metrics_text().contains("application=\"products\""));
    }

    #[test]
    fn shutdown_flushes_cache_scope_and_blocks_admission() {
        let factory = |_: &ApplicationDefinition,
                       dataset: &DatasetDefinition|
         -> Result<HandlerRef, HandlerError> {
            Ok(Arc::new(EchoHandler::new(&dataset.name).with_cache_policy(
                schema::CachePolicyDefinition {
                    enabled: true,
                    ..Default::default()
                },
            )))
        };
        let cache = Arc::new(ResponseCache::new(8));
        let context = ApplicationContext::new(Arc::new(factory)).with_cache(Arc::clone(&cache));
        let app = ApplicationHandler::new(catalog(), context);
        app.init().unwrap();

        app.process_request(&mut Request::new("catalog", "search.xml"))
            .unwrap();
        assert_eq!(cache.entries_for_application(3), 1);

        assert!(app.shutdown());
        assert_eq!(cache.entries_for_application(3), 0);
        assert_eq!(app.lifecycle(), Lifecycle::Stopped);
        assert!(app.dataset_names().is_empty());
        assert!(app.restart("noop").is_ok());
        assert_eq!(app.lifecycle(), Lifecycle::Stopped);
    }
}
