pub mod admission;
pub mod application;
pub mod audit;
pub mod cache_coordinator;
pub mod config;
pub mod error;
pub mod extension;
pub mod handler;
pub mod registry;
pub mod session;
pub mod statistics;
pub mod transport;
#[cfg(feature = "async-transport")]
pub mod transport_axum;

pub use admission::{AdmissionError, AdmissionGate, AdmissionPermit, Lifecycle};
pub use application::{
    ApplicationContext, ApplicationHandler, DEFAULT_RESTART_ROUND_WAIT, DEFAULT_RESTART_ROUNDS,
    DispatchSettings,
};
pub use audit::{
    AuditEvent, AuditSink, FanoutAuditSink, JsonLinesAuditSink, LogAuditSink, RecordingAuditSink,
};
pub use cache_coordinator::{CacheCoordinator, CacheLookup, CacheTicket};
pub use config::{DeploymentFile, DispatcherConfig, TransportRuntime, load_deployment};
pub use error::{ConfigError, DispatchError, HandlerError};
pub use extension::{ExtensionChange, ExtensionEvent, ExtensionRegistry};
pub use handler::{
    BuiltinHandlerFactory, CachePolicy, ConfiguredCachePolicy, DataHandler, DataHandlerFactory,
    EchoHandler, HandlerRef, StaticFileHandler,
};
pub use registry::{RestartOutcome, ServerRegistry};
pub use session::SessionRegistry;
pub use statistics::{
    ApplicationStatistics, CacheOutcome, LogStatisticsSink, RequestStatistics, StatisticsSink,
    StatisticsSnapshot,
};
