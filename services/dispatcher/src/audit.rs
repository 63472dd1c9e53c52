use std::{
    fs::{File, OpenOptions, create_dir_all},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use request_router::RouteAuditSink;
use schema::{AccessLevel, Request};
use serde::Serialize;

use crate::statistics::unix_timestamp_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    AccessDenied {
        application: String,
        code: String,
        principal: Option<String>,
        resource: String,
        session_id: Option<String>,
        requested: AccessLevel,
        held: AccessLevel,
    },
    AmbiguousRoute {
        application: String,
        request_id: u64,
        page_key: String,
        matched: Vec<String>,
    },
    CapacityExceeded {
        application: String,
        in_flight: usize,
        ceiling: usize,
    },
    ApplicationRestarted {
        application: String,
        reason: String,
    },
    RestartAbandoned {
        application: String,
        in_flight: usize,
        rounds: u32,
        reason: String,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AccessDenied { .. } => "access_denied",
            Self::AmbiguousRoute { .. } => "ambiguous_route",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::ApplicationRestarted { .. } => "application_restarted",
            Self::RestartAbandoned { .. } => "restart_abandoned",
        }
    }

    pub fn application(&self) -> &str {
        match self {
            Self::AccessDenied { application, .. }
            | Self::AmbiguousRoute { application, .. }
            | Self::CapacityExceeded { application, .. }
            | Self::ApplicationRestarted { application, .. }
            | Self::RestartAbandoned { application, .. } => application,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: &AuditEvent) {
        let payload = serde_json::to_string(event).unwrap_or_else(|_| event.kind().to_string());
        match event {
            AuditEvent::AmbiguousRoute { .. } | AuditEvent::ApplicationRestarted { .. } => {
                log::info!(target: "dispatcher::audit", "{payload}")
            }
            _ => log::warn!(target: "dispatcher::audit", "{payload}"),
        }
    }
}

/// Append-only JSON lines file; `seq` continues across reopen.
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
    next_seq: Mutex<u64>,
    write_error_total: AtomicU64,
}

impl JsonLinesAuditSink {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent)?;
        }
        let next_seq = match File::open(&path) {
            Ok(file) => BufReader::new(file)
                .lines()
                .map_while(Result::ok)
                .filter(|line| !line.trim().is_empty())
                .count() as u64
                + 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 1,
            Err(err) => return Err(err),
        };
        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            write_error_total: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_error_total(&self) -> u64 {
        self.write_error_total.load(Ordering::Relaxed)
    }

    fn append(&self, event: &AuditEvent) -> Result<(), String> {
        let mut next_seq = self.next_seq.lock();
        let mut payload =
            serde_json::to_value(event).map_err(|err| format!("encoding audit event: {err}"))?;
        if let Some(object) = payload.as_object_mut() {
            object.insert("seq".to_string(), (*next_seq).into());
            object.insert("ts_unix_ms".to_string(), unix_timestamp_millis().into());
            object.insert("service".to_string(), "dispatcher".into());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| format!("opening audit file failed: {err}"))?;
        writeln!(file, "{payload}").map_err(|err| format!("appending audit file failed: {err}"))?;
        *next_seq += 1;
        Ok(())
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Err(err) = self.append(event) {
            self.write_error_total.fetch_add(1, Ordering::Relaxed);
            log::error!("audit write to '{}' failed: {err}", self.path.display());
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

#[derive(Default, Clone)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, event: &AuditEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Forwards route-table ambiguity reports under the application's current name.
pub(crate) struct RouteAuditBridge {
    pub(crate) application: Arc<RwLock<String>>,
    pub(crate) sink: Arc<dyn AuditSink>,
}

impl RouteAuditSink for RouteAuditBridge {
    fn ambiguous_route(&self, request: &Request, page_key: &str, matched: &[String]) {
        self.sink.record(&AuditEvent::AmbiguousRoute {
            application: self.application.read().clone(),
            request_id: request.request_id(),
            page_key: page_key.to_string(),
            matched: matched.to_vec(),
        });
    }
}
