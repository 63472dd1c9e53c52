use std::{
    fmt::Write as _,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use schema::ApplicationId;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    #[default]
    Bypass,
    Hit,
    Miss,
}

/// Per-request record handed to the accumulator and any external sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestStatistics {
    pub application_id: ApplicationId,
    pub application: String,
    pub request_id: u64,
    pub dataset: Option<String>,
    pub success: bool,
    pub status: u16,
    pub error_code: Option<String>,
    pub cache: CacheOutcome,
    pub cache_stored: bool,
    pub elapsed_us: u64,
    pub slow: bool,
    pub completed_at_unix_ms: u64,
}

impl RequestStatistics {
    pub fn begin(application_id: ApplicationId, application: &str, request_id: u64) -> Self {
        Self {
            application_id,
            application: application.to_string(),
            request_id,
            dataset: None,
            success: false,
            status: 0,
            error_code: None,
            cache: CacheOutcome::Bypass,
            cache_stored: false,
            elapsed_us: 0,
            slow: false,
            completed_at_unix_ms: 0,
        }
    }

    pub fn finish(&mut self, status: u16, error_code: Option<String>, elapsed_us: u64) {
        self.status = status;
        self.success = error_code.is_none() && status < 400;
        self.error_code = error_code;
        self.elapsed_us = elapsed_us;
        self.completed_at_unix_ms = unix_timestamp_millis();
    }
}

pub trait StatisticsSink: Send + Sync {
    fn record(&self, statistics: &RequestStatistics);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatisticsSink;

impl StatisticsSink for LogStatisticsSink {
    fn record(&self, statistics: &RequestStatistics) {
        log::trace!(
            "request {} app={} dataset={:?} status={} cache={:?} elapsed_us={}",
            statistics.request_id,
            statistics.application,
            statistics.dataset,
            statistics.status,
            statistics.cache,
            statistics.elapsed_us
        );
    }
}

/// Rolling accumulator shared by every request of one application.
#[derive(Debug)]
pub struct ApplicationStatistics {
    requests_total: AtomicU64,
    success_total: AtomicU64,
    failure_total: AtomicU64,
    cache_hit_total: AtomicU64,
    cache_miss_total: AtomicU64,
    capacity_rejected_total: AtomicU64,
    unavailable_rejected_total: AtomicU64,
    access_denied_total: AtomicU64,
    slow_total: AtomicU64,
    pending: AtomicU64,
    latency_total_us: AtomicU64,
    latency_min_us: AtomicU64,
    latency_max_us: AtomicU64,
    restart_total: AtomicU64,
    restart_abandoned_total: AtomicU64,
}

impl Default for ApplicationStatistics {
    fn default() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            success_total: AtomicU64::new(0),
            failure_total: AtomicU64::new(0),
            cache_hit_total: AtomicU64::new(0),
            cache_miss_total: AtomicU64::new(0),
            capacity_rejected_total: AtomicU64::new(0),
            unavailable_rejected_total: AtomicU64::new(0),
            access_denied_total: AtomicU64::new(0),
            slow_total: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            latency_total_us: AtomicU64::new(0),
            latency_min_us: AtomicU64::new(u64::MAX),
            latency_max_us: AtomicU64::new(0),
            restart_total: AtomicU64::new(0),
            restart_abandoned_total: AtomicU64::new(0),
        }
    }
}

impl ApplicationStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_started(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, statistics: &RequestStatistics) {
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            });
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if statistics.success {
            self.success_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_total.fetch_add(1, Ordering::Relaxed);
        }
        match statistics.cache {
            CacheOutcome::Hit => {
                self.cache_hit_total.fetch_add(1, Ordering::Relaxed);
            }
            CacheOutcome::Miss => {
                self.cache_miss_total.fetch_add(1, Ordering::Relaxed);
            }
            CacheOutcome::Bypass => {}
        }
        if statistics.slow {
            self.slow_total.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_total_us
            .fetch_add(statistics.elapsed_us, Ordering::Relaxed);
        self.latency_min_us
            .fetch_min(statistics.elapsed_us, Ordering::Relaxed);
        self.latency_max_us
            .fetch_max(statistics.elapsed_us, Ordering::Relaxed);
    }

    pub fn observe_capacity_rejection(&self) {
        self.capacity_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_unavailable_rejection(&self) {
        self.unavailable_rejected_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_access_denied(&self) {
        self.access_denied_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_restart(&self) {
        self.restart_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_restart_abandoned(&self) {
        self.restart_abandoned_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let latency_total_us = self.latency_total_us.load(Ordering::Relaxed);
        let latency_min_us = self.latency_min_us.load(Ordering::Relaxed);
        StatisticsSnapshot {
            requests_total,
            success_total: self.success_total.load(Ordering::Relaxed),
            failure_total: self.failure_total.load(Ordering::Relaxed),
            cache_hit_total: self.cache_hit_total.load(Ordering::Relaxed),
            cache_miss_total: self.cache_miss_total.load(Ordering::Relaxed),
            capacity_rejected_total: self.capacity_rejected_total.load(Ordering::Relaxed),
            unavailable_rejected_total: self.unavailable_rejected_total.load(Ordering::Relaxed),
            access_denied_total: self.access_denied_total.load(Ordering::Relaxed),
            slow_total: self.slow_total.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            latency_min_us: if latency_min_us == u64::MAX {
                0
            } else {
                latency_min_us
            },
            latency_max_us: self.latency_max_us.load(Ordering::Relaxed),
            latency_avg_us: if requests_total == 0 {
                0
            } else {
                latency_total_us / requests_total
            },
            restart_total: self.restart_total.load(Ordering::Relaxed),
            restart_abandoned_total: self.restart_abandoned_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub requests_total: u64,
    pub success_total: u64,
    pub failure_total: u64,
    pub cache_hit_total: u64,
    pub cache_miss_total: u64,
    pub capacity_rejected_total: u64,
    pub unavailable_rejected_total: u64,
    pub access_denied_total: u64,
    pub slow_total: u64,
    pub pending: u64,
    pub latency_min_us: u64,
    pub latency_max_us: u64,
    pub latency_avg_us: u64,
    pub restart_total: u64,
    pub restart_abandoned_total: u64,
}

impl StatisticsSnapshot {
    pub fn samples(&self, in_flight: usize, ceiling: usize) -> [MetricSample; METRIC_COUNT] {
        [
            ("dispatch_requests_total", "counter", self.requests_total),
            ("dispatch_success_total", "counter", self.success_total),
            ("dispatch_failure_total", "counter", self.failure_total),
            ("dispatch_cache_hit_total", "counter", self.cache_hit_total),
            ("dispatch_cache_miss_total", "counter", self.cache_miss_total),
            (
                "dispatch_capacity_rejected_total",
                "counter",
                self.capacity_rejected_total,
            ),
            (
                "dispatch_unavailable_rejected_total",
                "counter",
                self.unavailable_rejected_total,
            ),
            (
                "dispatch_access_denied_total",
                "counter",
                self.access_denied_total,
            ),
            ("dispatch_slow_requests_total", "counter", self.slow_total),
            ("dispatch_restart_total", "counter", self.restart_total),
            (
                "dispatch_restart_abandoned_total",
                "counter",
                self.restart_abandoned_total,
            ),
            ("dispatch_pending_requests", "gauge", self.pending),
            ("dispatch_in_flight", "gauge", in_flight as u64),
            ("dispatch_admission_ceiling", "gauge", ceiling as u64),
            ("dispatch_latency_min_us", "gauge", self.latency_min_us),
            ("dispatch_latency_max_us", "gauge", self.latency_max_us),
            ("dispatch_latency_avg_us", "gauge", self.latency_avg_us),
        ]
    }

    pub fn metrics_text(&self, application: &str, in_flight: usize, ceiling: usize) -> String {
        render_metrics(&[(application, self.samples(in_flight, ceiling))])
    }
}

pub const METRIC_COUNT: usize = 17;

/// `(name, type, value)` of one exported series.
pub type MetricSample = (&'static str, &'static str, u64);

/// Renders per-application samples, one `# TYPE` line per metric name.
pub fn render_metrics(applications: &[(&str, [MetricSample; METRIC_COUNT])]) -> String {
    let mut out = String::new();
    let Some((_, first)) = applications.first() else {
        return out;
    };
    for (index, (name, kind, _)) in first.iter().enumerate() {
        let _ = writeln!(out, "# TYPE {name} {kind}");
        for (application, samples) in applications {
            let label = application.replace('"', "'");
            let _ = writeln!(out, "{name}{{application=\"{label}\"}} {}", samples[index].2);
        }
    }
    out
}

pub(crate) fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as u64)
        .unwrap_or(0)
}
