use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use schema::{ApplicationId, DatasetId, Request, Response};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Fingerprint of a cacheable request. Equality and hashing define the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheContext {
    pub application_id: ApplicationId,
    pub dataset_id: DatasetId,
    pub page: String,
    pub parameters: Vec<(String, Vec<String>)>,
    pub headers: Vec<(String, String)>,
}

impl CacheContext {
    /// `key_parameters` empty means every request parameter participates.
    pub fn from_request(
        application_id: ApplicationId,
        dataset_id: DatasetId,
        request: &Request,
        key_parameters: &[String],
        key_headers: &[String],
    ) -> Self {
        let parameters = if key_parameters.is_empty() {
            request
                .params()
                .iter()
                .map(|(name, values)| (name.to_string(), values.to_vec()))
                .collect()
        } else {
            let mut selected: Vec<(String, Vec<String>)> = key_parameters
                .iter()
                .map(|name| (name.clone(), request.params().values(name).to_vec()))
                .collect();
            selected.sort_by(|a, b| a.0.cmp(&b.0));
            selected.dedup_by(|a, b| a.0 == b.0);
            selected
        };
        let mut headers: Vec<(String, String)> = key_headers
            .iter()
            .map(|name| {
                let name = name.to_ascii_lowercase();
                let value = request.header(&name).unwrap_or_default().to_string();
                (name, value)
            })
            .collect();
        headers.sort();
        headers.dedup_by(|a, b| a.0 == b.0);

        Self {
            application_id,
            dataset_id,
            page: request.page_path().to_ascii_lowercase(),
            parameters,
            headers,
        }
    }
}

/// Stored copy of a successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub stored_at_unix_ms: u64,
}

impl CachedResponse {
    pub fn snapshot(response: &Response) -> Self {
        Self {
            status: response.status,
            content_type: response.content_type.clone(),
            headers: response.headers.clone(),
            body: response.body.clone(),
            stored_at_unix_ms: unix_timestamp_millis(),
        }
    }

    pub fn apply_to(&self, response: &mut Response) {
        response.status = self.status;
        response.content_type = self.content_type.clone();
        response.headers = self.headers.clone();
        response.body = self.body.clone();
        response.error_code = None;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub entries: usize,
    pub hit_total: u64,
    pub miss_total: u64,
    pub store_total: u64,
    pub store_rejected_total: u64,
    pub flush_total: u64,
    pub flushed_entries_total: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hit_total: AtomicU64,
    miss_total: AtomicU64,
    store_total: AtomicU64,
    store_rejected_total: AtomicU64,
    flush_total: AtomicU64,
    flushed_entries_total: AtomicU64,
}

/// Look-aside response cache shared by every application of a server.
#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<CacheContext, Arc<CachedResponse>>,
    max_entries: usize,
    counters: CacheCounters,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            counters: CacheCounters::default(),
        }
    }

    pub fn get(&self, context: &CacheContext) -> Option<Arc<CachedResponse>> {
        let found = self.entries.get(context).map(|entry| Arc::clone(entry.value()));
        if found.is_some() {
            self.counters.hit_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.miss_total.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Returns false when the cache is full and the key is not already present.
    pub fn insert(&self, context: CacheContext, response: CachedResponse) -> bool {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&context) {
            self.counters
                .store_rejected_total
                .fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "response cache full ({} entries); skipping store for application {}",
                self.max_entries,
                context.application_id
            );
            return false;
        }
        self.entries.insert(context, Arc::new(response));
        self.counters.store_total.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn remove(&self, context: &CacheContext) -> bool {
        self.entries.remove(context).is_some()
    }

    pub fn flush_application(&self, application_id: ApplicationId) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|context, _| context.application_id != application_id);
        let removed = before.saturating_sub(self.entries.len());
        self.counters.flush_total.fetch_add(1, Ordering::Relaxed);
        self.counters
            .flushed_entries_total
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn entries_for_application(&self, application_id: ApplicationId) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.key().application_id == application_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            entries: self.entries.len(),
            hit_total: self.counters.hit_total.load(Ordering::Relaxed),
            miss_total: self.counters.miss_total.load(Ordering::Relaxed),
            store_total: self.counters.store_total.load(Ordering::Relaxed),
            store_rejected_total: self.counters.store_rejected_total.load(Ordering::Relaxed),
            flush_total: self.counters.flush_total.load(Ordering::Relaxed),
            flushed_entries_total: self.counters.flushed_entries_total.load(Ordering::Relaxed),
        }
    }
}

fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::ResponseSink;

    fn context_for(app: ApplicationId, request: &Request) -> CacheContext {
        CacheContext::from_request(app, 1, request, &[], &[])
    }

    #[test]
    fn context_ignores_parameters_outside_the_key() {
        let keys = vec!["q".to_string()];
        let a = Request::new("catalog", "search.xml")
            .with_param("q", "shoes")
            .with_param("trace", "1");
        let b = Request::new("catalog", "search.xml").with_param("q", "shoes");
        let c = Request::new("catalog", "search.xml").with_param("q", "boots");

        let ctx_a = CacheContext::from_request(1, 1, &a, &keys, &[]);
        let ctx_b = CacheContext::from_request(1, 1, &b, &keys, &[]);
        let ctx_c = CacheContext::from_request(1, 1, &c, &keys, &[]);
        assert_eq!(ctx_a, ctx_b);
        assert_ne!(ctx_a, ctx_c);
    }

    #[test]
    fn context_includes_selected_headers_case_insensitively() {
        let keys = vec!["Accept-Language".to_string()];
        let en = Request::new("catalog", "search.xml").with_header("accept-language", "en");
        let fr = Request::new("catalog", "search.xml").with_header("Accept-Language", "fr");
        assert_ne!(
            CacheContext::from_request(1, 1, &en, &[], &keys),
            CacheContext::from_request(1, 1, &fr, &[], &keys)
        );
    }

    #[test]
    fn hit_returns_stored_snapshot_and_counts() {
        let cache = ResponseCache::new(8);
        let request = Request::new("catalog", "search.xml").with_param("q", "shoes");
        let ctx = context_for(1, &request);
        assert!(cache.get(&ctx).is_none());

        let mut response = Response::default();
        response.set_content("application/json", b"{\"hits\":3}".to_vec());
        assert!(cache.insert(ctx.clone(), CachedResponse::snapshot(&response)));

        let mut target = Response::default();
        target.mark_error("stale");
        cache.get(&ctx).unwrap().apply_to(&mut target);
        assert_eq!(target.body, response.body);
        assert_eq!(target.content_type, "application/json");
        assert!(target.error_code.is_none());

        let stats = cache.stats();
        assert_eq!(stats.hit_total, 1);
        assert_eq!(stats.miss_total, 1);
        assert_eq!(stats.store_total, 1);
    }

    #[test]
    fn flush_application_only_drops_that_application() {
        let cache = ResponseCache::new(8);
        let request = Request::new("catalog", "search.xml");
        let snapshot = CachedResponse::snapshot(&Response::default());
        cache.insert(context_for(1, &request), snapshot.clone());
        cache.insert(context_for(2, &request), snapshot);

        assert_eq!(cache.flush_application(1), 1);
        assert_eq!(cache.entries_for_application(1), 0);
        assert_eq!(cache.entries_for_application(2), 1);
        assert_eq!(cache.stats().flushed_entries_total, 1);
    }

    #[test]
    fn full_cache_rejects_new_keys_but_refreshes_existing() {
        let cache = ResponseCache::new(1);
        let first = Request::new("catalog", "a.xml");
        let second = Request::new("catalog", "b.xml");
        let snapshot = CachedResponse::snapshot(&Response::default());

        assert!(cache.insert(context_for(1, &first), snapshot.clone()));
        assert!(!cache.insert(context_for(1, &second), snapshot.clone()));
        assert!(cache.insert(context_for(1, &first), snapshot));
        assert_eq!(cache.stats().store_rejected_total, 1);
        assert_eq!(cache.len(), 1);
    }
}
