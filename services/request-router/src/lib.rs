use std::{collections::HashMap, fmt, sync::Arc};

use arc_swap::ArcSwap;
use log::info;
use parking_lot::Mutex;
use schema::{Condition, DatasetId, Request};

mod fallback;

pub use fallback::{FallbackPolicy, RouteResolution, is_safe_relative_path};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("dataset '{dataset}' is already registered in this application")]
    DuplicateDataset { dataset: String },
    #[error("application '{application}' has no dataset or file for '{path}'")]
    RouteNotFound { application: String, path: String },
}

pub type Predicate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Match predicate evaluated against the live request.
#[derive(Clone)]
pub enum Selector {
    Always,
    Conditions(Vec<Condition>),
    Custom(Predicate),
}

impl Selector {
    pub fn from_conditions(conditions: Vec<Condition>) -> Self {
        if conditions.is_empty() {
            Self::Always
        } else {
            Self::Conditions(conditions)
        }
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, request: &Request) -> bool {
        match self {
            Self::Always => true,
            Self::Conditions(conditions) => conditions
                .iter()
                .all(|condition| condition.matches(request.params())),
            Self::Custom(predicate) => predicate(request),
        }
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Conditions(conditions) => f.debug_tuple("Conditions").field(conditions).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug)]
pub struct Route<H> {
    pub dataset_id: DatasetId,
    pub dataset_name: String,
    pub page_key: String,
    pub selector: Selector,
    pub handler: H,
}

impl<H> Route<H> {
    pub fn new(
        dataset_id: DatasetId,
        dataset_name: &str,
        page: &str,
        selector: Selector,
        handler: H,
    ) -> Self {
        Self {
            dataset_id,
            dataset_name: dataset_name.to_string(),
            page_key: page_key(page),
            selector,
            handler,
        }
    }
}

#[derive(Debug)]
pub struct RouteMatch<H> {
    pub route: Arc<Route<H>>,
    /// Bucket the match came from; `None` when resolved by dataset hint.
    pub page_key: Option<String>,
    /// Every dataset in that bucket whose selector accepted the request.
    pub matched: Vec<String>,
}

impl<H> RouteMatch<H> {
    pub fn is_ambiguous(&self) -> bool {
        self.matched.len() > 1
    }
}

pub trait RouteAuditSink: Send + Sync {
    fn ambiguous_route(&self, request: &Request, page_key: &str, matched: &[String]);
}

pub fn page_key(page: &str) -> String {
    page.trim_matches('/').to_ascii_lowercase()
}

/// Drops the extension of the last path segment only.
pub fn strip_page_extension(key: &str) -> &str {
    let name_start = key.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    match key[name_start..].rfind('.') {
        Some(idx) if idx > 0 => &key[..name_start + idx],
        _ => key,
    }
}

struct RouteSnapshot<H> {
    datasets: HashMap<String, Arc<Route<H>>>,
    buckets: HashMap<String, Arc<[Arc<Route<H>>]>>,
    /// Extensionless stem -> page keys sharing it, in registration order.
    stems: HashMap<String, Vec<String>>,
}

impl<H> Default for RouteSnapshot<H> {
    fn default() -> Self {
        Self {
            datasets: HashMap::new(),
            buckets: HashMap::new(),
            stems: HashMap::new(),
        }
    }
}

impl<H> Clone for RouteSnapshot<H> {
    fn clone(&self) -> Self {
        Self {
            datasets: self.datasets.clone(),
            buckets: self.buckets.clone(),
            stems: self.stems.clone(),
        }
    }
}

/// Page-key dispatch index. Readers load an immutable snapshot; writers
/// serialize on `writer` and publish a rebuilt snapshot.
pub struct RouteTable<H> {
    snapshot: ArcSwap<RouteSnapshot<H>>,
    writer: Mutex<()>,
    audit: Option<Arc<dyn RouteAuditSink>>,
}

impl<H> Default for RouteTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> fmt::Debug for RouteTable<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("datasets", &self.dataset_names())
            .field("page_keys", &self.page_keys())
            .finish()
    }
}

impl<H> RouteTable<H> {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
            writer: Mutex::new(()),
            audit: None,
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn RouteAuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn add_route(&self, route: Route<H>) -> Result<(), RouteError> {
        let _guard = self.writer.lock();
        let current = self.snapshot.load_full();
        let name_key = route.dataset_name.to_ascii_lowercase();
        if current.datasets.contains_key(&name_key) {
            return Err(RouteError::DuplicateDataset {
                dataset: route.dataset_name,
            });
        }

        let mut next = (*current).clone();
        let route = Arc::new(route);
        let key = route.page_key.clone();
        let mut bucket: Vec<Arc<Route<H>>> = next
            .buckets
            .get(&key)
            .map(|bucket| bucket.to_vec())
            .unwrap_or_default();
        if bucket.is_empty() {
            next.stems
                .entry(strip_page_extension(&key).to_string())
                .or_default()
                .push(key.clone());
        }
        bucket.push(Arc::clone(&route));
        next.buckets.insert(key, Arc::from(bucket));
        next.datasets.insert(name_key, route);
        self.snapshot.store(Arc::new(next));
        Ok(())
    }

    /// Removes the dataset and compacts its bucket; absent names are a no-op.
    pub fn remove_route(&self, dataset_name: &str) -> Option<Arc<Route<H>>> {
        let _guard = self.writer.lock();
        let current = self.snapshot.load_full();
        let name_key = dataset_name.to_ascii_lowercase();
        let removed = current.datasets.get(&name_key).cloned()?;

        let mut next = (*current).clone();
        next.datasets.remove(&name_key);
        let key = removed.page_key.clone();
        let remaining: Vec<Arc<Route<H>>> = next
            .buckets
            .get(&key)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|route| !Arc::ptr_eq(route, &removed))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if remaining.is_empty() {
            next.buckets.remove(&key);
            let stem = strip_page_extension(&key).to_string();
            if let Some(keys) = next.stems.get_mut(&stem) {
                keys.retain(|candidate| candidate != &key);
                if keys.is_empty() {
                    next.stems.remove(&stem);
                }
            }
        } else {
            next.buckets.insert(key, Arc::from(remaining));
        }
        self.snapshot.store(Arc::new(next));
        Some(removed)
    }

    pub fn clear(&self) {
        let _guard = self.writer.lock();
        self.snapshot.store(Arc::new(RouteSnapshot::default()));
    }

    pub fn route(&self, dataset_name: &str) -> Option<Arc<Route<H>>> {
        self.snapshot
            .load()
            .datasets
            .get(&dataset_name.to_ascii_lowercase())
            .cloned()
    }

    /// Dataset names registered under `key`, in bucket order.
    pub fn bucket(&self, key: &str) -> Option<Vec<String>> {
        self.snapshot.load().buckets.get(&page_key(key)).map(|bucket| {
            bucket
                .iter()
                .map(|route| route.dataset_name.clone())
                .collect()
        })
    }

    pub fn dataset_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .snapshot
            .load()
            .datasets
            .values()
            .map(|route| route.dataset_name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn page_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.snapshot.load().buckets.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dataset hint first, then the page-name forms in order: exact,
    /// extension stripped, then every registered key sharing the stem.
    pub fn resolve(&self, request: &Request) -> Option<RouteMatch<H>> {
        let snapshot = self.snapshot.load();
        if let Some(hint) = request.dataset_hint()
            && let Some(route) = snapshot.datasets.get(&hint.to_ascii_lowercase())
        {
            return Some(RouteMatch {
                route: Arc::clone(route),
                page_key: None,
                matched: vec![route.dataset_name.clone()],
            });
        }

        candidate_keys(&snapshot, request.page_path())
            .into_iter()
            .find_map(|key| self.match_bucket(&snapshot, &key, request))
    }

    fn match_bucket(
        &self,
        snapshot: &RouteSnapshot<H>,
        key: &str,
        request: &Request,
    ) -> Option<RouteMatch<H>> {
        let bucket = snapshot.buckets.get(key)?;
        let mut hits = bucket.iter().filter(|route| route.selector.matches(request));
        let first = Arc::clone(hits.next()?);
        let mut matched = vec![first.dataset_name.clone()];
        matched.extend(hits.map(|route| route.dataset_name.clone()));

        if matched.len() > 1 {
            info!(
                "request {} for page '{}' matched {} datasets {:?}; dispatching to '{}'",
                request.request_id(),
                key,
                matched.len(),
                matched,
                first.dataset_name
            );
            if let Some(audit) = &self.audit {
                audit.ambiguous_route(request, key, &matched);
            }
        }

        Some(RouteMatch {
            route: first,
            page_key: Some(key.to_string()),
            matched,
        })
    }
}

fn candidate_keys<H>(snapshot: &RouteSnapshot<H>, page: &str) -> Vec<String> {
    let exact = page_key(page);
    if exact.is_empty() {
        return Vec::new();
    }
    let stem = strip_page_extension(&exact).to_string();
    let mut keys = vec![exact.clone()];
    if stem != exact {
        keys.push(stem.clone());
    }
    if let Some(related) = snapshot.stems.get(&stem) {
        for key in related {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }
    keys
}
