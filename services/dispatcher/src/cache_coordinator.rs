use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use cache::{CacheContext, CachedResponse, ResponseCache};
use schema::{ApplicationId, DatasetId, Request, RequestType, ResponseSink};

use crate::handler::DataHandler;

/// Carries the admission-time fingerprint from lookup to store.
#[derive(Debug)]
pub struct CacheTicket {
    context: CacheContext,
    admitted: Request,
    generation: u64,
}

impl CacheTicket {
    pub fn context(&self) -> &CacheContext {
        &self.context
    }

    /// The request as it was before the handler saw it.
    pub fn admitted(&self) -> &Request {
        &self.admitted
    }
}

#[derive(Debug)]
pub enum CacheLookup {
    Bypass,
    Hit,
    Miss(CacheTicket),
}

/// One application's view of the shared response cache.
///
/// Every flush advances a generation; responses whose lookup predates the
/// latest flush are never stored.
#[derive(Debug, Clone)]
pub struct CacheCoordinator {
    application_id: ApplicationId,
    cache: Arc<ResponseCache>,
    generation: Arc<AtomicU64>,
}

impl CacheCoordinator {
    pub fn new(application_id: ApplicationId, cache: Arc<ResponseCache>) -> Self {
        Self {
            application_id,
            cache,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn lookup(
        &self,
        dataset_id: DatasetId,
        handler: &dyn DataHandler,
        request: &mut Request,
        request_type: RequestType,
    ) -> CacheLookup {
        let Some(policy) = handler.cache_policy() else {
            return CacheLookup::Bypass;
        };
        if !policy.is_request_cacheable(request, request_type) {
            return CacheLookup::Bypass;
        }

        let generation = self.generation.load(Ordering::Acquire);
        let admitted = request.clone();
        let context = policy.build_cache_context(self.application_id, dataset_id, &admitted);
        if let Some(stored) = self.cache.get(&context) {
            stored.apply_to(request.response_mut());
            log::debug!(
                "cache hit for dataset '{}' request {}",
                handler.dataset_name(),
                request.request_id()
            );
            return CacheLookup::Hit;
        }
        request.mark_cache_eligible();
        CacheLookup::Miss(CacheTicket {
            context,
            admitted,
            generation,
        })
    }

    /// Stores the completed response under the ticket's fingerprint when the
    /// handler still considers it cacheable. Error responses are never stored.
    pub fn complete(&self, ticket: CacheTicket, handler: &dyn DataHandler, request: &Request) -> bool {
        let response = request.response();
        if response.is_error_response() || !request.is_cache_eligible() {
            return false;
        }
        let Some(policy) = handler.cache_policy() else {
            return false;
        };
        if !policy.is_response_cacheable(response) {
            return false;
        }
        if self.generation.load(Ordering::Acquire) != ticket.generation {
            log::debug!(
                "dropping response for request {}: application {} flushed while it ran",
                request.request_id(),
                self.application_id
            );
            return false;
        }
        let stored = self
            .cache
            .insert(ticket.context.clone(), CachedResponse::snapshot(response));
        // A flush that raced the insert must still win.
        if stored && self.generation.load(Ordering::Acquire) != ticket.generation {
            self.cache.remove(&ticket.context);
            return false;
        }
        stored
    }

    pub fn flush(&self) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let removed = self.cache.flush_application(self.application_id);
        if removed > 0 {
            log::debug!(
                "flushed {removed} cached responses for application {}",
                self.application_id
            );
        }
        removed
    }
}
