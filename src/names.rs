use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tracing::debug;

use crate::api::TransitApi;

/// Turns a short stop/destination code into a display name.
pub trait ResolveName: Send + Sync {
    /// Never fails: falls back to `code` itself.
    fn resolve(&self, code: &str) -> impl Future<Output = String> + Send;
}

/// Uncached lookups against the stop-point endpoint.
pub struct NameResolver<A> {
    api: Arc<A>,
}

impl<A: TransitApi> NameResolver<A> {
    pub fn new(api: Arc<A>) -> Self {
        NameResolver { api }
    }

    /// The resolved name, or `None` on any failure or empty result.
    pub async fn lookup(&self, code: &str) -> Option<String> {
        if code.trim().is_empty() {
            return None;
        }

        match self.api.stop_point(code).await {
            Ok(Some(stop)) if !stop.name.trim().is_empty() => Some(stop.name),
            Ok(_) => {
                debug!("No name found for '{}'", code);
                None
            }
            Err(e) => {
                debug!("Name lookup for '{}' failed: {}", code, e);
                None
            }
        }
    }
}

impl<A: TransitApi> ResolveName for NameResolver<A> {
    async fn resolve(&self, code: &str) -> String {
        self.lookup(code).await.unwrap_or_else(|| code.to_string())
    }
}

/// Memoising front for [`NameResolver`], shared by the poller and the route
/// overlay. Concurrent lookups of one code share a single request. Failed
/// lookups are not remembered.
pub struct NameCache<A> {
    resolver: Arc<NameResolver<A>>,
    entries: Arc<Mutex<HashMap<String, Arc<OnceCell<String>>>>>,
}

impl<A> Clone for NameCache<A> {
    fn clone(&self) -> Self {
        NameCache {
            resolver: Arc::clone(&self.resolver),
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<A: TransitApi> NameCache<A> {
    pub fn new(resolver: NameResolver<A>) -> Self {
        NameCache {
            resolver: Arc::new(resolver),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, code: &str) -> Arc<OnceCell<String>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(code.to_string()).or_default())
    }
}

impl<A: TransitApi> ResolveName for NameCache<A> {
    async fn resolve(&self, code: &str) -> String {
        if code.trim().is_empty() {
            return code.to_string();
        }

        let cell = self.cell(code);
        let resolved = cell
            .get_or_try_init(|| async { self.resolver.lookup(code).await.ok_or(()) })
            .await;

        match resolved {
            Ok(name) => name.clone(),
            Err(()) => code.to_string(),
        }
    }
}
