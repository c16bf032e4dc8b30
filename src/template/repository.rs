//! Template repository
//!
//! Cache-first resolution of [`TemplateRef`]s. On a miss the fetcher for the
//! reference's source type is called and the normalized result is cached.
//! Concurrent resolves of the same key share one fetch: callers serialize on
//! a per-key lock and re-check the cache once they hold it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument};

use super::cache::{CacheStats, TemplateCache};
use super::source::TemplateFetcher;
use super::Template;
use crate::auth::Credentials;
use crate::crd::{TemplateRef, TemplateSourceType};
use crate::error::{Error, Result};

type KeyLock = Arc<tokio::sync::Mutex<()>>;

pub struct TemplateRepository {
    cache: TemplateCache,
    fetchers: HashMap<TemplateSourceType, Box<dyn TemplateFetcher>>,
    in_flight: Mutex<HashMap<TemplateRef, KeyLock>>,
}

impl TemplateRepository {
    pub fn new(cache: TemplateCache, fetchers: Vec<Box<dyn TemplateFetcher>>) -> Self {
        let fetchers = fetchers
            .into_iter()
            .map(|f| (f.source_type(), f))
            .collect();
        Self {
            cache,
            fetchers,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self, credentials), fields(template = %reference))]
    pub async fn resolve(&self, reference: &TemplateRef, credentials: &Credentials) -> Result<Arc<Template>> {
        if let Some(template) = self.cache.get(reference) {
            debug!("Template cache hit");
            return Ok(template);
        }

        let key_lock = self.key_lock(reference);
        let result = {
            let _guard = key_lock.lock().await;
            // Another caller may have filled the cache while we waited
            match self.cache.peek(reference) {
                Some(template) => Ok(template),
                None => self.fetch_and_store(reference, credentials).await,
            }
        };
        self.release_key_lock(reference, &key_lock);
        result
    }

    async fn fetch_and_store(&self, reference: &TemplateRef, credentials: &Credentials) -> Result<Arc<Template>> {
        let fetcher = self.fetchers.get(&reference.source_type).ok_or_else(|| {
            Error::ConfigError(format!("no fetcher registered for {}", reference.source_type))
        })?;

        let source = fetcher.fetch(reference, credentials).await?;
        let template = Arc::new(Template::from_source(reference, source)?);
        info!(
            "Resolved template {} {} at revision {}",
            template.name, template.version, template.revision
        );
        self.cache.put(reference.clone(), template.clone());
        Ok(template)
    }

    fn key_lock(&self, reference: &TemplateRef) -> KeyLock {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.entry(reference.clone()).or_default().clone()
    }

    /// Forget the per-key lock once nobody else holds a handle to it
    fn release_key_lock(&self, reference: &TemplateRef, key_lock: &KeyLock) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // One count for the map entry, one for the caller
        if Arc::strong_count(key_lock) <= 2 {
            in_flight.remove(reference);
        }
    }

    /// Drop a cached template (e.g. a floating branch after a push notification)
    pub fn invalidate(&self, reference: &TemplateRef) -> bool {
        self.cache.invalidate(reference)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
