//! In-memory template cache
//!
//! Keyed by the full [`TemplateRef`] including version, so two versions of a
//! template never alias. Entries are immutable `Arc<Template>` values; the
//! only mutations are insertion and invalidation/eviction, done under a
//! write lock. Readers share a read lock and clone the `Arc` out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::debug;

use super::Template;
use crate::crd::TemplateRef;

/// Hit/miss counters exposed to metrics collectors
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

#[derive(Default)]
struct Entries {
    templates: HashMap<TemplateRef, Arc<Template>>,
    /// Insertion order, used for eviction when a capacity is set
    order: VecDeque<TemplateRef>,
}

#[derive(Default)]
pub struct TemplateCache {
    entries: RwLock<Entries>,
    capacity: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache holding at most `capacity` templates; the oldest entry is evicted first
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::default()
        }
    }

    /// Look up a template, counting the hit or miss
    pub fn get(&self, key: &TemplateRef) -> Option<Arc<Template>> {
        let found = self.peek(key);
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Look up a template without touching the counters
    pub fn peek(&self, key: &TemplateRef) -> Option<Arc<Template>> {
        self.read().templates.get(key).cloned()
    }

    pub fn put(&self, key: TemplateRef, template: Arc<Template>) {
        let mut entries = self.write();
        if entries.templates.insert(key.clone(), template).is_none() {
            entries.order.push_back(key);
        }
        if let Some(capacity) = self.capacity {
            while entries.templates.len() > capacity {
                let Some(oldest) = entries.order.pop_front() else {
                    break;
                };
                debug!("Evicting template {} from cache", oldest);
                entries.templates.remove(&oldest);
            }
        }
    }

    /// Drop a cached template so the next resolve fetches it again.
    /// Returns whether an entry was present.
    pub fn invalidate(&self, key: &TemplateRef) -> bool {
        let mut entries = self.write();
        let removed = entries.templates.remove(key).is_some();
        if removed {
            entries.order.retain(|k| k != key);
        }
        removed
    }

    pub fn clear(&self) {
        let mut entries = self.write();
        entries.templates.clear();
        entries.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.read().templates.len() as u64,
        }
    }

    // A panic while holding the lock cannot leave a half-written entry
    // (inserts are single map operations), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}
