//! Prometheus metrics for the moduleops controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `moduleops_reconcile_duration_seconds` (histogram): attempt duration labeled by outcome.
//! - `moduleops_reconcile_total` (counter): attempts labeled by outcome.
//! - `moduleops_reconcile_errors_total` (counter): failed attempts labeled by error reason.
//! - `moduleops_template_cache_hits` / `moduleops_template_cache_misses` (gauge): cache counters.
//! - `moduleops_template_cache_entries` (gauge): templates currently cached.
//! - `moduleops_work_queue_depth` (gauge): Modules waiting for a worker.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::template::CacheStats;

/// Labels for reconcile attempt metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// "succeeded", "retry", "terminal" or "deleted"
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error reason, e.g. "SourceUnreachable", "RenderError"
    pub reason: String,
}

pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_TOTAL: Lazy<Family<ReconcileLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static TEMPLATE_CACHE_HITS: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static TEMPLATE_CACHE_MISSES: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static TEMPLATE_CACHE_ENTRIES: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static WORK_QUEUE_DEPTH: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "moduleops_reconcile_duration_seconds",
        "Duration of reconcile attempts in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "moduleops_reconcile",
        "Total number of reconcile attempts",
        RECONCILE_TOTAL.clone(),
    );
    registry.register(
        "moduleops_reconcile_errors",
        "Total number of failed reconcile attempts",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "moduleops_template_cache_hits",
        "Template cache hits since start",
        TEMPLATE_CACHE_HITS.clone(),
    );
    registry.register(
        "moduleops_template_cache_misses",
        "Template cache misses since start",
        TEMPLATE_CACHE_MISSES.clone(),
    );
    registry.register(
        "moduleops_template_cache_entries",
        "Templates currently held in the cache",
        TEMPLATE_CACHE_ENTRIES.clone(),
    );
    registry.register(
        "moduleops_work_queue_depth",
        "Modules waiting for a reconcile worker",
        WORK_QUEUE_DEPTH.clone(),
    );

    registry
});

/// Record one finished reconcile attempt
pub fn observe_reconcile(outcome: &str, seconds: f64) {
    let labels = ReconcileLabels {
        outcome: outcome.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
    RECONCILE_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_reconcile_error(reason: &str) {
    let labels = ErrorLabels {
        reason: reason.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_cache_stats(stats: CacheStats) {
    TEMPLATE_CACHE_HITS.set(stats.hits as i64);
    TEMPLATE_CACHE_MISSES.set(stats.misses as i64);
    TEMPLATE_CACHE_ENTRIES.set(stats.entries as i64);
}

pub fn set_queue_depth(depth: usize) {
    WORK_QUEUE_DEPTH.set(depth as i64);
}

/// Text exposition of [`REGISTRY`]
pub fn encode_registry() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_exports_reconcile_metrics() {
        observe_reconcile("succeeded", 0.25);
        inc_reconcile_error("RenderError");
        let text = encode_registry().unwrap();
        assert!(text.contains("moduleops_reconcile_duration_seconds"));
        assert!(text.contains("outcome=\"succeeded\""));
        assert!(text.contains("reason=\"RenderError\""));
    }

    #[test]
    fn test_set_cache_stats() {
        set_cache_stats(CacheStats {
            hits: 7,
            misses: 2,
            entries: 2,
        });
        assert_eq!(TEMPLATE_CACHE_HITS.get(), 7);
        assert_eq!(TEMPLATE_CACHE_MISSES.get(), 2);
    }
}
