//! Prometheus metrics for the page cache.
//!
//! Each [`Cache`](crate::cache::router::Cache) owns its own registry so that
//! independent caches (one per test, say) never collide on metric names.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct CacheMetrics {
    registry: Registry,

    /// Bounded range fetches issued for page loads and reloads.
    pub range_fetches: IntCounter,

    /// Single-item length probes.
    pub probes: IntCounter,

    /// Page requests answered without any fetch.
    pub cache_hits: IntCounter,

    /// Cascades started by a boundary change.
    pub cascades: IntCounter,

    /// Pages reloaded during cascades.
    pub page_reloads: IntCounter,

    /// Live deliveries that changed a page.
    pub live_deliveries: IntCounter,

    /// Live subscriptions that errored or closed.
    pub subscription_failures: IntCounter,

    /// Live page managers.
    pub managers: IntGauge,
}

impl CacheMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let range_fetches = counter(
            "page_cache_range_fetches_total",
            "Bounded range fetches issued for page loads",
        )?;
        let probes = counter("page_cache_probes_total", "Single-item length probes")?;
        let cache_hits = counter(
            "page_cache_hits_total",
            "Page requests served without a fetch",
        )?;
        let cascades = counter(
            "page_cache_cascades_total",
            "Cascades triggered by boundary changes",
        )?;
        let page_reloads = counter(
            "page_cache_page_reloads_total",
            "Pages reloaded during cascades",
        )?;
        let live_deliveries = counter(
            "page_cache_live_deliveries_total",
            "Live deliveries that changed a cached page",
        )?;
        let subscription_failures = counter(
            "page_cache_subscription_failures_total",
            "Live subscriptions that errored or closed",
        )?;

        let managers = IntGauge::new("page_cache_managers", "Live page managers")?;
        registry.register(Box::new(managers.clone()))?;

        Ok(Self {
            registry,
            range_fetches,
            probes,
            cache_hits,
            cascades,
            page_reloads,
            live_deliveries,
            subscription_failures,
            managers,
        })
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = CacheMetrics::new().unwrap();
        metrics.probes.inc();
        metrics.managers.set(2);

        let text = metrics.render().unwrap();
        assert!(text.contains("page_cache_probes_total 1"));
        assert!(text.contains("page_cache_managers 2"));
    }

    #[test]
    fn test_independent_registries() {
        // Two caches in one process must not clash.
        assert!(CacheMetrics::new().is_ok());
        assert!(CacheMetrics::new().is_ok());
    }
}
