//! Prometheus metrics for the HTTP front-end.
//!
//! Cache gauges are refreshed from [`LruStats`] at scrape time, so the
//! library itself carries no metrics dependency on its hot path.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::cache::lru::LruStats;

pub struct CacheMetrics {
    registry: Registry,
    requests: IntCounterVec,
    entries: IntGauge,
    weight: IntGauge,
    max_weight: IntGauge,
    hits: IntGauge,
    misses: IntGauge,
    puts: IntGauge,
    evictions: IntGauge,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("disk_lru_cache_http_requests_total", "HTTP requests served"),
            &["route", "status"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        Ok(Self {
            entries: gauge(&registry, "disk_lru_cache_entries", "Live keys")?,
            weight: gauge(&registry, "disk_lru_cache_weight_bytes", "Bytes held by live blobs")?,
            max_weight: gauge(&registry, "disk_lru_cache_capacity_bytes", "Byte budget")?,
            hits: gauge(&registry, "disk_lru_cache_hits", "Lookups that found a live key")?,
            misses: gauge(&registry, "disk_lru_cache_misses", "Lookups that found nothing")?,
            puts: gauge(&registry, "disk_lru_cache_puts", "Committed blobs")?,
            evictions: gauge(&registry, "disk_lru_cache_evictions", "Entries evicted for space")?,
            requests,
            registry,
        })
    }

    /// Count one request against `route` with its response status.
    pub fn observe_request(&self, route: &str, status: u16) {
        self.requests
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    pub fn update(&self, stats: &LruStats) {
        let clamp = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        self.entries.set(clamp(stats.entries as u64));
        self.weight.set(clamp(stats.weight));
        self.max_weight.set(clamp(stats.max_weight));
        self.hits.set(clamp(stats.hits));
        self.misses.set(clamp(stats.misses));
        self.puts.set(clamp(stats.puts));
        self.evictions.set(clamp(stats.evictions));
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> prometheus::Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
