//! Metrics collection and export module

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Instant;

use crate::pipeline::PipelineError;

/// Counters and histograms for the transaction pipeline
pub struct PipelineMetrics {
    registry: Registry,

    // Counters
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub fetches: IntCounter,
    pub persists: IntCounter,
    pub corruptions: IntCounter,
    pub failures: IntCounterVec,

    // Histograms
    pub parse_latency: Histogram,
}

impl PipelineMetrics {
    /// Create new metrics instance on a private registry
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let cache_hits = IntCounter::with_opts(Opts::new(
            "tx_cache_hits_total",
            "Transactions served from the cache",
        ))?;

        let cache_misses = IntCounter::with_opts(Opts::new(
            "tx_cache_misses_total",
            "Transactions not found in the cache",
        ))?;

        let fetches =
            IntCounter::with_opts(Opts::new("tx_fetches_total", "Fetch capability invocations"))?;

        let persists = IntCounter::with_opts(Opts::new(
            "tx_persists_total",
            "Validated transactions written to the cache",
        ))?;

        let corruptions = IntCounter::with_opts(Opts::new(
            "tx_cache_corruptions_total",
            "Cache entries that failed decode or validation",
        ))?;

        let failures = IntCounterVec::new(
            Opts::new("tx_failures_total", "Pipeline failures by category"),
            &["category"],
        )?;

        let parse_latency = Histogram::with_opts(
            HistogramOpts::new("tx_parse_latency_seconds", "Fetch and parse latency")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]),
        )?;

        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(fetches.clone()))?;
        registry.register(Box::new(persists.clone()))?;
        registry.register(Box::new(corruptions.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(parse_latency.clone()))?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            fetches,
            persists,
            corruptions,
            failures,
            parse_latency,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_failure(&self, error: &PipelineError) {
        self.failures.with_label_values(&[error.category()]).inc();
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn export_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.elapsed_secs());
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
