//! Prometheus metrics registry and metric definitions.

use std::time::Instant;

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Global registry under crate namespace
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("oap_query".into()), None)
        .expect("failed to create Prometheus registry")
});

/// Storage queries issued, by backend and contract operation
pub static QUERY_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("storage_queries_total", "Total number of storage queries");
    let c = IntCounterVec::new(opts, &["backend", "operation"]).expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

/// Storage queries that ended in an error
pub static QUERY_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("storage_query_errors_total", "Total number of failed storage queries");
    let c = IntCounterVec::new(opts, &["backend", "operation"]).expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

/// Histogram of storage round-trip durations
pub static QUERY_HISTOGRAM: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "storage_query_duration_seconds",
        "Duration of storage queries in seconds",
    );
    let h = HistogramVec::new(opts, &["backend", "operation"]).expect("histogram opts");
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

/// Times one contract operation; call `finish` with the outcome.
pub struct QueryTimer {
    backend: &'static str,
    operation: &'static str,
    start: Instant,
}

impl QueryTimer {
    pub fn start(backend: &'static str, operation: &'static str) -> Self {
        QUERY_COUNTER.with_label_values(&[backend, operation]).inc();
        Self {
            backend,
            operation,
            start: Instant::now(),
        }
    }

    pub fn finish<T, E>(self, result: Result<T, E>) -> Result<T, E> {
        let labels = [self.backend, self.operation];
        QUERY_HISTOGRAM
            .with_label_values(&labels)
            .observe(self.start.elapsed().as_secs_f64());
        if result.is_err() {
            QUERY_ERRORS.with_label_values(&labels).inc();
        }
        result
    }
}

/// Encode all metrics as text
pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let mf = REGISTRY.gather();
    encoder.encode(&mf, &mut buffer).expect("failed to encode");
    String::from_utf8(buffer).expect("invalid utf8")
}
