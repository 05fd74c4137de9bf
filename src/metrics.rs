//! Prometheus metrics shared by the pipeline, cache and detector.

use once_cell::sync::Lazy;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, TextEncoder};

pub static FETCH_SUCCESS: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("pulse_fetch_success_total", "Series fetched and stored").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static FETCH_FAILURE: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "pulse_fetch_failure_total",
        "Series whose processing failed in a pipeline run",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static STALE_HITS: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "pulse_cache_stale_hits_total",
        "Cache reads satisfied by the stale tier",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ANOMALIES: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("pulse_anomalies_total", "Values classified as anomalous").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

/// Streams held across every live `AnomalyDetector` in the process. Each
/// detector adds and removes only its own streams, and gives them back when
/// dropped, so concurrent detectors sum instead of overwriting each other.
pub static TRACKED_STREAMS: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new(
        "pulse_tracked_streams",
        "Detector streams held in memory, summed over all detectors",
    )
    .unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static FETCH_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "pulse_fetch_duration_seconds",
        "Duration of a full pipeline run",
    ))
    .unwrap();
    prometheus::register(Box::new(h.clone())).unwrap();
    h
});

/// Force registration so every series shows up on the first scrape.
pub fn init() {
    let _ = &*FETCH_SUCCESS;
    let _ = &*FETCH_FAILURE;
    let _ = &*STALE_HITS;
    let _ = &*ANOMALIES;
    let _ = &*TRACKED_STREAMS;
    let _ = &*FETCH_DURATION;
}

/// Render the default registry in the text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
