//! Streaming Z-Score Anomaly Detection
//!
//! One [`StreamState`] per caller-chosen key, updated in O(1) per value.
//! Every value is folded into its stream's baseline, including the values
//! that get flagged, so a large spike shifts the mean and variance that later
//! values are judged against.
//!
//! Non-finite values are never folded in; they come back unscored.
//!
//! [`AnomalyDetector`] takes `&mut self` and therefore assumes one writer.
//! Concurrent callers go through [`DetectorHandle`], which owns the detector
//! on a single task and serializes every update.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::algo::StreamState;
use crate::metrics;
use crate::registry::{RegistryConfig, StreamRegistry};

pub const DEFAULT_MIN_SAMPLES: u64 = 10;

/// Z-score thresholds, checked high to low
const CRITICAL_Z: f64 = 3.0;
const MEDIUM_Z: f64 = 2.0;
const LOW_Z: f64 = 1.5;

/// Severity of a value's deviation from its stream baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    Critical,
}

impl Severity {
    pub fn from_z_score(z: f64) -> Self {
        if z >= CRITICAL_Z {
            Self::Critical
        } else if z >= MEDIUM_Z {
            Self::Medium
        } else if z >= LOW_Z {
            Self::Low
        } else {
            Self::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::Critical => "critical",
        }
    }
}

/// Classification of one value against its stream after the update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub key: String,
    pub value: f64,
    pub mean: f64,
    pub stddev: f64,
    pub z_score: f64,
    pub is_anomaly: bool,
    pub severity: Severity,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Samples required before any value can be flagged
    pub min_samples: u64,
    /// Upper bound on tracked keys (least recently updated evicted first)
    pub max_streams: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_MIN_SAMPLES,
            max_streams: RegistryConfig::default().max_entries,
        }
    }
}

/// Per-key streaming anomaly detector.
#[derive(Debug)]
pub struct AnomalyDetector {
    min_samples: u64,
    streams: StreamRegistry<String, StreamState>,
}

impl AnomalyDetector {
    pub fn new(min_samples: u64) -> Self {
        Self::with_config(DetectorConfig {
            min_samples,
            ..Default::default()
        })
    }

    pub fn with_config(config: DetectorConfig) -> Self {
        Self {
            min_samples: config.min_samples,
            streams: StreamRegistry::with_config(RegistryConfig {
                max_entries: config.max_streams,
            }),
        }
    }

    pub fn min_samples(&self) -> u64 {
        self.min_samples
    }

    /// Fold `value` into the stream for `key` and classify it.
    ///
    /// Non-finite values are reported unscored and leave the stream untouched.
    pub fn update(&mut self, key: &str, value: f64) -> AnomalyResult {
        if !value.is_finite() {
            debug!(key, value, "ignoring non-finite value");
            let state = self.streams.peek(key).copied().unwrap_or_default();
            return unscored(key, value, &state);
        }

        let before = self.streams.len();
        let state = {
            let state = self.streams.get_or_create(key, StreamState::new);
            state.update(value);
            *state
        };
        if self.streams.len() > before {
            metrics::TRACKED_STREAMS.inc();
        }

        let mean = state.mean();
        let stddev = state.std_dev();

        if state.count() < self.min_samples || stddev == 0.0 {
            return unscored(key, value, &state);
        }

        let z_score = (value - mean).abs() / stddev;
        let severity = Severity::from_z_score(z_score);
        let is_anomaly = z_score >= LOW_Z;

        if is_anomaly {
            metrics::ANOMALIES.inc();
            if severity == Severity::Critical {
                warn!(key, value, mean, stddev, z_score, "critical anomaly");
            } else {
                debug!(key, value, z_score, severity = severity.as_str(), "anomaly");
            }
        }

        AnomalyResult {
            key: key.to_string(),
            value,
            mean,
            stddev,
            z_score,
            is_anomaly,
            severity,
        }
    }

    /// Current statistics for `key`, if it has been seen.
    pub fn state(&self, key: &str) -> Option<StreamState> {
        self.streams.peek(key).copied()
    }

    /// Forget one stream; the next update for `key` starts from scratch.
    pub fn remove(&mut self, key: &str) -> Option<StreamState> {
        let removed = self.streams.remove(key);
        if removed.is_some() {
            metrics::TRACKED_STREAMS.dec();
        }
        removed
    }

    /// Forget every stream.
    pub fn reset(&mut self) {
        metrics::TRACKED_STREAMS.sub(self.streams.len() as f64);
        self.streams.clear();
    }

    /// Streams dropped to stay within `max_streams`.
    pub fn evictions(&self) -> u64 {
        self.streams.evictions()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::with_config(DetectorConfig::default())
    }
}

impl Drop for AnomalyDetector {
    fn drop(&mut self) {
        metrics::TRACKED_STREAMS.sub(self.streams.len() as f64);
    }
}

fn unscored(key: &str, value: f64, state: &StreamState) -> AnomalyResult {
    AnomalyResult {
        key: key.to_string(),
        value,
        mean: state.mean(),
        stddev: state.std_dev(),
        z_score: 0.0,
        is_anomaly: false,
        severity: Severity::None,
    }
}

enum Command {
    Update {
        key: String,
        value: f64,
        reply: oneshot::Sender<AnomalyResult>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<Option<StreamState>>,
    },
    Reset,
}

/// Cloneable handle to a detector owned by a single task.
///
/// Updates from any number of callers are applied one at a time in arrival
/// order, which keeps each stream single-writer.
#[derive(Clone)]
pub struct DetectorHandle {
    tx: mpsc::Sender<Command>,
}

impl DetectorHandle {
    /// Spawn the owning task on the current tokio runtime.
    pub fn spawn(detector: AnomalyDetector, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(Self::worker(detector, rx));
        Self { tx }
    }

    async fn worker(mut detector: AnomalyDetector, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Update { key, value, reply } => {
                    let _ = reply.send(detector.update(&key, value));
                }
                Command::Remove { key, reply } => {
                    let _ = reply.send(detector.remove(&key));
                }
                Command::Reset => detector.reset(),
            }
        }
        debug!("detector task stopped");
    }

    /// Returns `None` only if the owning task has stopped.
    pub async fn update(&self, key: impl Into<String>, value: f64) -> Option<AnomalyResult> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Update {
            key: key.into(),
            value,
            reply,
        };
        self.tx.send(cmd).await.ok()?;
        rx.await.ok()
    }

    pub async fn remove(&self, key: impl Into<String>) -> Option<StreamState> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Remove {
            key: key.into(),
            reply,
        };
        self.tx.send(cmd).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn reset(&self) {
        let _ = self.tx.send(Command::Reset).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stream alternating `mean ± stddev` so the baseline has known statistics.
    fn seeded(mean: f64, stddev: f64, count: usize) -> AnomalyDetector {
        let mut detector = AnomalyDetector::new(10);
        for _ in 0..count / 2 {
            detector.update("k", mean + stddev);
            detector.update("k", mean - stddev);
        }
        detector
    }

    #[test]
    fn test_constant_stream_never_flags() {
        let mut detector = AnomalyDetector::new(10);
        let mut result = detector.update("metric", 42.0);
        for _ in 0..99 {
            result = detector.update("metric", 42.0);
        }
        assert!(!result.is_anomaly);
        assert_eq!(result.severity, Severity::None);
        assert_eq!(result.z_score, 0.0);
    }

    #[test]
    fn test_spike_after_stable_values_is_critical() {
        let mut detector = AnomalyDetector::new(10);
        for i in 0..50 {
            // small jitter so the baseline has non-zero spread
            detector.update("metric", 100.0 + (i % 2) as f64);
        }
        let result = detector.update("metric", 1_000.0);
        assert!(result.is_anomaly);
        assert!(result.z_score >= 3.0);
        assert_eq!(result.severity, Severity::Critical);
    }

    #[test]
    fn test_spike_on_flat_baseline_is_critical() {
        let mut detector = AnomalyDetector::new(10);
        for _ in 0..50 {
            detector.update("metric", 100.0);
        }
        let result = detector.update("metric", 200.0);
        assert!(result.is_anomaly);
        assert!(result.z_score >= 3.0);
        assert_eq!(result.severity, Severity::Critical);
    }

    #[test]
    fn test_first_update_never_flags() {
        let mut detector = AnomalyDetector::new(10);
        let result = detector.update("metric", 999.0);
        assert!(!result.is_anomaly);
        assert_eq!(result.z_score, 0.0);
        assert_eq!(result.severity, Severity::None);
    }

    #[test]
    fn test_below_min_samples_never_flags() {
        let mut detector = AnomalyDetector::new(10);
        for i in 0..9 {
            let result = detector.update("metric", (i * 1000) as f64);
            assert!(!result.is_anomaly);
            assert_eq!(result.z_score, 0.0);
        }
    }

    #[test]
    fn test_severity_bands() {
        let cases = [
            (1.4, false, Severity::None),
            (1.6, true, Severity::Low),
            (2.1, true, Severity::Medium),
            (3.1, true, Severity::Critical),
        ];
        for (sigmas, anomalous, severity) in cases {
            let mut detector = seeded(100.0, 10.0, 10_000);
            let result = detector.update("k", 100.0 + 10.0 * sigmas);
            assert_eq!(result.is_anomaly, anomalous, "sigmas = {sigmas}");
            assert_eq!(result.severity, severity, "sigmas = {sigmas}");
        }
    }

    #[test]
    fn test_streams_are_independent() {
        let mut detector = AnomalyDetector::new(10);
        for _ in 0..50 {
            detector.update("A", 100.0);
            detector.update("B", 100.0);
        }
        let a = detector.update("A", 500.0);
        let b = detector.update("B", 100.0);

        assert!(a.is_anomaly);
        assert!(!b.is_anomaly);
        assert_eq!(b.severity, Severity::None);
        assert_eq!(detector.state("B").map(|s| s.mean()), Some(100.0));
    }

    #[test]
    fn test_flagged_value_is_folded_into_baseline() {
        let mut detector = AnomalyDetector::new(10);
        for _ in 0..20 {
            detector.update("k", 10.0);
        }
        let result = detector.update("k", 1_000.0);
        assert!(result.mean > 10.0);
        assert_eq!(detector.state("k").map(|s| s.count()), Some(21));
    }

    #[test]
    fn test_remove_restarts_stream() {
        let mut detector = AnomalyDetector::new(2);
        detector.update("k", 1.0);
        detector.update("k", 2.0);
        assert!(detector.remove("k").is_some());
        assert!(detector.state("k").is_none());

        let result = detector.update("k", 50.0);
        assert_eq!(result.mean, 50.0);
        assert_eq!(detector.len(), 1);

        detector.reset();
        assert!(detector.is_empty());
    }

    #[test]
    fn test_stream_count_is_bounded() {
        let mut detector = AnomalyDetector::with_config(DetectorConfig {
            min_samples: 10,
            max_streams: 2,
        });
        detector.update("a", 1.0);
        detector.update("b", 1.0);
        detector.update("c", 1.0);
        assert_eq!(detector.len(), 2);
        assert!(detector.state("a").is_none());
        assert_eq!(detector.evictions(), 1);
    }

    #[test]
    fn test_non_finite_values_leave_stream_untouched() {
        let mut detector = AnomalyDetector::new(10);
        for i in 0..50 {
            detector.update("k", 100.0 + (i % 2) as f64);
        }
        let before = detector.state("k");

        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let result = detector.update("k", bad);
            assert!(!result.is_anomaly);
            assert_eq!(result.severity, Severity::None);
            assert_eq!(result.z_score, 0.0);
        }
        assert_eq!(detector.state("k"), before);
        assert!(detector.state("k").is_some_and(|s| s.m2() >= 0.0));

        let spike = detector.update("k", 1e6);
        assert!(spike.z_score.is_finite());
        assert_eq!(spike.severity, Severity::Critical);
    }

    #[test]
    fn test_non_finite_value_does_not_create_stream() {
        let mut detector = AnomalyDetector::new(10);
        let result = detector.update("fresh", f64::NAN);
        assert_eq!(result.mean, 0.0);
        assert!(detector.is_empty());
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"critical\"");
        assert_eq!(Severity::Medium.as_str(), "medium");
    }

    #[tokio::test]
    async fn test_handle_serializes_concurrent_updates() {
        let handle = DetectorHandle::spawn(AnomalyDetector::new(10), 64);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    handle.update(format!("series:{}", i % 2), 5.0).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let result = handle.update("series:0", 5.0).await.unwrap();
        assert_eq!(result.mean, 5.0);
        assert!(!result.is_anomaly);

        let removed = handle.remove("series:1").await.unwrap();
        assert_eq!(removed.count(), 100);
        assert_eq!(handle.remove("series:1").await, None);
    }
}
