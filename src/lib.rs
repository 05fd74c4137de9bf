//! Economic time-series ingestion and scoring.
//!
//! - [`pipeline`] fetches tracked series on a [`scheduler`], stores the latest
//!   value in a [`store`] and caches the full series in a two-tier [`cache`].
//! - [`detector`] scores values against per-key streaming baselines.
//! - [`risk`] folds regional signals into a bounded composite score.

pub mod algo;
pub mod cache;
pub mod config;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod risk;
pub mod scheduler;
pub mod source;
pub mod store;

pub use cache::{KvStore, MemoryStore, RedisStore, StaleCache};
pub use config::{SeriesConfig, Settings};
pub use detector::{AnomalyDetector, AnomalyResult, DetectorHandle, Severity};
pub use error::{CacheError, FetchError, PipelineError, StoreError};
pub use models::{MetricPoint, Observation, RegionRiskInput, RiskScore, Series};
pub use pipeline::{FetchPipeline, RunReport};
pub use risk::RiskFactor;
pub use scheduler::Scheduler;
pub use source::{FredClient, ObservationSource};
pub use store::{InfluxStore, TimeSeriesStore};
