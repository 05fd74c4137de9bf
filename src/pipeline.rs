//! Periodic Fetch Pipeline
//!
//! For each tracked series, independently: fetch the full series, write the
//! latest value to the time-series store, and cache the whole series. A
//! failure in any step is logged and counted for that series only; the rest
//! of the batch still runs. There is no retry inside a run, the next
//! scheduled run is the retry.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::cache::StaleCache;
use crate::config::SeriesConfig;
use crate::error::PipelineError;
use crate::metrics;
use crate::models::FieldValue;
use crate::source::ObservationSource;
use crate::store::TimeSeriesStore;

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Series that completed, with their observation counts
    pub succeeded: Vec<(String, usize)>,
    /// Series that failed, with the error text
    pub failed: Vec<(String, String)>,
}

impl RunReport {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

#[derive(Clone)]
pub struct FetchPipeline {
    source: Arc<dyn ObservationSource>,
    store: Arc<dyn TimeSeriesStore>,
    cache: StaleCache,
    config: SeriesConfig,
}

impl FetchPipeline {
    pub fn new(
        source: Arc<dyn ObservationSource>,
        store: Arc<dyn TimeSeriesStore>,
        cache: StaleCache,
        config: SeriesConfig,
    ) -> Self {
        Self {
            source,
            store,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &SeriesConfig {
        &self.config
    }

    /// Process every tracked series once, sequentially.
    pub async fn run(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("fetch_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> RunReport {
        let timer = metrics::FETCH_DURATION.start_timer();
        let mut report = RunReport {
            run_id,
            ..Default::default()
        };

        for series_id in &self.config.series_ids {
            match self.process_series(series_id).await {
                Ok(points) => {
                    metrics::FETCH_SUCCESS.inc();
                    info!(series_id = %series_id, points, "series fetched");
                    report.succeeded.push((series_id.clone(), points));
                }
                Err(e) => {
                    metrics::FETCH_FAILURE.inc();
                    error!(series_id = %series_id, error = %e, "series fetch failed");
                    report.failed.push((series_id.clone(), e.to_string()));
                }
            }
        }

        timer.observe_duration();
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "fetch run complete"
        );
        report
    }

    /// Fetch, store the latest value, cache the full series. Returns the
    /// number of observations fetched.
    pub async fn process_series(&self, series_id: &str) -> Result<usize, PipelineError> {
        let series = self.source.get_observations(series_id, None, None).await?;

        if let Some(latest) = series.latest().and_then(|obs| obs.value) {
            let tags = BTreeMap::from([("series_id".to_string(), series_id.to_string())]);
            let fields = BTreeMap::from([("value".to_string(), FieldValue::from(latest))]);
            self.store
                .write_metric(&self.config.measurement, &tags, &fields, None)
                .await?;
        }

        // Empty series are cached too, so readers see "no data" rather than a miss
        self.cache
            .set(&self.config.cache_key(series_id), &series, self.config.cache_ttl)
            .await?;

        Ok(series.data.len())
    }
}
