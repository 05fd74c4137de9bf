//! Upstream Series Source
//!
//! [`ObservationSource`] is the seam the fetch pipeline depends on;
//! [`FredClient`] implements it against the FRED REST API.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::config::DEFAULT_FRED_BASE_URL;
use crate::error::FetchError;
use crate::models::{Observation, Series};

/// Raw value FRED uses for "no observation on this date".
pub const MISSING_SENTINEL: &str = ".";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Provider of dated observation series.
#[async_trait]
pub trait ObservationSource: Send + Sync {
    /// Fetch one series. Missing or unparseable observations are dropped,
    /// never surfaced as placeholders.
    async fn get_observations(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Series, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FredConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl Default for FredConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_FRED_BASE_URL.to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Series metadata as returned by `GET /series`.
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesInfo {
    pub id: String,
    pub title: String,
    pub units: String,
    pub frequency: String,
}

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    #[serde(default)]
    seriess: Vec<SeriesInfo>,
}

#[derive(Debug, Deserialize)]
struct RawObservation {
    date: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ObservationsResponse {
    #[serde(default)]
    observations: Vec<RawObservation>,
}

pub struct FredClient {
    client: reqwest::Client,
    config: FredConfig,
}

impl FredClient {
    pub fn new(config: FredConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let response = self
            .client
            .get(&url)
            .query(&[("api_key", self.config.api_key.as_str()), ("file_type", "json")])
            .query(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    pub async fn get_series_info(&self, series_id: &str) -> Result<SeriesInfo, FetchError> {
        let response: SeriesResponse = self
            .get_json("series", &[("series_id", series_id.to_string())])
            .await?;
        response
            .seriess
            .into_iter()
            .next()
            .ok_or(FetchError::MissingField("seriess"))
    }
}

#[async_trait]
impl ObservationSource for FredClient {
    async fn get_observations(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Series, FetchError> {
        let info = self.get_series_info(series_id).await?;

        let mut params = vec![("series_id", series_id.to_string())];
        if let Some(start) = start {
            params.push(("observation_start", start.format(DATE_FORMAT).to_string()));
        }
        if let Some(end) = end {
            params.push(("observation_end", end.format(DATE_FORMAT).to_string()));
        }

        let response: ObservationsResponse = self.get_json("series/observations", &params).await?;
        let total = response.observations.len();
        let data = translate_observations(response.observations);
        debug!(series_id, total, kept = data.len(), "translated observations");

        Ok(Series {
            id: info.id,
            title: info.title,
            units: info.units,
            frequency: info.frequency,
            data,
        })
    }
}

/// Keep only observations with a parseable date and a real numeric value.
fn translate_observations(raw: Vec<RawObservation>) -> Vec<Observation> {
    raw.into_iter()
        .filter(|obs| obs.value != MISSING_SENTINEL)
        .filter_map(|obs| {
            let date = NaiveDate::parse_from_str(&obs.date, DATE_FORMAT).ok()?;
            let value = obs.value.trim().parse::<f64>().ok()?;
            Some(Observation::new(date, value))
        })
        .collect()
}
