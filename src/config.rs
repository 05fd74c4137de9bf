//! Runtime settings for the ingestion service.

use std::time::Duration;

pub const DEFAULT_FRED_BASE_URL: &str = "https://api.stlouisfed.org/fred";
pub const DEFAULT_SERIES: [&str; 4] = ["GDP", "CPIAUCSL", "UNRATE", "FEDFUNDS"];

/// Connection and tuning settings. Every field has a usable default so the
/// service starts against local infrastructure without extra flags.
#[derive(Debug, Clone)]
pub struct Settings {
    pub fred_base_url: String,
    pub fred_api_key: String,
    pub influx_url: String,
    pub influx_token: String,
    pub influx_org: String,
    pub influx_bucket: String,
    pub redis_url: String,
    pub fetch_interval: Duration,
    pub request_timeout: Duration,
    /// Shortest samples count before the detector classifies anything
    pub min_samples: u64,
    /// Upper bound on tracked detector streams
    pub max_streams: usize,
    /// How long `serve` waits for in-flight runs on shutdown
    pub shutdown_grace: Duration,
    pub listen_addr: String,
    pub series: SeriesConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fred_base_url: DEFAULT_FRED_BASE_URL.to_string(),
            fred_api_key: String::new(),
            influx_url: "http://localhost:8086".to_string(),
            influx_token: String::new(),
            influx_org: "globalpulsepro".to_string(),
            influx_bucket: "trade_data".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            fetch_interval: Duration::from_secs(15 * 60),
            request_timeout: Duration::from_secs(10),
            min_samples: 10,
            max_streams: 100_000,
            shutdown_grace: Duration::from_secs(5),
            listen_addr: "0.0.0.0:8000".to_string(),
            series: SeriesConfig::default(),
        }
    }
}

/// What the fetch pipeline tracks and where it puts results.
#[derive(Debug, Clone)]
pub struct SeriesConfig {
    pub series_ids: Vec<String>,
    /// Prefix of the primary cache key, `"<domain>:<series_id>"`
    pub cache_domain: String,
    pub measurement: String,
    pub cache_ttl: Duration,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            series_ids: DEFAULT_SERIES.iter().map(|s| s.to_string()).collect(),
            cache_domain: "fred".to_string(),
            measurement: "fred".to_string(),
            cache_ttl: Duration::from_secs(900),
        }
    }
}

impl SeriesConfig {
    pub fn cache_key(&self, series_id: &str) -> String {
        format!("{}:{}", self.cache_domain, series_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.fetch_interval, Duration::from_secs(900));
        assert_eq!(settings.min_samples, 10);
        assert_eq!(settings.series.series_ids.len(), 4);
        assert_eq!(settings.series.cache_ttl, Duration::from_secs(900));
    }

    #[test]
    fn test_cache_key_format() {
        let series = SeriesConfig::default();
        assert_eq!(series.cache_key("UNRATE"), "fred:UNRATE");
    }
}
