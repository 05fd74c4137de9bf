//! pulse - economic indicator ingestion and scoring
//!
//! Usage:
//!   pulse serve --listen 0.0.0.0:8000
//!   pulse fetch --memory-cache
//!   echo '{"region_code":"US","cpi_change":3.1,...}' | pulse risk
//!   printf 'fred:UNRATE 3.7\nfred:UNRATE 3.8\n' | pulse score

use anyhow::Context;
use axum::{Json, Router, routing::get};
use clap::{Args, Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pulse_core::{
    AnomalyDetector, FetchPipeline, FredClient, InfluxStore, KvStore, MemoryStore,
    RegionRiskInput, RedisStore, Scheduler, SeriesConfig, Settings, StaleCache,
    config::DEFAULT_FRED_BASE_URL,
    detector::DetectorConfig,
    metrics, risk,
    source::FredConfig,
    store::InfluxConfig,
};

const FETCH_JOB_ID: &str = "fred_fetcher";

#[derive(Parser)]
#[command(name = "pulse", version)]
#[command(about = "Scheduled economic indicator ingestion with anomaly and risk scoring")]
struct Cli {
    #[command(flatten)]
    conn: ConnArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ConnArgs {
    /// FRED API key
    #[arg(long, env = "FRED_API_KEY", default_value = "", hide_env_values = true)]
    fred_api_key: String,

    #[arg(long, env = "FRED_BASE_URL", default_value = DEFAULT_FRED_BASE_URL)]
    fred_base_url: String,

    #[arg(long, env = "INFLUXDB_URL", default_value = "http://localhost:8086")]
    influx_url: String,

    #[arg(long, env = "INFLUXDB_TOKEN", default_value = "", hide_env_values = true)]
    influx_token: String,

    #[arg(long, env = "INFLUXDB_ORG", default_value = "globalpulsepro")]
    influx_org: String,

    #[arg(long, env = "INFLUXDB_BUCKET", default_value = "trade_data")]
    influx_bucket: String,

    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Series to track (comma-separated)
    #[arg(long, env = "PULSE_SERIES", value_delimiter = ',', default_value = "GDP,CPIAUCSL,UNRATE,FEDFUNDS")]
    series: Vec<String>,

    /// Seconds between scheduled fetch runs
    #[arg(long, env = "PULSE_FETCH_INTERVAL_SECS", default_value_t = 15 * 60)]
    fetch_interval_secs: u64,

    /// Per-request timeout for upstream and store calls
    #[arg(long, default_value_t = 10)]
    request_timeout_secs: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduled fetcher and expose /health and /metrics
    Serve {
        #[arg(long, env = "PULSE_LISTEN", default_value = "0.0.0.0:8000")]
        listen: String,

        /// Seconds to wait for an in-flight fetch run on shutdown
        #[arg(long, default_value_t = 5)]
        shutdown_grace_secs: u64,
    },

    /// Run the fetch pipeline once
    Fetch {
        /// Cache in process memory instead of Redis
        #[arg(long)]
        memory_cache: bool,
    },

    /// Score a region: RegionRiskInput JSON on stdin, RiskScore JSON on stdout
    Risk,

    /// Score `<key> <value>` lines from stdin, one AnomalyResult JSON per line
    Score {
        /// Samples required before a value can be flagged [default: 10]
        #[arg(long)]
        min_samples: Option<u64>,

        /// Maximum tracked keys [default: 100000]
        #[arg(long)]
        max_streams: Option<usize>,
    },
}

impl ConnArgs {
    fn settings(&self) -> Settings {
        let defaults = Settings::default();
        Settings {
            fred_base_url: self.fred_base_url.clone(),
            fred_api_key: self.fred_api_key.clone(),
            influx_url: self.influx_url.clone(),
            influx_token: self.influx_token.clone(),
            influx_org: self.influx_org.clone(),
            influx_bucket: self.influx_bucket.clone(),
            redis_url: self.redis_url.clone(),
            fetch_interval: Duration::from_secs(self.fetch_interval_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            series: SeriesConfig {
                series_ids: self.series.clone(),
                ..defaults.series.clone()
            },
            ..defaults
        }
    }
}

fn build_pipeline(settings: &Settings, kv: Arc<dyn KvStore>) -> anyhow::Result<FetchPipeline> {
    let source = FredClient::new(FredConfig {
        base_url: settings.fred_base_url.clone(),
        api_key: settings.fred_api_key.clone(),
        timeout: settings.request_timeout,
    })
    .context("building FRED client")?;

    let store = InfluxStore::new(InfluxConfig {
        url: settings.influx_url.clone(),
        token: settings.influx_token.clone(),
        org: settings.influx_org.clone(),
        bucket: settings.influx_bucket.clone(),
        timeout: settings.request_timeout,
    })
    .context("building InfluxDB client")?;

    Ok(FetchPipeline::new(
        Arc::new(source),
        Arc::new(store),
        StaleCache::new(kv),
        settings.series.clone(),
    ))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler() -> String {
    metrics::render()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

async fn serve(mut settings: Settings, listen: String, grace: Duration) -> anyhow::Result<()> {
    settings.listen_addr = listen;
    settings.shutdown_grace = grace;

    let kv = RedisStore::connect(&settings.redis_url)
        .await
        .with_context(|| format!("connecting to Redis at {}", settings.redis_url))?;
    let pipeline = build_pipeline(&settings, Arc::new(kv))?;

    let mut scheduler = Scheduler::new();
    let job = pipeline.clone();
    scheduler.register(FETCH_JOB_ID, settings.fetch_interval, move || {
        let pipeline = job.clone();
        async move {
            pipeline.run().await;
        }
    });
    scheduler.start();
    info!(
        interval_secs = settings.fetch_interval.as_secs(),
        series = ?settings.series.series_ids,
        "fetch job scheduled"
    );

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));

    let listener = TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("binding {}", settings.listen_addr))?;
    info!(addr = %settings.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if scheduler.shutdown(settings.shutdown_grace).await {
        info!("scheduler drained. Goodbye.");
    } else {
        warn!("exiting with fetch runs still in flight");
    }
    Ok(())
}

async fn fetch_once(settings: Settings, memory_cache: bool) -> anyhow::Result<()> {
    let kv: Arc<dyn KvStore> = if memory_cache {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            RedisStore::connect(&settings.redis_url)
                .await
                .with_context(|| format!("connecting to Redis at {}", settings.redis_url))?,
        )
    };
    let report = build_pipeline(&settings, kv)?.run().await;

    for (series_id, points) in &report.succeeded {
        println!("{series_id}\tok\t{points} points");
    }
    for (series_id, error) in &report.failed {
        println!("{series_id}\tfailed\t{error}");
    }
    Ok(())
}

fn score_risk() -> anyhow::Result<()> {
    let input: RegionRiskInput =
        serde_json::from_reader(io::stdin()).context("reading RegionRiskInput from stdin")?;
    serde_json::to_writer(io::stdout(), &risk::calculate(&input))?;
    println!();
    Ok(())
}

/// Split a `<key> <value>` line. Blank lines yield `None`; malformed lines
/// and non-finite values are errors.
fn parse_score_line(line: &str) -> Result<Option<(&str, f64)>, &'static str> {
    let mut parts = line.split_whitespace();
    let Some(key) = parts.next() else {
        return Ok(None);
    };
    let raw = parts.next().ok_or("expected `<key> <value>`")?;
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some((key, value))),
        Ok(_) => Err("value is not finite"),
        Err(_) => Err("value is not a number"),
    }
}

fn score_stream(config: DetectorConfig) -> anyhow::Result<()> {
    let mut detector = AnomalyDetector::with_config(config);
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for (line_no, line) in io::stdin().lock().lines().enumerate() {
        let line = line?;
        let (key, value) = match parse_score_line(&line) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(reason) => {
                warn!(line = line_no + 1, reason, "skipping input line");
                continue;
            }
        };

        let result = detector.update(key, value);
        serde_json::to_writer(&mut out, &result)?;
        writeln!(out)?;
    }

    info!(
        streams = detector.len(),
        evictions = detector.evictions(),
        "input exhausted"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
    metrics::init();

    let cli = Cli::parse();
    let settings = cli.conn.settings();

    match cli.command {
        Commands::Serve {
            listen,
            shutdown_grace_secs,
        } => serve(settings, listen, Duration::from_secs(shutdown_grace_secs)).await,
        Commands::Fetch { memory_cache } => fetch_once(settings, memory_cache).await,
        Commands::Risk => score_risk(),
        Commands::Score {
            min_samples,
            max_streams,
        } => score_stream(DetectorConfig {
            min_samples: min_samples.unwrap_or(settings.min_samples),
            max_streams: max_streams.unwrap_or(settings.max_streams),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_score_line() {
        assert_eq!(parse_score_line("fred:UNRATE 3.7"), Ok(Some(("fred:UNRATE", 3.7))));
        assert_eq!(parse_score_line("  k\t-2e3  "), Ok(Some(("k", -2000.0))));
        assert_eq!(parse_score_line("   "), Ok(None));
        assert!(parse_score_line("lonely").is_err());
        assert!(parse_score_line("k abc").is_err());
    }

    #[test]
    fn test_parse_score_line_rejects_non_finite() {
        for raw in ["NaN", "nan", "inf", "-inf", "infinity", "1e999"] {
            assert_eq!(
                parse_score_line(&format!("k {raw}")),
                Err("value is not finite"),
                "raw = {raw}"
            );
        }
    }
}
