//! Pipeline Engine Configuration

use std::env;
use std::time::Duration;

use datalith_core::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub http_bind: String,
    pub upstream_base_url: String,

    // ETL
    pub max_fetch_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub fetch_timeout: Duration,
    pub max_load_failure_ratio: f64,
    pub etl_sources: Vec<String>,
    pub etl_interval_secs: u64,

    // Aggregation
    pub max_concurrent_aggregations: usize,
    pub aggregation_queue_cap: usize,
    pub aggregation_timeout: Duration,
    pub report_staleness: Duration,
    pub anomaly_zscore_threshold: f64,

    // Ingestion
    pub clock_skew_tolerance: Duration,
    pub metric_name_pattern: String,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            http_bind: env::var("HTTP_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            upstream_base_url: env::var("UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| "https://api.coindesk.com/v1".to_string()),
            max_fetch_retries: parse_var("MAX_FETCH_RETRIES", 5)?,
            backoff_base: Duration::from_millis(parse_var("BACKOFF_BASE_MS", 500)?),
            backoff_cap: Duration::from_millis(parse_var("BACKOFF_CAP_MS", 30_000)?),
            fetch_timeout: Duration::from_secs(parse_var("FETCH_TIMEOUT_SECS", 10)?),
            max_load_failure_ratio: parse_var("MAX_LOAD_FAILURE_RATIO", 1.0)?,
            etl_sources: env::var("ETL_SOURCES")
                .map(|csv| {
                    csv.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            etl_interval_secs: parse_var("ETL_INTERVAL_SECS", 0)?,
            max_concurrent_aggregations: parse_var("MAX_CONCURRENT_AGGREGATIONS", 8)?,
            aggregation_queue_cap: parse_var("AGGREGATION_QUEUE_CAP", 64)?,
            aggregation_timeout: Duration::from_secs(parse_var("AGGREGATION_TIMEOUT_SECS", 30)?),
            report_staleness: Duration::from_secs(parse_var("REPORT_STALENESS_SECONDS", 300)?),
            anomaly_zscore_threshold: parse_var("ANOMALY_ZSCORE_THRESHOLD", 3.0)?,
            clock_skew_tolerance: Duration::from_secs(parse_var(
                "CLOCK_SKEW_TOLERANCE_SECONDS",
                60,
            )?),
            metric_name_pattern: env::var("METRIC_NAME_PATTERN")
                .unwrap_or_else(|_| r"^[a-z][a-z0-9_]{0,127}$".to_string()),
        })
    }
}

impl Default for PipelineConfig {
    /// Defaults without consulting the environment; used by tests.
    fn default() -> Self {
        Self {
            http_bind: "0.0.0.0:8080".to_string(),
            upstream_base_url: "https://api.coindesk.com/v1".to_string(),
            max_fetch_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
            max_load_failure_ratio: 1.0,
            etl_sources: Vec::new(),
            etl_interval_secs: 0,
            max_concurrent_aggregations: 8,
            aggregation_queue_cap: 64,
            aggregation_timeout: Duration::from_secs(30),
            report_staleness: Duration::from_secs(300),
            anomaly_zscore_threshold: 3.0,
            clock_skew_tolerance: Duration::from_secs(60),
            metric_name_pattern: r"^[a-z][a-z0-9_]{0,127}$".to_string(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| PipelineError::Config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}
