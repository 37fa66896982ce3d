//! Upstream Fetcher
//!
//! One network round trip per call, one finite batch of raw records
//! back. No retries here — the ETL orchestrator owns retry policy.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datalith_core::{PipelineError, RawRecord, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

/// Retrieves raw metric observations from an upstream data source.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Observations for `source` newer than `since`. Finite; not
    /// restartable.
    async fn fetch(&self, source: &str, since: DateTime<Utc>) -> Result<Vec<RawRecord>>;
}

/// Upstream response envelope.
#[derive(Debug, Deserialize)]
struct ObservationBatch {
    observations: Vec<RawRecord>,
}

/// HTTP implementation against the upstream metrics API.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn retry_after(response: &reqwest::Response) -> Option<Duration> {
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)?
            .to_str()
            .ok()?
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, source: &str, since: DateTime<Utc>) -> Result<Vec<RawRecord>> {
        let url = format!("{}/sources/{}/observations", self.base_url, source);
        debug!(source = %source, since = %since, "Fetching upstream batch");

        let response = self
            .client
            .get(&url)
            .query(&[("since", since.to_rfc3339())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Timeout(format!("fetch {}: {}", source, e))
                } else {
                    PipelineError::Network(format!("fetch {}: {}", source, e))
                }
            })?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = Self::retry_after(&response);
            return Err(PipelineError::RateLimited {
                message: format!("upstream throttled {}", source),
                retry_after,
            });
        }
        if !response.status().is_success() {
            return Err(PipelineError::Network(format!(
                "fetch {}: upstream returned {}",
                source,
                response.status()
            )));
        }

        let batch: ObservationBatch = response
            .json()
            .await
            .map_err(|e| PipelineError::UpstreamFormat(format!("fetch {}: {}", source, e)))?;
        debug!(source = %source, records = batch.observations.len(), "Fetched batch");
        Ok(batch.observations)
    }
}
