//! ETL Orchestrator
//!
//! Sequences fetch -> transform -> load for one upstream source pull,
//! with retry/backoff on transient fetch failures and run-level status
//! tracking. At most one active run per source; overlapping triggers
//! are rejected, not queued.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use datalith_core::{
    EtlRun, EtlStatus, IngestRequest, Observation, PipelineError, Provenance, RawRecord, Result,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::fetcher::Fetcher;
use crate::gateway::IngestionGateway;

/// Exponential backoff delay for the given 1-based attempt number.
///
/// `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// Transform one raw upstream record into an observation.
///
/// Returns `None` for records whose shape is unusable; the caller drops
/// and counts them individually instead of failing the run.
pub fn transform_record(source: &str, raw: &RawRecord) -> Option<Observation> {
    if raw.metric.is_empty() {
        return None;
    }
    let value = raw.value.as_f64().filter(|v| v.is_finite())?;
    Some(Observation {
        source: source.to_string(),
        metric: raw.metric.clone(),
        timestamp: raw.timestamp,
        value,
    })
}

pub struct EtlOrchestrator {
    fetcher: Arc<dyn Fetcher>,
    gateway: Arc<IngestionGateway>,
    config: PipelineConfig,
    runs: DashMap<Uuid, EtlRun>,
    active: DashMap<String, Uuid>,
    watermarks: DashMap<String, DateTime<Utc>>,
}

impl EtlOrchestrator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        gateway: Arc<IngestionGateway>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            fetcher,
            gateway,
            config,
            runs: DashMap::new(),
            active: DashMap::new(),
            watermarks: DashMap::new(),
        }
    }

    /// Accept a trigger and run the cycle in the background.
    pub fn trigger(self: &Arc<Self>, source: &str) -> Result<Uuid> {
        let run_id = self.admit(source)?;
        let orchestrator = self.clone();
        let source = source.to_string();
        tokio::spawn(async move {
            orchestrator.execute(run_id, &source).await;
        });
        Ok(run_id)
    }

    /// Accept a trigger and await the full cycle.
    pub async fn run_to_completion(&self, source: &str) -> Result<Uuid> {
        let run_id = self.admit(source)?;
        self.execute(run_id, source).await;
        Ok(run_id)
    }

    pub fn run(&self, id: Uuid) -> Option<EtlRun> {
        self.runs.get(&id).map(|r| r.clone())
    }

    pub fn runs(&self) -> Vec<EtlRun> {
        self.runs.iter().map(|r| r.clone()).collect()
    }

    /// Create a Pending run if no run is active for the source.
    fn admit(&self, source: &str) -> Result<Uuid> {
        use dashmap::mapref::entry::Entry;

        let run = EtlRun::new(source);
        let run_id = run.id;
        match self.active.entry(source.to_string()) {
            Entry::Occupied(_) => {
                return Err(PipelineError::AlreadyRunning(source.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(run_id);
            }
        }
        self.runs.insert(run_id, run);
        Ok(run_id)
    }

    async fn execute(&self, run_id: Uuid, source: &str) {
        self.update_run(run_id, |run| run.status = EtlStatus::Running);
        info!(source = %source, run_id = %run_id, "ETL run started");

        let since = self
            .watermarks
            .get(source)
            .map(|w| *w)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let records = match self.fetch_with_retry(run_id, source, since).await {
            Ok(records) => records,
            Err(e) => {
                self.finish(run_id, source, EtlStatus::Failed, Some(e.to_string()));
                return;
            }
        };

        let outcome = self.load(run_id, source, records).await;
        match outcome {
            Ok(()) => self.finish(run_id, source, EtlStatus::Succeeded, None),
            Err(e) => self.finish(run_id, source, EtlStatus::Failed, Some(e.to_string())),
        }
    }

    /// Fetch one batch, retrying transient failures with backoff.
    ///
    /// Permanent failures (schema errors are not transient) fail
    /// immediately. Every attempt, including one that times out,
    /// increments the run's attempt count.
    async fn fetch_with_retry(
        &self,
        run_id: Uuid,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.update_run(run_id, |run| run.attempt_count = attempt);

            let result = match tokio::time::timeout(
                self.config.fetch_timeout,
                self.fetcher.fetch(source, since),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout(format!(
                    "fetch {} exceeded {:?}",
                    source, self.config.fetch_timeout
                ))),
            };

            let error = match result {
                Ok(records) => return Ok(records),
                Err(e) => e,
            };
            self.update_run(run_id, |run| run.last_error = Some(error.to_string()));

            if !error.is_transient() || attempt >= self.config.max_fetch_retries {
                return Err(error);
            }

            let mut delay = backoff_delay(attempt, self.config.backoff_base, self.config.backoff_cap);
            if let Some(retry_after) = error.retry_after() {
                delay = delay.max(retry_after);
            }
            warn!(
                source = %source,
                run_id = %run_id,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Fetch failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Transform and ingest one batch, counting drops per record.
    async fn load(&self, run_id: Uuid, source: &str, records: Vec<RawRecord>) -> Result<()> {
        let mut loaded = 0u64;
        let mut rejected = 0u64;
        let mut malformed = 0u64;
        let mut newest: Option<DateTime<Utc>> = None;

        for raw in &records {
            let observation = match transform_record(source, raw) {
                Some(observation) => observation,
                None => {
                    malformed += 1;
                    debug!(source = %source, run_id = %run_id, record = ?raw, "Dropped malformed record");
                    continue;
                }
            };
            let request = IngestRequest {
                source: observation.source.clone(),
                metric: observation.metric.clone(),
                value: observation.value,
                timestamp: observation.timestamp,
                provenance: Provenance::Etl,
            };
            match self.gateway.ingest(&request).await {
                Ok(result) if result.accepted => {
                    loaded += 1;
                    newest = Some(newest.map_or(observation.timestamp, |n| n.max(observation.timestamp)));
                }
                Ok(result) => {
                    rejected += 1;
                    debug!(source = %source, run_id = %run_id, reason = ?result.reason, "Observation rejected");
                }
                Err(e) => {
                    rejected += 1;
                    warn!(source = %source, run_id = %run_id, error = %e, "Observation load failed");
                    self.update_run(run_id, |run| run.last_error = Some(e.to_string()));
                }
            }
        }

        self.update_run(run_id, |run| {
            run.records_loaded = loaded;
            run.records_rejected = rejected;
            run.records_malformed = malformed;
        });

        let attempted = loaded + rejected;
        if attempted > 0 {
            let failure_ratio = rejected as f64 / attempted as f64;
            if failure_ratio >= self.config.max_load_failure_ratio {
                return Err(PipelineError::LoadFailed(format!(
                    "rejected {}/{} records",
                    rejected, attempted
                )));
            }
        }

        if let Some(newest) = newest {
            self.watermarks.insert(source.to_string(), newest);
        }
        Ok(())
    }

    fn finish(&self, run_id: Uuid, source: &str, status: EtlStatus, error: Option<String>) {
        self.active.remove(source);
        self.update_run(run_id, |run| {
            run.status = status;
            run.finished_at = Some(Utc::now());
            if error.is_some() {
                run.last_error = error;
            }
        });
        let run = self.run(run_id);
        match status {
            EtlStatus::Succeeded => info!(
                source = %source,
                run_id = %run_id,
                attempts = run.as_ref().map_or(0, |r| r.attempt_count),
                loaded = run.as_ref().map_or(0, |r| r.records_loaded),
                rejected = run.as_ref().map_or(0, |r| r.records_rejected),
                malformed = run.as_ref().map_or(0, |r| r.records_malformed),
                "ETL run succeeded"
            ),
            _ => warn!(
                source = %source,
                run_id = %run_id,
                attempts = run.as_ref().map_or(0, |r| r.attempt_count),
                error = run.as_ref().and_then(|r| r.last_error.clone()).unwrap_or_default(),
                "ETL run failed"
            ),
        }
    }

    fn update_run(&self, run_id: Uuid, mutate: impl FnOnce(&mut EtlRun)) {
        if let Some(mut run) = self.runs.get_mut(&run_id) {
            mutate(&mut run);
        }
    }
}
