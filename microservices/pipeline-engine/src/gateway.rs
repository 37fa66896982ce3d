//! Ingestion Gateway
//!
//! Validates and normalizes externally-submitted observations and
//! writes them into the warehouse. Used by both the API boundary and
//! the ETL load phase. The gateway never retries; retry policy belongs
//! to its callers.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use datalith_core::{IngestReason, IngestRequest, IngestResult, PipelineError, Result};
use datalith_warehouse::{UpsertOutcome, WarehouseStore};
use regex::Regex;
use tracing::{debug, warn};

use crate::config::PipelineConfig;

pub struct IngestionGateway {
    store: Arc<dyn WarehouseStore>,
    metric_name: Regex,
    clock_skew_tolerance: ChronoDuration,
}

impl IngestionGateway {
    pub fn new(store: Arc<dyn WarehouseStore>, config: &PipelineConfig) -> Result<Self> {
        let metric_name = Regex::new(&config.metric_name_pattern).map_err(|e| {
            PipelineError::Config(format!("Invalid METRIC_NAME_PATTERN: {}", e))
        })?;
        let clock_skew_tolerance = ChronoDuration::from_std(config.clock_skew_tolerance)
            .map_err(|e| PipelineError::Config(format!("Invalid clock skew tolerance: {}", e)))?;
        Ok(Self {
            store,
            metric_name,
            clock_skew_tolerance,
        })
    }

    /// Validate and persist one observation.
    ///
    /// Validation failures come back as `accepted = false` with a typed
    /// reason. A duplicate key with an identical value is an idempotent
    /// replay; a differing value is overwritten (last write wins) and
    /// recorded as a conflict event. Only store I/O surfaces as an
    /// error.
    pub async fn ingest(&self, request: &IngestRequest) -> Result<IngestResult> {
        if let Err(reason) = self.validate(request) {
            debug!(
                source = %request.source,
                metric = %request.metric,
                provenance = ?request.provenance,
                reason = ?reason,
                "Rejected observation"
            );
            return Ok(IngestResult::rejected(reason));
        }

        let observation = request.observation();
        let outcome = self
            .store
            .upsert(&observation)
            .await
            .map_err(|e| PipelineError::Store(e.to_string()))?;

        match outcome {
            UpsertOutcome::Inserted | UpsertOutcome::Unchanged => Ok(IngestResult::accepted()),
            UpsertOutcome::Overwritten { previous } => {
                warn!(
                    source = %observation.source,
                    metric = %observation.metric,
                    timestamp = %observation.timestamp,
                    previous = previous,
                    value = observation.value,
                    "Conflict: duplicate key with differing value overwritten"
                );
                Ok(IngestResult::overwritten())
            }
        }
    }

    fn validate(&self, request: &IngestRequest) -> std::result::Result<(), IngestReason> {
        if !request.value.is_finite() {
            return Err(IngestReason::InvalidValue);
        }
        if !self.metric_name.is_match(&request.metric) {
            return Err(IngestReason::InvalidMetricName);
        }
        if request.timestamp > Utc::now() + self.clock_skew_tolerance {
            return Err(IngestReason::FutureTimestamp);
        }
        Ok(())
    }
}
