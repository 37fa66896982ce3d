//! Core domain types for the metrics pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One timestamped numeric metric reading.
///
/// Immutable once written. Uniquely identified by
/// `(source, metric, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub source: String,
    pub metric: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Where an ingest request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Api,
    Etl,
}

/// A candidate observation submitted for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub source: String,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub provenance: Provenance,
}

impl IngestRequest {
    pub fn observation(&self) -> Observation {
        Observation {
            source: self.source.clone(),
            metric: self.metric.clone(),
            timestamp: self.timestamp,
            value: self.value,
        }
    }
}

/// Why an ingest request was rejected, or accepted with a caveat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestReason {
    /// Duplicate key with a differing value; last write won.
    Overwritten,
    InvalidValue,
    FutureTimestamp,
    InvalidMetricName,
}

/// Outcome of one ingest request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    pub accepted: bool,
    pub reason: Option<IngestReason>,
}

impl IngestResult {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn overwritten() -> Self {
        Self {
            accepted: true,
            reason: Some(IngestReason::Overwritten),
        }
    }

    pub fn rejected(reason: IngestReason) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
        }
    }
}

/// ETL run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EtlStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl EtlStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One fetch-transform-load cycle for one upstream source pull.
///
/// Created and mutated only by the ETL orchestrator; terminal once
/// Succeeded or Failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlRun {
    pub id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub status: EtlStatus,
    pub last_error: Option<String>,
    pub records_loaded: u64,
    pub records_rejected: u64,
    pub records_malformed: u64,
}

impl EtlRun {
    pub fn new(source: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            attempt_count: 0,
            status: EtlStatus::Pending,
            last_error: None,
            records_loaded: 0,
            records_rejected: 0,
            records_malformed: 0,
        }
    }
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Identifies one unit of aggregation work.
///
/// Two requests with equal keys refer to the same computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationKey {
    pub metric: String,
    pub window: TimeRange,
}

/// One observation flagged as anomalous, with its z-score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub score: f64,
}

/// Aggregated summary of one observation window.
///
/// Immutable once produced; a newer Report for the same key supersedes
/// it, never mutates it. An empty window has `count == 0` and all
/// statistics absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub key: AggregationKey,
    pub count: u64,
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub anomalies: Vec<Anomaly>,
    pub computed_at: DateTime<Utc>,
}

/// Report request as submitted by API or dashboard consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub metric: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default)]
    pub force_refresh: bool,
}

impl ReportRequest {
    pub fn key(&self) -> AggregationKey {
        AggregationKey {
            metric: self.metric.clone(),
            window: TimeRange::new(self.window_start, self.window_end),
        }
    }
}

/// One raw record as returned by an upstream source, before transform.
///
/// The value is kept loosely typed; shape problems surface per record
/// during the transform phase instead of failing the whole pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub metric: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
