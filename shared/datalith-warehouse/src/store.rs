//! Warehouse store contract

use async_trait::async_trait;
use datalith_core::{Observation, TimeRange};

use crate::Result;

/// Outcome of upserting one observation row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpsertOutcome {
    /// No row existed for the key.
    Inserted,
    /// A row existed with the same value; idempotent no-op.
    Unchanged,
    /// A row existed with a differing value; it was replaced.
    Overwritten { previous: f64 },
}

impl UpsertOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Overwritten { .. })
    }
}

/// Durable table store keyed by `(source, metric, timestamp)`.
///
/// Assumed durable and crash-consistent per call. Writes to the same
/// key are linearized by the store (last write wins).
#[async_trait]
pub trait WarehouseStore: Send + Sync {
    /// Write exactly one observation row.
    async fn upsert(&self, observation: &Observation) -> Result<UpsertOutcome>;

    /// All observations for `metric` with timestamps in `range`,
    /// ordered by timestamp ascending. Finite.
    async fn query_range(&self, metric: &str, range: &TimeRange) -> Result<Vec<Observation>>;
}
