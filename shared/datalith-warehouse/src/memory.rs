//! In-memory warehouse

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datalith_core::{Observation, TimeRange};
use parking_lot::RwLock;
use tracing::debug;

use crate::{Result, UpsertOutcome, WarehouseStore};

/// Row key: `(metric, timestamp, source)`.
///
/// Metric-first so a window query is one ordered range scan; the unique
/// identity `(source, metric, timestamp)` is preserved because all
/// three components participate in the key.
type RowKey = (String, DateTime<Utc>, String);

/// In-memory reference implementation of [`WarehouseStore`].
///
/// Backs local development and tests; production deployments point the
/// pipeline at a real table store behind the same trait.
#[derive(Default)]
pub struct MemoryWarehouse {
    rows: RwLock<BTreeMap<RowKey, f64>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl WarehouseStore for MemoryWarehouse {
    async fn upsert(&self, observation: &Observation) -> Result<UpsertOutcome> {
        let key = (
            observation.metric.clone(),
            observation.timestamp,
            observation.source.clone(),
        );
        let mut rows = self.rows.write();
        let outcome = match rows.insert(key, observation.value) {
            None => UpsertOutcome::Inserted,
            Some(previous) if previous == observation.value => UpsertOutcome::Unchanged,
            Some(previous) => UpsertOutcome::Overwritten { previous },
        };
        debug!(
            metric = %observation.metric,
            source = %observation.source,
            outcome = ?outcome,
            "Upserted observation"
        );
        Ok(outcome)
    }

    async fn query_range(&self, metric: &str, range: &TimeRange) -> Result<Vec<Observation>> {
        let rows = self.rows.read();
        let lower: RowKey = (metric.to_string(), range.start, String::new());
        let upper: RowKey = (metric.to_string(), range.end, String::new());
        let observations = rows
            .range((Included(lower), Excluded(upper)))
            .map(|((metric, timestamp, source), value)| Observation {
                source: source.clone(),
                metric: metric.clone(),
                timestamp: *timestamp,
                value: *value,
            })
            .collect();
        Ok(observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obs(source: &str, metric: &str, secs: u32, value: f64) -> Observation {
        Observation {
            source: source.to_string(),
            metric: metric.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs).unwrap(),
            value,
        }
    }

    #[tokio::test]
    async fn test_upsert_outcomes() {
        let store = MemoryWarehouse::new();
        assert_eq!(
            store.upsert(&obs("api", "cpu", 0, 1.0)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert(&obs("api", "cpu", 0, 1.0)).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            store.upsert(&obs("api", "cpu", 0, 2.0)).await.unwrap(),
            UpsertOutcome::Overwritten { previous: 1.0 }
        );
        // Last write wins; still exactly one row.
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_query_range_ordered_and_half_open() {
        let store = MemoryWarehouse::new();
        store.upsert(&obs("api", "cpu", 3, 3.0)).await.unwrap();
        store.upsert(&obs("api", "cpu", 1, 1.0)).await.unwrap();
        store.upsert(&obs("api", "cpu", 2, 2.0)).await.unwrap();
        store.upsert(&obs("api", "mem", 1, 9.0)).await.unwrap();

        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 1).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 3).unwrap(),
        );
        let rows = store.query_range("cpu", &range).await.unwrap();
        let values: Vec<f64> = rows.iter().map(|o| o.value).collect();
        // End of the window excluded, other metrics invisible, ascending order.
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_sources_share_a_metric() {
        let store = MemoryWarehouse::new();
        store.upsert(&obs("coindesk", "btc_price_usd", 1, 10.0)).await.unwrap();
        store.upsert(&obs("kraken", "btc_price_usd", 1, 11.0)).await.unwrap();
        assert_eq!(store.len(), 2);

        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap(),
        );
        let rows = store.query_range("btc_price_usd", &range).await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
