//! Task Dispatcher
//!
//! Accepts aggregation requests, deduplicates concurrent identical
//! requests onto one in-flight computation, executes on a bounded
//! worker pool, and caches completed Reports. Failed computations are
//! never cached; a prior valid cache entry stays eligible.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use datalith_core::{AggregationKey, Observation, PipelineError, Report, ReportRequest, Result};
use datalith_warehouse::WarehouseStore;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::aggregator::{aggregate, AggregateOptions};
use crate::config::PipelineConfig;

const STORE_READ_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Shared by every caller attached to one in-flight computation.
type ComputationResult = std::result::Result<Arc<Report>, Arc<PipelineError>>;

struct CacheEntry {
    report: Arc<Report>,
    computed_at: Instant,
}

pub struct TaskDispatcher {
    store: Arc<dyn WarehouseStore>,
    cache: DashMap<AggregationKey, CacheEntry>,
    inflight: DashMap<AggregationKey, watch::Receiver<Option<ComputationResult>>>,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    queue_cap: usize,
    staleness: Duration,
    aggregation_timeout: Duration,
    options: AggregateOptions,
}

impl TaskDispatcher {
    pub fn new(store: Arc<dyn WarehouseStore>, config: &PipelineConfig) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            inflight: DashMap::new(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_aggregations)),
            queued: AtomicUsize::new(0),
            queue_cap: config.aggregation_queue_cap,
            staleness: config.report_staleness,
            aggregation_timeout: config.aggregation_timeout,
            options: AggregateOptions {
                zscore_threshold: config.anomaly_zscore_threshold,
                ..AggregateOptions::default()
            },
        }
    }

    /// Adapter for the API-facing report contract.
    pub async fn handle(self: &Arc<Self>, request: &ReportRequest) -> Result<Arc<Report>> {
        self.request(request.key(), request.force_refresh).await
    }

    /// Return a Report for the key, from cache when fresh, otherwise by
    /// attaching to or starting a computation.
    ///
    /// At most one computation is in flight per key; every concurrent
    /// caller for the same key receives that computation's result.
    pub async fn request(
        self: &Arc<Self>,
        key: AggregationKey,
        force_refresh: bool,
    ) -> Result<Arc<Report>> {
        if !force_refresh {
            if let Some(entry) = self.cache.get(&key) {
                if entry.computed_at.elapsed() < self.staleness {
                    debug!(metric = %key.metric, "Serving cached report");
                    return Ok(entry.report.clone());
                }
            }
        }

        let receiver = self.attach(&key)?;
        Self::wait(receiver).await
    }

    /// Attach to the in-flight computation for the key, starting one if
    /// none exists.
    fn attach(
        self: &Arc<Self>,
        key: &AggregationKey,
    ) -> Result<watch::Receiver<Option<ComputationResult>>> {
        use dashmap::mapref::entry::Entry;

        match self.inflight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                debug!(metric = %key.metric, "Attaching to in-flight aggregation");
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                // Admit first, then verify: the capacity check must see
                // this caller's own increment, or simultaneous
                // distinct-key callers could all slip past a full queue.
                let queued = self.queued.fetch_add(1, Ordering::AcqRel) + 1;
                if queued > self.semaphore.available_permits() + self.queue_cap {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    return Err(PipelineError::Overloaded(format!(
                        "aggregation queue at capacity ({})",
                        self.queue_cap
                    )));
                }
                let (sender, receiver) = watch::channel(None);
                slot.insert(receiver.clone());

                let dispatcher = self.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    dispatcher.compute(key, sender).await;
                });
                Ok(receiver)
            }
        }
    }

    async fn wait(mut receiver: watch::Receiver<Option<ComputationResult>>) -> Result<Arc<Report>> {
        loop {
            if let Some(result) = receiver.borrow_and_update().clone() {
                return result.map_err(|e| Self::caller_error(&e));
            }
            if receiver.changed().await.is_err() {
                return Err(PipelineError::AggregationFailed(
                    "aggregation worker terminated".to_string(),
                ));
            }
        }
    }

    /// Run one admitted computation to completion and release every
    /// attached caller. Waiters may abandon their receivers at any
    /// point; the computation still finishes and populates the cache.
    async fn compute(
        self: Arc<Self>,
        key: AggregationKey,
        sender: watch::Sender<Option<ComputationResult>>,
    ) {
        let permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                self.inflight.remove(&key);
                let _ = sender.send(Some(Err(Arc::new(PipelineError::Internal(
                    "aggregation pool closed".to_string(),
                )))));
                return;
            }
        };
        self.queued.fetch_sub(1, Ordering::AcqRel);

        let result: ComputationResult = match tokio::time::timeout(
            self.aggregation_timeout,
            self.read_window(&key),
        )
        .await
        {
            Ok(Ok(series)) => {
                let report = Arc::new(aggregate(key.clone(), &series, Utc::now(), &self.options));
                info!(
                    metric = %key.metric,
                    count = report.count,
                    anomalies = report.anomalies.len(),
                    "Aggregation complete"
                );
                // Replace, never mutate, any prior entry for the key.
                self.cache.insert(
                    key.clone(),
                    CacheEntry {
                        report: report.clone(),
                        computed_at: Instant::now(),
                    },
                );
                Ok(report)
            }
            Ok(Err(e)) => {
                warn!(metric = %key.metric, error = %e, "Aggregation failed");
                Err(Arc::new(e))
            }
            Err(_) => Err(Arc::new(PipelineError::Timeout(format!(
                "aggregation for {} exceeded {:?}",
                key.metric, self.aggregation_timeout
            )))),
        };

        drop(permit);
        self.inflight.remove(&key);
        let _ = sender.send(Some(result));
    }

    /// Read the observation window, retrying transient store failures a
    /// small fixed number of times.
    async fn read_window(&self, key: &AggregationKey) -> Result<Vec<Observation>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.query_range(&key.metric, &key.window).await {
                Ok(series) => return Ok(series),
                Err(e) if e.is_transient() && attempt < STORE_READ_ATTEMPTS => {
                    warn!(
                        metric = %key.metric,
                        attempt = attempt,
                        error = %e,
                        "Warehouse read failed, retrying"
                    );
                    tokio::time::sleep(STORE_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(PipelineError::AggregationFailed(format!(
                        "warehouse read: {}",
                        e
                    )))
                }
            }
        }
    }

    fn caller_error(error: &PipelineError) -> PipelineError {
        match error {
            PipelineError::Timeout(message) => PipelineError::Timeout(message.clone()),
            PipelineError::AggregationFailed(message) => {
                PipelineError::AggregationFailed(message.clone())
            }
            other => PipelineError::AggregationFailed(other.to_string()),
        }
    }
}
