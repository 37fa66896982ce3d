//! Pipeline Engine
//!
//! Ingestion-to-aggregation pipeline for the Datalith metrics platform:
//! - Retrying fetch-transform-load of upstream metric pulls
//! - Ingestion gateway validating and persisting single observations
//! - Deduplicating task dispatcher with a bounded aggregation pool
//! - Pure aggregation and z-score anomaly detection

pub mod aggregator;
pub mod config;
pub mod dispatcher;
pub mod etl;
pub mod fetcher;
pub mod gateway;

pub use config::PipelineConfig;
pub use dispatcher::TaskDispatcher;
pub use etl::EtlOrchestrator;
pub use fetcher::{Fetcher, HttpFetcher};
pub use gateway::IngestionGateway;
