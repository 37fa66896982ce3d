//! Pipeline Engine service
//!
//! Wires the ingestion-to-aggregation pipeline behind a thin HTTP
//! surface:
//! - Observation ingestion (API provenance)
//! - On-demand aggregation reports
//! - ETL triggers and run inspection
//! - Optional scheduled ETL over a configured source list
//!
//! Authentication and dashboard rendering live in front of this
//! service, not in it.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use datalith_core::{IngestRequest, PipelineError, Provenance, ReportRequest, Result};
use datalith_warehouse::MemoryWarehouse;
use pipeline_engine::{
    EtlOrchestrator, HttpFetcher, IngestionGateway, PipelineConfig, TaskDispatcher,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pipeline_engine=debug".parse().unwrap()),
        )
        .json()
        .init();

    info!("Starting Pipeline Engine");

    let config = PipelineConfig::from_env()?;
    let store = Arc::new(MemoryWarehouse::new());
    let fetcher = Arc::new(HttpFetcher::new(
        &config.upstream_base_url,
        config.fetch_timeout,
    )?);
    let gateway = Arc::new(IngestionGateway::new(store.clone(), &config)?);
    let orchestrator = Arc::new(EtlOrchestrator::new(
        fetcher,
        gateway.clone(),
        config.clone(),
    ));
    let dispatcher = Arc::new(TaskDispatcher::new(store.clone(), &config));

    run_etl_schedule(&config, orchestrator.clone());

    let app = axum::Router::new()
        .route("/health", axum::routing::get(|| async { "OK" }))
        .route(
            "/ready",
            axum::routing::get(|| async {
                Json(serde_json::json!({ "ready": true, "service": "pipeline-engine" }))
            }),
        )
        .route(
            "/api/v1/ingest",
            axum::routing::post({
                let gateway = gateway.clone();
                move |Json(body): Json<IngestBody>| {
                    let gateway = gateway.clone();
                    async move {
                        let request = body.into_request();
                        match gateway.ingest(&request).await {
                            Ok(result) => Json(result).into_response(),
                            Err(e) => error_response(&e),
                        }
                    }
                }
            }),
        )
        .route(
            "/api/v1/reports",
            axum::routing::post({
                let dispatcher = dispatcher.clone();
                move |Json(request): Json<ReportRequest>| {
                    let dispatcher = dispatcher.clone();
                    async move {
                        match dispatcher.handle(&request).await {
                            Ok(report) => Json(report.as_ref().clone()).into_response(),
                            Err(e) => error_response(&e),
                        }
                    }
                }
            }),
        )
        .route(
            "/api/v1/etl/{source}/trigger",
            axum::routing::post({
                let orchestrator = orchestrator.clone();
                move |axum::extract::Path(source): axum::extract::Path<String>| {
                    let orchestrator = orchestrator.clone();
                    async move {
                        match orchestrator.trigger(&source) {
                            Ok(run_id) => {
                                Json(serde_json::json!({ "run_id": run_id })).into_response()
                            }
                            Err(e) => error_response(&e),
                        }
                    }
                }
            }),
        )
        .route(
            "/api/v1/etl/runs",
            axum::routing::get({
                let orchestrator = orchestrator.clone();
                move || {
                    let orchestrator = orchestrator.clone();
                    async move { Json(orchestrator.runs()) }
                }
            }),
        )
        .route(
            "/api/v1/etl/runs/{id}",
            axum::routing::get({
                let orchestrator = orchestrator.clone();
                move |axum::extract::Path(id): axum::extract::Path<Uuid>| {
                    let orchestrator = orchestrator.clone();
                    async move {
                        match orchestrator.run(id) {
                            Some(run) => Json(run).into_response(),
                            None => StatusCode::NOT_FOUND.into_response(),
                        }
                    }
                }
            }),
        );

    info!(http = %config.http_bind, "Pipeline Engine listening");
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| PipelineError::Internal(e.to_string()))?;
    Ok(())
}

/// Ingest body as submitted over HTTP; provenance is always `api` on
/// this route and the timestamp defaults to receipt time.
#[derive(Debug, Deserialize)]
struct IngestBody {
    source: String,
    metric: String,
    value: f64,
    timestamp: Option<DateTime<Utc>>,
}

impl IngestBody {
    fn into_request(self) -> IngestRequest {
        IngestRequest {
            source: self.source,
            metric: self.metric,
            value: self.value,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            provenance: Provenance::Api,
        }
    }
}

fn error_response(error: &PipelineError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(serde_json::json!({
            "code": error.error_code(),
            "error": error.to_string(),
        })),
    )
        .into_response()
}

/// Periodic ETL trigger over the configured source list. Overlap with a
/// still-active run for a source is rejected by the orchestrator and
/// skipped here.
fn run_etl_schedule(config: &PipelineConfig, orchestrator: Arc<EtlOrchestrator>) {
    if config.etl_interval_secs == 0 || config.etl_sources.is_empty() {
        return;
    }
    let sources = config.etl_sources.clone();
    let interval_secs = config.etl_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            for source in &sources {
                match orchestrator.trigger(source) {
                    Ok(run_id) => info!(source = %source, run_id = %run_id, "Scheduled ETL run"),
                    Err(e) => tracing::debug!(source = %source, error = %e, "Skipping scheduled ETL"),
                }
            }
        }
    });
}
