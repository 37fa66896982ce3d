//! Datalith Core - Shared domain types for the metrics platform
//!
//! This crate provides:
//! - Domain types shared by the pipeline and its consumers
//!   (Observation, Report, ETL run records)
//! - The platform error taxonomy
//! - The shared `Result` alias

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{ErrorClass, PipelineError, Result};
