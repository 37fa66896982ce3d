//! Error types for the metrics pipeline

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by upstream: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Warehouse store error: {0}")]
    Store(String),

    #[error("Upstream payload malformed: {0}")]
    UpstreamFormat(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Timestamp in the future: {0}")]
    FutureTimestamp(String),

    #[error("Invalid metric name: {0}")]
    InvalidMetricName(String),

    #[error("Aggregation queue full: {0}")]
    Overloaded(String),

    #[error("ETL run already active: {0}")]
    AlreadyRunning(String),

    #[error("Load phase failed: {0}")]
    LoadFailed(String),

    #[error("Aggregation failed: {0}")]
    AggregationFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Retry classification of an error.
///
/// Retry decisions dispatch on this so that adding a variant to
/// [`PipelineError`] forces a classification choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Safe to retry after a delay.
    Transient,
    /// Retrying will not help; surface to the caller.
    Permanent,
    /// Resource exhaustion; the caller may retry at its own discretion.
    Exhaustion,
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network(_)
            | Self::RateLimited { .. }
            | Self::Timeout(_)
            | Self::Store(_) => ErrorClass::Transient,
            Self::UpstreamFormat(_)
            | Self::InvalidValue(_)
            | Self::FutureTimestamp(_)
            | Self::InvalidMetricName(_)
            | Self::LoadFailed(_)
            | Self::AggregationFailed(_)
            | Self::Config(_)
            | Self::Internal(_) => ErrorClass::Permanent,
            Self::Overloaded(_) | Self::AlreadyRunning(_) => ErrorClass::Exhaustion,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Retry delay suggested by the upstream, if it sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidValue(_)
            | Self::FutureTimestamp(_)
            | Self::InvalidMetricName(_) => 400,
            Self::AlreadyRunning(_) => 409,
            Self::UpstreamFormat(_) => 502,
            Self::Overloaded(_) | Self::RateLimited { .. } => 429,
            Self::Timeout(_) => 504,
            Self::Network(_) | Self::Store(_) => 503,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Network(_) => "NETWORK_ERROR",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Store(_) => "STORE_ERROR",
            Self::UpstreamFormat(_) => "UPSTREAM_FORMAT_ERROR",
            Self::InvalidValue(_) => "INVALID_VALUE",
            Self::FutureTimestamp(_) => "FUTURE_TIMESTAMP",
            Self::InvalidMetricName(_) => "INVALID_METRIC_NAME",
            Self::Overloaded(_) => "OVERLOADED",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::LoadFailed(_) => "LOAD_FAILED",
            Self::AggregationFailed(_) => "AGGREGATION_FAILED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::Network("reset".into()).is_transient());
        assert!(PipelineError::Timeout("fetch".into()).is_transient());
        assert!(PipelineError::Store("io".into()).is_transient());
        assert!(PipelineError::RateLimited {
            message: "slow down".into(),
            retry_after: None,
        }
        .is_transient());
    }

    #[test]
    fn test_permanent_never_retried() {
        assert_eq!(
            PipelineError::UpstreamFormat("bad json".into()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            PipelineError::InvalidValue("NaN".into()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            PipelineError::LoadFailed("rejected 3/3 records".into()).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_exhaustion_surfaced_immediately() {
        assert_eq!(
            PipelineError::Overloaded("queue full".into()).class(),
            ErrorClass::Exhaustion
        );
        assert_eq!(
            PipelineError::AlreadyRunning("coindesk".into()).class(),
            ErrorClass::Exhaustion
        );
    }

    #[test]
    fn test_retry_after_passthrough() {
        let err = PipelineError::RateLimited {
            message: "429".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(PipelineError::Network("x".into()).retry_after(), None);
    }
}
