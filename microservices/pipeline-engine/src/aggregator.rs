//! Aggregation and Anomaly Detection
//!
//! Pure computation: summary statistics and z-score anomaly flags over
//! one observation window. No I/O, no clocks, no randomness — identical
//! input always produces identical output.

use chrono::{DateTime, Utc};
use datalith_core::{AggregationKey, Anomaly, Observation, Report};
use serde::{Deserialize, Serialize};

/// How the per-point reference mean/stddev is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyPolicy {
    /// Score each point against the statistics of all *other* points.
    /// A single extreme point cannot mask itself by inflating the
    /// spread it is scored against.
    LeaveOneOut,
    /// Score each point against the full-window statistics.
    FullWindow,
}

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub zscore_threshold: f64,
    pub policy: AnomalyPolicy,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            zscore_threshold: 3.0,
            policy: AnomalyPolicy::LeaveOneOut,
        }
    }
}

/// Anomaly scoring needs at least two reference points to estimate a
/// spread, so windows smaller than this are never flagged.
const MIN_SCORING_SAMPLES: usize = 3;

/// Below this a spread is treated as zero.
const SPREAD_EPSILON: f64 = 1e-12;

/// Scores are capped at this finite value; serde_json emits non-finite
/// floats as `null`, which would drop the score from report payloads.
const MAX_ANOMALY_SCORE: f64 = f64::MAX;

/// Aggregate one metric window into a [`Report`].
///
/// The series must be ordered by timestamp ascending (the warehouse
/// query contract). An empty series yields `count == 0` with every
/// statistic absent, never `0.0` or NaN.
pub fn aggregate(
    key: AggregationKey,
    series: &[Observation],
    computed_at: DateTime<Utc>,
    options: &AggregateOptions,
) -> Report {
    if series.is_empty() {
        return Report {
            key,
            count: 0,
            mean: None,
            stddev: None,
            min: None,
            max: None,
            anomalies: Vec::new(),
            computed_at,
        };
    }

    let n = series.len() as f64;
    let sum: f64 = series.iter().map(|o| o.value).sum();
    let sum_sq: f64 = series.iter().map(|o| o.value * o.value).sum();
    let mean = sum / n;
    // Population variance; clamp tiny negative residue from the
    // difference of squares.
    let variance = (sum_sq / n - mean * mean).max(0.0);
    let stddev = variance.sqrt();
    let min = series.iter().map(|o| o.value).fold(f64::INFINITY, f64::min);
    let max = series
        .iter()
        .map(|o| o.value)
        .fold(f64::NEG_INFINITY, f64::max);

    let anomalies = detect_anomalies(series, sum, sum_sq, mean, stddev, options);

    Report {
        key,
        count: series.len() as u64,
        mean: Some(mean),
        stddev: Some(stddev),
        min: Some(min),
        max: Some(max),
        anomalies,
        computed_at,
    }
}

fn detect_anomalies(
    series: &[Observation],
    sum: f64,
    sum_sq: f64,
    mean: f64,
    stddev: f64,
    options: &AggregateOptions,
) -> Vec<Anomaly> {
    if series.len() < MIN_SCORING_SAMPLES {
        return Vec::new();
    }

    let mut anomalies = Vec::new();
    for observation in series {
        let score = match options.policy {
            AnomalyPolicy::LeaveOneOut => {
                leave_one_out_score(observation.value, series.len(), sum, sum_sq)
            }
            AnomalyPolicy::FullWindow => zscore(observation.value, mean, stddev),
        };
        if score.abs() > options.zscore_threshold {
            anomalies.push(Anomaly {
                timestamp: observation.timestamp,
                value: observation.value,
                score,
            });
        }
    }
    anomalies
}

/// Z-score of `value` against the remaining points in the window.
fn leave_one_out_score(value: f64, count: usize, sum: f64, sum_sq: f64) -> f64 {
    let rest = (count - 1) as f64;
    let rest_mean = (sum - value) / rest;
    let rest_variance = ((sum_sq - value * value) / rest - rest_mean * rest_mean).max(0.0);
    zscore(value, rest_mean, rest_variance.sqrt())
}

fn zscore(value: f64, mean: f64, stddev: f64) -> f64 {
    let deviation = value - mean;
    if stddev <= SPREAD_EPSILON {
        // Zero spread among the reference points: any deviation scores
        // at the cap.
        if deviation.abs() <= SPREAD_EPSILON {
            0.0
        } else {
            deviation.signum() * MAX_ANOMALY_SCORE
        }
    } else {
        (deviation / stddev).clamp(-MAX_ANOMALY_SCORE, MAX_ANOMALY_SCORE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use datalith_core::TimeRange;

    fn series(values: &[f64]) -> Vec<Observation> {
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| Observation {
                source: "test".to_string(),
                metric: "btc_price_usd".to_string(),
                timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, i as u32).unwrap(),
                value,
            })
            .collect()
    }

    fn key() -> AggregationKey {
        AggregationKey {
            metric: "btc_price_usd".to_string(),
            window: TimeRange::new(
                Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap(),
            ),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_empty_window_has_absent_statistics() {
        let report = aggregate(key(), &[], now(), &AggregateOptions::default());
        assert_eq!(report.count, 0);
        assert_eq!(report.mean, None);
        assert_eq!(report.stddev, None);
        assert_eq!(report.min, None);
        assert_eq!(report.max, None);
        assert!(report.anomalies.is_empty());
    }

    #[test]
    fn test_summary_statistics() {
        let report = aggregate(
            key(),
            &series(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]),
            now(),
            &AggregateOptions::default(),
        );
        assert_eq!(report.count, 8);
        assert_eq!(report.mean, Some(5.0));
        // Population stddev of the classic example series.
        assert_eq!(report.stddev, Some(2.0));
        assert_eq!(report.min, Some(2.0));
        assert_eq!(report.max, Some(9.0));
    }

    #[test]
    fn test_spike_flagged_exactly_once() {
        let report = aggregate(
            key(),
            &series(&[10.0, 10.0, 10.0, 10.0, 1000.0]),
            now(),
            &AggregateOptions::default(),
        );
        assert_eq!(report.count, 5);
        assert_eq!(report.mean, Some(208.0));
        assert_eq!(report.anomalies.len(), 1);
        let anomaly = &report.anomalies[0];
        assert_eq!(anomaly.value, 1000.0);
        assert!(anomaly.score.abs() > 3.0);
    }

    #[test]
    fn test_uniform_series_has_no_anomalies() {
        let report = aggregate(
            key(),
            &series(&[5.0; 20]),
            now(),
            &AggregateOptions::default(),
        );
        assert!(report.anomalies.is_empty());
        assert_eq!(report.stddev, Some(0.0));
    }

    #[test]
    fn test_small_windows_are_never_flagged() {
        for values in [&[1.0][..], &[1.0, 1000.0][..]] {
            let report = aggregate(key(), &series(values), now(), &AggregateOptions::default());
            assert!(report.anomalies.is_empty(), "window {:?}", values);
        }
    }

    #[test]
    fn test_deterministic() {
        let data = series(&[3.1, 2.9, 3.0, 3.2, 95.0, 3.1, 2.8]);
        let options = AggregateOptions::default();
        let first = aggregate(key(), &data, now(), &options);
        let second = aggregate(key(), &data, now(), &options);
        assert_eq!(first, second);
    }

    #[test]
    fn test_anomalies_ordered_by_timestamp() {
        let data = series(&[500.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, -500.0]);
        let report = aggregate(key(), &data, now(), &AggregateOptions::default());
        assert_eq!(report.anomalies.len(), 2);
        assert!(report.anomalies[0].timestamp < report.anomalies[1].timestamp);
        assert_eq!(report.anomalies[0].value, 500.0);
        assert_eq!(report.anomalies[1].value, -500.0);
    }

    #[test]
    fn test_zero_spread_scores_stay_json_representable() {
        // The spike's reference points all agree, so its score hits the
        // cap. It must survive JSON serialization as a number.
        let report = aggregate(
            key(),
            &series(&[5.0, 5.0, 5.0, 5.0, 1000.0]),
            now(),
            &AggregateOptions::default(),
        );
        assert_eq!(report.anomalies.len(), 1);
        let anomaly = &report.anomalies[0];
        assert!(anomaly.score.is_finite());
        assert!(anomaly.score > 3.0);
        let json = serde_json::to_value(anomaly).unwrap();
        assert!(json["score"].is_f64());
    }

    #[test]
    fn test_full_window_policy() {
        let options = AggregateOptions {
            zscore_threshold: 1.9,
            policy: AnomalyPolicy::FullWindow,
        };
        let data = series(&[10.0, 10.0, 10.0, 10.0, 1000.0]);
        let report = aggregate(key(), &data, now(), &options);
        // Full-window z of the spike is exactly 2.0 (the spike inflates
        // the spread it is scored against).
        assert_eq!(report.anomalies.len(), 1);
        assert!((report.anomalies[0].score - 2.0).abs() < 1e-9);
    }
}
