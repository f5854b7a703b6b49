// Buffered learning-metric recording for observability
// Flush failures are diagnostics-only and never fail the main flow

use crate::error::PilotResult;
use crate::sql::DbConnection;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug)]
struct PendingMetric {
    name: String,
    value: f64,
    extra: Option<serde_json::Value>,
    timestamp: DateTime<Utc>,
}

/// One persisted metric point.
#[derive(Debug, Clone, Serialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub value: f64,
    pub extra: Option<serde_json::Value>,
}

/// Windowed summary statistics for one metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub latest: f64,
}

/// Records scalar learning metrics into a mutex-guarded buffer, flushing to
/// storage once the buffer reaches a threshold.
#[derive(Debug)]
pub struct MetricsTracker {
    db: DbConnection,
    buffer: Mutex<Vec<PendingMetric>>,
    flush_threshold: usize,
}

impl MetricsTracker {
    pub fn new(db: DbConnection, flush_threshold: usize) -> Self {
        Self {
            db,
            buffer: Mutex::new(Vec::new()),
            flush_threshold: flush_threshold.max(1),
        }
    }

    /// Buffer one metric point. Never fails the caller: a failed threshold
    /// flush keeps the buffer for the next attempt and logs a warning.
    pub fn record(&self, name: &str, value: f64, extra: Option<serde_json::Value>) {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.push(PendingMetric {
            name: name.to_string(),
            value,
            extra,
            timestamp: Utc::now(),
        });
        if buffer.len() >= self.flush_threshold {
            if let Err(err) = self.flush_locked(&mut buffer) {
                warn!("Failed to flush learning metrics: {}", err);
            }
        }
    }

    /// Flush buffered metrics now.
    pub fn flush(&self) -> PilotResult<()> {
        let mut buffer = self.buffer.lock().unwrap();
        self.flush_locked(&mut buffer)
    }

    fn flush_locked(&self, buffer: &mut Vec<PendingMetric>) -> PilotResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.db.with_conn(|conn| {
            for metric in buffer.iter() {
                conn.execute(
                    "INSERT INTO rl_metrics (timestamp, metric_name, metric_value, extra_data)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        metric.timestamp.to_rfc3339(),
                        metric.name,
                        metric.value,
                        metric.extra.as_ref().map(|v| v.to_string()),
                    ],
                )?;
            }
            Ok(())
        })?;
        buffer.clear();
        Ok(())
    }

    /// Most recent persisted points, newest first, optionally filtered to
    /// one metric. Unflushed points are not included.
    pub fn recent(&self, metric_name: Option<&str>, limit: usize) -> PilotResult<Vec<MetricPoint>> {
        let rows = self.db.with_conn(|conn| {
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String, f64, Option<String>)> {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            };
            match metric_name {
                Some(name) => {
                    let mut stmt = conn.prepare(
                        "SELECT timestamp, metric_name, metric_value, extra_data
                         FROM rl_metrics WHERE metric_name = ?1
                         ORDER BY id DESC LIMIT ?2",
                    )?;
                    let rows = stmt.query_map(params![name, limit as i64], map_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT timestamp, metric_name, metric_value, extra_data
                         FROM rl_metrics ORDER BY id DESC LIMIT ?1",
                    )?;
                    let rows = stmt.query_map(params![limit as i64], map_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()
                }
            }
        })?;

        let mut points = Vec::with_capacity(rows.len());
        for (timestamp, metric_name, value, extra) in rows {
            points.push(MetricPoint {
                timestamp: timestamp
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
                metric_name,
                value,
                extra: extra.and_then(|raw| serde_json::from_str(&raw).ok()),
            });
        }
        Ok(points)
    }

    /// Summary statistics over the most recent `window` points of a metric,
    /// or None when nothing has been recorded.
    pub fn summary(&self, metric_name: &str, window: usize) -> PilotResult<Option<MetricSummary>> {
        let points = self.recent(Some(metric_name), window)?;
        if points.is_empty() {
            return Ok(None);
        }

        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        Ok(Some(MetricSummary {
            count,
            mean,
            std_dev: variance.sqrt(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            latest: values[0],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker(threshold: usize) -> MetricsTracker {
        let db = DbConnection::open(None::<&str>).unwrap();
        db.initialize_schema().unwrap();
        MetricsTracker::new(db, threshold)
    }

    #[test]
    fn records_stay_buffered_until_flushed() {
        let tracker = tracker(100);
        tracker.record("reward", 10.0, None);
        assert!(tracker.recent(None, 10).unwrap().is_empty());

        tracker.flush().unwrap();
        let points = tracker.recent(None, 10).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].metric_name, "reward");
        assert!((points[0].value - 10.0).abs() < 1e-9);
    }

    #[test]
    fn buffer_flushes_at_the_threshold() {
        let tracker = tracker(3);
        tracker.record("reward", 1.0, None);
        tracker.record("reward", 2.0, None);
        assert!(tracker.recent(None, 10).unwrap().is_empty());

        tracker.record("reward", 3.0, None);
        assert_eq!(tracker.recent(None, 10).unwrap().len(), 3);
    }

    #[test]
    fn recent_filters_by_name_and_orders_newest_first() {
        let tracker = tracker(100);
        tracker.record("reward", 1.0, None);
        tracker.record("td_error", 0.5, None);
        tracker.record("reward", 2.0, None);
        tracker.flush().unwrap();

        let rewards = tracker.recent(Some("reward"), 10).unwrap();
        assert_eq!(rewards.len(), 2);
        assert!((rewards[0].value - 2.0).abs() < 1e-9);
        assert!((rewards[1].value - 1.0).abs() < 1e-9);

        assert_eq!(tracker.recent(None, 10).unwrap().len(), 3);
        assert_eq!(tracker.recent(Some("reward"), 1).unwrap().len(), 1);
    }

    #[test]
    fn extra_data_round_trips() {
        let tracker = tracker(1);
        tracker.record("reward", 5.0, Some(json!({ "tool": "get_members" })));

        let points = tracker.recent(Some("reward"), 1).unwrap();
        assert_eq!(points[0].extra, Some(json!({ "tool": "get_members" })));
    }

    #[test]
    fn summary_computes_window_statistics() {
        let tracker = tracker(1);
        for value in [1.0, 2.0, 3.0, 4.0] {
            tracker.record("reward", value, None);
        }

        let summary = tracker.summary("reward", 100).unwrap().unwrap();
        assert_eq!(summary.count, 4);
        assert!((summary.mean - 2.5).abs() < 1e-9);
        assert!((summary.min - 1.0).abs() < 1e-9);
        assert!((summary.max - 4.0).abs() < 1e-9);
        assert!((summary.latest - 4.0).abs() < 1e-9);
        // Population standard deviation of 1..4.
        assert!((summary.std_dev - 1.118033988749895).abs() < 1e-9);

        assert!(tracker.summary("unknown", 100).unwrap().is_none());

        // The window limits how much history enters the summary.
        let windowed = tracker.summary("reward", 2).unwrap().unwrap();
        assert_eq!(windowed.count, 2);
        assert!((windowed.mean - 3.5).abs() < 1e-9);
    }
}
