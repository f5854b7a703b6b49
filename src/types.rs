//! Shared data types exchanged with the execution log, the tool catalog
//! and the orchestrator.

use crate::error::{PilotError, PilotResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

/// One completed tool execution, as delivered by the execution log.
///
/// Records are append-only: this crate never mutates them. Only executions
/// with a definitive outcome may be reported; a cancelled or timed-out call
/// has none and must not produce a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub tool_name: String,
    pub session_id: String,
    pub success: bool,
    /// Wall-clock latency in milliseconds. Negative values are invalid
    /// input and are clamped to zero when the reward is computed.
    pub latency_ms: i64,
    /// Optional user rating, 1-5 stars.
    pub rating: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        tool_name: impl Into<String>,
        session_id: impl Into<String>,
        success: bool,
        latency_ms: i64,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            session_id: session_id.into(),
            success,
            latency_ms,
            rating: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a user rating (1-5 stars)
    pub fn with_rating(mut self, rating: u8) -> Self {
        self.rating = Some(rating);
        self
    }
}

/// Aggregate execution statistics for one tool, supplied by a collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolStats {
    pub tool_name: String,
    pub total_calls: u64,
    /// Fraction of calls that succeeded, in [0, 1].
    pub success_rate: f64,
    pub avg_rating: Option<f64>,
    pub avg_latency_ms: Option<f64>,
}

/// Source of per-tool aggregate statistics.
///
/// A tool with no stats entry is treated as having zero samples; a
/// temporarily unavailable aggregate degrades recommendations, it never
/// fails them.
pub trait StatsProvider: Send + Sync {
    fn tool_stats(&self, tool_name: &str) -> Option<ToolStats>;
}

#[derive(Debug, Default, Clone)]
struct StatsAccumulator {
    calls: u64,
    successes: u64,
    latency_total_ms: f64,
    rating_total: f64,
    rating_count: u64,
}

/// Reference [`StatsProvider`] fed directly with execution records.
///
/// Embedders without their own metrics pipeline can feed this from the same
/// stream of records they report to the engine.
#[derive(Debug, Default)]
pub struct InMemoryStats {
    inner: RwLock<HashMap<String, StatsAccumulator>>,
}

impl InMemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one completed execution into the per-tool aggregates.
    pub fn record(&self, record: &ExecutionRecord) {
        let mut inner = self.inner.write().unwrap();
        let accum = inner.entry(record.tool_name.clone()).or_default();
        accum.calls += 1;
        if record.success {
            accum.successes += 1;
        }
        accum.latency_total_ms += record.latency_ms.max(0) as f64;
        if let Some(rating) = record.rating {
            if (1..=5).contains(&rating) {
                accum.rating_total += rating as f64;
                accum.rating_count += 1;
            }
        }
    }
}

impl StatsProvider for InMemoryStats {
    fn tool_stats(&self, tool_name: &str) -> Option<ToolStats> {
        let inner = self.inner.read().unwrap();
        let accum = inner.get(tool_name)?;
        if accum.calls == 0 {
            return None;
        }
        Some(ToolStats {
            tool_name: tool_name.to_string(),
            total_calls: accum.calls,
            success_rate: accum.successes as f64 / accum.calls as f64,
            avg_rating: (accum.rating_count > 0)
                .then(|| accum.rating_total / accum.rating_count as f64),
            avg_latency_ms: Some(accum.latency_total_ms / accum.calls as f64),
        })
    }
}

/// Outcome tag attached to a finalized episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Success,
    Partial,
    Failure,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Success => "success",
            SessionOutcome::Partial => "partial",
            SessionOutcome::Failure => "failure",
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionOutcome {
    type Err = PilotError;

    fn from_str(s: &str) -> PilotResult<Self> {
        match s {
            "success" => Ok(SessionOutcome::Success),
            "partial" => Ok(SessionOutcome::Partial),
            "failure" => Ok(SessionOutcome::Failure),
            other => Err(PilotError::other(format!(
                "unknown session outcome: {}",
                other
            ))),
        }
    }
}

/// One ranked recommendation from the tool selector.
#[derive(Debug, Clone, Serialize)]
pub struct ToolRecommendation {
    pub tool_name: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub rationale: String,
    /// True when this entry was surfaced by the exploration policy rather
    /// than its natural rank.
    pub exploration: bool,
}

/// A finalized session: ordered tool sequence and cumulative reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub session_id: String,
    pub tool_sequence: Vec<String>,
    pub total_reward: f64,
    pub outcome: SessionOutcome,
    pub created_at: DateTime<Utc>,
}
