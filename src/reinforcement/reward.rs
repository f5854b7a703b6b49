// Reward shaping for completed tool executions

use crate::config::RewardConfig;
use crate::types::ExecutionRecord;

/// Calculate the reward for one completed execution.
///
/// `avg_latency_ms` is the tool's historical average latency; when it is
/// absent (cold start) the efficiency bonus is never granted. Pure and
/// side-effect-free.
pub fn calculate_reward(
    record: &ExecutionRecord,
    avg_latency_ms: Option<f64>,
    cfg: &RewardConfig,
) -> f64 {
    let mut reward = 0.0;

    // Success dominates failure in magnitude, so one failure does not wipe
    // out a prior success.
    if record.success {
        reward += cfg.success_reward;
    } else {
        reward -= cfg.failure_penalty;
    }

    if let Some(rating) = record.rating {
        reward += (rating as f64 - cfg.neutral_rating) * cfg.rating_weight;
    }

    // Negative latency is invalid input: clamp rather than propagate.
    let latency_ms = record.latency_ms.max(0) as f64;
    reward -= (cfg.latency_weight * latency_ms / 1000.0).min(cfg.max_latency_penalty);

    if let Some(avg) = avg_latency_ms {
        if avg > 0.0 && latency_ms < cfg.efficiency_threshold * avg {
            reward += cfg.efficiency_bonus;
        }
    }

    reward
}

/// The inclusive range every valid record's reward falls into for the given
/// weights.
pub fn reward_bounds(cfg: &RewardConfig) -> (f64, f64) {
    let min = -cfg.failure_penalty
        - (cfg.neutral_rating - 1.0) * cfg.rating_weight
        - cfg.max_latency_penalty;
    let max = cfg.success_reward
        + (5.0 - cfg.neutral_rating) * cfg.rating_weight
        + cfg.efficiency_bonus;
    (min, max)
}
