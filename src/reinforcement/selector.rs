// Confidence-weighted tool recommendation under an exploration policy

use crate::config::{ExplorationConfig, SelectionConfig};
use crate::reinforcement::policy::PolicyStore;
use crate::types::{ToolRecommendation, ToolStats};
use rand::Rng;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

// Blend weights for the informed confidence score.
const Q_WEIGHT: f64 = 0.5;
const SUCCESS_WEIGHT: f64 = 0.3;
const LATENCY_WEIGHT: f64 = 0.2;

/// Exploration bookkeeping for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ExplorationStats {
    pub current_rate: f64,
    pub initial_rate: f64,
    pub total_selections: u64,
    pub selection_counts: HashMap<String, u64>,
}

struct ScoredTool {
    recommendation: ToolRecommendation,
    visits: u64,
    sampled: bool,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Ranks candidate tools by blending learned values with aggregate
/// execution statistics. The random source is always injected so runs are
/// reproducible under a seeded generator.
#[derive(Debug)]
pub struct ToolSelector {
    selection: SelectionConfig,
    exploration: ExplorationConfig,
    /// Current (decayed) exploration rate
    epsilon: f64,
    total_selections: u64,
    selection_counts: HashMap<String, u64>,
}

impl ToolSelector {
    pub fn new(selection: SelectionConfig, exploration: ExplorationConfig) -> Self {
        let epsilon = exploration.rate;
        Self {
            selection,
            exploration,
            epsilon,
            total_selections: 0,
            selection_counts: HashMap::new(),
        }
    }

    pub fn exploration_rate(&self) -> f64 {
        self.epsilon
    }

    /// Rank every candidate for the context. With probability epsilon one
    /// tool from outside the exploit-ranked head (having at least one
    /// sample) is promoted to the front; otherwise the strict
    /// confidence-ranked order is returned. Never mutates selector state.
    pub fn recommend(
        &self,
        context_hash: &str,
        candidates: &[String],
        stats: &HashMap<String, ToolStats>,
        policy: &PolicyStore,
        rng: &mut impl Rng,
    ) -> Vec<ToolRecommendation> {
        let mut scored = self.rank(context_hash, candidates, stats, policy);
        if scored.is_empty() {
            return Vec::new();
        }

        if rng.gen::<f64>() < self.epsilon {
            let head = self.selection.top_set_size.min(scored.len());
            let outside: Vec<usize> = (head..scored.len())
                .filter(|&i| scored[i].sampled)
                .collect();
            if !outside.is_empty() {
                let pick = outside[rng.gen_range(0..outside.len())];
                let mut entry = scored.remove(pick);
                entry.recommendation.exploration = true;
                entry.recommendation.rationale =
                    format!("exploration: {}", entry.recommendation.rationale);
                debug!(
                    "Exploration promoted {} ahead of its rank",
                    entry.recommendation.tool_name
                );
                scored.insert(0, entry);
            }
        }

        scored.into_iter().map(|s| s.recommendation).collect()
    }

    /// Strict confidence-ranked order with no exploration promotion, for
    /// dashboards and snapshots.
    pub fn recommend_exploit(
        &self,
        context_hash: &str,
        candidates: &[String],
        stats: &HashMap<String, ToolStats>,
        policy: &PolicyStore,
    ) -> Vec<ToolRecommendation> {
        self.rank(context_hash, candidates, stats, policy)
            .into_iter()
            .map(|s| s.recommendation)
            .collect()
    }

    fn rank(
        &self,
        context_hash: &str,
        candidates: &[String],
        stats: &HashMap<String, ToolStats>,
        policy: &PolicyStore,
    ) -> Vec<ScoredTool> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let latency_scores = latency_percentile_scores(candidates, stats);
        let min_samples = self.selection.min_samples.max(1);

        let mut scored = Vec::with_capacity(candidates.len());
        for tool in candidates {
            let tool_stats = stats.get(tool);
            let total_calls = tool_stats.map(|s| s.total_calls).unwrap_or(0);
            let (value, visits) = policy.lookup(tool, context_hash);

            let (confidence, rationale) = match tool_stats {
                Some(s) if s.total_calls >= min_samples => {
                    let q_score = sigmoid(value / self.selection.q_scale);
                    let latency_score = latency_scores.get(tool).copied().unwrap_or(0.5);
                    let confidence = (Q_WEIGHT * q_score
                        + SUCCESS_WEIGHT * s.success_rate
                        + LATENCY_WEIGHT * latency_score)
                        .clamp(0.0, 1.0);

                    let mut signals = Vec::new();
                    if value > 0.0 {
                        signals.push("learned value favors this tool".to_string());
                    }
                    if s.success_rate > 0.8 {
                        signals.push("high success rate".to_string());
                    }
                    if s.avg_rating.map_or(false, |r| r >= 4.0) {
                        signals.push("high user rating".to_string());
                    }
                    if latency_score >= 0.75 {
                        signals.push("fast execution".to_string());
                    }
                    let rationale = if signals.is_empty() {
                        "no strong signal".to_string()
                    } else {
                        signals.join(", ")
                    };
                    (confidence, rationale)
                }
                // Below the sample threshold the learned value must not
                // leak into the confidence, however large it is.
                Some(s) if s.total_calls > 0 => (
                    0.4 + 0.2 * s.success_rate,
                    "insufficient samples".to_string(),
                ),
                _ => (0.5, "insufficient samples".to_string()),
            };

            scored.push(ScoredTool {
                recommendation: ToolRecommendation {
                    tool_name: tool.clone(),
                    confidence,
                    rationale,
                    exploration: false,
                },
                visits,
                sampled: total_calls > 0,
            });
        }

        scored.sort_by(|a, b| {
            b.recommendation
                .confidence
                .partial_cmp(&a.recommendation.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.visits.cmp(&a.visits))
                .then_with(|| a.recommendation.tool_name.cmp(&b.recommendation.tool_name))
        });
        scored
    }

    /// Pick a single tool epsilon-greedily, with UCB1 scoring once every
    /// candidate has been tried at least once overall. Returns the pick and
    /// whether it was exploratory, and decays the exploration rate.
    pub fn select(
        &mut self,
        context_hash: &str,
        candidates: &[String],
        stats: &HashMap<String, ToolStats>,
        policy: &PolicyStore,
        rng: &mut impl Rng,
    ) -> Option<(String, bool)> {
        if candidates.is_empty() {
            return None;
        }

        self.total_selections += 1;
        let mut was_exploration = false;

        let selected = if rng.gen::<f64>() < self.epsilon {
            was_exploration = true;
            candidates[rng.gen_range(0..candidates.len())].clone()
        } else if self.total_selections > candidates.len() as u64 {
            let n_total = self.total_selections as f64;
            let mut best = candidates[0].clone();
            let mut best_score = f64::NEG_INFINITY;
            for tool in candidates {
                let score = self.ucb_score(tool, context_hash, policy, n_total);
                if score > best_score {
                    best_score = score;
                    best = tool.clone();
                }
            }
            // A rarely-used UCB pick still counts as exploration.
            if self.selection_counts.get(&best).copied().unwrap_or(0)
                < self.selection.min_samples
            {
                was_exploration = true;
            }
            best
        } else {
            match self.rank(context_hash, candidates, stats, policy).first() {
                Some(top) => top.recommendation.tool_name.clone(),
                None => {
                    was_exploration = true;
                    candidates[rng.gen_range(0..candidates.len())].clone()
                }
            }
        };

        *self.selection_counts.entry(selected.clone()).or_insert(0) += 1;
        self.decay_exploration();

        Some((selected, was_exploration))
    }

    /// UCB1: squashed exploitation value plus an exploration bonus for
    /// less-tried tools.
    fn ucb_score(
        &self,
        tool_name: &str,
        context_hash: &str,
        policy: &PolicyStore,
        n_total: f64,
    ) -> f64 {
        let (value, _) = policy.lookup(tool_name, context_hash);
        let q_score = sigmoid(value / self.selection.q_scale);
        let n_tool = self
            .selection_counts
            .get(tool_name)
            .copied()
            .unwrap_or(0)
            .max(1) as f64;
        q_score + self.exploration.ucb_c * (n_total.max(1.0).ln() / n_tool).sqrt()
    }

    /// Apply exploration rate decay after a selection.
    fn decay_exploration(&mut self) {
        self.epsilon = (self.epsilon * self.exploration.decay).max(self.exploration.min_rate);
    }

    /// Reset the exploration rate to its initial value.
    pub fn reset_exploration(&mut self) {
        self.epsilon = self.exploration.rate;
    }

    pub fn exploration_stats(&self) -> ExplorationStats {
        ExplorationStats {
            current_rate: self.epsilon,
            initial_rate: self.exploration.rate,
            total_selections: self.total_selections,
            selection_counts: self.selection_counts.clone(),
        }
    }
}

/// 1 minus the percentile rank of each tool's average latency among the
/// candidates; faster tools score closer to 1. Tools with unknown latency
/// are absent and default to 0.5 at the call site.
fn latency_percentile_scores(
    candidates: &[String],
    stats: &HashMap<String, ToolStats>,
) -> HashMap<String, f64> {
    let mut known: Vec<(&str, f64)> = candidates
        .iter()
        .filter_map(|tool| {
            stats
                .get(tool)
                .and_then(|s| s.avg_latency_ms)
                .map(|latency| (tool.as_str(), latency))
        })
        .collect();

    let mut scores = HashMap::new();
    if known.is_empty() {
        return scores;
    }
    known.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    let n = known.len();
    for (i, (tool, _)) in known.iter().enumerate() {
        let score = if n == 1 {
            0.5
        } else {
            1.0 - i as f64 / (n - 1) as f64
        };
        scores.insert(tool.to_string(), score);
    }
    scores
}
