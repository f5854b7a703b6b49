// N-gram mining over finalized episode tool sequences
// Learns which tool tends to follow which, for next-tool recommendations

use crate::error::PilotResult;
use crate::sql::DbConnection;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::warn;

// Minimum times a sequence must have been seen before it is recommended.
const MIN_SUPPORT: u64 = 2;

/// Running statistics of one observed tool sequence.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SequenceStats {
    pub count: u64,
    pub avg_reward: f64,
    pub success_rate: f64,
}

/// A next-tool suggestion derived from sequence patterns.
#[derive(Debug, Clone, Serialize)]
pub struct SequenceRecommendation {
    pub tool_name: String,
    pub score: f64,
    pub rationale: String,
}

fn sequence_key(tools: &[String]) -> String {
    tools.join("->")
}

/// Learns N-gram statistics (bigrams up to `max_n`-grams) from finalized
/// episodes and recommends likely next tools.
#[derive(Debug)]
pub struct SequenceLearner {
    db: DbConnection,
    max_n: usize,
    cache: RwLock<HashMap<String, SequenceStats>>,
}

impl SequenceLearner {
    pub fn new(db: DbConnection, max_n: usize) -> Self {
        Self {
            db,
            max_n,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Record every n-gram of a finalized sequence. Each occurrence carries
    /// an equal share of the episode reward. Failures are logged and
    /// swallowed; sequence mining never fails the main flow.
    pub fn record_episode(&self, tool_sequence: &[String], total_reward: f64, success: bool) {
        if tool_sequence.len() < 2 {
            return;
        }
        let reward_share = total_reward / tool_sequence.len() as f64;
        for n in 2..=self.max_n.min(tool_sequence.len()) {
            for window in tool_sequence.windows(n) {
                if let Err(err) = self.update_sequence(window, reward_share, success) {
                    warn!("Failed to record tool sequence: {}", err);
                }
            }
        }
    }

    fn update_sequence(&self, tools: &[String], reward: f64, success: bool) -> PilotResult<()> {
        let key = sequence_key(tools);
        let now = Utc::now().to_rfc3339();
        let success_value = if success { 1.0 } else { 0.0 };

        let stats = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rl_tool_sequences (sequence_key, count, avg_reward, success_rate, last_seen)
                 VALUES (?1, 1, ?2, ?3, ?4)
                 ON CONFLICT (sequence_key) DO UPDATE SET
                     avg_reward = (avg_reward * count + ?2) / (count + 1),
                     success_rate = (success_rate * count + ?3) / (count + 1),
                     count = count + 1,
                     last_seen = ?4",
                params![key, reward, success_value, now],
            )?;
            conn.query_row(
                "SELECT count, avg_reward, success_rate FROM rl_tool_sequences
                 WHERE sequence_key = ?1",
                params![key],
                |row| {
                    Ok(SequenceStats {
                        count: row.get(0)?,
                        avg_reward: row.get(1)?,
                        success_rate: row.get(2)?,
                    })
                },
            )
        })?;

        self.cache.write().unwrap().insert(key, stats);
        Ok(())
    }

    /// Stats for a sequence key, cache first, then storage.
    fn stats_for(&self, key: &str) -> Option<SequenceStats> {
        if let Some(stats) = self.cache.read().unwrap().get(key).copied() {
            return Some(stats);
        }

        let loaded = self
            .db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT count, avg_reward, success_rate FROM rl_tool_sequences
                     WHERE sequence_key = ?1",
                    params![key],
                    |row| {
                        Ok(SequenceStats {
                            count: row.get(0)?,
                            avg_reward: row.get(1)?,
                            success_rate: row.get(2)?,
                        })
                    },
                )
                .optional()
            })
            .ok()
            .flatten()?;

        self.cache
            .write()
            .unwrap()
            .insert(key.to_string(), loaded);
        Some(loaded)
    }

    /// Recommend likely next tools given the recently executed ones,
    /// matching the longest known suffix pattern for each candidate.
    pub fn next_tool_recommendations(
        &self,
        recent_tools: &[String],
        candidates: &[String],
        top_k: usize,
    ) -> Vec<SequenceRecommendation> {
        if recent_tools.is_empty() {
            return Vec::new();
        }

        let mut recommendations = Vec::new();
        for tool in candidates {
            let mut best_score = 0.0;
            let mut best_rationale = String::new();

            for n in 1..self.max_n.min(recent_tools.len() + 1) {
                let prefix = &recent_tools[recent_tools.len() - n..];
                let mut sequence = prefix.to_vec();
                sequence.push(tool.clone());

                let Some(stats) = self.stats_for(&sequence_key(&sequence)) else {
                    continue;
                };
                if stats.count < MIN_SUPPORT {
                    continue;
                }

                let support = (stats.count as f64 / 10.0).min(1.0);
                let score = stats.avg_reward * 0.4
                    + stats.success_rate * 10.0 * 0.4
                    + support * 0.2;
                if score > best_score {
                    best_score = score;
                    best_rationale = format!(
                        "follows {} ({}x, {:.0}% success)",
                        sequence_key(prefix),
                        stats.count,
                        stats.success_rate * 100.0
                    );
                }
            }

            if best_score > 0.0 {
                recommendations.push(SequenceRecommendation {
                    tool_name: tool.clone(),
                    score: best_score,
                    rationale: best_rationale,
                });
            }
        }

        recommendations.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.tool_name.cmp(&b.tool_name))
        });
        recommendations.truncate(top_k);
        recommendations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn learner() -> SequenceLearner {
        let db = DbConnection::open(None::<&str>).unwrap();
        db.initialize_schema().unwrap();
        SequenceLearner::new(db, 3)
    }

    fn sequence(tools: &[&str]) -> Vec<String> {
        tools.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn ngrams_are_extracted_with_reward_shares() {
        let learner = learner();
        learner.record_episode(&sequence(&["a", "b", "c"]), 9.0, true);

        // Bigrams and the trigram, each with reward share 9 / 3 = 3.
        for key in ["a->b", "b->c", "a->b->c"] {
            let stats = learner.stats_for(key).unwrap();
            assert_eq!(stats.count, 1);
            assert!((stats.avg_reward - 3.0).abs() < 1e-9);
            assert!((stats.success_rate - 1.0).abs() < 1e-9);
        }
        assert!(learner.stats_for("a->c").is_none());
    }

    #[test]
    fn running_averages_update_per_occurrence() {
        let learner = learner();
        learner.record_episode(&sequence(&["a", "b"]), 8.0, true);
        learner.record_episode(&sequence(&["a", "b"]), 2.0, false);

        let stats = learner.stats_for("a->b").unwrap();
        assert_eq!(stats.count, 2);
        // Shares were 4.0 and 1.0.
        assert!((stats.avg_reward - 2.5).abs() < 1e-9);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn single_step_sequences_are_ignored() {
        let learner = learner();
        learner.record_episode(&sequence(&["a"]), 10.0, true);
        assert!(learner.stats_for("a").is_none());
    }

    #[test]
    fn recommendations_require_minimum_support() {
        let learner = learner();
        learner.record_episode(&sequence(&["a", "b"]), 10.0, true);

        let candidates = sequence(&["b", "c"]);
        let recs = learner.next_tool_recommendations(&sequence(&["a"]), &candidates, 5);
        assert!(recs.is_empty(), "one occurrence is below the support floor");

        learner.record_episode(&sequence(&["a", "b"]), 10.0, true);
        let recs = learner.next_tool_recommendations(&sequence(&["a"]), &candidates, 5);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].tool_name, "b");
        assert!(recs[0].rationale.contains("follows a"));
        assert!(recs[0].rationale.contains("100% success"));
    }

    #[test]
    fn longer_matching_suffixes_can_win() {
        let learner = learner();
        for _ in 0..3 {
            learner.record_episode(&sequence(&["a", "b", "c"]), 30.0, true);
        }

        let recs =
            learner.next_tool_recommendations(&sequence(&["a", "b"]), &sequence(&["c", "d"]), 5);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].tool_name, "c");

        let recent_only_b = learner.next_tool_recommendations(
            &sequence(&["b"]),
            &sequence(&["c", "d"]),
            5,
        );
        assert_eq!(recent_only_b[0].tool_name, "c");
    }

    #[test]
    fn recommendations_rank_by_score_and_respect_top_k() {
        let learner = learner();
        for _ in 0..3 {
            learner.record_episode(&sequence(&["a", "good"]), 20.0, true);
            learner.record_episode(&sequence(&["a", "bad"]), 2.0, false);
        }

        let candidates = sequence(&["bad", "good"]);
        let recs = learner.next_tool_recommendations(&sequence(&["a"]), &candidates, 5);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].tool_name, "good");
        assert!(recs[0].score > recs[1].score);

        let top_one = learner.next_tool_recommendations(&sequence(&["a"]), &candidates, 1);
        assert_eq!(top_one.len(), 1);
        assert_eq!(top_one[0].tool_name, "good");
    }

    #[test]
    fn no_recent_tools_means_no_recommendations() {
        let learner = learner();
        learner.record_episode(&sequence(&["a", "b"]), 10.0, true);
        let recs = learner.next_tool_recommendations(&[], &sequence(&["b"]), 5);
        assert!(recs.is_empty());
    }
}
