// Engine facade wiring the learning components together
// Exposes recommend / on_execution_complete / finalize_session to the
// orchestrator and read-only views to observability consumers

use crate::config::{RlConfig, UpdateMode};
use crate::error::PilotResult;
use crate::reinforcement::context::encode_context;
use crate::reinforcement::episode::EpisodeTracker;
use crate::reinforcement::metrics::{MetricPoint, MetricSummary, MetricsTracker};
use crate::reinforcement::policy::{PolicyAggregate, PolicyEntry, PolicyStore};
use crate::reinforcement::replay::{Experience, ReplayBuffer};
use crate::reinforcement::reward::calculate_reward;
use crate::reinforcement::selector::{ExplorationStats, ToolSelector};
use crate::reinforcement::sequence::{SequenceLearner, SequenceRecommendation};
use crate::sql::DbConnection;
use crate::types::{
    Episode, ExecutionRecord, SessionOutcome, StatsProvider, ToolRecommendation, ToolStats,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Update deferred until the next step of the same session (bootstrap mode).
#[derive(Debug, Clone)]
struct PendingUpdate {
    tool_name: String,
    context_hash: String,
    reward: f64,
}

/// Where a session currently stands, for context derivation.
#[derive(Debug, Default, Clone)]
struct SessionCursor {
    step_count: u32,
    previous_tool: Option<String>,
    last_query: Option<String>,
    pending: Option<PendingUpdate>,
}

/// Comprehensive learning statistics for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct LearningStats {
    pub update_count: u64,
    pub policy_entries: usize,
    pub replay_buffer_size: usize,
    pub open_sessions: usize,
    pub exploration: ExplorationStats,
    pub metric_summaries: HashMap<String, MetricSummary>,
}

/// Facade over the tool-selection learning engine.
///
/// The engine is a plain value: construct one, share it behind an `Arc`,
/// and pass it wherever it is needed. There is no global instance.
///
/// Failures inside the engine are isolated from the surrounding tool
/// execution: a failed `recommend` or `on_execution_complete` is a
/// non-fatal error for the caller to log, never a reason to fail the
/// primary call.
pub struct RlEngine {
    config: RlConfig,
    policy: PolicyStore,
    episodes: EpisodeTracker,
    sequences: SequenceLearner,
    metrics: MetricsTracker,
    selector: Mutex<ToolSelector>,
    replay: Mutex<ReplayBuffer>,
    rng: Mutex<StdRng>,
    cursors: Mutex<HashMap<String, SessionCursor>>,
    stats: Arc<dyn StatsProvider>,
    catalog: Vec<String>,
    update_count: AtomicU64,
}

impl RlEngine {
    /// Construct an engine over the given database handle.
    ///
    /// `catalog` is the static list of registered tool names; it is only
    /// ever enumerated, never interpreted. `stats` supplies per-tool
    /// aggregate statistics at call time.
    pub fn new(
        config: RlConfig,
        db: DbConnection,
        stats: Arc<dyn StatsProvider>,
        catalog: Vec<String>,
    ) -> PilotResult<Self> {
        config.validate()?;
        db.initialize_schema()?;

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let selector = ToolSelector::new(config.selection.clone(), config.exploration.clone());
        let replay = ReplayBuffer::new(config.replay.capacity, config.replay.priority_exponent);

        let engine = Self {
            policy: PolicyStore::new(db.clone())?,
            episodes: EpisodeTracker::new(db.clone()),
            sequences: SequenceLearner::new(db.clone(), 3),
            metrics: MetricsTracker::new(db, 100),
            selector: Mutex::new(selector),
            replay: Mutex::new(replay),
            rng: Mutex::new(rng),
            cursors: Mutex::new(HashMap::new()),
            stats,
            catalog,
            update_count: AtomicU64::new(0),
            config,
        };
        info!(
            "Initialized learning engine ({} catalog tools, {} policy entries)",
            engine.catalog.len(),
            engine.policy.len()
        );
        Ok(engine)
    }

    /// Open a fresh session and return its generated id.
    pub fn begin_session(&self) -> PilotResult<String> {
        let session_id = Uuid::new_v4().to_string();
        self.episodes.begin(&session_id)?;
        self.cursors
            .lock()
            .unwrap()
            .insert(session_id.clone(), SessionCursor::default());
        debug!("Opened session {}", session_id);
        Ok(session_id)
    }

    /// Ranked tool recommendations for the session's current context.
    ///
    /// With no data yet this degrades to a neutral flat ranking, never an
    /// error. `previous_tool` overrides the session cursor when given.
    pub fn recommend(
        &self,
        session_id: &str,
        query_text: &str,
        previous_tool: Option<&str>,
    ) -> PilotResult<Vec<ToolRecommendation>> {
        let context_hash = self.session_context(session_id, Some(query_text), previous_tool);
        let stats = self.stats_map();
        let selector = self.selector.lock().unwrap();
        let mut rng = self.rng.lock().unwrap();
        Ok(selector.recommend(&context_hash, &self.catalog, &stats, &self.policy, &mut *rng))
    }

    /// Epsilon-greedy single pick; decays the exploration rate. Returns the
    /// chosen tool and whether it was exploratory, or None for an empty
    /// catalog. Pure recommendation: the engine never executes a tool.
    pub fn select_tool(
        &self,
        session_id: &str,
        query_text: &str,
    ) -> PilotResult<Option<(String, bool)>> {
        let context_hash = self.session_context(session_id, Some(query_text), None);
        let stats = self.stats_map();
        let mut selector = self.selector.lock().unwrap();
        let mut rng = self.rng.lock().unwrap();
        Ok(selector.select(&context_hash, &self.catalog, &stats, &self.policy, &mut *rng))
    }

    /// Ingest one completed execution: sanitize, compute the reward, apply
    /// the policy update for the configured mode, append the episode step
    /// and feed replay/metrics.
    ///
    /// Callers must only report executions with a definitive outcome; a
    /// cancelled or timed-out call has none and must not be reported here.
    /// A step on a finalized session is rejected with a state error and
    /// leaves every store untouched.
    pub fn on_execution_complete(&self, record: &ExecutionRecord) -> PilotResult<()> {
        let record = self.sanitize(record);

        let avg_latency = self
            .stats
            .tool_stats(&record.tool_name)
            .and_then(|s| s.avg_latency_ms);
        let reward = calculate_reward(&record, avg_latency, &self.config.reward);

        let context_hash = {
            let cursors = self.cursors.lock().unwrap();
            let cursor = cursors.get(&record.session_id).cloned().unwrap_or_default();
            encode_context(
                cursor.last_query.as_deref(),
                cursor.previous_tool.as_deref(),
                cursor.step_count,
            )
        };

        // The episode state machine is the gate: a finalized session
        // rejects the step here, before any learning state changes.
        self.episodes
            .record_step(&record.session_id, &record.tool_name, reward)?;

        match self.config.learning.update_mode {
            UpdateMode::SingleStep => {
                self.apply_update(&record.tool_name, &context_hash, reward, 0.0)?;
                self.push_experience(Experience {
                    context_hash: context_hash.clone(),
                    tool_name: record.tool_name.clone(),
                    reward,
                    next_context_hash: None,
                    terminal: true,
                });
            }
            UpdateMode::Bootstrap => {
                let pending = {
                    let mut cursors = self.cursors.lock().unwrap();
                    cursors
                        .entry(record.session_id.clone())
                        .or_default()
                        .pending
                        .take()
                };
                if let Some(p) = pending {
                    // The tool actually chosen at this step pins the
                    // bootstrap target for the previous one.
                    let (best_next, _) = self.policy.lookup(&record.tool_name, &context_hash);
                    self.apply_update(&p.tool_name, &p.context_hash, p.reward, best_next)?;
                    self.push_experience(Experience {
                        context_hash: p.context_hash,
                        tool_name: p.tool_name,
                        reward: p.reward,
                        next_context_hash: Some(context_hash.clone()),
                        terminal: false,
                    });
                }
                let mut cursors = self.cursors.lock().unwrap();
                cursors.entry(record.session_id.clone()).or_default().pending =
                    Some(PendingUpdate {
                        tool_name: record.tool_name.clone(),
                        context_hash: context_hash.clone(),
                        reward,
                    });
            }
        }

        {
            let mut cursors = self.cursors.lock().unwrap();
            let cursor = cursors.entry(record.session_id.clone()).or_default();
            cursor.step_count += 1;
            cursor.previous_tool = Some(record.tool_name.clone());
        }

        self.maybe_replay()
    }

    /// Finalize a session: flush any deferred update with a terminal zero,
    /// persist the episode and mine its sequence patterns.
    ///
    /// Repeated finalization returns the already-persisted episode
    /// unchanged and repeats no side effects.
    pub fn finalize_session(
        &self,
        session_id: &str,
        outcome: SessionOutcome,
    ) -> PilotResult<Episode> {
        let pending = {
            let mut cursors = self.cursors.lock().unwrap();
            cursors.get_mut(session_id).and_then(|c| c.pending.take())
        };
        if let Some(p) = pending {
            self.apply_update(&p.tool_name, &p.context_hash, p.reward, 0.0)?;
            self.push_experience(Experience {
                context_hash: p.context_hash,
                tool_name: p.tool_name,
                reward: p.reward,
                next_context_hash: None,
                terminal: true,
            });
        }

        // A session the engine has seen but the tracker has not (opened via
        // recommend, no steps) still finalizes, to an empty episode.
        let cursor_known = self.cursors.lock().unwrap().contains_key(session_id);
        if cursor_known && self.episodes.find_episode(session_id)?.is_none() {
            self.episodes.begin(session_id)?;
        }

        let (episode, newly_finalized) = self.episodes.finalize(session_id, outcome)?;
        if newly_finalized {
            self.sequences.record_episode(
                &episode.tool_sequence,
                episode.total_reward,
                episode.outcome == SessionOutcome::Success,
            );
            self.metrics.record(
                "episode_reward",
                episode.total_reward,
                Some(serde_json::json!({ "outcome": episode.outcome.as_str() })),
            );
            self.metrics.record(
                "episode_length",
                episode.tool_sequence.len() as f64,
                Some(serde_json::json!({ "outcome": episode.outcome.as_str() })),
            );
            self.cursors.lock().unwrap().remove(session_id);
            info!(
                "Finalized session {} ({} steps, reward {:.2}, outcome {})",
                session_id,
                episode.tool_sequence.len(),
                episode.total_reward,
                episode.outcome
            );
        }
        Ok(episode)
    }

    // ------------------------------------------------------------------
    // Read-only views for observability consumers
    // ------------------------------------------------------------------

    /// Highest-valued policy entries.
    pub fn top_policies(&self, limit: usize) -> Vec<PolicyEntry> {
        self.policy.top_policies(limit)
    }

    /// Aggregate policy view of one tool.
    pub fn tool_aggregate(&self, tool_name: &str) -> Option<PolicyAggregate> {
        self.policy.aggregate(tool_name)
    }

    /// Exploitation-only confidence ranking for a hypothetical context.
    pub fn confidence_snapshot(
        &self,
        query_text: &str,
        previous_tool: Option<&str>,
    ) -> Vec<ToolRecommendation> {
        let context_hash = encode_context(Some(query_text), previous_tool, 0);
        let stats = self.stats_map();
        self.selector
            .lock()
            .unwrap()
            .recommend_exploit(&context_hash, &self.catalog, &stats, &self.policy)
    }

    /// Most recent successful episodes, optionally containing a tool.
    pub fn successful_sequences(
        &self,
        tool_name: Option<&str>,
        limit: usize,
    ) -> PilotResult<Vec<Episode>> {
        self.episodes.successful_sequences(tool_name, limit)
    }

    /// Next-tool suggestions from sequence patterns, based on the session's
    /// in-progress tool sequence.
    pub fn sequence_recommendations(
        &self,
        session_id: &str,
        top_k: usize,
    ) -> Vec<SequenceRecommendation> {
        let recent = self.episodes.open_sequence(session_id).unwrap_or_default();
        self.sequences
            .next_tool_recommendations(&recent, &self.catalog, top_k)
    }

    /// Recently persisted metric points.
    pub fn recent_metrics(
        &self,
        metric_name: Option<&str>,
        limit: usize,
    ) -> PilotResult<Vec<MetricPoint>> {
        self.metrics.recent(metric_name, limit)
    }

    /// Comprehensive learning statistics.
    pub fn learning_stats(&self) -> PilotResult<LearningStats> {
        if let Err(err) = self.metrics.flush() {
            warn!("Failed to flush metrics before summarizing: {}", err);
        }

        let mut metric_summaries = HashMap::new();
        for name in ["reward", "td_error", "episode_reward", "exploration_rate"] {
            if let Some(summary) = self.metrics.summary(name, 100)? {
                metric_summaries.insert(name.to_string(), summary);
            }
        }

        Ok(LearningStats {
            update_count: self.update_count.load(Ordering::SeqCst),
            policy_entries: self.policy.len(),
            replay_buffer_size: self.replay.lock().unwrap().len(),
            open_sessions: self.episodes.open_sessions(),
            exploration: self.selector.lock().unwrap().exploration_stats(),
            metric_summaries,
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Correct malformed record fields defensively; logged, never raised.
    fn sanitize(&self, record: &ExecutionRecord) -> ExecutionRecord {
        let mut record = record.clone();
        if record.latency_ms < 0 {
            warn!(
                "Negative latency {}ms for tool {}; clamping to 0",
                record.latency_ms, record.tool_name
            );
            record.latency_ms = 0;
        }
        if let Some(rating) = record.rating {
            if !(1..=5).contains(&rating) {
                warn!(
                    "Out-of-range rating {} for tool {}; dropping it",
                    rating, record.tool_name
                );
                record.rating = None;
            }
        }
        record
    }

    /// Derive the session's context id, remembering the query when given.
    fn session_context(
        &self,
        session_id: &str,
        query_text: Option<&str>,
        previous_tool: Option<&str>,
    ) -> String {
        let mut cursors = self.cursors.lock().unwrap();
        let cursor = cursors.entry(session_id.to_string()).or_default();
        if let Some(query) = query_text {
            cursor.last_query = Some(query.to_string());
        }
        let previous = previous_tool
            .map(str::to_string)
            .or_else(|| cursor.previous_tool.clone());
        encode_context(
            cursor.last_query.as_deref(),
            previous.as_deref(),
            cursor.step_count,
        )
    }

    fn apply_update(
        &self,
        tool_name: &str,
        context_hash: &str,
        reward: f64,
        best_next_value: f64,
    ) -> PilotResult<()> {
        let outcome = self.policy.update(
            tool_name,
            context_hash,
            reward,
            self.config.learning.learning_rate,
            self.config.learning.discount_factor,
            best_next_value,
        )?;
        self.update_count.fetch_add(1, Ordering::SeqCst);

        self.metrics.record(
            "reward",
            reward,
            Some(serde_json::json!({ "tool": tool_name })),
        );
        self.metrics.record(
            "td_error",
            outcome.td_error.abs(),
            Some(serde_json::json!({ "tool": tool_name })),
        );
        self.metrics.record(
            "exploration_rate",
            self.selector.lock().unwrap().exploration_rate(),
            None,
        );
        Ok(())
    }

    fn push_experience(&self, experience: Experience) {
        let priority = experience.reward.abs() + 1.0;
        self.replay.lock().unwrap().add(experience, Some(priority));
    }

    /// Re-apply a sampled batch of experiences every `interval` updates.
    fn maybe_replay(&self) -> PilotResult<()> {
        if !self.config.replay.enabled {
            return Ok(());
        }
        let count = self.update_count.load(Ordering::SeqCst);
        if count == 0 || count % self.config.replay.interval != 0 {
            return Ok(());
        }

        let batch = {
            let replay = self.replay.lock().unwrap();
            if replay.len() < self.config.replay.batch_size {
                return Ok(());
            }
            let mut rng = self.rng.lock().unwrap();
            replay.sample(self.config.replay.batch_size, &mut *rng)
        };

        let mut total_td = 0.0;
        let batch_len = batch.len();
        for experience in batch {
            let best_next = match (&experience.next_context_hash, experience.terminal) {
                (Some(next), false) => self.policy.max_value(next, &self.catalog),
                _ => 0.0,
            };
            let outcome = self.policy.update(
                &experience.tool_name,
                &experience.context_hash,
                experience.reward,
                self.config.learning.learning_rate,
                self.config.learning.discount_factor,
                best_next,
            )?;
            total_td += outcome.td_error.abs();
        }
        if batch_len > 0 {
            self.metrics
                .record("batch_avg_td_error", total_td / batch_len as f64, None);
            debug!("Replayed {} experiences", batch_len);
        }
        Ok(())
    }

    fn stats_map(&self) -> HashMap<String, ToolStats> {
        self.catalog
            .iter()
            .filter_map(|tool| {
                self.stats
                    .tool_stats(tool)
                    .map(|stats| (tool.clone(), stats))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PilotError;
    use crate::reinforcement::reward::calculate_reward;
    use crate::types::InMemoryStats;

    const CATALOG: &[&str] = &[
        "get_dimensions",
        "get_members",
        "run_consolidation",
        "smart_retrieve",
        "submit_journal",
    ];

    fn catalog() -> Vec<String> {
        CATALOG.iter().map(|t| t.to_string()).collect()
    }

    fn engine_with(config: RlConfig, stats: Arc<InMemoryStats>) -> RlEngine {
        let db = DbConnection::open(None::<&str>).unwrap();
        RlEngine::new(config, db, stats, catalog()).unwrap()
    }

    fn seeded_config() -> RlConfig {
        RlConfig {
            rng_seed: Some(42),
            ..RlConfig::default()
        }
    }

    fn engine() -> (RlEngine, Arc<InMemoryStats>) {
        let stats = Arc::new(InMemoryStats::new());
        (engine_with(seeded_config(), Arc::clone(&stats)), stats)
    }

    #[test]
    fn cold_start_recommendations_are_neutral_and_flat() {
        let (engine, _) = engine();
        let recs = engine.recommend("s1", "retrieve entity balances", None).unwrap();
        assert_eq!(recs.len(), CATALOG.len());
        for rec in &recs {
            assert!((rec.confidence - 0.5).abs() < 1e-9);
            assert_eq!(rec.rationale, "insufficient samples");
        }
    }

    #[test]
    fn empty_catalog_recommends_nothing() {
        let stats: Arc<InMemoryStats> = Arc::new(InMemoryStats::new());
        let db = DbConnection::open(None::<&str>).unwrap();
        let engine = RlEngine::new(seeded_config(), db, stats, Vec::new()).unwrap();
        assert!(engine.recommend("s1", "anything", None).unwrap().is_empty());
        assert!(engine.select_tool("s1", "anything").unwrap().is_none());
    }

    #[test]
    fn scenario_three_step_session() {
        let (engine, stats) = engine();
        let session = "s1";
        let cfg = RlConfig::default().reward;

        // Two successful executions of smart_retrieve rated 5, then one
        // failure, mirroring what the execution log would deliver.
        let records = [
            ExecutionRecord::new("smart_retrieve", session, true, 500).with_rating(5),
            ExecutionRecord::new("smart_retrieve", session, true, 500).with_rating(5),
            ExecutionRecord::new("smart_retrieve", session, false, 2000),
        ];

        let mut expected_total = 0.0;
        for record in &records {
            let avg = stats.tool_stats("smart_retrieve").and_then(|s| s.avg_latency_ms);
            expected_total += calculate_reward(record, avg, &cfg);
            engine.on_execution_complete(record).unwrap();
            stats.record(record);
        }

        let episode = engine
            .finalize_session(session, SessionOutcome::Success)
            .unwrap();
        assert_eq!(
            episode.tool_sequence,
            vec!["smart_retrieve", "smart_retrieve", "smart_retrieve"]
        );
        assert!((episode.total_reward - expected_total).abs() < 1e-9);
        assert_eq!(episode.outcome, SessionOutcome::Success);

        let persisted = engine.successful_sequences(Some("smart_retrieve"), 5).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0], episode);
    }

    #[test]
    fn single_step_updates_apply_immediately() {
        let (engine, _) = engine();
        let record = ExecutionRecord::new("get_members", "s1", true, 0);
        engine.on_execution_complete(&record).unwrap();

        // Step 0, no previous tool, no remembered query.
        let ctx = encode_context(None, None, 0);
        let (value, visits) = engine.policy.lookup("get_members", &ctx);
        assert_eq!(visits, 1);
        // Q = alpha * reward = 0.1 * 10
        assert!((value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn recommend_query_enters_the_update_context() {
        let (engine, _) = engine();
        engine.recommend("s1", "retrieve entity balances", None).unwrap();
        let record = ExecutionRecord::new("get_members", "s1", true, 0);
        engine.on_execution_complete(&record).unwrap();

        let ctx = encode_context(Some("retrieve entity balances"), None, 0);
        let (_, visits) = engine.policy.lookup("get_members", &ctx);
        assert_eq!(visits, 1);
    }

    #[test]
    fn bootstrap_defers_the_update_until_the_next_step() {
        let stats = Arc::new(InMemoryStats::new());
        let mut config = seeded_config();
        config.learning.update_mode = UpdateMode::Bootstrap;
        let engine = engine_with(config, stats);

        engine
            .on_execution_complete(&ExecutionRecord::new("get_dimensions", "s1", true, 0))
            .unwrap();
        let ctx0 = encode_context(None, None, 0);
        assert_eq!(
            engine.policy.lookup("get_dimensions", &ctx0),
            (0.0, 0),
            "the first step's update is deferred"
        );

        engine
            .on_execution_complete(&ExecutionRecord::new("get_members", "s1", true, 0))
            .unwrap();
        let (value, visits) = engine.policy.lookup("get_dimensions", &ctx0);
        assert_eq!(visits, 1);
        // best_next was 0 (nothing learned yet for the next key).
        assert!((value - 1.0).abs() < 1e-9);

        // Finalization flushes the second step with a terminal zero.
        engine.finalize_session("s1", SessionOutcome::Success).unwrap();
        let ctx1 = encode_context(None, Some("get_dimensions"), 1);
        let (value, visits) = engine.policy.lookup("get_members", &ctx1);
        assert_eq!(visits, 1);
        assert!((value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bootstrap_target_uses_the_value_of_the_tool_chosen_next() {
        let stats = Arc::new(InMemoryStats::new());
        let mut config = seeded_config();
        config.learning.update_mode = UpdateMode::Bootstrap;
        let engine = engine_with(config, stats);

        // Pre-learn a value for the key the second step will land on.
        let ctx1 = encode_context(None, Some("get_dimensions"), 1);
        engine
            .policy
            .update("get_members", &ctx1, 10.0, 0.5, 0.0, 0.0)
            .unwrap();

        engine
            .on_execution_complete(&ExecutionRecord::new("get_dimensions", "s1", true, 0))
            .unwrap();
        engine
            .on_execution_complete(&ExecutionRecord::new("get_members", "s1", true, 0))
            .unwrap();

        let ctx0 = encode_context(None, None, 0);
        let (value, _) = engine.policy.lookup("get_dimensions", &ctx0);
        // Q = alpha * (reward + gamma * Q(next)) = 0.1 * (10 + 0.9 * 5)
        assert!((value - 1.45).abs() < 1e-9);
    }

    #[test]
    fn steps_after_finalize_are_rejected_without_side_effects() {
        let (engine, _) = engine();
        engine
            .on_execution_complete(&ExecutionRecord::new("get_members", "s1", true, 0))
            .unwrap();
        let episode = engine
            .finalize_session("s1", SessionOutcome::Success)
            .unwrap();

        let entries_before = engine.policy.len();
        let err = engine
            .on_execution_complete(&ExecutionRecord::new("get_members", "s1", true, 0))
            .unwrap_err();
        assert!(matches!(err, PilotError::SessionFinalized { .. }));

        // Neither the episode nor the policy changed.
        assert_eq!(engine.policy.len(), entries_before);
        let persisted = engine.episodes.find_episode("s1").unwrap().unwrap();
        assert_eq!(persisted, episode);
    }

    #[test]
    fn finalize_twice_returns_the_episode_and_repeats_nothing() {
        let (engine, _) = engine();
        for tool in ["get_dimensions", "get_members"] {
            engine
                .on_execution_complete(&ExecutionRecord::new(tool, "s1", true, 0))
                .unwrap();
        }
        let first = engine
            .finalize_session("s1", SessionOutcome::Success)
            .unwrap();
        let second = engine
            .finalize_session("s1", SessionOutcome::Failure)
            .unwrap();
        assert_eq!(first, second);

        // The n-gram stats were not double-counted by the retry.
        let stats = engine
            .sequences
            .next_tool_recommendations(
                &["get_dimensions".to_string()],
                &catalog(),
                5,
            );
        assert!(
            stats.is_empty(),
            "one observation stays below the support floor"
        );
    }

    #[test]
    fn concurrent_sessions_land_in_the_same_policy_key() {
        let (engine, _) = engine();
        let engine = Arc::new(engine);

        let handles: Vec<_> = ["s1", "s2"]
            .into_iter()
            .map(|session| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    engine
                        .on_execution_complete(&ExecutionRecord::new(
                            "get_members",
                            session,
                            true,
                            0,
                        ))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Both sessions share step 0 / no previous tool / no query.
        let ctx = encode_context(None, None, 0);
        let (_, visits) = engine.policy.lookup("get_members", &ctx);
        assert_eq!(visits, 2, "both updates must land, not overwrite");
    }

    #[test]
    fn malformed_records_are_corrected_not_raised() {
        let (engine, _) = engine();
        let mut record = ExecutionRecord::new("get_members", "s1", true, -300);
        record.rating = Some(9);
        engine.on_execution_complete(&record).unwrap();

        let ctx = encode_context(None, None, 0);
        let (value, _) = engine.policy.lookup("get_members", &ctx);
        // Clamped latency and dropped rating: reward is the bare success
        // term, so Q = 0.1 * 10.
        assert!((value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn begin_session_opens_distinct_sessions() {
        let (engine, _) = engine();
        let a = engine.begin_session().unwrap();
        let b = engine.begin_session().unwrap();
        assert_ne!(a, b);

        let episode = engine.finalize_session(&a, SessionOutcome::Partial).unwrap();
        assert!(episode.tool_sequence.is_empty());
    }

    #[test]
    fn session_opened_by_recommend_finalizes_empty() {
        let (engine, _) = engine();
        engine.recommend("s1", "retrieve balances", None).unwrap();
        let episode = engine
            .finalize_session("s1", SessionOutcome::Failure)
            .unwrap();
        assert!(episode.tool_sequence.is_empty());
        assert_eq!(episode.outcome, SessionOutcome::Failure);
    }

    #[test]
    fn finalizing_a_never_seen_session_is_an_error() {
        let (engine, _) = engine();
        let err = engine
            .finalize_session("ghost", SessionOutcome::Success)
            .unwrap_err();
        assert!(matches!(err, PilotError::UnknownSession { .. }));
    }

    #[test]
    fn exploration_surfaces_with_full_epsilon() {
        let stats = Arc::new(InMemoryStats::new());
        // Give every catalog tool at least one sample.
        for tool in CATALOG {
            for _ in 0..6 {
                stats.record(&ExecutionRecord::new(*tool, "warmup", true, 100));
            }
        }
        let mut config = seeded_config();
        config.exploration.rate = 1.0;
        let engine = engine_with(config, stats);

        let recs = engine.recommend("s1", "retrieve balances", None).unwrap();
        assert!(recs[0].exploration);
        assert!(recs[0].rationale.starts_with("exploration:"));
        assert_eq!(recs.len(), CATALOG.len());
    }

    #[test]
    fn replay_reapplies_experiences_when_enabled() {
        let stats = Arc::new(InMemoryStats::new());
        let mut config = seeded_config();
        config.replay.enabled = true;
        config.replay.batch_size = 2;
        config.replay.interval = 2;
        let engine = engine_with(config, stats);

        for session in ["s1", "s2", "s3", "s4"] {
            engine
                .on_execution_complete(&ExecutionRecord::new("get_members", session, true, 0))
                .unwrap();
        }

        let ctx = encode_context(None, None, 0);
        let (_, visits) = engine.policy.lookup("get_members", &ctx);
        assert!(
            visits > 4,
            "replay batches must re-apply updates, saw {} visits",
            visits
        );
    }

    #[test]
    fn learning_stats_reflect_activity() {
        let (engine, _) = engine();
        engine
            .on_execution_complete(&ExecutionRecord::new("get_members", "s1", true, 0))
            .unwrap();
        engine.finalize_session("s1", SessionOutcome::Success).unwrap();

        let stats = engine.learning_stats().unwrap();
        assert_eq!(stats.update_count, 1);
        assert_eq!(stats.policy_entries, 1);
        assert_eq!(stats.open_sessions, 0);
        assert!(stats.metric_summaries.contains_key("reward"));
        assert!(stats.metric_summaries.contains_key("episode_reward"));

        let top = engine.top_policies(5);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].tool_name, "get_members");
        assert!(engine.tool_aggregate("get_members").is_some());
    }

    #[test]
    fn sequence_recommendations_follow_the_open_session() {
        let (engine, _) = engine();

        // Two finished sessions teach the get_dimensions -> get_members
        // pattern.
        for session in ["s1", "s2"] {
            engine
                .on_execution_complete(&ExecutionRecord::new("get_dimensions", session, true, 0))
                .unwrap();
            engine
                .on_execution_complete(&ExecutionRecord::new("get_members", session, true, 0))
                .unwrap();
            engine
                .finalize_session(session, SessionOutcome::Success)
                .unwrap();
        }

        engine
            .on_execution_complete(&ExecutionRecord::new("get_dimensions", "s3", true, 0))
            .unwrap();
        let recs = engine.sequence_recommendations("s3", 5);
        assert_eq!(recs[0].tool_name, "get_members");
        assert!(recs[0].rationale.contains("follows get_dimensions"));
    }
}
