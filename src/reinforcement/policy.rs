// Persistent tabular Q-learning policy store
// Key (tool_name, context_hash) -> (value estimate, visit count)

use crate::error::PilotResult;
use crate::sql::DbConnection;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// One (tool, context) entry as seen by observability consumers.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyEntry {
    pub tool_name: String,
    pub context_hash: String,
    pub value: f64,
    pub visits: u64,
}

/// Per-tool aggregate over every context the tool has been tried in.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyAggregate {
    pub tool_name: String,
    pub contexts: u64,
    pub total_visits: u64,
    pub mean_value: f64,
    pub max_value: f64,
}

/// Result of a single Q-learning update.
#[derive(Debug, Clone, Copy)]
pub struct UpdateOutcome {
    pub old_value: f64,
    pub new_value: f64,
    pub visits: u64,
    /// `reward + gamma * best_next_value - old_value`
    pub td_error: f64,
}

/// Persistent mapping (tool, context) -> (value estimate, visit count).
///
/// Updates run as a single UPSERT while holding the connection lock, so
/// concurrent read-modify-write cycles on one key cannot lose increments:
/// N updates always leave visit_count at exactly N. Aggregation reads are
/// served from an in-memory write-through cache and never touch the write
/// path.
#[derive(Debug)]
pub struct PolicyStore {
    db: DbConnection,
    /// tool_name -> context_hash -> (value, visits)
    cache: RwLock<HashMap<String, HashMap<String, (f64, u64)>>>,
}

impl PolicyStore {
    /// Open a store over an initialized database, warming the read cache.
    pub fn new(db: DbConnection) -> PilotResult<Self> {
        let store = Self {
            db,
            cache: RwLock::new(HashMap::new()),
        };
        store.warm_cache()?;
        Ok(store)
    }

    fn warm_cache(&self) -> PilotResult<()> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tool_name, context_hash, action_value, visit_count FROM rl_policy",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, u64>(3)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut cache = self.cache.write().unwrap();
        for (tool, context, value, visits) in rows {
            cache
                .entry(tool)
                .or_default()
                .insert(context, (value, visits));
        }
        debug!("Warmed policy cache ({} tools)", cache.len());
        Ok(())
    }

    /// Current (value, visits) for a key; (0.0, 0) when the key is unseen.
    pub fn lookup(&self, tool_name: &str, context_hash: &str) -> (f64, u64) {
        let cache = self.cache.read().unwrap();
        cache
            .get(tool_name)
            .and_then(|contexts| contexts.get(context_hash))
            .copied()
            .unwrap_or((0.0, 0))
    }

    /// Apply one Q-learning update:
    ///
    /// `Q_new = Q_old + alpha * (reward + gamma * best_next_value - Q_old)`
    ///
    /// and increment the visit count.
    pub fn update(
        &self,
        tool_name: &str,
        context_hash: &str,
        reward: f64,
        alpha: f64,
        gamma: f64,
        best_next_value: f64,
    ) -> PilotResult<UpdateOutcome> {
        let target = reward + gamma * best_next_value;
        let now = Utc::now().to_rfc3339();

        let (old_value, new_value, visits) = self.db.with_conn(|conn| {
            let old_value: f64 = conn
                .query_row(
                    "SELECT action_value FROM rl_policy
                     WHERE tool_name = ?1 AND context_hash = ?2",
                    params![tool_name, context_hash],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0.0);

            conn.execute(
                "INSERT INTO rl_policy (tool_name, context_hash, action_value, visit_count, last_updated)
                 VALUES (?1, ?2, ?3 * ?4, 1, ?5)
                 ON CONFLICT (tool_name, context_hash) DO UPDATE SET
                     action_value = action_value + ?3 * (?4 - action_value),
                     visit_count = visit_count + 1,
                     last_updated = ?5",
                params![tool_name, context_hash, alpha, target, now],
            )?;

            conn.query_row(
                "SELECT action_value, visit_count FROM rl_policy
                 WHERE tool_name = ?1 AND context_hash = ?2",
                params![tool_name, context_hash],
                |row| Ok((old_value, row.get::<_, f64>(0)?, row.get::<_, u64>(1)?)),
            )
        })?;

        {
            let mut cache = self.cache.write().unwrap();
            cache
                .entry(tool_name.to_string())
                .or_default()
                .insert(context_hash.to_string(), (new_value, visits));
        }

        debug!(
            "Policy update for {}: {:.3} -> {:.3} (visit {})",
            tool_name, old_value, new_value, visits
        );

        Ok(UpdateOutcome {
            old_value,
            new_value,
            visits,
            td_error: target - old_value,
        })
    }

    /// Max stored value over the given tools for a context, floored at zero
    /// for unseen keys.
    pub fn max_value(&self, context_hash: &str, tools: &[String]) -> f64 {
        tools
            .iter()
            .map(|tool| self.lookup(tool, context_hash).0)
            .fold(0.0, f64::max)
    }

    /// Highest-valued entries, for dashboards. Served from the read cache.
    pub fn top_policies(&self, limit: usize) -> Vec<PolicyEntry> {
        let cache = self.cache.read().unwrap();
        let mut entries: Vec<PolicyEntry> = cache
            .iter()
            .flat_map(|(tool, contexts)| {
                contexts.iter().map(|(context, &(value, visits))| PolicyEntry {
                    tool_name: tool.clone(),
                    context_hash: context.clone(),
                    value,
                    visits,
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            b.value
                .partial_cmp(&a.value)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.visits.cmp(&a.visits))
                .then_with(|| a.tool_name.cmp(&b.tool_name))
        });
        entries.truncate(limit);
        entries
    }

    /// Every entry, ordered by tool name then context. Served from the read
    /// cache.
    pub fn snapshot(&self) -> Vec<PolicyEntry> {
        let cache = self.cache.read().unwrap();
        let mut entries: Vec<PolicyEntry> = cache
            .iter()
            .flat_map(|(tool, contexts)| {
                contexts.iter().map(|(context, &(value, visits))| PolicyEntry {
                    tool_name: tool.clone(),
                    context_hash: context.clone(),
                    value,
                    visits,
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.tool_name
                .cmp(&b.tool_name)
                .then_with(|| a.context_hash.cmp(&b.context_hash))
        });
        entries
    }

    /// Aggregate view of one tool across every context it has been tried in.
    pub fn aggregate(&self, tool_name: &str) -> Option<PolicyAggregate> {
        let cache = self.cache.read().unwrap();
        let contexts = cache.get(tool_name)?;
        if contexts.is_empty() {
            return None;
        }

        let mut total_visits = 0;
        let mut sum = 0.0;
        let mut max = f64::NEG_INFINITY;
        for &(value, visits) in contexts.values() {
            total_visits += visits;
            sum += value;
            max = max.max(value);
        }
        Some(PolicyAggregate {
            tool_name: tool_name.to_string(),
            contexts: contexts.len() as u64,
            total_visits,
            mean_value: sum / contexts.len() as f64,
            max_value: max,
        })
    }

    /// Number of distinct (tool, context) entries.
    pub fn len(&self) -> usize {
        let cache = self.cache.read().unwrap();
        cache.values().map(|contexts| contexts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
