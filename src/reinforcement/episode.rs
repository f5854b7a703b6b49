// Session episode tracking: OPEN -> FINALIZED state machine
// One logical episode per session, persisted exactly once at finalization

use crate::error::{PilotError, PilotResult};
use crate::sql::DbConnection;
use crate::types::{Episode, SessionOutcome};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone)]
struct OpenEpisode {
    tool_sequence: Vec<String>,
    total_reward: f64,
}

type RawEpisodeRow = (String, f64, String, String, String);

const EPISODE_COLUMNS: &str =
    "session_id, episode_reward, tool_sequence, outcome, created_at";

/// Tracks one episode per session. Steps accumulate in memory while the
/// session is OPEN; `finalize` persists the snapshot and the episode becomes
/// a read-only historical record.
///
/// A single writer per session is assumed; concurrent mutation of the same
/// session is outside the contract and handled best-effort.
#[derive(Debug)]
pub struct EpisodeTracker {
    db: DbConnection,
    open: Mutex<HashMap<String, OpenEpisode>>,
}

impl EpisodeTracker {
    pub fn new(db: DbConnection) -> Self {
        Self {
            db,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Explicitly open a session. Opening an already-open session is a
    /// no-op; reopening a finalized session is rejected.
    pub fn begin(&self, session_id: &str) -> PilotResult<()> {
        if self.find_episode(session_id)?.is_some() {
            return Err(PilotError::session_finalized(session_id));
        }
        self.open
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default();
        Ok(())
    }

    /// Append one step to the session's in-progress sequence and accumulate
    /// its reward. Sessions open implicitly on their first step. Rejected
    /// once the session is finalized; the persisted episode is never
    /// touched.
    pub fn record_step(&self, session_id: &str, tool_name: &str, reward: f64) -> PilotResult<()> {
        if self.find_episode(session_id)?.is_some() {
            return Err(PilotError::session_finalized(session_id));
        }

        let mut open = self.open.lock().unwrap();
        let episode = open.entry(session_id.to_string()).or_default();
        episode.tool_sequence.push(tool_name.to_string());
        episode.total_reward += reward;
        debug!(
            "Recorded step {} for session {} (reward {:.2})",
            episode.tool_sequence.len(),
            session_id,
            reward
        );
        Ok(())
    }

    /// Finalize a session, persisting its episode snapshot.
    ///
    /// Repeated finalization returns the already-persisted episode
    /// unchanged: no error, no write. The boolean reports whether this call
    /// performed the OPEN -> FINALIZED transition.
    pub fn finalize(
        &self,
        session_id: &str,
        outcome: SessionOutcome,
    ) -> PilotResult<(Episode, bool)> {
        if let Some(existing) = self.find_episode(session_id)? {
            warn!(
                "Session {} already finalized; returning the persisted episode",
                session_id
            );
            return Ok((existing, false));
        }

        let state = self
            .open
            .lock()
            .unwrap()
            .remove(session_id)
            .ok_or_else(|| PilotError::unknown_session(session_id))?;

        let episode = Episode {
            session_id: session_id.to_string(),
            tool_sequence: state.tool_sequence,
            total_reward: state.total_reward,
            outcome,
            created_at: Utc::now(),
        };

        let sequence_json = serde_json::to_string(&episode.tool_sequence)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rl_episodes (session_id, episode_reward, tool_sequence, outcome, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    episode.session_id,
                    episode.total_reward,
                    sequence_json,
                    episode.outcome.as_str(),
                    episode.created_at.to_rfc3339(),
                ],
            )
        })?;

        debug!(
            "Finalized session {} ({} steps, reward {:.2}, outcome {})",
            session_id,
            episode.tool_sequence.len(),
            episode.total_reward,
            episode.outcome
        );
        Ok((episode, true))
    }

    /// The persisted episode for a session, if it has been finalized.
    pub fn find_episode(&self, session_id: &str) -> PilotResult<Option<Episode>> {
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM rl_episodes WHERE session_id = ?1 ORDER BY id LIMIT 1",
                    EPISODE_COLUMNS
                ),
                params![session_id],
                raw_episode_row,
            )
            .optional()
        })?;
        row.map(parse_episode).transpose()
    }

    /// Most recent episodes with outcome = success, optionally those whose
    /// sequence contains `tool_name`, newest first.
    pub fn successful_sequences(
        &self,
        tool_name: Option<&str>,
        limit: usize,
    ) -> PilotResult<Vec<Episode>> {
        // Over-fetch when filtering, as the tool filter applies post-hoc.
        let fetch = if tool_name.is_some() { limit * 2 } else { limit };

        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM rl_episodes WHERE outcome = 'success'
                 ORDER BY created_at DESC, id DESC LIMIT ?1",
                EPISODE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![fetch as i64], raw_episode_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut episodes = Vec::new();
        for raw in rows {
            let episode = parse_episode(raw)?;
            if let Some(tool) = tool_name {
                if !episode.tool_sequence.iter().any(|t| t == tool) {
                    continue;
                }
            }
            episodes.push(episode);
            if episodes.len() == limit {
                break;
            }
        }
        Ok(episodes)
    }

    /// In-progress tool sequence of an OPEN session.
    pub fn open_sequence(&self, session_id: &str) -> Option<Vec<String>> {
        let open = self.open.lock().unwrap();
        open.get(session_id).map(|e| e.tool_sequence.clone())
    }

    /// Number of sessions currently OPEN.
    pub fn open_sessions(&self) -> usize {
        self.open.lock().unwrap().len()
    }
}

fn raw_episode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEpisodeRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn parse_episode(raw: RawEpisodeRow) -> PilotResult<Episode> {
    let (session_id, total_reward, sequence_json, outcome, created_at) = raw;
    Ok(Episode {
        session_id,
        tool_sequence: serde_json::from_str(&sequence_json)?,
        total_reward,
        outcome: outcome.parse()?,
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .map_err(|e| PilotError::other(format!("bad episode timestamp: {}", e)))?,
    })
}
