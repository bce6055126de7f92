//! Session and checkpoint persistence under a configured state directory.
//!
//! Structurally modeled on the teacher's `io/run_state.rs` (atomic
//! load/write of one small JSON record) and `io/init.rs` (a `Paths` bundle
//! computed once from a root directory). Every session gets its own
//! subdirectory so checkpoints, the context log, and the event log don't
//! collide across concurrent sessions sharing one state directory.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::session::{Checkpoint, Session};
use crate::core::supervisor::Assessment;

/// Filesystem layout for one session's persisted state.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub session_dir: PathBuf,
    pub session_path: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub events_path: PathBuf,
}

impl SessionPaths {
    pub fn new(state_dir: &Path, session_id: &str) -> Self {
        let session_dir = state_dir.join("sessions").join(session_id);
        Self {
            session_path: session_dir.join("session.json"),
            checkpoints_dir: session_dir.join("checkpoints"),
            events_path: session_dir.join("events.jsonl"),
            session_dir,
        }
    }

    pub fn checkpoint_path(&self, after_step: &str) -> PathBuf {
        self.checkpoints_dir.join(format!("{after_step}.json"))
    }
}

/// A cached prompt/result pair, expiring after `ttl`.
struct CacheEntry<V> {
    value: V,
    inserted_at: std::time::Instant,
}

/// Bounded, TTL-expiring cache used for both the Supervisor's assessment
/// cache and the prompt-to-result cache. Generic over the cached value so
/// one implementation serves both call sites.
///
/// Eviction is FIFO-by-insertion over a capacity bound, not true LRU —
/// `order` only ever grows at the back and shrinks at the front, so a
/// `get` never reorders it. That's the right tradeoff here: both call
/// sites are short-TTL caches where entries age out long before capacity
/// pressure would matter.
pub struct TtlCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        let expired = self.entries.get(key).is_some_and(|entry| entry.inserted_at.elapsed() >= self.ttl);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn put(&mut self, key: String, value: V) {
        if !self.entries.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: std::time::Instant::now(),
            },
        );
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Summary record returned by [`StatePersistence::list_sessions`] — enough
/// to let a caller pick a session to resume without loading every full
/// session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub goal: String,
    pub status: String,
    pub updated_at_millis: u64,
}

/// Owns the on-disk layout for all sessions under one state directory, plus
/// the in-memory caches that sit in front of expensive recomputation.
pub struct StatePersistence {
    state_dir: PathBuf,
    checkpoint_retention: usize,
}

impl StatePersistence {
    pub fn new(state_dir: impl Into<PathBuf>, checkpoint_retention: usize) -> Self {
        Self {
            state_dir: state_dir.into(),
            checkpoint_retention,
        }
    }

    /// Create the state directory tree if it doesn't already exist.
    pub fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir).with_context(|| format!("create state dir {}", self.state_dir.display()))?;
        fs::create_dir_all(self.state_dir.join("sessions")).context("create sessions dir")?;
        Ok(())
    }

    pub fn paths(&self, session_id: &str) -> SessionPaths {
        SessionPaths::new(&self.state_dir, session_id)
    }

    pub fn events_path(&self, session_id: &str) -> PathBuf {
        self.paths(session_id).events_path
    }

    /// Persist a brand-new session record.
    pub fn start_session(&self, session: &Session) -> Result<()> {
        let paths = self.paths(&session.session_id);
        fs::create_dir_all(&paths.session_dir).with_context(|| format!("create session dir {}", paths.session_dir.display()))?;
        fs::create_dir_all(&paths.checkpoints_dir).context("create checkpoints dir")?;
        self.write_session(session)
    }

    pub fn write_session(&self, session: &Session) -> Result<()> {
        let paths = self.paths(&session.session_id);
        let mut buf = serde_json::to_string_pretty(session).context("serialize session")?;
        buf.push('\n');
        write_atomic(&paths.session_path, &buf, "json")
    }

    pub fn load_session(&self, session_id: &str) -> Result<Session> {
        let paths = self.paths(session_id);
        let contents = fs::read_to_string(&paths.session_path).with_context(|| format!("read session {}", paths.session_path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse session {}", paths.session_path.display()))
    }

    /// Freeze the session's plan and metrics as a checkpoint keyed by the
    /// step number just completed, then prune checkpoints beyond the
    /// configured retention count (oldest first, by filename sort order —
    /// step numbers are zero-padded upstream so lexical order matches
    /// completion order).
    pub fn create_checkpoint(&self, session: &Session, after_step: &str, now_millis: u64) -> Result<()> {
        let plan = session.plan.clone().context("cannot checkpoint a session with no plan")?;
        let checkpoint = Checkpoint {
            session_id: session.session_id.clone(),
            after_step: after_step.to_string(),
            plan,
            metrics: session.metrics,
            created_at_millis: now_millis,
        };
        let paths = self.paths(&session.session_id);
        fs::create_dir_all(&paths.checkpoints_dir).context("create checkpoints dir")?;
        let mut buf = serde_json::to_string_pretty(&checkpoint).context("serialize checkpoint")?;
        buf.push('\n');
        write_atomic(&paths.checkpoint_path(after_step), &buf, "json")?;
        self.prune_checkpoints(&paths)
    }

    fn prune_checkpoints(&self, paths: &SessionPaths) -> Result<()> {
        let mut entries: Vec<PathBuf> = fs::read_dir(&paths.checkpoints_dir)
            .with_context(|| format!("read checkpoints dir {}", paths.checkpoints_dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        entries.sort();
        if entries.len() > self.checkpoint_retention {
            let excess = entries.len() - self.checkpoint_retention;
            for stale in &entries[..excess] {
                fs::remove_file(stale).with_context(|| format!("remove stale checkpoint {}", stale.display()))?;
            }
        }
        Ok(())
    }

    pub fn restore_checkpoint(&self, session_id: &str, after_step: &str) -> Result<Checkpoint> {
        let path = self.paths(session_id).checkpoint_path(after_step);
        let contents = fs::read_to_string(&path).with_context(|| format!("read checkpoint {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse checkpoint {}", path.display()))
    }

    /// Most recent checkpoint for a session, if any exist.
    pub fn latest_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let paths = self.paths(session_id);
        if !paths.checkpoints_dir.exists() {
            return Ok(None);
        }
        let mut entries: Vec<PathBuf> = fs::read_dir(&paths.checkpoints_dir)
            .with_context(|| format!("read checkpoints dir {}", paths.checkpoints_dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        entries.sort();
        match entries.last() {
            None => Ok(None),
            Some(path) => {
                let contents = fs::read_to_string(path).with_context(|| format!("read checkpoint {}", path.display()))?;
                Ok(Some(serde_json::from_str(&contents).with_context(|| format!("parse checkpoint {}", path.display()))?))
            }
        }
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let sessions_dir = self.state_dir.join("sessions");
        if !sessions_dir.exists() {
            return Ok(Vec::new());
        }
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&sessions_dir).with_context(|| format!("read sessions dir {}", sessions_dir.display()))? {
            let entry = entry.context("read session dir entry")?;
            let session_path = entry.path().join("session.json");
            if !session_path.exists() {
                continue;
            }
            let contents = fs::read_to_string(&session_path).with_context(|| format!("read {}", session_path.display()))?;
            let session: Session = serde_json::from_str(&contents).with_context(|| format!("parse {}", session_path.display()))?;
            summaries.push(SessionSummary {
                session_id: session.session_id,
                goal: session.goal,
                status: format!("{:?}", session.status).to_lowercase(),
                updated_at_millis: session.updated_at_millis,
            });
        }
        summaries.sort_by(|a, b| b.updated_at_millis.cmp(&a.updated_at_millis));
        Ok(summaries)
    }

    /// The most recently updated non-terminal session for `goal` whose
    /// `updated_at_millis` is within `window` of `now_millis`, if any.
    /// `list_sessions` is already sorted newest-first, so the first match
    /// is the one to return.
    pub fn get_resumable_session(&self, goal: &str, now_millis: u64, window: Duration) -> Result<Option<Session>> {
        let cutoff = now_millis.saturating_sub(window.as_millis() as u64);
        for summary in self.list_sessions()? {
            if summary.goal != goal || summary.updated_at_millis < cutoff {
                continue;
            }
            let session = self.load_session(&summary.session_id)?;
            if session.is_resumable() {
                return Ok(Some(session));
            }
        }
        Ok(None)
    }

    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        let paths = self.paths(session_id);
        if paths.session_dir.exists() {
            fs::remove_dir_all(&paths.session_dir).with_context(|| format!("remove session dir {}", paths.session_dir.display()))?;
        }
        Ok(())
    }

    /// Delete every terminal session whose `updated_at_millis` is older
    /// than `retention` relative to `now_millis`. Returns the deleted ids.
    pub fn cleanup_old_sessions(&self, retention: Duration, now_millis: u64) -> Result<Vec<String>> {
        let cutoff = now_millis.saturating_sub(retention.as_millis() as u64);
        let mut deleted = Vec::new();
        for summary in self.list_sessions()? {
            if summary.updated_at_millis >= cutoff {
                continue;
            }
            let session = self.load_session(&summary.session_id)?;
            if session.status.is_terminal() {
                self.delete_session(&summary.session_id)?;
                deleted.push(summary.session_id);
            }
        }
        Ok(deleted)
    }
}

fn write_atomic(path: &Path, contents: &str, ext: &str) -> Result<()> {
    let parent = path.parent().with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension(format!("{ext}.tmp"));
    fs::write(&tmp_path, contents).with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace file {}", path.display()))?;
    Ok(())
}

/// Keyed bundle of the two caches `StatePersistence` callers reach for:
/// the assessment cache (Supervisor CONTINUE results) and the
/// prompt-to-result cache, both bounded and TTL-expiring.
pub struct SessionCaches {
    pub assessment: TtlCache<Assessment>,
    pub prompt_result: TtlCache<String>,
}

impl SessionCaches {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            assessment: TtlCache::new(capacity, ttl),
            prompt_result: TtlCache::new(capacity, ttl),
        }
    }
}

/// Registry of per-session caches, so one long-lived process can serve
/// several sessions without cross-contaminating their cache entries.
#[derive(Default)]
pub struct CacheRegistry {
    by_session: HashMap<String, SessionCaches>,
}

impl CacheRegistry {
    pub fn get_or_insert(&mut self, session_id: &str, capacity: usize, ttl: Duration) -> &mut SessionCaches {
        self.by_session.entry(session_id.to_string()).or_insert_with(|| SessionCaches::new(capacity, ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::Session;
    use crate::core::types::Plan;

    fn sample_plan() -> Plan {
        Plan {
            analysis: "analysis".to_string(),
            steps: Vec::new(),
            next_sequence: 1,
        }
    }

    #[test]
    fn start_then_load_session_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let persistence = StatePersistence::new(temp.path(), 5);
        persistence.initialize().expect("initialize");

        let session = Session::new("sess-1", "build a thing", "/workdir", 1000);
        persistence.start_session(&session).expect("start session");

        let loaded = persistence.load_session("sess-1").expect("load session");
        assert_eq!(loaded.goal, "build a thing");
        assert_eq!(loaded.session_id, "sess-1");
    }

    #[test]
    fn checkpoint_round_trips_and_prunes_beyond_retention() {
        let temp = tempfile::tempdir().expect("tempdir");
        let persistence = StatePersistence::new(temp.path(), 2);
        persistence.initialize().expect("initialize");

        let mut session = Session::new("sess-2", "goal", "/workdir", 1000);
        session.plan = Some(sample_plan());
        persistence.start_session(&session).expect("start session");

        for step in ["1", "2", "3"] {
            persistence.create_checkpoint(&session, step, 2000).expect("checkpoint");
        }

        let paths = persistence.paths("sess-2");
        let remaining: Vec<_> = fs::read_dir(&paths.checkpoints_dir).expect("read dir").filter_map(|e| e.ok()).collect();
        assert_eq!(remaining.len(), 2, "oldest checkpoint should have been pruned");

        let restored = persistence.restore_checkpoint("sess-2", "3").expect("restore");
        assert_eq!(restored.after_step, "3");
    }

    #[test]
    fn list_sessions_orders_by_most_recently_updated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let persistence = StatePersistence::new(temp.path(), 5);
        persistence.initialize().expect("initialize");

        let mut older = Session::new("older", "goal a", "/workdir", 1000);
        older.updated_at_millis = 1000;
        persistence.start_session(&older).expect("start");

        let mut newer = Session::new("newer", "goal b", "/workdir", 2000);
        newer.updated_at_millis = 2000;
        persistence.start_session(&newer).expect("start");

        let sessions = persistence.list_sessions().expect("list");
        assert_eq!(sessions[0].session_id, "newer");
        assert_eq!(sessions[1].session_id, "older");
    }

    #[test]
    fn get_resumable_session_skips_terminal_sessions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let persistence = StatePersistence::new(temp.path(), 5);
        persistence.initialize().expect("initialize");

        let mut done = Session::new("done", "goal a", "/workdir", 1000);
        done.status = crate::core::session::SessionStatus::Completed;
        done.updated_at_millis = 2000;
        persistence.start_session(&done).expect("start");

        let mut running = Session::new("running", "goal b", "/workdir", 1000);
        running.updated_at_millis = 1000;
        persistence.start_session(&running).expect("start");

        let resumable = persistence
            .get_resumable_session("goal b", 1000, Duration::from_secs(24 * 3600))
            .expect("get resumable")
            .expect("some session");
        assert_eq!(resumable.session_id, "running");
    }

    #[test]
    fn get_resumable_session_ignores_a_different_goal_and_stale_updates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let persistence = StatePersistence::new(temp.path(), 5);
        persistence.initialize().expect("initialize");

        let mut other_goal = Session::new("other", "some other goal", "/workdir", 1000);
        other_goal.updated_at_millis = 1000;
        persistence.start_session(&other_goal).expect("start");

        let mut stale = Session::new("stale", "goal b", "/workdir", 1000);
        stale.updated_at_millis = 1000;
        persistence.start_session(&stale).expect("start");

        let day_ms = 24 * 3600 * 1000;
        let now = 1000 + day_ms + 1;
        let resumable = persistence
            .get_resumable_session("goal b", now, Duration::from_millis(day_ms))
            .expect("get resumable");
        assert!(resumable.is_none(), "session outside the 24h window must not be returned");

        let resumable = persistence
            .get_resumable_session("goal b", 1000, Duration::from_millis(day_ms))
            .expect("get resumable")
            .expect("some session");
        assert_eq!(resumable.session_id, "stale");
    }

    #[test]
    fn cleanup_old_sessions_deletes_only_terminal_and_stale() {
        let temp = tempfile::tempdir().expect("tempdir");
        let persistence = StatePersistence::new(temp.path(), 5);
        persistence.initialize().expect("initialize");

        let mut stale_done = Session::new("stale-done", "goal", "/workdir", 100);
        stale_done.status = crate::core::session::SessionStatus::Completed;
        stale_done.updated_at_millis = 100;
        persistence.start_session(&stale_done).expect("start");

        let mut stale_running = Session::new("stale-running", "goal", "/workdir", 100);
        stale_running.updated_at_millis = 100;
        persistence.start_session(&stale_running).expect("start");

        let deleted = persistence.cleanup_old_sessions(Duration::from_millis(50), 1000).expect("cleanup");
        assert_eq!(deleted, vec!["stale-done".to_string()]);
        assert!(persistence.load_session("stale-running").is_ok());
    }

    #[test]
    fn ttl_cache_expires_entries() {
        let mut cache: TtlCache<String> = TtlCache::new(4, Duration::from_millis(10));
        cache.put("key".to_string(), "value".to_string());
        assert_eq!(cache.get("key"), Some("value".to_string()));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("key"), None);
    }
}
