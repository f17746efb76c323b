//! Temporal deduplication of retrieval results
//!
//! Per caller session: a call counter and, per item, when it was last shown.
//! A non-golden item shown within the last `window_calls` calls *and* within
//! `window_secs` is suppressed. Golden items are never suppressed.

use crate::config::DedupConfig;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Session used when the caller does not name one
pub const DEFAULT_SESSION: &str = "default";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ShownRecord {
    pub count: u32,
    pub last_call: u64,
    pub last_shown_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionState {
    call: u64,
    last_active: Option<DateTime<Utc>>,
    items: HashMap<String, ShownRecord>,
}

/// Outcome of filtering one ranked candidate list
#[derive(Debug)]
pub struct DedupOutcome<T> {
    pub kept: Vec<T>,
    pub suppressed: usize,
}

#[derive(Clone)]
pub struct DedupTracker {
    config: DedupConfig,
    sessions: Arc<Mutex<HashMap<String, SessionState>>>,
}

impl DedupTracker {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Filter `ranked` (best first), keeping at most `top_k` unsuppressed items.
    ///
    /// `key` yields an item's id and whether it is golden. Counts as one call
    /// for the session; only kept items refresh their record.
    pub fn filter<T>(
        &self,
        session: &str,
        ranked: Vec<T>,
        top_k: usize,
        key: impl Fn(&T) -> (&str, bool),
    ) -> DedupOutcome<T> {
        self.filter_at(session, Utc::now(), ranked, top_k, key)
    }

    pub fn filter_at<T>(
        &self,
        session: &str,
        now: DateTime<Utc>,
        ranked: Vec<T>,
        top_k: usize,
        key: impl Fn(&T) -> (&str, bool),
    ) -> DedupOutcome<T> {
        let window = Duration::seconds(self.config.window_secs);
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(session.to_string()).or_default();
        state.call += 1;
        state.last_active = Some(now);
        let call = state.call;

        let mut kept = Vec::with_capacity(top_k);
        let mut suppressed = 0;
        for item in ranked {
            if kept.len() >= top_k {
                break;
            }
            let (id, golden) = key(&item);
            let recent = state.items.get(id).is_some_and(|shown| {
                call - shown.last_call <= self.config.window_calls && now - shown.last_shown_at < window
            });
            if recent && !golden {
                suppressed += 1;
                continue;
            }
            let record = state.items.entry(id.to_string()).or_insert(ShownRecord {
                count: 0,
                last_call: call,
                last_shown_at: now,
            });
            record.count += 1;
            record.last_call = call;
            record.last_shown_at = now;
            kept.push(item);
        }

        if suppressed > 0 {
            debug!(session, call, suppressed, "suppressed recently shown items");
        }
        DedupOutcome { kept, suppressed }
    }

    pub fn shown(&self, session: &str, item_id: &str) -> Option<ShownRecord> {
        self.sessions
            .lock()
            .get(session)
            .and_then(|s| s.items.get(item_id).cloned())
    }

    /// Forget sessions idle for longer than `max_idle`; returns how many
    pub fn prune_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.last_active.is_some_and(|at| now - at <= max_idle));
        before - sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> DedupTracker {
        DedupTracker::new(DedupConfig {
            window_calls: 3,
            window_secs: 300,
        })
    }

    fn ids(items: &[(&'static str, bool)]) -> Vec<&'static str> {
        items.iter().map(|(id, _)| *id).collect()
    }

    #[test]
    fn test_non_golden_shown_once_golden_every_time() {
        let tracker = tracker();
        let now = Utc::now();
        let ranked = vec![("golden", true), ("plain", false)];

        let mut seen = Vec::new();
        for i in 0..3 {
            let out = tracker.filter_at("s1", now + Duration::seconds(i), ranked.clone(), 3, |x| (x.0, x.1));
            seen.push(ids(&out.kept));
        }
        assert_eq!(seen[0], vec!["golden", "plain"]);
        assert_eq!(seen[1], vec!["golden"]);
        assert_eq!(seen[2], vec!["golden"]);
        assert_eq!(tracker.shown("s1", "golden").unwrap().count, 3);
        assert_eq!(tracker.shown("s1", "plain").unwrap().count, 1);
    }

    #[test]
    fn test_suppressed_items_are_replaced_by_next_best() {
        let tracker = tracker();
        let now = Utc::now();
        let ranked = vec![("a", false), ("b", false), ("c", false)];

        let first = tracker.filter_at("s", now, ranked.clone(), 1, |x| (x.0, x.1));
        assert_eq!(ids(&first.kept), vec!["a"]);

        let second = tracker.filter_at("s", now, ranked, 1, |x| (x.0, x.1));
        assert_eq!(ids(&second.kept), vec!["b"]);
        assert_eq!(second.suppressed, 1);
    }

    #[test]
    fn test_window_expiry_by_calls_and_time() {
        let tracker = tracker();
        let now = Utc::now();
        let ranked = vec![("a", false)];

        tracker.filter_at("s", now, ranked.clone(), 3, |x| (x.0, x.1));
        // past the time window: shown again
        let later = now + Duration::seconds(301);
        let out = tracker.filter_at("s", later, ranked.clone(), 3, |x| (x.0, x.1));
        assert_eq!(out.kept.len(), 1);

        // calls 3..=5 are within 3 calls of call 2, call 6 is not
        for other in ["x", "y", "z"] {
            let out = tracker.filter_at("s", later, vec![(other, false)], 3, |x| (x.0, x.1));
            assert_eq!(out.suppressed, 0);
        }
        let out = tracker.filter_at("s", later, ranked, 3, |x| (x.0, x.1));
        assert_eq!(out.kept.len(), 1);
    }

    #[test]
    fn test_sessions_are_independent_and_prunable() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.filter_at("s1", now, vec![("a", false)], 3, |x| (x.0, x.1));
        let out = tracker.filter_at("s2", now, vec![("a", false)], 3, |x| (x.0, x.1));
        assert_eq!(out.kept.len(), 1);

        assert_eq!(tracker.session_count(), 2);
        assert_eq!(tracker.prune_idle(now + Duration::hours(2), Duration::hours(1)), 2);
        assert_eq!(tracker.session_count(), 0);
    }
}
