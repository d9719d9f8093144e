//! Session TTL store, the only state that outlives a single request.
//!
//! Tracks last interaction per session and a cancellation flag; an eviction
//! sweep runs every `ttl / 2`. Cancelling a session stops its scheduler from
//! claiming further work; in-flight calls run into their own deadlines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

struct SessionEntry {
    last_interaction: Instant,
    cancelled: Arc<AtomicBool>,
}

pub struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record activity, creating the session on first touch. Returns the
    /// session's cancellation flag.
    pub fn touch(&self, session_id: &str) -> Arc<AtomicBool> {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                last_interaction: Instant::now(),
                cancelled: Arc::new(AtomicBool::new(false)),
            });
        entry.last_interaction = Instant::now();
        entry.cancelled.clone()
    }

    pub fn cancel(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(session_id) {
            Some(entry) => {
                info!(session_id, "session cancelled");
                entry.cancelled.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|entry| entry.cancelled.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    /// Drop sessions idle past the TTL. Cancelled flags of evicted sessions
    /// flip so any straggler tasks stand down.
    pub fn evict_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|session_id, entry| {
            let keep = entry.last_interaction.elapsed() < self.ttl;
            if !keep {
                debug!(session_id, "evicting idle session");
                entry.cancelled.store(true, Ordering::Relaxed);
            }
            keep
        });
        before - sessions.len()
    }

    /// Background sweep every `ttl / 2`.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        let interval = (store.ttl / 2).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let evicted = store.evict_expired();
                if evicted > 0 {
                    debug!(evicted, "session sweep");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_creates_and_refreshes() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.touch("s1");
        store.touch("s1");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn cancel_flags_are_shared() {
        let store = SessionStore::new(Duration::from_secs(60));
        let flag = store.touch("s1");
        assert!(!flag.load(Ordering::Relaxed));
        assert!(store.cancel("s1"));
        assert!(flag.load(Ordering::Relaxed));
        assert!(store.is_cancelled("s1"));
        assert!(!store.cancel("ghost"));
    }

    #[test]
    fn eviction_respects_ttl() {
        let store = SessionStore::new(Duration::from_millis(0));
        let flag = store.touch("s1");
        assert_eq!(store.evict_expired(), 1);
        assert!(store.is_empty());
        // Evicted sessions are treated as cancelled.
        assert!(flag.load(Ordering::Relaxed));
    }
}
