//! Per-source conversation session tracking.
//!
//! A [`Session`] accumulates the turn history the [`crate::conversation`]
//! analyser scores multi-turn attacks against. [`SessionStore`] is a
//! TTL-and-capacity-bounded map with one `tokio::sync::Mutex` per session —
//! spec.md §5's "simplest correct design" guidance — so that turn-append and
//! analyser reads on the *same* session serialise, while unrelated sessions
//! never contend with each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Outcome of a single conversation turn, recorded for later analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// The turn completed successfully.
    Success,
    /// The turn was blocked by a scanner, policy, or conversation analysis.
    Blocked,
    /// The turn was refused for a non-security reason.
    Refused,
    /// The turn failed with an error.
    Error,
}

/// A single recorded turn of a [`Session`]'s history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// The raw text of the request.
    pub request_text: String,
    /// How the turn was resolved.
    pub result_status: TurnStatus,
    /// When the turn was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Per-source-key multi-turn state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Stable identifier, derived from `source_key` or `ephemeral-<uuid>`.
    pub session_id: String,
    /// Free-form origin label (usually the same as `source_key`).
    pub source: String,
    /// Append-only turn history, in receipt order.
    pub turns: Vec<ConversationTurn>,
    /// Count of non-success turns recorded.
    pub violation_count: u32,
    /// Decayed-forward risk score carried across turns.
    pub cumulative_risk: f64,
    /// Once set, the session rejects all further requests. Final.
    pub is_locked: bool,
    /// Timestamp of the most recent activity.
    pub last_active: DateTime<Utc>,
}

impl Session {
    fn new(session_id: String, source: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            source,
            turns: Vec::new(),
            violation_count: 0,
            cumulative_risk: 0.0,
            is_locked: false,
            last_active: now,
        }
    }

    /// Append a turn, updating `violation_count` and `last_active`.
    /// `is_locked` is never reset once `true` — the lock is final per
    /// spec.md §4.7's invariant.
    pub fn record_turn(&mut self, request_text: impl Into<String>, status: TurnStatus) {
        if status != TurnStatus::Success {
            self.violation_count += 1;
        }
        self.turns.push(ConversationTurn {
            request_text: request_text.into(),
            result_status: status,
            timestamp: Utc::now(),
        });
        self.last_active = Utc::now();
    }

    /// Mark the session locked. Final — callers must not attempt to unlock.
    pub fn lock(&mut self) {
        self.is_locked = true;
    }
}

#[cfg(test)]
impl Session {
    /// Construct a bare session for use in other modules' unit tests.
    pub(crate) fn new_for_test() -> Self {
        Self::new("test-session".to_string(), "test-source".to_string())
    }
}

struct Entry {
    session: Arc<AsyncMutex<Session>>,
    last_active: DateTime<Utc>,
}

struct StoreState {
    entries: HashMap<String, Entry>,
}

/// TTL-and-capacity-bounded session map.
pub struct SessionStore {
    state: StdMutex<StoreState>,
    ttl: ChronoDuration,
    max_count: usize,
}

impl SessionStore {
    /// Construct a store with the given TTL (seconds) and maximum tracked
    /// session count before LRU eviction.
    #[must_use]
    pub fn new(ttl_secs: u64, max_count: usize) -> Self {
        Self {
            state: StdMutex::new(StoreState {
                entries: HashMap::new(),
            }),
            ttl: ChronoDuration::seconds(ttl_secs as i64),
            max_count,
        }
    }

    /// Resolve the session for `source_key`, creating it if absent or
    /// TTL-expired. An absent or empty `source_key` always creates a fresh
    /// ephemeral session (never looked up by id).
    pub async fn get_or_create(&self, source_key: Option<&str>) -> Arc<AsyncMutex<Session>> {
        let Some(key) = source_key.filter(|k| !k.is_empty()) else {
            return self.create_ephemeral();
        };

        let now = Utc::now();
        let mut state = self.state.lock().expect("session store mutex poisoned");

        if let Some(entry) = state.entries.get_mut(key) {
            if now - entry.last_active < self.ttl {
                entry.last_active = now;
                return Arc::clone(&entry.session);
            }
            state.entries.remove(key);
        }

        let session = Arc::new(AsyncMutex::new(Session::new(key.to_string(), key.to_string())));
        Self::evict_if_needed(&mut state, self.max_count);
        state.entries.insert(
            key.to_string(),
            Entry {
                session: Arc::clone(&session),
                last_active: now,
            },
        );
        session
    }

    /// Look up an existing, non-expired session by `source_key`. Returns
    /// `None` without creating anything if absent or TTL-expired.
    pub async fn get(&self, source_key: &str) -> Option<Arc<AsyncMutex<Session>>> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("session store mutex poisoned");
        let entry = state.entries.get(source_key)?;
        if now - entry.last_active >= self.ttl {
            state.entries.remove(source_key);
            return None;
        }
        let session = Arc::clone(&state.entries.get_mut(source_key).unwrap().session);
        state.entries.get_mut(source_key).unwrap().last_active = now;
        Some(session)
    }

    fn create_ephemeral(&self) -> Arc<AsyncMutex<Session>> {
        let id = format!("ephemeral-{}", Uuid::new_v4());
        Arc::new(AsyncMutex::new(Session::new(id.clone(), id)))
    }

    fn evict_if_needed(state: &mut StoreState, max_count: usize) {
        while state.entries.len() >= max_count {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_active)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    state.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_same_session_on_repeat_access() {
        let store = SessionStore::new(3_600, 10);
        let a = store.get_or_create(Some("user-1")).await;
        let b = store.get_or_create(Some("user-1")).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn missing_source_key_creates_distinct_ephemeral_sessions() {
        let store = SessionStore::new(3_600, 10);
        let a = store.get_or_create(None).await;
        let b = store.get_or_create(None).await;
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_session() {
        let store = SessionStore::new(3_600, 10);
        assert!(store.get("never-seen").await.is_none());
    }

    #[tokio::test]
    async fn capacity_eviction_drops_least_recently_active() {
        let store = SessionStore::new(3_600, 2);
        store.get_or_create(Some("a")).await;
        store.get_or_create(Some("b")).await;
        store.get_or_create(Some("c")).await;
        assert!(store.get("a").await.is_none());
        assert!(store.get("b").await.is_some());
        assert!(store.get("c").await.is_some());
    }

    #[tokio::test]
    async fn record_turn_sets_violation_count_on_non_success() {
        let store = SessionStore::new(3_600, 10);
        let session = store.get_or_create(Some("user-2")).await;
        let mut guard = session.lock().await;
        guard.record_turn("hello", TurnStatus::Success);
        guard.record_turn("bad", TurnStatus::Blocked);
        assert_eq!(guard.violation_count, 1);
        assert_eq!(guard.turns.len(), 2);
    }

    #[tokio::test]
    async fn lock_is_final() {
        let store = SessionStore::new(3_600, 10);
        let session = store.get_or_create(Some("user-3")).await;
        let mut guard = session.lock().await;
        guard.lock();
        assert!(guard.is_locked);
    }
}
