//! In-memory conversation sessions.
//!
//! A session holds the recent turns of one conversation and an optional
//! provider override. Sessions live only in process memory and are evicted
//! lazily: store accesses sweep out sessions idle for longer than the
//! configured timeout, at most once per quarter of that timeout. A session
//! found idle on access starts over empty.
//!
//! Lock order is always map → session. While the map lock is held a session
//! lock is only ever tried, never waited on; a session locked elsewhere is in
//! use and survives the sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::adapter::ChatTurn;
use crate::config::SessionConfig;
use crate::router::task_classifier::TaskCategory;

/// One completed exchange.
#[derive(Debug, Clone, Serialize)]
pub struct SessionTurn {
    pub message: String,
    pub category: TaskCategory,
    pub provider_used: String,
    pub response_text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub turns: Vec<SessionTurn>,
    pub provider_override: Option<String>,
    pub created_at: DateTime<Utc>,
    last_activity: Instant,
}

impl Session {
    fn new(id: &str, now: Instant) -> Self {
        Self {
            id: id.to_string(),
            turns: Vec::new(),
            provider_override: None,
            created_at: Utc::now(),
            last_activity: now,
        }
    }

    fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= idle_timeout
    }

    fn reset(&mut self) {
        self.turns.clear();
        self.provider_override = None;
        self.created_at = Utc::now();
    }
}

#[derive(Debug)]
struct SessionMap {
    entries: HashMap<String, Arc<Mutex<Session>>>,
    last_sweep: Instant,
}

/// What the orchestrator needs from a session before answering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    pub provider_override: Option<String>,
    pub history: Vec<ChatTurn>,
}

/// Process-local session map.
#[derive(Debug)]
pub struct SessionStore {
    sessions: Mutex<SessionMap>,
    idle_timeout: Duration,
    sweep_interval: Duration,
    history_turns: usize,
    stored_turns: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        let idle_timeout = config.idle_timeout();
        Self {
            sessions: Mutex::new(SessionMap {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            idle_timeout,
            sweep_interval: idle_timeout / 4,
            history_turns: config.history_turns,
            stored_turns: config.stored_turns(),
        }
    }

    /// Fetch or create session `id`, marking it active.
    fn touch(&self, id: &str) -> Arc<Mutex<Session>> {
        let now = Instant::now();
        let mut sessions = lock(&self.sessions);
        if now.saturating_duration_since(sessions.last_sweep) >= self.sweep_interval {
            sessions.last_sweep = now;
            let idle_timeout = self.idle_timeout;
            let before = sessions.entries.len();
            sessions.entries.retain(|_, s| match s.try_lock() {
                Ok(session) => !session.is_idle(now, idle_timeout),
                Err(TryLockError::Poisoned(poisoned)) => {
                    !poisoned.into_inner().is_idle(now, idle_timeout)
                }
                Err(TryLockError::WouldBlock) => true,
            });
            let evicted = before - sessions.entries.len();
            if evicted > 0 {
                debug!(evicted, "evicted idle sessions");
            }
        }

        let session = sessions
            .entries
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(id, now))))
            .clone();
        drop(sessions);

        let mut guard = lock(&session);
        if guard.is_idle(now, self.idle_timeout) {
            debug!(session = id, "idle session restarted");
            guard.reset();
        }
        guard.last_activity = now;
        drop(guard);
        session
    }

    fn get(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        lock(&self.sessions).entries.get(id).cloned()
    }

    /// Resolve the session for a new request.
    ///
    /// `provider_override`, when given, replaces the stored override. The
    /// returned history holds at most the configured number of recent turns.
    pub fn prepare(&self, id: &str, provider_override: Option<&str>) -> SessionContext {
        let session = self.touch(id);
        let mut session = lock(&session);
        if let Some(provider) = provider_override {
            session.provider_override = Some(provider.to_string());
        }
        let skip = session.turns.len().saturating_sub(self.history_turns);
        SessionContext {
            provider_override: session.provider_override.clone(),
            history: session.turns[skip..]
                .iter()
                .map(|t| ChatTurn {
                    user: t.message.clone(),
                    assistant: t.response_text.clone(),
                })
                .collect(),
        }
    }

    pub fn append(&self, id: &str, turn: SessionTurn) {
        let session = self.touch(id);
        let mut session = lock(&session);
        session.turns.push(turn);
        let excess = session.turns.len().saturating_sub(self.stored_turns);
        if excess > 0 {
            session.turns.drain(..excess);
        }
    }

    pub fn clear_override(&self, id: &str) {
        let session = self.touch(id);
        lock(&session).provider_override = None;
    }

    /// Number of turns recorded for `id`, without touching the session.
    pub fn turn_count(&self, id: &str) -> usize {
        self.get(id).map(|s| lock(&s).turns.len()).unwrap_or(0)
    }

    /// Live sessions, without evicting.
    pub fn len(&self) -> usize {
        lock(&self.sessions).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
