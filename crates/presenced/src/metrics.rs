//! Latest per-session liveness metrics, shared between stream drivers and
//! the polling endpoint.
//!
//! Each stream publishes under its own session id. A user's most recent
//! session is indexed so a client that only knows its identity can poll
//! without passing the id back. Starting a new session for the same user
//! evicts the previous entry.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use presence_core::{Stage, Status, Step};
use serde::Serialize;
use uuid::Uuid;

pub type SessionId = Uuid;

/// One atomic view of a session's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub face_count: usize,
    pub status: String,
    /// 1 searching, 2 awaiting movement, 3 awaiting stillness, 4 confirmed.
    pub liveness_step: u8,
}

impl MetricsSnapshot {
    pub fn new(face_count: usize, status: &Status, stage: Stage) -> Self {
        Self {
            face_count,
            status: status.to_string(),
            liveness_step: stage.step(),
        }
    }

    /// Snapshot before any frame has been processed.
    pub fn starting() -> Self {
        Self::new(0, &Status::Starting, Stage::Searching)
    }

    pub fn from_step(step: &Step) -> Self {
        Self::new(step.face_count, &step.status, step.stage)
    }
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self::starting()
    }
}

struct Entry {
    user: String,
    snapshot: MetricsSnapshot,
}

#[derive(Default)]
struct Board {
    sessions: HashMap<SessionId, Entry>,
    latest_by_user: HashMap<String, SessionId>,
}

/// Shared metrics cell. The lock is held only to copy a snapshot in or out.
#[derive(Default)]
pub struct MetricsBoard {
    inner: Mutex<Board>,
}

impl MetricsBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session for `user` and reset its metrics.
    pub fn begin_session(&self, user: &str, session: SessionId) {
        let mut board = self.lock();
        if let Some(previous) = board.latest_by_user.insert(user.to_string(), session) {
            board.sessions.remove(&previous);
        }
        board.sessions.insert(
            session,
            Entry {
                user: user.to_string(),
                snapshot: MetricsSnapshot::starting(),
            },
        );
    }

    /// Replace the session's snapshot. Publishing for an evicted session is
    /// a no-op.
    pub fn publish(&self, session: SessionId, snapshot: MetricsSnapshot) {
        if let Some(entry) = self.lock().sessions.get_mut(&session) {
            entry.snapshot = snapshot;
        }
    }

    /// Latest snapshot for `session`, or the starting snapshot if unknown.
    pub fn read(&self, session: SessionId) -> MetricsSnapshot {
        self.lock()
            .sessions
            .get(&session)
            .map(|entry| entry.snapshot.clone())
            .unwrap_or_default()
    }

    /// Snapshot for `session`, only if it belongs to `user`.
    pub fn read_owned(&self, user: &str, session: SessionId) -> Option<MetricsSnapshot> {
        self.lock()
            .sessions
            .get(&session)
            .filter(|entry| entry.user == user)
            .map(|entry| entry.snapshot.clone())
    }

    /// Snapshot of the user's most recent session.
    pub fn read_for_user(&self, user: &str) -> MetricsSnapshot {
        self.session_for_user(user)
            .map(|session| self.read(session))
            .unwrap_or_default()
    }

    pub fn session_for_user(&self, user: &str) -> Option<SessionId> {
        self.lock().latest_by_user.get(user).copied()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Board> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
