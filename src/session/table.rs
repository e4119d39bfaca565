//! Session table

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

/// A logical client conversation
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Tracks active sessions and expires idle ones
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a new session with an unguessable id
    pub fn create(&self) -> Session {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        let session_id = loop {
            let id = Uuid::new_v4().simple().to_string();
            if !sessions.contains_key(&id) {
                break id;
            }
        };
        let session = Session {
            session_id: session_id.clone(),
            created_at: now,
            last_seen_at: now,
        };
        sessions.insert(session_id, session.clone());
        session
    }

    /// Reuse a known session (refreshing it) or mint a new one. The flag is
    /// true when a session was created.
    pub fn ensure(&self, session_id: Option<&str>) -> (Session, bool) {
        if let Some(id) = session_id {
            let mut sessions = self.sessions.lock();
            if let Some(session) = sessions.get_mut(id) {
                session.last_seen_at = Utc::now();
                return (session.clone(), false);
            }
        }
        (self.create(), true)
    }

    /// Refresh `last_seen_at`; false when the session is unknown
    pub fn touch(&self, session_id: &str) -> bool {
        match self.sessions.lock().get_mut(session_id) {
            Some(session) => {
                session.last_seen_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn is_valid(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Remove a session; false when it was already gone
    pub fn close(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }

    /// Remove sessions idle for longer than `idle_timeout`, returning their ids
    pub fn sweep_expired(&self, idle_timeout: Duration) -> Vec<String> {
        self.sweep_expired_at(Utc::now(), idle_timeout)
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>, idle_timeout: Duration) -> Vec<String> {
        let Ok(idle) = chrono::Duration::from_std(idle_timeout) else {
            return Vec::new();
        };
        let mut expired = Vec::new();
        self.sessions.lock().retain(|id, session| {
            let keep = now - session.last_seen_at <= idle;
            if !keep {
                expired.push(id.clone());
            }
            keep
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
