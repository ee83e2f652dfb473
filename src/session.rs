//! # Interview Sessions
//!
//! A session is the persisted interview: job description, interview type and the
//! full turn history. It outlives any single voice connection, so a client can
//! drop and reconnect to the same session id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Interview type used when a client does not specify one.
pub const DEFAULT_INTERVIEW_TYPE: &str = "behavioral";

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub job_description: String,
    pub interview_type: String,
    pub history: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_completed: bool,
}

impl Session {
    pub fn new(job_description: impl Into<String>, interview_type: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            job_description: job_description.into(),
            interview_type: interview_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_INTERVIEW_TYPE.to_string()),
            history: Vec::new(),
            created_at: now,
            last_activity: now,
            is_completed: false,
        }
    }

    /// Number of questions the interviewer has asked so far.
    pub fn questions_asked(&self) -> usize {
        self.history.iter().filter(|t| t.role == Role::Assistant).count()
    }
}

/// Aggregate counters reported by a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub completed: usize,
}

/// Persisted session storage, independent of any voice connection.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, job_description: String, interview_type: Option<String>) -> Session;

    /// Look up a session and refresh its `last_activity`.
    async fn get(&self, session_id: &str) -> Option<Session>;

    /// Replace the stored copy. Returns false if the session no longer exists.
    async fn update(&self, session: Session) -> bool;

    async fn delete(&self, session_id: &str) -> bool;

    async fn stats(&self) -> SessionStats;
}

/// Process-local session storage.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, job_description: String, interview_type: Option<String>) -> Session {
        let session = Session::new(job_description, interview_type);
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session.clone());
        tracing::info!(session_id = %session.session_id, "Created interview session");
        session
    }

    async fn get(&self, session_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id)?;
        session.last_activity = Utc::now();
        Some(session.clone())
    }

    async fn update(&self, mut session: Session) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.session_id) {
            Some(slot) => {
                session.last_activity = Utc::now();
                *slot = session;
                true
            }
            None => false,
        }
    }

    async fn delete(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            tracing::info!(session_id = %session_id, "Deleted interview session");
        }
        removed
    }

    async fn stats(&self) -> SessionStats {
        let sessions = self.sessions.read().await;
        SessionStats {
            total: sessions.len(),
            completed: sessions.values().filter(|s| s.is_completed).count(),
        }
    }
}
