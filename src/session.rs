//! Session store: process-wide registry of live sessions.
//!
//! Every read and write on a single session is serialized through that
//! session's own mutex; the outer map mutex only guards structural
//! changes (insert / remove), so a reap never blocks a concurrent
//! `transition` on an unrelated session.

use crate::error::{Result, VoxturnError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque conversation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one turn's generation. Minted fresh every time the engine
/// begins generating a reply; any artifact carrying a stale id is obsolete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseId(pub Uuid);

impl ResponseId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResponseId {
    fn default() -> Self {
        Self::new()
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Listening,
    Processing,
    Speaking,
    Interrupted,
}

impl SessionState {
    /// Whether transitioning from `self` to `next` is reachable:
    /// `interrupted` only from `processing`/`speaking`; `speaking` only
    /// from `processing`; `processing` only from `listening` or (after
    /// wake) `interrupted`.
    #[must_use]
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::{Idle, Interrupted, Listening, Processing, Speaking};
        match next {
            Interrupted => matches!(self, Processing | Speaking),
            Speaking => matches!(self, Processing),
            Processing => matches!(self, Listening | Interrupted | Idle),
            Listening => matches!(self, Idle | Listening | Interrupted),
            Idle => true,
        }
    }
}

/// A live conversational session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub conversation_id: ConversationId,
    pub state: SessionState,
    pub started_at: Instant,
    pub last_activity_at: Instant,
    /// The generation currently in flight for this session, if any.
    pub active_response_id: Option<ResponseId>,
}

impl Session {
    fn new(id: SessionId, conversation_id: ConversationId) -> Self {
        let now = Instant::now();
        Self {
            id,
            conversation_id,
            state: SessionState::Idle,
            started_at: now,
            last_activity_at: now,
            active_response_id: None,
        }
    }

    /// Update `last_activity_at`. Called on every state transition and
    /// every inbound audio frame.
    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    /// Transition to `next`, validating reachability. Always updates
    /// `last_activity_at` on success.
    fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.touch();
        true
    }

    /// Mint a fresh response id and install it as the active one,
    /// invalidating any previously active id: at most one response is
    /// ever live for a session.
    pub fn begin_response(&mut self) -> ResponseId {
        let id = ResponseId::new();
        self.active_response_id = Some(id);
        id
    }

    /// Whether `id` is still the session's current active response.
    #[must_use]
    pub fn is_active_response(&self, id: ResponseId) -> bool {
        self.active_response_id == Some(id)
    }
}

type SessionHandle = Arc<Mutex<Session>>;

/// Process-wide registry of live sessions.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new session (and its owning conversation id), `state = idle`.
    pub async fn create(&self) -> SessionHandle {
        let id = SessionId::new();
        let conversation_id = ConversationId::new();
        let session = Arc::new(Mutex::new(Session::new(id, conversation_id)));
        self.sessions.lock().await.insert(id, Arc::clone(&session));
        session
    }

    /// Look up a session handle by id.
    pub async fn get(&self, id: SessionId) -> Result<SessionHandle> {
        self.sessions
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(VoxturnError::SessionNotFound(id))
    }

    /// Transition a session to `next`, updating `last_activity_at`.
    ///
    /// Returns `Ok(false)` (not an error) if the transition is invalid per
    /// the state-reachability invariant.
    pub async fn transition(&self, id: SessionId, next: SessionState) -> Result<bool> {
        let handle = self.get(id).await?;
        let mut session = handle.lock().await;
        Ok(session.transition(next))
    }

    /// Interrupt a session. Transitions to `interrupted` only when the
    /// session is `processing` or `speaking`; otherwise returns `false`
    /// without emitting anything — idempotent when already `interrupted`.
    pub async fn interrupt(&self, id: SessionId) -> Result<bool> {
        let handle = self.get(id).await?;
        let mut session = handle.lock().await;
        if !matches!(session.state, SessionState::Processing | SessionState::Speaking) {
            return Ok(false);
        }
        let was_speaking = session.state == SessionState::Speaking;
        session.transition(SessionState::Interrupted);
        // Invalidate in-flight work regardless of whether it was speaking.
        session.active_response_id = None;
        Ok(was_speaking || true)
    }

    /// Remove a session from the store (transport detach, or reap).
    pub async fn end(&self, id: SessionId) {
        self.sessions.lock().await.remove(&id);
    }

    /// End every session whose `last_activity_at` is older than `older_than`
    /// ago. Takes a global snapshot of session handles, then checks each
    /// without holding the outer map lock.
    pub async fn reap(&self, older_than: Duration) -> Vec<SessionId> {
        let snapshot: Vec<(SessionId, SessionHandle)> = {
            let guard = self.sessions.lock().await;
            guard.iter().map(|(id, h)| (*id, Arc::clone(h))).collect()
        };

        let mut stale = Vec::new();
        for (id, handle) in snapshot {
            let is_stale = {
                let session = handle.lock().await;
                session.last_activity_at.elapsed() > older_than
            };
            if is_stale {
                stale.push(id);
            }
        }

        for id in &stale {
            self.end(*id).await;
        }
        stale
    }

    /// Number of live sessions currently tracked.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
