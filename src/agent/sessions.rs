//! Session registry binding one conversation to one sandbox
//!
//! Every session owns its history, its in-flight turn and (through the
//! sandbox manager) its sandbox. Sessions are created explicitly and live
//! until `end` is called, either directly or through `replace`.
//!
//! Turns of one session are serialized by a per-session turn lock. Submitting
//! a new message cancels the turn that is currently running, which then
//! leaves the history untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use futures_util::{future, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::controller::{AgentLoop, TurnError, TurnReport};
use super::events::{EventSink, SessionEvent, TraceEvent, EVENT_CHANNEL_CAPACITY};
use crate::conversation::{History, Message};
use crate::sandbox::SandboxManager;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No sandbox has been bound yet
    Provisioning,
    Active,
    Terminated,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: SystemTime,
    pub messages: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session already exists: {0}")]
    AlreadyExists(String),
    #[error("session has ended: {0}")]
    Terminated(String),
    #[error(transparent)]
    Turn(#[from] TurnError),
}

struct Session {
    id: String,
    created_at: SystemTime,
    history: Mutex<History>,
    /// Held for the whole duration of a turn, `clear` and `end`
    turn_lock: tokio::sync::Mutex<()>,
    /// Generation and cancel token of the newest submitted turn
    current: Mutex<Option<(u64, CancellationToken)>>,
    next_turn: AtomicU64,
    activated: AtomicBool,
    terminated: AtomicBool,
    events: EventSink,
}

impl Session {
    fn new(id: String, events: EventSink) -> Self {
        Self {
            id,
            created_at: SystemTime::now(),
            history: Mutex::new(History::new()),
            turn_lock: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            next_turn: AtomicU64::new(0),
            activated: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            events,
        }
    }

    fn history(&self) -> std::sync::MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new turn and cancel the one it supersedes
    fn begin_turn(&self) -> (u64, CancellationToken) {
        let generation = self.next_turn.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace((generation, token.clone()));
        if let Some((_, previous)) = previous {
            previous.cancel();
        }
        (generation, token)
    }

    fn finish_turn(&self, generation: u64) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(current.as_ref(), Some((g, _)) if *g == generation) {
            current.take();
        }
    }

    fn cancel_current(&self) {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((_, token)) = current {
            token.cancel();
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Explicit registry of live sessions
pub struct SessionManager {
    agent: Arc<AgentLoop>,
    sandboxes: Arc<SandboxManager>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(agent: Arc<AgentLoop>, sandboxes: Arc<SandboxManager>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            agent,
            sandboxes,
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    /// Receive trace events of every session
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Events of one session; events missed by a lagging consumer are skipped
    pub fn session_events(&self, session_id: &str) -> impl Stream<Item = TraceEvent> + Send + 'static {
        let session_id = session_id.to_string();
        BroadcastStream::new(self.events.subscribe()).filter_map(move |event| {
            future::ready(match event {
                Ok(event) if event.session_id == session_id => Some(event.event),
                _ => None,
            })
        })
    }

    /// Create a session with a fresh id; the sandbox is provisioned lazily
    pub async fn create(&self) -> String {
        let id = Uuid::now_v7().to_string();
        let session = Arc::new(Session::new(
            id.clone(),
            EventSink::new(id.clone(), self.events.clone()),
        ));
        self.sessions.write().await.insert(id.clone(), session);
        info!(session_id = %id, "Session created");
        id
    }

    /// Create a session under a caller-chosen id
    pub async fn create_with_id(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(SessionError::AlreadyExists(session_id.to_string()));
        }
        let session = Arc::new(Session::new(
            session_id.to_string(),
            EventSink::new(session_id, self.events.clone()),
        ));
        sessions.insert(session_id.to_string(), session);
        info!(session_id, "Session created");
        Ok(())
    }

    /// End `old_session_id` (if it exists) and create its successor
    pub async fn replace(&self, old_session_id: &str) -> String {
        if self.end(old_session_id).await.is_some() {
            debug!(session_id = old_session_id, "Session replaced");
        }
        self.create().await
    }

    async fn lookup(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Run one user turn to completion
    ///
    /// A turn still running for the same session is cancelled first. A turn
    /// that is itself superseded fails with `TurnError::Cancelled`; one that
    /// has not started when the session ends fails with `Terminated`. Either
    /// way the history is unchanged.
    pub async fn submit(
        &self,
        session_id: &str,
        message: Message,
    ) -> Result<TurnReport, SessionError> {
        let session = self.lookup(session_id).await?;
        if session.is_terminated() {
            return Err(SessionError::Terminated(session_id.to_string()));
        }

        let (generation, cancel) = session.begin_turn();
        let _turn = session.turn_lock.lock().await;
        if session.is_terminated() {
            return Err(SessionError::Terminated(session_id.to_string()));
        }
        if cancel.is_cancelled() {
            return Err(TurnError::Cancelled.into());
        }

        let mut history = session.history().clone();
        let result = self
            .agent
            .run_turn(session_id, &mut history, message, &session.events, &cancel)
            .await;
        session.finish_turn(generation);

        if self.sandboxes.get(session_id).await.is_some() {
            session.activated.store(true, Ordering::SeqCst);
        }

        let report = result?;
        *session.history() = history;
        Ok(report)
    }

    /// Run a turn on a background task
    pub fn spawn_turn(
        self: &Arc<Self>,
        session_id: &str,
        message: Message,
    ) -> JoinHandle<Result<TurnReport, SessionError>> {
        let manager = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move { manager.submit(&session_id, message).await })
    }

    /// Cancel the running turn, if any
    pub async fn cancel(&self, session_id: &str) -> Result<(), SessionError> {
        self.lookup(session_id).await?.cancel_current();
        Ok(())
    }

    /// Forget the conversation and its sandbox; the session stays usable
    pub async fn clear(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self.lookup(session_id).await?;
        session.cancel_current();
        let _turn = session.turn_lock.lock().await;
        if session.is_terminated() {
            return Err(SessionError::Terminated(session_id.to_string()));
        }
        *session.history() = History::new();
        self.sandboxes.release(session_id).await;
        info!(session_id, "Session cleared");
        Ok(())
    }

    /// End a session and release its sandbox
    ///
    /// Idempotent: ending an unknown or already ended session returns None.
    pub async fn end(&self, session_id: &str) -> Option<SessionInfo> {
        let session = self.sessions.write().await.remove(session_id)?;
        if session.terminated.swap(true, Ordering::SeqCst) {
            return None;
        }
        session.cancel_current();

        // Waiting for the turn keeps a lazily provisioned sandbox from outliving the release
        let _turn = session.turn_lock.lock().await;
        self.sandboxes.release(session_id).await;
        session.events.emit(TraceEvent::SessionEnded);
        info!(session_id, "Session ended");

        let messages = session.history().len();
        Some(SessionInfo {
            session_id: session.id.clone(),
            status: SessionStatus::Terminated,
            created_at: session.created_at,
            messages,
        })
    }

    /// Snapshot of the committed history
    pub async fn history(&self, session_id: &str) -> Result<History, SessionError> {
        let session = self.lookup(session_id).await?;
        let history = session.history().clone();
        Ok(history)
    }

    /// Status of a live session; ended sessions are unknown
    pub async fn status(&self, session_id: &str) -> Option<SessionStatus> {
        let session = self.lookup(session_id).await.ok()?;
        Some(self.status_of(&session).await)
    }

    async fn status_of(&self, session: &Session) -> SessionStatus {
        if session.is_terminated() {
            return SessionStatus::Terminated;
        }
        if !session.activated.load(Ordering::SeqCst)
            && self.sandboxes.get(&session.id).await.is_some()
        {
            session.activated.store(true, Ordering::SeqCst);
        }
        if session.activated.load(Ordering::SeqCst) {
            SessionStatus::Active
        } else {
            SessionStatus::Provisioning
        }
    }

    pub async fn info(&self, session_id: &str) -> Result<SessionInfo, SessionError> {
        let session = self.lookup(session_id).await?;
        let status = self.status_of(&session).await;
        let messages = session.history().len();
        Ok(SessionInfo {
            session_id: session.id.clone(),
            status,
            created_at: session.created_at,
            messages,
        })
    }

    /// Live sessions, oldest first
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            let status = self.status_of(&session).await;
            let messages = session.history().len();
            infos.push(SessionInfo {
                session_id: session.id.clone(),
                status,
                created_at: session.created_at,
                messages,
            });
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// End every session and stop the sandbox manager
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.end(&id).await;
        }
        self.sandboxes.shutdown().await;
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}
