//! Live sessions, the one-turn-at-a-time guard, persistence and transport glue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bon::Builder;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::state::SessionState;
use super::store::{InMemorySessionStore, JsonFileSessionStore, SessionStore};
use super::transport::{Transport, TransportSlot};
use crate::agent_loop::runner::{ConversationLoop, TurnContext, TurnOutcome};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::provider::ModelProvider;
use crate::tools::ToolFilter;
use crate::types::Message;

/// Options for [`SessionCoordinator::create_session`].
#[derive(Debug, Clone, Default, Builder)]
pub struct SessionOptions {
    /// Generated when absent.
    #[builder(into)]
    pub id: Option<String>,
    /// Falls back to the configured default model.
    #[builder(into)]
    pub model: Option<String>,
    #[builder(default)]
    pub tool_filter: ToolFilter,
    #[builder(into)]
    pub system_prompt: Option<String>,
}

/// One live session.
pub struct SessionHandle {
    id: String,
    state: tokio::sync::Mutex<SessionState>,
    processing: AtomicBool,
    cancel: Mutex<CancellationToken>,
    transport: TransportSlot,
    idle: Notify,
}

impl SessionHandle {
    fn new(state: SessionState) -> Self {
        Self {
            id: state.id.clone(),
            state: tokio::sync::Mutex::new(state),
            processing: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            transport: TransportSlot::new(),
            idle: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.current()
    }

    /// Resolves once no turn is running.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_processing() {
                return;
            }
            notified.await;
        }
    }

    /// Cancel the running turn, if any. Returns whether one was running.
    fn cancel_turn(&self) -> bool {
        let Ok(current) = self.cancel.lock() else {
            return false;
        };
        if !self.is_processing() {
            return false;
        }
        current.cancel();
        true
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("processing", &self.is_processing())
            .field("transport", &self.transport)
            .finish()
    }
}

/// Holds a session's processing flag for the duration of a turn.
///
/// Dropping clears the flag on every exit path, panics and cancellation included.
struct TurnGuard {
    handle: Arc<SessionHandle>,
    cancel: CancellationToken,
}

impl TurnGuard {
    /// The turn's token is installed under the same lock `cancel_turn` takes,
    /// so a cancel never lands on the previous turn's token.
    fn acquire(
        handle: &Arc<SessionHandle>,
        cancel: CancellationToken,
    ) -> Result<Self, RuntimeError> {
        let mut current = handle
            .cancel
            .lock()
            .map_err(|_| RuntimeError::InvalidState("session cancel lock poisoned".to_string()))?;
        handle
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RuntimeError::SessionBusy(handle.id.clone()))?;
        *current = cancel.clone();
        Ok(Self {
            handle: handle.clone(),
            cancel,
        })
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.handle.processing.store(false, Ordering::Release);
        self.handle.idle.notify_waiters();
    }
}

/// Owns the live sessions of a process.
///
/// At most one turn runs per session. A second request against a busy
/// session is rejected with [`RuntimeError::SessionBusy`], never queued.
pub struct SessionCoordinator {
    runner: ConversationLoop,
    store: Arc<dyn SessionStore>,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    shutdown: CancellationToken,
}

impl SessionCoordinator {
    pub fn new(runner: ConversationLoop, store: Arc<dyn SessionStore>) -> Self {
        Self {
            runner,
            store,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// A coordinator persisting to `config.session_dir`, or in memory when unset.
    pub fn from_config(provider: Arc<dyn ModelProvider>, config: RuntimeConfig) -> Self {
        let store: Arc<dyn SessionStore> = match &config.session_dir {
            Some(dir) => Arc::new(JsonFileSessionStore::new(dir.clone())),
            None => Arc::new(InMemorySessionStore::new()),
        };
        Self::new(ConversationLoop::new(provider, config), store)
    }

    pub fn runner(&self) -> &ConversationLoop {
        &self.runner
    }

    fn cached(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions
            .read()
            .ok()
            .and_then(|sessions| sessions.get(id).cloned())
    }

    fn insert(&self, handle: Arc<SessionHandle>) -> Result<Arc<SessionHandle>, RuntimeError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| RuntimeError::InvalidState("session map poisoned".to_string()))?;
        Ok(sessions
            .entry(handle.id.clone())
            .or_insert(handle)
            .clone())
    }

    /// Live handle for `id`, loading it from the store on first use.
    pub async fn handle(&self, id: &str) -> Result<Arc<SessionHandle>, RuntimeError> {
        if let Some(handle) = self.cached(id) {
            return Ok(handle);
        }
        match self.store.load(id).await {
            Ok(Some(state)) => {
                tracing::debug!(session_id = %id, messages = state.messages.len(), "session loaded");
                self.insert(Arc::new(SessionHandle::new(state)))
            }
            Ok(None) => Err(RuntimeError::SessionNotFound(id.to_string())),
            Err(err) => {
                tracing::warn!(session_id = %id, error = %err, "failed to load session");
                Err(RuntimeError::SessionNotFound(id.to_string()))
            }
        }
    }

    pub async fn create_session(&self, options: SessionOptions) -> Result<String, RuntimeError> {
        let id = options
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.exists(&id).await? {
            return Err(RuntimeError::InvalidState(format!(
                "session {id} already exists"
            )));
        }
        let model = options
            .model
            .unwrap_or_else(|| self.runner.config().default_model.clone());
        let mut state = SessionState::new(id.clone(), model).with_tool_filter(options.tool_filter);
        state.system_prompt = options.system_prompt;

        if let Err(err) = self.store.save(&state).await {
            tracing::warn!(session_id = %id, error = %err, "failed to persist new session");
        }
        tracing::info!(session_id = %id, model = %state.model, "session created");
        self.insert(Arc::new(SessionHandle::new(state)))?;
        Ok(id)
    }

    /// Whether `id` is live or persisted. Unreadable stored sessions count as
    /// existing so they are never overwritten.
    async fn exists(&self, id: &str) -> Result<bool, RuntimeError> {
        if self.cached(id).is_some() {
            return Ok(true);
        }
        match self.store.load(id).await {
            Ok(stored) => Ok(stored.is_some()),
            Err(err @ RuntimeError::InvalidArgument(_)) => Err(err),
            Err(err) => {
                tracing::warn!(session_id = %id, error = %err, "stored session unreadable");
                Ok(true)
            }
        }
    }

    fn begin_turn(&self, handle: &Arc<SessionHandle>) -> Result<TurnGuard, RuntimeError> {
        TurnGuard::acquire(handle, self.shutdown.child_token())
    }

    /// Run one turn on `id`. Fails fast with `SessionBusy` if a turn is running.
    pub async fn send_message(
        &self,
        id: &str,
        input: impl Into<String>,
    ) -> Result<TurnOutcome, RuntimeError> {
        let handle = self.handle(id).await?;
        let guard = self.begin_turn(&handle)?;
        self.run_turn(&handle, guard, input.into()).await
    }

    /// Run a turn on its own task.
    ///
    /// The session is claimed before spawning, so a busy session is rejected
    /// here and the returned task always runs its turn.
    pub async fn spawn_message(
        self: &Arc<Self>,
        id: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<Result<TurnOutcome, RuntimeError>>, RuntimeError> {
        let handle = self.handle(id).await?;
        let guard = self.begin_turn(&handle)?;
        let coordinator = self.clone();
        let input = input.into();
        Ok(tokio::spawn(async move {
            coordinator.run_turn(&handle, guard, input).await
        }))
    }

    async fn run_turn(
        &self,
        handle: &Arc<SessionHandle>,
        guard: TurnGuard,
        input: String,
    ) -> Result<TurnOutcome, RuntimeError> {
        let ctx = TurnContext::builder()
            .cancel(guard.cancel.clone())
            .maybe_transport(handle.transport())
            .build();

        let mut state = handle.state.lock().await;
        let result = self.runner.run(&mut state, ctx, input).await;
        if let Err(err) = &result {
            tracing::debug!(session_id = %handle.id, error = %err, "turn failed");
        }
        if let Err(err) = self.store.save(&state).await {
            tracing::warn!(session_id = %handle.id, error = %err, "failed to persist session");
        }
        drop(state);
        drop(guard);
        result
    }

    /// Cancel the running turn of `id`. Returns whether a turn was running.
    pub fn cancel(&self, id: &str) -> Result<bool, RuntimeError> {
        let handle = self
            .cached(id)
            .ok_or_else(|| RuntimeError::SessionNotFound(id.to_string()))?;
        let canceled = handle.cancel_turn();
        if canceled {
            tracing::debug!(session_id = %id, "canceled turn");
        }
        Ok(canceled)
    }

    /// Attach (or detach, with `None`) the client connection of `id`.
    /// Refused while a turn is running.
    pub async fn bind_transport(
        &self,
        id: &str,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<(), RuntimeError> {
        let handle = self.handle(id).await?;
        handle.transport.bind(transport, &handle.processing)
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), RuntimeError> {
        if let Some(handle) = self.cached(id) {
            if handle.is_processing() {
                return Err(RuntimeError::SessionBusy(id.to_string()));
            }
            if let Ok(mut sessions) = self.sessions.write() {
                sessions.remove(id);
            }
        }
        if let Err(err) = self.store.delete(id).await {
            tracing::warn!(session_id = %id, error = %err, "failed to delete stored session");
        }
        tracing::info!(session_id = %id, "session deleted");
        Ok(())
    }

    /// Ids of the sessions currently held in memory, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .map(|sessions| sessions.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Snapshot of the history of `id`. Waits for a running turn to finish.
    pub async fn messages(&self, id: &str) -> Result<Vec<Message>, RuntimeError> {
        let handle = self.handle(id).await?;
        let state = handle.state.lock().await;
        Ok(state.messages.clone())
    }

    /// Cancel every in-flight turn and wait for them to wind down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<Arc<SessionHandle>> = self
            .sessions
            .read()
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default();
        for handle in handles {
            handle.wait_for_idle().await;
        }
        tracing::info!("session coordinator shut down");
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("runner", &self.runner)
            .field("sessions", &self.session_ids())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}
