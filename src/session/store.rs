//! Session persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::state::SessionState;
use crate::error::RuntimeError;

/// Durable storage for session state.
///
/// The coordinator calls `save` after every turn and `load` on first use of
/// an unknown id. Errors from either are logged by the caller, not fatal.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<SessionState>, RuntimeError>;
    async fn save(&self, session: &SessionState) -> Result<(), RuntimeError>;
    async fn delete(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Process-local store. Keeps sessions serialized so loads return fresh copies.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, String>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|sessions| sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> RuntimeError {
        RuntimeError::InvalidState("session store lock poisoned".to_string())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<SessionState>, RuntimeError> {
        let raw = self
            .sessions
            .lock()
            .map_err(|_| Self::poisoned())?
            .get(id)
            .cloned();
        raw.map(|raw| serde_json::from_str(&raw).map_err(RuntimeError::from))
            .transpose()
    }

    async fn save(&self, session: &SessionState) -> Result<(), RuntimeError> {
        let raw = serde_json::to_string(session)?;
        self.sessions
            .lock()
            .map_err(|_| Self::poisoned())?
            .insert(session.id.clone(), raw);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RuntimeError> {
        self.sessions.lock().map_err(|_| Self::poisoned())?.remove(id);
        Ok(())
    }
}

/// One pretty-printed `<id>.json` file per session under a base directory.
#[derive(Debug, Clone)]
pub struct JsonFileSessionStore {
    base_dir: PathBuf,
}

impl JsonFileSessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn session_path(&self, id: &str) -> Result<PathBuf, RuntimeError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(RuntimeError::InvalidArgument(format!(
                "session id '{id}' is not usable as a file name"
            )));
        }
        Ok(self.base_dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn load(&self, id: &str) -> Result<Option<SessionState>, RuntimeError> {
        let path = self.session_path(id)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn save(&self, session: &SessionState) -> Result<(), RuntimeError> {
        let path = self.session_path(&session.id)?;
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let serialized = serde_json::to_string_pretty(session)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RuntimeError> {
        let path = self.session_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
