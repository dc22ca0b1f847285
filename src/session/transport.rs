//! Bidirectional channel between a session and its client.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::agent_loop::events::SessionEvent;
use crate::agent_loop::permissions::{PermissionReply, PermissionRequest};
use crate::error::RuntimeError;

/// A question the model asks the user through the question tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionRequest {
    pub id: String,
    pub tool_use_id: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Client connection: receives events, answers interactive requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one event. Must not block.
    fn send(&self, event: SessionEvent);

    async fn request_permission(
        &self,
        request: PermissionRequest,
    ) -> Result<PermissionReply, RuntimeError>;

    async fn ask_question(&self, request: QuestionRequest) -> Result<String, RuntimeError>;
}

pub type PermissionResponder =
    Arc<dyn Fn(PermissionRequest) -> Pin<Box<dyn Future<Output = PermissionReply> + Send>> + Send + Sync>;

pub type QuestionResponder =
    Arc<dyn Fn(QuestionRequest) -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

/// Transport backed by an unbounded channel and optional responder callbacks.
pub struct ChannelTransport {
    events: mpsc::UnboundedSender<SessionEvent>,
    permission: Option<PermissionResponder>,
    question: Option<QuestionResponder>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                permission: None,
                question: None,
            },
            rx,
        )
    }

    pub fn with_permission_responder(mut self, responder: PermissionResponder) -> Self {
        self.permission = Some(responder);
        self
    }

    pub fn with_question_responder(mut self, responder: QuestionResponder) -> Self {
        self.question = Some(responder);
        self
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn send(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }

    async fn request_permission(
        &self,
        request: PermissionRequest,
    ) -> Result<PermissionReply, RuntimeError> {
        match &self.permission {
            Some(responder) => Ok(responder(request).await),
            None => Ok(PermissionReply::Deny {
                reason: Some("no permission handler attached".to_string()),
            }),
        }
    }

    async fn ask_question(&self, request: QuestionRequest) -> Result<String, RuntimeError> {
        let Some(responder) = &self.question else {
            return Err(RuntimeError::InvalidState(
                "no question handler attached".to_string(),
            ));
        };
        responder(request)
            .await
            .ok_or_else(|| RuntimeError::Canceled)
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("has_permission_responder", &self.permission.is_some())
            .field("has_question_responder", &self.question.is_some())
            .finish()
    }
}

/// A session's currently bound transport.
///
/// Rebinding is refused while a turn is running so events of one turn never
/// split across two clients.
#[derive(Default)]
pub struct TransportSlot {
    current: Mutex<Option<Arc<dyn Transport>>>,
}

impl TransportSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(
        &self,
        transport: Option<Arc<dyn Transport>>,
        processing: &AtomicBool,
    ) -> Result<(), RuntimeError> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| RuntimeError::InvalidState("transport slot poisoned".to_string()))?;
        if processing.load(Ordering::SeqCst) {
            return Err(RuntimeError::InvalidState(
                "cannot rebind transport while a turn is in progress".to_string(),
            ));
        }
        *current = transport;
        Ok(())
    }

    pub fn current(&self) -> Option<Arc<dyn Transport>> {
        self.current.lock().ok().and_then(|current| current.clone())
    }
}

impl std::fmt::Debug for TransportSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSlot")
            .field("bound", &self.current().is_some())
            .finish()
    }
}
