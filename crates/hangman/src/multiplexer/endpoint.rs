//! Pool records and reply handles for individual channel endpoints.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{MultiplexerError, ServerEvent};
use crate::bridge::ChannelError;

/// Identifies one endpoint in the pool for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(uuid::Uuid);

impl EndpointId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Listening,
    Connected,
}

/// Frames queued for an endpoint's writer.
#[derive(Debug)]
pub(crate) enum Outbound {
    Message(String),
    Close,
}

/// Reply path bound to the endpoint a message arrived on.
///
/// Cloneable; the connection is flushed and closed by [`ReplyHandle::finish`]
/// or when the endpoint stops, whichever comes first.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    endpoint: EndpointId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ReplyHandle {
    pub(crate) fn new(endpoint: EndpointId, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { endpoint, outbound }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn send(&self, message: impl Into<String>) -> Result<(), MultiplexerError> {
        self.outbound
            .send(Outbound::Message(message.into()))
            .map_err(|_| MultiplexerError::EndpointGone(self.endpoint))
    }

    /// Flush everything sent so far, then close the connection.
    pub fn finish(&self) -> Result<(), MultiplexerError> {
        self.outbound
            .send(Outbound::Close)
            .map_err(|_| MultiplexerError::EndpointGone(self.endpoint))
    }
}

/// Event registration for one endpoint. Unregistering silences the endpoint
/// without stopping it.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<ServerEvent>>>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn emit(&self, event: ServerEvent) {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref()
            && tx.send(event).is_err()
        {
            tracing::trace!("Event dropped, dispatcher gone");
        }
    }

    pub fn unregister(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Pool record for a running endpoint task.
pub(crate) struct Endpoint {
    pub state: EndpointState,
    pub events: EventSink,
    pub cancel: CancellationToken,
    pub task: JoinHandle<Result<(), ChannelError>>,
}

impl Endpoint {
    /// Unregister events, cancel the task, and wait for it to flush and close.
    pub async fn stop(self) -> Result<(), String> {
        self.events.unregister();
        self.cancel.cancel();
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("endpoint task failed: {e}")),
        }
    }
}
