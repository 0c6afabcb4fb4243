//! Connection multiplexer: serves an unbounded sequence of clients under one
//! rendezvous name.
//!
//! The pool always has an endpoint waiting in `accept`. An endpoint that gets
//! a connection spawns its replacement before it reads anything, so there is
//! no window in which a connecting client finds nobody listening.
//!
//! All endpoints report through one unbounded [`ServerEvent`] channel, which a
//! single dispatcher consumes.
//!
//! # Shutdown race
//!
//! The accept and disconnect transitions check the stop flag, take the
//! lifecycle lock, and re-check the flag. Anything completing after
//! [`Multiplexer::stop`] began is dropped without events.

mod endpoint;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::transport::{ChannelListener, close_writer};
use crate::bridge::{ChannelAddress, ChannelError};

pub use endpoint::{EndpointId, EndpointState, ReplyHandle};
use endpoint::{Endpoint, EventSink, Outbound};

/// Back-off after a failed `accept` before listening again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum ServerEvent {
    Connected {
        endpoint: EndpointId,
    },
    MessageReceived {
        endpoint: EndpointId,
        message: String,
        reply: ReplyHandle,
    },
    Disconnected {
        endpoint: EndpointId,
    },
}

#[derive(Debug, Clone)]
pub struct EndpointFailure {
    pub endpoint: EndpointId,
    pub reason: String,
}

impl std::fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MultiplexerError {
    #[error("{} endpoint(s) failed to stop: {}", failures.len(), join_failures(failures))]
    Shutdown { failures: Vec<EndpointFailure> },
    #[error("endpoint {0} is no longer connected")]
    EndpointGone(EndpointId),
}

fn join_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

struct Pool {
    stopping: bool,
    endpoints: HashMap<EndpointId, Endpoint>,
}

struct Shared {
    listener: ChannelListener,
    events: mpsc::UnboundedSender<ServerEvent>,
    stopping: AtomicBool,
    lifecycle: Mutex<Pool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Start a new listening endpoint. Caller holds the lifecycle lock so the
    /// record is in the pool before the task can look for it.
    fn spawn_endpoint(self: &Arc<Self>, pool: &mut Pool) -> EndpointId {
        let id = EndpointId::new();
        let events = EventSink::new(self.events.clone());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_endpoint(
            Arc::clone(self),
            id,
            events.clone(),
            cancel.clone(),
        ));

        pool.endpoints.insert(
            id,
            Endpoint {
                state: EndpointState::Listening,
                events,
                cancel,
                task,
            },
        );
        tracing::trace!(endpoint = %id, "Endpoint listening");
        id
    }
}

/// Handle to a running multiplexer.
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    /// Start serving on `listener`. One endpoint begins listening at once.
    pub fn start(listener: ChannelListener) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            listener,
            events,
            stopping: AtomicBool::new(false),
            lifecycle: Mutex::new(Pool {
                stopping: false,
                endpoints: HashMap::new(),
            }),
        });

        {
            let mut pool = shared.lock();
            shared.spawn_endpoint(&mut pool);
        }

        tracing::info!(address = %shared.listener.address(), "Multiplexer started");
        (Self { shared }, events_rx)
    }

    pub fn address(&self) -> &ChannelAddress {
        self.shared.listener.address()
    }

    /// Tracked endpoints and their states.
    pub fn endpoints(&self) -> Vec<(EndpointId, EndpointState)> {
        self.shared
            .lock()
            .endpoints
            .iter()
            .map(|(id, endpoint)| (*id, endpoint.state))
            .collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Stop every endpoint and clear the pool.
    ///
    /// Each endpoint is attempted even if an earlier one fails; failures are
    /// reported once as [`MultiplexerError::Shutdown`]. Calling again is a
    /// no-op.
    pub async fn stop(&self) -> Result<(), MultiplexerError> {
        let endpoints = {
            let mut pool = self.shared.lock();
            if pool.stopping {
                return Ok(());
            }
            pool.stopping = true;
            self.shared.stopping.store(true, Ordering::Release);
            std::mem::take(&mut pool.endpoints)
        };

        tracing::debug!(count = endpoints.len(), "Stopping endpoints");
        let mut failures = Vec::new();
        for (id, endpoint) in endpoints {
            if let Err(reason) = endpoint.stop().await {
                tracing::warn!(endpoint = %id, %reason, "Endpoint failed to stop cleanly");
                failures.push(EndpointFailure {
                    endpoint: id,
                    reason,
                });
            }
        }

        if let Err(e) = self.shared.listener.cleanup() {
            tracing::warn!(error = %e, "Failed to clean up listener");
        }

        if failures.is_empty() {
            tracing::info!("Multiplexer stopped");
            Ok(())
        } else {
            Err(MultiplexerError::Shutdown { failures })
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        let mut pool = self.shared.lock();
        if pool.stopping {
            return;
        }
        pool.stopping = true;
        self.shared.stopping.store(true, Ordering::Release);
        for endpoint in pool.endpoints.values() {
            endpoint.events.unregister();
            endpoint.cancel.cancel();
        }
        tracing::debug!("Multiplexer dropped without stop, endpoints cancelled");
    }
}

async fn run_endpoint(
    shared: Arc<Shared>,
    id: EndpointId,
    events: EventSink,
    cancel: CancellationToken,
) -> Result<(), ChannelError> {
    let channel = loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = shared.listener.accept() => accepted,
        };
        match accepted {
            Ok(channel) => break channel,
            Err(e) => {
                tracing::warn!(endpoint = %id, error = %e, "Accept failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
            }
        }
    };

    if shared.is_stopping() {
        return Ok(());
    }
    {
        let mut pool = shared.lock();
        if pool.stopping {
            return Ok(());
        }
        shared.spawn_endpoint(&mut pool);
        if let Some(endpoint) = pool.endpoints.get_mut(&id) {
            endpoint.state = EndpointState::Connected;
        }
        events.emit(ServerEvent::Connected { endpoint: id });
    }
    tracing::debug!(endpoint = %id, "Client connected");

    let Some((mut reader, writer)) = channel.into_parts() else {
        return Err(ChannelError::NotConnected);
    };
    let mut writer = Some(writer);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            Some(outbound) = outbound_rx.recv() => match outbound {
                Outbound::Message(text) => {
                    let Some(w) = writer.as_mut() else {
                        tracing::debug!(endpoint = %id, "Reply after close discarded");
                        continue;
                    };
                    if let Err(e) = w.send(text).await {
                        tracing::debug!(endpoint = %id, error = %e, "Failed to send reply");
                    }
                }
                Outbound::Close => {
                    if let Some(w) = writer.take()
                        && let Err(e) = close_writer(w).await
                    {
                        tracing::debug!(endpoint = %id, error = %e, "Failed to close connection");
                    }
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(message)) => {
                    tracing::debug!(endpoint = %id, size = message.len(), "Message received");
                    events.emit(ServerEvent::MessageReceived {
                        endpoint: id,
                        message,
                        reply: ReplyHandle::new(id, outbound_tx.clone()),
                    });
                }
                Some(Err(e)) => break Err(ChannelError::Io(e)),
                None => break Ok(()),
            },
        }
    };

    if cancel.is_cancelled() {
        // Stopped by the pool: write replies already handed over, then flush
        // and close.
        let Some(mut w) = writer.take() else {
            return Ok(());
        };
        while let Ok(Outbound::Message(text)) = outbound_rx.try_recv() {
            w.feed(text).await?;
        }
        return close_writer(w).await;
    }
    drop(outbound_rx);

    if let Err(e) = &outcome {
        tracing::debug!(endpoint = %id, error = %e, "Read failed, dropping connection");
    }

    if shared.is_stopping() {
        return Ok(());
    }
    let mut pool = shared.lock();
    if pool.stopping {
        return Ok(());
    }
    events.emit(ServerEvent::Disconnected { endpoint: id });
    pool.endpoints.remove(&id);
    tracing::debug!(endpoint = %id, "Client disconnected");
    Ok(())
}
