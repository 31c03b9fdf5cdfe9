//! Feed subscription with reconnect.
//!
//! [`EventSource`] owns the feed connection and the handler registry. Handlers are
//! registered once, before [`EventSource::run`]; a reconnect opens a new stream
//! for the same registry, so nothing is registered twice. Only the run loop
//! mutates the connection state; everyone else observes it through a watch channel.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting{n} -> Connected
//!                                                            \-> Failed (terminal)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use verigreen_clients::retry::{RetryConfig, backoff_delay};
use verigreen_clients::{FeedError, FeedStream, FeedTransport};
use verigreen_types::{EventKind, EventMarker, FeedEvent};

const DEFAULT_HANDLER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before reconnect attempt `attempt` (1-based).
    Reconnecting {
        attempt: u32,
    },
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting ({attempt})"),
            ConnectionState::Failed => f.write_str("failed"),
        }
    }
}

/// Bounded exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Consecutive failed reconnects tolerated before giving up.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.25,
        }
    }
}

impl ReconnectPolicy {
    fn delay_before(&self, attempt: u32) -> Duration {
        let config = RetryConfig {
            max_retries: self.max_attempts,
            initial_delay: self.initial_backoff,
            max_delay: self.max_backoff,
            jitter_factor: self.jitter_factor,
        };
        backoff_delay(attempt.saturating_sub(1), &config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventSourceError {
    #[error("feed unavailable after {attempts} reconnect attempt(s): {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },
    #[error("no handlers registered")]
    NoHandlers,
}

struct Handler {
    kinds: Vec<EventKind>,
    tx: mpsc::Sender<FeedEvent>,
}

enum StreamEnd {
    /// Every handler has gone away; nothing left to deliver to.
    Unsubscribed,
    Dropped(String),
}

pub struct EventSource {
    transport: Arc<dyn FeedTransport>,
    policy: ReconnectPolicy,
    handlers: Vec<Handler>,
    state: watch::Sender<ConnectionState>,
}

impl EventSource {
    pub fn new(transport: Arc<dyn FeedTransport>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            policy,
            handlers: Vec::new(),
            state,
        }
    }

    /// Register a handler for one kind of event.
    ///
    /// Events arrive on the returned channel in feed order. Dropping the receiver
    /// unregisters the handler.
    pub fn subscribe(&mut self, kind: EventKind) -> mpsc::Receiver<FeedEvent> {
        self.subscribe_all(&[kind])
    }

    /// Register one handler for several kinds, preserving their relative order.
    pub fn subscribe_all(&mut self, kinds: &[EventKind]) -> mpsc::Receiver<FeedEvent> {
        let (tx, rx) = mpsc::channel(DEFAULT_HANDLER_CAPACITY);
        let mut kinds = kinds.to_vec();
        kinds.sort_unstable();
        kinds.dedup();
        self.handlers.push(Handler { kinds, tx });
        rx
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// One-off query for past events. Does not touch the live connection.
    pub async fn historical_events(
        &self,
        kind: EventKind,
        from: EventMarker,
        to: EventMarker,
    ) -> Result<Vec<FeedEvent>, FeedError> {
        self.transport.historical_events(kind, from, to).await
    }

    /// Deliver events until every handler is gone or reconnects are exhausted.
    ///
    /// A successful connection resets the reconnect budget.
    pub async fn run(mut self) -> Result<(), EventSourceError> {
        let kinds = self.subscribed_kinds();
        if kinds.is_empty() {
            return Err(EventSourceError::NoHandlers);
        }

        let mut failed_attempts = 0u32;
        self.set_state(ConnectionState::Connecting);

        loop {
            let last_error = match self.transport.connect(&kinds).await {
                Ok(stream) => {
                    if failed_attempts > 0 {
                        tracing::info!(after_attempts = failed_attempts, "Feed reconnected");
                    }
                    failed_attempts = 0;
                    self.set_state(ConnectionState::Connected);

                    match self.pump(stream).await {
                        StreamEnd::Unsubscribed => {
                            self.set_state(ConnectionState::Disconnected);
                            return Ok(());
                        }
                        StreamEnd::Dropped(reason) => reason,
                    }
                }
                Err(e) => e.to_string(),
            };

            if failed_attempts >= self.policy.max_attempts {
                tracing::error!(
                    attempts = failed_attempts,
                    error = %last_error,
                    "Feed reconnect attempts exhausted"
                );
                self.set_state(ConnectionState::Failed);
                return Err(EventSourceError::ReconnectExhausted {
                    attempts: failed_attempts,
                    last_error,
                });
            }

            failed_attempts += 1;
            let delay = self.policy.delay_before(failed_attempts);
            tracing::warn!(
                attempt = failed_attempts,
                delay_ms = delay.as_millis(),
                error = %last_error,
                "Feed connection lost; reconnecting"
            );
            self.set_state(ConnectionState::Reconnecting {
                attempt: failed_attempts,
            });
            tokio::time::sleep(delay).await;
        }
    }

    async fn pump(&mut self, mut stream: Box<dyn FeedStream>) -> StreamEnd {
        loop {
            if self.handlers.is_empty() {
                return StreamEnd::Unsubscribed;
            }
            match stream.next_event().await {
                Ok(Some(event)) => self.dispatch(event).await,
                Ok(None) => return StreamEnd::Dropped("feed closed the stream".to_string()),
                Err(e) => return StreamEnd::Dropped(e.to_string()),
            }
        }
    }

    async fn dispatch(&mut self, event: FeedEvent) {
        let kind = event.kind();
        let mut closed = Vec::new();
        for (i, handler) in self.handlers.iter().enumerate() {
            if handler.kinds.contains(&kind) && handler.tx.send(event.clone()).await.is_err() {
                closed.push(i);
            }
        }
        for i in closed.into_iter().rev() {
            self.handlers.swap_remove(i);
            tracing::debug!(%kind, "Handler receiver dropped; unregistered");
        }
    }

    fn subscribed_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self
            .handlers
            .iter()
            .flat_map(|h| h.kinds.iter().copied())
            .collect();
        kinds.sort_unstable();
        kinds.dedup();
        kinds
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}
