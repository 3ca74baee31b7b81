//! Self-healing connection to the transcription service.
//!
//! A single supervisor task owns the connection state machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//! Connecting/Connected --failure--> Reconnecting{n} --backoff--> retry
//! any failure that opens the breaker --> CircuitOpen --reset timeout--> Reconnecting{n}
//! n >= max_attempts --> Failed (until connect() is called again)
//! ```
//!
//! Outbound messages sent while the link is down are buffered and flushed in
//! order once it comes back.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::lock;

pub mod buffer;
pub mod transport;
#[cfg(feature = "zeromq-transport")]
pub mod zeromq;

pub use buffer::{BufferedMessage, MessageBuffer};
pub use transport::{Link, LinkReceiver, LinkSender, SilentReceiver, Transport};

/// Inbound messages held for the consumer before new ones are dropped
const INCOMING_CHANNEL_CAPACITY: usize = 1024;

/// Logical state of a [`ResilientConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    CircuitOpen,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// States that need an explicit `connect()` to leave
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            ConnectionState::CircuitOpen => write!(f, "circuit open"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Configuration for reconnection behaviour
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
    /// Delay between attempts
    pub backoff: BackoffPolicy,
    /// Breaker owned by the connection
    pub circuit_breaker: CircuitBreakerConfig,
    /// Outbound messages kept while the link is down
    pub message_buffer_capacity: usize,
    /// Buffered messages older than this are dropped instead of flushed
    pub message_buffer_ttl: Duration,
    /// Deadline for a single connection attempt
    pub connect_timeout: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: BackoffPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            message_buffer_capacity: 500,
            message_buffer_ttl: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// What happened to a message handed to [`ResilientConnection::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the live link
    Sent,
    /// Held in the buffer until the link is back
    Buffered,
}

/// Statistics for connection monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub connection_id: String,
    pub endpoint: String,
    pub messages_sent: u64,
    pub messages_buffered: u64,
    pub messages_flushed: u64,
    pub messages_received: u64,
    pub dropped_overflow: u64,
    pub dropped_expired: u64,
    pub currently_buffered: usize,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub circuit_breaker: CircuitBreakerStats,
}

impl ConnectionStats {
    /// Messages lost to overflow or expiry
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_overflow + self.dropped_expired
    }
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    buffered: AtomicU64,
    flushed: AtomicU64,
    received: AtomicU64,
    established: AtomicU64,
    failures: AtomicU64,
}

struct StateCell {
    current: ConnectionState,
    subscribers: Vec<mpsc::UnboundedSender<ConnectionState>>,
}

/// The outbound half of the live link, tagged with the link generation
struct ActiveLink {
    generation: u64,
    sender: Box<dyn LinkSender>,
}

struct Shared {
    id: Uuid,
    endpoint: String,
    config: ReconnectionConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<StateCell>,
    breaker: Mutex<CircuitBreaker>,
    buffer: Mutex<MessageBuffer>,
    link: AsyncMutex<Option<ActiveLink>>,
    generation: AtomicU64,
    lost_tx: watch::Sender<u64>,
    incoming_tx: mpsc::Sender<Vec<u8>>,
    counters: Counters,
    last_error: Mutex<Option<String>>,
    last_connected_at: Mutex<Option<DateTime<Utc>>>,
}

/// A logical always-on connection over an unreliable transport
pub struct ResilientConnection {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    incoming_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl ResilientConnection {
    pub fn new(endpoint: impl Into<String>, transport: impl Transport, config: ReconnectionConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let (lost_tx, _) = watch::channel(0);

        let shared = Shared {
            id: Uuid::new_v4(),
            endpoint: endpoint.into(),
            breaker: Mutex::new(CircuitBreaker::new(config.circuit_breaker)),
            buffer: Mutex::new(MessageBuffer::new(
                config.message_buffer_capacity,
                config.message_buffer_ttl,
            )),
            config,
            transport: Arc::new(transport),
            state: Mutex::new(StateCell {
                current: ConnectionState::Disconnected,
                subscribers: Vec::new(),
            }),
            link: AsyncMutex::new(None),
            generation: AtomicU64::new(0),
            lost_tx,
            incoming_tx,
            counters: Counters::default(),
            last_error: Mutex::new(None),
            last_connected_at: Mutex::new(None),
        };

        Self {
            shared: Arc::new(shared),
            supervisor: Mutex::new(None),
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }

    /// Start (or restart after `Failed`) the connection supervisor.
    ///
    /// A no-op while a supervisor is already working on the connection.
    pub fn connect(&self) {
        let mut slot = lock(&self.supervisor);

        if let Some(handle) = slot.take() {
            if !handle.is_finished() && self.state() != ConnectionState::Failed {
                debug!("Connection {} already active", self.shared.id);
                *slot = Some(handle);
                return;
            }
            handle.abort();
        }

        info!("Connecting {} to {}", self.shared.id, self.shared.endpoint);
        let shared = Arc::clone(&self.shared);
        *slot = Some(tokio::spawn(async move { shared.run().await }));
    }

    /// Stop reconnecting, close the link and settle in `Disconnected`.
    ///
    /// Safe to call repeatedly and while an attempt is in flight.
    pub async fn disconnect(&self) {
        let handle = lock(&self.supervisor).take();
        if let Some(handle) = handle {
            handle.abort();
            // Wait for the abort so no timer or transition outlives this call
            let _ = handle.await;
        }

        let active = self.shared.link.lock().await.take();
        if let Some(mut active) = active {
            if let Err(e) = active.sender.close().await {
                debug!("Error closing link for {}: {}", self.shared.id, e);
            }
        }

        self.shared.set_state(ConnectionState::Disconnected);
        info!("Connection {} disconnected", self.shared.id);
    }

    /// Send a payload, buffering it if the link is currently down.
    ///
    /// Never fails: a write error on the live link buffers the message and
    /// hands the broken link back to the supervisor.
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> SendOutcome {
        let payload = payload.into();
        let mut link = self.shared.link.lock().await;

        if let Some(active) = link.as_mut() {
            match active.sender.send(&payload).await {
                Ok(()) => {
                    self.shared.counters.sent.fetch_add(1, Ordering::Relaxed);
                    return SendOutcome::Sent;
                }
                Err(e) => {
                    warn!("Send failed on {}, buffering: {}", self.shared.id, e);
                    let generation = active.generation;
                    *link = None;
                    self.shared.mark_link_lost(generation, &e);
                }
            }
        }

        self.shared.enqueue(payload);
        SendOutcome::Buffered
    }

    /// Subscribe to state transitions, delivered in order and exactly once
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.state).subscribers.push(tx);
        rx
    }

    /// Take the inbound message stream. Only the first call gets it.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        lock(&self.incoming_rx).take()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.state).current
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn config(&self) -> &ReconnectionConfig {
        &self.shared.config
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        let counters = &self.shared.counters;
        let (dropped_overflow, dropped_expired, currently_buffered) = {
            let buffer = lock(&self.shared.buffer);
            (buffer.dropped_overflow(), buffer.dropped_expired(), buffer.len())
        };

        ConnectionStats {
            connection_id: self.shared.id.to_string(),
            endpoint: self.shared.endpoint.clone(),
            messages_sent: counters.sent.load(Ordering::Relaxed),
            messages_buffered: counters.buffered.load(Ordering::Relaxed),
            messages_flushed: counters.flushed.load(Ordering::Relaxed),
            messages_received: counters.received.load(Ordering::Relaxed),
            dropped_overflow,
            dropped_expired,
            currently_buffered,
            connections_established: counters.established.load(Ordering::Relaxed),
            connection_failures: counters.failures.load(Ordering::Relaxed),
            last_connected_at: *lock(&self.shared.last_connected_at),
            last_error: lock(&self.shared.last_error).clone(),
            circuit_breaker: lock(&self.shared.breaker).stats(),
        }
    }
}

impl Drop for ResilientConnection {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
    }
}

impl Shared {
    /// Supervisor loop; the only writer of the connection state besides `disconnect`
    async fn run(self: Arc<Self>) {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            self.wait_for_breaker(attempt).await;

            if attempt == 0 {
                self.set_state(ConnectionState::Connecting);
            } else {
                self.set_state(ConnectionState::Reconnecting { attempt });
            }

            let failure = match timeout(self.config.connect_timeout, self.transport.connect(&self.endpoint)).await {
                Ok(Ok(link)) => {
                    attempt = 0;
                    self.serve(link).await
                }
                Ok(Err(e)) => e.context(format!("Failed to connect to {}", self.endpoint)),
                Err(_) => anyhow!(
                    "Connection attempt to {} timed out after {:?}",
                    self.endpoint,
                    self.config.connect_timeout
                ),
            };

            attempt = attempt.saturating_add(1);
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            *lock(&self.last_error) = Some(format!("{:#}", failure));

            let opened = {
                let mut breaker = lock(&self.breaker);
                breaker.record_failure(format!("{:#}", failure));
                breaker.is_open()
            };
            warn!("Connection {} failure {}/{}: {:#}", self.id, attempt, max_attempts, failure);

            if opened {
                self.set_state(ConnectionState::CircuitOpen);
            }

            if attempt >= max_attempts {
                error!(
                    "Connection {} giving up after {} attempts",
                    self.id, attempt
                );
                self.set_state(ConnectionState::Failed);
                return;
            }

            if opened {
                continue;
            }

            self.set_state(ConnectionState::Reconnecting { attempt });
            let delay = self.config.backoff.delay(attempt);
            info!("Reconnecting {} in {:?} (attempt {})", self.id, delay, attempt);
            sleep(delay).await;
        }
    }

    /// Block while the breaker rejects calls, reporting `CircuitOpen`
    async fn wait_for_breaker(&self, attempt: u32) {
        loop {
            let wait = {
                let mut breaker = lock(&self.breaker);
                if breaker.can_execute() {
                    return;
                }
                breaker.remaining_open_time()
            };

            self.set_state(ConnectionState::CircuitOpen);
            info!(
                "Circuit open for {}, next probe in {:?} (attempt {})",
                self.id, wait, attempt
            );
            // A half-open breaker with a probe outstanding reports zero
            sleep(wait.max(Duration::from_millis(10))).await;
        }
    }

    /// Run an established link until it is lost; returns why it was lost
    async fn serve(&self, link: Link) -> anyhow::Error {
        lock(&self.breaker).record_success();
        self.counters.established.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_connected_at) = Some(Utc::now());

        let Link { sender, mut receiver } = link;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut lost_rx = self.lost_tx.subscribe();

        {
            let mut slot = self.link.lock().await;
            *slot = Some(ActiveLink { generation, sender });
            self.set_state(ConnectionState::Connected);
            info!("Connection {} established to {}", self.id, self.endpoint);

            if let Err(e) = self.flush(&mut slot).await {
                *slot = None;
                return e.context("Failed to flush buffered messages");
            }
        }

        let reason = loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Ok(Some(message)) => {
                        self.counters.received.fetch_add(1, Ordering::Relaxed);
                        if self.incoming_tx.try_send(message).is_err() {
                            debug!("Inbound message dropped on {}, consumer not keeping up", self.id);
                        }
                    }
                    Ok(None) => break anyhow!("Link closed by peer"),
                    Err(e) => break e.context("Link receive failed"),
                },
                changed = lost_rx.changed() => {
                    if changed.is_err() || *lost_rx.borrow() == generation {
                        break anyhow!("Link lost while sending");
                    }
                }
            }
        };

        let mut slot = self.link.lock().await;
        if slot.as_ref().map(|active| active.generation) == Some(generation) {
            if let Some(mut active) = slot.take() {
                if let Err(e) = active.sender.close().await {
                    debug!("Error closing lost link for {}: {}", self.id, e);
                }
            }
        }

        reason
    }

    /// Drain the buffer onto the live link in FIFO order
    async fn flush(&self, slot: &mut Option<ActiveLink>) -> anyhow::Result<()> {
        let mut flushed = 0u64;

        while let Some(active) = slot.as_mut() {
            let next = lock(&self.buffer).pop_fresh(Instant::now());
            let Some(message) = next else {
                break;
            };

            if let Err(e) = active.sender.send(&message.payload).await {
                lock(&self.buffer).push_front(message);
                return Err(e);
            }
            flushed += 1;
        }

        if flushed > 0 {
            self.counters.flushed.fetch_add(flushed, Ordering::Relaxed);
            info!("Flushed {} buffered messages on {}", flushed, self.id);
        }
        Ok(())
    }

    fn enqueue(&self, payload: Vec<u8>) {
        let evicted = lock(&self.buffer).push(BufferedMessage::new(payload));
        self.counters.buffered.fetch_add(1, Ordering::Relaxed);
        if evicted {
            debug!("Outbound buffer full on {}, dropped oldest message", self.id);
        }
    }

    fn mark_link_lost(&self, generation: u64, error: &anyhow::Error) {
        *lock(&self.last_error) = Some(format!("{:#}", error));
        self.lost_tx.send_replace(generation);
    }

    /// Record a transition and notify subscribers; repeated states are ignored
    fn set_state(&self, next: ConnectionState) -> bool {
        let mut cell = lock(&self.state);
        if cell.current == next {
            return false;
        }

        debug!("Connection {}: {} -> {}", self.id, cell.current, next);
        cell.current = next;
        cell.subscribers.retain(|tx| tx.send(next).is_ok());
        true
    }
}
