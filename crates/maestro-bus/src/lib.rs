#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-bus** – Typed message bus for Maestro agents.
//!
//! The bus owns one bounded inbound channel per registered agent, a single
//! dispatcher task draining a global outbound queue, and a correlation map
//! for request/response pairs. Delivery is best-effort within the process
//! lifetime: messages whose TTL elapsed or whose recipient queue is full are
//! dropped with a warning, and `requires_response` senders time out instead
//! of exerting backpressure across workers.
//!
//! Ordering: for any single sender→recipient pair, messages are delivered in
//! send order (one ordered queue, one dispatcher). Across senders there is no
//! ordering guarantee. Priority is advisory metadata for recipients; the
//! dispatcher does not reorder on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

use maestro_types::AgentId;

//─────────────────────────────
//  Message model
//─────────────────────────────

/// Kinds of messages agents exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Request for action.
    Request,
    /// Response to a request.
    Response,
    /// Fan-out to all agents.
    Broadcast,
    /// Query for information.
    Query,
    /// Result of a query.
    Result,
    /// Event notification.
    Event,
    /// Task handoff.
    Handoff,
    /// Approval request.
    Approval,
    /// Performance feedback.
    Feedback,
    /// State synchronization.
    Sync,
}

/// Advisory message priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    /// Background traffic.
    Low,
    /// Default.
    Normal,
    /// Time-sensitive.
    High,
    /// Drop-everything.
    Critical,
}

/// A message exchanged between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier.
    pub id: Uuid,
    /// Id of the request this message answers, if any.
    pub correlation_id: Option<Uuid>,
    /// Sending agent.
    pub sender: AgentId,
    /// Recipient; `None` means broadcast.
    pub recipient: Option<AgentId>,
    /// Message kind.
    pub message_type: MessageType,
    /// Advisory priority.
    pub priority: MessagePriority,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Opaque context.
    pub context: serde_json::Value,
    /// Time-to-live; expired messages are dropped by the dispatcher.
    pub ttl: Option<Duration>,
    /// Send time.
    pub timestamp: DateTime<Utc>,
    /// Whether the sender blocks on a correlated response.
    pub requires_response: bool,
}

impl Message {
    /// Build a direct message of the given kind.
    pub fn direct(
        sender: AgentId,
        recipient: AgentId,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: None,
            sender,
            recipient: Some(recipient),
            message_type,
            priority: MessagePriority::Normal,
            payload,
            context: serde_json::Value::Null,
            ttl: None,
            timestamp: Utc::now(),
            requires_response: false,
        }
    }

    /// Build a broadcast message; the recipient is cleared.
    pub fn broadcast(sender: AgentId, message_type: MessageType, payload: serde_json::Value) -> Self {
        Self {
            recipient: None,
            ..Self::direct(sender, sender, message_type, payload)
        }
    }

    /// Build a response correlated to `original`.
    pub fn response_to(original: &Message, sender: AgentId, payload: serde_json::Value) -> Self {
        let message_type = if original.message_type == MessageType::Query {
            MessageType::Result
        } else {
            MessageType::Response
        };
        Self {
            correlation_id: Some(original.id),
            ..Self::direct(sender, original.sender, message_type, payload)
        }
    }

    /// Set the advisory priority.
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Mark the message as expecting a correlated response.
    pub fn expecting_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    /// Whether the TTL has elapsed at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => now - self.timestamp >= ttl,
                Err(_) => false,
            },
            None => false,
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The global outbound queue is full.
    #[error("outbound queue full, message dropped")]
    QueueFull,
    /// No correlated response arrived in time.
    #[error("timed out waiting for response")]
    ResponseTimeout,
    /// The waiter was released by a workflow cancel.
    #[error("cancelled while waiting for response")]
    Cancelled,
    /// The bus has shut down.
    #[error("bus is shut down")]
    Closed,
}

//─────────────────────────────
//  Bus
//─────────────────────────────

/// Default capacity of each agent's inbound channel.
pub const AGENT_QUEUE_CAPACITY: usize = 100;

/// Default capacity of the global outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1000;

/// Default timeout for correlated responses.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the monitor tap ring buffer.
const MONITOR_BUFFER: usize = 1024;

/// Synchronous per-agent delivery callback.
pub type MessageCallback =
    Arc<dyn Fn(Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct BusInner {
    outbound_tx: mpsc::Sender<Message>,
    channels: DashMap<AgentId, mpsc::Sender<Message>>,
    callbacks: DashMap<AgentId, MessageCallback>,
    waiters: DashMap<Uuid, oneshot::Sender<Message>>,
    monitor_tx: broadcast::Sender<Message>,
    dropped: AtomicU64,
    agent_queue_capacity: usize,
}

/// Central message bus.
///
/// Cloning is cheap; all clones share the same dispatcher and queues.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

/// Handle for awaiting a correlated response.
///
/// Dropping the waiter (including after a timeout) clears its correlation
/// entry, so abandoned requests do not accumulate in the bus.
pub struct ResponseWaiter {
    request_id: Uuid,
    rx: Option<oneshot::Receiver<Message>>,
    inner: Arc<BusInner>,
    timeout: Duration,
}

impl ResponseWaiter {
    /// Wait for the correlated response.
    ///
    /// Fails with [`BusError::ResponseTimeout`] after the configured timeout
    /// or [`BusError::Cancelled`] when released by a cancel.
    pub async fn wait(mut self) -> Result<Message, BusError> {
        let Some(rx) = self.rx.take() else {
            return Err(BusError::Cancelled);
        };
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(BusError::Cancelled),
            Err(_) => Err(BusError::ResponseTimeout),
        }
    }
}

impl Drop for ResponseWaiter {
    fn drop(&mut self) {
        self.inner.waiters.remove(&self.request_id);
    }
}

impl MessageBus {
    /// Create a bus with default queue capacities and start its dispatcher.
    pub fn new() -> Self {
        Self::with_capacities(AGENT_QUEUE_CAPACITY, OUTBOUND_QUEUE_CAPACITY)
    }

    /// Create a bus with explicit per-agent and outbound queue capacities.
    pub fn with_capacities(agent_queue_capacity: usize, outbound_capacity: usize) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity);
        let (monitor_tx, _) = broadcast::channel(MONITOR_BUFFER);

        let inner = Arc::new(BusInner {
            outbound_tx,
            channels: DashMap::new(),
            callbacks: DashMap::new(),
            waiters: DashMap::new(),
            monitor_tx,
            dropped: AtomicU64::new(0),
            agent_queue_capacity,
        });

        Self::spawn_dispatcher(Arc::clone(&inner), outbound_rx);

        Self { inner }
    }

    /// Supervise the dispatcher: queues survive a dispatcher panic, the loop
    /// is simply restarted over the same receiver.
    fn spawn_dispatcher(inner: Arc<BusInner>, outbound_rx: mpsc::Receiver<Message>) {
        let outbound_rx = Arc::new(Mutex::new(outbound_rx));
        tokio::spawn(async move {
            loop {
                let rx = Arc::clone(&outbound_rx);
                let bus = Arc::clone(&inner);
                let run = tokio::spawn(async move {
                    let mut rx = rx.lock().await;
                    while let Some(message) = rx.recv().await {
                        dispatch(&bus, message);
                    }
                });
                match run.await {
                    // Channel closed: every bus handle dropped, stop for good.
                    Ok(()) => break,
                    Err(join_err) if join_err.is_panic() => {
                        error!("bus dispatcher panicked, restarting");
                    }
                    Err(_) => break,
                }
            }
        });
    }

    /// Register an agent, returning its inbound message stream.
    ///
    /// Registering an already-known agent replaces its channel; the previous
    /// receiver ends. Pending messages on the old channel are dropped.
    pub fn register(&self, agent_id: AgentId) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.inner.agent_queue_capacity);
        self.inner.channels.insert(agent_id, tx);
        debug!(%agent_id, "registered agent on bus");
        rx
    }

    /// Install a delivery callback invoked on a background task after each
    /// enqueue for `agent_id`. Callback errors are logged, never propagated.
    pub fn set_callback(&self, agent_id: AgentId, callback: MessageCallback) {
        self.inner.callbacks.insert(agent_id, callback);
    }

    /// Unregister an agent, dropping its pending inbound messages. Idempotent.
    pub fn unregister(&self, agent_id: AgentId) {
        self.inner.channels.remove(&agent_id);
        self.inner.callbacks.remove(&agent_id);
        debug!(%agent_id, "unregistered agent from bus");
    }

    /// Whether the agent currently has an inbound channel.
    pub fn is_registered(&self, agent_id: AgentId) -> bool {
        self.inner.channels.contains_key(&agent_id)
    }

    /// Send a message.
    ///
    /// Returns immediately with `Ok(None)`, or `Ok(Some(waiter))` when the
    /// message `requires_response`. The waiter completes with the correlated
    /// response or fails on timeout.
    pub fn send(&self, message: Message) -> Result<Option<ResponseWaiter>, BusError> {
        let waiter = if message.requires_response {
            let (tx, rx) = oneshot::channel();
            self.inner.waiters.insert(message.id, tx);
            Some(ResponseWaiter {
                request_id: message.id,
                rx: Some(rx),
                inner: Arc::clone(&self.inner),
                timeout: RESPONSE_TIMEOUT,
            })
        } else {
            None
        };

        match self.inner.outbound_tx.try_send(message) {
            Ok(()) => Ok(waiter),
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.inner.waiters.remove(&message.id);
                warn!(message_id = %message.id, "outbound queue full, dropping message");
                Err(BusError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::Closed),
        }
    }

    /// Broadcast a message to every registered agent except the sender.
    pub fn broadcast(&self, mut message: Message) -> Result<(), BusError> {
        message.recipient = None;
        self.send(message).map(|_| ())
    }

    /// Satisfy the waiter for `original_id`, if any. Idempotent: a second
    /// call for the same id is a no-op.
    pub fn respond_to(&self, original_id: Uuid, mut response: Message) {
        response.correlation_id = Some(original_id);
        if let Some((_, waiter)) = self.inner.waiters.remove(&original_id) {
            // Receiver may have timed out already; nothing to do then.
            let _ = waiter.send(response);
        }
    }

    /// Release all pending response waiters with [`BusError::Cancelled`].
    pub fn cancel_pending(&self) {
        let ids: Vec<Uuid> = self.inner.waiters.iter().map(|e| *e.key()).collect();
        for id in ids {
            // Dropping the sender completes the waiter with Cancelled.
            self.inner.waiters.remove(&id);
        }
    }

    /// Subscribe to the monitor tap carrying every dispatched message.
    pub fn subscribe_monitor(&self) -> broadcast::Receiver<Message> {
        self.inner.monitor_tx.subscribe()
    }

    /// Messages dropped so far (TTL expiry, unknown recipient, full queues).
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Route one message to its recipient(s). Runs on the dispatcher task only,
/// making it the single writer to every inbound channel.
fn dispatch(inner: &Arc<BusInner>, message: Message) {
    if message.expired(Utc::now()) {
        inner.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = %message.id, "dropping expired message");
        return;
    }

    // Mirror onto the monitor tap regardless of delivery outcome.
    let _ = inner.monitor_tx.send(message.clone());

    let is_broadcast =
        message.recipient.is_none() || message.message_type == MessageType::Broadcast;

    if is_broadcast {
        let recipients: Vec<AgentId> = inner
            .channels
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| *id != message.sender)
            .collect();
        for recipient in recipients {
            deliver(inner, recipient, message.clone());
        }
    } else if let Some(recipient) = message.recipient {
        deliver(inner, recipient, message);
    }
}

fn deliver(inner: &Arc<BusInner>, recipient: AgentId, message: Message) {
    let Some(tx) = inner.channels.get(&recipient).map(|e| e.value().clone()) else {
        inner.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(%recipient, message_id = %message.id, "recipient unknown, dropping message");
        return;
    };

    match tx.try_send(message.clone()) {
        Ok(()) => {
            if let Some(callback) = inner.callbacks.get(&recipient).map(|e| e.value().clone()) {
                tokio::spawn(async move {
                    if let Err(err) = callback(message).await {
                        error!(%recipient, %err, "message callback failed");
                    }
                });
            }
        }
        Err(mpsc::error::TrySendError::Full(message)) => {
            // Deliberate: no sender backpressure across workers. A dropped
            // request that required a response times out at the sender.
            inner.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(%recipient, message_id = %message.id, "inbound queue full, dropping message");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            inner.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(%recipient, "inbound channel closed, dropping message");
        }
    }
}
