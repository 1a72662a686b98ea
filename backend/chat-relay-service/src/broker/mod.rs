//! Reconnect-resilient publish/subscribe adapter.
//!
//! [`BrokerAdapter`] hides transient connectivity loss from the relay. The
//! backend is reached through a [`BrokerConnector`] that hands out
//! [`BrokerChannel`]s; a channel that returns an error is considered dead and
//! is replaced by a fresh one, with the exchange/queue topology declared
//! again on every reconnect.
//!
//! # Delivery semantics
//!
//! Delivery is **at-most-once per broker connection epoch**. Deliveries are
//! consumed without acknowledgement, so an envelope handed to a connection
//! that dies before the relay processes it is not redelivered after the
//! reconnect. Callers must not rely on the broker for gap-free history; the
//! message store is the durable record.

use crate::metrics;
use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub mod backoff;
pub mod memory;
pub mod redis_streams;

pub use backoff::BackoffPolicy;
pub use memory::MemoryBroker;
pub use redis_streams::RedisStreamsConnector;

#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker command failed: {0}")]
    Command(String),

    #[error("broker delivery stream closed")]
    StreamClosed,

    #[error("broker retry budget exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// A message in transit through the broker. `routing_key` carries the room id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEnvelope {
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Opens connections to a pub/sub backend.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;
}

/// One live connection to the backend. Any error means the channel is
/// unusable and must be dropped.
#[async_trait]
pub trait BrokerChannel: Send {
    /// Another handle onto the same underlying connection
    fn clone_channel(&self) -> Box<dyn BrokerChannel>;

    /// Declares the fanout exchange
    async fn declare_exchange(&mut self, exchange: &str) -> Result<(), BrokerError>;

    /// Declares the durable queue and binds it to the exchange
    async fn bind_queue(&mut self, exchange: &str, queue: &str) -> Result<(), BrokerError>;

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError>;

    /// Waits for the next batch of deliveries on `queue`. An empty batch
    /// means the wait timed out without traffic.
    async fn next_deliveries(
        &mut self,
        exchange: &str,
        queue: &str,
    ) -> Result<Vec<BrokerEnvelope>, BrokerError>;
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<BrokerEnvelope, BrokerError>> + Send>>;

/// Connects and declares topology, retrying with backoff.
#[derive(Clone)]
struct Dialer {
    connector: Arc<dyn BrokerConnector>,
    policy: BackoffPolicy,
}

impl Dialer {
    async fn open(
        &self,
        exchange: &str,
        queue: Option<&str>,
    ) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let mut channel = self.connector.connect().await?;
        channel.declare_exchange(exchange).await?;
        if let Some(queue) = queue {
            channel.bind_queue(exchange, queue).await?;
        }
        Ok(channel)
    }

    /// Up to `max_attempts` tries; attempt `k` first waits `delay_for(k)`
    /// unless `immediate` is set, in which case the first try does not wait.
    async fn open_with_retry(
        &self,
        exchange: &str,
        queue: Option<&str>,
        immediate: bool,
        path: &'static str,
    ) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.policy.max_attempts {
            if !(immediate && attempt == 1) {
                let delay = self.policy.delay_for(attempt);
                debug!(path, attempt, ?delay, "waiting before broker reconnect");
                tokio::time::sleep(delay).await;
                metrics::BROKER_RECONNECTS.with_label_values(&[path]).inc();
            }

            match self.open(exchange, queue).await {
                Ok(channel) => {
                    if attempt > 1 || !immediate {
                        info!(path, attempt, "broker connection re-established");
                    }
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(path, attempt, max_attempts = self.policy.max_attempts, error = %e, "broker connect failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(BrokerError::RetriesExhausted {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }
}

/// Cached publish connection. `generation` changes on every install so a
/// failure seen on an old handle cannot evict a newer connection.
struct PublisherSlot {
    generation: u64,
    channel: Option<Box<dyn BrokerChannel>>,
}

/// Publish/consume facade over a [`BrokerConnector`].
///
/// Publishes share one cached connection, each call working on its own
/// handle to it; each [`consume`](Self::consume) call owns a dedicated
/// channel.
pub struct BrokerAdapter {
    dialer: Dialer,
    exchange: String,
    publisher: Mutex<PublisherSlot>,
}

impl BrokerAdapter {
    /// Opens the publish channel and declares `exchange`. Failing to do so
    /// within the retry budget is returned to the caller.
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        exchange: impl Into<String>,
        policy: BackoffPolicy,
    ) -> Result<Self, BrokerError> {
        let dialer = Dialer { connector, policy };
        let exchange = exchange.into();
        let channel = dialer
            .open_with_retry(&exchange, None, true, "publish")
            .await?;

        info!(%exchange, "broker publisher connected");
        Ok(Self {
            dialer,
            exchange,
            publisher: Mutex::new(PublisherSlot {
                generation: 0,
                channel: Some(channel),
            }),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publishes `body` to the exchange under `routing_key`.
    ///
    /// On transport failure the channel is discarded and up to
    /// `max_attempts` reconnects are made, each followed by one publish
    /// retry. Errors only once that budget is spent.
    ///
    /// The slot lock is only held to clone or replace the channel. Concurrent
    /// callers spend their budgets side by side and pick up a connection
    /// re-opened by any of them.
    pub async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        let mut last_error = String::from("publisher disconnected");

        if let Some((generation, mut channel)) = self.cached_publisher() {
            match channel.publish(&self.exchange, routing_key, body).await {
                Ok(()) => {
                    metrics::MESSAGES_PUBLISHED.inc();
                    return Ok(());
                }
                Err(e) => {
                    warn!(routing_key, error = %e, "publish failed, reconnecting");
                    self.discard_publisher(generation);
                    last_error = e.to_string();
                }
            }
        }

        let policy = &self.dialer.policy;
        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt);
            tokio::time::sleep(delay).await;

            let (generation, mut channel) = match self.cached_publisher() {
                Some(cached) => cached,
                None => {
                    metrics::BROKER_RECONNECTS.with_label_values(&["publish"]).inc();
                    match self.dialer.open(&self.exchange, None).await {
                        Ok(channel) => self.install_publisher(channel),
                        Err(e) => {
                            warn!(routing_key, attempt, error = %e, "publisher reconnect failed");
                            last_error = e.to_string();
                            continue;
                        }
                    }
                }
            };

            match channel.publish(&self.exchange, routing_key, body).await {
                Ok(()) => {
                    info!(routing_key, attempt, "publish succeeded after reconnect");
                    metrics::MESSAGES_PUBLISHED.inc();
                    return Ok(());
                }
                Err(e) => {
                    warn!(routing_key, attempt, error = %e, "publish retry failed");
                    self.discard_publisher(generation);
                    last_error = e.to_string();
                }
            }
        }

        Err(BrokerError::RetriesExhausted {
            attempts: policy.max_attempts,
            last_error,
        })
    }

    fn cached_publisher(&self) -> Option<(u64, Box<dyn BrokerChannel>)> {
        let slot = self.publisher.lock();
        slot.channel
            .as_ref()
            .map(|channel| (slot.generation, channel.clone_channel()))
    }

    fn install_publisher(&self, channel: Box<dyn BrokerChannel>) -> (u64, Box<dyn BrokerChannel>) {
        let mut slot = self.publisher.lock();
        slot.generation += 1;
        let handle = channel.clone_channel();
        slot.channel = Some(channel);
        (slot.generation, handle)
    }

    fn discard_publisher(&self, generation: u64) {
        let mut slot = self.publisher.lock();
        if slot.generation == generation {
            slot.channel = None;
        }
    }

    /// Binds `queue` to `exchange` and returns the delivery stream.
    ///
    /// The binding is established before this returns. Afterwards the
    /// stream reconnects and re-binds on its own whenever the backend drops
    /// it, so callers see one continuous sequence. If a reconnect cycle
    /// exhausts the retry budget the stream yields that error and ends.
    pub async fn consume(&self, exchange: &str, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let channel = self
            .dialer
            .open_with_retry(exchange, Some(queue), true, "consume")
            .await?;
        info!(exchange, queue, "broker consumer bound");

        let state = ConsumeState {
            dialer: self.dialer.clone(),
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            channel: Some(channel),
            pending: VecDeque::new(),
            finished: false,
        };

        Ok(Box::pin(stream::unfold(state, next_delivery)))
    }
}

struct ConsumeState {
    dialer: Dialer,
    exchange: String,
    queue: String,
    channel: Option<Box<dyn BrokerChannel>>,
    pending: VecDeque<BrokerEnvelope>,
    finished: bool,
}

async fn next_delivery(
    mut state: ConsumeState,
) -> Option<(Result<BrokerEnvelope, BrokerError>, ConsumeState)> {
    if state.finished {
        return None;
    }

    loop {
        if let Some(envelope) = state.pending.pop_front() {
            return Some((Ok(envelope), state));
        }

        if let Some(channel) = state.channel.as_mut() {
            match channel.next_deliveries(&state.exchange, &state.queue).await {
                Ok(batch) => state.pending.extend(batch),
                Err(e) => {
                    warn!(queue = %state.queue, error = %e, "delivery stream interrupted, reconnecting");
                    state.channel = None;
                }
            }
            continue;
        }

        match state
            .dialer
            .open_with_retry(&state.exchange, Some(&state.queue), false, "consume")
            .await
        {
            Ok(channel) => state.channel = Some(channel),
            Err(e) => {
                state.finished = true;
                return Some((Err(e), state));
            }
        }
    }
}
