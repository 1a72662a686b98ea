//! In-process broker.
//!
//! Used when a single relay instance runs without Redis, and by tests that
//! need to cut connections on demand. Queues outlive connections; every
//! channel belongs to the epoch it was opened in and fails once
//! [`MemoryBroker::disconnect_all`] starts a new one.

use super::{BrokerChannel, BrokerConnector, BrokerEnvelope, BrokerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct State {
    epoch: u64,
    /// exchange -> bound queues
    bindings: HashMap<String, HashSet<String>>,
    queues: HashMap<String, VecDeque<BrokerEnvelope>>,
    fail_next_connects: u32,
    connect_attempts: u64,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    block: Duration,
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_block(Duration::from_millis(500))
    }

    /// `block` bounds how long a channel waits for deliveries before
    /// returning an empty batch.
    pub fn with_block(block: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                block,
            }),
        }
    }

    /// Breaks every open channel. Queued envelopes are kept.
    pub fn disconnect_all(&self) {
        self.inner.state.lock().epoch += 1;
        self.inner.notify.notify_waiters();
    }

    /// Makes the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.state.lock().fail_next_connects = n;
    }

    /// Connect attempts seen so far, failed ones included
    pub fn connect_attempts(&self) -> u64 {
        self.inner.state.lock().connect_attempts
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let mut state = self.inner.state.lock();
        state.connect_attempts += 1;
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(BrokerError::Connection("connection refused".into()));
        }

        Ok(Box::new(MemoryChannel {
            broker: self.clone(),
            epoch: state.epoch,
        }))
    }
}

#[derive(Clone)]
struct MemoryChannel {
    broker: MemoryBroker,
    epoch: u64,
}

impl MemoryChannel {
    fn check_epoch(&self, state: &State) -> Result<(), BrokerError> {
        if state.epoch != self.epoch {
            return Err(BrokerError::Connection("connection reset by broker".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn clone_channel(&self) -> Box<dyn BrokerChannel> {
        Box::new(self.clone())
    }

    async fn declare_exchange(&mut self, exchange: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.inner.state.lock();
        self.check_epoch(&state)?;
        state.bindings.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&mut self, exchange: &str, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.inner.state.lock();
        self.check_epoch(&state)?;
        state
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .insert(queue.to_string());
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.inner.state.lock();
            self.check_epoch(&state)?;

            let bound: Vec<String> = match state.bindings.get(exchange) {
                Some(queues) => queues.iter().cloned().collect(),
                None => {
                    return Err(BrokerError::Command(format!(
                        "exchange '{exchange}' not declared"
                    )))
                }
            };

            for queue in bound {
                state
                    .queues
                    .entry(queue)
                    .or_default()
                    .push_back(BrokerEnvelope {
                        routing_key: routing_key.to_string(),
                        body: body.to_vec(),
                    });
            }
        }

        self.broker.inner.notify.notify_waiters();
        Ok(())
    }

    async fn next_deliveries(
        &mut self,
        _exchange: &str,
        queue: &str,
    ) -> Result<Vec<BrokerEnvelope>, BrokerError> {
        let inner = &self.broker.inner;
        let deadline = Instant::now() + inner.block;

        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = inner.state.lock();
                self.check_epoch(&state)?;
                if let Some(pending) = state.queues.get_mut(queue) {
                    if !pending.is_empty() {
                        return Ok(pending.drain(..).collect());
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}
