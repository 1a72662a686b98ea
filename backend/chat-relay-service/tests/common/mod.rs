#![allow(dead_code)]

use async_trait::async_trait;
use chat_relay_service::broker::{BackoffPolicy, BrokerAdapter, BrokerError, MemoryBroker};
use chat_relay_service::models::{ChatMessage, Principal};
use chat_relay_service::services::{
    MembershipStore, MessageStore, PersistError, RelayService, RelaySettings, RoomMembership,
};
use chat_relay_service::websocket::{
    ClientFrame, ConnectionRegistry, FrameSink, SessionError, TransportError,
};
use futures::channel::mpsc as client_mpsc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const EXCHANGE: &str = "chat_messages";
pub const QUEUE: &str = "message";

/// Assigns ids M1, M2, ... in persist order
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<Vec<ChatMessage>>,
    fail: AtomicBool,
    delay: Mutex<Duration>,
}

impl InMemoryMessageStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every later write stalls for `delay` before completing
    pub fn delay_writes(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn stored(&self) -> Vec<ChatMessage> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn persist(&self, mut message: ChatMessage) -> Result<ChatMessage, PersistError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PersistError::Database("insert rejected".into()));
        }

        let mut messages = self.messages.lock();
        message.id = Some(format!("M{}", messages.len() + 1));
        message.created_at = Some(chrono::Utc::now());
        messages.push(message.clone());
        Ok(message)
    }
}

#[derive(Default)]
pub struct InMemoryMembershipStore {
    rooms: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryMembershipStore {
    /// `memberships` are (user, room) pairs
    pub fn seeded(memberships: &[(&str, &str)]) -> Self {
        let store = Self::default();
        {
            let mut rooms = store.rooms.lock();
            for (user, room) in memberships {
                rooms
                    .entry(user.to_string())
                    .or_default()
                    .push(room.to_string());
            }
        }
        store
    }
}

#[async_trait]
impl MembershipStore for InMemoryMembershipStore {
    async fn rooms_for_user(&self, user_id: &str) -> Result<Vec<String>, PersistError> {
        Ok(self.rooms.lock().get(user_id).cloned().unwrap_or_default())
    }

    async fn add_participant(&self, room_id: &str, user_id: &str) -> Result<(), PersistError> {
        let mut rooms = self.rooms.lock();
        let joined = rooms.entry(user_id.to_string()).or_default();
        if !joined.iter().any(|r| r == room_id) {
            joined.push(room_id.to_string());
        }
        Ok(())
    }

    async fn remove_participant(&self, room_id: &str, user_id: &str) -> Result<(), PersistError> {
        if let Some(joined) = self.rooms.lock().get_mut(user_id) {
            joined.retain(|r| r != room_id);
        }
        Ok(())
    }
}

pub fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(5),
        max_jitter: Duration::from_millis(2),
    }
}

pub struct Harness {
    pub relay: RelayService,
    pub broker: MemoryBroker,
    pub messages: Arc<InMemoryMessageStore>,
    pub consumer: JoinHandle<Result<(), BrokerError>>,
}

pub async fn harness(queue_capacity: usize, memberships: &[(&str, &str)]) -> Harness {
    let broker = MemoryBroker::with_block(Duration::from_millis(50));
    let adapter = BrokerAdapter::connect(Arc::new(broker.clone()), EXCHANGE, fast_policy())
        .await
        .unwrap();

    let messages = Arc::new(InMemoryMessageStore::default());
    let relay = RelayService::new(
        ConnectionRegistry::new(),
        RoomMembership::new(),
        messages.clone(),
        Arc::new(InMemoryMembershipStore::seeded(memberships)),
        Arc::new(adapter),
        RelaySettings {
            queue_capacity,
            persist_timeout: Duration::from_secs(1),
        },
    );
    let consumer = relay.start_consumer(EXCHANGE, QUEUE).await.unwrap();

    Harness {
        relay,
        broker,
        messages,
        consumer,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Text(String),
    Closed,
}

pub struct ChannelSink {
    events: mpsc::UnboundedSender<SinkEvent>,
    broken: bool,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.broken {
            return Err(TransportError("broken pipe".into()));
        }
        self.events
            .send(SinkEvent::Text(text))
            .map_err(|_| TransportError("client gone".into()))
    }

    async fn close(&mut self) {
        let _ = self.events.send(SinkEvent::Closed);
    }
}

/// Test-side view of one connected client
pub struct Client {
    pub user_id: String,
    pub session_id: Uuid,
    frames: client_mpsc::UnboundedSender<Result<ClientFrame, TransportError>>,
    events: mpsc::UnboundedReceiver<SinkEvent>,
    pub task: JoinHandle<Result<(), SessionError>>,
}

impl Client {
    pub fn send_text(&self, text: &str) {
        self.frames
            .unbounded_send(Ok(ClientFrame::Text(text.to_string())))
            .unwrap();
    }

    pub fn send_chat(&self, room_id: &str, content: &str) {
        self.send_text(&serde_json::json!({ "roomId": room_id, "content": content }).to_string());
    }

    pub fn send_close(&self) {
        self.frames.unbounded_send(Ok(ClientFrame::Close)).unwrap();
    }

    /// Next frame written to this client, parsed as JSON
    pub async fn next_frame(&mut self) -> serde_json::Value {
        match self.next_event().await {
            SinkEvent::Text(text) => serde_json::from_str(&text).unwrap(),
            SinkEvent::Closed => panic!("{} was closed while waiting for a frame", self.user_id),
        }
    }

    pub async fn next_event(&mut self) -> SinkEvent {
        tokio::time::timeout(Duration::from_secs(2), self.events.recv())
            .await
            .unwrap_or_else(|_| panic!("{} timed out waiting for output", self.user_id))
            .unwrap_or(SinkEvent::Closed)
    }

    pub async fn assert_silent(&mut self, wait: Duration) {
        if let Ok(Some(event)) = tokio::time::timeout(wait, self.events.recv()).await {
            panic!("{} unexpectedly received {event:?}", self.user_id);
        }
    }

    pub async fn finished(self) -> Result<(), SessionError> {
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("session did not finish")
            .expect("session task panicked")
    }
}

pub async fn connect(relay: &RelayService, user_id: &str, username: &str) -> Client {
    connect_with_writer(relay, user_id, username, false).await
}

/// Like [`connect`], but every write to the client fails
pub async fn connect_broken(relay: &RelayService, user_id: &str, username: &str) -> Client {
    connect_with_writer(relay, user_id, username, true).await
}

async fn connect_with_writer(
    relay: &RelayService,
    user_id: &str,
    username: &str,
    broken: bool,
) -> Client {
    let session = relay
        .open_session(Principal::new(user_id, username))
        .await
        .unwrap();
    let session_id = session.handle().session_id();

    let (frames_tx, frames_rx) = client_mpsc::unbounded();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let sink = ChannelSink {
        events: events_tx,
        broken,
    };
    let task = tokio::spawn(session.run(frames_rx, sink));

    Client {
        user_id: user_id.to_string(),
        session_id,
        frames: frames_tx,
        events: events_rx,
        task,
    }
}
