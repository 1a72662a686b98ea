//! One live client connection.
//!
//! A [`Session`] owns the socket halves and the receiving end of its outbound
//! queue. Everything else (fan-out, the registry, room joins) talks to it
//! through a cloned [`SessionHandle`].

use crate::broker::BrokerError;
use crate::models::{ChatMessage, DecodeError, Principal};
use crate::services::message_store::PersistError;
use crate::services::RelayService;
use async_trait::async_trait;
use futures::{future, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

#[derive(Debug)]
struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn new() -> Self {
        Self(AtomicU8::new(SessionState::Connecting as u8))
    }

    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Connecting or Active -> Closing. True for the caller that made the move.
    fn begin_closing(&self) -> bool {
        self.transition(SessionState::Active, SessionState::Closing)
            || self.transition(SessionState::Connecting, SessionState::Closing)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("session shut down")]
    Shutdown,
}

/// Result of a non-blocking enqueue onto a session's outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Delivered,
    Full,
    Closed,
}

/// Shared view of a session, cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    user_id: String,
    session_id: Uuid,
    outbound: mpsc::Sender<Arc<str>>,
    shutdown: Arc<watch::Sender<bool>>,
    lifecycle: Arc<Lifecycle>,
    rooms: Arc<Mutex<HashSet<String>>>,
}

impl SessionHandle {
    /// A fresh Connecting handle plus the receiving ends its session owns
    pub(crate) fn channel(
        user_id: &str,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<str>>, watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = Self {
            user_id: user_id.to_string(),
            session_id: Uuid::new_v4(),
            outbound: tx,
            shutdown: Arc::new(shutdown_tx),
            lifecycle: Arc::new(Lifecycle::new()),
            rooms: Arc::new(Mutex::new(HashSet::new())),
        };
        (handle, rx, shutdown_rx)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.get()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Enqueues an outbound frame without waiting
    pub fn try_enqueue(&self, frame: Arc<str>) -> EnqueueOutcome {
        match self.outbound.try_send(frame) {
            Ok(()) => EnqueueOutcome::Delivered,
            Err(TrySendError::Full(_)) => EnqueueOutcome::Full,
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Asks both halves of the session to stop. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if self.lifecycle.begin_closing() {
            debug!(user_id = %self.user_id, session_id = %self.session_id, "session closing");
        }
        self.shutdown.send_replace(true);
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.rooms.lock().iter().cloned().collect()
    }

    pub(crate) fn activate(&self) -> bool {
        self.lifecycle
            .transition(SessionState::Connecting, SessionState::Active)
    }

    pub(crate) fn mark_closed(&self) {
        self.lifecycle
            .0
            .store(SessionState::Closed as u8, Ordering::Release);
    }

    pub(crate) fn add_room(&self, room_id: &str) {
        self.rooms.lock().insert(room_id.to_string());
    }

    pub(crate) fn remove_room(&self, room_id: &str) {
        self.rooms.lock().remove(room_id);
    }
}

/// Frames the read path cares about. Pings are answered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary,
    Close,
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Write half of a client socket
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn close(&mut self);
}

pub struct Session {
    principal: Principal,
    handle: SessionHandle,
    outbound: mpsc::Receiver<Arc<str>>,
    shutdown: watch::Receiver<bool>,
    relay: RelayService,
}

impl Session {
    pub(crate) fn new(principal: Principal, queue_capacity: usize, relay: RelayService) -> Self {
        let (handle, rx, shutdown_rx) = SessionHandle::channel(&principal.user_id, queue_capacity);

        Self {
            principal,
            handle,
            outbound: rx,
            shutdown: shutdown_rx,
            relay,
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Drives the session until either side stops, then releases it.
    ///
    /// Returns the error that ended the session. A client close or an
    /// external shutdown ends it cleanly.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<(), SessionError>
    where
        R: Stream<Item = Result<ClientFrame, TransportError>> + Unpin,
        W: FrameSink,
    {
        let Session {
            principal,
            handle,
            outbound,
            shutdown,
            relay,
        } = self;

        info!(user_id = %handle.user_id, session_id = %handle.session_id, "session started");

        let read = async {
            let result = read_loop(&principal, &relay, reader, shutdown.clone()).await;
            handle.shutdown();
            result
        };
        let write = async {
            let result = write_loop(outbound, writer, shutdown.clone()).await;
            handle.shutdown();
            result
        };

        let (read_result, write_result) = future::join(read, write).await;
        relay.release_session(&handle);

        let outcome = match (read_result, write_result) {
            (Err(SessionError::Shutdown), Err(e)) | (Err(e), _) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        };

        match &outcome {
            Ok(()) | Err(SessionError::Shutdown) => {
                info!(user_id = %handle.user_id, session_id = %handle.session_id, "session closed")
            }
            Err(e) => {
                warn!(user_id = %handle.user_id, session_id = %handle.session_id, error = %e, "session terminated")
            }
        }

        match outcome {
            Err(SessionError::Shutdown) => Ok(()),
            other => other,
        }
    }
}

/// Resolves once the session has been told to stop
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn read_loop<R>(
    principal: &Principal,
    relay: &RelayService,
    mut reader: R,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    R: Stream<Item = Result<ClientFrame, TransportError>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => return Err(SessionError::Shutdown),
            frame = reader.next() => frame,
        };

        let text = match frame {
            None | Some(Ok(ClientFrame::Close)) => return Ok(()),
            Some(Err(e)) => return Err(SessionError::Transport(e.0)),
            Some(Ok(ClientFrame::Binary)) => return Err(DecodeError::Binary.into()),
            Some(Ok(ClientFrame::Text(text))) => text,
        };

        let message = ChatMessage::decode_client_text(&text, principal)?;

        tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => return Err(SessionError::Shutdown),
            result = relay.submit(message) => { result?; }
        }
    }
}

async fn write_loop<W: FrameSink>(
    mut outbound: mpsc::Receiver<Arc<str>>,
    mut writer: W,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SessionError> {
    let result = loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut shutdown) => break Ok(()),
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break Ok(()),
            },
        };

        if let Err(e) = writer.send_text(frame.to_string()).await {
            break Err(SessionError::Transport(e.0));
        }
    };

    outbound.close();
    writer.close().await;
    result
}
