//! Relay core: session admission, inbound publish, and broker fan-out.

use super::membership::RoomMembership;
use super::message_store::{MembershipStore, MessageStore, PersistError};
use crate::broker::{BrokerAdapter, BrokerEnvelope, BrokerError, DeliveryStream};
use crate::metrics;
use crate::models::{ChatMessage, Principal};
use crate::websocket::{ConnectionRegistry, EnqueueOutcome, Session, SessionError, SessionHandle};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Outbound queue capacity per session
    pub queue_capacity: usize,
    pub persist_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            persist_timeout: Duration::from_secs(5),
        }
    }
}

/// Process-wide fan-out counters
#[derive(Debug, Default)]
pub struct FanoutStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl FanoutStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames discarded because a session's outbound queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Outcome of fanning out one envelope
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub dropped: usize,
}

struct RelayInner {
    registry: ConnectionRegistry,
    membership: RoomMembership,
    messages: Arc<dyn MessageStore>,
    rooms: Arc<dyn MembershipStore>,
    broker: Arc<BrokerAdapter>,
    settings: RelaySettings,
    stats: FanoutStats,
}

#[derive(Clone)]
pub struct RelayService {
    inner: Arc<RelayInner>,
}

impl RelayService {
    pub fn new(
        registry: ConnectionRegistry,
        membership: RoomMembership,
        messages: Arc<dyn MessageStore>,
        rooms: Arc<dyn MembershipStore>,
        broker: Arc<BrokerAdapter>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                registry,
                membership,
                messages,
                rooms,
                broker,
                settings,
                stats: FanoutStats::default(),
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn membership(&self) -> &RoomMembership {
        &self.inner.membership
    }

    pub fn stats(&self) -> &FanoutStats {
        &self.inner.stats
    }

    /// Admits an authenticated client.
    ///
    /// Loads the user's rooms, registers the session (replacing any older
    /// one for the same user), joins the rooms and marks it Active.
    pub async fn open_session(&self, principal: Principal) -> Result<Session, PersistError> {
        let rooms = self.inner.rooms.rooms_for_user(&principal.user_id).await?;
        let session = Session::new(principal, self.inner.settings.queue_capacity, self.clone());
        let handle = session.handle().clone();

        for room_id in &rooms {
            handle.add_room(room_id);
        }
        self.inner.registry.register(handle.clone());
        for room_id in &rooms {
            self.inner.membership.join(room_id, handle.user_id());
        }

        if !handle.activate() {
            debug!(user_id = %handle.user_id(), "session replaced before activation");
        }
        metrics::ACTIVE_SESSIONS.inc();

        info!(
            user_id = %handle.user_id(),
            session_id = %handle.session_id(),
            rooms = rooms.len(),
            "session opened"
        );
        Ok(session)
    }

    /// Unregisters a finished session and leaves its rooms, unless a newer
    /// session for the same user has taken its place.
    pub(crate) fn release_session(&self, handle: &SessionHandle) {
        let membership = &self.inner.membership;
        let removed =
            self.inner
                .registry
                .unregister_session(handle.user_id(), handle.session_id(), || {
                    for room_id in handle.joined_rooms() {
                        membership.leave(&room_id, handle.user_id());
                    }
                });

        handle.mark_closed();
        metrics::ACTIVE_SESSIONS.dec();
        debug!(
            user_id = %handle.user_id(),
            session_id = %handle.session_id(),
            removed,
            "session released"
        );
    }

    /// Persists a client message, then publishes it under its room id.
    pub async fn submit(&self, message: ChatMessage) -> Result<ChatMessage, SessionError> {
        let persisted = match tokio::time::timeout(
            self.inner.settings.persist_timeout,
            self.inner.messages.persist(message),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(PersistError::Timeout.into()),
        };

        let body = serde_json::to_vec(&persisted)
            .map_err(|e| BrokerError::Command(format!("encode message: {e}")))?;
        self.inner.broker.publish(&persisted.room_id, &body).await?;

        debug!(
            room_id = %persisted.room_id,
            sender_id = %persisted.sender_id,
            message_id = ?persisted.id,
            "message published"
        );
        Ok(persisted)
    }

    /// Delivers one broker envelope to every live participant of its room.
    ///
    /// Never waits on a client: a full outbound queue drops the frame for
    /// that session only.
    pub fn fan_out(&self, envelope: &BrokerEnvelope) -> FanoutReport {
        let message: ChatMessage = match serde_json::from_slice(&envelope.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(routing_key = %envelope.routing_key, error = %e, "skipping undecodable envelope");
                return FanoutReport::default();
            }
        };

        let participants = self.inner.membership.participants_of(&envelope.routing_key);
        if participants.is_empty() {
            return FanoutReport::default();
        }

        let frame: Arc<str> = match serde_json::to_string(&message) {
            Ok(text) => text.into(),
            Err(e) => {
                warn!(routing_key = %envelope.routing_key, error = %e, "failed to encode outbound frame");
                return FanoutReport::default();
            }
        };

        let mut report = FanoutReport::default();
        for session in self.inner.registry.sessions_for(&participants) {
            match session.try_enqueue(frame.clone()) {
                EnqueueOutcome::Delivered => report.delivered += 1,
                EnqueueOutcome::Full => {
                    report.dropped += 1;
                    warn!(
                        user_id = %session.user_id(),
                        room_id = %envelope.routing_key,
                        "outbound queue full, dropping message"
                    );
                }
                EnqueueOutcome::Closed => {
                    debug!(user_id = %session.user_id(), "session closing, message not delivered");
                }
            }
        }

        let stats = &self.inner.stats;
        stats
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        stats
            .dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        metrics::FANOUT_DELIVERED.inc_by(report.delivered as u64);
        metrics::FANOUT_DROPPED.inc_by(report.dropped as u64);

        report
    }

    /// Fans out every delivery until the stream fails or ends
    pub async fn run_consumer(self, mut deliveries: DeliveryStream) -> Result<(), BrokerError> {
        while let Some(item) = deliveries.next().await {
            match item {
                Ok(envelope) => {
                    self.fan_out(&envelope);
                }
                Err(e) => {
                    error!(error = %e, "broker consume loop stopped");
                    return Err(e);
                }
            }
        }

        error!("broker delivery stream ended");
        Err(BrokerError::StreamClosed)
    }

    /// Binds `queue` to `exchange` and spawns the consume loop.
    ///
    /// Returns once the binding is in place, so messages published after
    /// this call are not missed.
    pub async fn start_consumer(
        &self,
        exchange: &str,
        queue: &str,
    ) -> Result<JoinHandle<Result<(), BrokerError>>, BrokerError> {
        let deliveries = self.inner.broker.consume(exchange, queue).await?;
        let relay = self.clone();
        Ok(tokio::spawn(relay.run_consumer(deliveries)))
    }

    /// Adds `user_id` to `room_id` durably and, if the user is connected,
    /// to the live session.
    pub async fn join_room(&self, room_id: &str, user_id: &str) -> Result<(), PersistError> {
        self.inner.rooms.add_participant(room_id, user_id).await?;

        let membership = &self.inner.membership;
        let live = self.inner.registry.with_registered(user_id, |handle| {
            handle.add_room(room_id);
            membership.join(room_id, user_id);
        });
        info!(room_id, user_id, live, "joined room");
        Ok(())
    }

    pub async fn leave_room(&self, room_id: &str, user_id: &str) -> Result<(), PersistError> {
        self.inner.rooms.remove_participant(room_id, user_id).await?;

        let membership = &self.inner.membership;
        let live = self.inner.registry.with_registered(user_id, |handle| {
            handle.remove_room(room_id);
            membership.leave(room_id, user_id);
        });
        if !live {
            membership.leave(room_id, user_id);
        }
        info!(room_id, user_id, "left room");
        Ok(())
    }
}
