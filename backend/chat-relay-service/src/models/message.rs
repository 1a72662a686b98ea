use super::Principal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame sent by a client over the socket
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    pub room_id: String,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("roomId must not be empty")]
    EmptyRoomId,

    #[error("binary frames are not supported")]
    Binary,
}

/// A chat message as it moves through the relay.
///
/// The serialized form is both the broker body and the frame written to
/// clients: `{id, roomId, senderId, username, content, timestamp}`.
/// `id` and `timestamp` are absent until the message store assigns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Option<String>,
    pub room_id: String,
    pub sender_id: String,
    #[serde(rename = "username")]
    pub sender_username: String,
    pub content: String,
    #[serde(rename = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Builds an unpersisted message from a client frame. Sender fields are
    /// taken from the principal, never from the payload.
    pub fn from_frame(frame: InboundFrame, principal: &Principal) -> Self {
        Self {
            id: None,
            room_id: frame.room_id,
            sender_id: principal.user_id.clone(),
            sender_username: principal.username.clone(),
            content: frame.content,
            created_at: None,
        }
    }

    /// Decodes raw client text into a message owned by `principal`
    pub fn decode_client_text(text: &str, principal: &Principal) -> Result<Self, DecodeError> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        if frame.room_id.trim().is_empty() {
            return Err(DecodeError::EmptyRoomId);
        }
        Ok(Self::from_frame(frame, principal))
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some() && self.created_at.is_some()
    }
}
