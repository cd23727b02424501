//! Transport seam between the channel state machine and the wire.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{errors::ChannelError, models::Position};

use crate::token::AccessToken;

/// Who is connecting and for which role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Subject announced in the handshake.
    pub subject_id: String,
    /// Role announced in the handshake.
    pub role: String,
}

impl Identity {
    /// Identity for `subject_id` acting as `role`.
    pub fn new(subject_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            role: role.into(),
        }
    }
}

/// Everything a handshake carries.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Bearer token for this attempt.
    pub token: AccessToken,
    /// Who is connecting.
    pub identity: Identity,
}

/// Frame received from an established session.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A location payload, not yet validated.
    Location(serde_json::Value),
    /// The server ended the session.
    Closed {
        /// Reason given by the server, possibly empty.
        reason: String,
    },
    /// Keep-alive with no payload.
    Heartbeat,
}

/// Opens realtime sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Session produced by a successful handshake.
    type Session: TransportSession;

    /// Performs the handshake and returns an established session.
    ///
    /// # Errors
    /// Returns [`ChannelError::Auth`] when the server rejects the credentials,
    /// or a network/server/protocol error otherwise.
    async fn connect(&self, handshake: Handshake) -> Result<Self::Session, ChannelError>;
}

/// One established realtime session.
#[async_trait]
pub trait TransportSession: Send + 'static {
    /// # Errors
    /// Returns an error if the server refuses the subscription.
    async fn subscribe(&mut self, scope: &str) -> Result<(), ChannelError>;

    /// # Errors
    /// Returns an error if the request cannot be delivered.
    async fn unsubscribe(&mut self, scope: &str) -> Result<(), ChannelError>;

    /// # Errors
    /// Returns an error if the emission cannot be delivered.
    async fn publish_location(&mut self, position: Position) -> Result<(), ChannelError>;

    /// Waits for the next frame; `None` once the stream is exhausted.
    ///
    /// Must be cancel-safe: the driver polls it inside `select!`.
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, ChannelError>>;
}
