//! Realtime channel state and the health derived from it.

use std::{collections::BTreeSet, time::Duration};

use serde::{Deserialize, Serialize};

/// Connection phase of a realtime channel.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    /// Idle; only `connect` leaves this phase.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Session established; frames are flowing.
    Connected,
    /// Waiting for the scheduled reconnect.
    Backoff,
}

/// Observable state of one realtime channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelState {
    /// Current phase.
    pub phase: ChannelPhase,
    /// Consecutive failed attempts; reset on every successful connect.
    pub reconnect_attempt: u32,
    /// Scopes to (re-)subscribe after every successful connect.
    pub subscribed_scopes: BTreeSet<String>,
    /// Delay of the currently scheduled reconnect, while in `Backoff`.
    pub retry_in: Option<Duration>,
    /// Set when the channel halted because the session is no longer valid.
    pub auth_failed: bool,
}

impl ChannelState {
    /// Whether the phase is `Connected`.
    pub const fn is_connected(&self) -> bool {
        matches!(self.phase, ChannelPhase::Connected)
    }
}

/// Health flag shown to users next to the map.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ConnectionHealth {
    /// Nothing is running.
    #[default]
    Stopped,
    /// Push channel is connected.
    Live,
    /// Push channel is down and being retried; polling keeps data flowing.
    Reconnecting {
        /// Failed attempts so far.
        attempt: u32,
    },
    /// Push channel failed persistently; only the snapshot poll feeds the view.
    PollingOnly,
    /// Credentials are no longer valid; background work has halted.
    SessionExpired,
}

impl ConnectionHealth {
    /// Short human-readable label.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Live => "live",
            Self::Reconnecting { .. } => "reconnecting",
            Self::PollingOnly => "polling-only",
            Self::SessionExpired => "session expired",
        }
    }

    /// Terminal health stays until the reconciler is restarted.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::SessionExpired)
    }
}
