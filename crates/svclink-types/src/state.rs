//! Connection states and disconnect reasons.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of a provider or consumer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Identity is insufficient to ever connect.
    #[default]
    Unknown,
    /// Identity is known, no counterpart yet.
    Pending,
    /// Handshake complete, messages may flow.
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Staying in the same state is always allowed. `Unknown -> Connected`
    /// is never allowed: an address must become valid first.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (a, b) if a == b => true,
            (_, Unknown) => true,
            (Unknown, Pending) => true,
            (Pending, Connected) => true,
            (Connected, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Pending => "pending",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DisconnectReason {
    #[default]
    Undefined = 0,
    /// The provider unregistered.
    ProviderDisconnected = 1,
    /// The consumer unregistered.
    ConsumerDisconnected = 2,
    /// The provider refused the consumer.
    ServiceRejected = 3,
    /// The link to the router went down.
    RouterDisconnected = 4,
    /// The hosting dispatcher thread no longer exists.
    ThreadDestroyed = 5,
}

impl DisconnectReason {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => DisconnectReason::ProviderDisconnected,
            2 => DisconnectReason::ConsumerDisconnected,
            3 => DisconnectReason::ServiceRejected,
            4 => DisconnectReason::RouterDisconnected,
            5 => DisconnectReason::ThreadDestroyed,
            _ => DisconnectReason::Undefined,
        }
    }
}
