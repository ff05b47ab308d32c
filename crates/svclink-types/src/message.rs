//! Message identifiers, sequence numbers and result codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a request, response, attribute or broadcast of a service
/// interface. Interfaces assign their own id tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Sequence number correlating a response with the call that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Used by attribute and broadcast subscriptions.
    pub const NOTIFY: SequenceNumber = SequenceNumber(0);
    /// Wildcard matching any sequence number.
    pub const ANY: SequenceNumber = SequenceNumber(u64::MAX);

    pub fn is_any(self) -> bool {
        self == Self::ANY
    }

    /// The next call sequence number, skipping the reserved values.
    pub fn next(self) -> SequenceNumber {
        match self.0.wrapping_add(1) {
            0 | u64::MAX => SequenceNumber(1),
            n => SequenceNumber(n),
        }
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            f.write_str("any")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Result code carried by a response event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ResultType {
    Ok = 0,
    Invalid = 1,
    RequestError = 2,
    RequestCanceled = 3,
    MessageUndelivered = 4,
    ServiceUnavailable = 5,
    DataInvalid = 6,
    /// Attribute or broadcast notification.
    NotifyOk = 7,
}

impl ResultType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ResultType::Ok,
            2 => ResultType::RequestError,
            3 => ResultType::RequestCanceled,
            4 => ResultType::MessageUndelivered,
            5 => ResultType::ServiceUnavailable,
            6 => ResultType::DataInvalid,
            7 => ResultType::NotifyOk,
            _ => ResultType::Invalid,
        }
    }

    /// A call or notification that carries a valid payload.
    pub fn is_success(self) -> bool {
        matches!(self, ResultType::Ok | ResultType::NotifyOk)
    }

    /// Results that may carry the id of the request instead of the
    /// response and must be remapped before listener lookup.
    pub fn needs_remap(self) -> bool {
        matches!(
            self,
            ResultType::MessageUndelivered | ResultType::RequestCanceled
        )
    }
}

/// Upstream subscription control for attributes and broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum NotifyRequest {
    Start = 0,
    Stop = 1,
}

impl NotifyRequest {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(NotifyRequest::Start),
            1 => Some(NotifyRequest::Stop),
            _ => None,
        }
    }
}
