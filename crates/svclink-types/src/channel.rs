//! Connection handles: thread ids, cookies and the [`Channel`] tuple.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric id of a dispatcher thread. `0` is unknown.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ThreadId(pub u64);

impl ThreadId {
    pub const UNKNOWN: ThreadId = ThreadId(0);

    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection/session identifier.
///
/// Distinguishes local delivery from a specific remote peer connection.
/// Values from [`Cookie::FIRST_REMOTE`] upwards are assigned by the router
/// transport, one per peer connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Cookie(pub u64);

impl Cookie {
    pub const UNKNOWN: Cookie = Cookie(0);
    pub const LOCAL: Cookie = Cookie(1);
    pub const ROUTER: Cookie = Cookie(2);
    pub const FIRST_REMOTE: Cookie = Cookie(256);
    /// Wildcard used by scoped queries and removals.
    pub const ANY: Cookie = Cookie(u64::MAX);

    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN
    }

    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }

    /// Assigned by the router to a peer process connection.
    pub fn is_remote(self) -> bool {
        self >= Self::FIRST_REMOTE && self != Self::ANY
    }

    /// Whether `self` falls within the scope `filter` (`ANY` matches all).
    pub fn matches(self, filter: Cookie) -> bool {
        filter == Self::ANY || self == filter
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Routing handle of a service endpoint: where events come from and go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Channel {
    pub cookie: Cookie,
    pub source: ThreadId,
    pub target: ThreadId,
}

impl Channel {
    pub fn new(cookie: Cookie, source: ThreadId, target: ThreadId) -> Self {
        Self {
            cookie,
            source,
            target,
        }
    }

    /// A channel for an endpoint hosted by a local thread.
    pub fn local(source: ThreadId) -> Self {
        Self::new(Cookie::LOCAL, source, ThreadId::UNKNOWN)
    }

    /// An operable channel has a known cookie and a known source. Remote
    /// endpoints are reached through the router by cookie alone.
    pub fn is_valid(&self) -> bool {
        self.cookie.is_remote() || (self.cookie.is_known() && self.source.is_known())
    }

    /// Valid and pointed at a peer endpoint.
    pub fn is_connected(&self) -> bool {
        self.is_valid() && self.target.is_known()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.cookie, self.source, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_classes() {
        assert!(Cookie::LOCAL.is_local());
        assert!(!Cookie::LOCAL.is_remote());
        assert!(Cookie(300).is_remote());
        assert!(!Cookie::ANY.is_remote());
        assert!(!Cookie::UNKNOWN.is_known());
    }

    #[test]
    fn test_cookie_matches() {
        assert!(Cookie(300).matches(Cookie::ANY));
        assert!(Cookie(300).matches(Cookie(300)));
        assert!(!Cookie(300).matches(Cookie(301)));
    }

    #[test]
    fn test_channel_validity() {
        assert!(!Channel::default().is_valid());
        let channel = Channel::local(ThreadId(7));
        assert!(channel.is_valid());
        assert!(!channel.is_connected());
        let connected = Channel::new(Cookie::LOCAL, ThreadId(7), ThreadId(9));
        assert!(connected.is_connected());
        assert_eq!(connected.to_string(), "1:7->9");
        let remote = Channel::new(Cookie(300), ThreadId::UNKNOWN, ThreadId::UNKNOWN);
        assert!(remote.is_valid());
    }
}
