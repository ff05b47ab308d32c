//! Message id table of a service interface.
//!
//! Generated interfaces describe their messages once; the proxy consults the
//! table to pair requests with responses and to tell subscriptions apart from
//! one-shot calls.

use std::collections::HashMap;
use svclink_types::{MessageId, ResultType};

/// Role of a message id within an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Attribute,
    Broadcast,
}

impl MessageKind {
    /// Attributes and broadcasts are delivered to subscribers until stopped.
    pub fn is_notification(self) -> bool {
        matches!(self, MessageKind::Attribute | MessageKind::Broadcast)
    }
}

/// Builder-style table of the messages one interface declares.
#[derive(Debug, Clone, Default)]
pub struct InterfaceTable {
    kinds: HashMap<MessageId, MessageKind>,
    responses: HashMap<MessageId, MessageId>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a request, optionally answered by `response`.
    pub fn request(mut self, id: MessageId, response: Option<MessageId>) -> Self {
        self.kinds.insert(id, MessageKind::Request);
        if let Some(response) = response {
            self.kinds.insert(response, MessageKind::Response);
            self.responses.insert(id, response);
        }
        self
    }

    /// Declare an attribute; its last valid value is cached by the proxy.
    pub fn attribute(mut self, id: MessageId) -> Self {
        self.kinds.insert(id, MessageKind::Attribute);
        self
    }

    /// Declare a broadcast delivered to every subscriber.
    pub fn broadcast(mut self, id: MessageId) -> Self {
        self.kinds.insert(id, MessageKind::Broadcast);
        self
    }

    pub fn kind(&self, id: MessageId) -> Option<MessageKind> {
        self.kinds.get(&id).copied()
    }

    pub fn is_known(&self, id: MessageId) -> bool {
        self.kinds.contains_key(&id)
    }

    pub fn is_notification(&self, id: MessageId) -> bool {
        self.kind(id).is_some_and(MessageKind::is_notification)
    }

    /// Response id answering `request`, if the request expects one.
    pub fn response_for(&self, request: MessageId) -> Option<MessageId> {
        self.responses.get(&request).copied()
    }

    /// Id under which listeners of a result are registered.
    ///
    /// Failures produced before a request reached its stub carry the request
    /// id; callers wait on the response id.
    pub fn listener_id(&self, id: MessageId, result: ResultType) -> MessageId {
        if result.needs_remap() && self.kind(id) == Some(MessageKind::Request) {
            self.response_for(id).unwrap_or(id)
        } else {
            id
        }
    }
}
