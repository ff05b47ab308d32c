//! Listener table of a proxy.

use crate::consumer::ConsumerId;
use svclink_types::{MessageId, SequenceNumber};

/// Interest of one consumer in one message.
///
/// Request listeners carry the call's sequence number and are removed once
/// answered; subscriptions use [`SequenceNumber::NOTIFY`] and stay until
/// cleared. Equality is loose: a wildcard sequence number on either side
/// matches any listener of the same message, which is how "is anyone waiting
/// on this id" is asked.
#[derive(Debug, Clone, Copy)]
pub struct Listener {
    pub message_id: MessageId,
    pub sequence_nr: SequenceNumber,
    pub consumer: ConsumerId,
}

impl Listener {
    pub fn new(message_id: MessageId, sequence_nr: SequenceNumber, consumer: ConsumerId) -> Self {
        Self {
            message_id,
            sequence_nr,
            consumer,
        }
    }

    /// Field-by-field identity, ignoring the wildcard rule.
    pub fn is_identical(&self, other: &Listener) -> bool {
        self.message_id == other.message_id
            && self.sequence_nr == other.sequence_nr
            && self.consumer == other.consumer
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.message_id == other.message_id
            && (self.sequence_nr.is_any()
                || other.sequence_nr.is_any()
                || (self.sequence_nr == other.sequence_nr && self.consumer == other.consumer))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListenerList {
    listeners: Vec<Listener>,
}

impl ListenerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless an equal listener is already present.
    pub fn add(&mut self, listener: Listener) -> bool {
        if self.listeners.contains(&listener) {
            return false;
        }
        self.listeners.push(listener);
        true
    }

    /// Remove every listener equal to `listener`. Returns how many went.
    pub fn remove(&mut self, listener: &Listener) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(|l| l != listener);
        before - self.listeners.len()
    }

    pub fn remove_identical(&mut self, listener: &Listener) -> bool {
        match self.listeners.iter().position(|l| l.is_identical(listener)) {
            Some(index) => {
                self.listeners.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove all listeners of `consumer`, returning the affected message ids.
    pub fn remove_consumer(&mut self, consumer: ConsumerId) -> Vec<MessageId> {
        let mut affected = Vec::new();
        self.listeners.retain(|l| {
            if l.consumer != consumer {
                return true;
            }
            if !affected.contains(&l.message_id) {
                affected.push(l.message_id);
            }
            false
        });
        affected
    }

    pub fn has_message(&self, message_id: MessageId) -> bool {
        self.listeners.iter().any(|l| l.message_id == message_id)
    }

    /// Snapshot of the listeners a result for (`message_id`, `sequence_nr`)
    /// must reach. Callbacks may modify the list while the snapshot is used.
    pub fn prepare(&self, message_id: MessageId, sequence_nr: SequenceNumber) -> Vec<Listener> {
        self.listeners
            .iter()
            .filter(|l| {
                l.message_id == message_id
                    && (l.sequence_nr == sequence_nr
                        || l.sequence_nr.is_any()
                        || sequence_nr.is_any())
            })
            .copied()
            .collect()
    }

    /// Message ids with at least one listener.
    pub fn message_ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self.listeners.iter().map(|l| l.message_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Listener> {
        self.listeners.iter()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
