//! Consumers of proxy results.

use std::fmt;
use std::sync::Arc;
use svclink_types::{ConnectionState, MessageId, ProxyAddress, ResultType, SequenceNumber};
use thiserror::Error;
use tracing::warn;

/// Identifies one consumer object among those sharing a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// Failure reported by a consumer callback.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Handler failed: {0}")]
    Handler(String),
}

/// A response, attribute update or broadcast as seen by a consumer.
///
/// `message_id` is the id the consumer subscribed under, after remapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub message_id: MessageId,
    pub sequence_nr: SequenceNumber,
    pub result: ResultType,
    pub payload: Vec<u8>,
}

/// Callbacks a consumer receives from its proxy.
pub trait ProxyConsumer: Send + Sync {
    /// The proxy connected to or lost its stub.
    fn on_connection(
        &self,
        _proxy: &ProxyAddress,
        _state: ConnectionState,
    ) -> Result<(), ConsumerError> {
        Ok(())
    }

    fn on_response(&self, response: &ProxyResponse) -> Result<(), ConsumerError>;
}

/// A callback prepared under the proxy lock and run after releasing it.
pub(crate) enum Delivery {
    Connection {
        id: ConsumerId,
        consumer: Arc<dyn ProxyConsumer>,
        proxy: ProxyAddress,
        state: ConnectionState,
    },
    Response {
        id: ConsumerId,
        consumer: Arc<dyn ProxyConsumer>,
        response: ProxyResponse,
    },
}

/// Run every delivery; a failing consumer does not stop the others.
/// Returns the number of callbacks that failed.
pub(crate) fn run_deliveries(deliveries: Vec<Delivery>) -> usize {
    let mut failed = 0;
    for delivery in deliveries {
        let (id, result) = match delivery {
            Delivery::Connection {
                id,
                consumer,
                proxy,
                state,
            } => (id, consumer.on_connection(&proxy, state)),
            Delivery::Response {
                id,
                consumer,
                response,
            } => (id, consumer.on_response(&response)),
        };
        if let Err(e) = result {
            warn!(consumer = %id, error = %e, "Consumer callback failed");
            failed += 1;
        }
    }
    failed
}
