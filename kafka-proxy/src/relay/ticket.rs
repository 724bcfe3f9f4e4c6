use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::AbortHandle;

use crate::listener::Acknowledgment;
use crate::record::{Partition, Record};
use crate::relay::connection::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub u64);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a delivery attempt did not end in an acknowledgment. The display form
/// is recorded as the dead-letter failure reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    #[error("connection {0} closed before acknowledging")]
    Disconnected(ConnectionId),

    #[error("not acknowledged by connection {0} within {1}ms")]
    AckTimeout(ConnectionId, u128),

    #[error("proxy relay is closed")]
    RelayClosed,
}

impl DeliveryFailure {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryFailure::Disconnected(_) => "disconnected",
            DeliveryFailure::AckTimeout(..) => "ack_timeout",
            DeliveryFailure::RelayClosed => "relay_closed",
        }
    }
}

/// A record handed to the relay and not yet acknowledged or dead-lettered.
pub(crate) struct DeliveryTicket {
    pub id: TicketId,
    pub record: Record,
    pub ack: Acknowledgment,
    /// Delivery attempts started so far
    pub attempt_count: u32,
    pub created_at: Instant,
    pub dispatched_at: Option<Instant>,
    pub destination: Option<ConnectionId>,
    pub last_failure: Option<DeliveryFailure>,
    pub timer: Option<AbortHandle>,
    /// Held until the ticket is destroyed
    pub _permit: OwnedSemaphorePermit,
}

impl DeliveryTicket {
    pub fn new(id: TicketId, record: Record, ack: Acknowledgment, permit: OwnedSemaphorePermit) -> Self {
        Self {
            id,
            record,
            ack,
            attempt_count: 0,
            created_at: Instant::now(),
            dispatched_at: None,
            destination: None,
            last_failure: None,
            timer: None,
            _permit: permit,
        }
    }

    pub fn partition(&self) -> Partition {
        self.record.topic_partition()
    }

    /// Start a new attempt towards `destination`.
    pub fn mark_dispatched(&mut self, destination: ConnectionId) -> u32 {
        self.attempt_count += 1;
        self.destination = Some(destination);
        self.dispatched_at = Some(Instant::now());
        self.attempt_count
    }

    /// End the current attempt. Returns false if `attempt` is not the current
    /// one, which happens when a timer fires after the ticket moved on.
    pub fn mark_failed(&mut self, attempt: u32, failure: DeliveryFailure) -> bool {
        if self.destination.is_none() || self.attempt_count != attempt {
            return false;
        }
        self.cancel_timer();
        self.destination = None;
        self.dispatched_at = None;
        self.last_failure = Some(failure);
        true
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn failure_reason(&self) -> String {
        self.last_failure
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "delivery failed".to_string())
    }
}

impl fmt::Debug for DeliveryTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryTicket")
            .field("id", &self.id)
            .field("partition", &self.record.partition)
            .field("offset", &self.record.offset)
            .field("attempt_count", &self.attempt_count)
            .field("destination", &self.destination)
            .field("dispatched_at", &self.dispatched_at)
            .finish()
    }
}
