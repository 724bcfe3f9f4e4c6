//! The listener contract consumers of the engine implement.
//!
//! A listener decides what "handled" means for a record:
//! - [`AutoCommitListener`]: returning is enough, offsets are committed by the
//!   client's periodic auto commit.
//! - [`AcknowledgeListener`]: every record comes with an [`Acknowledgment`]
//!   that must be acknowledged, possibly later and from another thread.
//! - [`BatchAcknowledgeListener`]: records are delivered in batches, and a
//!   successful return acknowledges the whole batch.

use std::fmt;
use std::sync::{Arc, Weak};

use anyhow::Result;

use crate::engine::cursor::OffsetLedger;
use crate::record::{Partition, Record};

pub trait AutoCommitListener: Send + Sync {
    fn on_message(&self, record: &Record) -> Result<()>;
}

pub trait AcknowledgeListener: Send + Sync {
    /// Returning an error leaves the record unacknowledged; it is delivered
    /// again after the next rebalance or restart.
    fn on_message(&self, record: Record, ack: Acknowledgment) -> Result<()>;
}

pub trait BatchAcknowledgeListener: Send + Sync {
    fn on_messages(&self, records: &[Record]) -> Result<()>;
}

/// The listener bound to an engine, tagged by its acknowledgment kind.
#[derive(Clone)]
pub enum Listener {
    AutoCommit(Arc<dyn AutoCommitListener>),
    Acknowledge(Arc<dyn AcknowledgeListener>),
    BatchAcknowledge(Arc<dyn BatchAcknowledgeListener>),
}

impl Listener {
    pub fn auto_commit(listener: impl AutoCommitListener + 'static) -> Self {
        Listener::AutoCommit(Arc::new(listener))
    }

    pub fn acknowledge(listener: impl AcknowledgeListener + 'static) -> Self {
        Listener::Acknowledge(Arc::new(listener))
    }

    pub fn batch_acknowledge(listener: impl BatchAcknowledgeListener + 'static) -> Self {
        Listener::BatchAcknowledge(Arc::new(listener))
    }

    pub fn requires_manual_commit(&self) -> bool {
        !matches!(self, Listener::AutoCommit(_))
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Listener::AutoCommit(_) => "AutoCommit",
            Listener::Acknowledge(_) => "Acknowledge",
            Listener::BatchAcknowledge(_) => "BatchAcknowledge",
        };
        write!(f, "Listener::{kind}")
    }
}

/// Handle to acknowledge a single tracked record.
///
/// Consumed on use, so a record can be acknowledged at most once. Dropping it
/// without acknowledging leaves the record uncommitted. Acknowledging after
/// the partition was revoked, or after the engine went away, is a no-op.
#[derive(Debug)]
pub struct Acknowledgment {
    ledger: Weak<OffsetLedger>,
    partition: Partition,
    offset: i64,
    epoch: u64,
}

impl Acknowledgment {
    pub(crate) fn new(
        ledger: Weak<OffsetLedger>,
        partition: Partition,
        offset: i64,
        epoch: u64,
    ) -> Self {
        Self {
            ledger,
            partition,
            offset,
            epoch,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false when the acknowledgment no longer applies.
    pub fn acknowledge(self) -> bool {
        match self.ledger.upgrade() {
            Some(ledger) => ledger.acknowledge(&self.partition, self.offset, self.epoch),
            None => false,
        }
    }

    /// Acknowledge this record and every tracked record before it in the
    /// partition.
    pub(crate) fn complete_through(self) -> bool {
        match self.ledger.upgrade() {
            Some(ledger) => ledger.complete_through(&self.partition, self.offset, self.epoch),
            None => false,
        }
    }
}
