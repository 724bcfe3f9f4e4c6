//! Dispatch strategies: what "handled" means for a fetched record.
//!
//! The registry picks exactly one strategy per engine when the listener is
//! bound. The engine feeds it every record, plus an explicit empty-batch
//! signal whenever a poll returns nothing.

mod auto_commit;
mod batch_ack;
mod immediate_ack;

use std::fmt;

use anyhow::Result;
use serde::Serialize;

use crate::record::Record;

pub use auto_commit::AutoCommitStrategy;
pub use batch_ack::BatchAckStrategy;
pub use immediate_ack::ImmediateAckStrategy;

/// What the poll loop hands a strategy.
#[derive(Debug)]
pub enum Dispatch {
    Record(Record),
    /// The last poll returned no records
    EmptyBatch,
}

/// What a strategy did with a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the listener
    Delivered,
    /// Held back until the batch fills or is flushed
    Buffered,
    /// A buffered batch was delivered and acknowledged; commit now
    Flushed,
    /// Nothing to do
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    AutoCommit,
    ImmediateAck,
    BatchAck,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::AutoCommit => "auto_commit",
            StrategyKind::ImmediateAck => "immediate_ack",
            StrategyKind::BatchAck => "batch_ack",
        };
        f.write_str(name)
    }
}

pub enum DispatchStrategy {
    AutoCommit(AutoCommitStrategy),
    ImmediateAck(ImmediateAckStrategy),
    BatchAck(BatchAckStrategy),
}

impl DispatchStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            DispatchStrategy::AutoCommit(_) => StrategyKind::AutoCommit,
            DispatchStrategy::ImmediateAck(_) => StrategyKind::ImmediateAck,
            DispatchStrategy::BatchAck(_) => StrategyKind::BatchAck,
        }
    }

    /// Whether fetched records are tracked in the offset ledger. Auto commit
    /// leaves offset management to the broker client.
    pub fn tracks_offsets(&self) -> bool {
        !matches!(self, DispatchStrategy::AutoCommit(_))
    }

    pub fn on_message(&mut self, dispatch: Dispatch) -> Result<DispatchOutcome> {
        match self {
            DispatchStrategy::AutoCommit(s) => s.on_message(dispatch),
            DispatchStrategy::ImmediateAck(s) => s.on_message(dispatch),
            DispatchStrategy::BatchAck(s) => s.on_message(dispatch),
        }
    }
}

impl fmt::Debug for DispatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DispatchStrategy::{}", self.kind())
    }
}
