use std::sync::Arc;

use anyhow::Result;

use crate::engine::cursor::OffsetLedger;
use crate::listener::AcknowledgeListener;
use crate::strategy::{Dispatch, DispatchOutcome};

/// Tracks each record and gives the listener its acknowledgment.
///
/// The offset becomes committable once the listener acknowledges it and every
/// lower tracked offset of the partition has been acknowledged too, so
/// out-of-order acknowledgments never open a gap.
pub struct ImmediateAckStrategy {
    listener: Arc<dyn AcknowledgeListener>,
    ledger: Arc<OffsetLedger>,
}

impl ImmediateAckStrategy {
    pub fn new(listener: Arc<dyn AcknowledgeListener>, ledger: Arc<OffsetLedger>) -> Self {
        Self { listener, ledger }
    }

    pub fn on_message(&mut self, dispatch: Dispatch) -> Result<DispatchOutcome> {
        match dispatch {
            Dispatch::Record(record) => {
                let ack = self.ledger.track(&record);
                self.listener.on_message(record, ack)?;
                Ok(DispatchOutcome::Delivered)
            }
            Dispatch::EmptyBatch => Ok(DispatchOutcome::Idle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{OffsetCommit, Partition, Record};
    use crate::test_utils::RecordingAckListener;

    fn record(offset: i64) -> Record {
        Record::new("events", 0, offset, None, Some(b"v".to_vec()), None)
    }

    #[test]
    fn test_acknowledged_record_becomes_committable() {
        let ledger = Arc::new(OffsetLedger::new());
        let listener = Arc::new(RecordingAckListener::acking());
        let mut strategy = ImmediateAckStrategy::new(listener.clone(), ledger.clone());

        strategy.on_message(Dispatch::Record(record(4))).unwrap();

        assert_eq!(listener.offsets(), vec![4]);
        assert_eq!(
            ledger.take_commits(),
            vec![OffsetCommit::new(Partition::new("events", 0), 4)]
        );
    }

    #[test]
    fn test_deferred_acks_commit_without_gaps() {
        let ledger = Arc::new(OffsetLedger::new());
        let listener = Arc::new(RecordingAckListener::holding());
        let mut strategy = ImmediateAckStrategy::new(listener.clone(), ledger.clone());

        for offset in 0..3 {
            strategy.on_message(Dispatch::Record(record(offset))).unwrap();
        }

        let mut held = listener.take_held();
        assert_eq!(held.len(), 3);

        // Acknowledge the newest first, nothing may be committed yet
        held.pop().unwrap().acknowledge();
        assert!(ledger.take_commits().is_empty());

        for ack in held {
            ack.acknowledge();
        }
        assert_eq!(
            ledger.take_commits(),
            vec![OffsetCommit::new(Partition::new("events", 0), 2)]
        );
    }

    #[test]
    fn test_failed_record_is_not_committed() {
        let ledger = Arc::new(OffsetLedger::new());
        let listener = Arc::new(RecordingAckListener::failing());
        let mut strategy = ImmediateAckStrategy::new(listener, ledger.clone());

        assert!(strategy.on_message(Dispatch::Record(record(9))).is_err());
        assert!(ledger.take_commits().is_empty());
    }
}
