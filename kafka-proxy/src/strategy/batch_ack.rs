use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::engine::cursor::OffsetLedger;
use crate::listener::{Acknowledgment, BatchAcknowledgeListener};
use crate::record::{Partition, Record};
use crate::strategy::{Dispatch, DispatchOutcome};

/// Buffers records and delivers them to the listener as one batch.
///
/// A batch is flushed once it holds `batch_size` records, or on the first
/// empty poll after records were buffered. When the listener succeeds, every
/// partition in the batch is completed through its highest offset.
pub struct BatchAckStrategy {
    listener: Arc<dyn BatchAcknowledgeListener>,
    ledger: Arc<OffsetLedger>,
    batch_size: usize,
    buffer: Vec<(Record, Acknowledgment)>,
}

impl BatchAckStrategy {
    pub fn new(
        listener: Arc<dyn BatchAcknowledgeListener>,
        ledger: Arc<OffsetLedger>,
        batch_size: usize,
    ) -> Self {
        Self {
            listener,
            ledger,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn on_message(&mut self, dispatch: Dispatch) -> Result<DispatchOutcome> {
        match dispatch {
            Dispatch::Record(record) => {
                let ack = self.ledger.track(&record);
                self.buffer.push((record, ack));
                if self.buffer.len() >= self.batch_size {
                    self.flush()
                } else {
                    Ok(DispatchOutcome::Buffered)
                }
            }
            Dispatch::EmptyBatch if self.buffer.is_empty() => Ok(DispatchOutcome::Idle),
            Dispatch::EmptyBatch => self.flush(),
        }
    }

    fn flush(&mut self) -> Result<DispatchOutcome> {
        let batch = mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let (records, acks): (Vec<Record>, Vec<Acknowledgment>) = batch.into_iter().unzip();

        debug!(records = records.len(), "Flushing batch");
        // On failure the acknowledgments are dropped and the batch stays uncommitted
        self.listener.on_messages(&records)?;

        let mut highest: HashMap<Partition, Acknowledgment> = HashMap::new();
        for ack in acks {
            match highest.get(ack.partition()) {
                Some(current) if current.offset() >= ack.offset() => {}
                _ => {
                    highest.insert(ack.partition().clone(), ack);
                }
            }
        }
        for ack in highest.into_values() {
            ack.complete_through();
        }

        Ok(DispatchOutcome::Flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OffsetCommit;
    use crate::test_utils::RecordingBatchListener;

    fn record(partition: i32, offset: i64) -> Dispatch {
        Dispatch::Record(Record::new("events", partition, offset, None, None, None))
    }

    #[test]
    fn test_full_batch_commits_highest_offset() {
        let ledger = Arc::new(OffsetLedger::new());
        let listener = Arc::new(RecordingBatchListener::default());
        let mut strategy = BatchAckStrategy::new(listener.clone(), ledger.clone(), 3);

        assert_eq!(strategy.on_message(record(0, 10)).unwrap(), DispatchOutcome::Buffered);
        assert_eq!(strategy.on_message(record(0, 11)).unwrap(), DispatchOutcome::Buffered);
        assert!(ledger.take_commits().is_empty());

        assert_eq!(strategy.on_message(record(0, 12)).unwrap(), DispatchOutcome::Flushed);
        assert_eq!(listener.batches(), vec![vec![10, 11, 12]]);
        assert_eq!(
            ledger.take_commits(),
            vec![OffsetCommit::new(Partition::new("events", 0), 12)]
        );
    }

    #[test]
    fn test_empty_batch_flushes_partial_batch() {
        let ledger = Arc::new(OffsetLedger::new());
        let listener = Arc::new(RecordingBatchListener::default());
        let mut strategy = BatchAckStrategy::new(listener.clone(), ledger.clone(), 100);

        assert_eq!(strategy.on_message(Dispatch::EmptyBatch).unwrap(), DispatchOutcome::Idle);

        strategy.on_message(record(0, 1)).unwrap();
        strategy.on_message(record(1, 7)).unwrap();
        assert_eq!(strategy.buffered(), 2);

        assert_eq!(strategy.on_message(Dispatch::EmptyBatch).unwrap(), DispatchOutcome::Flushed);
        assert_eq!(strategy.buffered(), 0);
        assert_eq!(
            ledger.take_commits(),
            vec![
                OffsetCommit::new(Partition::new("events", 0), 1),
                OffsetCommit::new(Partition::new("events", 1), 7),
            ]
        );
    }

    #[test]
    fn test_failed_batch_is_not_committed() {
        let ledger = Arc::new(OffsetLedger::new());
        let listener = Arc::new(RecordingBatchListener::failing());
        let mut strategy = BatchAckStrategy::new(listener, ledger.clone(), 2);

        strategy.on_message(record(0, 1)).unwrap();
        assert!(strategy.on_message(record(0, 2)).is_err());
        assert_eq!(strategy.buffered(), 0);
        assert!(ledger.take_commits().is_empty());
    }
}
