use std::sync::Arc;

use anyhow::Result;

use crate::listener::AutoCommitListener;
use crate::strategy::{Dispatch, DispatchOutcome};

/// Hands each record to the listener. Offsets advance through the broker
/// client's periodic auto commit, never from here.
pub struct AutoCommitStrategy {
    listener: Arc<dyn AutoCommitListener>,
}

impl AutoCommitStrategy {
    pub fn new(listener: Arc<dyn AutoCommitListener>) -> Self {
        Self { listener }
    }

    pub fn on_message(&mut self, dispatch: Dispatch) -> Result<DispatchOutcome> {
        match dispatch {
            Dispatch::Record(record) => {
                self.listener.on_message(&record)?;
                Ok(DispatchOutcome::Delivered)
            }
            Dispatch::EmptyBatch => Ok(DispatchOutcome::Idle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::test_utils::RecordingAutoCommitListener;

    #[test]
    fn test_delivers_records_and_ignores_empty_batches() {
        let listener = Arc::new(RecordingAutoCommitListener::default());
        let mut strategy = AutoCommitStrategy::new(listener.clone());

        let outcome = strategy
            .on_message(Dispatch::Record(Record::new("t", 0, 5, None, None, None)))
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Delivered);
        assert_eq!(
            strategy.on_message(Dispatch::EmptyBatch).unwrap(),
            DispatchOutcome::Idle
        );
        assert_eq!(listener.offsets(), vec![5]);
    }

    #[test]
    fn test_listener_error_is_returned() {
        let listener = Arc::new(RecordingAutoCommitListener::failing());
        let mut strategy = AutoCommitStrategy::new(listener);

        let result = strategy.on_message(Dispatch::Record(Record::new("t", 0, 1, None, None, None)));
        assert!(result.is_err());
    }
}
