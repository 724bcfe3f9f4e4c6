use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::BrokerError;
use crate::record::{OffsetCommit, Partition, Record};

/// Notified by the broker client when the group coordinator moves
/// partitions. Called from within `poll`, on the poll thread.
pub trait RebalanceListener: Send + Sync {
    /// Returns offsets the client should commit synchronously before the
    /// partitions are handed to another group member.
    fn on_partitions_revoked(&self, partitions: &[Partition]) -> Vec<OffsetCommit>;

    fn on_partitions_assigned(&self, _partitions: &[Partition]) {}
}

/// The subset of a broker consumer the engine drives.
///
/// Implementations are not expected to be thread-safe; the engine only ever
/// touches a client through [`BrokerHandle`].
pub trait BrokerClient: Send {
    /// Join the consumer group for `topics`. The rebalance listener is
    /// optional.
    fn subscribe(
        &mut self,
        topics: &[String],
        listener: Option<Arc<dyn RebalanceListener>>,
    ) -> Result<(), BrokerError>;

    /// Consume an explicit partition list without group management.
    fn assign(&mut self, partitions: &[Partition]) -> Result<(), BrokerError>;

    /// Block for at most `timeout` and return up to `max_records` records.
    /// An empty batch is not an error.
    fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<Record>, BrokerError>;

    /// Fire-and-forget commit. The outcome is reported by the client itself.
    fn commit_async(&mut self, offsets: &[OffsetCommit]) -> Result<(), BrokerError>;

    fn unsubscribe(&mut self);

    fn close(&mut self);
}

/// The exclusion region around the broker client.
///
/// Poll, commit and close all go through the same mutex. Once released the
/// client is gone and every further call fails with [`BrokerError::Closed`].
pub struct BrokerHandle {
    client: Mutex<Option<Box<dyn BrokerClient>>>,
}

impl BrokerHandle {
    pub fn new(client: impl BrokerClient + 'static) -> Self {
        Self {
            client: Mutex::new(Some(Box::new(client))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn BrokerClient>>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the client.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&mut dyn BrokerClient) -> Result<R, BrokerError>,
    ) -> Result<R, BrokerError> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(client) => f(client.as_mut()),
            None => Err(BrokerError::Closed),
        }
    }

    /// Unsubscribe and close the client, then drop it. Returns false if the
    /// handle was already released.
    pub fn release(&self) -> bool {
        let Some(mut client) = self.lock().take() else {
            return false;
        };

        client.unsubscribe();
        client.close();
        info!("Broker client released");
        true
    }

    pub fn is_released(&self) -> bool {
        self.lock().is_none()
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        if !self.is_released() {
            warn!("Broker handle dropped without being released");
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockBroker;

    #[test]
    fn test_release_is_once() {
        let broker = MockBroker::new();
        let handle = BrokerHandle::new(broker.clone());

        assert!(handle.release());
        assert!(!handle.release());
        assert_eq!(broker.close_count(), 1);
        assert_eq!(broker.unsubscribe_count(), 1);
    }

    #[test]
    fn test_calls_after_release_fail() {
        let handle = BrokerHandle::new(MockBroker::new());
        handle.release();

        let result = handle.with(|client| client.poll(Duration::ZERO, 10));
        assert!(matches!(result, Err(BrokerError::Closed)));
    }

    #[test]
    fn test_drop_releases_client() {
        let broker = MockBroker::new();
        drop(BrokerHandle::new(broker.clone()));
        assert_eq!(broker.close_count(), 1);
    }
}
