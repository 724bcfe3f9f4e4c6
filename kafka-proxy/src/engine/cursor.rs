//! Per-partition offset bookkeeping.
//!
//! Records are tracked when they are handed to a strategy and acknowledged
//! whenever their listener (or remote client) says so, in any order. The
//! committable position of a partition only ever moves to the highest offset
//! below which every tracked offset has been acknowledged, so a commit never
//! skips over an unacknowledged record.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::listener::Acknowledgment;
use crate::record::{OffsetCommit, Partition, Record};

/// State tracked per partition
#[derive(Debug)]
struct PartitionCursor {
    /// Changes every time the cursor is recreated after a revocation, so that
    /// acknowledgments issued for a previous assignment can be told apart.
    epoch: u64,
    first_tracked_offset: i64,
    last_fetched_offset: i64,
    /// Highest offset with no unacknowledged offset at or below it
    acknowledged_offset: Option<i64>,
    /// Last offset handed to the broker for commit
    committed_offset: Option<i64>,
    in_flight: BTreeSet<i64>,
}

impl PartitionCursor {
    fn new(epoch: u64, offset: i64) -> Self {
        Self {
            epoch,
            first_tracked_offset: offset,
            last_fetched_offset: offset,
            acknowledged_offset: None,
            committed_offset: None,
            in_flight: BTreeSet::new(),
        }
    }

    fn track(&mut self, offset: i64) {
        self.first_tracked_offset = self.first_tracked_offset.min(offset);
        self.last_fetched_offset = self.last_fetched_offset.max(offset);
        self.in_flight.insert(offset);
    }

    fn acknowledge(&mut self, offset: i64) -> bool {
        if !self.in_flight.remove(&offset) {
            return false;
        }
        self.advance();
        true
    }

    fn complete_through(&mut self, offset: i64) {
        self.in_flight.retain(|o| *o > offset);
        self.last_fetched_offset = self.last_fetched_offset.max(offset);
        if self.acknowledged_offset.map_or(true, |a| offset > a) {
            self.acknowledged_offset = Some(offset);
        }
        self.advance();
    }

    fn advance(&mut self) {
        let candidate = match self.in_flight.first() {
            Some(lowest_in_flight) => lowest_in_flight - 1,
            None => self.last_fetched_offset,
        };

        if candidate < self.first_tracked_offset {
            return;
        }

        if self.acknowledged_offset.map_or(true, |a| candidate > a) {
            self.acknowledged_offset = Some(candidate);
        }
    }

    fn committable(&self) -> Option<i64> {
        match (self.acknowledged_offset, self.committed_offset) {
            (Some(acked), Some(committed)) if acked <= committed => None,
            (acked, _) => acked,
        }
    }
}

/// Read-only copy of a partition cursor, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSnapshot {
    pub last_fetched_offset: i64,
    pub acknowledged_offset: Option<i64>,
    pub committed_offset: Option<i64>,
    pub in_flight: Vec<i64>,
}

/// Thread-safe set of partition cursors.
///
/// Shared between the poll thread (tracking, committing, rebalances) and
/// whichever contexts acknowledge records. Every mutation happens under the
/// same mutex.
#[derive(Debug, Default)]
pub struct OffsetLedger {
    cursors: Mutex<HashMap<Partition, PartitionCursor>>,
    next_epoch: AtomicU64,
    acks_since_commit: AtomicUsize,
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Partition, PartitionCursor>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a fetched record and hand out its acknowledgment.
    pub fn track(self: &Arc<Self>, record: &Record) -> Acknowledgment {
        let partition = record.topic_partition();
        let epoch = {
            let mut cursors = self.lock();
            let cursor = cursors.entry(partition.clone()).or_insert_with(|| {
                let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = record.offset,
                    epoch,
                    "Initializing partition cursor"
                );
                PartitionCursor::new(epoch, record.offset)
            });
            cursor.track(record.offset);
            cursor.epoch
        };

        Acknowledgment::new(Arc::downgrade(self), partition, record.offset, epoch)
    }

    pub(crate) fn acknowledge(&self, partition: &Partition, offset: i64, epoch: u64) -> bool {
        let mut cursors = self.lock();
        let Some(cursor) = cursors.get_mut(partition) else {
            debug!(%partition, offset, "Ignoring ack for untracked partition");
            return false;
        };
        if cursor.epoch != epoch {
            debug!(%partition, offset, epoch, current_epoch = cursor.epoch, "Ignoring stale ack");
            return false;
        }

        let acked = cursor.acknowledge(offset);
        if acked {
            self.acks_since_commit.fetch_add(1, Ordering::SeqCst);
        }
        acked
    }

    /// Treat everything up to and including `offset` as handled, regardless of
    /// gaps. Used by batch acknowledgment, where a batch succeeds as a unit.
    pub(crate) fn complete_through(&self, partition: &Partition, offset: i64, epoch: u64) -> bool {
        let mut cursors = self.lock();
        match cursors.get_mut(partition) {
            Some(cursor) if cursor.epoch == epoch => {
                cursor.complete_through(offset);
                self.acks_since_commit.fetch_add(1, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Number of acknowledgments recorded since the last `take_commits`.
    pub fn acks_since_commit(&self) -> usize {
        self.acks_since_commit.load(Ordering::SeqCst)
    }

    /// Collect the offsets that advanced since the previous call and mark them
    /// as committed. A failed broker commit is not retried; the next advance of
    /// the same partition supersedes it.
    pub fn take_commits(&self) -> Vec<OffsetCommit> {
        let mut cursors = self.lock();
        self.acks_since_commit.store(0, Ordering::SeqCst);

        let mut commits: Vec<OffsetCommit> = cursors
            .iter_mut()
            .filter_map(|(partition, cursor)| {
                let offset = cursor.committable()?;
                cursor.committed_offset = Some(offset);
                Some(OffsetCommit::new(partition.clone(), offset))
            })
            .collect();
        commits.sort_by(|a, b| a.partition.cmp(&b.partition));
        commits
    }

    /// Drop the cursors of revoked partitions. Outstanding acknowledgments for
    /// them become no-ops. Returns the acknowledged offsets of those
    /// partitions that were never committed, for a final commit before the
    /// partitions change hands.
    pub fn revoke(&self, partitions: &[Partition]) -> Vec<OffsetCommit> {
        let mut cursors = self.lock();
        let mut commits = Vec::new();
        for partition in partitions {
            let Some(cursor) = cursors.remove(partition) else {
                continue;
            };
            let final_commit = cursor.committable();
            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                in_flight = cursor.in_flight.len(),
                final_commit = ?final_commit,
                "Cleared cursor for revoked partition"
            );
            if let Some(offset) = final_commit {
                commits.push(OffsetCommit::new(partition.clone(), offset));
            }
        }
        commits
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn snapshot(&self, partition: &Partition) -> Option<CursorSnapshot> {
        self.lock().get(partition).map(|cursor| CursorSnapshot {
            last_fetched_offset: cursor.last_fetched_offset,
            acknowledged_offset: cursor.acknowledged_offset,
            committed_offset: cursor.committed_offset,
            in_flight: cursor.in_flight.iter().copied().collect(),
        })
    }

    pub fn partition_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(partition: i32, offset: i64) -> Record {
        Record::new("test-topic", partition, offset, None, Some(vec![1]), None)
    }

    fn p(num: i32) -> Partition {
        Partition::new("test-topic", num)
    }

    #[test]
    fn test_in_order_acks_advance_cursor() {
        let ledger = Arc::new(OffsetLedger::new());
        let a = ledger.track(&record(0, 10));
        let b = ledger.track(&record(0, 11));

        assert!(a.acknowledge());
        assert_eq!(ledger.take_commits(), vec![OffsetCommit::new(p(0), 10)]);

        assert!(b.acknowledge());
        assert_eq!(ledger.take_commits(), vec![OffsetCommit::new(p(0), 11)]);
    }

    #[test]
    fn test_out_of_order_ack_does_not_leave_gap() {
        let ledger = Arc::new(OffsetLedger::new());
        let a = ledger.track(&record(0, 10));
        let b = ledger.track(&record(0, 11));
        let c = ledger.track(&record(0, 12));

        assert!(c.acknowledge());
        assert!(ledger.take_commits().is_empty());

        assert!(a.acknowledge());
        assert_eq!(ledger.take_commits(), vec![OffsetCommit::new(p(0), 10)]);

        assert!(b.acknowledge());
        assert_eq!(ledger.take_commits(), vec![OffsetCommit::new(p(0), 12)]);
    }

    #[test]
    fn test_take_commits_only_returns_advanced_partitions() {
        let ledger = Arc::new(OffsetLedger::new());
        ledger.track(&record(0, 1)).acknowledge();
        ledger.track(&record(1, 5)).acknowledge();

        assert_eq!(ledger.take_commits().len(), 2);
        assert!(ledger.take_commits().is_empty());

        ledger.track(&record(1, 6)).acknowledge();
        assert_eq!(ledger.take_commits(), vec![OffsetCommit::new(p(1), 6)]);
    }

    #[test]
    fn test_complete_through_skips_gaps() {
        let ledger = Arc::new(OffsetLedger::new());
        let acks: Vec<_> = (10..=12).map(|o| ledger.track(&record(0, o))).collect();
        let last = acks.into_iter().last().unwrap();

        assert!(last.complete_through());
        assert_eq!(ledger.take_commits(), vec![OffsetCommit::new(p(0), 12)]);
        assert!(ledger.snapshot(&p(0)).unwrap().in_flight.is_empty());
    }

    #[test]
    fn test_revoke_invalidates_outstanding_acks() {
        let ledger = Arc::new(OffsetLedger::new());
        let stale = ledger.track(&record(0, 10));

        assert!(ledger.revoke(&[p(0)]).is_empty());
        assert_eq!(ledger.partition_count(), 0);

        // Partition comes back with a fresh cursor
        let fresh = ledger.track(&record(0, 20));
        assert!(!stale.acknowledge());
        assert!(ledger.take_commits().is_empty());

        assert!(fresh.acknowledge());
        assert_eq!(ledger.take_commits(), vec![OffsetCommit::new(p(0), 20)]);
    }

    #[test]
    fn test_revoke_returns_uncommitted_acknowledged_offsets() {
        let ledger = Arc::new(OffsetLedger::new());
        ledger.track(&record(0, 1)).acknowledge();
        assert_eq!(ledger.take_commits(), vec![OffsetCommit::new(p(0), 1)]);

        ledger.track(&record(0, 2)).acknowledge();
        ledger.track(&record(0, 3)).acknowledge();
        let _pending = ledger.track(&record(0, 4));
        ledger.track(&record(1, 8)).acknowledge();
        ledger.track(&record(2, 9)).acknowledge();

        let commits = ledger.revoke(&[p(0), p(1), p(5)]);
        assert_eq!(
            commits,
            vec![OffsetCommit::new(p(0), 3), OffsetCommit::new(p(1), 8)]
        );
        assert_eq!(ledger.partition_count(), 1);
        assert_eq!(ledger.take_commits(), vec![OffsetCommit::new(p(2), 9)]);
    }

    #[test]
    fn test_double_ack_is_counted_once() {
        let ledger = Arc::new(OffsetLedger::new());
        let ack = ledger.track(&record(0, 3));
        let partition = ack.partition().clone();
        let epoch = ack.epoch();

        assert!(ack.acknowledge());
        assert!(!ledger.acknowledge(&partition, 3, epoch));
        assert_eq!(ledger.acks_since_commit(), 1);
    }

    #[test]
    fn test_concurrent_acks_commit_highest_contiguous() {
        use std::thread;

        let ledger = Arc::new(OffsetLedger::new());
        let acks: Vec<_> = (0..100).map(|o| ledger.track(&record(0, o))).collect();

        let handles: Vec<_> = acks
            .into_iter()
            .rev()
            .map(|ack| thread::spawn(move || ack.acknowledge()))
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        assert_eq!(ledger.take_commits(), vec![OffsetCommit::new(p(0), 99)]);
    }
}
