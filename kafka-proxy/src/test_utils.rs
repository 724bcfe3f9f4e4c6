use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::engine::{BrokerClient, RebalanceListener};
use crate::error::BrokerError;
use crate::listener::{AcknowledgeListener, Acknowledgment, AutoCommitListener, BatchAcknowledgeListener};
use crate::record::{OffsetCommit, Partition, Record};

pub fn record(topic: &str, partition: i32, offset: i64) -> Record {
    Record::new(topic, partition, offset, None, Some(format!("value-{offset}").into_bytes()), None)
}

pub fn records(topic: &str, partition: i32, offsets: impl IntoIterator<Item = i64>) -> Vec<Record> {
    offsets
        .into_iter()
        .map(|offset| record(topic, partition, offset))
        .collect()
}

enum Scripted {
    Batch(Vec<Record>),
    Error(BrokerError),
    Revoke(Vec<Partition>),
}

#[derive(Default)]
struct MockBrokerState {
    script: VecDeque<Scripted>,
    commits: Vec<OffsetCommit>,
    subscribed: Vec<String>,
    assigned: Vec<Partition>,
    rebalance_listener: Option<Arc<dyn RebalanceListener>>,
    polls: usize,
    close_count: usize,
    unsubscribe_count: usize,
    fail_commits: bool,
}

/// In-memory broker client. Polls return the scripted batches in order and
/// then empty batches; commits are recorded.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockBrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, records: Vec<Record>) -> &Self {
        self.state.lock().unwrap().script.push_back(Scripted::Batch(records));
        self
    }

    pub fn push_error(&self, error: BrokerError) -> &Self {
        self.state.lock().unwrap().script.push_back(Scripted::Error(error));
        self
    }

    /// Revoke `partitions` during the next poll that reaches this point of
    /// the script, the way a real client runs rebalance callbacks.
    pub fn push_revoke(&self, partitions: Vec<Partition>) -> &Self {
        self.state.lock().unwrap().script.push_back(Scripted::Revoke(partitions));
        self
    }

    pub fn fail_commits(&self, fail: bool) {
        self.state.lock().unwrap().fail_commits = fail;
    }

    pub fn commits(&self) -> Vec<OffsetCommit> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .commits
            .iter()
            .filter(|commit| &commit.partition == partition)
            .map(|commit| commit.offset)
            .max()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.state.lock().unwrap().subscribed.clone()
    }

    pub fn assigned(&self) -> Vec<Partition> {
        self.state.lock().unwrap().assigned.clone()
    }

    pub fn has_rebalance_listener(&self) -> bool {
        self.state.lock().unwrap().rebalance_listener.is_some()
    }

    pub fn polls(&self) -> usize {
        self.state.lock().unwrap().polls
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().close_count
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state.lock().unwrap().unsubscribe_count
    }

    /// Wait until `partition` has a commit at or above `offset`.
    pub async fn wait_for_commit(&self, partition: &Partition, offset: i64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.committed_offset(partition).is_some_and(|committed| committed >= offset) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    /// Wait until the script has been fully consumed by polls.
    pub async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.state.lock().unwrap().script.is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

impl BrokerClient for MockBroker {
    fn subscribe(
        &mut self,
        topics: &[String],
        listener: Option<Arc<dyn RebalanceListener>>,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.subscribed = topics.to_vec();
        state.rebalance_listener = listener;
        Ok(())
    }

    fn assign(&mut self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.state.lock().unwrap().assigned = partitions.to_vec();
        Ok(())
    }

    fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<Record>, BrokerError> {
        let (next, listener) = {
            let mut state = self.state.lock().unwrap();
            state.polls += 1;
            (state.script.pop_front(), state.rebalance_listener.clone())
        };

        match next {
            None => {
                thread::sleep(timeout);
                Ok(vec![])
            }
            Some(Scripted::Error(error)) => Err(error),
            Some(Scripted::Revoke(partitions)) => {
                if let Some(listener) = listener {
                    let commits = listener.on_partitions_revoked(&partitions);
                    let mut state = self.state.lock().unwrap();
                    if !state.fail_commits {
                        state.commits.extend(commits);
                    }
                }
                Ok(vec![])
            }
            Some(Scripted::Batch(mut records)) => {
                if records.len() > max_records {
                    let rest = records.split_off(max_records);
                    self.state
                        .lock()
                        .unwrap()
                        .script
                        .push_front(Scripted::Batch(rest));
                }
                Ok(records)
            }
        }
    }

    fn commit_async(&mut self, offsets: &[OffsetCommit]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commits {
            return Err(BrokerError::Other("commit rejected".to_string()));
        }
        state.commits.extend_from_slice(offsets);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.state.lock().unwrap().unsubscribe_count += 1;
    }

    fn close(&mut self) {
        self.state.lock().unwrap().close_count += 1;
    }
}

#[derive(Clone, Default)]
pub struct RecordingAutoCommitListener {
    offsets: Arc<Mutex<Vec<i64>>>,
    fail: bool,
}

impl RecordingAutoCommitListener {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.offsets.lock().unwrap().clone()
    }
}

impl AutoCommitListener for RecordingAutoCommitListener {
    fn on_message(&self, record: &Record) -> Result<()> {
        if self.fail {
            return Err(anyhow!("listener failed at offset {}", record.offset));
        }
        self.offsets.lock().unwrap().push(record.offset);
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AckBehaviour {
    Acknowledge,
    Hold,
    Fail,
}

/// Records every delivery. Depending on how it was built it acknowledges
/// right away, holds the acknowledgments for the test to use, or fails.
#[derive(Clone)]
pub struct RecordingAckListener {
    behaviour: AckBehaviour,
    offsets: Arc<Mutex<Vec<i64>>>,
    held: Arc<Mutex<Vec<Acknowledgment>>>,
}

impl RecordingAckListener {
    fn with_behaviour(behaviour: AckBehaviour) -> Self {
        Self {
            behaviour,
            offsets: Arc::default(),
            held: Arc::default(),
        }
    }

    pub fn acking() -> Self {
        Self::with_behaviour(AckBehaviour::Acknowledge)
    }

    pub fn holding() -> Self {
        Self::with_behaviour(AckBehaviour::Hold)
    }

    pub fn failing() -> Self {
        Self::with_behaviour(AckBehaviour::Fail)
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.offsets.lock().unwrap().clone()
    }

    pub fn take_held(&self) -> Vec<Acknowledgment> {
        std::mem::take(&mut *self.held.lock().unwrap())
    }
}

impl AcknowledgeListener for RecordingAckListener {
    fn on_message(&self, record: Record, ack: Acknowledgment) -> Result<()> {
        if self.behaviour == AckBehaviour::Fail {
            return Err(anyhow!("listener failed at offset {}", record.offset));
        }
        self.offsets.lock().unwrap().push(record.offset);
        match self.behaviour {
            AckBehaviour::Hold => self.held.lock().unwrap().push(ack),
            _ => {
                ack.acknowledge();
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingBatchListener {
    batches: Arc<Mutex<Vec<Vec<i64>>>>,
    fail: bool,
}

impl RecordingBatchListener {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<Vec<i64>> {
        self.batches.lock().unwrap().clone()
    }
}

impl BatchAcknowledgeListener for RecordingBatchListener {
    fn on_messages(&self, records: &[Record]) -> Result<()> {
        if self.fail {
            return Err(anyhow!("batch of {} records failed", records.len()));
        }
        self.batches
            .lock()
            .unwrap()
            .push(records.iter().map(|record| record.offset).collect());
        Ok(())
    }
}
