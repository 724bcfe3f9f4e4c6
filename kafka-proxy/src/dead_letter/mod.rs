//! Landing zone for records the relay could not get acknowledged.
//!
//! Entries are kept in memory, keyed by an id handed out on `put`, so an
//! operator can inspect them through `view`. When a dead-letter topic is
//! configured every entry is also published to Kafka. Lookups only see this
//! process's entries; after a restart earlier ones are on the topic alone.

mod kafka;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics_consts::DEAD_LETTERED_COUNTER;
use crate::record::Record;

pub use kafka::KafkaDeadLetterPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(pub u64);

impl fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeadLetterId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(DeadLetterId)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    #[error("dead-letter sink is closed")]
    Closed,

    #[error("no dead letter {0} was recorded since this process started")]
    NotFound(DeadLetterId),

    #[error("dead letter {0} was purged")]
    Purged(DeadLetterId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub record: Record,
    pub failure_reason: String,
    pub first_failed_at: DateTime<Utc>,
    pub attempt_count: u32,
}

pub struct DeadLetterSink {
    entries: DashMap<DeadLetterId, Arc<DeadLetterEntry>>,
    next_id: AtomicU64,
    publisher: Option<KafkaDeadLetterPublisher>,
    closed: AtomicBool,
}

impl Default for DeadLetterSink {
    fn default() -> Self {
        Self::new(None)
    }
}

impl DeadLetterSink {
    pub fn new(publisher: Option<KafkaDeadLetterPublisher>) -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
            publisher,
            closed: AtomicBool::new(false),
        }
    }

    /// Store a record that will never be acknowledged. Fails once the sink
    /// is closed; the caller then leaves the record unacknowledged.
    pub fn put(
        &self,
        record: Record,
        reason: impl Into<String>,
        attempt_count: u32,
    ) -> Result<DeadLetterId, DeadLetterError> {
        if self.closed.load(Ordering::SeqCst) {
            warn!(
                topic = record.topic,
                partition = record.partition,
                offset = record.offset,
                "Dead-letter sink is closed, refusing record"
            );
            return Err(DeadLetterError::Closed);
        }

        let id = DeadLetterId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = DeadLetterEntry {
            id,
            record,
            failure_reason: reason.into(),
            first_failed_at: Utc::now(),
            attempt_count,
        };

        metrics::counter!(DEAD_LETTERED_COUNTER).increment(1);
        warn!(
            dead_letter_id = %id,
            topic = entry.record.topic,
            partition = entry.record.partition,
            offset = entry.record.offset,
            attempts = attempt_count,
            reason = entry.failure_reason,
            "Record dead-lettered"
        );

        if let Some(publisher) = &self.publisher {
            publisher.publish(&entry);
        }
        self.entries.insert(id, Arc::new(entry));
        Ok(id)
    }

    /// Snapshot of a stored entry. Does not block writers.
    pub fn get(&self, id: DeadLetterId) -> Result<Arc<DeadLetterEntry>, DeadLetterError> {
        if let Some(entry) = self.entries.get(&id) {
            return Ok(entry.value().clone());
        }
        let issued = id.0 > 0 && id.0 < self.next_id.load(Ordering::SeqCst);
        if issued {
            Err(DeadLetterError::Purged(id))
        } else {
            Err(DeadLetterError::NotFound(id))
        }
    }

    pub fn purge(&self, id: DeadLetterId) -> Option<Arc<DeadLetterEntry>> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> Vec<Arc<DeadLetterEntry>> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Flush the publisher and stop accepting entries. Stored entries stay
    /// readable.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(publisher) = &self.publisher {
            publisher.flush();
        }
        info!(entries = self.entries.len(), "Dead-letter sink closed");
    }
}
