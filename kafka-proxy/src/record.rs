use std::fmt;

use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// An immutable record fetched from the broker.
///
/// `id` is the broker-assigned position of the record within its partition,
/// which for Kafka is the offset itself. Key and value are the raw bytes as
/// fetched; serializers only validate them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    /// Milliseconds since the unix epoch, when the broker supplied one
    pub timestamp: Option<i64>,
}

impl Record {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        timestamp: Option<i64>,
    ) -> Self {
        Self {
            id: offset,
            topic: topic.into(),
            partition,
            offset,
            key,
            value,
            timestamp,
        }
    }

    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        Self::new(
            msg.topic(),
            msg.partition(),
            msg.offset(),
            msg.key().map(|k| k.to_vec()),
            msg.payload().map(|p| p.to_vec()),
            msg.timestamp().to_millis(),
        )
    }

    pub fn topic_partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }

    /// Approximate heap footprint, used for logging and gauges.
    pub fn size_bytes(&self) -> usize {
        self.key.as_ref().map_or(0, Vec::len) + self.value.as_ref().map_or(0, Vec::len)
    }
}

/// The highest handled record offset of a partition, ready to be committed.
///
/// This is the offset of the last handled record, not Kafka's "next offset to
/// consume"; the rdkafka adapter adds one when it builds the commit list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OffsetCommit {
    pub partition: Partition,
    pub offset: i64,
}

impl OffsetCommit {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }
}
