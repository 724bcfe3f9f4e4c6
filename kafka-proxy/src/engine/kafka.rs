use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::engine::broker::{BrokerClient, RebalanceListener};
use crate::error::BrokerError;
use crate::metrics_consts::COMMIT_FAILURES_COUNTER;
use crate::record::{OffsetCommit, Partition, Record};

/// rdkafka context forwarding rebalances to the engine and reporting
/// asynchronous commit results.
#[derive(Default)]
pub struct ProxyConsumerContext {
    listener: RwLock<Option<Arc<dyn RebalanceListener>>>,
}

impl ProxyConsumerContext {
    fn set_listener(&self, listener: Option<Arc<dyn RebalanceListener>>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    fn listener(&self) -> Option<Arc<dyn RebalanceListener>> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn partitions_of(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}

fn offset_list(offsets: &[OffsetCommit]) -> KafkaResult<TopicPartitionList> {
    let mut list = TopicPartitionList::new();
    for commit in offsets {
        // Kafka expects the next offset to consume
        list.add_partition_offset(
            commit.partition.topic(),
            commit.partition.partition_number(),
            Offset::Offset(commit.offset + 1),
        )?;
    }
    Ok(list)
}

/// Commit what was acknowledged on revoked partitions while they are still
/// ours. Failures only cost redelivery to the next owner.
fn commit_before_revoke(consumer: &BaseConsumer<ProxyConsumerContext>, offsets: &[OffsetCommit]) {
    if offsets.is_empty() {
        return;
    }
    let result = offset_list(offsets).and_then(|list| consumer.commit(&list, CommitMode::Sync));
    match result {
        Ok(()) => info!("Committed {} revoked partitions before rebalance", offsets.len()),
        Err(e) => {
            metrics::counter!(COMMIT_FAILURES_COUNTER).increment(1);
            warn!("Failed to commit revoked partitions: {}", e);
        }
    }
}

impl ClientContext for ProxyConsumerContext {}

impl ConsumerContext for ProxyConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }
                info!("Revoking {} partitions", partitions.count());
                match self.listener() {
                    Some(listener) => {
                        let commits = listener.on_partitions_revoked(&partitions_of(partitions));
                        commit_before_revoke(base_consumer, &commits);
                    }
                    None => debug!("No rebalance listener registered"),
                }
            }
            Rebalance::Assign(partitions) => {
                info!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    return;
                }
                info!("Assigned {} partitions", partitions.count());
                if let Some(listener) = self.listener() {
                    listener.on_partitions_assigned(&partitions_of(partitions));
                }
            }
            Rebalance::Revoke(_) => {
                info!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!("Committed offsets for {} partitions", offsets.count());
            }
            Err(e) => {
                metrics::counter!(COMMIT_FAILURES_COUNTER).increment(1);
                warn!(
                    "Failed to commit offsets for {} partitions: {}",
                    offsets.count(),
                    e
                );
            }
        }
    }
}

/// [`BrokerClient`] backed by an rdkafka `BaseConsumer`.
pub struct KafkaBroker {
    consumer: BaseConsumer<ProxyConsumerContext>,
    /// Used to classify missing-topic errors
    topic_hint: String,
}

impl KafkaBroker {
    pub fn new(config: &ClientConfig, topic_hint: impl Into<String>) -> Result<Self, BrokerError> {
        debug!("rdkafka configuration: {:?}", config);
        let consumer: BaseConsumer<ProxyConsumerContext> = config
            .create_with_context(ProxyConsumerContext::default())
            .map_err(BrokerError::Create)?;

        Ok(Self {
            consumer,
            topic_hint: topic_hint.into(),
        })
    }
}

impl BrokerClient for KafkaBroker {
    fn subscribe(
        &mut self,
        topics: &[String],
        listener: Option<Arc<dyn RebalanceListener>>,
    ) -> Result<(), BrokerError> {
        self.consumer.context().set_listener(listener);
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(BrokerError::Subscribe)
    }

    fn assign(&mut self, partitions: &[Partition]) -> Result<(), BrokerError> {
        let mut list = TopicPartitionList::new();
        for partition in partitions {
            list.add_partition(partition.topic(), partition.partition_number());
        }
        self.consumer.assign(&list).map_err(BrokerError::Subscribe)
    }

    fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<Record>, BrokerError> {
        let mut records = Vec::new();
        let mut wait = timeout;

        while records.len() < max_records {
            match self.consumer.poll(wait) {
                None => break,
                Some(Ok(message)) => records.push(Record::from_borrowed_message(&message)),
                Some(Err(e)) if records.is_empty() => {
                    return Err(BrokerError::from_fetch(e, &self.topic_hint));
                }
                Some(Err(e)) => {
                    // Hand out what we have, the error resurfaces on the next poll
                    debug!("Fetch error after {} records: {}", records.len(), e);
                    break;
                }
            }
            wait = Duration::ZERO;
        }

        Ok(records)
    }

    fn commit_async(&mut self, offsets: &[OffsetCommit]) -> Result<(), BrokerError> {
        let list = offset_list(offsets).map_err(BrokerError::Commit)?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(BrokerError::Commit)
    }

    fn unsubscribe(&mut self) {
        self.consumer.unsubscribe();
    }

    fn close(&mut self) {
        self.consumer.context().set_listener(None);
        info!("Kafka consumer closed");
    }
}
