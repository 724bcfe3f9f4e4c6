use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::dead_letter::DeadLetterEntry;
use crate::metrics_consts::DEAD_LETTER_PUBLISHED_COUNTER;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Publishes dead-letter entries as JSON to a Kafka topic.
pub struct KafkaDeadLetterPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterPublisher {
    pub fn new(bootstrap_servers: &str, topic: impl Into<String>) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", bootstrap_servers)
            .set("linger.ms", "20")
            .set("message.timeout.ms", "20000")
            .set("compression.codec", "snappy");

        debug!("rdkafka dead-letter producer configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;

        Ok(Self {
            producer,
            topic: topic.into(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Enqueue an entry. Delivery is awaited in the background when a runtime
    /// is available; failures are logged and counted, never returned.
    pub fn publish(&self, entry: &DeadLetterEntry) {
        let payload = match serde_json::to_string(entry) {
            Ok(payload) => payload,
            Err(e) => {
                error!(dead_letter_id = %entry.id, "Failed to serialize dead letter: {}", e);
                metrics::counter!(DEAD_LETTER_PUBLISHED_COUNTER, "status" => "failure").increment(1);
                return;
            }
        };

        let key = entry.id.to_string();
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((e, _)) => {
                warn!(dead_letter_id = %entry.id, "Failed to enqueue dead letter: {}", e);
                metrics::counter!(DEAD_LETTER_PUBLISHED_COUNTER, "status" => "failure").increment(1);
                return;
            }
        };

        let Ok(handle) = Handle::try_current() else {
            debug!(dead_letter_id = %entry.id, "No runtime to await dead-letter delivery");
            return;
        };

        let id = entry.id;
        handle.spawn(async move {
            match delivery.await {
                Ok(Ok(_)) => {
                    metrics::counter!(DEAD_LETTER_PUBLISHED_COUNTER, "status" => "success")
                        .increment(1);
                }
                Ok(Err((e, _))) => {
                    warn!(dead_letter_id = %id, "Failed to publish dead letter: {}", e);
                    metrics::counter!(DEAD_LETTER_PUBLISHED_COUNTER, "status" => "failure")
                        .increment(1);
                }
                Err(_) => {
                    warn!(dead_letter_id = %id, "Dead-letter delivery canceled");
                    metrics::counter!(DEAD_LETTER_PUBLISHED_COUNTER, "status" => "failure")
                        .increment(1);
                }
            }
        });
    }

    pub fn flush(&self) {
        if let Err(e) = self.producer.flush(FLUSH_TIMEOUT) {
            warn!(topic = self.topic, "Failed to flush dead-letter producer: {}", e);
        }
    }
}
