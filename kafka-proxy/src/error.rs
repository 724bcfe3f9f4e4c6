use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// Invalid engine or listener setup. Only raised before the engine runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("a message listener must be set before start")]
    ListenerNotSet,

    #[error("{0} serializer must be set before start")]
    MissingSerializer(&'static str),

    #[error("{0} should be greater than 0")]
    NonPositive(&'static str),

    #[error("acknowledge listeners require manual commit, but auto commit is enabled")]
    AcknowledgeWithAutoCommit,

    #[error("auto commit listeners require auto commit to be enabled")]
    AutoCommitListenerWithoutAutoCommit,

    #[error("batch acknowledge listeners do not support strict partition ordering")]
    BatchAcknowledgeWithPartitionOrderly,

    #[error("proxy mode requires an acknowledge listener")]
    ProxyRequiresAcknowledge,

    #[error("topics and explicit partitions are mutually exclusive")]
    ConflictingSubscription,

    #[error("either topics or explicit partitions must be configured")]
    MissingSubscription,

    #[error("could not resolve broker addresses: {0}")]
    BrokerAddresses(String),
}

/// A call that is not valid for the engine's current mode or state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("a message listener has already been set")]
    ListenerAlreadyBound,

    #[error("only proxy mode can view dead-lettered messages")]
    ViewWithoutProxy,

    #[error("the engine has been closed")]
    EngineClosed,

    #[error("the engine must be started from within a tokio runtime")]
    NoRuntime,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("topic does not exist: {0}")]
    TopicMissing(String),

    #[error("fetch failed: {0}")]
    Fetch(#[source] KafkaError),

    #[error("commit failed: {0}")]
    Commit(#[source] KafkaError),

    #[error("subscribe failed: {0}")]
    Subscribe(#[source] KafkaError),

    #[error("failed to create the broker client: {0}")]
    Create(#[source] KafkaError),

    #[error("broker handle is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// Classify an error returned while fetching.
    pub fn from_fetch(error: KafkaError, topic_hint: &str) -> Self {
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::UnknownTopic)
            | Some(RDKafkaErrorCode::UnknownTopicOrPartition) => {
                BrokerError::TopicMissing(topic_hint.to_string())
            }
            _ => BrokerError::Fetch(error),
        }
    }

    pub fn is_topic_missing(&self) -> bool {
        matches!(self, BrokerError::TopicMissing(_))
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_topic_is_classified_as_topic_missing() {
        let err = BrokerError::from_fetch(
            KafkaError::MessageConsumption(RDKafkaErrorCode::UnknownTopicOrPartition),
            "events",
        );
        assert!(err.is_topic_missing());
        assert_eq!(err.to_string(), "topic does not exist: events");
    }

    #[test]
    fn test_other_fetch_errors_are_transient() {
        let err = BrokerError::from_fetch(
            KafkaError::MessageConsumption(RDKafkaErrorCode::BrokerTransportFailure),
            "events",
        );
        assert!(!err.is_topic_missing());
        assert!(matches!(err, BrokerError::Fetch(_)));
    }

    #[test]
    fn test_engine_error_wraps_configuration_error() {
        let err: EngineError = ConfigurationError::NonPositive("commit_batch_size").into();
        assert_eq!(err.to_string(), "commit_batch_size should be greater than 0");
    }
}
