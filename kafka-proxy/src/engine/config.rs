use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::record::Partition;
use crate::relay::RelayConfig;
use crate::serializer::Serializer;

/// Whether records are handed to a local listener or relayed to remote clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    #[default]
    Disabled,
    Push,
    Pull,
}

impl ProxyMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ProxyMode::Disabled)
    }
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "disabled" | "none" | "off" => Ok(ProxyMode::Disabled),
            "push" => Ok(ProxyMode::Push),
            "pull" => Ok(ProxyMode::Pull),
            other => Err(format!("unknown proxy mode: {other}")),
        }
    }
}

/// Looks up broker addresses from an external discovery service.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self) -> Result<Vec<String>, String>;
}

/// Where the broker bootstrap list comes from.
#[derive(Clone)]
pub enum BrokerAddresses {
    Static(String),
    Discovery(Arc<dyn AddressResolver>),
}

impl BrokerAddresses {
    pub fn resolve(&self) -> Result<String, ConfigurationError> {
        match self {
            BrokerAddresses::Static(list) if list.trim().is_empty() => Err(
                ConfigurationError::BrokerAddresses("empty bootstrap server list".to_string()),
            ),
            BrokerAddresses::Static(list) => Ok(list.clone()),
            BrokerAddresses::Discovery(resolver) => {
                let addresses = resolver.resolve().map_err(ConfigurationError::BrokerAddresses)?;
                if addresses.is_empty() {
                    return Err(ConfigurationError::BrokerAddresses(
                        "discovery returned no brokers".to_string(),
                    ));
                }
                Ok(addresses.join(","))
            }
        }
    }
}

impl fmt::Debug for BrokerAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerAddresses::Static(list) => write!(f, "{list}"),
            BrokerAddresses::Discovery(_) => write!(f, "<discovery>"),
        }
    }
}

/// Engine configuration, set once before construction.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub brokers: BrokerAddresses,
    pub group_id: String,

    // topic subscription and explicit assignment are mutually exclusive
    pub topics: Vec<String>,
    pub partitions: Vec<Partition>,

    pub auto_commit: bool,
    pub auto_commit_interval: Duration,
    /// Where to start when the group has no committed offset
    pub offset_reset: String,
    pub tls: bool,

    pub poll_timeout: Duration,
    /// Upper bound on records returned by a single poll
    pub max_poll_records: usize,

    /// Records per listener invocation for batch acknowledgment
    pub batch_consume_size: usize,
    /// Acknowledgments accumulated before an offset commit is issued
    pub commit_batch_size: usize,
    /// Longest time acknowledged offsets wait for a commit
    pub commit_interval: Duration,

    pub partition_orderly: bool,

    pub proxy_mode: ProxyMode,
    pub relay: RelayConfig,
    pub dead_letter_topic: Option<String>,

    pub key_serializer: Option<Serializer>,
    pub value_serializer: Option<Serializer>,

    /// Raw rdkafka settings applied last
    pub kafka_overrides: Vec<(String, String)>,
}

impl EngineConfig {
    pub fn new(bootstrap_servers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: BrokerAddresses::Static(bootstrap_servers.into()),
            group_id: group_id.into(),
            topics: vec![],
            partitions: vec![],
            auto_commit: false,
            auto_commit_interval: Duration::from_secs(5),
            offset_reset: "earliest".to_string(),
            tls: false,
            poll_timeout: Duration::from_millis(100),
            max_poll_records: 500,
            batch_consume_size: 100,
            commit_batch_size: 1,
            commit_interval: Duration::from_secs(5),
            partition_orderly: false,
            proxy_mode: ProxyMode::Disabled,
            relay: RelayConfig::default(),
            dead_letter_topic: None,
            key_serializer: Some(Serializer::ByteArray),
            value_serializer: Some(Serializer::ByteArray),
            kafka_overrides: vec![],
        }
    }

    pub fn with_brokers(mut self, brokers: BrokerAddresses) -> Self {
        self.brokers = brokers;
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_partitions(mut self, partitions: Vec<Partition>) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    pub fn with_auto_commit_interval(mut self, interval: Duration) -> Self {
        self.auto_commit_interval = interval;
        self
    }

    pub fn with_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.offset_reset = policy.into();
        self
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max;
        self
    }

    pub fn with_batch_consume_size(mut self, size: usize) -> Self {
        self.batch_consume_size = size;
        self
    }

    pub fn with_commit_batch_size(mut self, size: usize) -> Self {
        self.commit_batch_size = size;
        self
    }

    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    pub fn with_partition_orderly(mut self, orderly: bool) -> Self {
        self.partition_orderly = orderly;
        self
    }

    pub fn with_proxy_mode(mut self, mode: ProxyMode) -> Self {
        self.proxy_mode = mode;
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    pub fn with_serializers(mut self, key: Option<Serializer>, value: Option<Serializer>) -> Self {
        self.key_serializer = key;
        self.value_serializer = value;
        self
    }

    pub fn with_kafka_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kafka_overrides.push((key.into(), value.into()));
        self
    }

    pub fn is_assign_mode(&self) -> bool {
        !self.partitions.is_empty()
    }

    /// Checks that do not depend on the bound listener.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.key_serializer.is_none() {
            return Err(ConfigurationError::MissingSerializer("key"));
        }
        if self.value_serializer.is_none() {
            return Err(ConfigurationError::MissingSerializer("value"));
        }
        if self.batch_consume_size == 0 {
            return Err(ConfigurationError::NonPositive("batch_consume_size"));
        }
        if self.commit_batch_size == 0 {
            return Err(ConfigurationError::NonPositive("commit_batch_size"));
        }
        if self.max_poll_records == 0 {
            return Err(ConfigurationError::NonPositive("max_poll_records"));
        }
        if self.proxy_mode.is_enabled() {
            self.relay.validate()?;
        }
        match (self.topics.is_empty(), self.partitions.is_empty()) {
            (false, false) => Err(ConfigurationError::ConflictingSubscription),
            (true, true) => Err(ConfigurationError::MissingSubscription),
            _ => Ok(()),
        }
    }

    /// Topic used to label log lines and classify missing-topic errors.
    pub fn primary_topic(&self) -> &str {
        self.topics
            .first()
            .map(String::as_str)
            .or_else(|| self.partitions.first().map(Partition::topic))
            .unwrap_or("")
    }

    /// Build the rdkafka client configuration for this engine.
    pub fn client_config(&self) -> Result<ClientConfig, ConfigurationError> {
        let servers = self.brokers.resolve()?;
        let mut builder = ConsumerConfigBuilder::new(&servers, &self.group_id)
            .with_offset_reset(&self.offset_reset)
            .with_tls(self.tls);
        if self.auto_commit {
            builder = builder.with_auto_commit(self.auto_commit_interval);
        }
        for (key, value) in &self.kafka_overrides {
            builder = builder.set(key, value);
        }
        Ok(builder.build())
    }
}

/// rdkafka consumer settings with defaults for the proxy.
///
/// Offsets are committed explicitly from the engine unless auto commit is
/// requested, in which case librdkafka commits stored offsets periodically.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    pub fn with_auto_commit(mut self, interval: Duration) -> Self {
        self.config
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", interval.as_millis().to_string());
        self
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EngineConfig {
        EngineConfig::new("localhost:9092", "group").with_topics(["events"])
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn test_topics_and_partitions_are_exclusive() {
        let config = base().with_partitions(vec![Partition::new("events", 0)]);
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::ConflictingSubscription)
        );

        let config = EngineConfig::new("localhost:9092", "group");
        assert_eq!(config.validate(), Err(ConfigurationError::MissingSubscription));
    }

    #[test]
    fn test_batch_sizes_must_be_positive() {
        assert_eq!(
            base().with_batch_consume_size(0).validate(),
            Err(ConfigurationError::NonPositive("batch_consume_size"))
        );
        assert_eq!(
            base().with_commit_batch_size(0).validate(),
            Err(ConfigurationError::NonPositive("commit_batch_size"))
        );
    }

    #[test]
    fn test_serializers_must_be_set() {
        let config = base().with_serializers(None, Some(Serializer::Json));
        assert_eq!(config.validate(), Err(ConfigurationError::MissingSerializer("key")));
    }

    #[test]
    fn test_client_config_auto_commit() {
        let manual = base().client_config().unwrap();
        assert_eq!(manual.get("enable.auto.commit"), Some("false"));

        let auto = base()
            .with_auto_commit(true)
            .with_kafka_config("fetch.wait.max.ms", "50")
            .client_config()
            .unwrap();
        assert_eq!(auto.get("enable.auto.commit"), Some("true"));
        assert_eq!(auto.get("auto.commit.interval.ms"), Some("5000"));
        assert_eq!(auto.get("fetch.wait.max.ms"), Some("50"));
    }

    #[test]
    fn test_client_config_offset_reset_and_tls() {
        let plain = base().client_config().unwrap();
        assert_eq!(plain.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(plain.get("security.protocol"), None);

        let secured = base()
            .with_offset_reset("latest")
            .with_tls(true)
            .client_config()
            .unwrap();
        assert_eq!(secured.get("auto.offset.reset"), Some("latest"));
        assert_eq!(secured.get("security.protocol"), Some("ssl"));
        assert_eq!(secured.get("enable.ssl.certificate.verification"), Some("false"));
    }

    #[test]
    fn test_discovery_resolution() {
        struct Fixed(Vec<String>);
        impl AddressResolver for Fixed {
            fn resolve(&self) -> Result<Vec<String>, String> {
                Ok(self.0.clone())
            }
        }

        let brokers = BrokerAddresses::Discovery(Arc::new(Fixed(vec![
            "a:9092".to_string(),
            "b:9092".to_string(),
        ])));
        assert_eq!(brokers.resolve().unwrap(), "a:9092,b:9092");

        let empty = BrokerAddresses::Discovery(Arc::new(Fixed(vec![])));
        assert!(empty.resolve().is_err());
    }

    #[test]
    fn test_proxy_mode_from_str() {
        assert_eq!("PUSH".parse::<ProxyMode>().unwrap(), ProxyMode::Push);
        assert_eq!("".parse::<ProxyMode>().unwrap(), ProxyMode::Disabled);
        assert!("both".parse::<ProxyMode>().is_err());
    }
}
