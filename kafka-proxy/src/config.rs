use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use envconfig::Envconfig;

use crate::engine::{EngineConfig, ProxyMode};
use crate::relay::RelayConfig;
use crate::serializer::Serializer;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-proxy")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_consumer_auto_commit: bool,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Consumption
    #[envconfig(default = "100")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    #[envconfig(default = "100")]
    pub batch_consume_size: usize,

    #[envconfig(default = "1")]
    pub commit_batch_size: usize,

    #[envconfig(default = "5000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "false")]
    pub partition_orderly: bool,

    #[envconfig(default = "bytes")]
    pub key_serializer: String,

    #[envconfig(default = "bytes")]
    pub value_serializer: String,

    // Proxy: disabled, push or pull
    #[envconfig(default = "push")]
    pub proxy_mode: String,

    #[envconfig(default = "3")]
    pub max_delivery_attempts: u32,

    #[envconfig(default = "30000")]
    pub ack_timeout_ms: u64,

    #[envconfig(default = "1000")]
    pub max_in_flight: usize,

    #[envconfig(default = "128")]
    pub send_queue_capacity: usize,

    // Dead-lettered records are also produced here when set
    pub dead_letter_topic: Option<String>,

    #[envconfig(from = "PROXY_BIND_PORT", default = "9300")]
    pub proxy_port: u16,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address remote clients connect to
    pub fn proxy_bind_address(&self) -> String {
        format!("{}:{}", self.host, self.proxy_port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn proxy_mode(&self) -> Result<ProxyMode> {
        ProxyMode::from_str(&self.proxy_mode).map_err(|e| anyhow!("invalid PROXY_MODE: {e}"))
    }

    pub fn to_engine_config(&self) -> Result<EngineConfig> {
        let key_serializer = Serializer::from_str(&self.key_serializer)?;
        let value_serializer = Serializer::from_str(&self.value_serializer)?;

        let relay = RelayConfig {
            max_attempts: self.max_delivery_attempts,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_in_flight: self.max_in_flight,
            send_queue_capacity: self.send_queue_capacity,
        };

        let config = EngineConfig::new(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_topics([self.kafka_consumer_topic.clone()])
            .with_auto_commit(self.kafka_consumer_auto_commit)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_tls(self.kafka_tls)
            .with_poll_timeout(Duration::from_millis(self.poll_timeout_ms))
            .with_max_poll_records(self.max_poll_records)
            .with_batch_consume_size(self.batch_consume_size)
            .with_commit_batch_size(self.commit_batch_size)
            .with_commit_interval(Duration::from_millis(self.commit_interval_ms))
            .with_partition_orderly(self.partition_orderly)
            .with_proxy_mode(self.proxy_mode()?)
            .with_relay(relay)
            .with_serializers(Some(key_serializer), Some(value_serializer));

        Ok(match &self.dead_letter_topic {
            Some(topic) => config.with_dead_letter_topic(topic),
            None => config,
        })
    }
}
