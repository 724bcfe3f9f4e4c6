//! Kafka consumption proxy.
//!
//! Pulls records from Kafka on behalf of logical consumers, hands them to a
//! listener strategy or fans them out to remote clients through the relay, and
//! only advances the committed group offset once delivery has been
//! acknowledged end-to-end.
//!
//! ## Error logging (anyhow)
//!
//! Listener callbacks return `anyhow::Result`. When logging those errors, use
//! `{e:#}` (full chain on one line) or the structured field `error = ?e` so the
//! root cause stays visible. Avoid `%e`, it only shows the top-level message.

pub mod config;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod listener;
pub mod metrics_consts;
pub mod record;
pub mod registry;
pub mod relay;
pub mod serializer;
pub mod service;
pub mod strategy;

// Used in "mod tests" and the tests/ directory (integration tests)
pub mod test_utils;

pub use engine::{ConsumptionEngine, EngineConfig, ProxyMode};
pub use error::{BrokerError, ConfigurationError, EngineError, UsageError};
pub use listener::{
    Acknowledgment, AcknowledgeListener, AutoCommitListener, BatchAcknowledgeListener, Listener,
};
pub use record::{OffsetCommit, Partition, Record};
