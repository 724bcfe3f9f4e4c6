use std::sync::Arc;

use tracing::info;

use crate::engine::cursor::OffsetLedger;
use crate::engine::EngineConfig;
use crate::error::{ConfigurationError, EngineError, UsageError};
use crate::listener::Listener;
use crate::strategy::{
    AutoCommitStrategy, BatchAckStrategy, DispatchStrategy, ImmediateAckStrategy, StrategyKind,
};

/// The listener an engine was bound to, with the resolved strategy.
#[derive(Debug, Clone)]
pub struct ListenerBinding {
    pub listener: Listener,
    pub kind: StrategyKind,
    pub partition_orderly: bool,
}

/// Validates a listener against the engine configuration and builds the one
/// strategy that matches it. An engine has at most one binding.
#[derive(Debug)]
pub struct ListenerServiceRegistry {
    ledger: Arc<OffsetLedger>,
    binding: Option<ListenerBinding>,
}

impl ListenerServiceRegistry {
    pub fn new(ledger: Arc<OffsetLedger>) -> Self {
        Self {
            ledger,
            binding: None,
        }
    }

    pub fn binding(&self) -> Option<&ListenerBinding> {
        self.binding.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn bind(
        &mut self,
        listener: Listener,
        config: &EngineConfig,
    ) -> Result<DispatchStrategy, EngineError> {
        if self.binding.is_some() {
            return Err(UsageError::ListenerAlreadyBound.into());
        }

        let kind = Self::resolve(&listener, config)?;
        let strategy = match &listener {
            Listener::AutoCommit(l) => DispatchStrategy::AutoCommit(AutoCommitStrategy::new(l.clone())),
            Listener::Acknowledge(l) => DispatchStrategy::ImmediateAck(ImmediateAckStrategy::new(
                l.clone(),
                self.ledger.clone(),
            )),
            Listener::BatchAcknowledge(l) => DispatchStrategy::BatchAck(BatchAckStrategy::new(
                l.clone(),
                self.ledger.clone(),
                config.batch_consume_size,
            )),
        };

        info!(
            strategy = %kind,
            partition_orderly = config.partition_orderly,
            "Bound message listener"
        );
        self.binding = Some(ListenerBinding {
            listener,
            kind,
            partition_orderly: config.partition_orderly,
        });
        Ok(strategy)
    }

    fn resolve(listener: &Listener, config: &EngineConfig) -> Result<StrategyKind, ConfigurationError> {
        if config.proxy_mode.is_enabled() && !matches!(listener, Listener::Acknowledge(_)) {
            return Err(ConfigurationError::ProxyRequiresAcknowledge);
        }

        match listener {
            Listener::AutoCommit(_) if !config.auto_commit => {
                Err(ConfigurationError::AutoCommitListenerWithoutAutoCommit)
            }
            Listener::AutoCommit(_) => Ok(StrategyKind::AutoCommit),
            _ if config.auto_commit => Err(ConfigurationError::AcknowledgeWithAutoCommit),
            Listener::BatchAcknowledge(_) if config.partition_orderly => {
                Err(ConfigurationError::BatchAcknowledgeWithPartitionOrderly)
            }
            Listener::BatchAcknowledge(_) => Ok(StrategyKind::BatchAck),
            Listener::Acknowledge(_) => Ok(StrategyKind::ImmediateAck),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProxyMode;
    use crate::test_utils::{RecordingAckListener, RecordingAutoCommitListener, RecordingBatchListener};

    fn config() -> EngineConfig {
        EngineConfig::new("localhost:9092", "group").with_topics(["events"])
    }

    fn registry() -> ListenerServiceRegistry {
        ListenerServiceRegistry::new(Arc::new(OffsetLedger::new()))
    }

    fn configuration_error(result: Result<DispatchStrategy, EngineError>) -> ConfigurationError {
        match result {
            Err(EngineError::Configuration(e)) => e,
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_each_listener_gets_its_strategy() {
        let strategy = registry()
            .bind(Listener::acknowledge(RecordingAckListener::acking()), &config())
            .unwrap();
        assert_eq!(strategy.kind(), StrategyKind::ImmediateAck);

        let strategy = registry()
            .bind(Listener::batch_acknowledge(RecordingBatchListener::default()), &config())
            .unwrap();
        assert_eq!(strategy.kind(), StrategyKind::BatchAck);

        let strategy = registry()
            .bind(
                Listener::auto_commit(RecordingAutoCommitListener::default()),
                &config().with_auto_commit(true),
            )
            .unwrap();
        assert_eq!(strategy.kind(), StrategyKind::AutoCommit);
        assert!(!strategy.tracks_offsets());
    }

    #[test]
    fn test_manual_ack_with_auto_commit_is_rejected() {
        let err = configuration_error(registry().bind(
            Listener::acknowledge(RecordingAckListener::acking()),
            &config().with_auto_commit(true),
        ));
        assert_eq!(err, ConfigurationError::AcknowledgeWithAutoCommit);

        let err = configuration_error(registry().bind(
            Listener::batch_acknowledge(RecordingBatchListener::default()),
            &config().with_auto_commit(true),
        ));
        assert_eq!(err, ConfigurationError::AcknowledgeWithAutoCommit);
    }

    #[test]
    fn test_auto_commit_listener_requires_auto_commit() {
        let err = configuration_error(registry().bind(
            Listener::auto_commit(RecordingAutoCommitListener::default()),
            &config(),
        ));
        assert_eq!(err, ConfigurationError::AutoCommitListenerWithoutAutoCommit);
    }

    #[test]
    fn test_batch_ack_with_partition_orderly_is_rejected() {
        let err = configuration_error(registry().bind(
            Listener::batch_acknowledge(RecordingBatchListener::default()),
            &config().with_partition_orderly(true),
        ));
        assert_eq!(err, ConfigurationError::BatchAcknowledgeWithPartitionOrderly);
    }

    #[test]
    fn test_proxy_mode_requires_acknowledge_listener() {
        let err = configuration_error(registry().bind(
            Listener::batch_acknowledge(RecordingBatchListener::default()),
            &config().with_proxy_mode(ProxyMode::Push),
        ));
        assert_eq!(err, ConfigurationError::ProxyRequiresAcknowledge);

        assert!(registry()
            .bind(
                Listener::acknowledge(RecordingAckListener::acking()),
                &config().with_proxy_mode(ProxyMode::Pull),
            )
            .is_ok());
    }

    #[test]
    fn test_second_bind_is_a_usage_error() {
        let mut registry = registry();
        registry
            .bind(Listener::acknowledge(RecordingAckListener::acking()), &config())
            .unwrap();
        assert!(registry.is_bound());

        let result = registry.bind(Listener::acknowledge(RecordingAckListener::acking()), &config());
        assert!(matches!(
            result,
            Err(EngineError::Usage(UsageError::ListenerAlreadyBound))
        ));
        assert_eq!(registry.binding().unwrap().kind, StrategyKind::ImmediateAck);
    }
}
