//! The consumption engine: owns the broker client, runs the poll loop and
//! decides when acknowledged offsets are committed.
//!
//! ```text
//! start()
//!   └─► subscribe / assign            [broker handle]
//!   └─► supervisor task
//!         └─► poll loop               [spawn_blocking, restarted after a panic]
//!               ├─► poll              [broker handle]
//!               ├─► strategy.on_message(record | empty batch)
//!               └─► commit_ready      [broker handle]
//!
//! close()
//!   ├─► relay.close()                 unblocks a poll loop waiting for capacity
//!   ├─► final commit                  [broker handle]
//!   ├─► broker release                [broker handle]
//!   └─► dead-letter sink close
//! ```

pub mod broker;
pub mod config;
pub mod cursor;
pub mod kafka;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dead_letter::{DeadLetterId, DeadLetterSink, KafkaDeadLetterPublisher};
use crate::error::{BrokerError, ConfigurationError, EngineError, UsageError};
use crate::listener::Listener;
use crate::metrics_consts::{
    ASSIGNED_PARTITIONS_GAUGE, COMMITS_COUNTER, COMMIT_FAILURES_COUNTER, DISPATCH_ERRORS_COUNTER,
    FETCH_ERRORS_COUNTER, POISON_PILL_COUNTER, POLL_DURATION_HISTOGRAM, POLL_LOOP_RESTARTS_COUNTER,
    RECORDS_RECEIVED_COUNTER,
};
use crate::record::{OffsetCommit, Partition, Record};
use crate::registry::ListenerServiceRegistry;
use crate::relay::{DeliveryMode, ProxyRelay};
use crate::serializer::SerializerError;
use crate::strategy::{Dispatch, DispatchOutcome, DispatchStrategy, StrategyKind};

pub use broker::{BrokerClient, BrokerHandle, RebalanceListener};
pub use config::{AddressResolver, BrokerAddresses, ConsumerConfigBuilder, EngineConfig, ProxyMode};
use cursor::{CursorSnapshot, OffsetLedger};
pub use kafka::KafkaBroker;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    Closed,
}

/// Drops the cursors of revoked partitions so late acknowledgments for them
/// are ignored, handing back what was acknowledged but not yet committed.
struct CursorRevoker {
    ledger: Weak<OffsetLedger>,
}

impl RebalanceListener for CursorRevoker {
    fn on_partitions_revoked(&self, partitions: &[Partition]) -> Vec<OffsetCommit> {
        metrics::gauge!(ASSIGNED_PARTITIONS_GAUGE).decrement(partitions.len() as f64);
        let Some(ledger) = self.ledger.upgrade() else {
            return vec![];
        };
        let commits = ledger.revoke(partitions);
        debug!(
            tracked = ledger.partition_count(),
            final_commits = commits.len(),
            "Dropped cursors of revoked partitions"
        );
        commits
    }

    fn on_partitions_assigned(&self, partitions: &[Partition]) {
        metrics::gauge!(ASSIGNED_PARTITIONS_GAUGE).increment(partitions.len() as f64);
    }
}

struct EngineInner {
    config: EngineConfig,
    state: AtomicU8,
    broker: BrokerHandle,
    ledger: Arc<OffsetLedger>,
    registry: Mutex<ListenerServiceRegistry>,
    strategy: Mutex<Option<DispatchStrategy>>,
    relay: Option<ProxyRelay>,
    dead_letters: Option<Arc<DeadLetterSink>>,
    last_commit: Mutex<Instant>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
}

/// Consumes records for one consumer group member.
///
/// Owns its broker client for its whole life and closes it when dropped. In
/// proxy mode the engine builds its own relay and dead-letter sink and binds
/// the relay as its listener.
pub struct ConsumptionEngine {
    inner: Arc<EngineInner>,
}

impl ConsumptionEngine {
    pub fn new(config: EngineConfig, broker: impl BrokerClient + 'static) -> Result<Self, EngineError> {
        let ledger = Arc::new(OffsetLedger::new());
        let mut registry = ListenerServiceRegistry::new(ledger.clone());

        let (relay, dead_letters, strategy) = match DeliveryMode::from_proxy_mode(config.proxy_mode) {
            None => (None, None, None),
            Some(mode) => {
                let publisher = match &config.dead_letter_topic {
                    Some(topic) => Some(
                        KafkaDeadLetterPublisher::new(&config.brokers.resolve()?, topic.as_str())
                            .map_err(BrokerError::Create)?,
                    ),
                    None => None,
                };
                let dead_letters = Arc::new(DeadLetterSink::new(publisher));
                let relay = ProxyRelay::new(
                    mode,
                    config.relay.clone(),
                    config.partition_orderly,
                    dead_letters.clone(),
                );
                let strategy = registry.bind(Listener::Acknowledge(Arc::new(relay.clone())), &config)?;
                (Some(relay), Some(dead_letters), Some(strategy))
            }
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                state: AtomicU8::new(CREATED),
                broker: BrokerHandle::new(broker),
                ledger,
                registry: Mutex::new(registry),
                strategy: Mutex::new(strategy),
                relay,
                dead_letters,
                last_commit: Mutex::new(Instant::now()),
                supervisor: Mutex::new(None),
                closed: CancellationToken::new(),
            }),
        })
    }

    /// Build an engine backed by a Kafka consumer.
    pub fn kafka(config: EngineConfig) -> Result<Self, EngineError> {
        let client_config = config.client_config()?;
        let broker = KafkaBroker::new(&client_config, config.primary_topic())?;
        Self::new(config, broker)
    }

    /// Bind the listener. Only one listener can ever be bound; in proxy mode
    /// the relay already is.
    pub fn set_listener(&self, listener: Listener) -> Result<(), EngineError> {
        if self.state() == EngineState::Closed {
            return Err(UsageError::EngineClosed.into());
        }
        let strategy = lock(&self.inner.registry).bind(listener, &self.inner.config)?;
        *lock(&self.inner.strategy) = Some(strategy);
        Ok(())
    }

    /// Validate the setup, subscribe and start polling. Starting a running
    /// engine does nothing.
    pub fn start(&self) -> Result<(), EngineError> {
        match self.state() {
            EngineState::Running => return Ok(()),
            EngineState::Closed => return Err(UsageError::EngineClosed.into()),
            EngineState::Created => {}
        }

        let inner = &self.inner;
        inner.config.validate()?;
        let strategy = lock(&inner.registry)
            .binding()
            .map(|binding| binding.kind)
            .ok_or(ConfigurationError::ListenerNotSet)?;
        let handle = Handle::try_current().map_err(|_| UsageError::NoRuntime)?;

        if inner
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return match self.state() {
                EngineState::Closed => Err(UsageError::EngineClosed.into()),
                _ => Ok(()),
            };
        }

        if let Err(e) = inner.subscribe() {
            inner.state.store(CREATED, Ordering::SeqCst);
            return Err(e.into());
        }
        if let Some(relay) = &inner.relay {
            relay.start()?;
        }

        info!("{}", self.startup_info_for(strategy));
        *lock(&inner.last_commit) = Instant::now();

        let supervised = inner.clone();
        let supervisor = handle.spawn(async move { supervised.supervise().await });
        *lock(&inner.supervisor) = Some(supervisor);
        Ok(())
    }

    /// Stop polling and release every resource. Safe to call more than once
    /// and from any thread.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Wait until the poll loop has stopped after `close`.
    pub async fn join(&self) {
        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!("Poll loop supervisor ended abnormally: {}", e);
            }
        }
    }

    /// Read a dead-lettered record. Only available in proxy mode.
    pub fn view(&self, message_id: DeadLetterId) -> Result<Option<Record>, UsageError> {
        let relay = self.inner.relay.as_ref().ok_or(UsageError::ViewWithoutProxy)?;
        Ok(relay.view(message_id))
    }

    pub fn state(&self) -> EngineState {
        match self.inner.state.load(Ordering::SeqCst) {
            CREATED => EngineState::Created,
            RUNNING => EngineState::Running,
            _ => EngineState::Closed,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn relay(&self) -> Option<&ProxyRelay> {
        self.inner.relay.as_ref()
    }

    pub fn dead_letters(&self) -> Option<&Arc<DeadLetterSink>> {
        self.inner.dead_letters.as_ref()
    }

    pub fn strategy_kind(&self) -> Option<StrategyKind> {
        lock(&self.inner.registry).binding().map(|binding| binding.kind)
    }

    pub fn cursor(&self, partition: &Partition) -> Option<CursorSnapshot> {
        self.inner.ledger.snapshot(partition)
    }

    /// Cancelled once the engine is closed, including when it closes itself.
    pub fn closed_signal(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// One-line summary of how this engine consumes.
    pub fn startup_info(&self) -> String {
        let strategy = self
            .strategy_kind()
            .map_or_else(|| "unbound".to_string(), |kind| kind.to_string());
        self.startup_info_for(strategy)
    }

    fn startup_info_for(&self, strategy: impl std::fmt::Display) -> String {
        let config = &self.inner.config;
        let subscription = if config.is_assign_mode() {
            let partitions: Vec<String> = config.partitions.iter().map(ToString::to_string).collect();
            format!("assign partitions=[{}]", partitions.join(","))
        } else {
            format!("subscribe topics=[{}]", config.topics.join(","))
        };
        format!(
            "Consumption engine started: servers={:?} group={} {} auto_commit={} partition_orderly={} proxy_mode={:?} strategy={}",
            config.brokers,
            config.group_id,
            subscription,
            config.auto_commit,
            config.partition_orderly,
            config.proxy_mode,
            strategy
        )
    }
}

impl Drop for ConsumptionEngine {
    fn drop(&mut self) {
        self.inner.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EngineInner {
    fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    fn subscribe(&self) -> Result<(), BrokerError> {
        if self.config.is_assign_mode() {
            self.broker.with(|client| client.assign(&self.config.partitions))?;
            metrics::gauge!(ASSIGNED_PARTITIONS_GAUGE).set(self.config.partitions.len() as f64);
            Ok(())
        } else {
            let revoker: Arc<dyn RebalanceListener> = Arc::new(CursorRevoker {
                ledger: Arc::downgrade(&self.ledger),
            });
            self.broker
                .with(|client| client.subscribe(&self.config.topics, Some(revoker)))
        }
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            let worker = self.clone();
            match tokio::task::spawn_blocking(move || worker.poll_loop()).await {
                Ok(()) => break,
                Err(e) if e.is_panic() && self.is_running() => {
                    error!("Poll loop panicked, restarting: {}", e);
                    metrics::counter!(POLL_LOOP_RESTARTS_COUNTER).increment(1);
                }
                Err(e) => {
                    error!("Poll loop terminated: {}", e);
                    break;
                }
            }
        }
        debug!("Poll loop supervisor stopped");
    }

    fn poll_loop(&self) {
        info!(topic = self.config.primary_topic(), "Poll loop started");

        while self.is_running() {
            let started = Instant::now();
            let polled = self.broker.with(|client| {
                client.poll(self.config.poll_timeout, self.config.max_poll_records)
            });
            metrics::histogram!(POLL_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());

            match polled {
                Ok(records) => self.dispatch_batch(records),
                Err(BrokerError::Closed) => break,
                Err(e) if e.is_topic_missing() => {
                    error!(
                        "Closing consumer so the group can rebalance without it: {}",
                        e
                    );
                    metrics::counter!(FETCH_ERRORS_COUNTER, "kind" => "topic_missing").increment(1);
                    self.close();
                    break;
                }
                Err(e) => {
                    warn!("Fetch failed: {}", e);
                    metrics::counter!(FETCH_ERRORS_COUNTER, "kind" => "transient").increment(1);
                    thread::sleep(self.config.poll_timeout);
                }
            }

            self.commit_ready(false);
        }

        info!("Poll loop stopped");
    }

    fn dispatch_batch(&self, records: Vec<Record>) {
        let mut guard = lock(&self.strategy);
        let Some(strategy) = guard.as_mut() else {
            return;
        };

        if records.is_empty() {
            self.dispatch(strategy, Dispatch::EmptyBatch);
            return;
        }

        metrics::counter!(RECORDS_RECEIVED_COUNTER).increment(records.len() as u64);
        debug!(
            records = records.len(),
            bytes = records.iter().map(Record::size_bytes).sum::<usize>(),
            "Dispatching fetched batch"
        );
        for record in records {
            if !self.is_running() {
                break;
            }
            match self.validate(&record) {
                Ok(()) => self.dispatch(strategy, Dispatch::Record(record)),
                Err(e) => self.handle_poison_pill(strategy, record, e),
            }
        }
    }

    fn dispatch(&self, strategy: &mut DispatchStrategy, dispatch: Dispatch) {
        let position = match &dispatch {
            Dispatch::Record(record) => Some((record.topic_partition(), record.offset)),
            Dispatch::EmptyBatch => None,
        };

        match strategy.on_message(dispatch) {
            Ok(DispatchOutcome::Flushed) => self.commit_ready(true),
            Ok(_) => {}
            Err(e) => {
                metrics::counter!(DISPATCH_ERRORS_COUNTER).increment(1);
                match position {
                    Some((partition, offset)) => {
                        error!(%partition, offset, "Listener failed to handle record: {e:#}")
                    }
                    None => error!("Listener failed to handle batch: {e:#}"),
                }
            }
        }
    }

    fn validate(&self, record: &Record) -> Result<(), SerializerError> {
        if let Some(serializer) = &self.config.key_serializer {
            serializer.validate("key", record.key.as_deref())?;
        }
        if let Some(serializer) = &self.config.value_serializer {
            serializer.validate("value", record.value.as_deref())?;
        }
        Ok(())
    }

    /// A record that can never be deserialized must not block its partition.
    fn handle_poison_pill(&self, strategy: &DispatchStrategy, record: Record, error: SerializerError) {
        warn!(
            topic = record.topic,
            partition = record.partition,
            offset = record.offset,
            "Skipping poison pill: {}",
            error
        );
        metrics::counter!(POISON_PILL_COUNTER).increment(1);

        if !strategy.tracks_offsets() {
            return;
        }
        let ack = self.ledger.track(&record);
        if let Some(dead_letters) = &self.dead_letters {
            if let Err(e) = dead_letters.put(record, error.to_string(), 0) {
                warn!("Leaving poison pill uncommitted: {}", e);
                return;
            }
        }
        ack.acknowledge();
    }

    /// Commit acknowledged offsets when enough acks accumulated, the commit
    /// interval elapsed, or `force` is set.
    fn commit_ready(&self, force: bool) {
        let acks = self.ledger.acks_since_commit();
        let mut last_commit = lock(&self.last_commit);
        let due = force
            || acks >= self.config.commit_batch_size
            || (acks > 0 && last_commit.elapsed() >= self.config.commit_interval);
        if !due {
            return;
        }

        let commits = self.ledger.take_commits();
        *last_commit = Instant::now();
        drop(last_commit);
        if commits.is_empty() {
            return;
        }

        match self.broker.with(|client| client.commit_async(&commits)) {
            Ok(()) => {
                metrics::counter!(COMMITS_COUNTER).increment(commits.len() as u64);
                for commit in &commits {
                    debug!(
                        partition = %commit.partition,
                        offset = commit.offset,
                        "Requested offset commit"
                    );
                }
            }
            Err(e) => {
                metrics::counter!(COMMIT_FAILURES_COUNTER).increment(1);
                warn!("Failed to commit offsets for {} partitions: {}", commits.len(), e);
            }
        }
    }

    fn close(&self) {
        if self.state.swap(CLOSED, Ordering::SeqCst) == CLOSED {
            return;
        }
        info!(topic = self.config.primary_topic(), "Closing consumption engine");

        if let Some(relay) = &self.relay {
            relay.close();
        }
        self.commit_ready(true);
        self.broker.release();
        if let Some(dead_letters) = &self.dead_letters {
            dead_letters.close();
        }
        self.ledger.clear();
        self.closed.cancel();

        info!(topic = self.config.primary_topic(), "Consumption engine closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{MockBroker, RecordingAckListener};

    fn config() -> EngineConfig {
        EngineConfig::new("localhost:9092", "group")
            .with_topics(["events"])
            .with_poll_timeout(Duration::from_millis(10))
    }

    #[test]
    fn test_start_requires_listener() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let engine = ConsumptionEngine::new(config(), MockBroker::new()).unwrap();
        assert!(matches!(
            engine.start(),
            Err(EngineError::Configuration(ConfigurationError::ListenerNotSet))
        ));
        assert_eq!(engine.state(), EngineState::Created);
    }

    #[test]
    fn test_start_outside_runtime_is_usage_error() {
        let engine = ConsumptionEngine::new(config(), MockBroker::new()).unwrap();
        engine
            .set_listener(Listener::acknowledge(RecordingAckListener::acking()))
            .unwrap();
        assert!(matches!(
            engine.start(),
            Err(EngineError::Usage(UsageError::NoRuntime))
        ));
    }

    #[test]
    fn test_start_validates_config() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let engine = ConsumptionEngine::new(config().with_commit_batch_size(0), MockBroker::new()).unwrap();
        engine
            .set_listener(Listener::acknowledge(RecordingAckListener::acking()))
            .unwrap();
        assert!(matches!(
            engine.start(),
            Err(EngineError::Configuration(ConfigurationError::NonPositive("commit_batch_size")))
        ));
    }

    #[test]
    fn test_proxy_mode_binds_relay() {
        let engine = ConsumptionEngine::new(
            config().with_proxy_mode(ProxyMode::Push),
            MockBroker::new(),
        )
        .unwrap();
        assert_eq!(engine.strategy_kind(), Some(StrategyKind::ImmediateAck));
        assert!(engine.relay().is_some());

        let result = engine.set_listener(Listener::acknowledge(RecordingAckListener::acking()));
        assert!(matches!(
            result,
            Err(EngineError::Usage(UsageError::ListenerAlreadyBound))
        ));
    }

    #[test]
    fn test_proxy_mode_with_auto_commit_is_rejected() {
        let result = ConsumptionEngine::new(
            config().with_proxy_mode(ProxyMode::Pull).with_auto_commit(true),
            MockBroker::new(),
        );
        assert!(matches!(
            result,
            Err(EngineError::Configuration(ConfigurationError::AcknowledgeWithAutoCommit))
        ));
    }

    #[test]
    fn test_view_without_proxy_is_usage_error() {
        let engine = ConsumptionEngine::new(config(), MockBroker::new()).unwrap();
        assert_eq!(engine.view(DeadLetterId(1)), Err(UsageError::ViewWithoutProxy));
    }

    #[test]
    fn test_startup_info_describes_subscription() {
        let engine = ConsumptionEngine::new(
            EngineConfig::new("k1:9092", "group-a").with_partitions(vec![Partition::new("events", 2)]),
            MockBroker::new(),
        )
        .unwrap();
        let info = engine.startup_info();
        assert!(info.contains("group=group-a"));
        assert!(info.contains("assign partitions=[events-2]"));
        assert!(info.contains("strategy=unbound"));
    }

    #[test]
    fn test_close_before_start_releases_broker() {
        let broker = MockBroker::new();
        let engine = ConsumptionEngine::new(config(), broker.clone()).unwrap();
        engine.close();
        engine.close();

        assert_eq!(engine.state(), EngineState::Closed);
        assert_eq!(broker.close_count(), 1);
        assert!(engine.closed_signal().is_cancelled());
        assert!(matches!(
            engine.start(),
            Err(EngineError::Usage(UsageError::EngineClosed))
        ));
    }
}
