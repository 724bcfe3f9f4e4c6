use std::future::Future;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::ConsumptionEngine;
use crate::relay::transport;

/// Runs a proxy-mode engine and the transport remote clients connect to.
pub struct KafkaProxyService {
    config: Config,
    engine: ConsumptionEngine,
}

impl KafkaProxyService {
    pub fn new(config: Config) -> Result<Self> {
        let engine_config = config
            .to_engine_config()
            .context("Invalid consumption configuration")?;
        let engine = ConsumptionEngine::kafka(engine_config).with_context(|| {
            format!(
                "Failed to create consumer for topic '{}' with group '{}'",
                config.kafka_consumer_topic, config.kafka_consumer_group
            )
        })?;
        Self::with_engine(config, engine)
    }

    /// Create a service around an existing engine (useful for testing)
    pub fn with_engine(config: Config, engine: ConsumptionEngine) -> Result<Self> {
        if engine.relay().is_none() {
            bail!("the proxy service needs PROXY_MODE set to push or pull");
        }
        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &ConsumptionEngine {
        &self.engine
    }

    /// Run until SIGTERM or SIGINT
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.proxy_bind_address())
            .await
            .with_context(|| format!("Failed to bind {}", self.config.proxy_bind_address()))?;
        self.run_with_shutdown(listener, shutdown_signal()).await
    }

    /// Run with a custom shutdown signal, serving remote clients on `listener`
    pub async fn run_with_shutdown(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        self.engine
            .start()
            .context("Failed to start the consumption engine")?;

        let relay = self
            .engine
            .relay()
            .cloned()
            .context("Proxy relay is not configured")?;
        let transport_shutdown = CancellationToken::new();
        let transport_handle = tokio::spawn(transport::serve(
            listener,
            relay,
            transport_shutdown.clone(),
        ));

        let engine_closed = self.engine.closed_signal();
        tokio::select! {
            _ = shutdown => info!("Received shutdown signal, shutting down gracefully..."),
            _ = engine_closed.cancelled() => warn!("Consumption engine closed itself, shutting down"),
        }

        transport_shutdown.cancel();
        self.engine.close();

        match tokio::time::timeout(self.config.shutdown_timeout(), self.engine.join()).await {
            Ok(()) => info!("Poll loop stopped"),
            Err(_) => error!(
                "Poll loop shutdown timed out after {:?}",
                self.config.shutdown_timeout()
            ),
        }
        match transport_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Relay transport stopped with error: {e:#}"),
            Err(e) => error!("Relay transport task panicked: {e:#}"),
        }

        info!("Kafka proxy service stopped");
        Ok(())
    }
}

/// Resolves on SIGTERM or SIGINT. A handler that cannot be installed is
/// logged and never fires.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
}
