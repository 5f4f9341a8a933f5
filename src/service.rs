use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use processor::{
    config::SafetyNetConfig,
    downtime_ledger::DowntimeLedger,
    interruption_handler::InterruptionHandler,
    inventory::PoolCatalog,
    notice_runner::NoticeRunner,
    pool_risk::PoolRiskRegistry,
    provider::{CloudProvider, InMemoryCloudProvider},
    replica_lifecycle::ReplicaLifecycleManager,
    sweeper::ReconciliationSweeper,
};
use safety_net_utils::{Clock, SystemClock};
use state_store::SafetyNetState;
use tokio::{self, signal, sync::watch};
use tracing::{error, info};

use crate::{
    config::{ProviderConfig, ServerConfig},
    http_provider::HttpCloudProvider,
    routes::{create_routes, RouteState},
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub state: Arc<SafetyNetState>,
    pub clock: Arc<dyn Clock>,
    pub provider: Arc<dyn CloudProvider>,
    pub catalog: Arc<PoolCatalog>,
    pub registry: Arc<PoolRiskRegistry>,
    pub lifecycle: Arc<ReplicaLifecycleManager>,
    pub handler: Arc<InterruptionHandler>,
    pub notice_runner: Arc<NoticeRunner<InterruptionHandler>>,
    pub sweeper: Arc<ReconciliationSweeper>,
    pub ledger: Arc<DowntimeLedger>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let provider: Arc<dyn CloudProvider> = match &config.provider {
            ProviderConfig::InMemory => Arc::new(InMemoryCloudProvider::new(clock.clone())),
            ProviderConfig::Http {
                endpoint,
                request_timeout_secs,
            } => Arc::new(
                HttpCloudProvider::new(endpoint, Duration::from_secs(*request_timeout_secs))
                    .context("error initializing provider client")?,
            ),
        };
        Self::new_with(config, clock, provider).await
    }

    /// Wires the engine around an existing clock and provider.
    pub async fn new_with(
        config: ServerConfig,
        clock: Arc<dyn Clock>,
        provider: Arc<dyn CloudProvider>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let state = SafetyNetState::new(config.state_store_path.parse()?)
            .await
            .context("error initializing state store")?;

        let safety_net_config: Arc<SafetyNetConfig> = Arc::new(config.safety_net.clone());
        let metrics = Arc::new(metrics::safety_net::Metrics::new());
        let catalog = Arc::new(PoolCatalog::new(config.pool_catalog.clone()));
        let registry = Arc::new(PoolRiskRegistry::new(
            state.clone(),
            safety_net_config.pool_cooldown_ms(),
            metrics.clone(),
        ));
        let lifecycle = Arc::new(ReplicaLifecycleManager::new(
            state.clone(),
            provider.clone(),
            catalog.clone(),
            clock.clone(),
            safety_net_config.clone(),
            metrics.clone(),
        ));
        let handler = Arc::new(InterruptionHandler::new(
            state.clone(),
            registry.clone(),
            lifecycle.clone(),
            catalog.clone(),
            clock.clone(),
            safety_net_config.clone(),
            metrics.clone(),
        ));
        let notice_runner = Arc::new(NoticeRunner::new(
            handler.clone(),
            safety_net_config.notice_workers,
            safety_net_config.notice_queue_length,
            metrics.clone(),
        ));
        let sweeper = Arc::new(ReconciliationSweeper::new(
            state.clone(),
            lifecycle.clone(),
            clock.clone(),
            safety_net_config.clone(),
        ));
        let ledger = Arc::new(DowntimeLedger::new(state.clone()));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            state,
            clock,
            provider,
            catalog,
            registry,
            lifecycle,
            handler,
            notice_runner,
            sweeper,
            ledger,
        })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            state: self.state.clone(),
            handler: self.handler.clone(),
            notice_runner: self.notice_runner.clone(),
            sweeper: self.sweeper.clone(),
            ledger: self.ledger.clone(),
            registry: self.registry.clone(),
            catalog: self.catalog.clone(),
            clock: self.clock.clone(),
            config: Arc::new(self.config.safety_net.clone()),
        }
    }

    /// Spawns the notice workers and the sweeper loop.
    pub fn start_background(&self) {
        let notice_runner = self.notice_runner.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move { notice_runner.start(shutdown_rx).await });

        let sweeper = self.sweeper.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move { sweeper.start(shutdown_rx).await });
    }

    pub async fn start(&self) -> Result<()> {
        metrics::init_provider(
            self.config.telemetry.enable_metrics,
            self.config.telemetry.endpoint.as_ref(),
            self.config.telemetry.metrics_interval(),
            Some(&self.config.instance_id()),
            env!("CARGO_PKG_VERSION"),
        )?;

        self.start_background();

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(self.route_state());
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.graceful_shutdown(Some(Duration::from_secs(30)));
    if shutdown_tx.send(()).is_err() {
        error!("background tasks already stopped");
    }
    info!("signal received, shutting down server gracefully");
}
