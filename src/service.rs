use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use metrics::{host_stats, init_provider};
use tokio::{self, signal, sync::watch};
use tracing::{error, info};

use super::routes::RouteState;
use crate::{
    config::ServerConfig,
    dispatcher::FunctionDispatcher,
    drain::DrainModeController,
    host::{ActiveHost, HostBuilder, ScriptHostBuilder},
    lifecycle::LifecycleOrchestrator,
    metrics_publisher::MetricsPublisher,
    routes::create_routes,
    standby::{SpecializationConfig, SpecializationManager},
    workers::{SubprocessWorkerFactory, WorkerChannelManager, WorkerManagerConfig, WorkerProcessFactory},
};

const HTTP_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Service {
    pub config: Arc<ServerConfig>,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub metrics: Arc<host_stats::Metrics>,
    pub active: Arc<ActiveHost>,
    pub workers: Arc<WorkerChannelManager>,
    pub drain: DrainModeController,
    pub specialization: Arc<SpecializationManager>,
    pub publisher: Arc<MetricsPublisher>,
    pub orchestrator: Arc<LifecycleOrchestrator>,
    pub dispatcher: Arc<FunctionDispatcher>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::with_components(
            config,
            Arc::new(SubprocessWorkerFactory::new()),
            Arc::new(ScriptHostBuilder::new()),
        )
    }

    /// Wires the host around the given worker factory and host builder.
    pub fn with_components(
        config: ServerConfig,
        factory: Arc<dyn WorkerProcessFactory>,
        builder: Arc<dyn HostBuilder>,
    ) -> Result<Self> {
        config.validate().context("invalid server configuration")?;
        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let metrics = Arc::new(host_stats::Metrics::new());

        let active = Arc::new(ActiveHost::new(config.host.restart_grace_period()));
        let workers = Arc::new(WorkerChannelManager::new(
            WorkerManagerConfig::from_server_config(&config),
            factory,
            metrics.clone(),
        ));
        let drain = DrainModeController::new();
        let specialization = Arc::new(SpecializationManager::new(
            SpecializationConfig::from_server_config(&config),
            builder,
            active.clone(),
            metrics.clone(),
        ));
        let publisher = Arc::new(MetricsPublisher::new(config.metrics_publisher.clone()));
        let orchestrator = LifecycleOrchestrator::new(
            config.clone(),
            active.clone(),
            specialization.clone(),
            workers.clone(),
            drain.clone(),
            publisher.clone(),
        );
        let dispatcher = Arc::new(FunctionDispatcher::new(
            orchestrator.clone(),
            workers.clone(),
            drain.clone(),
            config.drain.clone(),
            publisher.clone(),
            metrics.clone(),
            config.host.dispatch_timeout(),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            metrics,
            active,
            workers,
            drain,
            specialization,
            publisher,
            orchestrator,
            dispatcher,
        })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            orchestrator: self.orchestrator.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        init_provider(
            self.config.telemetry.enable_metrics,
            self.config.telemetry.endpoint.as_ref(),
            Duration::from_secs(self.config.telemetry.metrics_interval_secs),
            &self.config.instance_id(),
            env!("CARGO_PKG_VERSION"),
        )?;

        // the admin surface answers status reads while the host boots
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator.boot().await {
                error!("host boot failed: {:?}", err);
            }
        });

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, orchestrator, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("admin api listening on {}", self.config.listen_addr);
        let routes = create_routes(self.route_state());
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(
    handle: Handle,
    orchestrator: Arc<LifecycleOrchestrator>,
    shutdown_tx: watch::Sender<()>,
) {
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
    info!("signal received, draining host");
    // invocations still in flight need the listener to answer
    orchestrator.shutdown().await;
    handle.graceful_shutdown(Some(HTTP_SHUTDOWN_GRACE));
    let _ = shutdown_tx.send(());
}
