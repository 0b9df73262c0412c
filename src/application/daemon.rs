//! The switchyard daemon.
//!
//! Wires the core components together, registers the built-in handlers,
//! serves the Unix socket and runs maintenance until a shutdown signal.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::providers::{create_provider, MockProvider};
use crate::adapters::socket::SocketServer;
use crate::domain::models::Config;
use crate::domain::ports::CompletionProvider;
use crate::services::{
    register_builtin_handlers, CompletionOrchestrator, ConversationLockManager, CoreServices,
    CorrelationTracer, EventRouter, InjectionRouter, MaintenanceDaemon, MaintenanceDaemonConfig,
};

/// A fully wired daemon.
pub struct Daemon {
    config: Config,
    provider_name: &'static str,
    tracer: Arc<CorrelationTracer>,
    router: Arc<EventRouter>,
    locks: Arc<ConversationLockManager>,
    orchestrator: Arc<CompletionOrchestrator>,
    injection: Arc<InjectionRouter>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Build a daemon using the provider named in `config.provider`.
    pub async fn new(config: Config) -> Result<Self> {
        let provider = create_provider(&config.provider).context("failed to create provider")?;
        Self::with_provider(config, provider).await
    }

    /// Build a daemon backed by the mock provider.
    pub async fn dry_run(config: Config) -> Result<Self> {
        Self::with_provider(config, Arc::new(MockProvider::new())).await
    }

    pub async fn with_provider(config: Config, provider: Arc<dyn CompletionProvider>) -> Result<Self> {
        let tracer = Arc::new(
            CorrelationTracer::new(&config.tracer).context("failed to create correlation tracer")?,
        );
        let router = Arc::new(EventRouter::new(tracer.clone(), &config.router));
        let locks = Arc::new(ConversationLockManager::new(config.locks.clone()).with_router(router.clone()));
        let provider_name = provider.name();
        let orchestrator = Arc::new(CompletionOrchestrator::new(
            config.orchestrator.clone(),
            provider,
            router.clone(),
            locks.clone(),
        ));
        let injection = Arc::new(InjectionRouter::new(config.injection.clone(), router.clone()));

        register_builtin_handlers(&CoreServices {
            router: router.clone(),
            orchestrator: orchestrator.clone(),
            locks: locks.clone(),
            injection: injection.clone(),
            trace_retention: MaintenanceDaemonConfig::from(&config).trace_retention,
        })
        .await
        .context("failed to register built-in handlers")?;

        Ok(Self {
            config,
            provider_name,
            tracer,
            router,
            locks,
            orchestrator,
            injection,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn orchestrator(&self) -> &Arc<CompletionOrchestrator> {
        &self.orchestrator
    }

    pub fn locks(&self) -> &Arc<ConversationLockManager> {
        &self.locks
    }

    pub fn injection(&self) -> &Arc<InjectionRouter> {
        &self.injection
    }

    /// Cancelling this token stops [`Daemon::run`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until SIGINT, SIGTERM or the shutdown token fires.
    pub async fn run(self) -> Result<()> {
        let server = Arc::new(
            SocketServer::new(&self.config.daemon, self.router.clone()).with_shutdown(self.shutdown.clone()),
        );
        let listener = server
            .bind()
            .with_context(|| format!("failed to bind {}", server.path().display()))?;

        let maintenance = MaintenanceDaemon::new(
            self.orchestrator.clone(),
            self.locks.clone(),
            self.injection.clone(),
            self.tracer.clone(),
            MaintenanceDaemonConfig::from(&self.config),
        );
        let maintenance_handle = maintenance.handle();
        let maintenance_task = maintenance.spawn();
        let server_task = tokio::spawn(Arc::clone(&server).serve(listener));

        let handlers = self.router.handler_count().await;
        info!(
            socket = %server.path().display(),
            provider = self.provider_name,
            handlers,
            "switchyard daemon started"
        );

        tokio::select! {
            () = self.shutdown.cancelled() => info!("shutdown requested"),
            signal = shutdown_signal() => {
                info!(signal, "received signal, shutting down");
                self.shutdown.cancel();
            }
        }

        maintenance_handle.stop();
        self.orchestrator.abort_all();
        if let Err(e) = server_task.await {
            warn!(error = %e, "socket server task failed");
        }
        if let Err(e) = maintenance_task.await {
            warn!(error = %e, "maintenance task failed");
        }
        info!("switchyard daemon stopped");
        Ok(())
    }
}

/// Resolve on SIGINT or SIGTERM, naming the signal.
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = interrupt => "SIGINT",
        () = terminate => "SIGTERM",
    }
}
