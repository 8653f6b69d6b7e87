//! Guard service: composition root and HTTP server.
//!
//! Owns the composer (and through it the rate limiter and breaker registry),
//! mounts the registered functions and runs the background sweep.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::domain::config::{ConfigError, GuardConfig};
use crate::middleware::auth::Authenticator;
use crate::middleware::composer::HandlerComposer;
use crate::middleware::rate_limit::sweep_task;
use crate::router::{build_router, FunctionRegistry};

/// Errors starting or running the service
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("service already started")]
    AlreadyStarted,
}

/// Guard service
pub struct GuardService<D> {
    composer: Arc<HandlerComposer<D>>,
    functions: Option<FunctionRegistry<D>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Background sweeps, aborted on shutdown
    cleanup_tasks: Vec<JoinHandle<()>>,
}

impl<D: Send + Sync + 'static> GuardService<D> {
    /// Validate `config` and build the composition root.
    pub fn new(
        config: GuardConfig,
        db: Arc<D>,
        authenticator: Arc<dyn Authenticator>,
        functions: FunctionRegistry<D>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let composer = HandlerComposer::new(config, db).with_authenticator(authenticator);
        Ok(Self {
            composer: Arc::new(composer),
            functions: Some(functions),
            shutdown_tx: None,
            cleanup_tasks: Vec::new(),
        })
    }

    pub fn composer(&self) -> Arc<HandlerComposer<D>> {
        Arc::clone(&self.composer)
    }

    /// Take the router; the service can then no longer be started.
    pub fn into_router(mut self) -> Result<Router, ServiceError> {
        let functions = self.functions.take().ok_or(ServiceError::AlreadyStarted)?;
        Ok(build_router(Arc::clone(&self.composer), functions))
    }

    /// Serve on `addr` until [`shutdown`](Self::shutdown) is called.
    pub async fn serve(&mut self, addr: SocketAddr) -> Result<(), ServiceError> {
        let functions = self.functions.take().ok_or(ServiceError::AlreadyStarted)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        self.start_cleanup_tasks();

        let config = self.composer.config();
        info!(
            addr = %addr,
            functions = functions.len(),
            environment = ?config.environment,
            "Starting guard service"
        );

        let router = build_router(Arc::clone(&self.composer), functions);
        let listener = tokio::net::TcpListener::bind(addr).await?;

        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            info!("Received shutdown signal");
        })
        .await;

        if let Err(e) = &result {
            error!(error = %e, "HTTP server error");
        }
        self.stop_cleanup_tasks();
        info!("Guard service stopped");
        result.map_err(ServiceError::from)
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.stop_cleanup_tasks();
    }

    fn start_cleanup_tasks(&mut self) {
        let settings = &self.composer.config().rate_limit;
        if settings.enabled {
            let limiter = self.composer.rate_limiter();
            self.cleanup_tasks
                .push(tokio::spawn(sweep_task(limiter, settings.sweep_interval)));
        }
    }

    fn stop_cleanup_tasks(&mut self) {
        for task in self.cleanup_tasks.drain(..) {
            task.abort();
        }
    }
}

impl<D> Drop for GuardService<D> {
    fn drop(&mut self) {
        for task in &self.cleanup_tasks {
            task.abort();
        }
    }
}
