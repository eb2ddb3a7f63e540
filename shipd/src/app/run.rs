//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::deploy::pipeline::Deployer;
use crate::deploy::queue::{DeployQueue, QueueOptions};
use crate::errors::ShipError;
use crate::remote::ssh::SshExecutor;
use crate::remote::RemoteExecutor;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::storage::settings::ProjectCatalog;

/// Run shipd until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ShipError> {
    info!("Initializing shipd...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start shipd: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), ShipError> {
    let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(options.ssh.clone()));
    let projects = Arc::new(match &options.settings_store {
        Some(store) => ProjectCatalog::with_store(store.clone()),
        None => ProjectCatalog::new(options.projects.clone()),
    });
    info!("Loaded {} projects", projects.len());

    let deployer = Arc::new(Deployer::new(executor, projects, options.pipeline.clone()));

    let queue = init_deploy_queue(
        deployer.clone(),
        options.queue.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_server(options, queue, deployer, shutdown_tx, shutdown_manager).await
}

fn init_deploy_queue(
    deployer: Arc<Deployer>,
    options: QueueOptions,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<Arc<DeployQueue>, ShipError> {
    info!("Initializing deploy queue...");

    let (queue, worker_handle) = DeployQueue::start(
        deployer,
        options,
        Box::pin(async move {
            let _ = shutdown_rx.recv().await;
        }),
    );

    shutdown_manager.with_deploy_worker_handle(worker_handle)?;
    Ok(Arc::new(queue))
}

async fn init_server(
    options: &AppOptions,
    queue: Arc<DeployQueue>,
    deployer: Arc<Deployer>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), ShipError> {
    info!("Initializing HTTP server...");

    let mut shutdown_rx = shutdown_tx.subscribe();
    let server_state = ServerState::new(queue, deployer, shutdown_tx);

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    server_handle: Option<JoinHandle<Result<(), ShipError>>>,
    deploy_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            server_handle: None,
            deploy_worker_handle: None,
        }
    }

    pub fn with_deploy_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ShipError> {
        if self.deploy_worker_handle.is_some() {
            return Err(ShipError::ShutdownError("deploy_worker_handle already set".to_string()));
        }
        self.deploy_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), ShipError>>,
    ) -> Result<(), ShipError> {
        if self.server_handle.is_some() {
            return Err(ShipError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ShipError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), ShipError> {
        info!("Shutting down shipd...");

        // 1. Deploy worker, which finishes any running deployment first
        if let Some(handle) = self.deploy_worker_handle.take() {
            handle.await.map_err(|e| ShipError::ShutdownError(e.to_string()))?;
        }

        // 2. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| ShipError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
