//! Server state

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::deploy::pipeline::Deployer;
use crate::deploy::queue::DeployQueue;

/// Server state shared across handlers
pub struct ServerState {
    pub queue: Arc<DeployQueue>,
    pub deployer: Arc<Deployer>,

    /// Fired on shutdown so long-lived streams end and graceful shutdown can
    /// complete
    pub shutdown_tx: broadcast::Sender<()>,
}

impl ServerState {
    pub fn new(
        queue: Arc<DeployQueue>,
        deployer: Arc<Deployer>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            queue,
            deployer,
            shutdown_tx,
        }
    }

    /// Resolves once shutdown is signalled
    pub fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        async move {
            let _ = shutdown_rx.recv().await;
        }
    }
}
