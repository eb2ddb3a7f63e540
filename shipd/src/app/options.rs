//! Application configuration options

use std::collections::BTreeMap;
use std::time::Duration;

use crate::deploy::pipeline::PipelineOptions;
use crate::deploy::queue::QueueOptions;
use crate::storage::settings::{ProjectSettings, Settings, SettingsStore, SshSettings};

/// Main application options
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Server configuration
    pub server: ServerOptions,

    /// Deploy queue capacities
    pub queue: QueueOptions,

    /// Pipeline tuning
    pub pipeline: PipelineOptions,

    /// SSH client options
    pub ssh: SshSettings,

    /// Deployable projects by name
    pub projects: BTreeMap<String, ProjectSettings>,

    /// Where project edits are saved; edits stay in memory when unset
    pub settings_store: Option<SettingsStore>,
}

impl AppOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            queue: QueueOptions {
                capacity: settings.queue.capacity,
                history: settings.queue.history,
                mailbox: settings.queue.mailbox,
            },
            pipeline: PipelineOptions {
                health_settle_delay: Duration::from_secs(settings.pipeline.health_settle_secs),
            },
            ssh: settings.ssh.clone(),
            projects: settings.projects.clone(),
            settings_store: None,
        }
    }

    pub fn with_settings_store(mut self, store: SettingsStore) -> Self {
        self.settings_store = Some(store);
        self
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}
