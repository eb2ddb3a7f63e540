//! Settings file management

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::ShipError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::remote::commands;
use crate::remote::RemoteHost;

/// shipd settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Directory for rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Queue capacities
    #[serde(default)]
    pub queue: QueueSettings,

    /// Pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// SSH client configuration
    #[serde(default)]
    pub ssh: SshSettings,

    /// Deployable projects by name
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectSettings>,
}

impl Settings {
    /// Read settings, falling back to defaults when the file does not exist
    pub async fn load(file: &File) -> Result<Self, ShipError> {
        if !file.exists().await {
            warn!(
                "Settings file {} not found, starting with no projects",
                file.path().display()
            );
            return Ok(Self::default());
        }
        let settings: Settings = file.read_json().await?;
        settings.validate()?;
        Ok(settings)
    }

    /// Write the settings back to `file`
    pub async fn save(&self, file: &File) -> Result<(), ShipError> {
        file.write_json(self).await
    }

    /// Reject project entries that could never be deployed
    pub fn validate(&self) -> Result<(), ShipError> {
        for (name, project) in &self.projects {
            validate_project_name(name)
                .and_then(|_| project.validate())
                .map_err(|e| ShipError::ConfigError(format!("project {}: {}", name, e)))?;
        }
        Ok(())
    }
}

/// Project names appear in URLs and job IDs
pub fn validate_project_name(name: &str) -> Result<(), ShipError> {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(ShipError::ValidationError(format!("invalid project name: {:?}", name)))
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Queue capacity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Outstanding job IDs the work queue accepts before rejecting
    #[serde(default = "default_hundred")]
    pub capacity: usize,

    /// Finished jobs kept in history
    #[serde(default = "default_hundred")]
    pub history: usize,

    /// Events buffered per subscriber mailbox
    #[serde(default = "default_mailbox")]
    pub mailbox: usize,
}

fn default_hundred() -> usize {
    100
}

fn default_mailbox() -> usize {
    10
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: default_hundred(),
            history: default_hundred(),
            mailbox: default_mailbox(),
        }
    }
}

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Wait before probing the health endpoint
    #[serde(default = "default_settle_secs")]
    pub health_settle_secs: u64,
}

fn default_settle_secs() -> u64 {
    5
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            health_settle_secs: default_settle_secs(),
        }
    }
}

/// SSH client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// ssh binary to invoke
    #[serde(default = "default_ssh_binary")]
    pub binary: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Private key passed with `-i`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    #[serde(default)]
    pub strict_host_key_checking: bool,
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: default_ssh_binary(),
            connect_timeout_secs: default_connect_timeout(),
            identity_file: None,
            strict_host_key_checking: false,
        }
    }
}

/// A project bound to a remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub server: RemoteHost,

    /// Working copy path on the remote host
    pub path: String,

    /// Branch deployed when a request names none
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Compose file relative to `path`
    #[serde(default = "default_compose_file")]
    pub docker_compose: String,

    /// Endpoint probed after the stack restarts
    #[serde(default)]
    pub health_check: Option<String>,

    /// Env file read for the environment view
    #[serde(default)]
    pub env_file: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_compose_file() -> String {
    "docker-compose.yml".to_string()
}

impl ProjectSettings {
    pub fn new(server: RemoteHost, path: impl Into<String>) -> Self {
        Self {
            server,
            path: path.into(),
            branch: default_branch(),
            docker_compose: default_compose_file(),
            health_check: None,
            env_file: None,
            port: None,
        }
    }

    /// Check every field that ends up in a remote command
    pub fn validate(&self) -> Result<(), ShipError> {
        self.server.validate()?;
        if !commands::is_valid_path(&self.path) {
            return Err(ShipError::ValidationError(format!("invalid path: {:?}", self.path)));
        }
        if !commands::is_valid_branch(&self.branch) {
            return Err(ShipError::ValidationError(format!("invalid branch: {:?}", self.branch)));
        }
        if !commands::is_valid_path(&self.docker_compose) {
            return Err(ShipError::ValidationError(format!(
                "invalid compose file: {:?}",
                self.docker_compose
            )));
        }
        if let Some(env_file) = &self.env_file {
            if !commands::is_valid_path(env_file) {
                return Err(ShipError::ValidationError(format!("invalid env file: {:?}", env_file)));
            }
        }
        if let Some(url) = &self.health_check {
            commands::health_probe(url)?;
        }
        Ok(())
    }
}

/// Settings file that project edits are written back to
#[derive(Debug, Clone)]
pub struct SettingsStore {
    file: File,
    settings: Settings,
}

impl SettingsStore {
    /// `settings` is what the file holds, without command line overrides
    pub fn new(file: File, settings: Settings) -> Self {
        Self { file, settings }
    }
}

/// Configured projects, editable at runtime.
///
/// Lookups hand out copies, so a deployment keeps the settings it started
/// with even if the project is edited meanwhile. Edits are applied only once
/// they are persisted.
#[derive(Debug, Default)]
pub struct ProjectCatalog {
    projects: RwLock<BTreeMap<String, ProjectSettings>>,
    store: tokio::sync::Mutex<Option<SettingsStore>>,
}

impl ProjectCatalog {
    /// Catalog kept in memory only
    pub fn new(projects: BTreeMap<String, ProjectSettings>) -> Self {
        Self {
            projects: RwLock::new(projects),
            store: tokio::sync::Mutex::new(None),
        }
    }

    /// Catalog persisting edits to the store's settings file
    pub fn with_store(store: SettingsStore) -> Self {
        Self {
            projects: RwLock::new(store.settings.projects.clone()),
            store: tokio::sync::Mutex::new(Some(store)),
        }
    }

    pub fn get(&self, name: &str) -> Result<ProjectSettings, ShipError> {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        projects
            .get(name)
            .cloned()
            .ok_or_else(|| ShipError::NotFound(format!("project not found: {}", name)))
    }

    /// All projects ordered by name
    pub fn list(&self) -> Vec<(String, ProjectSettings)> {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        projects
            .iter()
            .map(|(name, project)| (name.clone(), project.clone()))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        projects.contains_key(name)
    }

    pub fn len(&self) -> usize {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a new project; fails with `Conflict` when the name is taken
    pub async fn add(&self, name: &str, project: ProjectSettings) -> Result<(), ShipError> {
        validate_project_name(name)?;
        project.validate()?;
        self.edit(|projects| {
            if projects.contains_key(name) {
                return Err(ShipError::Conflict(format!("project already exists: {}", name)));
            }
            projects.insert(name.to_string(), project);
            Ok(())
        })
        .await?;
        info!("Added project {}", name);
        Ok(())
    }

    /// Replace the settings of an existing project
    pub async fn update(&self, name: &str, project: ProjectSettings) -> Result<(), ShipError> {
        project.validate()?;
        self.edit(|projects| match projects.get_mut(name) {
            Some(existing) => {
                *existing = project;
                Ok(())
            }
            None => Err(ShipError::NotFound(format!("project not found: {}", name))),
        })
        .await?;
        info!("Updated project {}", name);
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<(), ShipError> {
        self.edit(|projects| match projects.remove(name) {
            Some(_) => Ok(()),
            None => Err(ShipError::NotFound(format!("project not found: {}", name))),
        })
        .await?;
        info!("Removed project {}", name);
        Ok(())
    }

    /// Apply `change` to a copy, persist it, then publish it.
    ///
    /// The store lock serializes edits; readers keep seeing the previous
    /// catalog until the file is written.
    async fn edit<F>(&self, change: F) -> Result<(), ShipError>
    where
        F: FnOnce(&mut BTreeMap<String, ProjectSettings>) -> Result<(), ShipError>,
    {
        let mut store = self.store.lock().await;

        let mut next = {
            let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
            projects.clone()
        };
        change(&mut next)?;

        if let Some(store) = store.as_mut() {
            let mut settings = store.settings.clone();
            settings.projects = next.clone();
            settings.save(&store.file).await?;
            store.settings = settings;
        }

        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        *projects = next;
        Ok(())
    }
}
