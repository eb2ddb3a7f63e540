//! Remote command execution
//!
//! The deployment core only talks to remote hosts through [`RemoteExecutor`].
//! [`ssh::SshExecutor`] is the production implementation; tests substitute
//! scripted executors.

pub mod commands;
pub mod ssh;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::deploy::sink::OutputSink;
use crate::errors::ShipError;

/// Connection details of a remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHost {
    /// Hostname or IP address
    pub host: String,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Login user
    pub user: String,
}

fn default_ssh_port() -> u16 {
    22
}

impl RemoteHost {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            user: user.into(),
        }
    }

    /// `user@host` destination string
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Reject user and host values ssh could read as options or as part of
    /// the destination
    pub fn validate(&self) -> Result<(), ShipError> {
        check_destination_part("host", &self.host)?;
        check_destination_part("user", &self.user)?;
        if self.port == 0 {
            return Err(ShipError::ValidationError("invalid ssh port: 0".to_string()));
        }
        Ok(())
    }
}

fn check_destination_part(field: &str, value: &str) -> Result<(), ShipError> {
    let valid = !value.is_empty()
        && !value.starts_with('-')
        && !value.contains('@')
        && !value.chars().any(|c| c.is_whitespace() || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(ShipError::ValidationError(format!("invalid ssh {}: {:?}", field, value)))
    }
}

impl std::fmt::Display for RemoteHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Capability to run shell commands on a remote host.
///
/// Both operations may be slow; callers impose no timeout, that is the
/// implementation's concern.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command and return its combined output.
    ///
    /// A failed command yields an error that includes the captured output.
    async fn run(&self, host: &RemoteHost, command: &str) -> Result<String, ShipError>;

    /// Run a command, writing combined output to `sink` as it is produced.
    async fn run_streaming(
        &self,
        host: &RemoteHost,
        command: &str,
        sink: &dyn OutputSink,
    ) -> Result<(), ShipError>;
}
