//! Remote execution through the system ssh client

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::deploy::sink::OutputSink;
use crate::errors::ShipError;
use crate::remote::{RemoteExecutor, RemoteHost};
use crate::storage::settings::SshSettings;

/// Runs commands by spawning `ssh` in batch mode
#[derive(Debug, Clone)]
pub struct SshExecutor {
    settings: SshSettings,
}

impl SshExecutor {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    /// Arguments passed to the ssh binary for one command
    pub fn args(&self, host: &RemoteHost, command: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            host.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
        ];
        if !self.settings.strict_host_key_checking {
            args.push("-o".to_string());
            args.push("StrictHostKeyChecking=no".to_string());
        }
        if let Some(identity) = &self.settings.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        // nothing after `--` is parsed as an ssh option
        args.push("--".to_string());
        args.push(host.destination());
        args.push(command.to_string());
        args
    }

    fn command(&self, host: &RemoteHost, command: &str) -> Result<Command, ShipError> {
        host.validate()?;
        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(self.args(host, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &RemoteHost, command: &str) -> Result<String, ShipError> {
        debug!("Running on {}: {}", host, command);
        let output = self
            .command(host, command)?
            .output()
            .await
            .map_err(|e| ShipError::ConnectionFailed(format!("failed to spawn ssh: {}", e)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(ShipError::RemoteCommand(format!(
                "`{}` exited with {}: {}",
                command,
                output.status,
                combined.trim()
            )));
        }
        Ok(combined)
    }

    async fn run_streaming(
        &self,
        host: &RemoteHost,
        command: &str,
        sink: &dyn OutputSink,
    ) -> Result<(), ShipError> {
        debug!("Streaming on {}: {}", host, command);
        let mut child = self
            .command(host, command)?
            .spawn()
            .map_err(|e| ShipError::ConnectionFailed(format!("failed to spawn ssh: {}", e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ShipError::Internal("ssh stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ShipError::Internal("ssh stderr not captured".to_string()))?;

        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            tokio::select! {
                read = stdout.read(&mut out_buf), if out_open => match read? {
                    0 => out_open = false,
                    n => sink.write(&out_buf[..n]).await?,
                },
                read = stderr.read(&mut err_buf), if err_open => match read? {
                    0 => err_open = false,
                    n => sink.write(&err_buf[..n]).await?,
                },
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(ShipError::RemoteCommand(format!(
                "`{}` exited with {}",
                command, status
            )));
        }
        Ok(())
    }
}
