//! Pipeline step progress signals and their wire frames

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Step of the deployment pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStep {
    Connect,
    Pull,
    Build,
    Health,
    Complete,
}

impl ProgressStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStep::Connect => "connect",
            ProgressStep::Pull => "pull",
            ProgressStep::Build => "build",
            ProgressStep::Health => "health",
            ProgressStep::Complete => "complete",
        }
    }
}

impl std::str::FromStr for ProgressStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(ProgressStep::Connect),
            "pull" => Ok(ProgressStep::Pull),
            "build" => Ok(ProgressStep::Build),
            "health" => Ok(ProgressStep::Health),
            "complete" => Ok(ProgressStep::Complete),
            _ => Err(format!("Unknown step: {}", s)),
        }
    }
}

/// Status of a step at the time of the signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Active,
    Completed,
    Error,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Active => "active",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for ProgressStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ProgressStatus::Active),
            "completed" => Ok(ProgressStatus::Completed),
            "error" => Ok(ProgressStatus::Error),
            _ => Err(format!("Unknown progress status: {}", s)),
        }
    }
}

/// Fine-grained per-step progress signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployProgress {
    pub step: ProgressStep,
    pub message: String,
    pub status: ProgressStatus,
}

/// Text frame sent over a live deployment connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressFrame {
    /// `[PROGRESS] <step>|<status>|<message>`
    Progress(DeployProgress),

    /// `[ERROR] <message>`
    Error(String),

    /// `[COMPLETE] <message>`
    Complete(String),
}

impl std::fmt::Display for ProgressFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressFrame::Progress(p) => write!(
                f,
                "[PROGRESS] {}|{}|{}",
                p.step.as_str(),
                p.status.as_str(),
                p.message
            ),
            ProgressFrame::Error(message) => write!(f, "[ERROR] {}", message),
            ProgressFrame::Complete(message) => write!(f, "[COMPLETE] {}", message),
        }
    }
}

impl std::str::FromStr for ProgressFrame {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("[PROGRESS]") {
            let mut parts = rest.trim_start().splitn(3, '|');
            let (Some(step), Some(status), Some(message)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(format!("Malformed progress frame: {}", s));
            };
            return Ok(ProgressFrame::Progress(DeployProgress {
                step: step.trim().parse()?,
                status: status.trim().parse()?,
                message: message.to_string(),
            }));
        }
        if let Some(rest) = s.strip_prefix("[ERROR]") {
            return Ok(ProgressFrame::Error(rest.trim_start().to_string()));
        }
        if let Some(rest) = s.strip_prefix("[COMPLETE]") {
            return Ok(ProgressFrame::Complete(rest.trim_start().to_string()));
        }
        Err(format!("Not a progress frame: {}", s))
    }
}

/// Emits progress signals to an optional listener
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<DeployProgress>>,
}

impl ProgressReporter {
    /// Reporter that only logs
    pub fn silent() -> Self {
        Self { tx: None }
    }

    pub fn new(tx: mpsc::UnboundedSender<DeployProgress>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Reporter paired with the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeployProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn report(&self, step: ProgressStep, status: ProgressStatus, message: impl Into<String>) {
        let progress = DeployProgress {
            step,
            message: message.into(),
            status,
        };
        debug!(
            step = progress.step.as_str(),
            status = progress.status.as_str(),
            "{}",
            progress.message
        );
        if let Some(tx) = &self.tx {
            // a listener that hung up only loses its own view
            let _ = tx.send(progress);
        }
    }
}
