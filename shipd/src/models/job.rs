//! Deployment job models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a deployment job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted and waiting on the work queue
    Pending,

    /// Picked up by the worker, pipeline in progress
    Running,

    /// Pipeline finished successfully
    Completed,

    /// Pipeline aborted at some step
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving from `self` to `next` respects pending -> running -> terminal
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deployment attempt for a project/branch pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployJob {
    /// Unique job ID, stable for the job's lifetime
    pub id: String,

    /// Target project
    pub project_name: String,

    /// Requested source branch
    pub branch: String,

    /// Current status
    pub status: JobStatus,

    /// Time the job was enqueued
    pub started_at: DateTime<Utc>,

    /// Time the job reached a terminal status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Failure description, only set when failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Captured log lines
    pub output: Vec<String>,
}

impl DeployJob {
    /// Create a pending job with a fresh ID
    pub fn new(project_name: &str, branch: &str) -> Self {
        Self {
            id: format!("deploy-{}-{}", project_name, uuid::Uuid::new_v4().simple()),
            project_name: project_name.to_string(),
            branch: branch.to_string(),
            status: JobStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            output: Vec::new(),
        }
    }
}

/// Job-level lifecycle notification broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployEvent {
    pub job_id: String,

    #[serde(rename = "service")]
    pub project_name: String,

    pub status: JobStatus,

    pub message: String,

    pub time: DateTime<Utc>,
}

impl DeployEvent {
    pub fn new(job: &DeployJob, status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            project_name: job.project_name.clone(),
            status,
            message: message.into(),
            time: Utc::now(),
        }
    }
}
