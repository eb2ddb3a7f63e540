//! In-memory job table and bounded deployment history

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::Utc;

use crate::errors::ShipError;
use crate::models::job::{DeployJob, JobStatus};

struct StoreInner {
    jobs: HashMap<String, DeployJob>,
    history: VecDeque<DeployJob>,
}

/// Job table plus FIFO history of finished jobs.
///
/// The table keeps every job for the process lifetime; only the history is
/// bounded. A single lock covers both so a status change and its history
/// append are never observed half-done.
pub struct JobStore {
    inner: RwLock<StoreInner>,
    history_capacity: usize,
}

impl JobStore {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                jobs: HashMap::new(),
                history: VecDeque::with_capacity(history_capacity),
            }),
            history_capacity,
        }
    }

    /// Register a new job
    pub fn insert(&self, job: DeployJob) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.jobs.insert(job.id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<DeployJob> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.jobs.get(job_id).cloned()
    }

    /// Move a job to `status`, rejecting anything but pending -> running -> terminal
    pub fn transition(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<DeployJob, ShipError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ShipError::NotFound(format!("job not found: {}", job_id)))?;

        if !job.status.can_transition_to(status) {
            return Err(ShipError::Internal(format!(
                "invalid job transition for {}: {} -> {}",
                job_id, job.status, status
            )));
        }

        job.status = status;
        if status.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        if status == JobStatus::Failed {
            job.error = error;
        }
        Ok(job.clone())
    }

    /// Append captured log lines to a job
    pub fn append_output(&self, job_id: &str, lines: Vec<String>) -> Result<(), ShipError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ShipError::NotFound(format!("job not found: {}", job_id)))?;
        job.output.extend(lines);
        Ok(())
    }

    /// Record a finished job in history, evicting the oldest entry at capacity
    pub fn archive(&self, job_id: &str) -> Result<(), ShipError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let job = inner
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| ShipError::NotFound(format!("job not found: {}", job_id)))?;

        if !job.status.is_terminal() {
            return Err(ShipError::Internal(format!(
                "cannot archive job {} in status {}",
                job_id, job.status
            )));
        }

        while inner.history.len() >= self.history_capacity {
            inner.history.pop_front();
        }
        if self.history_capacity > 0 {
            inner.history.push_back(job);
        }
        Ok(())
    }

    /// Finished jobs, most recent first, optionally filtered by project
    pub fn history(&self, project_name: &str, limit: usize) -> Vec<DeployJob> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .history
            .iter()
            .rev()
            .filter(|job| project_name.is_empty() || job.project_name == project_name)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Pending and running jobs, oldest first
    pub fn active(&self) -> Vec<DeployJob> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut jobs: Vec<DeployJob> = inner
            .jobs
            .values()
            .filter(|job| job.status.is_active())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn history_len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.history.len()
    }
}
