//! Serialized deployment queue
//!
//! A single worker drains a bounded work queue, so deployments across all
//! projects run strictly one at a time.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::deploy::events::{EventBus, Subscription};
use crate::deploy::pipeline::Deployer;
use crate::deploy::progress::ProgressReporter;
use crate::deploy::sink::{JobOutputSink, OutputSink, TeeSink};
use crate::deploy::store::JobStore;
use crate::errors::ShipError;
use crate::models::job::{DeployEvent, DeployJob, JobStatus};

/// Queue capacities
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Outstanding job IDs accepted before enqueue fails
    pub capacity: usize,

    /// Finished jobs kept in history
    pub history: usize,

    /// Events buffered per subscriber mailbox
    pub mailbox: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 100,
            history: 100,
            mailbox: 10,
        }
    }
}

/// Live attachment to one job's execution
pub struct LiveObserver {
    /// Receives streamed output alongside the job log
    pub output: Arc<dyn OutputSink>,

    /// Receives per-step progress
    pub progress: ProgressReporter,

    /// Resolved with the final job once it is terminal
    pub finished: oneshot::Sender<DeployJob>,
}

type Observers = Arc<Mutex<HashMap<String, LiveObserver>>>;

/// Deployment job queue
pub struct DeployQueue {
    store: Arc<JobStore>,
    events: Arc<EventBus>,
    observers: Observers,
    work_tx: mpsc::Sender<String>,
}

impl DeployQueue {
    /// Create the queue and spawn its worker.
    ///
    /// The worker stops once `shutdown_signal` resolves while it is idle; a
    /// deployment in progress always runs to the end.
    pub fn start(
        deployer: Arc<Deployer>,
        options: QueueOptions,
        shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> (Self, JoinHandle<()>) {
        let (work_tx, work_rx) = mpsc::channel(options.capacity.max(1));
        let store = Arc::new(JobStore::new(options.history));
        let events = Arc::new(EventBus::new(options.mailbox));
        let observers: Observers = Arc::new(Mutex::new(HashMap::new()));

        let worker = Worker {
            store: store.clone(),
            events: events.clone(),
            observers: observers.clone(),
            deployer,
        };
        let handle = tokio::spawn(worker.run(work_rx, shutdown_signal));

        let queue = Self {
            store,
            events,
            observers,
            work_tx,
        };
        (queue, handle)
    }

    /// Accept a deployment request.
    ///
    /// Never waits for queue space: a full queue fails with `EnqueueFailed`
    /// and leaves no job behind.
    pub fn enqueue(&self, project_name: &str, branch: &str) -> Result<DeployJob, ShipError> {
        self.enqueue_inner(project_name, branch, None)
    }

    /// Accept a deployment request with a live observer attached
    pub fn enqueue_observed(
        &self,
        project_name: &str,
        branch: &str,
        observer: LiveObserver,
    ) -> Result<DeployJob, ShipError> {
        self.enqueue_inner(project_name, branch, Some(observer))
    }

    fn enqueue_inner(
        &self,
        project_name: &str,
        branch: &str,
        observer: Option<LiveObserver>,
    ) -> Result<DeployJob, ShipError> {
        let permit = self.work_tx.try_reserve().map_err(|e| match e {
            TrySendError::Full(_) => ShipError::EnqueueFailed("deploy queue is full".to_string()),
            TrySendError::Closed(_) => {
                ShipError::EnqueueFailed("deploy worker is not running".to_string())
            }
        })?;

        let job = DeployJob::new(project_name, branch);
        self.store.insert(job.clone());
        if let Some(observer) = observer {
            let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            observers.insert(job.id.clone(), observer);
        }

        // published before the worker can see the ID, so no observer sees
        // `running` ahead of `pending`
        self.events.publish(&DeployEvent::new(
            &job,
            JobStatus::Pending,
            "Deployment added to the queue",
        ));
        permit.send(job.id.clone());

        info!("Queued deployment {} for {} ({})", job.id, project_name, branch);
        Ok(job)
    }

    pub fn get_job(&self, job_id: &str) -> Result<DeployJob, ShipError> {
        self.store
            .get(job_id)
            .ok_or_else(|| ShipError::NotFound(format!("job not found: {}", job_id)))
    }

    /// Finished jobs, most recent first; an empty project matches all
    pub fn get_history(&self, project_name: &str, limit: usize) -> Vec<DeployJob> {
        self.store.history(project_name, limit)
    }

    pub fn get_active_jobs(&self) -> Vec<DeployJob> {
        self.store.active()
    }

    pub fn subscribe(&self, client_id: &str) -> mpsc::Receiver<DeployEvent> {
        self.events.subscribe(client_id)
    }

    pub fn unsubscribe(&self, client_id: &str) {
        self.events.unsubscribe(client_id)
    }

    /// Subscription that unsubscribes `client_id` when dropped
    pub fn watch(&self, client_id: impl Into<String>) -> Subscription {
        Subscription::open(self.events.clone(), client_id)
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }
}

struct Worker {
    store: Arc<JobStore>,
    events: Arc<EventBus>,
    observers: Observers,
    deployer: Arc<Deployer>,
}

impl Worker {
    async fn run(
        self,
        mut work_rx: mpsc::Receiver<String>,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) {
        info!("Deploy worker starting...");

        loop {
            let job_id = tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Deploy worker shutting down...");
                    self.detach_observers();
                    return;
                }
                next = work_rx.recv() => match next {
                    Some(job_id) => job_id,
                    None => {
                        info!("Deploy queue closed, worker exiting");
                        return;
                    }
                },
            };

            self.process(&job_id).await;
        }
    }

    /// Release observers of jobs that will not run, ending their streams
    fn detach_observers(&self) {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        if !observers.is_empty() {
            warn!("Detaching {} observers of queued deployments", observers.len());
        }
        observers.clear();
    }

    async fn process(&self, job_id: &str) {
        let job = match self.store.transition(job_id, JobStatus::Running, None) {
            Ok(job) => job,
            Err(e) => {
                error!("Skipping job {}: {}", job_id, e);
                return;
            }
        };
        self.events
            .publish(&DeployEvent::new(&job, JobStatus::Running, "Deployment started"));
        info!("Running deployment {} for {}", job.id, job.project_name);

        let observer = {
            let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            observers.remove(job_id)
        };

        let job_log: Arc<dyn OutputSink> = Arc::new(JobOutputSink::new(self.store.clone(), job_id));
        let (output, progress, finished) = match observer {
            Some(observer) => (
                Arc::new(TeeSink::new(job_log).with_observer(observer.output)) as Arc<dyn OutputSink>,
                observer.progress,
                Some(observer.finished),
            ),
            None => (job_log, ProgressReporter::silent(), None),
        };

        // run in its own task so a panic inside the pipeline fails the job
        // instead of the worker
        let deployer = self.deployer.clone();
        let task_output = output.clone();
        let project_name = job.project_name.clone();
        let branch = job.branch.clone();
        let result = tokio::spawn(async move {
            deployer
                .deploy(&project_name, &branch, task_output.as_ref(), &progress)
                .await
        })
        .await
        .unwrap_or_else(|e| Err(ShipError::Internal(format!("deployment task aborted: {}", e))));

        if let Err(e) = output.flush().await {
            warn!("Failed to flush output of {}: {}", job_id, e);
        }

        let (status, error, message) = match &result {
            Ok(()) => (
                JobStatus::Completed,
                None,
                "Deployment completed successfully".to_string(),
            ),
            Err(e) => (
                JobStatus::Failed,
                Some(e.to_string()),
                format!("Deployment failed: {}", e),
            ),
        };

        let job = match self.store.transition(job_id, status, error) {
            Ok(job) => job,
            Err(e) => {
                error!("Failed to record outcome of {}: {}", job_id, e);
                return;
            }
        };
        if let Err(e) = self.store.archive(job_id) {
            error!("Failed to archive job {}: {}", job_id, e);
        }

        match &result {
            Ok(()) => info!("Deployment {} completed", job_id),
            Err(e) => error!("Deployment {} failed: {}", job_id, e),
        }
        self.events.publish(&DeployEvent::new(&job, status, message));

        if let Some(finished) = finished {
            let _ = finished.send(job);
        }
    }
}
