//! Deployment pipeline: connect, pull, build, health, complete

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::deploy::progress::{ProgressReporter, ProgressStatus, ProgressStep};
use crate::deploy::sink::{write_line, OutputSink};
use crate::errors::ShipError;
use crate::remote::commands::{self, ContainerStatus};
use crate::remote::{RemoteExecutor, RemoteHost};
use crate::storage::settings::{ProjectCatalog, ProjectSettings};

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Pause before probing the health endpoint
    pub health_settle_delay: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            health_settle_delay: Duration::from_secs(5),
        }
    }
}

/// Position of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Nothing entered yet
    Ready,

    /// Step in progress
    Active(ProgressStep),

    /// Step finished, next step not yet entered
    Passed(ProgressStep),

    /// Run stopped at this step
    Aborted(ProgressStep),

    /// Final step passed
    Complete,
}

/// Pipeline input
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Enter a step
    Enter(ProgressStep),

    /// Current step succeeded
    Pass,

    /// Current step failed
    Fail(String),
}

/// Step ordering state machine.
///
/// Steps run once each in the order connect, pull, build, optional health,
/// complete.
#[derive(Debug, Clone)]
pub struct PipelineFsm {
    state: PipelineState,
    error: Option<String>,
}

impl PipelineFsm {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Ready,
            error: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, PipelineState::Complete | PipelineState::Aborted(_))
    }

    fn follows(previous: Option<ProgressStep>, next: ProgressStep) -> bool {
        use ProgressStep::*;
        matches!(
            (previous, next),
            (None, Connect)
                | (Some(Connect), Pull)
                | (Some(Pull), Build)
                | (Some(Build), Health)
                | (Some(Build), Complete)
                | (Some(Health), Complete)
        )
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: PipelineEvent) -> Result<(), String> {
        let new_state = match (self.state, &event) {
            (PipelineState::Ready, PipelineEvent::Enter(step)) if Self::follows(None, *step) => {
                PipelineState::Active(*step)
            }
            (PipelineState::Passed(previous), PipelineEvent::Enter(step))
                if Self::follows(Some(previous), *step) =>
            {
                PipelineState::Active(*step)
            }
            (PipelineState::Active(ProgressStep::Complete), PipelineEvent::Pass) => {
                PipelineState::Complete
            }
            (PipelineState::Active(step), PipelineEvent::Pass) => PipelineState::Passed(step),
            (PipelineState::Active(step), PipelineEvent::Fail(err)) => {
                self.error = Some(err.clone());
                PipelineState::Aborted(step)
            }
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for PipelineFsm {
    fn default() -> Self {
        Self::new()
    }
}

/// Couples the step machine with progress reporting
struct StepTracker<'a> {
    fsm: PipelineFsm,
    progress: &'a ProgressReporter,
}

impl<'a> StepTracker<'a> {
    fn new(progress: &'a ProgressReporter) -> Self {
        Self {
            fsm: PipelineFsm::new(),
            progress,
        }
    }

    fn current(&self) -> Result<ProgressStep, ShipError> {
        match self.fsm.state() {
            PipelineState::Active(step) => Ok(step),
            state => Err(ShipError::PipelineError(format!("no active step in {:?}", state))),
        }
    }

    fn begin(&mut self, step: ProgressStep, message: &str) -> Result<(), ShipError> {
        self.fsm
            .process(PipelineEvent::Enter(step))
            .map_err(ShipError::PipelineError)?;
        self.progress.report(step, ProgressStatus::Active, message);
        Ok(())
    }

    fn pass(&mut self, message: &str) -> Result<(), ShipError> {
        self.finish(ProgressStatus::Completed, message)
    }

    /// Pass the step while signalling a problem; used for advisory steps
    fn pass_with_warning(&mut self, message: &str) -> Result<(), ShipError> {
        self.finish(ProgressStatus::Error, message)
    }

    fn finish(&mut self, status: ProgressStatus, message: &str) -> Result<(), ShipError> {
        let step = self.current()?;
        self.fsm
            .process(PipelineEvent::Pass)
            .map_err(ShipError::PipelineError)?;
        self.progress.report(step, status, message);
        Ok(())
    }

    /// Abort at the current step, handing back the cause
    fn fail(&mut self, message: &str, cause: ShipError) -> ShipError {
        if let Ok(step) = self.current() {
            let _ = self.fsm.process(PipelineEvent::Fail(cause.to_string()));
            warn!("Step {:?} failed: {}", step, self.fsm.error().unwrap_or_default());
            self.progress.report(step, ProgressStatus::Error, message);
        }
        cause
    }
}

/// Runs deployments and project operations against remote hosts
pub struct Deployer {
    executor: Arc<dyn RemoteExecutor>,
    projects: Arc<ProjectCatalog>,
    options: PipelineOptions,
}

impl Deployer {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        projects: Arc<ProjectCatalog>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            executor,
            projects,
            options,
        }
    }

    pub fn projects(&self) -> &ProjectCatalog {
        &self.projects
    }

    /// Deploy `branch` of a project, falling back to its configured branch
    /// when `branch` is empty.
    ///
    /// Build output is streamed into `output` as it is produced. Progress is
    /// reported on entry and exit of every step.
    pub async fn deploy(
        &self,
        project_name: &str,
        branch: &str,
        output: &dyn OutputSink,
        progress: &ProgressReporter,
    ) -> Result<(), ShipError> {
        let project = self.projects.get(project_name)?;
        let branch = if branch.is_empty() { project.branch.as_str() } else { branch };
        let host = &project.server;
        let mut steps = StepTracker::new(progress);

        info!("Deploying {} (branch: {}) to {}", project_name, branch, host);

        steps.begin(ProgressStep::Connect, "Checking server connection")?;
        if let Err(e) = self.check_connection(host).await {
            return Err(steps.fail("Server connection failed", e));
        }
        steps.pass("Server connection verified")?;

        steps.begin(ProgressStep::Pull, "Updating source")?;
        let pulled = async {
            write_line(output, &format!("Pulling branch {}...", branch)).await?;
            self.sync_source(&project, branch, output).await?;
            if let Ok(commit) = self.current_commit(&project).await {
                write_line(output, &format!("Deploying commit: {}", commit)).await?;
            }
            Ok::<(), ShipError>(())
        }
        .await;
        if let Err(e) = pulled {
            return Err(steps.fail("Source update failed", e));
        }
        steps.pass("Source updated")?;

        steps.begin(ProgressStep::Build, "Building and restarting containers")?;
        let built = async {
            write_line(output, "Starting docker compose...").await?;
            let rebuilt = self.rebuild_stack(&project, output).await;
            output.flush().await?;
            rebuilt
        }
        .await;
        if let Err(e) = built {
            return Err(steps.fail("Container build failed", e));
        }
        steps.pass("Containers rebuilt and restarted")?;

        if let Some(url) = &project.health_check {
            steps.begin(ProgressStep::Health, "Checking service health")?;
            match self.check_health(project_name, host, url, output).await {
                Ok(true) => steps.pass("Service is healthy")?,
                Ok(false) => steps.pass_with_warning("Service health check did not pass")?,
                Err(e) => return Err(steps.fail("Health check could not be reported", e)),
            }
        }

        steps.begin(ProgressStep::Complete, "Finishing deployment")?;
        if let Err(e) = write_line(output, "Deployment complete!").await {
            return Err(steps.fail("Deployment output failed", e));
        }
        steps.pass("Deployment complete")?;

        info!("Deployment of {} finished", project_name);
        Ok(())
    }

    async fn sync_source(
        &self,
        project: &ProjectSettings,
        branch: &str,
        output: &dyn OutputSink,
    ) -> Result<(), ShipError> {
        let host = &project.server;
        let pull = commands::git_pull(&project.path, branch)?;

        let first = match self.executor.run(host, &pull).await {
            Ok(out) => return write_block(output, &out).await,
            Err(e) => e,
        };

        warn!("git pull failed on {}, resetting to origin/{}: {}", host, branch, first);
        write_line(
            output,
            &format!("git pull failed, resetting to origin/{}...", branch),
        )
        .await?;

        let reset = commands::git_force_reset(&project.path, branch)?;
        match self.executor.run(host, &reset).await {
            Ok(out) => write_block(output, &out).await,
            Err(second) => Err(ShipError::SyncFailed(format!(
                "git pull failed: {}; reset to origin/{} failed: {}",
                first, branch, second
            ))),
        }
    }

    async fn rebuild_stack(
        &self,
        project: &ProjectSettings,
        output: &dyn OutputSink,
    ) -> Result<(), ShipError> {
        let host = &project.server;
        for stage in commands::compose_rebuild(&project.path, &project.docker_compose)? {
            write_line(output, stage.banner).await?;
            match self.executor.run_streaming(host, &stage.command, output).await {
                Ok(()) => {}
                Err(e) if stage.required => return Err(ShipError::BuildFailed(e.to_string())),
                Err(e) => {
                    write_line(output, &format!("Warning: {}", e)).await?;
                    if let Some(fallback) = &stage.fallback {
                        write_line(output, "Removing containers directly...").await?;
                        if let Err(e) = self.executor.run_streaming(host, fallback, output).await {
                            write_line(output, &format!("Warning: {}", e)).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Wait for the stack to settle and probe its endpoint.
    ///
    /// An unhealthy service is `Ok(false)`; only failing to write output is
    /// an error.
    async fn check_health(
        &self,
        project_name: &str,
        host: &RemoteHost,
        url: &str,
        output: &dyn OutputSink,
    ) -> Result<bool, ShipError> {
        tokio::time::sleep(self.options.health_settle_delay).await;
        write_line(output, &format!("Health check: {}", url)).await?;
        match self.probe_health(host, url).await {
            Ok(code) => {
                write_line(output, &format!("Health check returned {}", code)).await?;
                let healthy = is_healthy_code(&code);
                if !healthy {
                    warn!("Health check for {} returned {}", project_name, code);
                }
                Ok(healthy)
            }
            Err(e) => {
                warn!("Health check for {} failed: {}", project_name, e);
                write_line(output, &format!("Health check failed: {}", e)).await?;
                Ok(false)
            }
        }
    }

    async fn probe_health(&self, host: &RemoteHost, url: &str) -> Result<String, ShipError> {
        let command = commands::health_probe(url)?;
        let out = self.executor.run(host, &command).await?;
        Ok(out.trim().to_string())
    }

    /// Verify that a host accepts commands
    pub async fn check_connection(&self, host: &RemoteHost) -> Result<(), ShipError> {
        self.executor
            .run(host, commands::CONNECTION_CHECK)
            .await
            .map(|_| ())
            .map_err(|e| ShipError::ConnectionFailed(format!("{}: {}", host, e)))
    }

    /// `hash|subject` of the deployed revision
    pub async fn current_commit(&self, project: &ProjectSettings) -> Result<String, ShipError> {
        let command = commands::current_commit(&project.path)?;
        let out = self.executor.run(&project.server, &command).await?;
        Ok(out.trim().to_string())
    }

    /// Revert the working copy to the previous revision and restart the stack
    pub async fn rollback(&self, project_name: &str) -> Result<(), ShipError> {
        let project = self.projects.get(project_name)?;
        let host = &project.server;
        info!("Rolling back {} on {}", project_name, host);

        let checkout = commands::git_checkout_previous(&project.path)?;
        self.executor
            .run(host, &checkout)
            .await
            .map_err(|e| ShipError::RollbackFailed(e.to_string()))?;

        let up = commands::compose_up(&project.path, &project.docker_compose)?;
        self.executor
            .run(host, &up)
            .await
            .map_err(|e| ShipError::RollbackFailed(format!("container restart failed: {}", e)))?;

        info!("Rollback of {} finished", project_name);
        Ok(())
    }

    pub async fn status(&self, project_name: &str) -> Result<ContainerStatus, ShipError> {
        let project = self.projects.get(project_name)?;
        let command = commands::compose_ps_json(&project.path, &project.docker_compose)?;
        let out = self.executor.run(&project.server, &command).await?;
        Ok(commands::parse_container_status(&out))
    }

    pub async fn logs(&self, project_name: &str, lines: u32) -> Result<String, ShipError> {
        let project = self.projects.get(project_name)?;
        let command = commands::compose_logs(&project.path, &project.docker_compose, lines)?;
        self.executor.run(&project.server, &command).await
    }

    /// Variables from the project's env file; empty when none can be read
    pub async fn environment(
        &self,
        project_name: &str,
    ) -> Result<BTreeMap<String, String>, ShipError> {
        let project = self.projects.get(project_name)?;

        let mut candidates: Vec<&str> = Vec::new();
        if let Some(env_file) = &project.env_file {
            candidates.push(env_file.as_str());
        }
        candidates.extend([".env.production", ".env"]);

        for file_name in candidates {
            let command = commands::read_env_file(&project.path, file_name)?;
            match self.executor.run(&project.server, &command).await {
                Ok(contents) if !contents.trim().is_empty() => {
                    return Ok(commands::parse_env_file(&contents));
                }
                _ => continue,
            }
        }
        Ok(BTreeMap::new())
    }
}

fn is_healthy_code(code: &str) -> bool {
    matches!(code.as_bytes().first(), Some(b'2') | Some(b'3')) && code.len() == 3
}

async fn write_block(output: &dyn OutputSink, text: &str) -> Result<(), ShipError> {
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        write_line(output, line).await?;
    }
    Ok(())
}
