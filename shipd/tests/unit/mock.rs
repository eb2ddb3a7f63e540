//! Scripted remote executor

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use shipd::deploy::pipeline::{Deployer, PipelineOptions};
use shipd::deploy::sink::OutputSink;
use shipd::errors::ShipError;
use shipd::remote::{RemoteExecutor, RemoteHost};
use shipd::storage::settings::{ProjectCatalog, ProjectSettings};

#[derive(Debug, Clone)]
enum Outcome {
    Ok(String),
    Fail(String),
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    outcome: Outcome,
}

/// Blocks commands matching a pattern until released
pub struct Gate {
    pattern: String,
    open: Semaphore,
    entered: Notify,
}

impl Gate {
    /// Wait until a gated command is blocked
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let `n` gated commands through
    pub fn release(&self, n: usize) {
        self.open.add_permits(n);
    }
}

/// Executor answering commands from a script of substring rules.
///
/// The first matching rule wins; unmatched commands succeed with no output.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Gate>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(self, pattern: &str, output: &str) -> Self {
        self.push(pattern, Outcome::Ok(output.to_string()))
    }

    pub fn fail(self, pattern: &str, output: &str) -> Self {
        self.push(pattern, Outcome::Fail(output.to_string()))
    }

    fn push(self, pattern: &str, outcome: Outcome) -> Self {
        self.rules
            .lock()
            .unwrap()
            .push(Rule { pattern: pattern.to_string(), outcome });
        self
    }

    /// Hold every command containing `pattern` until the gate is released
    pub fn gate(&self, pattern: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate {
            pattern: pattern.to_string(),
            open: Semaphore::new(0),
            entered: Notify::new(),
        });
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Commands run so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.calls().iter().any(|c| c.contains(pattern))
    }

    async fn answer(&self, command: &str) -> Outcome {
        self.calls.lock().unwrap().push(command.to_string());

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate.filter(|g| command.contains(&g.pattern)) {
            gate.entered.notify_one();
            if let Ok(permit) = gate.open.acquire().await {
                permit.forget();
            }
        }

        let rules = self.rules.lock().unwrap().clone();
        rules
            .into_iter()
            .find(|r| command.contains(&r.pattern))
            .map(|r| r.outcome)
            .unwrap_or(Outcome::Ok(String::new()))
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(&self, _host: &RemoteHost, command: &str) -> Result<String, ShipError> {
        match self.answer(command).await {
            Outcome::Ok(output) => Ok(output),
            Outcome::Fail(output) => Err(ShipError::RemoteCommand(output)),
        }
    }

    async fn run_streaming(
        &self,
        _host: &RemoteHost,
        command: &str,
        sink: &dyn OutputSink,
    ) -> Result<(), ShipError> {
        match self.answer(command).await {
            Outcome::Ok(output) => sink.write(output.as_bytes()).await,
            Outcome::Fail(output) => {
                sink.write(output.as_bytes()).await?;
                Err(ShipError::RemoteCommand(output))
            }
        }
    }
}

pub fn project(health_check: Option<&str>) -> ProjectSettings {
    let mut project = ProjectSettings::new(RemoteHost::new("10.0.0.5", "deploy"), "/srv/shop");
    project.health_check = health_check.map(str::to_string);
    project
}

pub fn catalog(projects: &[(&str, ProjectSettings)]) -> Arc<ProjectCatalog> {
    let projects: BTreeMap<String, ProjectSettings> = projects
        .iter()
        .map(|(name, project)| (name.to_string(), project.clone()))
        .collect();
    Arc::new(ProjectCatalog::new(projects))
}

pub fn deployer(executor: Arc<ScriptedExecutor>, catalog: Arc<ProjectCatalog>) -> Arc<Deployer> {
    Arc::new(Deployer::new(
        executor,
        catalog,
        PipelineOptions {
            health_settle_delay: Duration::ZERO,
        },
    ))
}
