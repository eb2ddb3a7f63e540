//! Pipeline tests against a scripted executor

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use shipd::deploy::progress::{DeployProgress, ProgressReporter, ProgressStatus, ProgressStep};
use shipd::deploy::sink::OutputSink;
use shipd::errors::ShipError;

use crate::mock::{catalog, deployer, project, ScriptedExecutor};

#[derive(Default)]
struct CollectedOutput {
    bytes: Mutex<Vec<u8>>,
}

impl CollectedOutput {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock().unwrap()).into_owned()
    }
}

#[async_trait]
impl OutputSink for CollectedOutput {
    async fn write(&self, bytes: &[u8]) -> Result<(), ShipError> {
        self.bytes.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }
}

/// Output whose reader went away
struct ClosedOutput;

#[async_trait]
impl OutputSink for ClosedOutput {
    async fn write(&self, _bytes: &[u8]) -> Result<(), ShipError> {
        Err(ShipError::ServerError("connection closed".to_string()))
    }
}

fn drain(rx: &mut UnboundedReceiver<DeployProgress>) -> Vec<(ProgressStep, ProgressStatus)> {
    let mut signals = Vec::new();
    while let Ok(progress) = rx.try_recv() {
        signals.push((progress.step, progress.status));
    }
    signals
}

#[tokio::test]
async fn test_successful_deploy_reports_every_step() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .ok("git pull", "Already up to date.\n")
            .ok("git log -1", "abc1234|Fix checkout")
            .ok("up -d --build", "Container shop-web-1 Started\n")
            .ok("curl", "200"),
    );
    let deployer = deployer(executor.clone(), catalog(&[("shop", project(Some("http://localhost/health")))]));
    let output = CollectedOutput::default();
    let (progress, mut rx) = ProgressReporter::channel();

    deployer.deploy("shop", "", &output, &progress).await.unwrap();

    use ProgressStatus::*;
    use ProgressStep::*;
    assert_eq!(
        drain(&mut rx),
        vec![
            (Connect, Active),
            (Connect, Completed),
            (Pull, Active),
            (Pull, Completed),
            (Build, Active),
            (Build, Completed),
            (Health, Active),
            (Health, Completed),
            (Complete, Active),
            (Complete, Completed),
        ]
    );

    let text = output.text();
    assert!(text.contains("Pulling branch main..."));
    assert!(text.contains("Deploying commit: abc1234|Fix checkout"));
    assert!(text.contains("Container shop-web-1 Started"));
    assert!(executor.ran("git pull origin main"));
}

#[tokio::test]
async fn test_pull_failure_falls_back_to_reset() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .fail("git pull", "CONFLICT (content): Merge conflict in app.py")
            .ok("git reset --hard", "HEAD is now at abc1234"),
    );
    let deployer = deployer(executor.clone(), catalog(&[("shop", project(None))]));
    let output = CollectedOutput::default();

    deployer
        .deploy("shop", "release", &output, &ProgressReporter::silent())
        .await
        .unwrap();

    let calls = executor.calls();
    let reset = calls.iter().position(|c| c.contains("git reset --hard origin/release")).unwrap();
    let up = calls.iter().position(|c| c.contains("up -d --build")).unwrap();
    assert!(reset < up);
    assert!(output.text().contains("resetting to origin/release"));
}

#[tokio::test]
async fn test_pull_and_reset_failure_aborts_before_build() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .fail("git pull", "pull refused")
            .fail("git reset --hard", "reset refused"),
    );
    let deployer = deployer(executor.clone(), catalog(&[("shop", project(None))]));
    let (progress, mut rx) = ProgressReporter::channel();

    let err = deployer
        .deploy("shop", "main", &CollectedOutput::default(), &progress)
        .await
        .unwrap_err();

    assert!(matches!(err, ShipError::SyncFailed(_)));
    let message = err.to_string();
    assert!(message.contains("pull refused"));
    assert!(message.contains("reset refused"));
    assert!(!executor.ran("up -d --build"));
    assert_eq!(drain(&mut rx).last(), Some(&(ProgressStep::Pull, ProgressStatus::Error)));
}

#[tokio::test]
async fn test_build_failure_keeps_output_and_skips_health() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .fail("up -d --build", "failed to solve: executor failed running [/bin/sh -c npm ci]\n")
            .ok("curl", "200"),
    );
    let deployer = deployer(executor.clone(), catalog(&[("shop", project(Some("http://localhost/health")))]));
    let output = CollectedOutput::default();
    let (progress, mut rx) = ProgressReporter::channel();

    let err = deployer.deploy("shop", "main", &output, &progress).await.unwrap_err();

    assert!(matches!(err, ShipError::BuildFailed(_)));
    assert!(output.text().contains("failed to solve"));
    let signals = drain(&mut rx);
    assert_eq!(signals.last(), Some(&(ProgressStep::Build, ProgressStatus::Error)));
    assert!(signals.iter().all(|(step, _)| *step != ProgressStep::Health));
    assert!(!executor.ran("curl"));
}

#[tokio::test]
async fn test_compose_down_failure_uses_container_removal() {
    let executor = Arc::new(ScriptedExecutor::new().fail("down --remove-orphans", "no such project"));
    let deployer = deployer(executor.clone(), catalog(&[("shop", project(None))]));

    deployer
        .deploy("shop", "main", &CollectedOutput::default(), &ProgressReporter::silent())
        .await
        .unwrap();

    assert!(executor.ran("xargs -r docker rm -f"));
    assert!(executor.ran("up -d --build"));
}

#[tokio::test]
async fn test_no_health_check_skips_health_step() {
    let executor = Arc::new(ScriptedExecutor::new());
    let deployer = deployer(executor.clone(), catalog(&[("shop", project(None))]));
    let (progress, mut rx) = ProgressReporter::channel();

    deployer
        .deploy("shop", "main", &CollectedOutput::default(), &progress)
        .await
        .unwrap();

    let signals = drain(&mut rx);
    assert!(signals.iter().all(|(step, _)| *step != ProgressStep::Health));
    assert_eq!(signals.last(), Some(&(ProgressStep::Complete, ProgressStatus::Completed)));
    assert!(!executor.ran("curl"));
}

#[tokio::test]
async fn test_unhealthy_service_does_not_fail_deploy() {
    let executor = Arc::new(ScriptedExecutor::new().ok("curl", "503"));
    let deployer = deployer(executor, catalog(&[("shop", project(Some("http://localhost/health")))]));
    let (progress, mut rx) = ProgressReporter::channel();

    deployer
        .deploy("shop", "main", &CollectedOutput::default(), &progress)
        .await
        .unwrap();

    let signals = drain(&mut rx);
    assert!(signals.contains(&(ProgressStep::Health, ProgressStatus::Error)));
    assert_eq!(signals.last(), Some(&(ProgressStep::Complete, ProgressStatus::Completed)));
}

#[tokio::test]
async fn test_connect_failure_aborts_immediately() {
    let executor = Arc::new(ScriptedExecutor::new().fail("connection test", "ssh: connect to host 10.0.0.5 port 22: Connection refused"));
    let deployer = deployer(executor.clone(), catalog(&[("shop", project(None))]));
    let (progress, mut rx) = ProgressReporter::channel();

    let err = deployer
        .deploy("shop", "main", &CollectedOutput::default(), &progress)
        .await
        .unwrap_err();

    assert!(matches!(err, ShipError::ConnectionFailed(_)));
    assert_eq!(executor.calls().len(), 1);
    assert_eq!(
        drain(&mut rx),
        vec![
            (ProgressStep::Connect, ProgressStatus::Active),
            (ProgressStep::Connect, ProgressStatus::Error),
        ]
    );
}

#[tokio::test]
async fn test_unknown_project_and_invalid_branch() {
    let executor = Arc::new(ScriptedExecutor::new());
    let deployer = deployer(executor.clone(), catalog(&[("shop", project(None))]));
    let output = CollectedOutput::default();

    let err = deployer
        .deploy("blog", "main", &output, &ProgressReporter::silent())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(executor.calls().is_empty());

    let err = deployer
        .deploy("shop", "main; rm -rf /", &output, &ProgressReporter::silent())
        .await
        .unwrap_err();
    assert!(matches!(err, ShipError::ValidationError(_)));
    assert!(!executor.ran("rm -rf"));
}

#[tokio::test]
async fn test_rollback_and_environment() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .ok(".env.production", "")
            .ok("/.env", "# comment\nDATABASE_URL=\"postgres://db/shop\"\nDEBUG=false\n"),
    );
    let deployer = deployer(executor.clone(), catalog(&[("shop", project(None))]));

    deployer.rollback("shop").await.unwrap();
    let calls = executor.calls();
    assert!(calls[0].contains("git checkout HEAD~1"));
    assert!(calls[1].contains("up -d --build"));

    let env = deployer.environment("shop").await.unwrap();
    assert_eq!(env.get("DATABASE_URL").map(String::as_str), Some("postgres://db/shop"));
    assert_eq!(env.len(), 2);
}

#[tokio::test]
async fn test_rollback_failure_is_reported() {
    let executor = Arc::new(ScriptedExecutor::new().fail("git checkout", "error: pathspec"));
    let deployer = deployer(executor, catalog(&[("shop", project(None))]));

    let err = deployer.rollback("shop").await.unwrap_err();
    assert!(matches!(err, ShipError::RollbackFailed(_)));
}

#[tokio::test]
async fn test_output_failure_ends_step_with_error() {
    let executor = Arc::new(ScriptedExecutor::new());
    let deployer = deployer(executor.clone(), catalog(&[("shop", project(None))]));
    let (progress, mut rx) = ProgressReporter::channel();

    let err = deployer
        .deploy("shop", "", &ClosedOutput, &progress)
        .await
        .unwrap_err();
    assert!(matches!(err, ShipError::ServerError(_)));

    use ProgressStatus::*;
    use ProgressStep::*;
    assert_eq!(
        drain(&mut rx),
        vec![(Connect, Active), (Connect, Completed), (Pull, Active), (Pull, Error)]
    );
    assert!(!executor.ran("git pull"));
}
