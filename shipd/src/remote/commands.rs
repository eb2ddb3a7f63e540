//! Shell command builders for remote project operations
//!
//! Every builder checks its inputs against a character allowlist before
//! interpolating them, since commands are executed by a remote shell.

use std::collections::BTreeMap;

use crate::errors::ShipError;

pub const CONNECTION_CHECK: &str = "echo 'connection test'";

/// Characters allowed in paths besides ASCII alphanumerics
const PATH_EXTRA: &[char] = &['/', '.', '_', '-', '~', '+', '@', ':', ',', '='];

/// Characters allowed in branch names besides ASCII alphanumerics
const BRANCH_EXTRA: &[char] = &['/', '.', '_', '-'];

pub fn is_valid_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('-')
        && path.chars().all(|c| c.is_ascii_alphanumeric() || PATH_EXTRA.contains(&c))
}

pub fn is_valid_branch(branch: &str) -> bool {
    !branch.is_empty()
        && !branch.starts_with('-')
        && !branch.contains("..")
        && branch.chars().all(|c| c.is_ascii_alphanumeric() || BRANCH_EXTRA.contains(&c))
}

fn check_path(path: &str) -> Result<(), ShipError> {
    if is_valid_path(path) {
        Ok(())
    } else {
        Err(ShipError::ValidationError(format!("invalid path: {:?}", path)))
    }
}

fn check_branch(branch: &str) -> Result<(), ShipError> {
    if is_valid_branch(branch) {
        Ok(())
    } else {
        Err(ShipError::ValidationError(format!("invalid branch name: {:?}", branch)))
    }
}

/// Fast-forward sync of the working copy
pub fn git_pull(path: &str, branch: &str) -> Result<String, ShipError> {
    check_path(path)?;
    check_branch(branch)?;
    Ok(format!("cd {} && git pull origin {}", path, branch))
}

/// Destructive reset of the working copy to the remote branch
pub fn git_force_reset(path: &str, branch: &str) -> Result<String, ShipError> {
    check_path(path)?;
    check_branch(branch)?;
    Ok(format!(
        "cd {} && git fetch origin && git reset --hard origin/{}",
        path, branch
    ))
}

/// Short hash and subject of HEAD, formatted as `hash|subject`
pub fn current_commit(path: &str) -> Result<String, ShipError> {
    check_path(path)?;
    Ok(format!(
        "cd {} && git log -1 --pretty=format:'%h|%s' 2>/dev/null || echo 'unknown|'",
        path
    ))
}

/// Check out the revision preceding HEAD
pub fn git_checkout_previous(path: &str) -> Result<String, ShipError> {
    check_path(path)?;
    Ok(format!("cd {} && git checkout HEAD~1", path))
}

/// One stage of the compose rebuild sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeStage {
    /// Banner written to the output before the command runs
    pub banner: &'static str,

    pub command: String,

    /// Failure of this stage aborts the rebuild
    pub required: bool,

    /// Command run when this stage fails, output streamed the same way
    pub fallback: Option<String>,
}

/// Full streamed rebuild: inspect, tear down, rebuild and start the stack
pub fn compose_rebuild(path: &str, compose_file: &str) -> Result<Vec<ComposeStage>, ShipError> {
    check_path(path)?;
    check_path(compose_file)?;

    let project_dir = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);

    Ok(vec![
        ComposeStage {
            banner: "Checking compose file...",
            command: format!("cd {} && ls -la {}", path, compose_file),
            required: false,
            fallback: None,
        },
        ComposeStage {
            banner: "Inspecting existing containers...",
            command: format!("cd {} && docker compose -f {} ps", path, compose_file),
            required: false,
            fallback: None,
        },
        ComposeStage {
            banner: "Stopping existing stack...",
            command: format!(
                "cd {} && docker compose -f {} down --remove-orphans",
                path, compose_file
            ),
            required: false,
            fallback: Some(format!(
                "docker ps -a --filter 'name={}' -q | xargs -r docker rm -f",
                project_dir
            )),
        },
        ComposeStage {
            banner: "Building and starting stack...",
            command: compose_up(path, compose_file)?,
            required: true,
            fallback: None,
        },
    ])
}

/// Rebuild and start the stack detached
pub fn compose_up(path: &str, compose_file: &str) -> Result<String, ShipError> {
    check_path(path)?;
    check_path(compose_file)?;
    Ok(format!(
        "cd {} && docker compose -f {} up -d --build",
        path, compose_file
    ))
}

pub fn compose_ps_json(path: &str, compose_file: &str) -> Result<String, ShipError> {
    check_path(path)?;
    check_path(compose_file)?;
    Ok(format!(
        "cd {} && docker compose -f {} ps --format json",
        path, compose_file
    ))
}

pub fn compose_logs(path: &str, compose_file: &str, lines: u32) -> Result<String, ShipError> {
    check_path(path)?;
    check_path(compose_file)?;
    Ok(format!(
        "cd {} && docker compose -f {} logs --tail {}",
        path, compose_file, lines
    ))
}

/// HTTP status code of the health endpoint, `connection_failed` when unreachable
pub fn health_probe(url: &str) -> Result<String, ShipError> {
    if url.is_empty()
        || url.starts_with('-')
        || url.contains(&['\'', '"', ' ', ';', '`', '$', '|', '&', '\\'][..])
        || url.chars().any(char::is_control)
    {
        return Err(ShipError::ValidationError(format!("invalid health check url: {:?}", url)));
    }
    Ok(format!(
        "curl -s -o /dev/null -w '%{{http_code}}' '{}' || echo 'connection_failed'",
        url
    ))
}

pub fn read_env_file(path: &str, file_name: &str) -> Result<String, ShipError> {
    check_path(path)?;
    check_path(file_name)?;
    Ok(format!("cat {}/{} 2>/dev/null", path.trim_end_matches('/'), file_name))
}

/// Container state summarized from `docker compose ps` output
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Unknown,
}

pub fn parse_container_status(output: &str) -> ContainerStatus {
    if output.contains("running") {
        ContainerStatus::Running
    } else if output.contains("exited") || output.contains("stopped") {
        ContainerStatus::Stopped
    } else {
        ContainerStatus::Unknown
    }
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse `KEY=VALUE` lines, skipping comments and invalid names
pub fn parse_env_file(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim().trim_matches(|c: char| c == '"' || c == '\'')))
        .filter(|(key, _)| is_valid_env_name(key))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
