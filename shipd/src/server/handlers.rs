//! HTTP request handlers

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::deploy::live::stream_deployment;
use crate::deploy::sink::FrameSink;
use crate::errors::ShipError;
use crate::models::job::DeployJob;
use crate::remote::commands::{self, ContainerStatus};
use crate::remote::RemoteHost;
use crate::server::state::ServerState;
use crate::storage::settings::ProjectSettings;
use crate::utils::version_info;

const DEFAULT_HISTORY_LIMIT: usize = 10;
const DEFAULT_LOG_LINES: u32 = 100;
const MAX_LOG_LINES: u32 = 5000;

/// Error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ShipError {
    fn into_response(self) -> Response {
        let status = match &self {
            ShipError::NotFound(_) => StatusCode::NOT_FOUND,
            ShipError::Conflict(_) => StatusCode::CONFLICT,
            ShipError::EnqueueFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            ShipError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ShipError::ConnectionFailed(_) | ShipError::RemoteCommand(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

/// Acknowledgement body for fire-and-forget operations
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "shipd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

// ================================ PROJECTS ===================================== //

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub name: String,
    pub path: String,
    pub branch: String,
    pub docker_compose: String,
    pub health_check: Option<String>,
    pub server: RemoteHost,
}

pub async fn projects_handler(State(state): State<Arc<ServerState>>) -> Json<Vec<ProjectInfo>> {
    let projects = state
        .deployer
        .projects()
        .list()
        .into_iter()
        .map(|(name, project)| ProjectInfo {
            name,
            path: project.path,
            branch: project.branch,
            docker_compose: project.docker_compose,
            health_check: project.health_check,
            server: project.server,
        })
        .collect();
    Json(projects)
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,

    #[serde(flatten)]
    pub project: ProjectSettings,
}

pub async fn create_project_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<ActionResponse>), ShipError> {
    state
        .deployer
        .projects()
        .add(&request.name, request.project)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ActionResponse {
            success: true,
            message: format!("Project {} added", request.name),
        }),
    ))
}

pub async fn update_project_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(project): Json<ProjectSettings>,
) -> Result<Json<ActionResponse>, ShipError> {
    state.deployer.projects().update(&name, project).await?;
    Ok(Json(ActionResponse {
        success: true,
        message: format!("Project {} updated", name),
    }))
}

pub async fn delete_project_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ShipError> {
    state.deployer.projects().remove(&name).await?;
    Ok(Json(ActionResponse {
        success: true,
        message: format!("Project {} removed", name),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatusResponse {
    pub status: ContainerStatus,
    pub commit: Option<String>,
    pub branch: String,
    pub last_deploy: Option<DateTime<Utc>>,
    pub active_job: Option<String>,
}

pub async fn project_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<Json<ProjectStatusResponse>, ShipError> {
    let project = state.deployer.projects().get(&name)?;
    let status = state.deployer.status(&name).await?;
    let commit = state.deployer.current_commit(&project).await.ok();

    let last_deploy = state
        .queue
        .get_history(&name, 1)
        .first()
        .and_then(|job| job.completed_at);
    let active_job = state
        .queue
        .get_active_jobs()
        .into_iter()
        .find(|job| job.project_name == name)
        .map(|job| job.id);

    Ok(Json(ProjectStatusResponse {
        status,
        commit,
        branch: project.branch.clone(),
        last_deploy,
        active_job,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    pub branch: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub success: bool,
    pub message: String,
    pub job_id: String,
    pub job: DeployJob,
}

pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(request): Json<DeployRequest>,
) -> Result<(StatusCode, Json<DeployResponse>), ShipError> {
    let project = state.deployer.projects().get(&name)?;
    let branch = resolve_branch(&request.branch, &project.branch)?;
    let job = state.queue.enqueue(&name, branch)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DeployResponse {
            success: true,
            message: "Deployment queued".to_string(),
            job_id: job.id.clone(),
            job,
        }),
    ))
}

pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<ActionResponse>), ShipError> {
    state.deployer.projects().get(&name)?;

    let deployer = state.deployer.clone();
    let project_name = name.clone();
    tokio::spawn(async move {
        if let Err(e) = deployer.rollback(&project_name).await {
            error!("Rollback of {} failed: {}", project_name, e);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(ActionResponse {
            success: true,
            message: format!("Rollback of {} started", name),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: String,
}

pub async fn logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ShipError> {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES).clamp(1, MAX_LOG_LINES);
    let logs = state.deployer.logs(&name, lines).await?;
    Ok(Json(LogsResponse { logs }))
}

#[derive(Debug, Serialize)]
pub struct EnvironmentResponse {
    pub environment: BTreeMap<String, String>,
}

pub async fn environment_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<Json<EnvironmentResponse>, ShipError> {
    let environment = state.deployer.environment(&name).await?;
    Ok(Json(EnvironmentResponse { environment }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

impl HistoryQuery {
    fn limit(&self) -> usize {
        match self.limit {
            Some(limit) if limit > 0 => limit,
            _ => DEFAULT_HISTORY_LIMIT,
        }
    }
}

pub async fn project_history_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<DeployJob>>, ShipError> {
    state.deployer.projects().get(&name)?;
    Ok(Json(state.queue.get_history(&name, query.limit())))
}

pub async fn test_connection_handler(
    State(state): State<Arc<ServerState>>,
    Json(host): Json<RemoteHost>,
) -> Result<Json<ActionResponse>, ShipError> {
    host.validate()?;
    let response = match state.deployer.check_connection(&host).await {
        Ok(()) => ActionResponse {
            success: true,
            message: format!("Connected to {}", host),
        },
        Err(e) => ActionResponse {
            success: false,
            message: e.to_string(),
        },
    };
    Ok(Json(response))
}

/// Requested branch, or the configured one when none is given
fn resolve_branch<'a>(requested: &'a str, configured: &'a str) -> Result<&'a str, ShipError> {
    let branch = match requested.trim() {
        "" => configured,
        requested => requested,
    };
    if commands::is_valid_branch(branch) {
        Ok(branch)
    } else {
        Err(ShipError::ValidationError(format!("invalid branch name: {:?}", branch)))
    }
}

// ================================== JOBS ======================================= //

pub async fn job_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<DeployJob>, ShipError> {
    state.queue.get_job(&id).map(Json)
}

pub async fn active_jobs_handler(State(state): State<Arc<ServerState>>) -> Json<Vec<DeployJob>> {
    Json(state.queue.get_active_jobs())
}

pub async fn history_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<DeployJob>> {
    Json(state.queue.get_history("", query.limit()))
}

/// Server-sent stream of deployment events
pub async fn events_handler(
    State(state): State<Arc<ServerState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = state
        .queue
        .watch(format!("client-{}", Uuid::new_v4().simple()));
    info!("Event stream opened for {}", subscription.client_id());

    let stream = subscription
        .into_stream()
        .take_until(state.shutdown_signal())
        .map(|event| Event::default().json_data(&event));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
pub struct LiveDeployQuery {
    #[serde(default)]
    pub branch: String,
}

/// Deploy a project while streaming its output over a websocket
pub async fn live_deploy_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Query(query): Query<LiveDeployQuery>,
) -> Response {
    let branch = match state.deployer.projects().get(&name) {
        Ok(project) => match resolve_branch(&query.branch, &project.branch) {
            Ok(branch) => branch.to_string(),
            Err(e) => return e.into_response(),
        },
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| stream_logs(socket, state, name, branch))
}

async fn stream_logs(socket: WebSocket, state: Arc<ServerState>, project_name: String, branch: String) {
    let (sender, mut receiver) = socket.split();
    let sink = Arc::new(FrameSink::new(sender.with(|text: String| {
        futures::future::ready(Ok::<Message, axum::Error>(Message::Text(text.into())))
    })));

    // keep reading so control frames are answered
    let reader = tokio::spawn(async move {
        while let Some(Ok(_)) = receiver.next().await {}
    });

    match stream_deployment(&state.queue, &project_name, &branch, sink.clone()).await {
        Ok(job) => info!("Live deployment {} finished as {}", job.id, job.status),
        Err(e) => warn!("Live deployment of {} ended: {}", project_name, e),
    }

    let _ = sink.close().await;
    reader.abort();
}
