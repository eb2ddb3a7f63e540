//! HTTP router tests

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tokio::sync::broadcast;
use tower::ServiceExt;

use shipd::deploy::queue::{DeployQueue, QueueOptions};
use shipd::server::serve::router;
use shipd::server::state::ServerState;

use crate::mock::{catalog, deployer, project, ScriptedExecutor};

fn app(executor: Arc<ScriptedExecutor>, options: QueueOptions) -> (Router, Arc<DeployQueue>) {
    let deployer = deployer(executor, catalog(&[("shop", project(Some("http://localhost:3000/health")))]));
    let (queue, _handle) =
        DeployQueue::start(deployer.clone(), options, Box::pin(std::future::pending()));
    let queue = Arc::new(queue);
    let (shutdown_tx, _) = broadcast::channel(1);

    let state = ServerState::new(queue.clone(), deployer, shutdown_tx);
    (router(Arc::new(state)), queue)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    json_request("POST", uri, body)
}

fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder().method("DELETE").uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_and_version() {
    let (app, _) = app(Arc::new(ScriptedExecutor::new()), QueueOptions::default());

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "shipd");

    let (status, body) = send(&app, get("/version")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_list_projects() {
    let (app, _) = app(Arc::new(ScriptedExecutor::new()), QueueOptions::default());

    let (status, body) = send(&app, get("/api/v1/projects")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "shop");
    assert_eq!(body[0]["branch"], "main");
    assert_eq!(body[0]["healthCheck"], "http://localhost:3000/health");
    assert_eq!(body[0]["server"]["port"], 22);
}

#[tokio::test]
async fn test_deploy_then_query_job() {
    let (app, queue) = app(Arc::new(ScriptedExecutor::new().ok("curl", "200")), QueueOptions::default());

    let (status, body) = send(&app, post_json("/api/v1/project/shop/deploy", r#"{"branch":"main"}"#)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    let job_id = body["jobId"].as_str().unwrap().to_string();
    assert_eq!(body["job"]["status"], "pending");

    tokio::time::timeout(Duration::from_secs(10), async {
        while queue.get_history("shop", 1).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let (status, body) = send(&app, get(&format!("/api/v1/deploy/jobs/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["project_name"], "shop");

    let (status, body) = send(&app, get("/api/v1/project/shop/history?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (_, body) = send(&app, get("/api/v1/deploy/history")).await;
    assert_eq!(body[0]["id"], job_id.as_str());

    let (_, body) = send(&app, get("/api/v1/deploy/active")).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_project_and_job_are_not_found() {
    let (app, queue) = app(Arc::new(ScriptedExecutor::new()), QueueOptions::default());

    let (status, body) = send(&app, post_json("/api/v1/project/blog/deploy", "{}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("blog"));
    assert!(queue.store().is_empty());

    let (status, _) = send(&app, get("/api/v1/deploy/jobs/deploy-shop-unknown")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, post_json("/api/v1/project/blog/rollback", "")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_full_queue_is_service_unavailable() {
    let executor = Arc::new(ScriptedExecutor::new());
    let gate = executor.gate("connection test");
    let (app, _) = app(
        executor,
        QueueOptions {
            capacity: 1,
            ..Default::default()
        },
    );

    let (status, _) = send(&app, post_json("/api/v1/project/shop/deploy", "{}")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    gate.entered().await;
    let (status, _) = send(&app, post_json("/api/v1/project/shop/deploy", "{}")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(&app, post_json("/api/v1/project/shop/deploy", "{}")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().starts_with("Enqueue failed"));
    gate.release(10);
}

#[tokio::test]
async fn test_project_status_and_environment() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .ok("ps --format json", r#"{"Name":"shop-web-1","State":"running"}"#)
            .ok("git log -1", "abc1234|Add search")
            .ok(".env.production", "API_URL=https://shop.example.com\n"),
    );
    let (app, _) = app(executor, QueueOptions::default());

    let (status, body) = send(&app, get("/api/v1/project/shop/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    assert_eq!(body["commit"], "abc1234|Add search");
    assert!(body["lastDeploy"].is_null());

    let (status, body) = send(&app, get("/api/v1/project/shop/environment")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["environment"]["API_URL"], "https://shop.example.com");
}

#[tokio::test]
async fn test_logs_and_failed_remote_command() {
    let executor = Arc::new(ScriptedExecutor::new().fail("logs --tail", "no such service"));
    let (app, _) = app(executor.clone(), QueueOptions::default());

    let (status, body) = send(&app, get("/api/v1/project/shop/logs?lines=20")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("no such service"));
    assert!(executor.ran("logs --tail 20"));
}

#[tokio::test]
async fn test_connection_check_rejects_option_like_user() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (app, _) = app(executor.clone(), QueueOptions::default());

    let (status, body) = send(
        &app,
        post_json(
            "/api/v1/test-connection",
            r#"{"host":"example.invalid","user":"-oProxyCommand=touch /tmp/shipd"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid ssh user"));
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_deploy_rejects_unsafe_branch() {
    let executor = Arc::new(ScriptedExecutor::new());
    let (app, queue) = app(executor.clone(), QueueOptions::default());

    for branch in [r#""main\ntouch\t/tmp/owned""#, r#""-q""#, r#""main;reboot""#] {
        let body = format!(r#"{{"branch":{}}}"#, branch);
        let (status, _) = send(&app, post_json("/api/v1/project/shop/deploy", &body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "branch {}", branch);
    }
    assert!(queue.store().is_empty());
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_project_management() {
    let (app, _) = app(Arc::new(ScriptedExecutor::new()), QueueOptions::default());
    let blog = r#"{"name":"blog","server":{"host":"10.0.0.6","user":"deploy"},"path":"/srv/blog"}"#;

    let (status, body) = send(&app, post_json("/api/v1/projects", blog)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);

    let (status, _) = send(&app, post_json("/api/v1/projects", blog)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        post_json(
            "/api/v1/projects",
            r#"{"name":"wiki","server":{"host":"10.0.0.7","user":"-oProxyCommand=id"},"path":"/srv/wiki"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json(
            "/api/v1/projects",
            r#"{"name":"wiki","server":{"host":"10.0.0.7","user":"deploy"},"path":"/srv/wiki\nreboot"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(&app, get("/api/v1/projects")).await;
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, _) = send(
        &app,
        json_request(
            "PUT",
            "/api/v1/project/blog",
            r#"{"server":{"host":"10.0.0.6","user":"deploy"},"path":"/srv/blog","branch":"release"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&app, get("/api/v1/projects")).await;
    let blog = body
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["name"] == "blog")
        .unwrap()
        .clone();
    assert_eq!(blog["branch"], "release");

    let (status, _) = send(
        &app,
        json_request(
            "PUT",
            "/api/v1/project/wiki",
            r#"{"server":{"host":"10.0.0.7","user":"deploy"},"path":"/srv/wiki"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, delete("/api/v1/project/blog")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, delete("/api/v1/project/blog")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, post_json("/api/v1/project/blog/deploy", "{}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_connection_check() {
    let executor = Arc::new(ScriptedExecutor::new().fail("connection test", "Connection timed out"));
    let (app, _) = app(executor, QueueOptions::default());

    let (status, body) = send(
        &app,
        post_json("/api/v1/test-connection", r#"{"host":"10.0.0.9","user":"ops"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("Connection timed out"));
}
