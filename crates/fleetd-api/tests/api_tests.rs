use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use fleetd_api::{AppState, routes};
use fleetd_cloud::CloudManagers;
use fleetd_core::host::{Host, HostStatus, HostStore};
use fleetd_core::registry::JobRegistry;
use fleetd_core::settings::Settings;
use fleetd_core::{Environment, HostId};
use fleetd_db::MemoryHostStore;
use fleetd_scheduler::LocalQueue;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    hosts: Arc<MemoryHostStore>,
}

fn app() -> TestApp {
    let hosts = Arc::new(MemoryHostStore::with_hosts([
        Host::new("h1", "ubuntu-docker", "docker")
            .with_status(HostStatus::Provisioning)
            .with_container_build_attempt(2),
        Host::new("gone", "ubuntu-docker", "docker").with_status(HostStatus::Terminated),
    ]));
    let env = Arc::new(Environment::new(
        Arc::new(Settings::default()),
        hosts.clone(),
        Arc::new(CloudManagers::new()),
    ));
    let mut registry = JobRegistry::new();
    fleetd_units::register_all(&mut registry).unwrap();
    let queue = Arc::new(LocalQueue::new(registry));

    TestApp {
        router: routes::router(AppState::new(env, queue)),
        hosts,
    }
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            builder = builder.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_endpoints() {
    let app = app();
    let (status, body) = send(&app.router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app.router, Method::GET, "/health/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn get_host() {
    let app = app();
    let (status, body) = send(&app.router, Method::GET, "/api/v1/hosts/h1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "h1");
    assert_eq!(body["status"], "provisioning");
    assert_eq!(body["container_build_attempt"], 2);

    let (status, _) = send(&app.router, Method::GET, "/api/v1/hosts/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn queue_container_image_build() {
    let app = app();
    let request = json!({ "image_url": "ubuntu:latest" });

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/hosts/h1/container-images",
        Some(request.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["job_id"], "building-container-image.h1.attempt-2.ubuntu:latest");
    assert_eq!(body["attempt"], 2);

    // Same attempt again is the same job.
    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/v1/hosts/h1/container-images",
        Some(request),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app.router,
        Method::GET,
        "/api/v1/jobs/building-container-image.h1.attempt-2.ubuntu:latest",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "pending");
    assert_eq!(body["record"]["body"]["image_url"], "ubuntu:latest");
    assert_eq!(body["record"]["body"]["provider"], "docker");
}

#[tokio::test]
async fn reject_build_on_bad_input() {
    let app = app();

    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/v1/hosts/h1/container-images",
        Some(json!({ "image_url": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/v1/hosts/gone/container-images",
        Some(json!({ "image_url": "ubuntu:latest" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn cancel_job() {
    let app = app();
    send(
        &app.router,
        Method::POST,
        "/api/v1/hosts/h1/container-images",
        Some(json!({ "image_url": "alpine:3" })),
    )
    .await;
    let id = "building-container-image.h1.attempt-2.alpine:3";

    let (status, _) = send(&app.router, Method::POST, &format!("/api/v1/jobs/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (_, body) = send(&app.router, Method::GET, &format!("/api/v1/jobs/{id}"), None).await;
    assert_eq!(body["state"], "cancelled");

    let (status, _) = send(&app.router, Method::POST, "/api/v1/jobs/unknown/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn terminate_host() {
    let app = app();

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/hosts/h1/terminate",
        Some(json!({ "actor": "operator" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "terminated");
    assert_eq!(body["terminated_by"], "operator");

    // A second termination keeps the original actor.
    let (status, body) = send(&app.router, Method::POST, "/api/v1/hosts/h1/terminate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["terminated_by"], "operator");

    let host = app.hosts.find_by_id(&HostId::new("h1")).await.unwrap();
    assert_eq!(host.status, HostStatus::Terminated);
}
