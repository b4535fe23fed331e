//! End-to-end single-node tests: bootstrap the full node in-process and
//! drive it through the HTTP API.

use std::time::Duration;

use actix_web::http::header;
use actix_web::{test, App};
use scheduler0::config::Scheduler0Config;
use scheduler0::lifecycle::bootstrap;
use scheduler0::{middleware, routes};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// admin:admin
const PEER_AUTH: &str = "Basic YWRtaW46YWRtaW4=";

fn test_config() -> Scheduler0Config {
    Scheduler0Config {
        sqlite_file_path: ":memory:".to_string(),
        bootstrap: true,
        ..Default::default()
    }
}

macro_rules! service {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data($state.clone())
                .wrap(middleware::build_cors())
                .configure(routes::configure),
        )
        .await
    };
}

macro_rules! wait_until_writable {
    ($app:expr) => {{
        let mut ready = false;
        for _ in 0..200 {
            let req = test::TestRequest::get().uri("/healthcheck").to_request();
            let body: Value = test::call_and_read_body_json(&$app, req).await;
            if body["acceptingWrites"] == json!(true) {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(ready, "node never started accepting writes");
    }};
}

#[actix_web::test]
async fn healthcheck_reports_liveness() {
    let components = bootstrap(&test_config()).await.unwrap();
    let app = service!(components.state);

    let req = test::TestRequest::get().uri("/healthcheck").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["nodeId"], json!(1));
}

#[actix_web::test]
async fn requests_without_credentials_are_unauthorized() {
    let components = bootstrap(&test_config()).await.unwrap();
    let app = service!(components.state);

    let req = test::TestRequest::get().uri("/projects").to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status().as_u16(), 401);
}

#[actix_web::test]
async fn duplicate_project_names_are_rejected() {
    let components = bootstrap(&test_config()).await.unwrap();
    let app = service!(components.state);
    wait_until_writable!(app);

    let create = || {
        test::TestRequest::post()
            .uri("/projects")
            .insert_header((header::AUTHORIZATION, PEER_AUTH))
            .set_json(json!({"name": "a", "description": "first"}))
            .to_request()
    };

    let first = test::call_service(&app, create()).await;
    assert_eq!(first.status().as_u16(), 201);

    let second = test::call_service(&app, create()).await;
    assert_eq!(second.status().as_u16(), 400);

    let req = test::TestRequest::get()
        .uri("/projects")
        .insert_header((header::AUTHORIZATION, PEER_AUTH))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["total"], json!(1));
}

#[actix_web::test]
async fn job_spec_edits_are_rejected_with_400() {
    let components = bootstrap(&test_config()).await.unwrap();
    let app = service!(components.state);
    wait_until_writable!(app);

    let req = test::TestRequest::post()
        .uri("/projects")
        .insert_header((header::AUTHORIZATION, PEER_AUTH))
        .set_json(json!({"name": "p", "description": "d"}))
        .to_request();
    let project: Value = test::call_and_read_body_json(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/job")
        .insert_header((header::AUTHORIZATION, PEER_AUTH))
        .set_json(json!({
            "projectId": project["id"],
            "spec": "0 */5 * * * *",
            "timezone": "UTC",
            "callbackUrl": "http://127.0.0.1:9/cb",
            "data": "{}"
        }))
        .to_request();
    let job: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(job["spec"], json!("0 */5 * * * *"));

    let req = test::TestRequest::put()
        .uri(&format!("/jobs/{}", job["id"]))
        .insert_header((header::AUTHORIZATION, PEER_AUTH))
        .set_json(json!({"spec": "0 * * * * *"}))
        .to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status().as_u16(), 400);

    // The job is unchanged.
    let req = test::TestRequest::get()
        .uri(&format!("/jobs/{}", job["id"]))
        .insert_header((header::AUTHORIZATION, PEER_AUTH))
        .to_request();
    let stored: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(stored["spec"], json!("0 */5 * * * *"));
}

#[actix_web::test]
async fn invalid_cron_specs_are_rejected() {
    let components = bootstrap(&test_config()).await.unwrap();
    let app = service!(components.state);
    wait_until_writable!(app);

    let req = test::TestRequest::post()
        .uri("/projects")
        .insert_header((header::AUTHORIZATION, PEER_AUTH))
        .set_json(json!({"name": "p", "description": "d"}))
        .to_request();
    let project: Value = test::call_and_read_body_json(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/job")
        .insert_header((header::AUTHORIZATION, PEER_AUTH))
        .set_json(json!({
            "projectId": project["id"],
            "spec": "not a cron",
            "timezone": "UTC",
            "callbackUrl": "http://127.0.0.1:9/cb",
            "data": "{}"
        }))
        .to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status().as_u16(), 400);
}

/// Tiny HTTP sink that answers 200 to every request.
async fn spawn_callback_sink() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
            });
        }
    });
    format!("http://{addr}/cb")
}

#[actix_web::test]
async fn created_job_fires_and_records_an_execution() {
    let components = bootstrap(&test_config()).await.unwrap();
    let app = service!(components.state);
    wait_until_writable!(app);

    let callback_url = spawn_callback_sink().await;

    let req = test::TestRequest::post()
        .uri("/projects")
        .insert_header((header::AUTHORIZATION, PEER_AUTH))
        .set_json(json!({"name": "p", "description": "d"}))
        .to_request();
    let project: Value = test::call_and_read_body_json(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/job")
        .insert_header((header::AUTHORIZATION, PEER_AUTH))
        .set_json(json!({
            "projectId": project["id"],
            "spec": "* * * * * *",
            "timezone": "UTC",
            "callbackUrl": callback_url,
            "data": "{\"ping\": true}"
        }))
        .to_request();
    let job: Value = test::call_and_read_body_json(&app, req).await;
    let job_id = job["id"].as_u64().unwrap();

    // The every-second schedule should produce an execution promptly.
    let mut executions = json!(null);
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let req = test::TestRequest::get()
            .uri(&format!("/executions?jobId={job_id}"))
            .insert_header((header::AUTHORIZATION, PEER_AUTH))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        if body["total"].as_u64().unwrap_or(0) >= 1 {
            executions = body;
            break;
        }
    }

    let rows = executions["data"].as_array().expect("no executions recorded");
    assert!(!rows.is_empty());
    let state = rows[0]["state"].as_str().unwrap();
    assert!(
        ["scheduled", "success", "failed"].contains(&state),
        "unexpected state {state}"
    );
}

#[actix_web::test]
async fn batch_job_creation_is_idempotent_on_request_id() {
    let components = bootstrap(&test_config()).await.unwrap();
    let app = service!(components.state);
    wait_until_writable!(app);

    let req = test::TestRequest::post()
        .uri("/projects")
        .insert_header((header::AUTHORIZATION, PEER_AUTH))
        .set_json(json!({"name": "p", "description": "d"}))
        .to_request();
    let project: Value = test::call_and_read_body_json(&app, req).await;

    let batch = || {
        test::TestRequest::post()
            .uri("/jobs")
            .insert_header((header::AUTHORIZATION, PEER_AUTH))
            .insert_header(("x-request-id", "r-batch-1"))
            .set_json(json!([
                {
                    "projectId": project["id"],
                    "spec": "0 * * * * *",
                    "timezone": "UTC",
                    "callbackUrl": "http://127.0.0.1:9/cb",
                    "data": "{}"
                },
                {
                    "projectId": project["id"],
                    "spec": "0 */2 * * * *",
                    "timezone": "UTC",
                    "callbackUrl": "http://127.0.0.1:9/cb",
                    "data": "{}"
                }
            ]))
            .to_request()
    };

    let first: Value = test::call_and_read_body_json(&app, batch()).await;
    let first_ids: Vec<u64> = first
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["id"].as_u64().unwrap())
        .collect();
    assert_eq!(first_ids.len(), 2);

    // Same request id: same jobs, no duplicates.
    let second: Value = test::call_and_read_body_json(&app, batch()).await;
    let second_ids: Vec<u64> = second
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["id"].as_u64().unwrap())
        .collect();
    assert_eq!(first_ids, second_ids);
}

#[actix_web::test]
async fn peer_uncommitted_logs_round_trip() {
    let components = bootstrap(&test_config()).await.unwrap();
    let app = service!(components.state);
    wait_until_writable!(app);

    let req = test::TestRequest::get()
        .uri("/peer/uncommitted-logs?requestId=fanin-1")
        .insert_header((header::AUTHORIZATION, PEER_AUTH))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let task_id = body["asyncTaskId"].as_u64().unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/peer/async-task/{task_id}"))
        .insert_header((header::AUTHORIZATION, PEER_AUTH))
        .to_request();
    let task: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(task["state"], json!("success"));

    let output: Value = serde_json::from_str(task["output"].as_str().unwrap()).unwrap();
    assert!(output["executionLogs"].is_array());
    assert!(output["asyncTasks"].is_array());
}
