use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tessera_api::routes;
use tessera_clients::{LocalFsObjectStore, ObjectStore};
use tessera_core::{DataOperation, Job, OrchestratorConfig, WorkItem, WorkflowStep};
use tessera_dispatch::DispatchEngine;
use tessera_storage::{InMemoryRepository, Repository};
use tower::ServiceExt;
use uuid::Uuid;

async fn test_app() -> (axum::Router, Arc<dyn Repository>) {
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let store: Arc<dyn ObjectStore> = Arc::new(LocalFsObjectStore::new(std::env::temp_dir()));
    let engine = Arc::new(DispatchEngine::new(repo.clone(), store, OrchestratorConfig::default()));

    let mut job = Job::new(Uuid::new_v4(), "alice", "https://example.com/req");
    job.num_input_granules = 5;
    repo.insert_job(&mut job).await.unwrap();

    let mut step = WorkflowStep::new(job.job_id, 1, "svc-1", 1, false, DataOperation::default());
    repo.insert_workflow_step(&mut step).await.unwrap();
    repo.insert_work_items(vec![WorkItem::new(job.job_id, "svc-1", 1)])
        .await
        .unwrap();

    let state = routes::worker::AppState {
        engine,
        repo: repo.clone(),
    };
    (routes::worker::routes(state), repo)
}

#[tokio::test]
async fn get_work_returns_the_claimed_item() {
    let (app, _repo) = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/service/work?serviceID=svc-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let view: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(view["workItem"]["serviceID"], "svc-1");
}

#[tokio::test]
async fn get_work_is_404_when_nothing_matches_the_requested_service() {
    let (app, _repo) = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/service/work?serviceID=svc-unknown")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn update_work_applies_a_successful_report() {
    let (app, repo) = test_app().await;

    let claim = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/service/work?serviceID=svc-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = claim.into_body().collect().await.unwrap().to_bytes();
    let view: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let id = view["workItem"]["id"].as_i64().unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/service/work/{id}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "status": "successful",
                        "results": ["s3://bucket/out.json"],
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let view: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(view["status"], "applied");

    let item = repo.get_work_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, tessera_core::WorkItemStatus::Successful);
}
