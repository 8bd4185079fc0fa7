use axum::http::StatusCode;
use axum_test::multipart::{MultipartForm, Part};
use axum_test::TestServer;
use serde_json::json;
use std::sync::Arc;

use docharvest::config::Config;
use docharvest::jobs::JobSupervisor;
use docharvest::models::JobStatusKind;
use docharvest::store::StateStore;
use docharvest::{build_app, AppState};

fn create_test_config() -> Config {
    Config {
        port: 8080,
        state_store_url: String::new(), // tests connect the store themselves
        llm_api_key: None,
        llm_api_base: "http://localhost:9090/v1".to_string(),
        llm_model: "test-model".to_string(),
        identity_tenant: "test-tenant".to_string(),
        identity_client_id: "test-client".to_string(),
        identity_client_secret: "test-secret".to_string(),
        sharepoint_host: "contoso.sharepoint.com".to_string(),
        sharepoint_site_path: "/sites/docs".to_string(),
        // 0 pauses admission, so jobs stay pending for the duration of a test.
        max_concurrent_jobs: 0,
        worker_grace_seconds: 1,
        user_agent: "TestBot/1.0".to_string(),
    }
}

async fn test_state() -> (AppState, tempfile::NamedTempFile) {
    let file = tempfile::NamedTempFile::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", file.path().display());
    let store = StateStore::connect(&url).await.unwrap();
    let config = Arc::new(create_test_config());
    let supervisor = JobSupervisor::start(store.clone(), config.clone())
        .await
        .unwrap();
    (
        AppState {
            config,
            store,
            supervisor,
        },
        file,
    )
}

fn crawl_job_body() -> serde_json::Value {
    json!({
        "manufacturer_name": "Acme",
        "domain": "https://acme.example.com",
        "product_lines": ["pumps"],
        "sharepoint_folder": "/Docs/Acme",
        "weekly_recrawl": false
    })
}

#[tokio::test]
async fn test_create_and_fetch_crawl_job() {
    let (state, _file) = test_state().await;
    let server = TestServer::new(build_app(state)).unwrap();

    let response = server.post("/api/crawl-jobs").json(&crawl_job_body()).await;
    response.assert_status(StatusCode::CREATED);
    let job = response.json::<serde_json::Value>();
    assert_eq!(job["status"], "pending");
    assert_eq!(job["kind"], "crawl");
    assert_eq!(job["manufacturer_name"], "Acme");
    assert_eq!(job["pdfs_found"], 0);
    let id = job["id"].as_str().unwrap();

    let detail = server.get(&format!("/api/crawl-jobs/{id}")).await;
    detail.assert_status_ok();
    assert_eq!(detail.json::<serde_json::Value>()["id"], id);

    let list = server.get("/api/crawl-jobs").await;
    list.assert_status_ok();
    assert_eq!(list.json::<serde_json::Value>().as_array().unwrap().len(), 1);

    let pdfs = server.get(&format!("/api/crawl-jobs/{id}/pdfs")).await;
    pdfs.assert_status_ok();
    assert!(pdfs.json::<serde_json::Value>().as_array().unwrap().is_empty());

    let active = server.get("/api/active-jobs").await;
    assert_eq!(
        active.json::<serde_json::Value>().as_array().unwrap().len(),
        1
    );

    let stats = server.get("/api/stats").await;
    let stats = stats.json::<serde_json::Value>();
    assert_eq!(stats["total_jobs"], 1);
    assert_eq!(stats["active_jobs"], 1);
    assert_eq!(stats["uploaded_pdfs"], 0);
}

#[tokio::test]
async fn test_validation_errors_use_detail_envelope() {
    let (state, _file) = test_state().await;
    let server = TestServer::new(build_app(state)).unwrap();

    let response = server
        .post("/api/crawl-jobs")
        .json(&json!({
            "manufacturer_name": "Acme",
            "domain": "not a url",
            "sharepoint_folder": "/Docs/Acme"
        }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert!(response.json::<serde_json::Value>()["detail"]
        .as_str()
        .unwrap()
        .contains("domain"));

    let response = server
        .post("/api/crawl-jobs")
        .json(&json!({
            "manufacturer_name": "",
            "domain": "https://acme.example.com",
            "sharepoint_folder": "/Docs/Acme"
        }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_job_is_404() {
    let (state, _file) = test_state().await;
    let server = TestServer::new(build_app(state)).unwrap();

    let response = server.get("/api/crawl-jobs/nope").await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert!(response.json::<serde_json::Value>()["detail"].is_string());
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let (state, _file) = test_state().await;
    let server = TestServer::new(build_app(state.clone())).unwrap();

    let job = server
        .post("/api/crawl-jobs")
        .json(&crawl_job_body())
        .await
        .json::<serde_json::Value>();
    let id = job["id"].as_str().unwrap();

    let response = server.post(&format!("/api/crawl-jobs/{id}/cancel")).await;
    response.assert_status_ok();

    let job = state.store.get_job(id).await.unwrap().unwrap();
    assert!(job.cancel_requested);
}

#[tokio::test]
async fn test_cancel_terminal_job_conflicts_without_mutation() {
    let (state, _file) = test_state().await;
    let server = TestServer::new(build_app(state.clone())).unwrap();

    let job = server
        .post("/api/crawl-jobs")
        .json(&crawl_job_body())
        .await
        .json::<serde_json::Value>();
    let id = job["id"].as_str().unwrap();

    state
        .store
        .finish_job(id, JobStatusKind::Completed, None)
        .await
        .unwrap();

    let response = server.post(&format!("/api/crawl-jobs/{id}/cancel")).await;
    response.assert_status(StatusCode::CONFLICT);

    let job = state.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatusKind::Completed);
    assert!(!job.cancel_requested);
}

#[tokio::test]
async fn test_job_kind_namespaces_are_separate() {
    let (state, _file) = test_state().await;
    let server = TestServer::new(build_app(state)).unwrap();

    let job = server
        .post("/api/crawl-jobs")
        .json(&crawl_job_body())
        .await
        .json::<serde_json::Value>();
    let id = job["id"].as_str().unwrap();

    // A crawl job is not visible through the bulk-upload endpoints.
    let response = server.get(&format!("/api/bulk-upload-jobs/{id}")).await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bulk_upload_creates_job_with_rows() {
    let (state, _file) = test_state().await;
    let server = TestServer::new(build_app(state)).unwrap();

    let csv = "part,url\n\
               AB-100,https://acme.example.com/docs/ab-100-datasheet.pdf\n\
               AB-200,https://acme.example.com/docs/ab-200-submittal.pdf\n\
               BAD-1,not-a-url\n";
    let form = MultipartForm::new().add_part(
        "file",
        Part::bytes(csv.as_bytes().to_vec()).file_name("parts.csv"),
    );

    let response = server
        .post("/api/bulk-upload")
        .add_query_param("manufacturer_name", "Acme")
        .add_query_param("sharepoint_folder", "/Docs/Acme")
        .multipart(form)
        .await;
    response.assert_status(StatusCode::CREATED);

    let body = response.json::<serde_json::Value>();
    assert_eq!(body["rows_accepted"], 2);
    assert_eq!(body["rows_rejected"], 1);
    assert_eq!(body["job"]["kind"], "bulk_upload");
    assert_eq!(body["job"]["pdfs_found"], 2);
    let id = body["job"]["id"].as_str().unwrap();

    let pdfs = server
        .get(&format!("/api/bulk-upload-jobs/{id}/pdfs"))
        .await
        .json::<serde_json::Value>();
    let pdfs = pdfs.as_array().unwrap();
    assert_eq!(pdfs.len(), 2);
    assert_eq!(pdfs[0]["part_number"], "AB-100");
    assert_eq!(pdfs[0]["filename"], "ab-100-datasheet.pdf");
}

#[tokio::test]
async fn test_bulk_upload_with_no_valid_rows_is_rejected() {
    let (state, _file) = test_state().await;
    let server = TestServer::new(build_app(state)).unwrap();

    let csv = "part,url\n,missing-part\nX,ftp://nope\n";
    let form = MultipartForm::new().add_part(
        "file",
        Part::bytes(csv.as_bytes().to_vec()).file_name("parts.csv"),
    );

    let response = server
        .post("/api/bulk-upload")
        .add_query_param("manufacturer_name", "Acme")
        .add_query_param("sharepoint_folder", "/Docs/Acme")
        .multipart(form)
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_schedule_listing_and_delete() {
    let (state, _file) = test_state().await;
    let server = TestServer::new(build_app(state.clone())).unwrap();

    let empty = server.get("/api/schedules").await;
    assert!(empty.json::<serde_json::Value>().as_array().unwrap().is_empty());

    let sched = state
        .store
        .create_schedule(
            "Acme",
            "https://acme.example.com",
            &[],
            "/Docs/Acme",
            chrono::Utc::now(),
        )
        .await
        .unwrap();

    let got = server.get(&format!("/api/schedules/{}", sched.id)).await;
    got.assert_status_ok();
    assert_eq!(got.json::<serde_json::Value>()["domain"], "https://acme.example.com");

    let deleted = server.delete(&format!("/api/schedules/{}", sched.id)).await;
    deleted.assert_status_ok();

    let missing = server.get(&format!("/api/schedules/{}", sched.id)).await;
    missing.assert_status(StatusCode::NOT_FOUND);

    let gone = server.delete(&format!("/api/schedules/{}", sched.id)).await;
    gone.assert_status(StatusCode::NOT_FOUND);
}
