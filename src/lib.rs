pub mod classifier;
pub mod config;
pub mod crawler;
pub mod fetcher;
pub mod jobs;
pub mod models;
pub mod partslist;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod uploader;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::jobs::JobSupervisor;
use crate::store::StateStore;

/// Shared application state passed to all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: StateStore,
    pub supervisor: Arc<JobSupervisor>,
}

pub fn build_app(state: AppState) -> Router {
    // CORS layer — permissive for the internal service
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/stats", get(server::routes::stats))
        .route("/api/active-jobs", get(server::routes::active_jobs))
        .route(
            "/api/crawl-jobs",
            get(server::routes::list_crawl_jobs).post(server::routes::create_crawl_job),
        )
        .route("/api/crawl-jobs/{id}", get(server::routes::get_crawl_job))
        .route(
            "/api/crawl-jobs/{id}/cancel",
            post(server::routes::cancel_crawl_job),
        )
        .route(
            "/api/crawl-jobs/{id}/pdfs",
            get(server::routes::crawl_job_pdfs),
        )
        .route("/api/bulk-upload", post(server::routes::create_bulk_upload))
        .route(
            "/api/bulk-upload-jobs",
            get(server::routes::list_bulk_upload_jobs),
        )
        .route(
            "/api/bulk-upload-jobs/{id}",
            get(server::routes::get_bulk_upload_job),
        )
        .route(
            "/api/bulk-upload-jobs/{id}/cancel",
            post(server::routes::cancel_bulk_upload_job),
        )
        .route(
            "/api/bulk-upload-jobs/{id}/pdfs",
            get(server::routes::bulk_upload_job_pdfs),
        )
        .route("/api/schedules", get(server::routes::list_schedules))
        .route(
            "/api/schedules/{id}",
            get(server::routes::get_schedule).delete(server::routes::delete_schedule),
        );

    api.layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
