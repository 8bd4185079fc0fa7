//! Worker-process entry point: runs one job's pipeline (crawl → classify →
//! upload) against its own state-store connection.
//!
//! The worker never writes the `cancelled` state itself: on cancellation it
//! only makes forward progress toward a clean exit, and the supervisor
//! records the terminal state after reaping the process.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::classifier::{llm::LlmClient, Classifier};
use crate::config::Config;
use crate::crawler::{CrawlEngine, CrawlError};
use crate::fetcher::Fetcher;
use crate::models::{DiscoveredPdf, Job, JobKind, JobStatusKind};
use crate::scheduler::next_weekly_tick;
use crate::store::{StateStore, StoreError};
use crate::uploader::{pick_destination_name, NameDecision, SharePointUploader};

/// How often the worker polls the sticky cancel flag.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// In-flight classification cap per job.
const CLASSIFY_CONCURRENCY: usize = 8;
/// In-flight upload cap per job.
const UPLOAD_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Crawl(#[from] CrawlError),
    #[error("seed unreachable after both fetch tiers")]
    SeedUnreachable,
    #[error("no documents found and {0} pages failed to fetch")]
    NothingFound(u32),
    #[error("job was not in a runnable state")]
    NotRunnable,
}

/// Run the pipeline for one job. Exit code contract: `Ok` maps to exit 0,
/// `Err` to non-zero (the supervisor then records the failure).
pub async fn run(job_id: &str, config: Arc<Config>) -> Result<(), WorkerError> {
    let store = StateStore::connect(&config.state_store_url).await?;
    let job = store
        .get_job(job_id)
        .await?
        .ok_or_else(|| WorkerError::UnknownJob(job_id.to_string()))?;

    if job.status.is_terminal() {
        return Ok(());
    }
    if job.status != JobStatusKind::Pending {
        return Err(WorkerError::NotRunnable);
    }

    let cancel = CancellationToken::new();
    tokio::spawn(poll_cancel_flag(
        store.clone(),
        job.id.clone(),
        cancel.clone(),
    ));

    if !store
        .transition(&job.id, JobStatusKind::Pending, JobStatusKind::Crawling)
        .await?
    {
        // Lost the transition race; nothing to do here.
        return Ok(());
    }

    let fetcher = Arc::new(Fetcher::new(&config.user_agent));
    let result = pipeline(&store, &config, &job, fetcher.clone(), &cancel).await;
    fetcher.shutdown().await;
    result
}

async fn pipeline(
    store: &StateStore,
    config: &Config,
    job: &Job,
    fetcher: Arc<Fetcher>,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    // Phase 1: discovery. Bulk uploads had their rows inserted at job
    // creation, so only crawl jobs do any work here.
    let mut fatal_fetch_errors = 0;
    if job.kind == JobKind::Crawl {
        let engine = CrawlEngine::new(fetcher.clone(), store.clone());
        let summary = engine.crawl(job, cancel).await?;
        if summary.cancelled {
            return Ok(());
        }
        if summary.seed_unreachable {
            return Err(WorkerError::SeedUnreachable);
        }
        fatal_fetch_errors = summary.pages_errored;
    }
    if cancel.is_cancelled() {
        return Ok(());
    }

    let found = store
        .get_job(&job.id)
        .await?
        .map(|j| j.pdfs_found)
        .unwrap_or(0);

    if found == 0 {
        if fatal_fetch_errors > 0 {
            return Err(WorkerError::NothingFound(fatal_fetch_errors));
        }
        // Zero PDFs with no errors is a legitimate, empty completion.
        store
            .transition(&job.id, JobStatusKind::Crawling, JobStatusKind::Completed)
            .await?;
        register_recrawl(store, job).await?;
        return Ok(());
    }

    store
        .transition(&job.id, JobStatusKind::Crawling, JobStatusKind::Classifying)
        .await?;

    classify_phase(store, config, job, fetcher.clone(), cancel).await?;
    if cancel.is_cancelled() {
        return Ok(());
    }

    store
        .transition(&job.id, JobStatusKind::Classifying, JobStatusKind::Uploading)
        .await?;

    upload_phase(store, config, job, fetcher, cancel).await?;
    if cancel.is_cancelled() {
        return Ok(());
    }

    store
        .transition(&job.id, JobStatusKind::Uploading, JobStatusKind::Completed)
        .await?;
    register_recrawl(store, job).await?;
    tracing::info!(job_id = %job.id, "Pipeline complete");
    Ok(())
}

/// Classify every undecided PDF: download it, extract first-page text, ask
/// the model (heuristic on any failure), persist the decision and bump the
/// counter after each artifact.
async fn classify_phase(
    store: &StateStore,
    config: &Config,
    job: &Job,
    fetcher: Arc<Fetcher>,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let llm = config
        .llm_api_key
        .as_deref()
        .map(|key| LlmClient::new(&config.llm_api_base, key, &config.llm_model));
    let classifier = Arc::new(Classifier::new(llm));

    let pdfs = store.unclassified_pdfs(&job.id).await?;
    let semaphore = Arc::new(Semaphore::new(CLASSIFY_CONCURRENCY));
    let mut join_set: JoinSet<Result<(), StoreError>> = JoinSet::new();

    for pdf in pdfs {
        if cancel.is_cancelled() {
            break;
        }
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let store = store.clone();
        let fetcher = fetcher.clone();
        let classifier = classifier.clone();
        let token = cancel.clone();
        join_set.spawn(async move {
            let _permit = permit;
            if token.is_cancelled() {
                return Ok(());
            }

            let bytes = match fetcher.fetch_binary(&pdf.source_url, &token).await {
                Ok(outcome) => Some(outcome.bytes),
                Err(crate::fetcher::FetchError::Cancelled) => return Ok(()),
                Err(e) => {
                    tracing::warn!(url = %pdf.source_url, error = %e, "PDF download failed, classifying by filename");
                    store.set_pdf_error(&pdf.id, &e.to_string()).await?;
                    None
                }
            };

            let decision = classifier
                .classify(&pdf.filename, bytes.as_deref())
                .await;
            store
                .set_pdf_classification(
                    &pdf.id,
                    decision.document_type.as_str(),
                    decision.is_technical,
                    bytes.as_ref().map(|b| b.len() as i64),
                )
                .await?;
            store.incr_classified(&pdf.job_id).await?;
            tracing::debug!(
                url = %pdf.source_url,
                document_type = decision.document_type.as_str(),
                via_llm = decision.via_llm,
                "Classified"
            );
            Ok(())
        });
    }

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(job_id = %job.id, error = %e, "Classification write failed"),
            Err(e) => tracing::error!(job_id = %job.id, "Classification task panicked: {}", e),
        }
    }
    Ok(())
}

/// Upload every allow-listed PDF, deduplicating against what is already at
/// the destination by `(folder, filename, size)`.
async fn upload_phase(
    store: &StateStore,
    config: &Config,
    job: &Job,
    fetcher: Arc<Fetcher>,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let pdfs = store.uploadable_pdfs(&job.id).await?;
    if pdfs.is_empty() {
        return Ok(());
    }

    let uploader = Arc::new(SharePointUploader::new(config));
    let existing = match uploader.existing_artifacts(&job.sharepoint_folder).await {
        Ok(map) => map,
        Err(e) => {
            // Without a destination listing nothing can be transferred;
            // record the failure on each artifact and move on.
            tracing::error!(job_id = %job.id, error = %e, "Destination folder unavailable");
            for pdf in &pdfs {
                store
                    .set_pdf_error(&pdf.id, &format!("destination unavailable: {e}"))
                    .await?;
                store.incr_failed(&job.id).await?;
            }
            return Ok(());
        }
    };
    let existing = Arc::new(Mutex::new(existing));

    let semaphore = Arc::new(Semaphore::new(UPLOAD_CONCURRENCY));
    let mut join_set: JoinSet<Result<(), StoreError>> = JoinSet::new();

    for pdf in pdfs {
        if cancel.is_cancelled() {
            break;
        }
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let store = store.clone();
        let fetcher = fetcher.clone();
        let uploader = uploader.clone();
        let existing = existing.clone();
        let folder = job.sharepoint_folder.clone();
        let token = cancel.clone();
        join_set.spawn(async move {
            let _permit = permit;
            if token.is_cancelled() {
                return Ok(());
            }
            upload_one(&store, &fetcher, &uploader, &existing, &folder, pdf, &token).await
        });
    }

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(job_id = %job.id, error = %e, "Upload write failed"),
            Err(e) => tracing::error!(job_id = %job.id, "Upload task panicked: {}", e),
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn upload_one(
    store: &StateStore,
    fetcher: &Fetcher,
    uploader: &SharePointUploader,
    existing: &Mutex<std::collections::HashMap<String, i64>>,
    folder: &str,
    pdf: DiscoveredPdf,
    cancel: &CancellationToken,
) -> Result<(), StoreError> {
    let bytes = match fetcher.fetch_binary(&pdf.source_url, cancel).await {
        Ok(outcome) => outcome.bytes,
        Err(crate::fetcher::FetchError::Cancelled) => return Ok(()),
        Err(e) => {
            tracing::warn!(url = %pdf.source_url, error = %e, "PDF download failed");
            store.set_pdf_error(&pdf.id, &e.to_string()).await?;
            store.incr_failed(&pdf.job_id).await?;
            return Ok(());
        }
    };
    let size = bytes.len() as i64;

    // Decide (and reserve) the destination name under the lock so two
    // concurrent uploads cannot pick the same one.
    let decision = {
        let mut map = existing.lock().await;
        let decision = pick_destination_name(&map, &pdf.filename, size);
        if let NameDecision::Upload(name) = &decision {
            map.insert(name.clone(), size);
        }
        decision
    };

    match decision {
        NameDecision::Skip => {
            // Already present at the destination key; counts as uploaded.
            tracing::debug!(url = %pdf.source_url, "Duplicate artifact, skipping transfer");
            store.mark_pdf_uploaded(&pdf.id, &pdf.filename, size).await?;
            store.incr_uploaded(&pdf.job_id).await?;
        }
        NameDecision::Upload(name) => {
            match uploader.upload(folder, &name, &bytes, cancel).await {
                Ok(()) => {
                    store.mark_pdf_uploaded(&pdf.id, &name, size).await?;
                    store.incr_uploaded(&pdf.job_id).await?;
                    tracing::info!(url = %pdf.source_url, name = %name, "Uploaded");
                }
                Err(crate::uploader::UploadError::Cancelled) => {
                    existing.lock().await.remove(&name);
                }
                Err(e) => {
                    tracing::warn!(url = %pdf.source_url, error = %e, terminal = e.is_terminal(), "Upload failed");
                    existing.lock().await.remove(&name);
                    store.set_pdf_error(&pdf.id, &e.to_string()).await?;
                    store.incr_failed(&pdf.job_id).await?;
                }
            }
        }
    }
    Ok(())
}

/// Register the weekly recrawl schedule once the job completes, if asked.
async fn register_recrawl(store: &StateStore, job: &Job) -> Result<(), WorkerError> {
    if !job.weekly_recrawl || job.kind != JobKind::Crawl {
        return Ok(());
    }
    // One schedule per (domain, folder) pair is enough.
    let already = store
        .list_schedules()
        .await?
        .into_iter()
        .any(|s| s.domain == job.source && s.sharepoint_folder == job.sharepoint_folder);
    if already {
        return Ok(());
    }
    store
        .create_schedule(
            &job.manufacturer_name,
            &job.source,
            &job.product_lines,
            &job.sharepoint_folder,
            next_weekly_tick(Utc::now()),
        )
        .await?;
    Ok(())
}

/// Poll the sticky cancel flag every 2 s and trip the token when set.
async fn poll_cancel_flag(store: StateStore, job_id: String, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(CANCEL_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if cancel.is_cancelled() {
            return;
        }
        match store.cancel_requested(&job_id).await {
            Ok(true) => {
                tracing::info!(job_id = %job_id, "Cancellation observed");
                cancel.cancel();
                return;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Cancel poll failed"),
        }
    }
}
