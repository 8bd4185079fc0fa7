//! Crawler engine: BFS over a scored URL frontier scoped to one site,
//! surfacing PDF URLs into the state store as they are discovered.

pub mod extractor;
pub mod frontier;

pub use frontier::Frontier;

use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::fetcher::{FetchError, FetchOutcome, Fetcher};
use crate::models::Job;
use crate::store::{StateStore, StoreError};

/// Max pages visited per job.
pub const MAX_PAGES_PER_JOB: u32 = 2_000;
/// Max link depth from the seed.
pub const MAX_DEPTH: u32 = 6;
/// Max concurrent page fetches per job.
pub const MAX_CONCURRENT_FETCHES: usize = 4;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("seed URL is not crawlable: {0}")]
    SeedInvalid(String),
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

/// What one crawl pass produced. The authoritative counters live in the
/// store; these totals drive the job's failure semantics.
#[derive(Debug, Clone, Default)]
pub struct CrawlSummary {
    pub pages_visited: u32,
    pub pages_errored: u32,
    pub pdfs_found: u32,
    pub seed_unreachable: bool,
    pub cancelled: bool,
}

pub struct CrawlEngine {
    fetcher: Arc<Fetcher>,
    store: StateStore,
}

impl CrawlEngine {
    pub fn new(fetcher: Arc<Fetcher>, store: StateStore) -> Self {
        CrawlEngine { fetcher, store }
    }

    /// Crawl the job's seed site, inserting a DiscoveredPdf row (and bumping
    /// `pdfs_found`) for every new PDF URL. Individual page errors are
    /// logged and skipped; they never abort the crawl.
    pub async fn crawl(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<CrawlSummary, CrawlError> {
        let mut frontier = Frontier::new(&job.source, &job.product_lines, MAX_DEPTH)
            .ok_or_else(|| CrawlError::SeedInvalid(job.source.clone()))?;

        let mut summary = CrawlSummary::default();
        let mut join_set: JoinSet<(String, u32, Result<FetchOutcome, FetchError>)> =
            JoinSet::new();

        loop {
            // Fill worker slots from the frontier (in-flight pages count
            // toward the page budget).
            while join_set.len() < MAX_CONCURRENT_FETCHES {
                let attempted = summary.pages_visited + summary.pages_errored;
                if attempted + join_set.len() as u32 >= MAX_PAGES_PER_JOB {
                    break;
                }
                if let Some((url, depth)) = frontier.next() {
                    let fetcher = self.fetcher.clone();
                    let token = cancel.clone();
                    join_set.spawn(async move {
                        let result = fetcher.fetch(&url, &token).await;
                        (url, depth, result)
                    });
                } else {
                    break;
                }
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(job_id = %job.id, "Crawl cancelled");
                    join_set.abort_all();
                    summary.cancelled = true;
                    break;
                }
                Some(result) = join_set.join_next() => {
                    match result {
                        Ok((url, depth, Ok(outcome))) => {
                            summary.pages_visited += 1;
                            if outcome.is_html() {
                                self.ingest_page(job, &outcome, depth, &mut frontier, &mut summary, cancel)
                                    .await?;
                            } else {
                                tracing::debug!(url = %url, mime = %outcome.mime, "Skipping non-HTML page");
                            }
                        }
                        Ok((_, _, Err(FetchError::Cancelled))) => {
                            summary.cancelled = true;
                        }
                        Ok((url, depth, Err(e))) => {
                            tracing::warn!(job_id = %job.id, url = %url, error = %e, "Page fetch failed");
                            summary.pages_errored += 1;
                            if depth == 0 {
                                summary.seed_unreachable = true;
                            }
                        }
                        Err(e) => {
                            tracing::error!(job_id = %job.id, "Crawl task panicked: {}", e);
                            summary.pages_errored += 1;
                        }
                    }
                }
            }

            if summary.cancelled {
                join_set.abort_all();
                break;
            }
        }

        tracing::info!(
            job_id = %job.id,
            pages_visited = summary.pages_visited,
            pages_errored = summary.pages_errored,
            pdfs_found = summary.pdfs_found,
            "Crawl finished"
        );
        Ok(summary)
    }

    /// Extract links from one fetched page: PDFs become DiscoveredPdf rows,
    /// same-site pages feed the frontier.
    async fn ingest_page(
        &self,
        job: &Job,
        outcome: &FetchOutcome,
        depth: u32,
        frontier: &mut Frontier,
        summary: &mut CrawlSummary,
        cancel: &CancellationToken,
    ) -> Result<(), CrawlError> {
        let links = extractor::extract_links(&outcome.body_text(), &outcome.final_url);

        for pdf_url in &links.pdfs {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(());
            }
            let Some(normalized) = frontier::normalize_url(pdf_url) else {
                continue;
            };
            if !frontier.in_scope(&normalized) {
                continue;
            }
            let filename = extractor::filename_from_url(&normalized);
            if self
                .store
                .insert_pdf(&job.id, &normalized, &filename, None)
                .await?
            {
                self.store.incr_found(&job.id, 1).await?;
                summary.pdfs_found += 1;
                tracing::debug!(job_id = %job.id, url = %normalized, "Discovered PDF");
            }
        }

        frontier.add_discovered(&links.pages, depth + 1);
        Ok(())
    }
}
