use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Job ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Crawl,
    BulkUpload,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Crawl => "crawl",
            JobKind::BulkUpload => "bulk_upload",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "crawl" => Some(JobKind::Crawl),
            "bulk_upload" => Some(JobKind::BulkUpload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatusKind {
    Pending,
    Crawling,
    Classifying,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatusKind::Pending => "pending",
            JobStatusKind::Crawling => "crawling",
            JobStatusKind::Classifying => "classifying",
            JobStatusKind::Uploading => "uploading",
            JobStatusKind::Completed => "completed",
            JobStatusKind::Failed => "failed",
            JobStatusKind::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatusKind::Pending),
            "crawling" => Some(JobStatusKind::Crawling),
            "classifying" => Some(JobStatusKind::Classifying),
            "uploading" => Some(JobStatusKind::Uploading),
            "completed" => Some(JobStatusKind::Completed),
            "failed" => Some(JobStatusKind::Failed),
            "cancelled" => Some(JobStatusKind::Cancelled),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatusKind::Completed | JobStatusKind::Failed | JobStatusKind::Cancelled
        )
    }
}

/// One run of the pipeline over one source (a site URL or a parts-list file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub manufacturer_name: String,
    pub source: String,
    pub product_lines: Vec<String>,
    pub sharepoint_folder: String,
    pub weekly_recrawl: bool,
    pub status: JobStatusKind,
    pub pdfs_found: i64,
    pub pdfs_classified: i64,
    pub pdfs_uploaded: i64,
    pub pdfs_failed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<i64>,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fields needed to create a Job row; the store fills in id, status and
/// timestamps.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub manufacturer_name: String,
    pub source: String,
    pub product_lines: Vec<String>,
    pub sharepoint_folder: String,
    pub weekly_recrawl: bool,
}

// --- DiscoveredPdf ---

/// One row per PDF URL discovered in a Job. `(job_id, source_url)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPdf {
    pub id: String,
    pub job_id: String,
    pub source_url: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    pub is_technical: bool,
    pub sharepoint_uploaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// --- Schedule ---

/// A recurring job template, fired weekly at Sunday 00:00 UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub manufacturer_name: String,
    pub domain: String,
    pub product_lines: Vec<String>,
    pub sharepoint_folder: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
}

// --- API payloads ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCrawlJobRequest {
    pub manufacturer_name: String,
    pub domain: String,
    #[serde(default)]
    pub product_lines: Vec<String>,
    pub sharepoint_folder: String,
    #[serde(default)]
    pub weekly_recrawl: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkUploadParams {
    pub manufacturer_name: String,
    pub sharepoint_folder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkUploadResponse {
    pub job: Job,
    pub rows_accepted: usize,
    pub rows_rejected: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total_jobs: i64,
    pub active_jobs: i64,
    pub technical_pdfs: i64,
    pub uploaded_pdfs: i64,
}
