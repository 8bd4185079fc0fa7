//! Durable state store backed by SQLite.
//!
//! Every persistent truth lives here: jobs, discovered PDFs and recrawl
//! schedules. Status transitions are guarded SQL updates so concurrent
//! writers (supervisor and worker own separate connections) cannot move a
//! job out of a terminal state or skip a step.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::models::{DiscoveredPdf, Job, JobKind, JobStatusKind, NewJob, Schedule, StatsResponse};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id                TEXT PRIMARY KEY,
    kind              TEXT NOT NULL,
    manufacturer_name TEXT NOT NULL,
    source            TEXT NOT NULL,
    product_lines     TEXT NOT NULL DEFAULT '[]',
    sharepoint_folder TEXT NOT NULL,
    weekly_recrawl    INTEGER NOT NULL DEFAULT 0,
    status            TEXT NOT NULL,
    pdfs_found        INTEGER NOT NULL DEFAULT 0,
    pdfs_classified   INTEGER NOT NULL DEFAULT 0,
    pdfs_uploaded     INTEGER NOT NULL DEFAULT 0,
    pdfs_failed       INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    finished_at       TEXT,
    worker_pid        INTEGER,
    cancel_requested  INTEGER NOT NULL DEFAULT 0,
    error             TEXT
);

CREATE TABLE IF NOT EXISTS discovered_pdfs (
    id                  TEXT PRIMARY KEY,
    job_id              TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    source_url          TEXT NOT NULL,
    filename            TEXT NOT NULL,
    file_size           INTEGER,
    document_type       TEXT,
    is_technical        INTEGER NOT NULL DEFAULT 0,
    sharepoint_uploaded INTEGER NOT NULL DEFAULT 0,
    part_number         TEXT,
    error               TEXT,
    UNIQUE(job_id, source_url)
);

CREATE TABLE IF NOT EXISTS schedules (
    id                TEXT PRIMARY KEY,
    manufacturer_name TEXT NOT NULL,
    domain            TEXT NOT NULL,
    product_lines     TEXT NOT NULL DEFAULT '[]',
    sharepoint_folder TEXT NOT NULL,
    enabled           INTEGER NOT NULL DEFAULT 1,
    last_run          TEXT,
    next_run          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_pdfs_job ON discovered_pdfs(job_id);
"#;

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (and create if necessary) the store at the given connection URL.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        let store = StateStore { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    // --- Jobs ---

    pub async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let product_lines =
            serde_json::to_string(&new.product_lines).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, kind, manufacturer_name, source, product_lines,
                sharepoint_folder, weekly_recrawl, status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(new.kind.as_str())
        .bind(&new.manufacturer_name)
        .bind(&new.source)
        .bind(&product_lines)
        .bind(&new.sharepoint_folder)
        .bind(new.weekly_recrawl)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        tracing::info!(job_id = %id, kind = new.kind.as_str(), "Created job");
        self.get_job(&id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id))
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    pub async fn list_jobs(&self, kind: Option<JobKind>) -> Result<Vec<Job>, StoreError> {
        let rows = match kind {
            Some(k) => {
                sqlx::query("SELECT * FROM jobs WHERE kind = ? ORDER BY created_at DESC")
                    .bind(k.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_job).collect()
    }

    /// Jobs in a non-terminal state, oldest first.
    pub async fn active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM jobs WHERE status NOT IN {TERMINAL_STATUSES} ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    pub async fn stats(&self) -> Result<StatsResponse, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT
                (SELECT COUNT(*) FROM jobs) AS total_jobs,
                (SELECT COUNT(*) FROM jobs WHERE status NOT IN {TERMINAL_STATUSES}) AS active_jobs,
                (SELECT COUNT(*) FROM discovered_pdfs WHERE is_technical = 1) AS technical_pdfs,
                (SELECT COUNT(*) FROM discovered_pdfs WHERE sharepoint_uploaded = 1) AS uploaded_pdfs
            "#
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(StatsResponse {
            total_jobs: row.get("total_jobs"),
            active_jobs: row.get("active_jobs"),
            technical_pdfs: row.get("technical_pdfs"),
            uploaded_pdfs: row.get("uploaded_pdfs"),
        })
    }

    /// Guarded status transition. Returns `false` when the job was not in
    /// `from` (someone else moved it first); the transition is persisted
    /// before the caller performs any side effects.
    pub async fn transition(
        &self,
        job_id: &str,
        from: JobStatusKind,
        to: JobStatusKind,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = if to.is_terminal() {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = ?, updated_at = ?, finished_at = ?, worker_pid = NULL
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(to.as_str())
            .bind(&now)
            .bind(&now)
            .bind(job_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(to.as_str())
                .bind(&now)
                .bind(job_id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected() == 1)
    }

    /// Force a job from any non-terminal state into a terminal one, recording
    /// an optional error. Used by the supervisor for crash, cancel and orphan
    /// handling. Returns `false` when the job was already terminal.
    pub async fn finish_job(
        &self,
        job_id: &str,
        to: JobStatusKind,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = ?, updated_at = ?, finished_at = ?, worker_pid = NULL,
                error = COALESCE(?, error)
            WHERE id = ? AND status NOT IN {TERMINAL_STATUSES}
            "#
        ))
        .bind(to.as_str())
        .bind(&now)
        .bind(&now)
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_worker_pid(&self, job_id: &str, pid: Option<i64>) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET worker_pid = ?, updated_at = ? WHERE id = ?")
            .bind(pid)
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Set the sticky cancellation flag. Returns `false` when the job is
    /// already terminal.
    pub async fn request_cancel(&self, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE jobs SET cancel_requested = 1, updated_at = ? \
             WHERE id = ? AND status NOT IN {TERMINAL_STATUSES}"
        ))
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn cancel_requested(&self, job_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT cancel_requested FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.get::<i64, _>("cancel_requested") != 0)
            .unwrap_or(false))
    }

    async fn increment(&self, job_id: &str, column: &str, by: i64) -> Result<(), StoreError> {
        // Counters only move while the job is live; they freeze at terminal.
        sqlx::query(&format!(
            "UPDATE jobs SET {column} = {column} + ?, updated_at = ? \
             WHERE id = ? AND status NOT IN {TERMINAL_STATUSES}"
        ))
        .bind(by)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn incr_found(&self, job_id: &str, by: i64) -> Result<(), StoreError> {
        self.increment(job_id, "pdfs_found", by).await
    }

    pub async fn incr_classified(&self, job_id: &str) -> Result<(), StoreError> {
        self.increment(job_id, "pdfs_classified", 1).await
    }

    pub async fn incr_uploaded(&self, job_id: &str) -> Result<(), StoreError> {
        self.increment(job_id, "pdfs_uploaded", 1).await
    }

    pub async fn incr_failed(&self, job_id: &str) -> Result<(), StoreError> {
        self.increment(job_id, "pdfs_failed", 1).await
    }

    // --- Discovered PDFs ---

    /// Insert a discovered PDF. Returns `false` when `(job_id, source_url)`
    /// already exists.
    pub async fn insert_pdf(
        &self,
        job_id: &str,
        source_url: &str,
        filename: &str,
        part_number: Option<&str>,
    ) -> Result<bool, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO discovered_pdfs (id, job_id, source_url, filename, part_number)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(job_id)
        .bind(source_url)
        .bind(filename)
        .bind(part_number)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn pdfs_for_job(&self, job_id: &str) -> Result<Vec<DiscoveredPdf>, StoreError> {
        let rows = sqlx::query("SELECT * FROM discovered_pdfs WHERE job_id = ? ORDER BY rowid")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_pdf).collect())
    }

    pub async fn unclassified_pdfs(&self, job_id: &str) -> Result<Vec<DiscoveredPdf>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM discovered_pdfs \
             WHERE job_id = ? AND document_type IS NULL ORDER BY rowid",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_pdf).collect())
    }

    pub async fn uploadable_pdfs(&self, job_id: &str) -> Result<Vec<DiscoveredPdf>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM discovered_pdfs \
             WHERE job_id = ? AND is_technical = 1 AND sharepoint_uploaded = 0 ORDER BY rowid",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_pdf).collect())
    }

    pub async fn set_pdf_classification(
        &self,
        pdf_id: &str,
        document_type: &str,
        is_technical: bool,
        file_size: Option<i64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE discovered_pdfs \
             SET document_type = ?, is_technical = ?, file_size = COALESCE(?, file_size) \
             WHERE id = ?",
        )
        .bind(document_type)
        .bind(is_technical)
        .bind(file_size)
        .bind(pdf_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_pdf_uploaded(
        &self,
        pdf_id: &str,
        filename: &str,
        file_size: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE discovered_pdfs \
             SET sharepoint_uploaded = 1, filename = ?, file_size = ?, error = NULL \
             WHERE id = ?",
        )
        .bind(filename)
        .bind(file_size)
        .bind(pdf_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_pdf_error(&self, pdf_id: &str, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE discovered_pdfs SET error = ? WHERE id = ?")
            .bind(error)
            .bind(pdf_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Schedules ---

    pub async fn create_schedule(
        &self,
        manufacturer_name: &str,
        domain: &str,
        product_lines: &[String],
        sharepoint_folder: &str,
        next_run: DateTime<Utc>,
    ) -> Result<Schedule, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let product_lines =
            serde_json::to_string(product_lines).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            r#"
            INSERT INTO schedules (id, manufacturer_name, domain, product_lines,
                                   sharepoint_folder, enabled, next_run)
            VALUES (?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(&id)
        .bind(manufacturer_name)
        .bind(domain)
        .bind(&product_lines)
        .bind(sharepoint_folder)
        .bind(next_run.to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::info!(schedule_id = %id, domain = %domain, "Registered weekly recrawl");
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        row_to_schedule(&row)
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY next_run ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_schedule(&r)).transpose()
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Enabled schedules whose `next_run` has passed.
    pub async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query("SELECT * FROM schedules WHERE enabled = 1 AND next_run <= ?")
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    /// Compare-and-set advance of a schedule. Only one caller can win for a
    /// given `expected_next_run`, which is what prevents double firing.
    pub async fn advance_schedule(
        &self,
        id: &str,
        expected_next_run: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE schedules SET last_run = ?, next_run = ? \
             WHERE id = ? AND enabled = 1 AND next_run = ?",
        )
        .bind(fired_at.to_rfc3339())
        .bind(next_run.to_rfc3339())
        .bind(id)
        .bind(expected_next_run.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

// --- Row mapping helpers ---

fn row_to_job(row: &SqliteRow) -> Result<Job, StoreError> {
    let kind_raw: String = row.get("kind");
    let status_raw: String = row.get("status");
    let kind = JobKind::parse(&kind_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown job kind {kind_raw:?}")))?;
    let status = JobStatusKind::parse(&status_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown job status {status_raw:?}")))?;
    let product_lines: Vec<String> =
        serde_json::from_str(row.get::<&str, _>("product_lines")).unwrap_or_default();

    Ok(Job {
        id: row.get("id"),
        kind,
        manufacturer_name: row.get("manufacturer_name"),
        source: row.get("source"),
        product_lines,
        sharepoint_folder: row.get("sharepoint_folder"),
        weekly_recrawl: row.get::<i64, _>("weekly_recrawl") != 0,
        status,
        pdfs_found: row.get("pdfs_found"),
        pdfs_classified: row.get("pdfs_classified"),
        pdfs_uploaded: row.get("pdfs_uploaded"),
        pdfs_failed: row.get("pdfs_failed"),
        created_at: parse_datetime(row.get("created_at")),
        updated_at: parse_datetime(row.get("updated_at")),
        finished_at: row.get::<Option<&str>, _>("finished_at").map(parse_datetime),
        worker_pid: row.get("worker_pid"),
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        error: row.get("error"),
    })
}

fn row_to_pdf(row: &SqliteRow) -> DiscoveredPdf {
    DiscoveredPdf {
        id: row.get("id"),
        job_id: row.get("job_id"),
        source_url: row.get("source_url"),
        filename: row.get("filename"),
        file_size: row.get("file_size"),
        document_type: row.get("document_type"),
        is_technical: row.get::<i64, _>("is_technical") != 0,
        sharepoint_uploaded: row.get::<i64, _>("sharepoint_uploaded") != 0,
        part_number: row.get("part_number"),
        error: row.get("error"),
    }
}

fn row_to_schedule(row: &SqliteRow) -> Result<Schedule, StoreError> {
    let product_lines: Vec<String> =
        serde_json::from_str(row.get::<&str, _>("product_lines")).unwrap_or_default();
    Ok(Schedule {
        id: row.get("id"),
        manufacturer_name: row.get("manufacturer_name"),
        domain: row.get("domain"),
        product_lines,
        sharepoint_folder: row.get("sharepoint_folder"),
        enabled: row.get::<i64, _>("enabled") != 0,
        last_run: row.get::<Option<&str>, _>("last_run").map(parse_datetime),
        next_run: parse_datetime(row.get("next_run")),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn test_store() -> (StateStore, tempfile::NamedTempFile) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", file.path().display());
        let store = StateStore::connect(&url).await.unwrap();
        (store, file)
    }

    fn crawl_job() -> NewJob {
        NewJob {
            kind: JobKind::Crawl,
            manufacturer_name: "Acme".to_string(),
            source: "https://acme.example.com".to_string(),
            product_lines: vec!["pumps".to_string()],
            sharepoint_folder: "/Docs/Acme".to_string(),
            weekly_recrawl: false,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_job() {
        let (store, _file) = test_store().await;
        let job = store.create_job(crawl_job()).await.unwrap();
        assert_eq!(job.status, JobStatusKind::Pending);
        assert_eq!(job.pdfs_found, 0);
        assert!(job.finished_at.is_none());

        let fetched = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.manufacturer_name, "Acme");
        assert_eq!(fetched.product_lines, vec!["pumps".to_string()]);
    }

    #[tokio::test]
    async fn test_guarded_transition() {
        let (store, _file) = test_store().await;
        let job = store.create_job(crawl_job()).await.unwrap();

        assert!(store
            .transition(&job.id, JobStatusKind::Pending, JobStatusKind::Crawling)
            .await
            .unwrap());
        // Repeating the same transition fails: the job is no longer pending.
        assert!(!store
            .transition(&job.id, JobStatusKind::Pending, JobStatusKind::Crawling)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_terminal_transition_sets_bookkeeping() {
        let (store, _file) = test_store().await;
        let job = store.create_job(crawl_job()).await.unwrap();
        store.set_worker_pid(&job.id, Some(4242)).await.unwrap();
        store
            .transition(&job.id, JobStatusKind::Pending, JobStatusKind::Crawling)
            .await
            .unwrap();
        store
            .transition(&job.id, JobStatusKind::Crawling, JobStatusKind::Completed)
            .await
            .unwrap();

        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatusKind::Completed);
        assert!(job.finished_at.is_some());
        assert!(job.worker_pid.is_none());
    }

    #[tokio::test]
    async fn test_finish_job_is_idempotent() {
        let (store, _file) = test_store().await;
        let job = store.create_job(crawl_job()).await.unwrap();
        assert!(store
            .finish_job(&job.id, JobStatusKind::Failed, Some("worker lost"))
            .await
            .unwrap());
        // Already terminal: no-op.
        assert!(!store
            .finish_job(&job.id, JobStatusKind::Cancelled, None)
            .await
            .unwrap());
        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatusKind::Failed);
        assert_eq!(job.error.as_deref(), Some("worker lost"));
    }

    #[tokio::test]
    async fn test_cancel_flag_sticky_until_terminal() {
        let (store, _file) = test_store().await;
        let job = store.create_job(crawl_job()).await.unwrap();
        assert!(store.request_cancel(&job.id).await.unwrap());
        assert!(store.cancel_requested(&job.id).await.unwrap());

        store
            .finish_job(&job.id, JobStatusKind::Cancelled, None)
            .await
            .unwrap();
        // Cancelling a terminal job does not mutate it.
        assert!(!store.request_cancel(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_pdf_uniqueness_per_job() {
        let (store, _file) = test_store().await;
        let job = store.create_job(crawl_job()).await.unwrap();
        let url = "https://acme.example.com/specs/pump.pdf";
        assert!(store.insert_pdf(&job.id, url, "pump.pdf", None).await.unwrap());
        assert!(!store.insert_pdf(&job.id, url, "pump.pdf", None).await.unwrap());

        // A different job may discover the same URL.
        let other = store.create_job(crawl_job()).await.unwrap();
        assert!(store.insert_pdf(&other.id, url, "pump.pdf", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_counters_freeze_after_terminal() {
        let (store, _file) = test_store().await;
        let job = store.create_job(crawl_job()).await.unwrap();
        store.incr_found(&job.id, 3).await.unwrap();
        store
            .finish_job(&job.id, JobStatusKind::Cancelled, None)
            .await
            .unwrap();
        store.incr_found(&job.id, 1).await.unwrap();
        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.pdfs_found, 3);
    }

    #[tokio::test]
    async fn test_classification_and_upload_flow() {
        let (store, _file) = test_store().await;
        let job = store.create_job(crawl_job()).await.unwrap();
        store
            .insert_pdf(&job.id, "https://a.example.com/x.pdf", "x.pdf", None)
            .await
            .unwrap();

        let pdfs = store.unclassified_pdfs(&job.id).await.unwrap();
        assert_eq!(pdfs.len(), 1);

        store
            .set_pdf_classification(&pdfs[0].id, "Product Data Sheet", true, Some(1024))
            .await
            .unwrap();
        assert!(store.unclassified_pdfs(&job.id).await.unwrap().is_empty());

        let uploadable = store.uploadable_pdfs(&job.id).await.unwrap();
        assert_eq!(uploadable.len(), 1);

        store
            .mark_pdf_uploaded(&uploadable[0].id, "x.pdf", 1024)
            .await
            .unwrap();
        assert!(store.uploadable_pdfs(&job.id).await.unwrap().is_empty());

        let all = store.pdfs_for_job(&job.id).await.unwrap();
        assert!(all[0].sharepoint_uploaded);
        assert_eq!(all[0].file_size, Some(1024));
    }

    #[tokio::test]
    async fn test_schedule_cas_fires_once() {
        let (store, _file) = test_store().await;
        let next = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let sched = store
            .create_schedule("Acme", "https://acme.example.com", &[], "/Docs/Acme", next)
            .await
            .unwrap();

        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 5).unwrap();
        let following = Utc.with_ymd_and_hms(2025, 6, 8, 0, 0, 0).unwrap();
        assert!(store
            .advance_schedule(&sched.id, next, now, following)
            .await
            .unwrap());
        // Second tick for the same expected next_run loses the CAS.
        assert!(!store
            .advance_schedule(&sched.id, next, now, following)
            .await
            .unwrap());

        let sched = store.get_schedule(&sched.id).await.unwrap().unwrap();
        assert_eq!(sched.next_run, following);
        assert_eq!(sched.last_run, Some(now));
    }

    #[tokio::test]
    async fn test_due_schedules() {
        let (store, _file) = test_store().await;
        let past = Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap();
        let future = Utc.with_ymd_and_hms(2099, 1, 3, 0, 0, 0).unwrap();
        store
            .create_schedule("A", "https://a.example.com", &[], "/Docs/A", past)
            .await
            .unwrap();
        store
            .create_schedule("B", "https://b.example.com", &[], "/Docs/B", future)
            .await
            .unwrap();

        let due = store.due_schedules(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].manufacturer_name, "A");
    }
}
