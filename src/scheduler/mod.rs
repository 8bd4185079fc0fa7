//! Weekly recrawl scheduler.
//!
//! Every enabled schedule fires at Sunday 00:00 UTC, cloning its template
//! into a fresh pending job. A missed boundary (service down at the tick)
//! fires on startup because `fire_due` runs before the first sleep. The
//! compare-and-set on `next_run` keeps a double tick from firing twice.

use chrono::{DateTime, Datelike, Days, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::jobs::JobSupervisor;
use crate::models::{Job, JobKind, NewJob};
use crate::store::{StateStore, StoreError};

/// Upper bound on one sleep so newly registered schedules are noticed.
const MAX_SLEEP: Duration = Duration::from_secs(60 * 60);

pub struct RecrawlScheduler {
    store: StateStore,
    supervisor: Arc<JobSupervisor>,
}

impl RecrawlScheduler {
    pub fn new(store: StateStore, supervisor: Arc<JobSupervisor>) -> Self {
        RecrawlScheduler { store, supervisor }
    }

    pub async fn run(self) {
        loop {
            match fire_due(&self.store, Utc::now()).await {
                Ok(jobs) => {
                    for job in jobs {
                        self.supervisor.submit(&job.id).await;
                    }
                }
                Err(e) => tracing::error!(error = %e, "Scheduler tick failed"),
            }

            let now = Utc::now();
            let next = next_weekly_tick(now);
            let until = (next - now).to_std().unwrap_or(Duration::from_secs(60));
            tokio::time::sleep(until.min(MAX_SLEEP)).await;
        }
    }
}

/// Fire every enabled schedule whose `next_run` has passed, returning the
/// jobs created. The CAS on `next_run` makes each boundary fire at most one
/// job even if two tick evaluations race.
pub async fn fire_due(store: &StateStore, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
    let mut created = Vec::new();
    for schedule in store.due_schedules(now).await? {
        let following = next_weekly_tick(now);
        if !store
            .advance_schedule(&schedule.id, schedule.next_run, now, following)
            .await?
        {
            continue;
        }
        let job = store
            .create_job(NewJob {
                kind: JobKind::Crawl,
                manufacturer_name: schedule.manufacturer_name.clone(),
                source: schedule.domain.clone(),
                product_lines: schedule.product_lines.clone(),
                sharepoint_folder: schedule.sharepoint_folder.clone(),
                // The schedule already exists; don't register another.
                weekly_recrawl: false,
            })
            .await?;
        tracing::info!(
            schedule_id = %schedule.id,
            job_id = %job.id,
            "Recrawl fired"
        );
        created.push(job);
    }
    Ok(created)
}

/// The first Sunday 00:00 UTC strictly after `after`.
pub fn next_weekly_tick(after: DateTime<Utc>) -> DateTime<Utc> {
    let date = after.date_naive();
    let days_ahead = (7 - date.weekday().num_days_from_sunday()) % 7;
    let candidate = date + Days::new(days_ahead as u64);
    let tick = candidate
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();
    if tick <= after {
        tick + ChronoDuration::days(7)
    } else {
        tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_tick_from_midweek() {
        // 2025-06-04 is a Wednesday.
        let after = Utc.with_ymd_and_hms(2025, 6, 4, 15, 30, 0).unwrap();
        let tick = next_weekly_tick(after);
        assert_eq!(tick, Utc.with_ymd_and_hms(2025, 6, 8, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_next_tick_from_saturday_night() {
        let after = Utc.with_ymd_and_hms(2025, 6, 7, 23, 59, 59).unwrap();
        let tick = next_weekly_tick(after);
        assert_eq!(tick, Utc.with_ymd_and_hms(2025, 6, 8, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_exact_boundary_rolls_a_week() {
        let sunday = Utc.with_ymd_and_hms(2025, 6, 8, 0, 0, 0).unwrap();
        let tick = next_weekly_tick(sunday);
        assert_eq!(tick, Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_sunday_morning_rolls_a_week() {
        let after = Utc.with_ymd_and_hms(2025, 6, 8, 0, 0, 1).unwrap();
        let tick = next_weekly_tick(after);
        assert_eq!(tick, Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap());
    }

    async fn test_store() -> (StateStore, tempfile::NamedTempFile) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", file.path().display());
        let store = StateStore::connect(&url).await.unwrap();
        (store, file)
    }

    #[tokio::test]
    async fn test_fire_due_creates_pending_job_once() {
        let (store, _file) = test_store().await;
        let past = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        store
            .create_schedule(
                "Acme",
                "https://acme.example.com",
                &["pumps".to_string()],
                "/Docs/Acme",
                past,
            )
            .await
            .unwrap();

        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 5, 0).unwrap();
        let jobs = fire_due(&store, now).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Crawl);
        assert_eq!(jobs[0].source, "https://acme.example.com");
        assert!(!jobs[0].weekly_recrawl);

        // Re-evaluating the same tick fires nothing: next_run advanced.
        let again = fire_due(&store, now).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_fire_due_skips_future_schedules() {
        let (store, _file) = test_store().await;
        let future = Utc.with_ymd_and_hms(2099, 1, 4, 0, 0, 0).unwrap();
        store
            .create_schedule("Acme", "https://acme.example.com", &[], "/Docs/Acme", future)
            .await
            .unwrap();

        let jobs = fire_due(&store, Utc::now()).await.unwrap();
        assert!(jobs.is_empty());
    }
}
