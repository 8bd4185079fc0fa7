//! Job supervisor: owns every job's lifecycle, isolates per-job work in a
//! child OS process and propagates cancellation.
//!
//! The child runs this same binary with a `worker <job-id>` argv in its own
//! process group. Cancellation is cooperative first (the worker polls the
//! sticky flag) and coercive after the grace period (SIGTERM then SIGKILL to
//! the whole group, so a wedged headless browser cannot leak).

pub mod worker;

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::Instant;

use crate::config::Config;
use crate::models::JobStatusKind;
use crate::store::{StateStore, StoreError};

/// How often the supervisor checks the cancel flag of a running job.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Soft wall-clock budget per job; overruns convert to a cancellation.
const JOB_WALL_CLOCK: Duration = Duration::from_secs(6 * 60 * 60);
/// Lines of child output kept for the failure report.
const OUTPUT_RING_CAPACITY: usize = 200;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn worker: {0}")]
    Spawn(std::io::Error),
}

/// Supervises worker sub-processes. One per deployment.
pub struct JobSupervisor {
    tx: mpsc::Sender<String>,
}

impl JobSupervisor {
    /// Start the supervisor: sweep orphans left by a previous run, re-admit
    /// pending jobs, then begin dispatching from the admission queue.
    pub async fn start(
        store: StateStore,
        config: Arc<Config>,
    ) -> Result<Arc<Self>, SupervisorError> {
        let (tx, rx) = mpsc::channel::<String>(256);
        let supervisor = Arc::new(JobSupervisor { tx });

        let pending = sweep_orphans(&store).await?;
        for job_id in pending {
            supervisor.submit(&job_id).await;
        }

        tokio::spawn(Self::dispatch_loop(rx, store, config));
        Ok(supervisor)
    }

    /// Enqueue a job for execution (FIFO admission).
    pub async fn submit(&self, job_id: &str) {
        if let Err(e) = self.tx.send(job_id.to_string()).await {
            tracing::error!(job_id = %job_id, "Failed to enqueue job: {}", e);
        }
    }

    /// Take jobs off the admission queue, bounded by the global worker cap.
    async fn dispatch_loop(
        mut rx: mpsc::Receiver<String>,
        store: StateStore,
        config: Arc<Config>,
    ) {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));

        while let Some(job_id) = rx.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let store = store.clone();
            let config = config.clone();
            tokio::spawn(async move {
                if let Err(e) = run_job(&store, &config, &job_id).await {
                    tracing::error!(job_id = %job_id, error = %e, "Supervision failed");
                    let _ = store
                        .finish_job(&job_id, JobStatusKind::Failed, Some(&e.to_string()))
                        .await;
                }
                drop(permit);
            });
        }
    }
}

/// Supervise one job from spawn to reap.
async fn run_job(
    store: &StateStore,
    config: &Config,
    job_id: &str,
) -> Result<(), SupervisorError> {
    let Some(job) = store.get_job(job_id).await? else {
        tracing::warn!(job_id = %job_id, "Queued job no longer exists");
        return Ok(());
    };
    if job.status != JobStatusKind::Pending {
        tracing::debug!(job_id = %job_id, status = job.status.as_str(), "Skipping non-pending job");
        return Ok(());
    }
    // A cancel that raced admission never needs a worker.
    if job.cancel_requested {
        store
            .finish_job(job_id, JobStatusKind::Cancelled, None)
            .await?;
        return Ok(());
    }

    let exe = std::env::current_exe().map_err(SupervisorError::Spawn)?;
    let mut command = Command::new(exe);
    command
        .arg("worker")
        .arg(job_id)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(SupervisorError::Spawn)?;
    let pid = child.id();
    store.set_worker_pid(job_id, pid.map(|p| p as i64)).await?;
    tracing::info!(job_id = %job_id, pid = ?pid, "Worker spawned");

    let output_ring = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_RING_CAPACITY)));
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_output(stdout, output_ring.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_output(stderr, output_ring.clone()));
    }

    let deadline = Instant::now() + JOB_WALL_CLOCK;
    let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = poll.tick() => {
                let timed_out = Instant::now() >= deadline;
                if timed_out {
                    tracing::warn!(job_id = %job_id, "Job exceeded wall-clock budget, cancelling");
                    let _ = store.request_cancel(job_id).await;
                }
                if timed_out || store.cancel_requested(job_id).await.unwrap_or(false) {
                    let status = terminate(&mut child, pid, config.worker_grace_seconds).await;
                    break status;
                }
            }
        }
    };

    // Reap finished: reconcile the persisted state.
    let cancelled = store.cancel_requested(job_id).await.unwrap_or(false);
    match exit {
        Ok(status) if status.success() => {
            if cancelled {
                // The worker made a clean early exit; record the terminal
                // state now that it is reaped.
                store
                    .finish_job(job_id, JobStatusKind::Cancelled, None)
                    .await?;
                tracing::info!(job_id = %job_id, "Job cancelled");
            } else if store
                .finish_job(
                    job_id,
                    JobStatusKind::Failed,
                    Some("worker exited without finishing"),
                )
                .await?
            {
                // The worker persists its own completion; exiting 0 without
                // a terminal transition means it lost track of the pipeline.
                tracing::warn!(job_id = %job_id, "Worker exited cleanly mid-pipeline");
            }
        }
        Ok(status) => {
            if cancelled {
                store
                    .finish_job(job_id, JobStatusKind::Cancelled, None)
                    .await?;
                tracing::info!(job_id = %job_id, "Job cancelled");
            } else {
                let tail = drain_ring(&output_ring).await;
                let reason = format!(
                    "worker exited with {:?}\n{}",
                    status.code(),
                    tail
                );
                store
                    .finish_job(job_id, JobStatusKind::Failed, Some(&reason))
                    .await?;
                tracing::error!(job_id = %job_id, code = ?status.code(), "Worker failed");
            }
        }
        Err(e) => {
            store
                .finish_job(
                    job_id,
                    JobStatusKind::Failed,
                    Some(&format!("failed to reap worker: {e}")),
                )
                .await?;
        }
    }

    store.set_worker_pid(job_id, None).await?;
    Ok(())
}

/// SIGTERM the worker's process group, wait out the grace period, then
/// SIGKILL. Returns once the child is reaped.
async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace_seconds: u64,
) -> std::io::Result<std::process::ExitStatus> {
    signal_group(pid, Signal::Term);
    match tokio::time::timeout(Duration::from_secs(grace_seconds), child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(pid = ?pid, "Worker ignored SIGTERM, killing process group");
            signal_group(pid, Signal::Kill);
            let _ = child.kill().await;
            child.wait().await
        }
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negative pid addresses the process group the worker leads.
    unsafe {
        libc::kill(-(pid as i32), sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

/// Read child output line by line into a bounded ring buffer.
async fn pump_output<R>(reader: R, ring: Arc<Mutex<VecDeque<String>>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut ring = ring.lock().await;
        if ring.len() >= OUTPUT_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(line);
    }
}

async fn drain_ring(ring: &Arc<Mutex<VecDeque<String>>>) -> String {
    let ring = ring.lock().await;
    ring.iter().cloned().collect::<Vec<_>>().join("\n")
}

/// Move non-terminal jobs whose worker is gone to `failed`, and return the
/// ids of pending jobs that should be re-admitted. Everything needed to make
/// this call is in the store, which is why no in-memory state survives a
/// restart.
pub async fn sweep_orphans(store: &StateStore) -> Result<Vec<String>, StoreError> {
    let mut readmit = Vec::new();
    for job in store.active_jobs().await? {
        match (job.status, job.worker_pid) {
            (JobStatusKind::Pending, None) => readmit.push(job.id),
            (_, Some(pid)) if pid_alive(pid) => {
                // A live worker from a previous supervisor: it has no
                // monitor anymore, so treat it as lost and stop it.
                tracing::warn!(job_id = %job.id, pid = pid, "Stopping unsupervised worker");
                signal_group(Some(pid as u32), Signal::Term);
                store
                    .finish_job(&job.id, JobStatusKind::Failed, Some("worker lost"))
                    .await?;
            }
            _ => {
                tracing::warn!(job_id = %job.id, "Orphaned job, marking failed");
                store
                    .finish_job(&job.id, JobStatusKind::Failed, Some("worker lost"))
                    .await?;
            }
        }
    }
    Ok(readmit)
}

#[cfg(unix)]
fn pid_alive(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i64) -> bool {
    false
}
