//! Worker dispatch: pull queue entries, drive processors, apply the retry
//! policy, and honor cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::Services;
use crate::domain::{JobStatus, QueueEntry};
use crate::error::{Error, Result};
use crate::jobs::config::JobConfig;
use crate::ops::{ProcessContext, ProcessOutput, build_processor};
use crate::store::cache::CachedResult;

pub const MAX_RETRIES: i32 = 3;
const BACKOFF_BASE_SECS: f64 = 60.0;
const BACKOFF_CAP_SECS: f64 = 300.0;
/// Minimum spacing between progress writes to the repository.
const PROGRESS_THROTTLE: Duration = Duration::from_millis(500);
/// Backstop poll for cancellations issued from another process.
const CANCEL_POLL: Duration = Duration::from_secs(2);

/// Exponential backoff with jitter: base 60 s, doubled per retry, capped at
/// 300 s, then spread ±20%.
pub fn retry_backoff(retry_count: i32) -> Duration {
    let exp = BACKOFF_BASE_SECS * 2f64.powi(retry_count.max(0));
    let capped = exp.min(BACKOFF_CAP_SECS);
    let jitter = 1.0 + (rand::random::<f64>() * 0.4 - 0.2);
    Duration::from_secs_f64(capped * jitter)
}

/// Cancellation tokens for attempts running in this process. Cancellation
/// from another process is caught by the worker's status poll instead.
#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<i64, CancellationToken>>,
}

impl CancelRegistry {
    pub fn register(&self, job_id: i64) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner
            .lock()
            .expect("cancel registry poisoned")
            .insert(job_id, token.clone());
        token
    }

    pub fn remove(&self, job_id: i64) {
        self.inner
            .lock()
            .expect("cancel registry poisoned")
            .remove(&job_id);
    }

    /// Signal a running attempt. Returns whether a token was present.
    pub fn cancel(&self, job_id: i64) -> bool {
        match self
            .inner
            .lock()
            .expect("cancel registry poisoned")
            .get(&job_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Spawn the worker pool. Each worker runs an identical pull loop until the
/// shutdown token fires.
pub fn spawn_workers(
    services: Arc<Services>,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..services.config.worker_concurrency)
        .map(|index| {
            let services = services.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker_loop(index, services, shutdown).await;
            })
        })
        .collect()
}

/// Watchdog returning timed-out queue claims to visibility. One per process.
pub fn spawn_queue_watchdog(
    services: Arc<Services>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(60);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match services
                .queue
                .requeue_expired(services.config.queue_visibility_timeout)
                .await
            {
                Ok(0) => {}
                Ok(n) => tracing::warn!(requeued = n, "returned expired queue claims"),
                Err(e) => tracing::warn!(error = %e, "queue watchdog sweep failed"),
            }
        }
    })
}

async fn worker_loop(index: usize, services: Arc<Services>, shutdown: CancellationToken) {
    tracing::info!(worker = index, "worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let entry = match services.queue.pull().await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(services.config.queue_poll_interval) => {}
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(worker = index, error = %e, "queue pull failed");
                tokio::time::sleep(services.config.queue_poll_interval).await;
                continue;
            }
        };
        if let Err(e) = process_entry(&services, &entry).await {
            tracing::error!(worker = index, job_id = entry.job_id, error = %e, "job processing errored");
        }
    }
    tracing::info!(worker = index, "worker stopped");
}

/// A cached result only counts if its recorded output assets still resolve.
async fn cached_result_is_live(services: &Services, cached: &CachedResult) -> bool {
    if cached.output_file_ids.is_empty() {
        return false;
    }
    for id in &cached.output_file_ids {
        match services.files.get_active(*id).await {
            Ok(asset) => {
                if !services.store.exists(&asset.object_name).await.unwrap_or(false) {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    true
}

/// One dispatcher iteration for a claimed entry: claim the job, try the
/// result cache, run the processor, and settle the terminal state.
pub async fn process_entry(services: &Arc<Services>, entry: &QueueEntry) -> Result<()> {
    let job = match services.jobs.get(entry.job_id).await {
        Ok(job) => job,
        Err(Error::NotFound(_)) => {
            // Pruned or deleted since enqueue; nothing to do.
            services.queue.ack(entry.id).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if job.status.is_terminal() {
        services.queue.ack(entry.id).await?;
        return Ok(());
    }

    // Claim the job. Losing the race (another worker, or a concurrent
    // cancellation) just drops the entry.
    if !services
        .jobs
        .try_transition(job.id, JobStatus::Pending, JobStatus::Processing, None)
        .await?
    {
        services.queue.ack(entry.id).await?;
        return Ok(());
    }
    tracing::info!(job_id = job.id, attempt = entry.attempt, job_type = %job.job_type, "task_started");

    // Result-cache shortcut: identical (type, inputs, config) already
    // produced a valid artifact.
    if let Ok(Some(cached)) = services
        .result_cache
        .get(job.job_type, &job.input_file_ids, &job.config)
        .await
        && cached_result_is_live(services, &cached).await
    {
        services
            .jobs
            .update_result(job.id, &cached.result, &cached.output_file_ids)
            .await?;
        services
            .jobs
            .try_transition(job.id, JobStatus::Processing, JobStatus::Completed, None)
            .await?;
        services.queue.ack(entry.id).await?;
        tracing::info!(job_id = job.id, "task_completed from result cache");
        return Ok(());
    }

    let outcome = execute_attempt(services, &job, entry).await;

    match outcome {
        Ok(output) => {
            let cached = CachedResult {
                output_file_ids: output.output_file_ids.clone(),
                result: output.result.clone(),
            };
            if let Err(e) = services
                .result_cache
                .set(job.job_type, &job.input_file_ids, &job.config, &cached)
                .await
            {
                tracing::debug!(job_id = job.id, error = %e, "result cache write skipped");
            }
            services
                .jobs
                .update_result(job.id, &output.result, &output.output_file_ids)
                .await?;
            let completed = services
                .jobs
                .try_transition(job.id, JobStatus::Processing, JobStatus::Completed, None)
                .await?;
            if !completed {
                // A cancellation landed while the run was finishing; the job
                // is CANCELLED and must expose no output.
                rollback_outputs(services, &output).await;
                services
                    .jobs
                    .update_result(job.id, &serde_json::Value::Null, &[])
                    .await?;
            }
            services.queue.ack(entry.id).await?;
            tracing::info!(job_id = job.id, "task_completed");
            Ok(())
        }
        Err(err) => handle_failure(services, job.id, entry, err).await,
    }
}

/// Run validation and the processor inside a workdir, with the progress sink
/// and cancellation plumbing attached.
async fn execute_attempt(
    services: &Arc<Services>,
    job: &crate::domain::Job,
    entry: &QueueEntry,
) -> Result<ProcessOutput> {
    let config = JobConfig::from_value(job.job_type, &job.config)?;
    config.validate(true)?;
    let processor = build_processor(config);

    let workdir = services
        .config
        .work_dir
        .join(format!("job_{}_attempt_{}", job.id, entry.attempt));
    tokio::fs::create_dir_all(&workdir).await?;

    let cancel = services.cancellations.register(job.id);
    let (progress_tx, progress_rx) = watch::channel(0.0f64);
    let progress_task = spawn_progress_writer(services.clone(), job.id, progress_rx);
    let status_poll = spawn_cancel_poll(services.clone(), job.id, cancel.clone());

    let progress_fn: crate::ops::ProgressFn = Arc::new(move |p: f64| {
        progress_tx.send_if_modified(|current| {
            if p > *current {
                *current = p;
                true
            } else {
                false
            }
        });
    });

    let ctx = ProcessContext::new(
        services.clone(),
        job.id,
        job.owner_id,
        entry.attempt,
        workdir.clone(),
        cancel.clone(),
        progress_fn,
    );

    let hard_limit = services.config.task_time_limit;
    let attempt = async {
        processor.validate(&ctx).await?;
        processor.run(&ctx).await
    };
    let outcome = tokio::select! {
        result = attempt => result,
        _ = tokio::time::sleep(hard_limit) => {
            cancel.cancel();
            Err(Error::Timeout(hard_limit.as_secs()))
        }
    };

    processor.cleanup(&ctx).await;
    status_poll.abort();
    services.cancellations.remove(job.id);
    if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
        tracing::warn!(job_id = job.id, error = %e, "failed to remove workdir");
    }
    // Dropping the context drops the last progress sender, which ends the
    // writer after its final flush.
    drop(ctx);
    let _ = progress_task.await;

    // A run that "succeeded" under an already-fired cancellation must not
    // surface outputs; errors (timeout included) pass through untouched.
    match outcome {
        Ok(output) if cancel.is_cancelled() => {
            rollback_outputs(services, &output).await;
            Err(Error::Cancelled)
        }
        other => other,
    }
}

/// Throttled progress writer: at most one repository write per interval,
/// always converging on the latest value.
fn spawn_progress_writer(
    services: Arc<Services>,
    job_id: i64,
    mut rx: watch::Receiver<f64>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let percent = *rx.borrow_and_update();
            if let Err(e) = services.jobs.update_progress(job_id, percent).await {
                tracing::debug!(job_id, error = %e, "progress write failed");
            }
            tokio::time::sleep(PROGRESS_THROTTLE).await;
        }
    })
}

/// Cross-process cancellations only show up in the repository; poll for
/// them and fan into the local token.
fn spawn_cancel_poll(
    services: Arc<Services>,
    job_id: i64,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(CANCEL_POLL).await;
            match services.jobs.get(job_id).await {
                Ok(job) if job.status == JobStatus::Cancelled => {
                    cancel.cancel();
                    break;
                }
                Ok(job) if job.status.is_terminal() => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
}

/// Remove produced output objects and rows so a cancelled or superseded run
/// leaves nothing observable.
async fn rollback_outputs(services: &Arc<Services>, output: &ProcessOutput) {
    for id in &output.output_file_ids {
        if let Ok(asset) = services.files.get(*id).await {
            let _ = services.store.delete(&asset.object_name).await;
            let _ = services.files.soft_delete(*id).await;
        }
    }
}

/// Terminal-vs-retry policy: only transient errors retry, at most
/// MAX_RETRIES times, with exponential backoff.
pub async fn handle_failure(
    services: &Arc<Services>,
    job_id: i64,
    entry: &QueueEntry,
    err: Error,
) -> Result<()> {
    match err {
        Error::Cancelled => {
            // Cooperative stop; the status is usually CANCELLED already.
            if let Err(e) = services
                .jobs
                .update_status(job_id, JobStatus::Cancelled, None)
                .await
            {
                tracing::debug!(job_id, error = %e, "cancel status already settled");
            }
            services.queue.ack(entry.id).await?;
            tracing::info!(job_id, "task_cancelled");
            Ok(())
        }
        Error::Transient(_) => {
            let job = services.jobs.get(job_id).await?;
            if job.retry_count < MAX_RETRIES {
                let delay = retry_backoff(job.retry_count);
                let retries = services.jobs.increment_retry(job_id).await?;
                if !services
                    .jobs
                    .try_transition(job_id, JobStatus::Processing, JobStatus::Pending, None)
                    .await?
                {
                    // Cancelled in the meantime; drop the entry.
                    services.queue.ack(entry.id).await?;
                    return Ok(());
                }
                services
                    .queue
                    .release(entry.id, delay, entry.attempt + 1)
                    .await?;
                tracing::warn!(
                    job_id,
                    retries,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "transient failure, retrying"
                );
                Ok(())
            } else {
                finalize_failure(services, job_id, entry, &err).await
            }
        }
        err => finalize_failure(services, job_id, entry, &err).await,
    }
}

async fn finalize_failure(
    services: &Arc<Services>,
    job_id: i64,
    entry: &QueueEntry,
    err: &Error,
) -> Result<()> {
    let message = err.user_message();
    if let Err(e) = services
        .jobs
        .update_status(job_id, JobStatus::Failed, Some(&message))
        .await
    {
        // A concurrent cancellation wins; the failure is moot.
        tracing::debug!(job_id, error = %e, "failure status not applied");
    }
    services.queue.ack(entry.id).await?;
    tracing::info!(job_id, error = %message, "task_failed");
    Ok(())
}
