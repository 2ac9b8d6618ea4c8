//! Job lifecycle operations invoked by the API layer: submission,
//! observation, cancellation, and explicit retry.

use std::sync::Arc;
use std::time::Duration;

use crate::Services;
use crate::domain::{Job, JobStats, JobStatus, JobType};
use crate::error::{Error, Result};
use crate::jobs::config::JobConfig;

pub const DEFAULT_PRIORITY: i32 = 5;

#[derive(Clone)]
pub struct JobService {
    services: Arc<Services>,
}

impl JobService {
    pub fn new(services: Arc<Services>) -> JobService {
        JobService { services }
    }

    /// Validate the config, check the referenced assets, persist the job as
    /// PENDING, and enqueue it.
    pub async fn create_job(
        &self,
        owner_id: i64,
        job_type: JobType,
        config: serde_json::Value,
        priority: Option<i32>,
    ) -> Result<Job> {
        let parsed = JobConfig::from_value(job_type, &config)?;
        parsed.validate(true)?;

        let input_ids = parsed.input_file_ids();
        if input_ids.is_empty() {
            return Err(Error::validation("job references no input files"));
        }
        for id in &input_ids {
            let asset = self.services.files.get_active(*id).await?;
            if asset.owner_id != owner_id {
                return Err(Error::Authorization(format!(
                    "file {id} does not belong to the requesting user"
                )));
            }
        }

        let priority = priority.unwrap_or(DEFAULT_PRIORITY);
        let job = self
            .services
            .jobs
            .create(owner_id, job_type, &config, &input_ids, priority)
            .await?;
        self.services
            .queue
            .push(job.id, priority, 0, Duration::ZERO)
            .await?;
        tracing::info!(job_id = job.id, %job_type, priority, "job enqueued");
        Ok(job)
    }

    fn authorize(job: &Job, owner_id: i64, admin: bool) -> Result<()> {
        if !admin && job.owner_id != owner_id {
            return Err(Error::Authorization(format!(
                "job {} does not belong to the requesting user",
                job.id
            )));
        }
        Ok(())
    }

    pub async fn get_job(&self, id: i64, owner_id: i64, admin: bool) -> Result<Job> {
        let job = self.services.jobs.get(id).await?;
        Self::authorize(&job, owner_id, admin)?;
        Ok(job)
    }

    pub async fn list_jobs(
        &self,
        owner_id: i64,
        status: Option<JobStatus>,
        job_type: Option<JobType>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Job>> {
        self.services
            .jobs
            .list(owner_id, status, job_type, offset, limit.clamp(1, 100))
            .await
    }

    pub async fn statistics(&self, owner_id: i64) -> Result<JobStats> {
        self.services.jobs.statistics(owner_id).await
    }

    /// Cancel a pending or processing job. A pending job just flips state
    /// and its queue entry is discarded on dequeue; a processing job is
    /// additionally signalled so the worker stops the child process.
    pub async fn cancel_job(&self, id: i64, owner_id: i64, admin: bool) -> Result<Job> {
        // The status may flip PENDING -> PROCESSING under us; retry the CAS
        // against whatever we read until it lands or becomes illegal.
        for _ in 0..3 {
            let job = self.get_job(id, owner_id, admin).await?;
            if job.status.is_terminal() {
                return Err(Error::validation(format!(
                    "job {id} is {} and cannot be cancelled",
                    job.status
                )));
            }
            if self
                .services
                .jobs
                .try_transition(id, job.status, JobStatus::Cancelled, None)
                .await?
            {
                self.services.cancellations.cancel(id);
                tracing::info!(job_id = id, "job cancelled");
                return self.services.jobs.get(id).await;
            }
        }
        Err(Error::transient(format!(
            "job {id} status kept changing concurrently"
        )))
    }

    /// Explicit user retry of a FAILED job: back to PENDING with progress
    /// reset, and a fresh queue entry. `retry_count` is left as is; the
    /// transient-retry ceiling applies per failure streak.
    pub async fn retry_job(&self, id: i64, owner_id: i64, admin: bool) -> Result<Job> {
        let job = self.get_job(id, owner_id, admin).await?;
        if job.status != JobStatus::Failed {
            return Err(Error::validation(format!(
                "only failed jobs can be retried; job {id} is {}",
                job.status
            )));
        }
        if !self
            .services
            .jobs
            .try_transition(id, JobStatus::Failed, JobStatus::Pending, None)
            .await?
        {
            return Err(Error::transient(format!(
                "job {id} changed concurrently, retry again"
            )));
        }
        self.services
            .queue
            .push(id, job.priority, 0, Duration::ZERO)
            .await?;
        tracing::info!(job_id = id, "job re-enqueued by user retry");
        self.services.jobs.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use serde_json::json;

    async fn service() -> (tempfile::TempDir, Arc<Services>, JobService) {
        let (dir, services) = test_support::services().await;
        let svc = JobService::new(services.clone());
        (dir, services, svc)
    }

    #[tokio::test]
    async fn create_job_checks_config_and_assets() {
        let (_dir, services, svc) = service().await;
        let a = test_support::seed_asset(&services, 1, "a.mp4", b"a").await;
        let b = test_support::seed_asset(&services, 1, "b.mp4", b"b").await;

        let job = svc
            .create_job(1, JobType::Join, json!({"file_ids": [a.id, b.id]}), None)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.input_file_ids, vec![a.id, b.id]);
        assert_eq!(services.queue.len().await.unwrap(), 1);

        // Bad config shape.
        let err = svc
            .create_job(1, JobType::Join, json!({"file_ids": [a.id]}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // Input owned by someone else.
        let foreign = test_support::seed_asset(&services, 2, "x.mp4", b"x").await;
        let err = svc
            .create_job(1, JobType::Join, json!({"file_ids": [a.id, foreign.id]}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));

        // Soft-deleted input.
        services.files.soft_delete(b.id).await.unwrap();
        let err = svc
            .create_job(1, JobType::Join, json!({"file_ids": [a.id, b.id]}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn owners_see_only_their_jobs_unless_admin() {
        let (_dir, services, svc) = service().await;
        let a = test_support::seed_asset(&services, 1, "a.mp4", b"a").await;
        let b = test_support::seed_asset(&services, 1, "b.mp4", b"b").await;
        let job = svc
            .create_job(1, JobType::Join, json!({"file_ids": [a.id, b.id]}), None)
            .await
            .unwrap();

        assert!(svc.get_job(job.id, 1, false).await.is_ok());
        assert!(matches!(
            svc.get_job(job.id, 2, false).await.unwrap_err(),
            Error::Authorization(_)
        ));
        assert!(svc.get_job(job.id, 2, true).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_pending_and_reject_terminal() {
        let (_dir, services, svc) = service().await;
        let a = test_support::seed_asset(&services, 1, "a.mp4", b"a").await;
        let b = test_support::seed_asset(&services, 1, "b.mp4", b"b").await;
        let job = svc
            .create_job(1, JobType::Join, json!({"file_ids": [a.id, b.id]}), None)
            .await
            .unwrap();

        let cancelled = svc.cancel_job(job.id, 1, false).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        let err = svc.cancel_job(job.id, 1, false).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn cancel_processing_signals_the_worker_token() {
        let (_dir, services, svc) = service().await;
        let a = test_support::seed_asset(&services, 1, "a.mp4", b"a").await;
        let b = test_support::seed_asset(&services, 1, "b.mp4", b"b").await;
        let job = svc
            .create_job(1, JobType::Join, json!({"file_ids": [a.id, b.id]}), None)
            .await
            .unwrap();
        services
            .jobs
            .update_status(job.id, JobStatus::Processing, None)
            .await
            .unwrap();
        let token = services.cancellations.register(job.id);

        svc.cancel_job(job.id, 1, false).await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn retry_applies_only_to_failed_jobs() {
        let (_dir, services, svc) = service().await;
        let a = test_support::seed_asset(&services, 1, "a.mp4", b"a").await;
        let b = test_support::seed_asset(&services, 1, "b.mp4", b"b").await;
        let job = svc
            .create_job(1, JobType::Join, json!({"file_ids": [a.id, b.id]}), None)
            .await
            .unwrap();

        assert!(svc.retry_job(job.id, 1, false).await.is_err());

        services
            .jobs
            .update_status(job.id, JobStatus::Processing, None)
            .await
            .unwrap();
        services
            .jobs
            .update_status(job.id, JobStatus::Failed, Some("boom"))
            .await
            .unwrap();
        // One pending entry from creation, none after it was consumed.
        let first = services.queue.pull().await.unwrap().unwrap();
        services.queue.ack(first.id).await.unwrap();

        let retried = svc.retry_job(job.id, 1, false).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.progress, 0.0);
        assert!(retried.error_message.is_none());
        assert_eq!(services.queue.len().await.unwrap(), 1);
    }
}
