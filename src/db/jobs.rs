use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use crate::domain::{Job, JobStats, JobStatus, JobType, now_micros};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct JobRepo {
    pool: SqlitePool,
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    let config: String = row.try_get("config")?;
    let input_file_ids: String = row.try_get("input_file_ids")?;
    let output_file_ids: String = row.try_get("output_file_ids")?;
    let result: Option<String> = row.try_get("result")?;

    Ok(Job {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        job_type: JobType::parse(&job_type)
            .ok_or_else(|| Error::transient(format!("unknown job type {job_type:?}")))?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| Error::transient(format!("unknown job status {status:?}")))?,
        config: serde_json::from_str(&config)?,
        input_file_ids: serde_json::from_str(&input_file_ids)?,
        output_file_ids: serde_json::from_str(&output_file_ids)?,
        error_message: row.try_get("error_message")?,
        progress: row.try_get("progress")?,
        result: match result {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        },
        retry_count: row.try_get("retry_count")?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

impl JobRepo {
    pub fn new(pool: SqlitePool) -> JobRepo {
        JobRepo { pool }
    }

    pub async fn create(
        &self,
        owner_id: i64,
        job_type: JobType,
        config: &serde_json::Value,
        input_file_ids: &[i64],
        priority: i32,
    ) -> Result<Job> {
        if !(1..=10).contains(&priority) {
            return Err(Error::validation(format!(
                "priority must be within [1, 10], got {priority}"
            )));
        }
        let now = now_micros();
        let row = sqlx::query(
            r#"
INSERT INTO jobs (owner_id, job_type, status, config, input_file_ids, output_file_ids,
                  priority, created_at, updated_at)
    VALUES ($1, $2, 'pending', $3, $4, '[]', $5, $6, $6)
    RETURNING *;
            "#,
        )
        .bind(owner_id)
        .bind(job_type.as_str())
        .bind(serde_json::to_string(config)?)
        .bind(serde_json::to_string(input_file_ids)?)
        .bind(priority)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        job_from_row(&row)
    }

    pub async fn get(&self, id: i64) -> Result<Job> {
        let row = sqlx::query(r#"SELECT * FROM jobs WHERE id = $1;"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("job {id} not found")))?;
        job_from_row(&row)
    }

    pub async fn list(
        &self,
        owner_id: i64,
        status: Option<JobStatus>,
        job_type: Option<JobType>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Job>> {
        // Filters are enum-derived literals, never user text.
        let mut sql = String::from("SELECT * FROM jobs WHERE owner_id = $1");
        if let Some(status) = status {
            sql.push_str(&format!(" AND status = '{}'", status.as_str()));
        }
        if let Some(job_type) = job_type {
            sql.push_str(&format!(" AND job_type = '{}'", job_type.as_str()));
        }
        sql.push_str(" ORDER BY id DESC LIMIT $2 OFFSET $3;");

        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Compare-and-swap one status transition. Returns false when the stored
    /// status no longer equals `from`, so a concurrent writer won the race.
    /// Terminal targets stamp `completed_at`; a pending target is a fresh
    /// attempt and resets progress and the error message.
    pub async fn try_transition(
        &self,
        id: i64,
        from: JobStatus,
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(Error::validation(format!(
                "illegal job transition {from} -> {to}"
            )));
        }
        let now = now_micros();
        let completed_at = to.is_terminal().then_some(now);
        let progress_override: Option<f64> = match to {
            JobStatus::Pending => Some(0.0),
            JobStatus::Completed => Some(100.0),
            _ => None,
        };
        let result = sqlx::query(
            r#"
UPDATE jobs
SET status = $1,
    error_message = CASE WHEN $1 = 'pending' THEN NULL ELSE COALESCE($2, error_message) END,
    progress = COALESCE($3, progress),
    completed_at = $4,
    updated_at = $5
WHERE id = $6 AND status = $7;
            "#,
        )
        .bind(to.as_str())
        .bind(error)
        .bind(progress_override)
        .bind(completed_at)
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Transition from whatever the current status is, verifying legality.
    pub async fn update_status(
        &self,
        id: i64,
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        for _ in 0..3 {
            let job = self.get(id).await?;
            if job.status == to {
                return Ok(());
            }
            if !job.status.can_transition_to(to) {
                return Err(Error::validation(format!(
                    "illegal job transition {} -> {to}",
                    job.status
                )));
            }
            if self.try_transition(id, job.status, to, error).await? {
                return Ok(());
            }
        }
        Err(Error::transient(format!(
            "job {id} status kept changing concurrently"
        )))
    }

    /// Progress only moves forward within an attempt; regressions and writes
    /// against a non-processing job are ignored.
    pub async fn update_progress(&self, id: i64, progress: f64) -> Result<()> {
        let clamped = progress.clamp(0.0, 100.0);
        sqlx::query(
            r#"
UPDATE jobs SET progress = $1, updated_at = $2
WHERE id = $3 AND status = 'processing' AND progress <= $1;
            "#,
        )
        .bind(clamped)
        .bind(now_micros())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_result(
        &self,
        id: i64,
        result: &serde_json::Value,
        output_file_ids: &[i64],
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE jobs SET result = $1, output_file_ids = $2, updated_at = $3 WHERE id = $4;"#,
        )
        .bind(serde_json::to_string(result)?)
        .bind(serde_json::to_string(output_file_ids)?)
        .bind(now_micros())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn increment_retry(&self, id: i64) -> Result<i32> {
        let row = sqlx::query(
            r#"UPDATE jobs SET retry_count = retry_count + 1, updated_at = $1
               WHERE id = $2 RETURNING retry_count;"#,
        )
        .bind(now_micros())
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("retry_count")?)
    }

    pub async fn statistics(&self, owner_id: i64) -> Result<JobStats> {
        let rows = sqlx::query(
            r#"SELECT status, COUNT(*) as num FROM jobs WHERE owner_id = $1 GROUP BY status;"#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let num: i64 = row.try_get("num")?;
            stats.total += num;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = num,
                Some(JobStatus::Processing) => stats.processing = num,
                Some(JobStatus::Completed) => stats.completed = num,
                Some(JobStatus::Failed) => stats.failed = num,
                Some(JobStatus::Cancelled) => stats.cancelled = num,
                None => {}
            }
        }
        Ok(stats)
    }

    pub async fn delete_older_than(&self, cutoff_micros: i64) -> Result<u64> {
        let result = sqlx::query(r#"DELETE FROM jobs WHERE created_at < $1;"#)
            .bind(cutoff_micros)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Whether any non-terminal job still references the asset as an input.
    /// Used by the retention sweep to keep in-flight inputs alive.
    pub async fn has_active_reference(&self, file_id: i64) -> Result<bool> {
        let row = sqlx::query(
            r#"
SELECT EXISTS(
    SELECT 1 FROM jobs, json_each(jobs.input_file_ids)
    WHERE jobs.status IN ('pending', 'processing') AND json_each.value = $1
) as found;
            "#,
        )
        .bind(file_id)
        .fetch_one(&self.pool)
        .await?;
        let found: i64 = row.try_get("found")?;
        Ok(found != 0)
    }
}
