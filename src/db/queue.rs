//! Durable job queue. Entries survive worker crashes: a pull marks the row
//! picked rather than deleting it, and a watchdog returns rows whose
//! visibility window lapsed without an acknowledgement.

use std::time::Duration;

use sqlx::Row;
use sqlx::sqlite::SqlitePool;

use crate::domain::{QueueEntry, now_micros};
use crate::error::Result;

#[derive(Clone)]
pub struct QueueRepo {
    pool: SqlitePool,
}

impl QueueRepo {
    pub fn new(pool: SqlitePool) -> QueueRepo {
        QueueRepo { pool }
    }

    pub async fn push(
        &self,
        job_id: i64,
        priority: i32,
        attempt: i32,
        delay: Duration,
    ) -> Result<()> {
        let now = now_micros();
        let available_at = now + delay.as_micros() as i64;
        sqlx::query(
            r#"
INSERT INTO job_queue (job_id, priority, attempt, available_at, created_at)
    VALUES ($1, $2, $3, $4, $5);
            "#,
        )
        .bind(job_id)
        .bind(priority)
        .bind(attempt)
        .bind(available_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Claim the next visible entry: highest priority first, FIFO within a
    /// priority class. The claim makes the entry invisible to other workers
    /// until it is acknowledged, released, or its visibility expires.
    pub async fn pull(&self) -> Result<Option<QueueEntry>> {
        let now = now_micros();
        let row = sqlx::query(
            r#"
UPDATE job_queue
SET picked_at = $1
WHERE id IN (
    SELECT id FROM job_queue
    WHERE picked_at IS NULL AND available_at <= $1
    ORDER BY priority DESC, id ASC
    LIMIT 1
)
RETURNING id, job_id, attempt, priority;
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(QueueEntry {
                id: row.try_get("id")?,
                job_id: row.try_get("job_id")?,
                attempt: row.try_get("attempt")?,
                priority: row.try_get("priority")?,
            }),
            None => None,
        })
    }

    pub async fn ack(&self, entry_id: i64) -> Result<()> {
        sqlx::query(r#"DELETE FROM job_queue WHERE id = $1;"#)
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Return a claimed entry to the queue after a backoff delay, bumping its
    /// attempt number. Used for transient-failure retries; the entry was
    /// never acknowledged so the work unit remains durable.
    pub async fn release(&self, entry_id: i64, delay: Duration, attempt: i32) -> Result<()> {
        let available_at = now_micros() + delay.as_micros() as i64;
        sqlx::query(
            r#"
UPDATE job_queue SET picked_at = NULL, available_at = $1, attempt = $2 WHERE id = $3;
            "#,
        )
        .bind(available_at)
        .bind(attempt)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Make entries whose holder went quiet visible again.
    pub async fn requeue_expired(&self, visibility: Duration) -> Result<u64> {
        let cutoff = now_micros() - visibility.as_micros() as i64;
        let result = sqlx::query(
            r#"UPDATE job_queue SET picked_at = NULL WHERE picked_at IS NOT NULL AND picked_at < $1;"#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn len(&self) -> Result<i64> {
        let row = sqlx::query(r#"SELECT COUNT(*) as num FROM job_queue;"#)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("num")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue() -> QueueRepo {
        QueueRepo::new(crate::db::test_pool().await)
    }

    #[tokio::test]
    async fn pull_prefers_priority_then_fifo() {
        let q = queue().await;
        q.push(1, 5, 0, Duration::ZERO).await.unwrap();
        q.push(2, 10, 0, Duration::ZERO).await.unwrap();
        q.push(3, 5, 0, Duration::ZERO).await.unwrap();

        let first = q.pull().await.unwrap().unwrap();
        assert_eq!(first.job_id, 2);
        let second = q.pull().await.unwrap().unwrap();
        assert_eq!(second.job_id, 1);
        let third = q.pull().await.unwrap().unwrap();
        assert_eq!(third.job_id, 3);
        assert!(q.pull().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn priority_wins_regardless_of_enqueue_order() {
        let q = queue().await;
        q.push(10, 10, 0, Duration::ZERO).await.unwrap();
        q.push(20, 5, 0, Duration::ZERO).await.unwrap();
        assert_eq!(q.pull().await.unwrap().unwrap().job_id, 10);

        let q = queue().await;
        q.push(20, 5, 0, Duration::ZERO).await.unwrap();
        q.push(10, 10, 0, Duration::ZERO).await.unwrap();
        assert_eq!(q.pull().await.unwrap().unwrap().job_id, 10);
    }

    #[tokio::test]
    async fn claimed_entries_are_invisible_until_released() {
        let q = queue().await;
        q.push(7, 5, 0, Duration::ZERO).await.unwrap();
        let entry = q.pull().await.unwrap().unwrap();
        assert!(q.pull().await.unwrap().is_none());

        q.release(entry.id, Duration::ZERO, entry.attempt + 1)
            .await
            .unwrap();
        let again = q.pull().await.unwrap().unwrap();
        assert_eq!(again.job_id, 7);
        assert_eq!(again.attempt, entry.attempt + 1);

        q.ack(again.id).await.unwrap();
        assert_eq!(q.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delayed_entries_stay_hidden_until_due() {
        let q = queue().await;
        q.push(9, 5, 1, Duration::from_secs(3600)).await.unwrap();
        assert!(q.pull().await.unwrap().is_none());
        assert_eq!(q.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_visibility_returns_entries_to_the_queue() {
        let q = queue().await;
        q.push(4, 5, 0, Duration::ZERO).await.unwrap();
        let _entry = q.pull().await.unwrap().unwrap();

        // Nothing has expired under a generous visibility window.
        assert_eq!(q.requeue_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        // A zero window makes the claim stale as soon as the clock moves.
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(q.requeue_expired(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(q.pull().await.unwrap().unwrap().job_id, 4);
    }
}
