//! Periodic maintenance: retention eviction, temp-namespace orphan cleanup,
//! and old-job pruning. Item-level failures are logged and skipped; a sweep
//! always runs to the end of its scan.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::Services;
use crate::domain::{MICROS_PER_SEC, now_micros};
use crate::error::Result;

const RETENTION_INTERVAL: Duration = Duration::from_secs(6 * 3600);
const TEMP_INTERVAL: Duration = Duration::from_secs(3600);
const TEMP_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
const LAST_RUN_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: u64,
    pub removed: u64,
}

#[derive(Clone)]
pub struct Sweeper {
    services: Arc<Services>,
}

impl Sweeper {
    pub fn new(services: Arc<Services>) -> Sweeper {
        Sweeper { services }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let retention = {
            let sweeper = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                sweeper
                    .interval_loop("retention", RETENTION_INTERVAL, shutdown, |s| async move {
                        s.run_retention().await
                    })
                    .await;
            })
        };
        let temp = {
            let sweeper = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                sweeper
                    .interval_loop("temp_orphans", TEMP_INTERVAL, shutdown, |s| async move {
                        s.run_temp_orphans().await
                    })
                    .await;
            })
        };
        let prune = tokio::spawn(async move {
            loop {
                let delay = until_next_daily_prune();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.run_job_prune().await {
                    Ok(stats) => {
                        tracing::info!(scanned = stats.scanned, removed = stats.removed, "job prune done")
                    }
                    Err(e) => tracing::warn!(error = %e, "job prune failed"),
                }
            }
        });
        vec![retention, temp, prune]
    }

    async fn interval_loop<F, Fut>(
        &self,
        name: &'static str,
        interval: Duration,
        shutdown: CancellationToken,
        run: F,
    ) where
        F: Fn(Sweeper) -> Fut,
        Fut: Future<Output = Result<SweepStats>>,
    {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match run(self.clone()).await {
                Ok(stats) => {
                    tracing::info!(sweep = name, scanned = stats.scanned, removed = stats.removed, "sweep done")
                }
                Err(e) => tracing::warn!(sweep = name, error = %e, "sweep failed"),
            }
        }
    }

    async fn mark_last_run(&self, task: &str) {
        let key = format!("maintenance:last_run:{task}");
        if let Err(e) = self
            .services
            .cache
            .set(&key, &now_micros(), LAST_RUN_TTL)
            .await
        {
            tracing::debug!(task, error = %e, "last-run mark not recorded");
        }
    }

    /// Evict assets past the retention window: physical bytes removed, row
    /// soft-deleted. Assets still referenced by non-terminal jobs survive;
    /// references from terminal jobs do not protect.
    pub async fn run_retention(&self) -> Result<SweepStats> {
        let cutoff =
            now_micros() - self.services.config.retention_days * 24 * 3600 * MICROS_PER_SEC;
        self.run_retention_at(cutoff).await
    }

    pub async fn run_retention_at(&self, cutoff_micros: i64) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let expired = self.services.files.older_than(cutoff_micros).await?;
        for asset in expired {
            stats.scanned += 1;
            match self.services.jobs.has_active_reference(asset.id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(file_id = asset.id, error = %e, "reference check failed, skipping");
                    continue;
                }
            }
            if let Err(e) = self.services.store.delete(&asset.object_name).await
                && !matches!(e, crate::error::Error::NotFound(_))
            {
                tracing::warn!(file_id = asset.id, error = %e, "object eviction failed");
                continue;
            }
            if let Err(e) = self.services.files.soft_delete(asset.id).await {
                tracing::warn!(file_id = asset.id, error = %e, "soft delete failed");
                continue;
            }
            let _ = self
                .services
                .probe_cache
                .invalidate(asset.id, &asset.object_name)
                .await;
            stats.removed += 1;
        }
        self.mark_last_run("retention").await;
        Ok(stats)
    }

    /// Remove worker intermediates and chunk leftovers that aged out of the
    /// temp namespace.
    pub async fn run_temp_orphans(&self) -> Result<SweepStats> {
        self.run_temp_orphans_older_than(TEMP_MAX_AGE).await
    }

    pub async fn run_temp_orphans_older_than(&self, max_age: Duration) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::hours(24));
        for item in self.services.store.list("temp").await? {
            stats.scanned += 1;
            if item.last_modified >= cutoff {
                continue;
            }
            match self.services.store.delete(&item.name).await {
                Ok(()) => stats.removed += 1,
                Err(e) => {
                    tracing::warn!(object = %item.name, error = %e, "orphan delete failed")
                }
            }
        }
        self.mark_last_run("temp_orphans").await;
        Ok(stats)
    }

    /// Drop job records older than the configured cutoff.
    pub async fn run_job_prune(&self) -> Result<SweepStats> {
        let cutoff =
            now_micros() - self.services.config.job_max_age_days * 24 * 3600 * MICROS_PER_SEC;
        self.run_job_prune_at(cutoff).await
    }

    pub async fn run_job_prune_at(&self, cutoff_micros: i64) -> Result<SweepStats> {
        let removed = self.services.jobs.delete_older_than(cutoff_micros).await?;
        self.mark_last_run("job_prune").await;
        Ok(SweepStats {
            scanned: removed,
            removed,
        })
    }
}

/// Delay until the next 02:00 local wall-clock time.
fn until_next_daily_prune() -> Duration {
    let now = chrono::Local::now().naive_local();
    let today = now.date().and_hms_opt(2, 0, 0).expect("02:00 is valid");
    let next = if now < today {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::from_secs(3600))
}
