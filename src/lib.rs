pub mod config;
pub mod db;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod media;
pub mod ops;
pub mod store;
pub mod sweeper;

#[cfg(test)]
pub mod test_support;

use std::sync::Arc;

use crate::config::Config;
use crate::db::{FileRepo, JobRepo, QueueRepo};
use crate::dispatch::CancelRegistry;
use crate::error::Result;
use crate::media::command::FfmpegRunner;
use crate::media::encode::{EncodeSettings, detect_hwaccels, resolve_hwaccel};
use crate::media::probe::Prober;
use crate::store::cache::{CacheStore, ProbeCache, ResultCache};
use crate::store::object::ObjectStorage;

/// Shared service dependencies: repositories, stores, caches, and the media
/// toolchain. Constructed once at process start and handed to workers and
/// sweeps explicitly.
pub struct Services {
    pub config: Config,
    pub store: ObjectStorage,
    pub cache: CacheStore,
    pub probe_cache: ProbeCache,
    pub result_cache: ResultCache,
    pub files: FileRepo,
    pub jobs: JobRepo,
    pub queue: QueueRepo,
    pub prober: Prober,
    pub runner: FfmpegRunner,
    pub encode: EncodeSettings,
    pub cancellations: CancelRegistry,
}

impl Services {
    pub async fn init(config: Config) -> Result<Arc<Services>> {
        let pool = db::connect(&config.database_url).await?;
        db::create_tables(&pool).await?;

        let store = ObjectStorage::from_config(&config.store)?;
        let cache = CacheStore::connect(&config.redis_url).await?;
        tokio::fs::create_dir_all(&config.work_dir).await?;

        let available = detect_hwaccels(&config.ffmpeg_path).await;
        let hwaccel = resolve_hwaccel(config.hwaccel, &available);
        if let Some(hwaccel) = hwaccel {
            tracing::info!(?hwaccel, "hardware acceleration enabled");
        }
        let encode = config.encode_preset.settings().with_hwaccel(hwaccel);

        Ok(Arc::new(Services {
            store,
            probe_cache: ProbeCache::new(cache.clone()),
            result_cache: ResultCache::new(cache.clone()),
            cache,
            files: FileRepo::new(pool.clone()),
            jobs: JobRepo::new(pool.clone()),
            queue: QueueRepo::new(pool),
            prober: Prober::new(config.ffprobe_path.clone()),
            runner: FfmpegRunner::new(
                config.ffmpeg_path.clone(),
                config.task_soft_time_limit,
                config.task_time_limit,
            ),
            encode,
            cancellations: CancelRegistry::default(),
            config,
        }))
    }
}
