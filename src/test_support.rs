//! Shared fixtures for unit tests: a fully wired `Services` bundle backed by
//! in-memory sqlite, the in-memory cache, and a local temp-dir object store.

use std::sync::Arc;

use tempfile::TempDir;

use crate::Services;
use crate::config::{Config, StoreBackend};
use crate::db::{FileRepo, JobRepo, QueueRepo};
use crate::dispatch::CancelRegistry;
use crate::media::command::FfmpegRunner;
use crate::media::encode::ScenarioPreset;
use crate::media::probe::Prober;
use crate::store::cache::{CacheStore, ProbeCache, ResultCache};
use crate::store::object::ObjectStorage;

pub async fn services() -> (TempDir, Arc<Services>) {
    let dir = TempDir::new().expect("tempdir");
    let store_root = dir.path().join("store");
    let work_dir = dir.path().join("work");
    std::fs::create_dir_all(&store_root).unwrap();
    std::fs::create_dir_all(&work_dir).unwrap();

    let config = Config {
        database_url: "sqlite::memory:".to_string(),
        redis_url: String::new(),
        store: StoreBackend::Local {
            root: store_root.clone(),
        },
        work_dir,
        worker_concurrency: 1,
        retention_days: 30,
        max_upload_size: 64 * 1024 * 1024,
        task_time_limit: std::time::Duration::from_secs(3600),
        task_soft_time_limit: std::time::Duration::from_secs(3000),
        queue_poll_interval: std::time::Duration::from_millis(10),
        queue_visibility_timeout: std::time::Duration::from_secs(4200),
        job_max_age_days: 90,
        encode_preset: ScenarioPreset::Balanced,
        hwaccel: crate::media::encode::HwAccelPreference::None,
        ffmpeg_path: "ffmpeg".into(),
        ffprobe_path: "ffprobe".into(),
    };

    let pool = crate::db::test_pool().await;
    let cache = CacheStore::memory();
    let store = ObjectStorage::local(&store_root).unwrap();

    let services = Arc::new(Services {
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
        encode: config.encode_preset.settings(),
        cancellations: CancelRegistry::default(),
        config,
    });
    (dir, services)
}

/// Store an object and register the matching asset row.
pub async fn seed_asset(
    services: &Services,
    owner_id: i64,
    filename: &str,
    payload: &[u8],
) -> crate::domain::Asset {
    let object_name = format!("files/{owner_id}/{filename}");
    services
        .store
        .put_stream(&object_name, payload, payload.len() as i64, "video/mp4")
        .await
        .unwrap();
    services
        .files
        .create(
            owner_id,
            filename,
            &object_name,
            payload.len() as i64,
            "video/mp4",
        )
        .await
        .unwrap()
}
