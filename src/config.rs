use std::path::PathBuf;
use std::time::Duration;

use crate::media::encode::{HwAccelPreference, ScenarioPreset};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Which object-store backend to talk to.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        endpoint: Option<String>,
        region: String,
        access_key: String,
        secret_key: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub store: StoreBackend,
    /// Scratch space for per-job working directories.
    pub work_dir: PathBuf,
    pub worker_concurrency: usize,
    pub retention_days: i64,
    pub max_upload_size: i64,
    /// Hard per-job wall-clock limit.
    pub task_time_limit: Duration,
    /// Soft limit after which the tool is asked to stop gracefully.
    pub task_soft_time_limit: Duration,
    pub queue_poll_interval: Duration,
    /// Must exceed the hard task limit so an entry never becomes visible to a
    /// second worker while the first is still inside its time budget.
    pub queue_visibility_timeout: Duration,
    pub job_max_age_days: i64,
    pub encode_preset: ScenarioPreset,
    pub hwaccel: HwAccelPreference,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Config {
        let store = match env_or("STORE_BACKEND", "local").as_str() {
            "s3" => StoreBackend::S3 {
                bucket: env_or("S3_BUCKET", "mediaforge"),
                endpoint: std::env::var("S3_ENDPOINT").ok(),
                region: env_or("S3_REGION", "us-east-1"),
                access_key: env_or("S3_ACCESS_KEY", ""),
                secret_key: env_or("S3_SECRET_KEY", ""),
            },
            _ => StoreBackend::Local {
                root: PathBuf::from(env_or("STORE_PATH", "./data/store")),
            },
        };

        Config {
            database_url: env_or("DATABASE_URL", "sqlite://./data/mediaforge.db"),
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            store,
            work_dir: PathBuf::from(env_or("WORK_DIR", "./data/work")),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 4),
            retention_days: env_parse("RETENTION_DAYS", 30),
            max_upload_size: env_parse("MAX_UPLOAD_SIZE", 2 * 1024 * 1024 * 1024),
            task_time_limit: Duration::from_secs(env_parse("TASK_TIME_LIMIT", 3600)),
            task_soft_time_limit: Duration::from_secs(env_parse("TASK_SOFT_TIME_LIMIT", 3000)),
            queue_poll_interval: Duration::from_millis(env_parse("QUEUE_POLL_INTERVAL_MS", 500)),
            queue_visibility_timeout: Duration::from_secs(env_parse(
                "QUEUE_VISIBILITY_TIMEOUT",
                4200,
            )),
            job_max_age_days: env_parse("JOB_MAX_AGE_DAYS", 90),
            encode_preset: ScenarioPreset::parse(&env_or("ENCODE_PRESET", "balanced"))
                .unwrap_or(ScenarioPreset::Balanced),
            hwaccel: HwAccelPreference::parse(&env_or("HWACCEL", "auto")),
            ffmpeg_path: PathBuf::from(env_or("FFMPEG_PATH", "ffmpeg")),
            ffprobe_path: PathBuf::from(env_or("FFPROBE_PATH", "ffprobe")),
        }
    }
}
