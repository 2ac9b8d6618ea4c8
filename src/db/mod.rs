//! Database access. Hand-written SQL over a sqlx pool: the job and file
//! repositories plus the durable job queue.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::Result;

pub mod files;
pub mod jobs;
pub mod queue;

pub use files::FileRepo;
pub use jobs::JobRepo;
pub use queue::QueueRepo;

pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS files
(
    id               INTEGER not null primary key autoincrement,
    owner_id         BIGINT not null,
    filename         VARCHAR(512) not null,
    object_name      VARCHAR(512) not null,
    size             BIGINT not null,
    media_type       VARCHAR(128) not null,
    duration_seconds DOUBLE,
    width            INT,
    height           INT,
    frame_rate       DOUBLE,
    video_codec      VARCHAR(64),
    audio_codec      VARCHAR(64),
    bit_rate         BIGINT,
    is_deleted       BOOLEAN default false not null,
    created_at       BIGINT not null
);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS jobs
(
    id              INTEGER not null primary key autoincrement,
    owner_id        BIGINT not null,
    job_type        VARCHAR(32) not null,
    status          VARCHAR(16) not null,
    config          TEXT not null,
    input_file_ids  TEXT not null,
    output_file_ids TEXT not null,
    error_message   TEXT,
    progress        DOUBLE default 0 not null,
    result          TEXT,
    retry_count     INT default 0 not null,
    priority        INT default 5 not null,
    created_at      BIGINT not null,
    updated_at      BIGINT not null,
    completed_at    BIGINT
);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS job_queue
(
    id           INTEGER not null primary key autoincrement,
    job_id       BIGINT not null,
    priority     INT not null,
    attempt      INT default 0 not null,
    available_at BIGINT not null,
    picked_at    BIGINT,
    created_at   BIGINT not null
);
        "#,
    )
    .execute(pool)
    .await?;

    let indexes = [
        "CREATE UNIQUE INDEX IF NOT EXISTS files_object_name_idx on files (object_name);",
        "CREATE INDEX IF NOT EXISTS files_owner_idx on files (owner_id);",
        "CREATE INDEX IF NOT EXISTS files_created_idx on files (created_at);",
        "CREATE INDEX IF NOT EXISTS jobs_owner_idx on jobs (owner_id);",
        "CREATE INDEX IF NOT EXISTS jobs_status_idx on jobs (status);",
        "CREATE INDEX IF NOT EXISTS job_queue_pull_idx on job_queue (picked_at, available_at, priority);",
    ];
    for index in indexes {
        sqlx::query(index).execute(pool).await?;
    }
    Ok(())
}

/// Single-connection in-memory database for tests.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("open in-memory sqlite");
    create_tables(&pool).await.expect("create tables");
    pool
}
