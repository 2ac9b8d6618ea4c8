use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use crate::domain::{Asset, MediaInfo, now_micros};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct FileRepo {
    pool: SqlitePool,
}

fn asset_from_row(row: &SqliteRow) -> Result<Asset> {
    let duration_seconds: Option<f64> = row.try_get("duration_seconds")?;
    let width: Option<i64> = row.try_get("width")?;
    let height: Option<i64> = row.try_get("height")?;
    let frame_rate: Option<f64> = row.try_get("frame_rate")?;
    let video_codec: Option<String> = row.try_get("video_codec")?;
    let audio_codec: Option<String> = row.try_get("audio_codec")?;
    let bit_rate: Option<i64> = row.try_get("bit_rate")?;

    let probed = duration_seconds.is_some()
        || width.is_some()
        || height.is_some()
        || video_codec.is_some()
        || audio_codec.is_some();
    let media_info = probed.then(|| MediaInfo {
        duration_seconds,
        width: width.map(|v| v as u32),
        height: height.map(|v| v as u32),
        frame_rate,
        video_codec,
        audio_codec,
        bit_rate,
    });

    Ok(Asset {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        filename: row.try_get("filename")?,
        object_name: row.try_get("object_name")?,
        size: row.try_get("size")?,
        media_type: row.try_get("media_type")?,
        media_info,
        is_deleted: row.try_get("is_deleted")?,
        created_at: row.try_get("created_at")?,
    })
}

impl FileRepo {
    pub fn new(pool: SqlitePool) -> FileRepo {
        FileRepo { pool }
    }

    pub async fn create(
        &self,
        owner_id: i64,
        filename: &str,
        object_name: &str,
        size: i64,
        media_type: &str,
    ) -> Result<Asset> {
        let now = now_micros();
        let row = sqlx::query(
            r#"
INSERT INTO files (owner_id, filename, object_name, size, media_type, created_at)
    VALUES ($1, $2, $3, $4, $5, $6)
    RETURNING *;
            "#,
        )
        .bind(owner_id)
        .bind(filename)
        .bind(object_name)
        .bind(size)
        .bind(media_type)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        asset_from_row(&row)
    }

    pub async fn get(&self, id: i64) -> Result<Asset> {
        let row = sqlx::query(r#"SELECT * FROM files WHERE id = $1;"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("file {id} not found")))?;
        asset_from_row(&row)
    }

    /// Fetch an asset that is still usable: exists and is not soft-deleted.
    pub async fn get_active(&self, id: i64) -> Result<Asset> {
        let asset = self.get(id).await?;
        if asset.is_deleted {
            return Err(Error::not_found(format!("file {id} is deleted")));
        }
        Ok(asset)
    }

    pub async fn list_by_owner(
        &self,
        owner_id: i64,
        include_deleted: bool,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Asset>> {
        let sql = if include_deleted {
            r#"SELECT * FROM files WHERE owner_id = $1 ORDER BY id DESC LIMIT $2 OFFSET $3;"#
        } else {
            r#"SELECT * FROM files WHERE owner_id = $1 AND is_deleted = false
               ORDER BY id DESC LIMIT $2 OFFSET $3;"#
        };
        let rows = sqlx::query(sql)
            .bind(owner_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(asset_from_row).collect()
    }

    pub async fn soft_delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query(r#"UPDATE files SET is_deleted = true WHERE id = $1;"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("file {id} not found")));
        }
        Ok(())
    }

    pub async fn set_media_info(&self, id: i64, info: &MediaInfo) -> Result<()> {
        sqlx::query(
            r#"
UPDATE files
SET duration_seconds = $1, width = $2, height = $3, frame_rate = $4,
    video_codec = $5, audio_codec = $6, bit_rate = $7
WHERE id = $8;
            "#,
        )
        .bind(info.duration_seconds)
        .bind(info.width.map(|v| v as i64))
        .bind(info.height.map(|v| v as i64))
        .bind(info.frame_rate)
        .bind(&info.video_codec)
        .bind(&info.audio_codec)
        .bind(info.bit_rate)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn storage_usage(&self, owner_id: i64) -> Result<i64> {
        let row = sqlx::query(
            r#"SELECT COALESCE(SUM(size), 0) as total FROM files
               WHERE owner_id = $1 AND is_deleted = false;"#,
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }

    /// Live assets created before the cutoff, oldest first. Retention sweep
    /// input.
    pub async fn older_than(&self, cutoff_micros: i64) -> Result<Vec<Asset>> {
        let rows = sqlx::query(
            r#"SELECT * FROM files WHERE created_at < $1 AND is_deleted = false
               ORDER BY created_at ASC;"#,
        )
        .bind(cutoff_micros)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(asset_from_row).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query(r#"SELECT COUNT(*) as num FROM files;"#)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("num")?)
    }
}
