//! File ingestion lifecycle: direct uploads, resumable chunked uploads
//! assembled from the temp namespace, byte-range downloads, and soft
//! deletion.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::Services;
use crate::domain::{Asset, UploadSession, now_micros};
use crate::error::{Error, Result};

pub const SESSION_TTL: Duration = Duration::from_secs(3600);
const SESSION_PREFIX: &str = "upload:session:";
const MAX_CHUNKS: u32 = 10_000;

fn session_key(upload_id: &str) -> String {
    format!("{SESSION_PREFIX}{upload_id}")
}

/// Inclusive byte range parsed from a `Range: bytes=S-[E]` header.
pub fn parse_range_header(header: &str, total: i64) -> Result<(u64, u64)> {
    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| Error::validation(format!("unsupported Range header {header:?}")))?;
    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| Error::validation(format!("unsupported Range header {header:?}")))?;
    let start: u64 = start
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("unsupported Range header {header:?}")))?;
    let end: u64 = match end.trim() {
        "" => total.saturating_sub(1) as u64,
        raw => raw
            .parse()
            .map_err(|_| Error::validation(format!("unsupported Range header {header:?}")))?,
    };
    if total <= 0 || start > end || start >= total as u64 {
        return Err(Error::validation(format!(
            "range {start}-{end} is not satisfiable for a {total} byte object"
        )));
    }
    Ok((start, end.min(total as u64 - 1)))
}

/// A satisfied range request: the slice plus the 206 response metadata.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    pub data: Bytes,
    pub start: u64,
    pub end: u64,
    pub total: i64,
}

impl RangeResponse {
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

#[derive(Clone)]
pub struct IngestService {
    services: Arc<Services>,
}

impl IngestService {
    pub fn new(services: Arc<Services>) -> IngestService {
        IngestService { services }
    }

    fn object_name(owner_id: i64, filename: &str) -> String {
        format!(
            "files/{owner_id}/{}_{filename}",
            uuid::Uuid::new_v4().simple()
        )
    }

    /// Single-shot upload: stream straight into the store and register the
    /// asset.
    pub async fn direct_upload(
        &self,
        owner_id: i64,
        filename: &str,
        reader: impl AsyncRead + Send + Unpin,
        size: i64,
        media_type: &str,
    ) -> Result<Asset> {
        if size <= 0 || size > self.services.config.max_upload_size {
            return Err(Error::validation(format!(
                "upload size {size} is outside the allowed range"
            )));
        }
        let object_name = Self::object_name(owner_id, filename);
        self.services
            .store
            .put_stream(&object_name, reader, size, media_type)
            .await?;
        self.services
            .files
            .create(owner_id, filename, &object_name, size, media_type)
            .await
    }

    async fn load_session(&self, upload_id: &str) -> Result<UploadSession> {
        self.services
            .cache
            .get::<UploadSession>(&session_key(upload_id))
            .await?
            .ok_or_else(|| Error::not_found(format!("upload session {upload_id} unknown or expired")))
    }

    async fn save_session(&self, session: &UploadSession) -> Result<()> {
        self.services
            .cache
            .set(&session_key(&session.id), session, SESSION_TTL)
            .await
    }

    pub async fn initiate(
        &self,
        owner_id: i64,
        filename: &str,
        total_size: i64,
        total_chunks: u32,
        media_type: &str,
    ) -> Result<UploadSession> {
        if filename.trim().is_empty() {
            return Err(Error::validation("filename must not be empty"));
        }
        if total_size <= 0 || total_size > self.services.config.max_upload_size {
            return Err(Error::validation(format!(
                "upload size {total_size} is outside the allowed range"
            )));
        }
        if total_chunks == 0 || total_chunks > MAX_CHUNKS {
            return Err(Error::validation(format!(
                "chunk count {total_chunks} is outside the allowed range"
            )));
        }
        let session = UploadSession {
            id: uuid::Uuid::new_v4().simple().to_string(),
            owner_id,
            filename: filename.to_string(),
            total_size,
            total_chunks,
            media_type: media_type.to_string(),
            received: Default::default(),
            created_at: now_micros(),
        };
        self.save_session(&session).await?;
        tracing::info!(upload_id = %session.id, total_chunks, total_size, "upload session initiated");
        Ok(session)
    }

    pub async fn put_chunk(
        &self,
        upload_id: &str,
        index: u32,
        data: Bytes,
    ) -> Result<UploadSession> {
        let mut session = self.load_session(upload_id).await?;
        if index >= session.total_chunks {
            return Err(Error::validation(format!(
                "chunk index {index} is out of range (total {})",
                session.total_chunks
            )));
        }
        let name = session.chunk_object_name(index);
        let size = data.len() as i64;
        self.services
            .store
            .put_stream(&name, &data[..], size, "application/octet-stream")
            .await?;
        session.received.insert(index);
        self.save_session(&session).await?;
        Ok(session)
    }

    /// Assemble the finalized parts, in index order, into one asset. All
    /// chunk objects and the session are removed on success.
    pub async fn complete(&self, upload_id: &str) -> Result<Asset> {
        let session = self.load_session(upload_id).await?;
        if !session.is_complete() {
            let missing: Vec<u32> = (0..session.total_chunks)
                .filter(|i| !session.received.contains(i))
                .collect();
            return Err(Error::validation(format!(
                "upload {upload_id} is incomplete; missing chunks {missing:?}"
            )));
        }

        let sources: Vec<String> = (0..session.total_chunks)
            .map(|i| session.chunk_object_name(i))
            .collect();
        let object_name = Self::object_name(session.owner_id, &session.filename);
        let assembled = self
            .services
            .store
            .compose(&object_name, &sources, &session.media_type)
            .await?;
        if assembled != session.total_size {
            let _ = self.services.store.delete(&object_name).await;
            return Err(Error::validation(format!(
                "assembled size {assembled} does not match the declared total {}",
                session.total_size
            )));
        }

        let asset = self
            .services
            .files
            .create(
                session.owner_id,
                &session.filename,
                &object_name,
                assembled,
                &session.media_type,
            )
            .await?;

        for source in &sources {
            if let Err(e) = self.services.store.delete(source).await {
                tracing::warn!(chunk = %source, error = %e, "leftover chunk not deleted");
            }
        }
        self.services.cache.delete(&session_key(upload_id)).await?;
        tracing::info!(upload_id, asset_id = asset.id, size = assembled, "upload assembled");
        Ok(asset)
    }

    /// Drop the session and every chunk object it recorded.
    pub async fn abort(&self, upload_id: &str) -> Result<()> {
        let session = self.load_session(upload_id).await?;
        for index in &session.received {
            let name = session.chunk_object_name(*index);
            if let Err(e) = self.services.store.delete(&name).await {
                tracing::warn!(chunk = %name, error = %e, "chunk not deleted on abort");
            }
        }
        self.services.cache.delete(&session_key(upload_id)).await?;
        tracing::info!(upload_id, "upload session aborted");
        Ok(())
    }

    fn authorize(asset: &Asset, owner_id: i64, admin: bool) -> Result<()> {
        if !admin && asset.owner_id != owner_id {
            return Err(Error::Authorization(format!(
                "file {} does not belong to the requesting user",
                asset.id
            )));
        }
        Ok(())
    }

    /// Soft-delete: the record stays, the probe cache entry dies, and the
    /// retention sweep evicts the bytes later.
    pub async fn soft_delete(&self, file_id: i64, owner_id: i64, admin: bool) -> Result<()> {
        let asset = self.services.files.get_active(file_id).await?;
        Self::authorize(&asset, owner_id, admin)?;
        self.services.files.soft_delete(file_id).await?;
        self.services
            .probe_cache
            .invalidate(file_id, &asset.object_name)
            .await?;
        Ok(())
    }

    pub async fn presigned_download(
        &self,
        file_id: i64,
        owner_id: i64,
        admin: bool,
        ttl: Duration,
    ) -> Result<String> {
        let asset = self.services.files.get_active(file_id).await?;
        Self::authorize(&asset, owner_id, admin)?;
        self.services.store.presigned_get(&asset.object_name, ttl).await
    }

    /// 206 Partial Content semantics for a `Range: bytes=S-[E]` header.
    pub async fn read_range(
        &self,
        file_id: i64,
        owner_id: i64,
        admin: bool,
        range_header: &str,
    ) -> Result<RangeResponse> {
        let asset = self.services.files.get_active(file_id).await?;
        Self::authorize(&asset, owner_id, admin)?;
        let (start, end) = parse_range_header(range_header, asset.size)?;
        let data = self
            .services
            .store
            .get_range(&asset.object_name, start, end)
            .await?;
        Ok(RangeResponse {
            data,
            start,
            end,
            total: asset.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    async fn ingest() -> (tempfile::TempDir, Arc<Services>, IngestService) {
        let (dir, services) = test_support::services().await;
        let svc = IngestService::new(services.clone());
        (dir, services, svc)
    }

    #[test]
    fn range_header_forms() {
        assert_eq!(parse_range_header("bytes=0-99", 1000).unwrap(), (0, 99));
        assert_eq!(parse_range_header("bytes=500-", 1000).unwrap(), (500, 999));
        // An end past the object is clamped.
        assert_eq!(parse_range_header("bytes=900-1999", 1000).unwrap(), (900, 999));
        assert!(parse_range_header("bytes=1000-1001", 1000).is_err());
        assert!(parse_range_header("bytes=5-2", 1000).is_err());
        assert!(parse_range_header("chunks=0-1", 1000).is_err());
        assert!(parse_range_header("bytes=a-b", 1000).is_err());
    }

    #[tokio::test]
    async fn chunked_upload_assembles_in_index_order() {
        let (_dir, services, svc) = ingest().await;
        let session = svc
            .initiate(1, "big.mp4", 10, 5, "video/mp4")
            .await
            .unwrap();

        // Chunks arrive out of order; assembly is still by index.
        for index in [3u32, 0, 4, 1, 2] {
            let payload = vec![b'0' + index as u8; 2];
            svc.put_chunk(&session.id, index, Bytes::from(payload))
                .await
                .unwrap();
        }

        let asset = svc.complete(&session.id).await.unwrap();
        assert_eq!(asset.size, 10);

        let data = services
            .store
            .get_range(&asset.object_name, 0, 9)
            .await
            .unwrap();
        assert_eq!(&data[..], b"0011223344");

        // Every chunk object and the session are gone.
        assert!(services.store.list("temp/chunks").await.unwrap().is_empty());
        assert!(matches!(
            svc.load_session(&session.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn complete_rejects_missing_chunks() {
        let (_dir, _services, svc) = ingest().await;
        let session = svc.initiate(1, "big.mp4", 6, 3, "video/mp4").await.unwrap();
        svc.put_chunk(&session.id, 0, Bytes::from_static(b"aa"))
            .await
            .unwrap();
        svc.put_chunk(&session.id, 2, Bytes::from_static(b"cc"))
            .await
            .unwrap();

        let err = svc.complete(&session.id).await.unwrap_err();
        assert!(err.to_string().contains("[1]"), "{err}");
        // The session survives a failed completion attempt.
        assert!(svc.load_session(&session.id).await.is_ok());
    }

    #[tokio::test]
    async fn size_mismatch_leaves_no_asset_behind() {
        let (_dir, services, svc) = ingest().await;
        let session = svc.initiate(1, "big.mp4", 100, 2, "video/mp4").await.unwrap();
        svc.put_chunk(&session.id, 0, Bytes::from_static(b"aa"))
            .await
            .unwrap();
        svc.put_chunk(&session.id, 1, Bytes::from_static(b"bb"))
            .await
            .unwrap();

        let err = svc.complete(&session.id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(services.files.count().await.unwrap(), 0);
        // Only the chunk objects remain; no assembled artifact is visible.
        assert!(services.store.list("files").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abort_removes_chunks_and_session() {
        let (_dir, services, svc) = ingest().await;
        let session = svc.initiate(1, "big.mp4", 4, 2, "video/mp4").await.unwrap();
        svc.put_chunk(&session.id, 0, Bytes::from_static(b"aa"))
            .await
            .unwrap();

        svc.abort(&session.id).await.unwrap();
        assert!(services.store.list("temp/chunks").await.unwrap().is_empty());
        assert!(svc.load_session(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn invalid_sessions_and_chunks_are_rejected() {
        let (_dir, services, svc) = ingest().await;
        let too_big = services.config.max_upload_size + 1;
        assert!(svc.initiate(1, "x.mp4", too_big, 2, "video/mp4").await.is_err());
        assert!(svc.initiate(1, "", 10, 2, "video/mp4").await.is_err());
        assert!(svc.initiate(1, "x.mp4", 10, 0, "video/mp4").await.is_err());

        let session = svc.initiate(1, "x.mp4", 10, 2, "video/mp4").await.unwrap();
        let err = svc
            .put_chunk(&session.id, 2, Bytes::from_static(b"zz"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(matches!(
            svc.put_chunk("nope", 0, Bytes::from_static(b"zz"))
                .await
                .unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn read_range_returns_the_exact_slice() {
        let (_dir, services, svc) = ingest().await;
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let asset = test_support::seed_asset(&services, 1, "clip.mp4", &payload).await;

        let response = svc
            .read_range(asset.id, 1, false, "bytes=100-299")
            .await
            .unwrap();
        assert_eq!(response.data.len(), 200);
        assert_eq!(&response.data[..], &payload[100..300]);
        assert_eq!(response.content_range(), "bytes 100-299/1000");

        assert!(matches!(
            svc.read_range(asset.id, 2, false, "bytes=0-10").await.unwrap_err(),
            Error::Authorization(_)
        ));
    }

    #[tokio::test]
    async fn soft_delete_invalidates_the_probe_cache() {
        let (_dir, services, svc) = ingest().await;
        let asset = test_support::seed_asset(&services, 1, "clip.mp4", b"data").await;
        let info = crate::domain::MediaInfo {
            duration_seconds: Some(3.0),
            ..Default::default()
        };
        services
            .probe_cache
            .set(asset.id, &asset.object_name, &info)
            .await
            .unwrap();

        svc.soft_delete(asset.id, 1, false).await.unwrap();
        assert!(services.files.get(asset.id).await.unwrap().is_deleted);
        assert_eq!(
            services
                .probe_cache
                .get(asset.id, &asset.object_name)
                .await
                .unwrap(),
            None
        );
        // Deleting twice is a NotFound, the asset is unusable now.
        assert!(svc.soft_delete(asset.id, 1, false).await.is_err());
    }

    #[tokio::test]
    async fn direct_upload_registers_the_asset() {
        let (_dir, services, svc) = ingest().await;
        let payload = b"streamed bytes".to_vec();
        let asset = svc
            .direct_upload(1, "clip.mp4", &payload[..], payload.len() as i64, "video/mp4")
            .await
            .unwrap();
        assert_eq!(asset.size, payload.len() as i64);
        assert!(services.store.exists(&asset.object_name).await.unwrap());
    }
}
