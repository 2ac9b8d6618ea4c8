//! Object store adapter. Streamed puts and gets over a pluggable
//! `object_store` backend (local filesystem or S3); byte-range reads,
//! presigned GET urls, and prefix listing for the maintenance sweeps.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, GetRange, ObjectStore, PutMultipartOpts,
    WriteMultipart,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

use crate::config::StoreBackend;
use crate::error::{Error, Result};

const STREAM_BUF_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ObjectStat {
    pub size: i64,
    pub last_modified: DateTime<Utc>,
    pub media_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ObjectItem {
    pub name: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
}

/// Handle to the configured object store. Cheap to clone.
#[derive(Clone)]
pub struct ObjectStorage {
    inner: Arc<dyn ObjectStore>,
    signer: Option<Arc<AmazonS3>>,
}

impl ObjectStorage {
    pub fn from_config(backend: &StoreBackend) -> Result<ObjectStorage> {
        match backend {
            StoreBackend::Local { root } => {
                std::fs::create_dir_all(root)?;
                Ok(ObjectStorage::local(root)?)
            }
            StoreBackend::S3 {
                bucket,
                endpoint,
                region,
                access_key,
                secret_key,
            } => {
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(region)
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key);
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                let s3 = builder
                    .build()
                    .map_err(|e| Error::transient(format!("s3 init: {e}")))?;
                let s3 = Arc::new(s3);
                Ok(ObjectStorage {
                    inner: s3.clone(),
                    signer: Some(s3),
                })
            }
        }
    }

    pub fn local(root: &std::path::Path) -> Result<ObjectStorage> {
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| Error::transient(format!("local store init: {e}")))?;
        Ok(ObjectStorage {
            inner: Arc::new(store),
            signer: None,
        })
    }

    /// Stream `reader` into the object under `name`. Uploads run multipart so
    /// memory stays bounded regardless of object size. If the reader yields a
    /// different byte count than `size`, the upload is aborted and nothing
    /// becomes visible under `name`.
    pub async fn put_stream(
        &self,
        name: &str,
        mut reader: impl AsyncRead + Send + Unpin,
        size: i64,
        media_type: &str,
    ) -> Result<()> {
        let path = ObjectPath::from(name);
        let attributes = Attributes::from_iter([(
            Attribute::ContentType,
            AttributeValue::from(media_type.to_string()),
        )]);
        let upload = self
            .inner
            .put_multipart_opts(
                &path,
                PutMultipartOpts {
                    attributes,
                    ..Default::default()
                },
            )
            .await?;
        let mut writer = WriteMultipart::new(upload);

        let mut written: i64 = 0;
        let mut buf = vec![0u8; STREAM_BUF_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
            };
            writer.write(&buf[..n]);
            written += n as i64;
        }

        if written != size {
            let _ = writer.abort().await;
            return Err(Error::validation(format!(
                "upload for {name} declared {size} bytes but produced {written}"
            )));
        }
        writer.finish().await?;
        Ok(())
    }

    pub async fn put_file(&self, name: &str, local: &std::path::Path, media_type: &str) -> Result<i64> {
        let meta = tokio::fs::metadata(local).await?;
        let size = meta.len() as i64;
        let file = tokio::fs::File::open(local).await?;
        self.put_stream(name, file, size, media_type).await?;
        Ok(size)
    }

    /// Streaming read of the whole object.
    pub async fn get_stream(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let path = ObjectPath::from(name);
        let result = self.inner.get(&path).await?;
        let stream = result
            .into_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        Ok(Box::new(StreamReader::new(stream)))
    }

    /// Streaming read of an inclusive byte range.
    pub async fn get_stream_range(
        &self,
        name: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let path = ObjectPath::from(name);
        let options = GetOptions {
            range: Some(GetRange::Bounded(start..end_inclusive + 1)),
            ..Default::default()
        };
        let result = self.inner.get_opts(&path, options).await?;
        let stream = result
            .into_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        Ok(Box::new(StreamReader::new(stream)))
    }

    pub async fn get_range(&self, name: &str, start: u64, end_inclusive: u64) -> Result<Bytes> {
        let path = ObjectPath::from(name);
        Ok(self.inner.get_range(&path, start..end_inclusive + 1).await?)
    }

    pub async fn get_to_file(&self, name: &str, dest: &std::path::Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut reader = self.get_stream(name).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let copied = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(copied)
    }

    /// Concatenate existing objects, in order, into one new object. Streams
    /// through a bounded buffer; returns the assembled byte count. On any
    /// failure the destination never becomes visible.
    pub async fn compose(&self, dest: &str, sources: &[String], media_type: &str) -> Result<i64> {
        let path = ObjectPath::from(dest);
        let attributes = Attributes::from_iter([(
            Attribute::ContentType,
            AttributeValue::from(media_type.to_string()),
        )]);
        let upload = self
            .inner
            .put_multipart_opts(
                &path,
                PutMultipartOpts {
                    attributes,
                    ..Default::default()
                },
            )
            .await?;
        let mut writer = WriteMultipart::new(upload);

        let mut total: i64 = 0;
        let mut buf = vec![0u8; STREAM_BUF_SIZE];
        for source in sources {
            let mut reader = match self.get_stream(source).await {
                Ok(reader) => reader,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e);
                }
            };
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        let _ = writer.abort().await;
                        return Err(e.into());
                    }
                };
                writer.write(&buf[..n]);
                total += n as i64;
            }
        }
        writer.finish().await?;
        Ok(total)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = ObjectPath::from(name);
        self.inner.delete(&path).await?;
        Ok(())
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        let path = ObjectPath::from(name);
        match self.inner.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn stat(&self, name: &str) -> Result<ObjectStat> {
        let path = ObjectPath::from(name);
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        let result = self.inner.get_opts(&path, options).await?;
        let media_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|v| (**v).to_string());
        Ok(ObjectStat {
            size: result.meta.size as i64,
            last_modified: result.meta.last_modified,
            media_type,
        })
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectItem>> {
        let prefix = ObjectPath::from(prefix);
        let items: Vec<object_store::ObjectMeta> =
            self.inner.list(Some(&prefix)).try_collect().await?;
        Ok(items
            .into_iter()
            .map(|meta| ObjectItem {
                name: meta.location.to_string(),
                size: meta.size as i64,
                last_modified: meta.last_modified,
            })
            .collect())
    }

    /// Short-lived signed GET url. Only the S3 backend can sign; the local
    /// backend has no URL space to sign into.
    pub async fn presigned_get(&self, name: &str, ttl: Duration) -> Result<String> {
        let Some(signer) = &self.signer else {
            return Err(Error::validation(
                "presigned urls are not supported by the local store backend",
            ));
        };
        let path = ObjectPath::from(name);
        let url = signer
            .signed_url(http::Method::GET, &path, ttl)
            .await?;
        Ok(url.to_string())
    }
}
