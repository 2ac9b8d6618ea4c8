//! The processor family: one implementation per operation type behind a
//! small common interface, composed by the pipeline runner for combined
//! jobs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Services;
use crate::domain::{Asset, JobType, MediaInfo};
use crate::error::{Error, Result};
use crate::jobs::config::JobConfig;
use crate::media::probe::StreamKind;

pub mod audio;
pub mod join;
pub mod overlay;
pub mod pipeline;
pub mod subtitles;
pub mod text;

pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Everything a processor needs for one attempt: dependencies, the job's
/// scratch directory, the cancellation signal, and the progress sink.
#[derive(Clone)]
pub struct ProcessContext {
    pub services: Arc<Services>,
    pub job_id: i64,
    pub owner_id: i64,
    pub attempt: i32,
    pub workdir: PathBuf,
    pub cancel: CancellationToken,
    progress: ProgressFn,
}

impl ProcessContext {
    pub fn new(
        services: Arc<Services>,
        job_id: i64,
        owner_id: i64,
        attempt: i32,
        workdir: PathBuf,
        cancel: CancellationToken,
        progress: ProgressFn,
    ) -> ProcessContext {
        ProcessContext {
            services,
            job_id,
            owner_id,
            attempt,
            workdir,
            cancel,
            progress,
        }
    }

    pub fn report_progress(&self, percent: f64) {
        (self.progress)(percent.clamp(0.0, 100.0));
    }

    /// A context whose 0..100 progress maps into a slice of the parent's
    /// range. Used by the pipeline so stage `i` of `n` reports
    /// `((i-1) + p/100)/n * 100` overall.
    pub fn scoped_progress(&self, offset: f64, scale: f64) -> ProcessContext {
        let parent = self.progress.clone();
        let mut scoped = self.clone();
        scoped.progress = Arc::new(move |p: f64| {
            parent((offset + p * scale).clamp(0.0, 100.0));
        });
        scoped
    }

    /// Path for a worker-owned temp file inside this attempt's subtree.
    pub fn temp_path(&self, name: &str) -> PathBuf {
        self.workdir.join(name)
    }

    /// A collision-free intermediate path for chained outputs.
    pub fn chain_path(&self, ext: &str) -> PathBuf {
        self.workdir
            .join(format!("{}.{ext}", uuid::Uuid::new_v4().simple()))
    }

    /// Resolve an input asset: it must exist, not be soft-deleted, and
    /// belong to the job's owner.
    pub async fn resolve_input(&self, asset_id: i64) -> Result<Asset> {
        let asset = self.services.files.get_active(asset_id).await?;
        if asset.owner_id != self.owner_id {
            return Err(Error::Authorization(format!(
                "file {asset_id} does not belong to the job owner"
            )));
        }
        Ok(asset)
    }

    /// Download an asset into the workdir, once per attempt. Reuses the local
    /// copy if a previous step (validation, typically) already fetched it.
    pub async fn local_input(&self, asset: &Asset) -> Result<PathBuf> {
        let ext = Path::new(&asset.filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        let dest = self.workdir.join(format!("input_{}.{ext}", asset.id));
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            return Ok(dest);
        }
        self.services
            .store
            .get_to_file(&asset.object_name, &dest)
            .await?;
        Ok(dest)
    }

    /// Probed metadata for an asset, through the probe cache. A miss fetches
    /// the asset and probes it, then writes the cache and the asset row.
    pub async fn probe_asset(&self, asset: &Asset) -> Result<MediaInfo> {
        if let Some(info) = self
            .services
            .probe_cache
            .get(asset.id, &asset.object_name)
            .await?
        {
            return Ok(info);
        }
        if let Some(info) = &asset.media_info {
            return Ok(info.clone());
        }
        let local = self.local_input(asset).await?;
        let info = self.services.prober.probe(&local).await?.media_info();
        self.services
            .probe_cache
            .set(asset.id, &asset.object_name, &info)
            .await?;
        self.services.files.set_media_info(asset.id, &info).await?;
        Ok(info)
    }

    /// Require the asset to contain a stream of the given kind.
    pub async fn require_stream(&self, asset: &Asset, kind: StreamKind) -> Result<MediaInfo> {
        let info = self.probe_asset(asset).await?;
        let present = match kind {
            StreamKind::Video => info.video_codec.is_some() || info.width.is_some(),
            StreamKind::Audio => info.audio_codec.is_some(),
        };
        if !present {
            return Err(Error::validation(format!(
                "file {} ({}) has no {} stream",
                asset.id,
                asset.filename,
                match kind {
                    StreamKind::Video => "video",
                    StreamKind::Audio => "audio",
                }
            )));
        }
        Ok(info)
    }

    /// Upload a produced file, register it as an Asset, and record its
    /// probed metadata.
    pub async fn register_output(&self, local: &Path, display_name: &str) -> Result<(Asset, MediaInfo)> {
        let object_name = format!(
            "files/{}/{}_{display_name}",
            self.owner_id,
            uuid::Uuid::new_v4().simple()
        );
        let size = self
            .services
            .store
            .put_file(&object_name, local, "video/mp4")
            .await?;
        let asset = self
            .services
            .files
            .create(self.owner_id, display_name, &object_name, size, "video/mp4")
            .await?;
        let info = match self.services.prober.probe(local).await {
            Ok(probed) => {
                let info = probed.media_info();
                self.services.files.set_media_info(asset.id, &info).await?;
                self.services
                    .probe_cache
                    .set(asset.id, &asset.object_name, &info)
                    .await?;
                info
            }
            // The artifact is already stored; a probe hiccup only costs
            // metadata.
            Err(_) => MediaInfo::default(),
        };
        Ok((asset, info))
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub output_file_ids: Vec<i64>,
    pub result: serde_json::Value,
}

#[async_trait]
pub trait Processor: Send + Sync {
    fn kind(&self) -> JobType;

    /// Pre-flight semantic checks: referenced assets exist and are
    /// compatible. Failures are non-retryable and surfaced to the user.
    async fn validate(&self, ctx: &ProcessContext) -> Result<()>;

    /// Full asset-level execution: fetch inputs, process, upload the output,
    /// register the Asset.
    async fn run(&self, ctx: &ProcessContext) -> Result<ProcessOutput>;

    /// Local-file execution used by the pipeline runner: transform `input`
    /// into `output`, both inside the worker's subtree. Returns stage
    /// detail for the job result.
    async fn execute_local(
        &self,
        ctx: &ProcessContext,
        input: &Path,
        output: &Path,
    ) -> Result<serde_json::Value>;

    /// Release anything the processor holds outside the workdir. The
    /// dispatcher removes the workdir itself on every exit path.
    async fn cleanup(&self, _ctx: &ProcessContext) {}
}

pub fn build_processor(config: JobConfig) -> Box<dyn Processor> {
    match config {
        JobConfig::Join(cfg) => Box::new(join::JoinProcessor::new(cfg)),
        JobConfig::AudioOverlay(cfg) => Box::new(audio::AudioOverlayProcessor::new(cfg)),
        JobConfig::TextOverlay(cfg) => Box::new(text::TextOverlayProcessor::new(cfg)),
        JobConfig::Subtitles(cfg) => Box::new(subtitles::SubtitlesProcessor::new(cfg)),
        JobConfig::VideoOverlay(cfg) => Box::new(overlay::VideoOverlayProcessor::new(cfg)),
        JobConfig::Combined(cfg) => Box::new(pipeline::CombinedProcessor::new(cfg)),
    }
}

/// Shared single-input run shape: resolve the primary asset, execute
/// locally, upload, and summarize.
pub(crate) async fn run_single_input(
    ctx: &ProcessContext,
    processor: &dyn Processor,
    primary_id: i64,
    output_name: &str,
) -> Result<ProcessOutput> {
    let asset = ctx.resolve_input(primary_id).await?;
    let input = ctx.local_input(&asset).await?;
    let output = ctx.chain_path("mp4");
    let detail = processor.execute_local(ctx, &input, &output).await?;
    let (out_asset, info) = ctx.register_output(&output, output_name).await?;
    Ok(ProcessOutput {
        output_file_ids: vec![out_asset.id],
        result: serde_json::json!({
            "output_file_id": out_asset.id,
            "output_size": out_asset.size,
            "duration": info.duration_seconds,
            "detail": detail,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use std::sync::Mutex;

    fn context(services: Arc<Services>) -> ProcessContext {
        let workdir = services.config.work_dir.join("job_1_attempt_0");
        std::fs::create_dir_all(&workdir).unwrap();
        ProcessContext::new(
            services,
            1,
            1,
            0,
            workdir,
            CancellationToken::new(),
            Arc::new(|_| {}),
        )
    }

    #[tokio::test]
    async fn scoped_progress_maps_into_the_parent_range() {
        let (_dir, services) = test_support::services().await;
        let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut ctx = context(services);
        ctx.progress = Arc::new(move |p| sink.lock().unwrap().push(p));

        // Second stage of four: offset 25, scale 1/4.
        let scoped = ctx.scoped_progress(25.0, 0.25);
        scoped.report_progress(0.0);
        scoped.report_progress(50.0);
        scoped.report_progress(100.0);
        assert_eq!(*seen.lock().unwrap(), vec![25.0, 37.5, 50.0]);
    }

    #[tokio::test]
    async fn resolve_input_enforces_ownership_and_liveness() {
        let (_dir, services) = test_support::services().await;
        let mine = test_support::seed_asset(&services, 1, "a.mp4", b"data").await;
        let theirs = test_support::seed_asset(&services, 2, "b.mp4", b"data").await;
        let ctx = context(services.clone());

        assert_eq!(ctx.resolve_input(mine.id).await.unwrap().id, mine.id);
        assert!(matches!(
            ctx.resolve_input(theirs.id).await.unwrap_err(),
            Error::Authorization(_)
        ));
        services.files.soft_delete(mine.id).await.unwrap();
        assert!(matches!(
            ctx.resolve_input(mine.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            ctx.resolve_input(999).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn local_input_downloads_once() {
        let (_dir, services) = test_support::services().await;
        let asset = test_support::seed_asset(&services, 1, "clip.mp4", b"payload").await;
        let ctx = context(services);

        let path = ctx.local_input(&asset).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");

        // A second call reuses the local copy rather than re-downloading.
        std::fs::write(&path, b"modified").unwrap();
        let again = ctx.local_input(&asset).await.unwrap();
        assert_eq!(again, path);
        assert_eq!(std::fs::read(&again).unwrap(), b"modified");
    }

    #[tokio::test]
    async fn probe_asset_prefers_cache_then_row() {
        let (_dir, services) = test_support::services().await;
        let asset = test_support::seed_asset(&services, 1, "clip.mp4", b"payload").await;
        let info = MediaInfo {
            duration_seconds: Some(9.0),
            video_codec: Some("h264".into()),
            ..Default::default()
        };
        services
            .probe_cache
            .set(asset.id, &asset.object_name, &info)
            .await
            .unwrap();

        let ctx = context(services.clone());
        assert_eq!(ctx.probe_asset(&asset).await.unwrap(), info);

        // With the cache invalidated, the stored row metadata answers.
        services
            .probe_cache
            .invalidate(asset.id, &asset.object_name)
            .await
            .unwrap();
        services.files.set_media_info(asset.id, &info).await.unwrap();
        let asset = services.files.get(asset.id).await.unwrap();
        assert_eq!(ctx.probe_asset(&asset).await.unwrap(), info);
    }

    #[tokio::test]
    async fn chain_paths_never_collide() {
        let (_dir, services) = test_support::services().await;
        let ctx = context(services);
        let a = ctx.chain_path("mp4");
        let b = ctx.chain_path("mp4");
        assert_ne!(a, b);
        assert!(a.starts_with(&ctx.workdir));
    }
}
