//! Join: concatenate clips with the concat demuxer, stream-copying when the
//! inputs agree on resolution, frame rate, and codec.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{ProcessContext, ProcessOutput, Processor};
use crate::domain::{JobType, MediaInfo};
use crate::error::{Error, Result};
use crate::jobs::config::JoinConfig;

pub struct JoinProcessor {
    cfg: JoinConfig,
}

impl JoinProcessor {
    pub fn new(cfg: JoinConfig) -> JoinProcessor {
        JoinProcessor { cfg }
    }

    fn output_name(&self, ctx: &ProcessContext) -> String {
        self.cfg
            .output_filename
            .clone()
            .unwrap_or_else(|| format!("join_{}.mp4", ctx.job_id))
    }

    /// Stream copy requires every input to agree on geometry, frame rate,
    /// and video codec.
    fn check_compatible(infos: &[(i64, MediaInfo)]) -> Result<()> {
        let Some((first_id, first)) = infos.first() else {
            return Ok(());
        };
        for (id, info) in &infos[1..] {
            if (info.width, info.height) != (first.width, first.height) {
                return Err(Error::validation(format!(
                    "resolution mismatch between inputs: file {first_id} is {}x{}, file {id} is {}x{}",
                    first.width.unwrap_or(0),
                    first.height.unwrap_or(0),
                    info.width.unwrap_or(0),
                    info.height.unwrap_or(0),
                )));
            }
            let fps_a = first.frame_rate.unwrap_or(0.0);
            let fps_b = info.frame_rate.unwrap_or(0.0);
            if (fps_a - fps_b).abs() > 0.05 {
                return Err(Error::validation(format!(
                    "frame rate mismatch between inputs: file {first_id} is {fps_a:.2} fps, file {id} is {fps_b:.2} fps"
                )));
            }
            if info.video_codec != first.video_codec {
                return Err(Error::validation(format!(
                    "video codec mismatch between inputs: file {first_id} is {}, file {id} is {}",
                    first.video_codec.as_deref().unwrap_or("unknown"),
                    info.video_codec.as_deref().unwrap_or("unknown"),
                )));
            }
        }
        Ok(())
    }

    /// Concatenate local files into `output`. `total_duration` drives the
    /// progress percentage.
    async fn concat(
        &self,
        ctx: &ProcessContext,
        inputs: &[PathBuf],
        output: &Path,
        total_duration: Option<f64>,
    ) -> Result<()> {
        let list_path = ctx.temp_path(&format!(
            "concat_{}.txt",
            uuid::Uuid::new_v4().simple()
        ));
        let mut list = String::new();
        for path in inputs {
            // Concat-demuxer quoting: close the quote around embedded quotes.
            let escaped = path.to_string_lossy().replace('\'', "'\\''");
            list.push_str(&format!("file '{escaped}'\n"));
        }
        tokio::fs::write(&list_path, list).await?;

        let mut args: Vec<String> = vec![
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.to_string_lossy().into_owned(),
        ];
        if self.cfg.re_encode {
            args.extend(ctx.services.encode.video_args());
            args.push("-c:a".into());
            args.push("aac".into());
        } else {
            args.push("-c".into());
            args.push("copy".into());
        }
        args.push(output.to_string_lossy().into_owned());

        let ctx_progress = ctx.clone();
        let mut on_progress = move |p: f64| ctx_progress.report_progress(p);
        ctx.services
            .runner
            .run(&args, total_duration, &ctx.cancel, &mut on_progress)
            .await
    }

    async fn gather(&self, ctx: &ProcessContext) -> Result<Vec<(i64, MediaInfo)>> {
        let mut infos = Vec::with_capacity(self.cfg.file_ids.len());
        for id in &self.cfg.file_ids {
            let asset = ctx.resolve_input(*id).await?;
            let info = ctx
                .require_stream(&asset, crate::media::probe::StreamKind::Video)
                .await?;
            infos.push((*id, info));
        }
        Ok(infos)
    }
}

#[async_trait]
impl Processor for JoinProcessor {
    fn kind(&self) -> JobType {
        JobType::Join
    }

    async fn validate(&self, ctx: &ProcessContext) -> Result<()> {
        if self.cfg.file_ids.len() < 2 {
            return Err(Error::validation("join requires at least 2 input files"));
        }
        let infos = self.gather(ctx).await?;
        if !self.cfg.re_encode {
            Self::check_compatible(&infos)?;
        }
        Ok(())
    }

    async fn run(&self, ctx: &ProcessContext) -> Result<ProcessOutput> {
        let infos = self.gather(ctx).await?;
        let total: f64 = infos
            .iter()
            .filter_map(|(_, info)| info.duration_seconds)
            .sum();

        let mut inputs = Vec::with_capacity(self.cfg.file_ids.len());
        for id in &self.cfg.file_ids {
            let asset = ctx.resolve_input(*id).await?;
            inputs.push(ctx.local_input(&asset).await?);
        }

        let output = ctx.chain_path("mp4");
        self.concat(ctx, &inputs, &output, (total > 0.0).then_some(total))
            .await?;

        let (asset, info) = ctx
            .register_output(&output, &self.output_name(ctx))
            .await?;
        Ok(ProcessOutput {
            output_file_ids: vec![asset.id],
            result: serde_json::json!({
                "output_file_id": asset.id,
                "output_size": asset.size,
                "duration": info.duration_seconds,
                "joined": self.cfg.file_ids,
                "stream_copy": !self.cfg.re_encode,
            }),
        })
    }

    /// Pipeline stage form: the chained file leads, then this stage's own
    /// inputs.
    async fn execute_local(
        &self,
        ctx: &ProcessContext,
        input: &Path,
        output: &Path,
    ) -> Result<serde_json::Value> {
        let mut inputs = vec![input.to_path_buf()];
        let mut total = ctx
            .services
            .prober
            .probe(input)
            .await
            .ok()
            .and_then(|p| p.duration_seconds())
            .unwrap_or(0.0);
        for id in &self.cfg.file_ids {
            let asset = ctx.resolve_input(*id).await?;
            let info = ctx
                .require_stream(&asset, crate::media::probe::StreamKind::Video)
                .await?;
            total += info.duration_seconds.unwrap_or(0.0);
            inputs.push(ctx.local_input(&asset).await?);
        }
        self.concat(ctx, &inputs, output, (total > 0.0).then_some(total))
            .await?;
        Ok(serde_json::json!({
            "output_path": output.to_string_lossy(),
            "joined": inputs.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(w: u32, h: u32, fps: f64, codec: &str) -> MediaInfo {
        MediaInfo {
            duration_seconds: Some(5.0),
            width: Some(w),
            height: Some(h),
            frame_rate: Some(fps),
            video_codec: Some(codec.to_string()),
            audio_codec: Some("aac".to_string()),
            bit_rate: None,
        }
    }

    #[test]
    fn identical_inputs_are_compatible() {
        let infos = vec![
            (1, info(640, 480, 30.0, "h264")),
            (2, info(640, 480, 30.0, "h264")),
        ];
        JoinProcessor::check_compatible(&infos).unwrap();
    }

    #[test]
    fn resolution_mismatch_names_the_dimension() {
        let infos = vec![
            (1, info(640, 480, 30.0, "h264")),
            (2, info(1280, 720, 30.0, "h264")),
        ];
        let err = JoinProcessor::check_compatible(&infos).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("resolution"), "{msg}");
        assert!(msg.contains("640x480"));
        assert!(msg.contains("1280x720"));
    }

    #[test]
    fn frame_rate_and_codec_mismatches_are_rejected() {
        let infos = vec![
            (1, info(640, 480, 30.0, "h264")),
            (2, info(640, 480, 24.0, "h264")),
        ];
        assert!(
            JoinProcessor::check_compatible(&infos)
                .unwrap_err()
                .to_string()
                .contains("frame rate")
        );

        let infos = vec![
            (1, info(640, 480, 30.0, "h264")),
            (2, info(640, 480, 30.0, "hevc")),
        ];
        assert!(
            JoinProcessor::check_compatible(&infos)
                .unwrap_err()
                .to_string()
                .contains("codec")
        );
    }

    #[test]
    fn near_equal_frame_rates_pass() {
        let infos = vec![
            (1, info(640, 480, 29.97, "h264")),
            (2, info(640, 480, 29.970_029, "h264")),
        ];
        JoinProcessor::check_compatible(&infos).unwrap();
    }

    #[tokio::test]
    async fn validate_rejects_a_missing_input() {
        let (_dir, services) = crate::test_support::services().await;
        let a = crate::test_support::seed_asset(&services, 1, "a.mp4", b"x").await;
        let processor = JoinProcessor::new(JoinConfig {
            file_ids: vec![999, a.id],
            output_filename: None,
            re_encode: false,
        });
        let workdir = services.config.work_dir.join("join_test");
        std::fs::create_dir_all(&workdir).unwrap();
        let ctx = ProcessContext::new(
            services,
            1,
            1,
            0,
            workdir,
            tokio_util::sync::CancellationToken::new(),
            std::sync::Arc::new(|_| {}),
        );
        let err = processor.validate(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
