//! Text overlay: drawtext burn-in with styling and animation.

use std::path::Path;

use async_trait::async_trait;

use super::{ProcessContext, ProcessOutput, Processor, run_single_input};
use crate::domain::JobType;
use crate::error::{Error, Result};
use crate::jobs::config::TextOverlayConfig;
use crate::media::probe::StreamKind;
use crate::media::text::{TextFilter, build_text_filter};

pub struct TextOverlayProcessor {
    cfg: TextOverlayConfig,
}

impl TextOverlayProcessor {
    pub fn new(cfg: TextOverlayConfig) -> TextOverlayProcessor {
        TextOverlayProcessor { cfg }
    }

    fn build_args(
        &self,
        ctx: &ProcessContext,
        input: &Path,
        output: &Path,
        width: u32,
        height: u32,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec!["-i".into(), input.to_string_lossy().into_owned()];
        match build_text_filter(&self.cfg, width, height) {
            TextFilter::Simple(filter) => {
                args.push("-vf".into());
                args.push(filter);
            }
            TextFilter::Complex { graph, output: label } => {
                args.push("-filter_complex".into());
                args.push(graph);
                args.push("-map".into());
                args.push(format!("[{label}]"));
                args.push("-map".into());
                args.push("0:a?".into());
            }
        }
        args.extend(ctx.services.encode.video_args());
        args.push("-c:a".into());
        args.push("copy".into());
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl Processor for TextOverlayProcessor {
    fn kind(&self) -> JobType {
        JobType::TextOverlay
    }

    async fn validate(&self, ctx: &ProcessContext) -> Result<()> {
        let video_id = self
            .cfg
            .video_file_id
            .ok_or_else(|| Error::validation("text_overlay requires video_file_id"))?;
        let video = ctx.resolve_input(video_id).await?;
        let info = ctx.require_stream(&video, StreamKind::Video).await?;
        if let (Some(end), Some(duration)) = (self.cfg.end_time, info.duration_seconds)
            && end > duration + 0.5
        {
            return Err(Error::validation(format!(
                "end_time {end} exceeds the video duration {duration:.2}"
            )));
        }
        Ok(())
    }

    async fn run(&self, ctx: &ProcessContext) -> Result<ProcessOutput> {
        let video_id = self
            .cfg
            .video_file_id
            .ok_or_else(|| Error::validation("text_overlay requires video_file_id"))?;
        run_single_input(
            ctx,
            self,
            video_id,
            &format!("text_overlay_{}.mp4", ctx.job_id),
        )
        .await
    }

    async fn execute_local(
        &self,
        ctx: &ProcessContext,
        input: &Path,
        output: &Path,
    ) -> Result<serde_json::Value> {
        let probed = ctx
            .services
            .prober
            .validate_media(input, StreamKind::Video)
            .await?;
        let info = probed.media_info();
        let (width, height) = (info.width.unwrap_or(1920), info.height.unwrap_or(1080));

        let args = self.build_args(ctx, input, output, width, height);
        let ctx_progress = ctx.clone();
        let mut on_progress = move |p: f64| ctx_progress.report_progress(p);
        ctx.services
            .runner
            .run(&args, info.duration_seconds, &ctx.cancel, &mut on_progress)
            .await?;

        Ok(serde_json::json!({
            "output_path": output.to_string_lossy(),
            "text": self.cfg.text,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn processor() -> TextOverlayProcessor {
        TextOverlayProcessor::new(
            serde_json::from_value(serde_json::json!({
                "video_file_id": 1,
                "text": "Hello, World",
                "position": {"type": "relative", "position": "bottom-center", "margin_x": 10, "margin_y": 10},
                "style": {"font_size": 48, "color": "#FFFFFF"},
                "start_time": 0.0,
                "end_time": 5.0
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn args_re_encode_video_and_copy_audio() {
        let (_dir, services) = crate::test_support::services().await;
        let workdir = services.config.work_dir.clone();
        let ctx = ProcessContext::new(
            services,
            1,
            1,
            0,
            workdir,
            tokio_util::sync::CancellationToken::new(),
            Arc::new(|_| {}),
        );
        let args = processor().build_args(
            &ctx,
            Path::new("in.mp4"),
            Path::new("out.mp4"),
            640,
            480,
        );
        let vf = args
            .iter()
            .position(|a| a == "-vf")
            .map(|i| args[i + 1].clone())
            .unwrap();
        assert!(vf.starts_with("drawtext=text='Hello, World'"));
        assert!(args.contains(&"libx264".to_string()));
        let ca = args.iter().position(|a| a == "-c:a").unwrap();
        assert_eq!(args[ca + 1], "copy");
    }

    #[tokio::test]
    async fn rotation_maps_the_graph_output() {
        let (_dir, services) = crate::test_support::services().await;
        let workdir = services.config.work_dir.clone();
        let ctx = ProcessContext::new(
            services,
            1,
            1,
            0,
            workdir,
            tokio_util::sync::CancellationToken::new(),
            Arc::new(|_| {}),
        );
        let mut p = processor();
        p.cfg.rotation = 15.0;
        let args = p.build_args(&ctx, Path::new("in.mp4"), Path::new("out.mp4"), 640, 480);
        assert!(args.contains(&"-filter_complex".to_string()));
        assert!(args.contains(&"[vout]".to_string()));
        assert!(args.contains(&"0:a?".to_string()));
    }
}
