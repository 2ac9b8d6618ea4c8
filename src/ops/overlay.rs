//! Picture-in-picture: composite an overlay clip onto a base video.

use std::path::Path;

use async_trait::async_trait;

use super::{ProcessContext, ProcessOutput, Processor, run_single_input};
use crate::domain::JobType;
use crate::error::{Error, Result};
use crate::jobs::config::VideoOverlayConfig;
use crate::media::overlay::build_overlay_graph;
use crate::media::probe::StreamKind;

pub struct VideoOverlayProcessor {
    cfg: VideoOverlayConfig,
}

impl VideoOverlayProcessor {
    pub fn new(cfg: VideoOverlayConfig) -> VideoOverlayProcessor {
        VideoOverlayProcessor { cfg }
    }

    fn build_args(&self, base: &Path, overlay: &Path, output: &Path) -> Vec<String> {
        vec![
            "-i".to_string(),
            base.to_string_lossy().into_owned(),
            "-i".to_string(),
            overlay.to_string_lossy().into_owned(),
            "-filter_complex".to_string(),
            build_overlay_graph(&self.cfg),
            "-map".to_string(),
            "[vout]".to_string(),
            "-map".to_string(),
            "0:a?".to_string(),
            "-c:a".to_string(),
            "copy".to_string(),
        ]
    }
}

#[async_trait]
impl Processor for VideoOverlayProcessor {
    fn kind(&self) -> JobType {
        JobType::VideoOverlay
    }

    async fn validate(&self, ctx: &ProcessContext) -> Result<()> {
        let base_id = self
            .cfg
            .base_video_file_id
            .ok_or_else(|| Error::validation("video_overlay requires base_video_file_id"))?;
        let base = ctx.resolve_input(base_id).await?;
        ctx.require_stream(&base, StreamKind::Video).await?;

        let overlay = ctx.resolve_input(self.cfg.overlay_video_file_id).await?;
        ctx.require_stream(&overlay, StreamKind::Video).await?;
        Ok(())
    }

    async fn run(&self, ctx: &ProcessContext) -> Result<ProcessOutput> {
        let base_id = self
            .cfg
            .base_video_file_id
            .ok_or_else(|| Error::validation("video_overlay requires base_video_file_id"))?;
        run_single_input(
            ctx,
            self,
            base_id,
            &format!("video_overlay_{}.mp4", ctx.job_id),
        )
        .await
    }

    async fn execute_local(
        &self,
        ctx: &ProcessContext,
        input: &Path,
        output: &Path,
    ) -> Result<serde_json::Value> {
        let overlay_asset = ctx.resolve_input(self.cfg.overlay_video_file_id).await?;
        let overlay = ctx.local_input(&overlay_asset).await?;

        let total = ctx
            .services
            .prober
            .probe(input)
            .await
            .ok()
            .and_then(|p| p.duration_seconds());

        let mut args = self.build_args(input, &overlay, output);
        args.extend(ctx.services.encode.video_args());
        args.push(output.to_string_lossy().into_owned());

        let ctx_progress = ctx.clone();
        let mut on_progress = move |p: f64| ctx_progress.report_progress(p);
        ctx.services
            .runner
            .run(&args, total, &ctx.cancel, &mut on_progress)
            .await?;

        Ok(serde_json::json!({
            "output_path": output.to_string_lossy(),
            "overlay_file_id": self.cfg.overlay_video_file_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_map_the_composited_stream_and_copy_base_audio() {
        let p = VideoOverlayProcessor::new(
            serde_json::from_value(serde_json::json!({
                "base_video_file_id": 1,
                "overlay_video_file_id": 2,
                "config": {"x": 10, "y": 20, "scale": 0.3}
            }))
            .unwrap(),
        );
        let args = p.build_args(Path::new("base.mp4"), Path::new("pip.mp4"), Path::new("out.mp4"));
        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "base.mp4");
        assert_eq!(args[3], "pip.mp4");
        let fc = args
            .iter()
            .position(|a| a == "-filter_complex")
            .map(|i| args[i + 1].clone())
            .unwrap();
        assert!(fc.contains("overlay=10:20"));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "[vout]"));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "0:a?"));
    }
}
