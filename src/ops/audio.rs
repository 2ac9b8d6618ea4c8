//! Audio overlay: replace the video's audio track, or mix the overlay into
//! it with per-track gain.

use std::path::Path;

use async_trait::async_trait;

use super::{ProcessContext, ProcessOutput, Processor, run_single_input};
use crate::domain::JobType;
use crate::error::{Error, Result};
use crate::jobs::config::{AudioMode, AudioOverlayConfig};
use crate::media::probe::StreamKind;
use crate::media::trim_float;

pub struct AudioOverlayProcessor {
    cfg: AudioOverlayConfig,
}

impl AudioOverlayProcessor {
    pub fn new(cfg: AudioOverlayConfig) -> AudioOverlayProcessor {
        AudioOverlayProcessor { cfg }
    }

    /// Filter steps applied to the overlay track before it is mapped or
    /// mixed: optional trim, optional delay, optional gain.
    fn overlay_chain(&self, include_volume: bool) -> Vec<String> {
        let mut chain = Vec::new();
        if let Some(duration) = self.cfg.duration {
            chain.push(format!("atrim=0:{}", trim_float(duration)));
        }
        if self.cfg.offset > 0.0 {
            let ms = (self.cfg.offset * 1000.0).round() as i64;
            chain.push(format!("adelay={ms}:all=1"));
        }
        if include_volume && (self.cfg.overlay_volume - 1.0).abs() > f64::EPSILON {
            chain.push(format!("volume={}", trim_float(self.cfg.overlay_volume)));
        }
        chain
    }

    fn build_args(&self, video: &Path, audio: &Path, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-i".into(),
            video.to_string_lossy().into_owned(),
            "-i".into(),
            audio.to_string_lossy().into_owned(),
        ];

        match self.cfg.mode {
            AudioMode::Replace => {
                let chain = self.overlay_chain(true);
                if chain.is_empty() {
                    args.extend(["-map".into(), "0:v".into(), "-map".into(), "1:a".into()]);
                } else {
                    args.extend([
                        "-filter_complex".into(),
                        format!("[1:a]{}[aout]", chain.join(",")),
                        "-map".into(),
                        "0:v".into(),
                        "-map".into(),
                        "[aout]".into(),
                    ]);
                }
                args.extend([
                    "-c:v".into(),
                    "copy".into(),
                    "-c:a".into(),
                    "aac".into(),
                    "-shortest".into(),
                ]);
            }
            AudioMode::Mix => {
                let mut overlay_leg = self.overlay_chain(false);
                overlay_leg.push(format!("volume={}", trim_float(self.cfg.overlay_volume)));
                let graph = format!(
                    "[0:a]volume={orig}[a0];[1:a]{leg}[a1];[a0][a1]amix=inputs=2:duration=shortest[aout]",
                    orig = trim_float(self.cfg.original_volume),
                    leg = overlay_leg.join(","),
                );
                args.extend([
                    "-filter_complex".into(),
                    graph,
                    "-map".into(),
                    "0:v".into(),
                    "-map".into(),
                    "[aout]".into(),
                    "-c:v".into(),
                    "copy".into(),
                    "-c:a".into(),
                    "aac".into(),
                ]);
            }
        }

        args.push(output.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl Processor for AudioOverlayProcessor {
    fn kind(&self) -> JobType {
        JobType::AudioOverlay
    }

    async fn validate(&self, ctx: &ProcessContext) -> Result<()> {
        let video_id = self
            .cfg
            .video_file_id
            .ok_or_else(|| Error::validation("audio_overlay requires video_file_id"))?;
        let video = ctx.resolve_input(video_id).await?;
        ctx.require_stream(&video, StreamKind::Video).await?;

        let audio = ctx.resolve_input(self.cfg.audio_file_id).await?;
        ctx.require_stream(&audio, StreamKind::Audio).await?;
        Ok(())
    }

    async fn run(&self, ctx: &ProcessContext) -> Result<ProcessOutput> {
        let video_id = self
            .cfg
            .video_file_id
            .ok_or_else(|| Error::validation("audio_overlay requires video_file_id"))?;
        run_single_input(
            ctx,
            self,
            video_id,
            &format!("audio_overlay_{}.mp4", ctx.job_id),
        )
        .await
    }

    async fn execute_local(
        &self,
        ctx: &ProcessContext,
        input: &Path,
        output: &Path,
    ) -> Result<serde_json::Value> {
        let audio_asset = ctx.resolve_input(self.cfg.audio_file_id).await?;
        let audio = ctx.local_input(&audio_asset).await?;

        let total = ctx
            .services
            .prober
            .probe(input)
            .await
            .ok()
            .and_then(|p| p.duration_seconds());

        let args = self.build_args(input, &audio, output);
        let ctx_progress = ctx.clone();
        let mut on_progress = move |p: f64| ctx_progress.report_progress(p);
        ctx.services
            .runner
            .run(&args, total, &ctx.cancel, &mut on_progress)
            .await?;

        Ok(serde_json::json!({
            "output_path": output.to_string_lossy(),
            "mode": match self.cfg.mode {
                AudioMode::Replace => "replace",
                AudioMode::Mix => "mix",
            },
        }))
    }
}
