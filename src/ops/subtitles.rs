//! Subtitle burn-in: parse the caller's subtitle source, normalize it to a
//! synthesized ASS script, and render it with the `subtitles` filter.

use std::path::Path;

use async_trait::async_trait;

use super::{ProcessContext, ProcessOutput, Processor, run_single_input};
use crate::domain::JobType;
use crate::error::{Error, Result};
use crate::jobs::config::SubtitlesConfig;
use crate::media::probe::StreamKind;
use crate::media::subtitles::{
    Cue, build_subtitles_filter, cues_from_inline, parse, synthesize_ass,
};

pub struct SubtitlesProcessor {
    cfg: SubtitlesConfig,
}

impl SubtitlesProcessor {
    pub fn new(cfg: SubtitlesConfig) -> SubtitlesProcessor {
        SubtitlesProcessor { cfg }
    }

    /// Load and parse the cue list from whichever source the config names.
    /// Parse failures are validation errors.
    async fn load_cues(&self, ctx: &ProcessContext) -> Result<Vec<Cue>> {
        if let Some(cues) = &self.cfg.subtitle_text {
            return Ok(cues_from_inline(cues));
        }
        let file_id = self
            .cfg
            .subtitle_file_id
            .ok_or_else(|| Error::validation("a subtitle source is required"))?;
        let asset = ctx.resolve_input(file_id).await?;
        let local = ctx.local_input(&asset).await?;
        let content = tokio::fs::read_to_string(&local)
            .await
            .map_err(|e| Error::validation(format!("subtitle file is not text: {e}")))?;
        parse(self.cfg.format, &content)
    }
}

#[async_trait]
impl Processor for SubtitlesProcessor {
    fn kind(&self) -> JobType {
        JobType::Subtitles
    }

    async fn validate(&self, ctx: &ProcessContext) -> Result<()> {
        let video_id = self
            .cfg
            .video_file_id
            .ok_or_else(|| Error::validation("subtitles requires video_file_id"))?;
        let video = ctx.resolve_input(video_id).await?;
        ctx.require_stream(&video, StreamKind::Video).await?;
        self.load_cues(ctx).await?;
        Ok(())
    }

    async fn run(&self, ctx: &ProcessContext) -> Result<ProcessOutput> {
        let video_id = self
            .cfg
            .video_file_id
            .ok_or_else(|| Error::validation("subtitles requires video_file_id"))?;
        run_single_input(
            ctx,
            self,
            video_id,
            &format!("subtitles_{}.mp4", ctx.job_id),
        )
        .await
    }

    async fn execute_local(
        &self,
        ctx: &ProcessContext,
        input: &Path,
        output: &Path,
    ) -> Result<serde_json::Value> {
        let cues = self.load_cues(ctx).await?;

        let probed = ctx
            .services
            .prober
            .validate_media(input, StreamKind::Video)
            .await?;
        let info = probed.media_info();
        let play_res = info.width.zip(info.height);

        let style = self.cfg.style.clone().unwrap_or_default();
        let position = self.cfg.position.clone().unwrap_or_default();
        let script = synthesize_ass(&cues, &style, &position, play_res);
        let script_path = ctx.temp_path(&format!(
            "subs_{}.ass",
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&script_path, script).await?;

        let mut args: Vec<String> = vec![
            "-i".into(),
            input.to_string_lossy().into_owned(),
            "-vf".into(),
            build_subtitles_filter(&script_path),
        ];
        args.extend(ctx.services.encode.video_args());
        args.push("-c:a".into());
        args.push("copy".into());
        args.push(output.to_string_lossy().into_owned());

        let ctx_progress = ctx.clone();
        let mut on_progress = move |p: f64| ctx_progress.report_progress(p);
        ctx.services
            .runner
            .run(&args, info.duration_seconds, &ctx.cancel, &mut on_progress)
            .await?;

        Ok(serde_json::json!({
            "output_path": output.to_string_lossy(),
            "cue_count": cues.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn context_with(services: Arc<crate::Services>) -> ProcessContext {
        let workdir = services.config.work_dir.join("subs_test");
        std::fs::create_dir_all(&workdir).unwrap();
        ProcessContext::new(services, 1, 1, 0, workdir, CancellationToken::new(), Arc::new(|_| {}))
    }

    #[tokio::test]
    async fn inline_cues_skip_the_object_store() {
        let (_dir, services) = crate::test_support::services().await;
        let ctx = context_with(services);
        let processor = SubtitlesProcessor::new(
            serde_json::from_value(serde_json::json!({
                "video_file_id": 1,
                "subtitle_text": [
                    {"start": 0.0, "end": 2.0, "text": "one"},
                    {"start": 2.0, "end": 4.0, "text": "two"}
                ],
                "format": "SRT"
            }))
            .unwrap(),
        );
        let cues = processor.load_cues(&ctx).await.unwrap();
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[1].text, "two");
    }

    #[tokio::test]
    async fn subtitle_asset_is_fetched_and_parsed() {
        let (_dir, services) = crate::test_support::services().await;
        let srt = "1\n00:00:00,000 --> 00:00:02,000\nHello\n";
        let asset =
            crate::test_support::seed_asset(&services, 1, "subs.srt", srt.as_bytes()).await;
        let ctx = context_with(services);
        let processor = SubtitlesProcessor::new(
            serde_json::from_value(serde_json::json!({
                "video_file_id": 1,
                "subtitle_file_id": asset.id,
                "format": "SRT"
            }))
            .unwrap(),
        );
        let cues = processor.load_cues(&ctx).await.unwrap();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "Hello");
    }

    #[tokio::test]
    async fn unparseable_subtitles_fail_validation() {
        let (_dir, services) = crate::test_support::services().await;
        let asset =
            crate::test_support::seed_asset(&services, 1, "subs.srt", b"not subtitles at all")
                .await;
        let ctx = context_with(services);
        let processor = SubtitlesProcessor::new(
            serde_json::from_value(serde_json::json!({
                "video_file_id": 1,
                "subtitle_file_id": asset.id,
                "format": "SRT"
            }))
            .unwrap(),
        );
        let err = processor.load_cues(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
