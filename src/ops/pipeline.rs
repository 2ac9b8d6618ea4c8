//! The combined operation: an ordered chain of processors over one seed
//! asset, with temp-file chaining and full rollback on failure.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{ProcessContext, ProcessOutput, Processor, build_processor};
use crate::domain::JobType;
use crate::error::{Error, Result};
use crate::jobs::config::{CombinedConfig, JobConfig};

pub struct CombinedProcessor {
    cfg: CombinedConfig,
}

impl CombinedProcessor {
    pub fn new(cfg: CombinedConfig) -> CombinedProcessor {
        CombinedProcessor { cfg }
    }

    fn stage_processors(&self) -> Result<Vec<Box<dyn Processor>>> {
        self.cfg
            .operations
            .iter()
            .map(|op| {
                let stage = JobConfig::from_value(op.op_type, &op.config)?;
                stage.validate(false)?;
                Ok(build_processor(stage))
            })
            .collect()
    }
}

/// Run `stages` over `seed`, chaining intermediate files. Every intermediate
/// is removed as soon as its successor is accepted; on failure every
/// instantiated stage is cleaned up and the whole chain (seed included) is
/// deleted, so nothing partial survives the attempt.
pub(crate) async fn run_chain(
    ctx: &ProcessContext,
    seed: PathBuf,
    stages: &[Box<dyn Processor>],
) -> Result<(PathBuf, Vec<serde_json::Value>)> {
    let n = stages.len() as f64;
    let mut current = seed;
    let mut stage_results = Vec::with_capacity(stages.len());

    for (i, stage) in stages.iter().enumerate() {
        let scoped = ctx.scoped_progress(i as f64 / n * 100.0, 1.0 / n);
        let output = ctx.chain_path("mp4");

        let result = stage.execute_local(&scoped, &current, &output).await;
        match result {
            Ok(detail) => {
                stage_results.push(serde_json::json!({
                    "type": stage.kind().as_str(),
                    "output_path": output.to_string_lossy(),
                    "detail": detail,
                }));
                // The previous link is no longer needed once this stage's
                // output is accepted.
                let _ = tokio::fs::remove_file(&current).await;
                current = output;
                ctx.report_progress((i as f64 + 1.0) / n * 100.0);
            }
            Err(err) => {
                for stage in &stages[..=i] {
                    stage.cleanup(ctx).await;
                }
                let _ = tokio::fs::remove_file(&current).await;
                let _ = tokio::fs::remove_file(&output).await;
                return Err(err);
            }
        }
    }

    Ok((current, stage_results))
}

#[async_trait]
impl Processor for CombinedProcessor {
    fn kind(&self) -> JobType {
        JobType::Combined
    }

    async fn validate(&self, ctx: &ProcessContext) -> Result<()> {
        if !(2..=10).contains(&self.cfg.operations.len()) {
            return Err(Error::validation(
                "combined requires between 2 and 10 operations",
            ));
        }
        self.stage_processors()?;
        ctx.resolve_input(self.cfg.base_file_id).await?;
        // Secondary inputs of every stage must resolve before any work
        // starts.
        let ids = JobConfig::Combined(self.cfg.clone()).input_file_ids();
        for id in ids {
            ctx.resolve_input(id).await?;
        }
        Ok(())
    }

    async fn run(&self, ctx: &ProcessContext) -> Result<ProcessOutput> {
        let stages = self.stage_processors()?;
        let seed_asset = ctx.resolve_input(self.cfg.base_file_id).await?;
        let seed = ctx.local_input(&seed_asset).await?;

        let (final_path, stage_results) = run_chain(ctx, seed, &stages).await?;

        let upload = ctx
            .register_output(&final_path, &format!("combined_{}.mp4", ctx.job_id))
            .await;
        // Never leave the final intermediate behind, uploaded or not.
        let _ = tokio::fs::remove_file(&final_path).await;
        let (asset, info) = upload?;

        Ok(ProcessOutput {
            output_file_ids: vec![asset.id],
            result: serde_json::json!({
                "output_file_id": asset.id,
                "output_size": asset.size,
                "duration": info.duration_seconds,
                "stages": stage_results,
            }),
        })
    }

    async fn execute_local(
        &self,
        ctx: &ProcessContext,
        input: &Path,
        output: &Path,
    ) -> Result<serde_json::Value> {
        let stages = self.stage_processors()?;
        let (final_path, stage_results) = run_chain(ctx, input.to_path_buf(), &stages).await?;
        tokio::fs::rename(&final_path, output).await?;
        Ok(serde_json::json!({
            "output_path": output.to_string_lossy(),
            "stages": stage_results,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Test stage that copies its input and appends a marker, or fails.
    struct StubStage {
        marker: &'static str,
        fail: bool,
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Processor for StubStage {
        fn kind(&self) -> JobType {
            JobType::TextOverlay
        }

        async fn validate(&self, _ctx: &ProcessContext) -> Result<()> {
            Ok(())
        }

        async fn run(&self, _ctx: &ProcessContext) -> Result<ProcessOutput> {
            unreachable!("stages run through execute_local");
        }

        async fn execute_local(
            &self,
            ctx: &ProcessContext,
            input: &Path,
            output: &Path,
        ) -> Result<serde_json::Value> {
            ctx.report_progress(50.0);
            if self.fail {
                return Err(Error::processing("stage exploded", ""));
            }
            let mut data = tokio::fs::read(input).await?;
            data.extend_from_slice(self.marker.as_bytes());
            tokio::fs::write(output, data).await?;
            ctx.report_progress(100.0);
            Ok(serde_json::json!({"marker": self.marker}))
        }

        async fn cleanup(&self, _ctx: &ProcessContext) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn context() -> (tempfile::TempDir, ProcessContext, Arc<std::sync::Mutex<Vec<f64>>>) {
        let (dir, services) = crate::test_support::services().await;
        let workdir = services.config.work_dir.join("chain");
        std::fs::create_dir_all(&workdir).unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = ProcessContext::new(
            services,
            1,
            1,
            0,
            workdir,
            CancellationToken::new(),
            Arc::new(move |p| sink.lock().unwrap().push(p)),
        );
        (dir, ctx, seen)
    }

    fn stage(marker: &'static str, fail: bool, cleanups: &Arc<AtomicUsize>) -> Box<dyn Processor> {
        Box::new(StubStage {
            marker,
            fail,
            cleanups: cleanups.clone(),
        })
    }

    #[tokio::test]
    async fn chain_threads_files_and_removes_intermediates() {
        let (_dir, ctx, seen) = context().await;
        let cleanups = Arc::new(AtomicUsize::new(0));
        let seed = ctx.workdir.join("seed.mp4");
        tokio::fs::write(&seed, b"seed;").await.unwrap();

        let stages = vec![stage("a;", false, &cleanups), stage("b;", false, &cleanups)];
        let (final_path, results) = run_chain(&ctx, seed.clone(), &stages).await.unwrap();

        assert_eq!(
            tokio::fs::read(&final_path).await.unwrap(),
            b"seed;a;b;".to_vec()
        );
        assert!(!seed.exists(), "seed must be deleted after stage 1");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["type"], "text_overlay");
        assert!(results[0]["output_path"].as_str().unwrap().ends_with(".mp4"));

        // Only the final output remains in the workdir chain.
        let remaining: Vec<_> = std::fs::read_dir(&ctx.workdir)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(remaining.len(), 1);

        // Overall progress is monotone and scaled per stage.
        let progress = seen.lock().unwrap().clone();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
        assert!(progress.contains(&25.0));
        assert!(progress.contains(&75.0));
        assert_eq!(*progress.last().unwrap(), 100.0);
    }

    #[tokio::test]
    async fn failure_rolls_back_every_intermediate_and_runs_cleanup() {
        let (_dir, ctx, _seen) = context().await;
        let cleanups = Arc::new(AtomicUsize::new(0));
        let seed = ctx.workdir.join("seed.mp4");
        tokio::fs::write(&seed, b"seed;").await.unwrap();

        let stages = vec![
            stage("a;", false, &cleanups),
            stage("b;", true, &cleanups),
            stage("c;", false, &cleanups),
        ];
        let err = run_chain(&ctx, seed.clone(), &stages).await.unwrap_err();
        assert!(matches!(err, Error::Processing { .. }));

        // Both instantiated stages were cleaned up; the third never started.
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);

        let remaining: Vec<_> = std::fs::read_dir(&ctx.workdir)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(
            remaining.is_empty(),
            "workdir must be empty after rollback, found {remaining:?}"
        );
    }

    #[tokio::test]
    async fn too_few_operations_fail_validation() {
        let processor = CombinedProcessor::new(CombinedConfig {
            base_file_id: 1,
            operations: vec![],
        });
        let (_dir, ctx, _seen) = context().await;
        assert!(processor.validate(&ctx).await.is_err());
    }
}
