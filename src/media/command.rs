//! ffmpeg execution: bounded wall-clock limits with a graceful soft stop,
//! stderr capture, and progress parsing.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Bounded tail of tool stderr kept for diagnostics on failure.
pub const MAX_STDERR_TAIL_BYTES: usize = 16 * 1024;

pub fn compute_progress_percent(total_duration: Option<f64>, elapsed_seconds: f64) -> f64 {
    match total_duration {
        Some(total) if total.is_finite() && total > 0.0 => {
            let elapsed = if elapsed_seconds.is_finite() && elapsed_seconds > 0.0 {
                elapsed_seconds
            } else {
                0.0
            };
            let value = (elapsed / total * 100.0).clamp(0.0, 100.0);
            if value.is_finite() { value } else { 0.0 }
        }
        _ => 0.0,
    }
}

/// Extract processed seconds from an ffmpeg stderr line. Handles both the
/// classic `time=HH:MM:SS.ss` stats form and the `-progress` key=value form.
pub fn parse_progress_line(line: &str) -> Option<f64> {
    for token in line.split_whitespace() {
        if let Some(rest) = token.strip_prefix("time=") {
            return Some(parse_time_to_seconds(rest));
        }
        if let Some(rest) = token.strip_prefix("out_time=") {
            return Some(parse_time_to_seconds(rest));
        }
        if let Some(rest) = token.strip_prefix("out_time_ms=")
            && let Ok(us) = rest.parse::<f64>()
        {
            return Some(us / 1_000_000.0);
        }
    }
    None
}

pub fn is_progress_end(line: &str) -> bool {
    line.split_whitespace()
        .any(|token| token.strip_prefix("progress=") == Some("end"))
}

pub fn parse_time_to_seconds(s: &str) -> f64 {
    if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() == 3 {
            let h = parts[0].parse::<f64>().unwrap_or(0.0);
            let m = parts[1].parse::<f64>().unwrap_or(0.0);
            let sec = parts[2].parse::<f64>().unwrap_or(0.0);
            return h * 3600.0 + m * 60.0 + sec;
        }
    }
    s.parse::<f64>().unwrap_or(0.0)
}

/// When no probe result is available, infer the total duration from ffmpeg's
/// own `Duration: HH:MM:SS.xx,` metadata header.
pub fn parse_duration_from_metadata_line(line: &str) -> Option<f64> {
    let idx = line.find("Duration:")?;
    let rest = &line[idx + "Duration:".len()..];
    let time_str = rest.trim().split(',').next().unwrap_or("").trim();
    if time_str.is_empty() {
        return None;
    }
    let seconds = parse_time_to_seconds(time_str);
    (seconds > 0.0).then_some(seconds)
}

/// Human-readable command line with quoted arguments, for logs.
pub fn render_command(program: &Path, args: &[String]) -> String {
    let mut out = format!("{}", program.display());
    for arg in args {
        if arg.contains(' ') || arg.contains('\'') {
            out.push_str(&format!(" \"{arg}\""));
        } else {
            out.push(' ');
            out.push_str(arg);
        }
    }
    out
}

struct StderrTail {
    lines: std::collections::VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn new() -> StderrTail {
        StderrTail {
            lines: std::collections::VecDeque::new(),
            bytes: 0,
        }
    }

    fn push(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > MAX_STDERR_TAIL_BYTES {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
            } else {
                break;
            }
        }
    }

    fn join(&self) -> String {
        self.lines
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Clone)]
pub struct FfmpegRunner {
    ffmpeg: PathBuf,
    soft_limit: Duration,
    hard_limit: Duration,
}

impl FfmpegRunner {
    pub fn new(ffmpeg: PathBuf, soft_limit: Duration, hard_limit: Duration) -> FfmpegRunner {
        FfmpegRunner {
            ffmpeg,
            soft_limit,
            hard_limit,
        }
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg
    }

    /// Run ffmpeg to completion. Progress is derived from stderr against the
    /// known total duration and reported monotonically through `on_progress`
    /// (capped just under 100; completion is the caller's call). At the soft
    /// limit the child is asked to finish gracefully via `q` on stdin; at the
    /// hard limit, and on cancellation, it is killed.
    pub async fn run(
        &self,
        args: &[String],
        total_duration: Option<f64>,
        cancel: &CancellationToken,
        on_progress: &mut (dyn FnMut(f64) + Send),
    ) -> Result<()> {
        let mut full_args: Vec<String> = vec![
            "-hide_banner".to_string(),
            "-y".to_string(),
            "-progress".to_string(),
            "pipe:2".to_string(),
        ];
        full_args.extend_from_slice(args);
        tracing::debug!(command = %render_command(&self.ffmpeg, &full_args), "running ffmpeg");

        let mut child = Command::new(&self.ffmpeg)
            .args(&full_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::processing(format!("failed to spawn ffmpeg: {e}"), ""))?;

        let mut stderr = child.stderr.take().expect("stderr piped");
        let mut stdin = child.stdin.take();

        let started = Instant::now();
        let soft_deadline = started + self.soft_limit;
        let hard_deadline = started + self.hard_limit;
        let mut soft_sent = false;

        let mut tail = StderrTail::new();
        let mut total = total_duration;
        let mut last_percent: f64 = 0.0;
        let mut acc: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8192];

        let mut handle_line = |line: &str,
                               tail: &mut StderrTail,
                               total: &mut Option<f64>,
                               last_percent: &mut f64,
                               on_progress: &mut (dyn FnMut(f64) + Send)| {
            tail.push(line);
            if total.is_none()
                && let Some(d) = parse_duration_from_metadata_line(line)
            {
                *total = Some(d);
            }
            if let Some(elapsed) = parse_progress_line(line) {
                let mut percent = compute_progress_percent(*total, elapsed);
                if percent >= 100.0 {
                    percent = 99.9;
                }
                if percent > *last_percent {
                    *last_percent = percent;
                    on_progress(percent);
                }
            }
        };

        let eof = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep_until(hard_deadline) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(Error::Timeout(self.hard_limit.as_secs()));
                }
                _ = tokio::time::sleep_until(soft_deadline), if !soft_sent => {
                    if let Some(stdin) = stdin.as_mut() {
                        let _ = stdin.write_all(b"q\n").await;
                        let _ = stdin.flush().await;
                    }
                    soft_sent = true;
                }
                read = tokio::io::AsyncReadExt::read(&mut stderr, &mut buf) => {
                    match read {
                        Ok(0) => break true,
                        Ok(n) => {
                            acc.extend_from_slice(&buf[..n]);
                            while let Some(pos) = acc.iter().position(|b| *b == b'\n' || *b == b'\r') {
                                let line: Vec<u8> = acc.drain(..=pos).collect();
                                let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                                handle_line(&line, &mut tail, &mut total, &mut last_percent, on_progress);
                            }
                        }
                        Err(_) => break false,
                    }
                }
            }
        };

        if eof && !acc.is_empty() {
            let line = String::from_utf8_lossy(&acc).to_string();
            handle_line(&line, &mut tail, &mut total, &mut last_percent, on_progress);
        }

        let remaining = hard_deadline.saturating_duration_since(Instant::now());
        let status = match tokio::time::timeout(remaining, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(Error::Timeout(self.hard_limit.as_secs()));
            }
        };

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if soft_sent {
            // The child was asked to stop at the soft limit; whatever it
            // produced is a truncated artifact, not a result.
            return Err(Error::Timeout(self.soft_limit.as_secs()));
        }
        if !status.success() {
            let code_desc = status
                .code()
                .map_or_else(|| "terminated by signal".to_string(), |c| format!("exit code {c}"));
            return Err(Error::Processing {
                message: format!("ffmpeg exited with non-zero status ({code_desc})"),
                stderr_tail: tail.join(),
            });
        }
        Ok(())
    }
}
