//! ffprobe invocation and JSON output parsing.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;

use crate::domain::MediaInfo;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeFormat {
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub bit_rate: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeStream {
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub avg_frame_rate: Option<String>,
    #[serde(default)]
    pub r_frame_rate: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeOutput {
    #[serde(default)]
    pub format: ProbeFormat,
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
        }
    }
}

/// Parse an ffprobe rational like `30000/1001`, or a plain number.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        if den == 0.0 {
            return None;
        }
        let value = num / den;
        return (value.is_finite() && value > 0.0).then_some(value);
    }
    raw.trim().parse().ok().filter(|v: &f64| v.is_finite() && *v > 0.0)
}

impl ProbeOutput {
    pub fn stream(&self, kind: StreamKind) -> Option<&ProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(kind.as_str()))
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.format
            .duration
            .as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0)
            .or_else(|| {
                self.stream(StreamKind::Video)
                    .and_then(|s| s.duration.as_deref())
                    .and_then(|d| d.trim().parse().ok())
            })
    }

    pub fn media_info(&self) -> MediaInfo {
        let video = self.stream(StreamKind::Video);
        let audio = self.stream(StreamKind::Audio);
        MediaInfo {
            duration_seconds: self.duration_seconds(),
            width: video.and_then(|s| s.width),
            height: video.and_then(|s| s.height),
            frame_rate: video.and_then(|s| {
                s.avg_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .or_else(|| s.r_frame_rate.as_deref().and_then(parse_frame_rate))
            }),
            video_codec: video.and_then(|s| s.codec_name.clone()),
            audio_codec: audio.and_then(|s| s.codec_name.clone()),
            bit_rate: self
                .format
                .bit_rate
                .as_deref()
                .and_then(|b| b.trim().parse().ok()),
        }
    }
}

#[derive(Clone)]
pub struct Prober {
    ffprobe: PathBuf,
}

impl Prober {
    pub fn new(ffprobe: PathBuf) -> Prober {
        Prober { ffprobe }
    }

    pub async fn probe(&self, path: &Path) -> Result<ProbeOutput> {
        let output = Command::new(&self.ffprobe)
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(path.as_os_str())
            .output()
            .await
            .map_err(|e| Error::validation(format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            return Err(Error::validation(format!(
                "ffprobe failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::validation(format!("unparseable ffprobe output for {}: {e}", path.display()))
        })
    }

    /// Probe and require at least one stream of the expected kind.
    pub async fn validate_media(&self, path: &Path, kind: StreamKind) -> Result<ProbeOutput> {
        let probed = self.probe(path).await?;
        if probed.stream(kind).is_none() {
            return Err(Error::validation(format!(
                "{} has no {} stream",
                path.display(),
                kind.as_str()
            )));
        }
        Ok(probed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "h264", "width": 640, "height": 480,
             "avg_frame_rate": "30000/1001", "duration": "5.005000"},
            {"codec_type": "audio", "codec_name": "aac", "avg_frame_rate": "0/0"}
        ],
        "format": {"duration": "5.023000", "bit_rate": "1205959"}
    }"#;

    #[test]
    fn parses_ffprobe_json_into_media_info() {
        let probed: ProbeOutput = serde_json::from_str(SAMPLE).unwrap();
        let info = probed.media_info();
        assert_eq!(info.width, Some(640));
        assert_eq!(info.height, Some(480));
        assert_eq!(info.video_codec.as_deref(), Some("h264"));
        assert_eq!(info.audio_codec.as_deref(), Some("aac"));
        assert_eq!(info.bit_rate, Some(1_205_959));
        assert!((info.duration_seconds.unwrap() - 5.023).abs() < 1e-9);
        assert!((info.frame_rate.unwrap() - 29.97).abs() < 0.01);
    }

    #[test]
    fn frame_rate_rationals() {
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn stream_lookup_by_kind() {
        let probed: ProbeOutput = serde_json::from_str(SAMPLE).unwrap();
        assert!(probed.stream(StreamKind::Video).is_some());
        assert!(probed.stream(StreamKind::Audio).is_some());

        let no_audio: ProbeOutput =
            serde_json::from_str(r#"{"streams": [{"codec_type": "video"}], "format": {}}"#)
                .unwrap();
        assert!(no_audio.stream(StreamKind::Audio).is_none());
    }

    #[test]
    fn duration_falls_back_to_the_video_stream() {
        let probed: ProbeOutput = serde_json::from_str(
            r#"{"streams": [{"codec_type": "video", "duration": "7.5"}], "format": {}}"#,
        )
        .unwrap();
        assert_eq!(probed.duration_seconds(), Some(7.5));
    }
}
