//! Encoder tuning: presets, tunes, CRF, and hardware-acceleration selection.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodePreset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl EncodePreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodePreset::Ultrafast => "ultrafast",
            EncodePreset::Superfast => "superfast",
            EncodePreset::Veryfast => "veryfast",
            EncodePreset::Faster => "faster",
            EncodePreset::Fast => "fast",
            EncodePreset::Medium => "medium",
            EncodePreset::Slow => "slow",
            EncodePreset::Slower => "slower",
            EncodePreset::Veryslow => "veryslow",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tune {
    Film,
    Animation,
    Grain,
    Stillimage,
    Fastdecode,
    Zerolatency,
}

impl Tune {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tune::Film => "film",
            Tune::Animation => "animation",
            Tune::Grain => "grain",
            Tune::Stillimage => "stillimage",
            Tune::Fastdecode => "fastdecode",
            Tune::Zerolatency => "zerolatency",
        }
    }
}

/// Coarse-grained scenario presets exposed to configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioPreset {
    Fast,
    Balanced,
    Quality,
}

impl ScenarioPreset {
    pub fn parse(s: &str) -> Option<ScenarioPreset> {
        match s {
            "fast" => Some(ScenarioPreset::Fast),
            "balanced" => Some(ScenarioPreset::Balanced),
            "quality" => Some(ScenarioPreset::Quality),
            _ => None,
        }
    }

    pub fn settings(&self) -> EncodeSettings {
        match self {
            ScenarioPreset::Fast => EncodeSettings {
                preset: EncodePreset::Veryfast,
                tune: Some(Tune::Fastdecode),
                crf: 23,
                threads: None,
                hwaccel: None,
            },
            ScenarioPreset::Balanced => EncodeSettings {
                preset: EncodePreset::Fast,
                tune: Some(Tune::Film),
                crf: 23,
                threads: None,
                hwaccel: None,
            },
            ScenarioPreset::Quality => EncodeSettings {
                preset: EncodePreset::Medium,
                tune: Some(Tune::Film),
                crf: 18,
                threads: None,
                hwaccel: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwAccel {
    Nvenc,
    Qsv,
    Vaapi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwAccelPreference {
    Auto,
    None,
    Force(HwAccel),
}

impl HwAccelPreference {
    pub fn parse(s: &str) -> HwAccelPreference {
        match s {
            "none" => HwAccelPreference::None,
            "nvenc" => HwAccelPreference::Force(HwAccel::Nvenc),
            "qsv" => HwAccelPreference::Force(HwAccel::Qsv),
            "vaapi" => HwAccelPreference::Force(HwAccel::Vaapi),
            _ => HwAccelPreference::Auto,
        }
    }
}

/// Ask ffmpeg which acceleration methods this host offers.
pub async fn detect_hwaccels(ffmpeg: &Path) -> Vec<HwAccel> {
    let output = match Command::new(ffmpeg)
        .arg("-hide_banner")
        .arg("-hwaccels")
        .output()
        .await
    {
        Ok(output) if output.status.success() => output,
        _ => return Vec::new(),
    };
    parse_hwaccels(&String::from_utf8_lossy(&output.stdout))
}

fn parse_hwaccels(stdout: &str) -> Vec<HwAccel> {
    let mut found = Vec::new();
    for line in stdout.lines() {
        let accel = match line.trim() {
            "cuda" | "nvenc" | "cuvid" => Some(HwAccel::Nvenc),
            "qsv" => Some(HwAccel::Qsv),
            "vaapi" => Some(HwAccel::Vaapi),
            _ => None,
        };
        if let Some(accel) = accel
            && !found.contains(&accel)
        {
            found.push(accel);
        }
    }
    found
}

pub fn resolve_hwaccel(pref: HwAccelPreference, available: &[HwAccel]) -> Option<HwAccel> {
    match pref {
        HwAccelPreference::None => None,
        HwAccelPreference::Force(accel) => available.contains(&accel).then_some(accel),
        HwAccelPreference::Auto => [HwAccel::Nvenc, HwAccel::Qsv, HwAccel::Vaapi]
            .into_iter()
            .find(|a| available.contains(a)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeSettings {
    pub preset: EncodePreset,
    pub tune: Option<Tune>,
    pub crf: u32,
    pub threads: Option<u32>,
    pub hwaccel: Option<HwAccel>,
}

impl EncodeSettings {
    pub fn with_hwaccel(mut self, hwaccel: Option<HwAccel>) -> EncodeSettings {
        self.hwaccel = hwaccel;
        self
    }

    /// Video encoder arguments. Quality flags follow each encoder's own rate
    /// control vocabulary: CRF for libx264, CQ for nvenc, global_quality for
    /// qsv, QP for vaapi.
    pub fn video_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        match self.hwaccel {
            None => {
                args.push("-c:v".to_string());
                args.push("libx264".to_string());
                args.push("-preset".to_string());
                args.push(self.preset.as_str().to_string());
                if let Some(tune) = self.tune {
                    args.push("-tune".to_string());
                    args.push(tune.as_str().to_string());
                }
                args.push("-crf".to_string());
                args.push(self.crf.to_string());
            }
            Some(HwAccel::Nvenc) => {
                args.push("-c:v".to_string());
                args.push("h264_nvenc".to_string());
                args.push("-preset".to_string());
                args.push(self.preset.as_str().to_string());
                args.push("-cq".to_string());
                args.push(self.crf.to_string());
            }
            Some(HwAccel::Qsv) => {
                args.push("-c:v".to_string());
                args.push("h264_qsv".to_string());
                args.push("-global_quality".to_string());
                args.push(self.crf.to_string());
            }
            Some(HwAccel::Vaapi) => {
                args.push("-c:v".to_string());
                args.push("h264_vaapi".to_string());
                args.push("-qp".to_string());
                args.push(self.crf.to_string());
            }
        }
        if let Some(threads) = self.threads {
            args.push("-threads".to_string());
            args.push(threads.to_string());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_presets_match_their_contract() {
        let fast = ScenarioPreset::Fast.settings();
        assert_eq!(fast.preset, EncodePreset::Veryfast);
        assert_eq!(fast.tune, Some(Tune::Fastdecode));

        let balanced = ScenarioPreset::Balanced.settings();
        assert_eq!(balanced.preset, EncodePreset::Fast);
        assert_eq!(balanced.tune, Some(Tune::Film));

        let quality = ScenarioPreset::Quality.settings();
        assert_eq!(quality.preset, EncodePreset::Medium);
        assert_eq!(quality.crf, 18);
    }

    #[test]
    fn software_video_args() {
        let args = ScenarioPreset::Quality.settings().video_args();
        assert_eq!(
            args,
            vec!["-c:v", "libx264", "-preset", "medium", "-tune", "film", "-crf", "18"]
        );
    }

    #[test]
    fn nvenc_uses_cq_rate_control() {
        let args = ScenarioPreset::Fast
            .settings()
            .with_hwaccel(Some(HwAccel::Nvenc))
            .video_args();
        assert!(args.contains(&"h264_nvenc".to_string()));
        assert!(args.contains(&"-cq".to_string()));
        assert!(!args.contains(&"-crf".to_string()));
    }

    #[test]
    fn hwaccel_detection_parses_tool_output() {
        let stdout = "Hardware acceleration methods:\nvdpau\ncuda\nvaapi\nqsv\n";
        let found = parse_hwaccels(stdout);
        assert_eq!(found, vec![HwAccel::Nvenc, HwAccel::Vaapi, HwAccel::Qsv]);
    }

    #[test]
    fn preference_resolution() {
        let available = [HwAccel::Qsv, HwAccel::Vaapi];
        assert_eq!(
            resolve_hwaccel(HwAccelPreference::Auto, &available),
            Some(HwAccel::Qsv)
        );
        assert_eq!(resolve_hwaccel(HwAccelPreference::None, &available), None);
        assert_eq!(
            resolve_hwaccel(HwAccelPreference::Force(HwAccel::Nvenc), &available),
            None
        );
        assert_eq!(
            resolve_hwaccel(HwAccelPreference::Force(HwAccel::Vaapi), &available),
            Some(HwAccel::Vaapi)
        );
    }
}
