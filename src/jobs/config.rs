//! Typed job configurations. The persisted form is a JSON column keyed by the
//! job's `type`; this module is the tagged in-memory form plus per-variant
//! validation. Unknown keys are rejected at deserialization.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::JobType;
use crate::error::{Error, Result};

static COLOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#[0-9a-fA-F]{6}$").unwrap());

fn check_color(field: &str, value: &str) -> Result<()> {
    if COLOR_RE.is_match(value) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "{field} must be a #RRGGBB color, got {value:?}"
        )))
    }
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "{field} must be within [{min}, {max}], got {value}"
        )))
    }
}

fn default_volume() -> f64 {
    1.0
}

fn default_opacity() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobConfig {
    Join(JoinConfig),
    AudioOverlay(AudioOverlayConfig),
    TextOverlay(TextOverlayConfig),
    Subtitles(SubtitlesConfig),
    VideoOverlay(VideoOverlayConfig),
    Combined(CombinedConfig),
}

impl JobConfig {
    /// Decode the persisted config for a job of the given type. Any schema
    /// mismatch (missing key, wrong type, unrecognized key) is a validation
    /// failure surfaced to the user.
    pub fn from_value(job_type: JobType, value: &serde_json::Value) -> Result<JobConfig> {
        let decode = |e: serde_json::Error| {
            Error::validation(format!("invalid {job_type} config: {e}"))
        };
        Ok(match job_type {
            JobType::Join => JobConfig::Join(serde_json::from_value(value.clone()).map_err(decode)?),
            JobType::AudioOverlay => {
                JobConfig::AudioOverlay(serde_json::from_value(value.clone()).map_err(decode)?)
            }
            JobType::TextOverlay => {
                JobConfig::TextOverlay(serde_json::from_value(value.clone()).map_err(decode)?)
            }
            JobType::Subtitles => {
                JobConfig::Subtitles(serde_json::from_value(value.clone()).map_err(decode)?)
            }
            JobType::VideoOverlay => {
                JobConfig::VideoOverlay(serde_json::from_value(value.clone()).map_err(decode)?)
            }
            JobType::Combined => {
                JobConfig::Combined(serde_json::from_value(value.clone()).map_err(decode)?)
            }
        })
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobConfig::Join(_) => JobType::Join,
            JobConfig::AudioOverlay(_) => JobType::AudioOverlay,
            JobConfig::TextOverlay(_) => JobType::TextOverlay,
            JobConfig::Subtitles(_) => JobType::Subtitles,
            JobConfig::VideoOverlay(_) => JobType::VideoOverlay,
            JobConfig::Combined(_) => JobType::Combined,
        }
    }

    /// Semantic range checks. `standalone` is false when the config belongs
    /// to a pipeline stage, where the primary input is the chained file and
    /// its id key may be absent.
    pub fn validate(&self, standalone: bool) -> Result<()> {
        match self {
            JobConfig::Join(c) => c.validate(standalone),
            JobConfig::AudioOverlay(c) => c.validate(standalone),
            JobConfig::TextOverlay(c) => c.validate(standalone),
            JobConfig::Subtitles(c) => c.validate(standalone),
            JobConfig::VideoOverlay(c) => c.validate(standalone),
            JobConfig::Combined(c) => c.validate(standalone),
        }
    }

    /// Every asset id referenced by this config, in declaration order,
    /// without duplicates. Used to populate the job's `input_file_ids`.
    pub fn input_file_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = Vec::new();
        let mut push = |id: Option<i64>| {
            if let Some(id) = id
                && !ids.contains(&id)
            {
                ids.push(id);
            }
        };
        match self {
            JobConfig::Join(c) => {
                for id in &c.file_ids {
                    push(Some(*id));
                }
            }
            JobConfig::AudioOverlay(c) => {
                push(c.video_file_id);
                push(Some(c.audio_file_id));
            }
            JobConfig::TextOverlay(c) => push(c.video_file_id),
            JobConfig::Subtitles(c) => {
                push(c.video_file_id);
                push(c.subtitle_file_id);
            }
            JobConfig::VideoOverlay(c) => {
                push(c.base_video_file_id);
                push(Some(c.overlay_video_file_id));
            }
            JobConfig::Combined(c) => {
                push(Some(c.base_file_id));
                for op in &c.operations {
                    if let Ok(stage) = JobConfig::from_value(op.op_type, &op.config) {
                        for id in stage.input_file_ids() {
                            push(Some(id));
                        }
                    }
                }
            }
        }
        ids
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinConfig {
    pub file_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_filename: Option<String>,
    #[serde(default)]
    pub re_encode: bool,
}

impl JoinConfig {
    fn validate(&self, standalone: bool) -> Result<()> {
        let min = if standalone { 2 } else { 1 };
        if self.file_ids.len() < min {
            return Err(Error::validation(format!(
                "join requires at least {min} input files, got {}",
                self.file_ids.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    Replace,
    Mix,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioOverlayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_file_id: Option<i64>,
    pub audio_file_id: i64,
    pub mode: AudioMode,
    #[serde(default)]
    pub offset: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default = "default_volume")]
    pub original_volume: f64,
    #[serde(default = "default_volume")]
    pub overlay_volume: f64,
}

impl AudioOverlayConfig {
    fn validate(&self, standalone: bool) -> Result<()> {
        if standalone && self.video_file_id.is_none() {
            return Err(Error::validation("audio_overlay requires video_file_id"));
        }
        if !self.offset.is_finite() || self.offset < 0.0 {
            return Err(Error::validation("offset must be >= 0"));
        }
        if let Some(d) = self.duration
            && (!d.is_finite() || d <= 0.0)
        {
            return Err(Error::validation("duration must be > 0"));
        }
        check_range("original_volume", self.original_volume, 0.0, 2.0)?;
        check_range("overlay_volume", self.overlay_volume, 0.0, 2.0)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionKind {
    Absolute,
    Relative,
}

/// One of the nine relative anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Anchor {
    TopLeft,
    TopCenter,
    TopRight,
    CenterLeft,
    Center,
    CenterRight,
    BottomLeft,
    BottomCenter,
    BottomRight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextPosition {
    #[serde(rename = "type")]
    pub kind: PositionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Anchor>,
    #[serde(default)]
    pub margin_x: i32,
    #[serde(default)]
    pub margin_y: i32,
}

impl TextPosition {
    fn validate(&self) -> Result<()> {
        match self.kind {
            PositionKind::Absolute if self.x.is_none() || self.y.is_none() => Err(
                Error::validation("absolute position requires both x and y"),
            ),
            PositionKind::Relative if self.position.is_none() => {
                Err(Error::validation("relative position requires an anchor"))
            }
            _ => Ok(()),
        }
    }
}

fn default_font_family() -> String {
    "Sans".to_string()
}

fn default_font_weight() -> String {
    "normal".to_string()
}

fn default_font_size() -> u32 {
    24
}

fn default_white() -> String {
    "#FFFFFF".to_string()
}

fn default_black() -> String {
    "#000000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextStyle {
    #[serde(default = "default_font_family")]
    pub font_family: String,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default = "default_font_weight")]
    pub font_weight: String,
    #[serde(default = "default_white")]
    pub color: String,
    #[serde(default = "default_opacity")]
    pub alpha: f64,
}

impl TextStyle {
    fn validate(&self) -> Result<()> {
        if !(8..=200).contains(&self.font_size) {
            return Err(Error::validation(format!(
                "font_size must be within [8, 200], got {}",
                self.font_size
            )));
        }
        check_color("color", &self.color)?;
        check_range("alpha", self.alpha, 0.0, 1.0)
    }
}

fn default_bg_alpha() -> f64 {
    0.5
}

fn default_bg_padding() -> u32 {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackgroundStyle {
    #[serde(default = "default_black")]
    pub color: String,
    #[serde(default = "default_bg_alpha")]
    pub alpha: f64,
    #[serde(default = "default_bg_padding")]
    pub padding: u32,
    #[serde(default)]
    pub radius: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BorderStyle {
    pub width: u32,
    #[serde(default = "default_black")]
    pub color: String,
}

fn default_shadow_offset() -> i32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShadowStyle {
    #[serde(default = "default_shadow_offset")]
    pub offset_x: i32,
    #[serde(default = "default_shadow_offset")]
    pub offset_y: i32,
    #[serde(default)]
    pub blur: u32,
    #[serde(default = "default_black")]
    pub color: String,
    #[serde(default = "default_bg_alpha")]
    pub alpha: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnimationKind {
    None,
    FadeIn,
    FadeOut,
    Fade,
    SlideLeft,
    SlideRight,
    SlideUp,
    SlideDown,
    ZoomIn,
    ZoomOut,
}

fn default_animation_duration() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Animation {
    #[serde(rename = "type")]
    pub kind: AnimationKind,
    #[serde(default = "default_animation_duration")]
    pub duration: f64,
    #[serde(default)]
    pub delay: f64,
}

impl Animation {
    fn validate(&self) -> Result<()> {
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(Error::validation("animation duration must be > 0"));
        }
        if !self.delay.is_finite() || self.delay < 0.0 {
            return Err(Error::validation("animation delay must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextOverlayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_file_id: Option<i64>,
    pub text: String,
    pub position: TextPosition,
    pub style: TextStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<BackgroundStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub border: Option<BorderStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow: Option<ShadowStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation: Option<Animation>,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
}

impl TextOverlayConfig {
    fn validate(&self, standalone: bool) -> Result<()> {
        if standalone && self.video_file_id.is_none() {
            return Err(Error::validation("text_overlay requires video_file_id"));
        }
        if self.text.is_empty() || self.text.chars().count() > 1000 {
            return Err(Error::validation(
                "text must be between 1 and 1000 characters",
            ));
        }
        self.position.validate()?;
        self.style.validate()?;
        if let Some(bg) = &self.background {
            check_color("background.color", &bg.color)?;
            check_range("background.alpha", bg.alpha, 0.0, 1.0)?;
        }
        if let Some(border) = &self.border {
            check_color("border.color", &border.color)?;
        }
        if let Some(shadow) = &self.shadow {
            check_color("shadow.color", &shadow.color)?;
            check_range("shadow.alpha", shadow.alpha, 0.0, 1.0)?;
        }
        if let Some(anim) = &self.animation {
            anim.validate()?;
        }
        check_range("rotation", self.rotation, -360.0, 360.0)?;
        check_range("opacity", self.opacity, 0.0, 1.0)?;
        if !self.start_time.is_finite() || self.start_time < 0.0 {
            return Err(Error::validation("start_time must be >= 0"));
        }
        if let Some(end) = self.end_time
            && (!end.is_finite() || end <= self.start_time)
        {
            return Err(Error::validation("end_time must be after start_time"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtitleFormat {
    #[serde(rename = "SRT")]
    Srt,
    #[serde(rename = "VTT")]
    Vtt,
    #[serde(rename = "ASS")]
    Ass,
    #[serde(rename = "SSA")]
    Ssa,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InlineCue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

fn default_sub_font_size() -> u32 {
    24
}

fn default_outline_width() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubtitleStyle {
    #[serde(default = "default_font_family")]
    pub font_family: String,
    #[serde(default = "default_sub_font_size")]
    pub font_size: u32,
    #[serde(default = "default_white")]
    pub color: String,
    #[serde(default = "default_black")]
    pub outline_color: String,
    #[serde(default = "default_outline_width")]
    pub outline_width: f64,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
}

impl Default for SubtitleStyle {
    fn default() -> Self {
        SubtitleStyle {
            font_family: default_font_family(),
            font_size: default_sub_font_size(),
            color: default_white(),
            outline_color: default_black(),
            outline_width: default_outline_width(),
            bold: false,
            italic: false,
        }
    }
}

fn default_sub_margin() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubtitlePosition {
    #[serde(default = "default_sub_alignment")]
    pub alignment: Anchor,
    #[serde(default = "default_sub_margin")]
    pub margin_v: u32,
}

fn default_sub_alignment() -> Anchor {
    Anchor::BottomCenter
}

impl Default for SubtitlePosition {
    fn default() -> Self {
        SubtitlePosition {
            alignment: default_sub_alignment(),
            margin_v: default_sub_margin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubtitlesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_file_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_file_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_text: Option<Vec<InlineCue>>,
    pub format: SubtitleFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<SubtitleStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<SubtitlePosition>,
}

impl SubtitlesConfig {
    fn validate(&self, standalone: bool) -> Result<()> {
        if standalone && self.video_file_id.is_none() {
            return Err(Error::validation("subtitles requires video_file_id"));
        }
        match (&self.subtitle_file_id, &self.subtitle_text) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(Error::validation(
                    "exactly one of subtitle_file_id and subtitle_text is required",
                ));
            }
            _ => {}
        }
        if let Some(cues) = &self.subtitle_text {
            if cues.is_empty() {
                return Err(Error::validation("subtitle_text must not be empty"));
            }
            for (i, cue) in cues.iter().enumerate() {
                if !cue.start.is_finite() || cue.start < 0.0 {
                    return Err(Error::validation(format!("cue {i}: start must be >= 0")));
                }
                if !cue.end.is_finite() || cue.end <= cue.start {
                    return Err(Error::validation(format!(
                        "cue {i}: end must be after start"
                    )));
                }
            }
        }
        if let Some(style) = &self.style {
            if !(8..=200).contains(&style.font_size) {
                return Err(Error::validation("subtitle font_size must be in [8, 200]"));
            }
            check_color("style.color", &style.color)?;
            check_color("style.outline_color", &style.outline_color)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayShape {
    Rectangle,
    Circle,
    Rounded,
}

fn default_shape() -> OverlayShape {
    OverlayShape::Rectangle
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverlayGeometry {
    pub x: i32,
    pub y: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default = "default_shape")]
    pub shape: OverlayShape,
    #[serde(default)]
    pub border_radius: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VideoOverlayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_video_file_id: Option<i64>,
    pub overlay_video_file_id: i64,
    pub config: OverlayGeometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub border: Option<BorderStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow: Option<ShadowStyle>,
}

impl VideoOverlayConfig {
    fn validate(&self, standalone: bool) -> Result<()> {
        if standalone && self.base_video_file_id.is_none() {
            return Err(Error::validation("video_overlay requires base_video_file_id"));
        }
        let geom = &self.config;
        if geom.width.is_some() != geom.height.is_some() {
            return Err(Error::validation(
                "width and height must be given together",
            ));
        }
        if geom.width.is_some() && geom.scale.is_some() {
            return Err(Error::validation(
                "width/height and scale are mutually exclusive",
            ));
        }
        if let Some(scale) = geom.scale
            && (!scale.is_finite() || scale <= 0.0 || scale > 1.0)
        {
            return Err(Error::validation("scale must be within (0, 1]"));
        }
        check_range("opacity", geom.opacity, 0.0, 1.0)?;
        if let (Some(start), Some(end)) = (geom.start_time, geom.end_time)
            && end <= start
        {
            return Err(Error::validation("end_time must be after start_time"));
        }
        if let Some(border) = &self.border {
            check_color("border.color", &border.color)?;
        }
        if let Some(shadow) = &self.shadow {
            check_color("shadow.color", &shadow.color)?;
            check_range("shadow.alpha", shadow.alpha, 0.0, 1.0)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineOp {
    #[serde(rename = "type")]
    pub op_type: JobType,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CombinedConfig {
    pub base_file_id: i64,
    pub operations: Vec<PipelineOp>,
}

impl CombinedConfig {
    fn validate(&self, _standalone: bool) -> Result<()> {
        if !(2..=10).contains(&self.operations.len()) {
            return Err(Error::validation(format!(
                "combined requires 2 to 10 operations, got {}",
                self.operations.len()
            )));
        }
        for (i, op) in self.operations.iter().enumerate() {
            if op.op_type == JobType::Combined {
                return Err(Error::validation(format!(
                    "operation {i}: combined operations cannot be nested"
                )));
            }
            JobConfig::from_value(op.op_type, &op.config)?.validate(false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_config_rejects_unknown_keys() {
        let err = JobConfig::from_value(
            JobType::Join,
            &json!({"file_ids": [1, 2], "quality": "high"}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "got {err}");
    }

    #[test]
    fn join_needs_two_inputs_standalone_but_one_as_stage() {
        let cfg = JobConfig::from_value(JobType::Join, &json!({"file_ids": [7]})).unwrap();
        assert!(cfg.validate(true).is_err());
        assert!(cfg.validate(false).is_ok());
    }

    #[test]
    fn audio_overlay_defaults_and_ranges() {
        let cfg = JobConfig::from_value(
            JobType::AudioOverlay,
            &json!({"video_file_id": 1, "audio_file_id": 2, "mode": "mix"}),
        )
        .unwrap();
        let JobConfig::AudioOverlay(c) = &cfg else {
            panic!("wrong variant");
        };
        assert_eq!(c.original_volume, 1.0);
        assert_eq!(c.overlay_volume, 1.0);
        assert_eq!(c.offset, 0.0);
        cfg.validate(true).unwrap();

        let bad = JobConfig::from_value(
            JobType::AudioOverlay,
            &json!({"video_file_id": 1, "audio_file_id": 2, "mode": "mix", "overlay_volume": 2.5}),
        )
        .unwrap();
        assert!(bad.validate(true).is_err());
    }

    #[test]
    fn text_overlay_validates_position_and_style() {
        let base = json!({
            "video_file_id": 1,
            "text": "Hello, World",
            "position": {"type": "relative", "position": "bottom-center", "margin_x": 10, "margin_y": 10},
            "style": {"font_family": "Arial", "font_size": 48, "font_weight": "bold", "color": "#FFFFFF", "alpha": 1.0},
            "animation": {"type": "fade-in", "duration": 1.0},
            "start_time": 0.0,
            "end_time": 5.0
        });
        let cfg = JobConfig::from_value(JobType::TextOverlay, &base).unwrap();
        cfg.validate(true).unwrap();

        let mut missing_xy = base.clone();
        missing_xy["position"] = json!({"type": "absolute"});
        let cfg = JobConfig::from_value(JobType::TextOverlay, &missing_xy).unwrap();
        assert!(cfg.validate(true).is_err());

        let mut bad_color = base.clone();
        bad_color["style"]["color"] = json!("white");
        let cfg = JobConfig::from_value(JobType::TextOverlay, &bad_color).unwrap();
        assert!(cfg.validate(true).is_err());

        let mut bad_size = base;
        bad_size["style"]["font_size"] = json!(300);
        let cfg = JobConfig::from_value(JobType::TextOverlay, &bad_size).unwrap();
        assert!(cfg.validate(true).is_err());
    }

    #[test]
    fn subtitles_requires_exactly_one_source() {
        let both = json!({
            "video_file_id": 1,
            "subtitle_file_id": 2,
            "subtitle_text": [{"start": 0.0, "end": 1.0, "text": "hi"}],
            "format": "SRT"
        });
        let cfg = JobConfig::from_value(JobType::Subtitles, &both).unwrap();
        assert!(cfg.validate(true).is_err());

        let neither = json!({"video_file_id": 1, "format": "SRT"});
        let cfg = JobConfig::from_value(JobType::Subtitles, &neither).unwrap();
        assert!(cfg.validate(true).is_err());

        let inline = json!({
            "video_file_id": 1,
            "subtitle_text": [{"start": 0.0, "end": 1.5, "text": "hi"}],
            "format": "VTT"
        });
        let cfg = JobConfig::from_value(JobType::Subtitles, &inline).unwrap();
        cfg.validate(true).unwrap();
    }

    #[test]
    fn video_overlay_geometry_is_checked() {
        let good = json!({
            "base_video_file_id": 1,
            "overlay_video_file_id": 2,
            "config": {"x": 10, "y": 10, "scale": 0.25, "shape": "circle"}
        });
        JobConfig::from_value(JobType::VideoOverlay, &good)
            .unwrap()
            .validate(true)
            .unwrap();

        let conflicting = json!({
            "base_video_file_id": 1,
            "overlay_video_file_id": 2,
            "config": {"x": 0, "y": 0, "width": 320, "height": 180, "scale": 0.5}
        });
        assert!(
            JobConfig::from_value(JobType::VideoOverlay, &conflicting)
                .unwrap()
                .validate(true)
                .is_err()
        );
    }

    #[test]
    fn combined_bounds_and_nesting() {
        let one_op = json!({
            "base_file_id": 1,
            "operations": [
                {"type": "text_overlay", "config": {
                    "text": "x",
                    "position": {"type": "relative", "position": "center"},
                    "style": {}
                }}
            ]
        });
        assert!(
            JobConfig::from_value(JobType::Combined, &one_op)
                .unwrap()
                .validate(true)
                .is_err()
        );

        let nested = json!({
            "base_file_id": 1,
            "operations": [
                {"type": "combined", "config": {"base_file_id": 2, "operations": []}},
                {"type": "join", "config": {"file_ids": [3]}}
            ]
        });
        assert!(
            JobConfig::from_value(JobType::Combined, &nested)
                .unwrap()
                .validate(true)
                .is_err()
        );
    }

    #[test]
    fn input_file_ids_are_ordered_and_unique() {
        let cfg = JobConfig::from_value(
            JobType::Combined,
            &json!({
                "base_file_id": 5,
                "operations": [
                    {"type": "audio_overlay", "config": {"audio_file_id": 9, "mode": "replace"}},
                    {"type": "join", "config": {"file_ids": [5, 7]}}
                ]
            }),
        )
        .unwrap();
        assert_eq!(cfg.input_file_ids(), vec![5, 9, 7]);
    }
}
