//! Subtitle parsing (SRT, WebVTT, ASS/SSA) into a canonical cue list, ASS
//! style synthesis, and the burn-in filter.

use crate::error::{Error, Result};
use crate::jobs::config::{
    Anchor, InlineCue, SubtitleFormat, SubtitlePosition, SubtitleStyle,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
    pub layer: Option<i32>,
    pub style: Option<String>,
    pub margin_l: Option<i32>,
    pub margin_r: Option<i32>,
    pub margin_v: Option<i32>,
}

impl Cue {
    fn plain(start_s: f64, end_s: f64, text: String) -> Cue {
        Cue {
            start_s,
            end_s,
            text,
            layer: None,
            style: None,
            margin_l: None,
            margin_r: None,
            margin_v: None,
        }
    }
}

pub fn parse(format: SubtitleFormat, content: &str) -> Result<Vec<Cue>> {
    let cues = match format {
        SubtitleFormat::Srt => parse_srt(content)?,
        SubtitleFormat::Vtt => parse_vtt(content)?,
        SubtitleFormat::Ass | SubtitleFormat::Ssa => parse_ass(content)?,
    };
    if cues.is_empty() {
        return Err(Error::validation("subtitle file contains no cues"));
    }
    Ok(cues)
}

pub fn cues_from_inline(cues: &[InlineCue]) -> Vec<Cue> {
    cues.iter()
        .map(|c| Cue::plain(c.start, c.end, c.text.clone()))
        .collect()
}

/// `HH:MM:SS,mmm`
fn parse_srt_time(raw: &str) -> Result<f64> {
    parse_clock_time(raw, ',')
}

/// `HH:MM:SS.mmm`
fn parse_vtt_time(raw: &str) -> Result<f64> {
    parse_clock_time(raw, '.')
}

fn parse_clock_time(raw: &str, millis_sep: char) -> Result<f64> {
    let raw = raw.trim();
    let (clock, millis) = raw
        .rsplit_once(millis_sep)
        .ok_or_else(|| Error::validation(format!("bad subtitle timestamp {raw:?}")))?;
    let millis: f64 = millis
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("bad subtitle timestamp {raw:?}")))?;
    let parts: Vec<&str> = clock.split(':').collect();
    let (h, m, s): (f64, f64, f64) = match parts.as_slice() {
        [h, m, s] => (
            parse_component(h, raw)?,
            parse_component(m, raw)?,
            parse_component(s, raw)?,
        ),
        // WebVTT permits dropping the hour field.
        [m, s] => (0.0, parse_component(m, raw)?, parse_component(s, raw)?),
        _ => {
            return Err(Error::validation(format!("bad subtitle timestamp {raw:?}")));
        }
    };
    Ok(h * 3600.0 + m * 60.0 + s + millis / 1000.0)
}

fn parse_component(part: &str, raw: &str) -> Result<f64> {
    part.trim()
        .parse()
        .map_err(|_| Error::validation(format!("bad subtitle timestamp {raw:?}")))
}

/// `H:MM:SS.cc` (centiseconds).
fn parse_ass_time(raw: &str) -> Result<f64> {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    let [h, m, s] = parts.as_slice() else {
        return Err(Error::validation(format!("bad ASS timestamp {raw:?}")));
    };
    let h: f64 = parse_component(h, raw)?;
    let m: f64 = parse_component(m, raw)?;
    let s: f64 = parse_component(s, raw)?;
    Ok(h * 3600.0 + m * 60.0 + s)
}

pub fn parse_srt(content: &str) -> Result<Vec<Cue>> {
    let mut cues = Vec::new();
    for block in content.replace("\r\n", "\n").split("\n\n") {
        let mut lines = block.lines().filter(|l| !l.trim().is_empty()).peekable();
        // Leading numeric index line.
        if let Some(first) = lines.peek()
            && first.trim().chars().all(|c| c.is_ascii_digit())
            && !first.trim().is_empty()
        {
            lines.next();
        }
        let Some(timing) = lines.next() else { continue };
        let Some((start, end)) = timing.split_once("-->") else {
            continue;
        };
        let text = lines.collect::<Vec<&str>>().join("\n");
        cues.push(Cue::plain(
            parse_srt_time(start)?,
            parse_srt_time(end)?,
            text,
        ));
    }
    Ok(cues)
}

pub fn parse_vtt(content: &str) -> Result<Vec<Cue>> {
    let normalized = content.replace("\r\n", "\n");
    let mut cues = Vec::new();
    for block in normalized.split("\n\n") {
        let lines: Vec<&str> = block.lines().filter(|l| !l.trim().is_empty()).collect();
        let Some(timing_idx) = lines.iter().position(|l| l.contains("-->")) else {
            // Preamble (WEBVTT header, NOTE blocks) carries no timing line.
            continue;
        };
        let (start, rest) = lines[timing_idx].split_once("-->").unwrap();
        // Cue settings may trail the end timestamp.
        let end = rest.trim().split_whitespace().next().unwrap_or_default();
        let text = lines[timing_idx + 1..].join("\n");
        cues.push(Cue::plain(
            parse_vtt_time(start)?,
            parse_vtt_time(end)?,
            text,
        ));
    }
    Ok(cues)
}

pub fn parse_ass(content: &str) -> Result<Vec<Cue>> {
    let mut in_events = false;
    let mut cues = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_events = trimmed.eq_ignore_ascii_case("[Events]");
            continue;
        }
        if !in_events {
            continue;
        }
        let Some(rest) = trimmed.strip_prefix("Dialogue:") else {
            continue;
        };
        // Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect,
        // Text — the text is everything after the ninth comma and may itself
        // contain commas.
        let fields: Vec<&str> = rest.splitn(10, ',').collect();
        if fields.len() != 10 {
            return Err(Error::validation(format!(
                "malformed Dialogue line: {trimmed:?}"
            )));
        }
        cues.push(Cue {
            start_s: parse_ass_time(fields[1])?,
            end_s: parse_ass_time(fields[2])?,
            text: fields[9].trim().to_string(),
            layer: fields[0].trim().parse().ok(),
            style: Some(fields[3].trim().to_string()).filter(|s| !s.is_empty()),
            margin_l: fields[5].trim().parse().ok(),
            margin_r: fields[6].trim().parse().ok(),
            margin_v: fields[7].trim().parse().ok(),
        });
    }
    Ok(cues)
}

/// `&HAABBGGRR` with alpha 00 (opaque), the ASS colour byte order.
pub fn ass_color(color: &str) -> String {
    let hex = color.strip_prefix('#').unwrap_or(color);
    if hex.len() != 6 {
        return "&H00FFFFFF".to_string();
    }
    let (r, rest) = hex.split_at(2);
    let (g, b) = rest.split_at(2);
    format!("&H00{}{}{}", b.to_uppercase(), g.to_uppercase(), r.to_uppercase())
}

/// `H:MM:SS.cc`
pub fn ass_time(seconds: f64) -> String {
    let total_cs = (seconds.max(0.0) * 100.0).round() as u64;
    let cs = total_cs % 100;
    let total_secs = total_cs / 100;
    let s = total_secs % 60;
    let m = (total_secs / 60) % 60;
    let h = total_secs / 3600;
    format!("{h}:{m:02}:{s:02}.{cs:02}")
}

/// Numpad alignment code for the nine anchors.
fn ass_alignment(anchor: Anchor) -> u8 {
    match anchor {
        Anchor::BottomLeft => 1,
        Anchor::BottomCenter => 2,
        Anchor::BottomRight => 3,
        Anchor::CenterLeft => 4,
        Anchor::Center => 5,
        Anchor::CenterRight => 6,
        Anchor::TopLeft => 7,
        Anchor::TopCenter => 8,
        Anchor::TopRight => 9,
    }
}

fn ass_bool(value: bool) -> i8 {
    // ASS style booleans: -1 is true, 0 is false.
    if value { -1 } else { 0 }
}

/// Render cues into a complete ASS script with one synthesized style. The
/// play resolution, when known, keeps font sizes and margins in video pixel
/// units.
pub fn synthesize_ass(
    cues: &[Cue],
    style: &SubtitleStyle,
    position: &SubtitlePosition,
    play_res: Option<(u32, u32)>,
) -> String {
    let mut script = String::new();
    script.push_str("[Script Info]\n");
    script.push_str("ScriptType: v4.00+\n");
    if let Some((w, h)) = play_res {
        script.push_str(&format!("PlayResX: {w}\nPlayResY: {h}\n"));
    }
    script.push('\n');

    script.push_str("[V4+ Styles]\n");
    script.push_str(
        "Format: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, OutlineColour, \
         BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, Angle, \
         BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding\n",
    );
    script.push_str(&format!(
        "Style: Default,{font},{size},{primary},&H000000FF,{outline},&H00000000,{bold},{italic},0,0,100,100,0,0,1,{outline_w},0,{alignment},10,10,{margin_v},1\n\n",
        font = style.font_family,
        size = style.font_size,
        primary = ass_color(&style.color),
        outline = ass_color(&style.outline_color),
        bold = ass_bool(style.bold),
        italic = ass_bool(style.italic),
        outline_w = style.outline_width,
        alignment = ass_alignment(position.alignment),
        margin_v = position.margin_v,
    ));

    script.push_str("[Events]\n");
    script.push_str(
        "Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n",
    );
    for cue in cues {
        script.push_str(&format!(
            "Dialogue: {layer},{start},{end},{style},,{ml},{mr},{mv},,{text}\n",
            layer = cue.layer.unwrap_or(0),
            start = ass_time(cue.start_s),
            end = ass_time(cue.end_s),
            style = cue.style.as_deref().unwrap_or("Default"),
            ml = cue.margin_l.unwrap_or(0),
            mr = cue.margin_r.unwrap_or(0),
            mv = cue.margin_v.unwrap_or(0),
            text = cue.text.replace('\n', "\\N"),
        ));
    }
    script
}

/// `subtitles=` burn-in filter with the path escaped for filter syntax.
pub fn build_subtitles_filter(path: &std::path::Path) -> String {
    let escaped = path
        .to_string_lossy()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'");
    format!("subtitles=filename='{escaped}'")
}
