//! drawtext filter synthesis for text overlays: position anchors, styling,
//! decorations, animation expressions, and the rotation graph.

use super::trim_float;
use crate::jobs::config::{
    Anchor, Animation, AnimationKind, PositionKind, TextOverlayConfig, TextPosition,
};

/// Escape a text payload for use inside a single-quoted drawtext value.
/// Single quotes cannot appear inside a quoted section at all, so they are
/// closed out, escaped, and reopened; the other filter metacharacters get a
/// backslash.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\'' => out.push_str("'\\''"),
            '\\' => out.push_str("\\\\"),
            ':' => out.push_str("\\:"),
            '%' => out.push_str("\\%"),
            _ => out.push(c),
        }
    }
    out
}

/// ffmpeg color spec from `#RRGGBB` plus an alpha in [0, 1].
pub fn ffmpeg_color(color: &str, alpha: f64) -> String {
    let hex = color.strip_prefix('#').unwrap_or(color);
    if (alpha - 1.0).abs() < f64::EPSILON {
        format!("0x{hex}")
    } else {
        format!("0x{hex}@{}", trim_float(alpha))
    }
}

/// A clamped 0..1 ramp starting `delay` seconds in and lasting `duration`.
fn ramp(delay: f64, duration: f64) -> String {
    format!(
        "min(max((t-{})/{},0),1)",
        trim_float(delay),
        trim_float(duration)
    )
}

fn position_exprs(position: &TextPosition) -> (String, String) {
    match position.kind {
        PositionKind::Absolute => (
            position.x.unwrap_or(0).to_string(),
            position.y.unwrap_or(0).to_string(),
        ),
        PositionKind::Relative => {
            let mx = position.margin_x;
            let my = position.margin_y;
            let anchor = position.position.unwrap_or(Anchor::Center);
            let x = match anchor {
                Anchor::TopLeft | Anchor::CenterLeft | Anchor::BottomLeft => mx.to_string(),
                Anchor::TopCenter | Anchor::Center | Anchor::BottomCenter => {
                    "(w-text_w)/2".to_string()
                }
                Anchor::TopRight | Anchor::CenterRight | Anchor::BottomRight => {
                    format!("w-text_w-{mx}")
                }
            };
            let y = match anchor {
                Anchor::TopLeft | Anchor::TopCenter | Anchor::TopRight => my.to_string(),
                Anchor::CenterLeft | Anchor::Center | Anchor::CenterRight => {
                    "(h-text_h)/2".to_string()
                }
                Anchor::BottomLeft | Anchor::BottomCenter | Anchor::BottomRight => {
                    format!("h-text_h-{my}")
                }
            };
            (x, y)
        }
    }
}

/// Base alpha combined with the fade animation, as a drawtext alpha
/// expression.
fn alpha_expr(cfg: &TextOverlayConfig) -> String {
    let base = trim_float((cfg.style.alpha * cfg.opacity).clamp(0.0, 1.0));
    let Some(anim) = cfg.animation.as_ref() else {
        return base;
    };
    let fade_in = || {
        let delay = cfg.start_time + anim.delay;
        format!("{base}*{}", ramp(delay, anim.duration))
    };
    let fade_out = || {
        let start = cfg
            .end_time
            .map(|end| end - anim.duration)
            .unwrap_or(cfg.start_time + anim.delay);
        format!("{base}*(1-{})", ramp(start, anim.duration))
    };
    match anim.kind {
        AnimationKind::FadeIn => fade_in(),
        AnimationKind::FadeOut => fade_out(),
        AnimationKind::Fade => {
            let delay = cfg.start_time + anim.delay;
            let out_start = cfg
                .end_time
                .map(|end| end - anim.duration)
                .unwrap_or(delay + anim.duration);
            format!(
                "{base}*{}*(1-{})",
                ramp(delay, anim.duration),
                ramp(out_start, anim.duration)
            )
        }
        _ => base,
    }
}

/// Slide animations displace the resting position; zoom animates the font
/// size.
fn animate_position(
    x: String,
    y: String,
    anim: Option<&Animation>,
    start_time: f64,
) -> (String, String) {
    let Some(anim) = anim else {
        return (x, y);
    };
    let f = ramp(start_time + anim.delay, anim.duration);
    match anim.kind {
        AnimationKind::SlideLeft => (format!("({x})+(w-({x}))*(1-{f})"), y),
        AnimationKind::SlideRight => (format!("({x})*{f}-text_w*(1-{f})"), y),
        AnimationKind::SlideUp => (x, format!("({y})+(h-({y}))*(1-{f})")),
        AnimationKind::SlideDown => (x, format!("({y})*{f}-text_h*(1-{f})")),
        _ => (x, y),
    }
}

fn fontsize_expr(cfg: &TextOverlayConfig) -> String {
    let size = cfg.style.font_size;
    let Some(anim) = cfg.animation.as_ref() else {
        return size.to_string();
    };
    let f = ramp(cfg.start_time + anim.delay, anim.duration);
    match anim.kind {
        AnimationKind::ZoomIn => format!("{size}*{f}"),
        AnimationKind::ZoomOut => format!("{size}*(2-{f})"),
        _ => size.to_string(),
    }
}

fn enable_expr(start: f64, end: Option<f64>) -> String {
    match end {
        Some(end) => format!("between(t,{},{})", trim_float(start), trim_float(end)),
        None => format!("gte(t,{})", trim_float(start)),
    }
}

/// The drawtext argument list itself, without the rotation scaffold.
fn drawtext_args(cfg: &TextOverlayConfig, with_enable: bool) -> String {
    let (x, y) = position_exprs(&cfg.position);
    let (x, y) = animate_position(x, y, cfg.animation.as_ref(), cfg.start_time);

    let mut font = cfg.style.font_family.clone();
    if cfg.style.font_weight.eq_ignore_ascii_case("bold") {
        font.push_str("\\:style=Bold");
    }

    let mut parts: Vec<String> = vec![
        format!("text='{}'", escape_text(&cfg.text)),
        format!("font='{font}'"),
        format!("fontsize='{}'", fontsize_expr(cfg)),
        format!("fontcolor={}", ffmpeg_color(&cfg.style.color, 1.0)),
        format!("alpha='{}'", alpha_expr(cfg)),
        format!("x='{x}'"),
        format!("y='{y}'"),
    ];

    if let Some(bg) = &cfg.background {
        parts.push("box=1".to_string());
        parts.push(format!("boxcolor={}", ffmpeg_color(&bg.color, bg.alpha)));
        parts.push(format!("boxborderw={}", bg.padding));
    }
    if let Some(border) = &cfg.border {
        parts.push(format!("borderw={}", border.width));
        parts.push(format!("bordercolor={}", ffmpeg_color(&border.color, 1.0)));
    }
    if let Some(shadow) = &cfg.shadow {
        parts.push(format!("shadowx={}", shadow.offset_x));
        parts.push(format!("shadowy={}", shadow.offset_y));
        parts.push(format!(
            "shadowcolor={}",
            ffmpeg_color(&shadow.color, shadow.alpha)
        ));
    }
    if with_enable {
        parts.push(format!(
            "enable='{}'",
            enable_expr(cfg.start_time, cfg.end_time)
        ));
    }

    format!("drawtext={}", parts.join(":"))
}

/// A synthesized video filter: either a plain `-vf` chain, or a
/// `-filter_complex` graph whose output must be mapped by label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextFilter {
    Simple(String),
    Complex { graph: String, output: String },
}

/// Build the overlay filter. Rotation draws the text onto a transparent
/// canvas sized like the video, rotates that canvas, and overlays it, so it
/// needs the probed frame size and a complex graph; everything else is a
/// single drawtext.
pub fn build_text_filter(cfg: &TextOverlayConfig, width: u32, height: u32) -> TextFilter {
    if cfg.rotation.abs() < f64::EPSILON {
        return TextFilter::Simple(drawtext_args(cfg, true));
    }

    let graph = format!(
        "color=c=black@0.0:s={width}x{height},format=rgba,{draw}[txt];\
         [txt]rotate={angle}*PI/180:c=none[rtxt];\
         [0:v][rtxt]overlay=0:0:shortest=1:enable='{enable}'[vout]",
        draw = drawtext_args(cfg, false),
        angle = trim_float(cfg.rotation),
        enable = enable_expr(cfg.start_time, cfg.end_time),
    );
    TextFilter::Complex {
        graph,
        output: "vout".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::config::{TextStyle, BackgroundStyle};

    fn base_config() -> TextOverlayConfig {
        serde_json::from_value(serde_json::json!({
            "video_file_id": 1,
            "text": "Hello, World",
            "position": {"type": "relative", "position": "bottom-center", "margin_x": 10, "margin_y": 10},
            "style": {"font_family": "Arial", "font_size": 48, "font_weight": "normal", "color": "#FFFFFF", "alpha": 1.0},
            "start_time": 0.0,
            "end_time": 5.0
        }))
        .unwrap()
    }

    #[test]
    fn bottom_center_anchor_with_margins() {
        let TextFilter::Simple(filter) = build_text_filter(&base_config(), 640, 480) else {
            panic!("expected a simple filter");
        };
        assert!(filter.starts_with("drawtext=text='Hello, World'"));
        assert!(filter.contains("x='(w-text_w)/2'"));
        assert!(filter.contains("y='h-text_h-10'"));
        assert!(filter.contains("fontcolor=0xFFFFFF"));
        assert!(filter.contains("fontsize='48'"));
        assert!(filter.contains("enable='between(t,0,5)'"));
    }

    #[test]
    fn fade_in_scales_alpha_over_the_ramp() {
        let mut cfg = base_config();
        cfg.animation = Some(Animation {
            kind: AnimationKind::FadeIn,
            duration: 1.0,
            delay: 0.0,
        });
        let TextFilter::Simple(filter) = build_text_filter(&cfg, 640, 480) else {
            panic!("expected a simple filter");
        };
        assert!(filter.contains("alpha='1*min(max((t-0)/1,0),1)'"), "{filter}");
    }

    #[test]
    fn fade_out_ends_at_end_time() {
        let mut cfg = base_config();
        cfg.animation = Some(Animation {
            kind: AnimationKind::FadeOut,
            duration: 2.0,
            delay: 0.0,
        });
        let TextFilter::Simple(filter) = build_text_filter(&cfg, 640, 480) else {
            panic!("expected a simple filter");
        };
        assert!(filter.contains("alpha='1*(1-min(max((t-3)/2,0),1))'"), "{filter}");
    }

    #[test]
    fn absolute_position_and_decorations() {
        let mut cfg = base_config();
        cfg.position = TextPosition {
            kind: PositionKind::Absolute,
            x: Some(100),
            y: Some(50),
            position: None,
            margin_x: 0,
            margin_y: 0,
        };
        cfg.style = TextStyle {
            font_family: "Arial".into(),
            font_size: 32,
            font_weight: "bold".into(),
            color: "#FF0000".into(),
            alpha: 0.8,
        };
        cfg.background = Some(BackgroundStyle {
            color: "#000000".into(),
            alpha: 0.5,
            padding: 12,
            radius: 0,
        });
        let TextFilter::Simple(filter) = build_text_filter(&cfg, 1280, 720) else {
            panic!("expected a simple filter");
        };
        assert!(filter.contains("x='100'"));
        assert!(filter.contains("y='50'"));
        assert!(filter.contains("font='Arial\\:style=Bold'"));
        assert!(filter.contains("alpha='0.8'"));
        assert!(filter.contains("box=1:boxcolor=0x000000@0.5:boxborderw=12"));
    }

    #[test]
    fn slide_and_zoom_expressions() {
        let mut cfg = base_config();
        cfg.animation = Some(Animation {
            kind: AnimationKind::SlideLeft,
            duration: 1.0,
            delay: 0.0,
        });
        let TextFilter::Simple(filter) = build_text_filter(&cfg, 640, 480) else {
            panic!("expected a simple filter");
        };
        assert!(filter.contains("x='((w-text_w)/2)+(w-((w-text_w)/2))*(1-min(max((t-0)/1,0),1))'"));

        cfg.animation = Some(Animation {
            kind: AnimationKind::ZoomIn,
            duration: 0.5,
            delay: 0.0,
        });
        let TextFilter::Simple(filter) = build_text_filter(&cfg, 640, 480) else {
            panic!("expected a simple filter");
        };
        assert!(filter.contains("fontsize='48*min(max((t-0)/0.5,0),1)'"));
    }

    #[test]
    fn rotation_builds_a_complex_graph() {
        let mut cfg = base_config();
        cfg.rotation = 45.0;
        let TextFilter::Complex { graph, output } = build_text_filter(&cfg, 640, 480) else {
            panic!("expected a complex graph");
        };
        assert_eq!(output, "vout");
        assert!(graph.starts_with("color=c=black@0.0:s=640x480,format=rgba,drawtext="));
        assert!(graph.contains("rotate=45*PI/180:c=none"));
        assert!(graph.contains("[0:v][rtxt]overlay=0:0:shortest=1:enable='between(t,0,5)'[vout]"));
    }

    #[test]
    fn text_escaping_handles_quotes_and_metacharacters() {
        assert_eq!(escape_text("It's 100%: done"), "It'\\''s 100\\%\\: done");
    }
}
