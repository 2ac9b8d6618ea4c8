//! Picture-in-picture filter graph synthesis: scaling, alpha-mask shapes,
//! border and shadow underlays, opacity, and timing.

use super::trim_float;
use crate::jobs::config::{OverlayShape, VideoOverlayConfig};

fn enable_suffix(start: Option<f64>, end: Option<f64>) -> String {
    match (start, end) {
        (Some(start), Some(end)) => format!(
            ":enable='between(t,{},{})'",
            trim_float(start),
            trim_float(end)
        ),
        (Some(start), None) => format!(":enable='gte(t,{})'", trim_float(start)),
        (None, Some(end)) => format!(":enable='lte(t,{})'", trim_float(end)),
        (None, None) => String::new(),
    }
}

/// Alpha expression masking the overlay into the requested shape. The mask
/// multiplies the existing alpha plane so upstream opacity is preserved.
fn shape_alpha_expr(shape: OverlayShape, radius: u32) -> Option<String> {
    match shape {
        OverlayShape::Rectangle => None,
        OverlayShape::Circle => Some(
            "alpha(X,Y)*lte(hypot(X-W/2,Y-H/2),min(W,H)/2)".to_string(),
        ),
        OverlayShape::Rounded => Some(format!(
            "alpha(X,Y)*lte(hypot(max(abs(X-W/2)-(W/2-{radius}),0),max(abs(Y-H/2)-(H/2-{radius}),0)),{radius})"
        )),
    }
}

/// Build the full `-filter_complex` graph. Input 0 is the base video, input 1
/// the overlay; the composited stream comes out labeled `[vout]`.
pub fn build_overlay_graph(cfg: &VideoOverlayConfig) -> String {
    let geom = &cfg.config;
    let mut chain: Vec<String> = Vec::new();

    if let (Some(w), Some(h)) = (geom.width, geom.height) {
        chain.push(format!("scale={w}:{h}"));
    } else if let Some(scale) = geom.scale {
        let f = trim_float(scale);
        chain.push(format!("scale=iw*{f}:ih*{f}"));
    }

    if let Some(border) = &cfg.border
        && border.width > 0
    {
        let bw = border.width;
        let color = border.color.strip_prefix('#').unwrap_or(&border.color);
        chain.push(format!(
            "pad=w=iw+{pad}:h=ih+{pad}:x={bw}:y={bw}:color=0x{color}",
            pad = bw * 2,
        ));
    }

    chain.push("format=rgba".to_string());

    if let Some(alpha) = shape_alpha_expr(geom.shape, geom.border_radius) {
        chain.push(format!(
            "geq=r='r(X,Y)':g='g(X,Y)':b='b(X,Y)':a='{alpha}'"
        ));
    }

    if (geom.opacity - 1.0).abs() > f64::EPSILON {
        chain.push(format!(
            "colorchannelmixer=aa={}",
            trim_float(geom.opacity)
        ));
    }

    let enable = enable_suffix(geom.start_time, geom.end_time);
    let (x, y) = (geom.x, geom.y);

    match &cfg.shadow {
        Some(shadow) => {
            let sx = x + shadow.offset_x;
            let sy = y + shadow.offset_y;
            format!(
                "[1:v]{chain}[ov];\
                 [ov]split[ovk][ovs];\
                 [ovs]colorchannelmixer=rr=0:gg=0:bb=0:aa={sa}[shadow];\
                 [0:v][shadow]overlay={sx}:{sy}{enable}[base];\
                 [base][ovk]overlay={x}:{y}{enable}[vout]",
                chain = chain.join(","),
                sa = trim_float(shadow.alpha),
            )
        }
        None => format!(
            "[1:v]{chain}[ov];[0:v][ov]overlay={x}:{y}{enable}[vout]",
            chain = chain.join(","),
        ),
    }
}
