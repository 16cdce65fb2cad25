use image::{Rgba, RgbaImage};

/// Drawing tool for freehand strokes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Tool {
    #[default]
    Pen,
    Eraser,
}

impl Tool {
    /// Spelling used in project documents.
    pub fn doc_name(&self) -> &'static str {
        match self {
            Tool::Pen => "pen",
            Tool::Eraser => "eraser",
        }
    }

    /// Unknown spellings fall back to the pen.
    pub fn from_doc_name(name: &str) -> Self {
        match name {
            "eraser" => Tool::Eraser,
            _ => Tool::Pen,
        }
    }
}

/// Current tool configuration, persisted through the project document.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ToolSettings {
    pub tool: Tool,
    /// Stroke diameter in pixels.
    pub brush_size: f32,
    pub color: Rgba<u8>,
    pub pressure_enabled: bool,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            tool: Tool::Pen,
            brush_size: 5.0,
            color: Rgba([0, 0, 0, 255]),
            pressure_enabled: false,
        }
    }
}

/// Parse `#RGB`, `#RRGGBB` or `#RRGGBBAA` (case-insensitive, `#` optional).
pub fn parse_hex_color(text: &str) -> Option<Rgba<u8>> {
    let hex = text.trim().trim_start_matches('#');
    let nibble = |c: u8| -> Option<u8> { (c as char).to_digit(16).map(|d| d as u8) };
    let byte = |hi: u8, lo: u8| -> Option<u8> { Some(nibble(hi)? << 4 | nibble(lo)?) };
    let b = hex.as_bytes();
    match b.len() {
        3 => Some(Rgba([
            byte(b[0], b[0])?,
            byte(b[1], b[1])?,
            byte(b[2], b[2])?,
            255,
        ])),
        6 => Some(Rgba([
            byte(b[0], b[1])?,
            byte(b[2], b[3])?,
            byte(b[4], b[5])?,
            255,
        ])),
        8 => Some(Rgba([
            byte(b[0], b[1])?,
            byte(b[2], b[3])?,
            byte(b[4], b[5])?,
            byte(b[6], b[7])?,
        ])),
        _ => None,
    }
}

/// `#rrggbb` spelling of a color's opaque part, as stored in documents.
pub fn color_to_hex(color: Rgba<u8>) -> String {
    format!("#{:02x}{:02x}{:02x}", color[0], color[1], color[2])
}

/// Draw a filled, anti-aliased circular dot at `center`.
///
/// The pen composes source-over with the stroke color; the eraser reduces
/// alpha (destination-out) and never paints color. Both read edge coverage
/// from the distance to the circle, so dots blend smoothly into the canvas.
pub fn draw_dot(buf: &mut RgbaImage, center: (f32, f32), radius: f32, color: Rgba<u8>, tool: Tool) {
    if radius <= 0.0 {
        return;
    }
    let (w, h) = buf.dimensions();
    let (cx, cy) = center;
    let min_x = (cx - radius - 1.0).floor().max(0.0) as u32;
    let max_x = ((cx + radius + 1.0).ceil() as i64).clamp(0, w as i64 - 1) as u32;
    let min_y = (cy - radius - 1.0).floor().max(0.0) as u32;
    let max_y = ((cy + radius + 1.0).ceil() as i64).clamp(0, h as i64 - 1) as u32;

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let dist = (dx * dx + dy * dy).sqrt();
            let coverage = (radius + 0.5 - dist).clamp(0.0, 1.0);
            if coverage > 0.0 {
                stamp_pixel(buf.get_pixel_mut(x, y), color, coverage, tool);
            }
        }
    }
}

/// Draw a round-capped, round-joined line segment of the given radius.
///
/// The segment is rasterized as a capsule (distance to the segment ≤ radius)
/// in one pass, so overlapping joints never double-blend.
pub fn draw_segment(
    buf: &mut RgbaImage,
    from: (f32, f32),
    to: (f32, f32),
    radius: f32,
    color: Rgba<u8>,
    tool: Tool,
) {
    let (x0, y0) = from;
    let (x1, y1) = to;
    let dx = x1 - x0;
    let dy = y1 - y0;
    let len_sq = dx * dx + dy * dy;
    if len_sq < 0.01 {
        draw_dot(buf, from, radius, color, tool);
        return;
    }
    if radius <= 0.0 {
        return;
    }

    let (w, h) = buf.dimensions();
    let pad = radius + 1.0;
    let min_x = (x0.min(x1) - pad).floor().max(0.0) as u32;
    let max_x = ((x0.max(x1) + pad).ceil() as i64).clamp(0, w as i64 - 1) as u32;
    let min_y = (y0.min(y1) - pad).floor().max(0.0) as u32;
    let max_y = ((y0.max(y1) + pad).ceil() as i64).clamp(0, h as i64 - 1) as u32;

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let px = x as f32;
            let py = y as f32;
            // Nearest point on the segment, clamped to the endpoints.
            let t = (((px - x0) * dx + (py - y0) * dy) / len_sq).clamp(0.0, 1.0);
            let nx = x0 + t * dx;
            let ny = y0 + t * dy;
            let dist = ((px - nx).powi(2) + (py - ny).powi(2)).sqrt();
            let coverage = (radius + 0.5 - dist).clamp(0.0, 1.0);
            if coverage > 0.0 {
                stamp_pixel(buf.get_pixel_mut(x, y), color, coverage, tool);
            }
        }
    }
}

/// Compose one stroke pixel at the given edge coverage.
fn stamp_pixel(px: &mut Rgba<u8>, color: Rgba<u8>, coverage: f32, tool: Tool) {
    match tool {
        Tool::Eraser => {
            let alpha = px[3] as f32 / 255.0 * (1.0 - coverage);
            px[3] = (alpha * 255.0 + 0.5) as u8;
        }
        Tool::Pen => {
            let src_a = (color[3] as f32 / 255.0) * coverage;
            if src_a <= 0.0 {
                return;
            }
            let dst_a = px[3] as f32 / 255.0;
            let out_a = src_a + dst_a * (1.0 - src_a);
            if out_a <= 0.0 {
                *px = Rgba([0, 0, 0, 0]);
                return;
            }
            // Straight-alpha over: weight each channel by its own alpha, then
            // un-premultiply so partially covered pixels keep the true hue.
            let blend = |s: u8, d: u8| -> u8 {
                let c = (s as f32 * src_a + d as f32 * dst_a * (1.0 - src_a)) / out_a;
                (c + 0.5) as u8
            };
            *px = Rgba([
                blend(color[0], px[0]),
                blend(color[1], px[1]),
                blend(color[2], px[2]),
                (out_a * 255.0 + 0.5) as u8,
            ]);
        }
    }
}
