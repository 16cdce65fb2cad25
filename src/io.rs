use std::collections::{BTreeMap, HashMap};
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::codecs::png::PngEncoder;
use image::{ImageEncoder, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::canvas::{CanvasState, Layer, LayerId, MAX_CANVAS_DIM};
use crate::components::tools::{Tool, ToolSettings, color_to_hex, parse_hex_color};

/// Version written by [`encode`]. Documents without a `version` field are
/// the legacy single-image shape and stay loadable forever.
pub const DOC_VERSION: u32 = 2;

/// Maximum number of layers in a document.
const MAX_LAYERS: usize = 256;

// ============================================================================
// DOCUMENT SHAPES
// ============================================================================

/// Legacy document: the whole drawing flattened into one embedded PNG.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentV1 {
    width: u32,
    height: u32,
    #[serde(default)]
    tool: String,
    #[serde(default = "default_brush_size")]
    brush_size: f32,
    #[serde(default)]
    color: String,
    image_data: String,
}

/// Current document: layer metadata plus one embedded PNG per layer.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentV2 {
    version: u32,
    width: u32,
    height: u32,
    #[serde(default)]
    tool: String,
    #[serde(default = "default_brush_size")]
    brush_size: f32,
    #[serde(default)]
    pressure_enabled: bool,
    #[serde(default)]
    color: String,
    /// Ordered like the live stack: index 0 topmost.
    layers: Vec<DocLayer>,
    #[serde(default)]
    active_layer_id: String,
    /// Layer id → base64 PNG. Ids absent from `layers` are skipped on load.
    #[serde(default)]
    layer_images: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct DocLayer {
    id: String,
    name: String,
    opacity: f32,
    visible: bool,
}

fn default_brush_size() -> f32 {
    ToolSettings::default().brush_size
}

/// Peek at the version before choosing a document shape.
#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    version: u32,
}

// ============================================================================
// ERRORS
// ============================================================================

/// Error type for document encode/decode. A failed load aborts as a whole;
/// the caller's prior state is never touched.
#[derive(Debug)]
pub enum DocError {
    Json(serde_json::Error),
    Base64(base64::DecodeError),
    Image(image::ImageError),
    Invalid(String),
}

impl fmt::Display for DocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocError::Json(e) => write!(f, "JSON error: {e}"),
            DocError::Base64(e) => write!(f, "base64 error: {e}"),
            DocError::Image(e) => write!(f, "image error: {e}"),
            DocError::Invalid(msg) => write!(f, "invalid document: {msg}"),
        }
    }
}

impl From<serde_json::Error> for DocError {
    fn from(e: serde_json::Error) -> Self {
        DocError::Json(e)
    }
}

impl From<base64::DecodeError> for DocError {
    fn from(e: base64::DecodeError) -> Self {
        DocError::Base64(e)
    }
}

impl From<image::ImageError> for DocError {
    fn from(e: image::ImageError) -> Self {
        DocError::Image(e)
    }
}

// ============================================================================
// ENCODE
// ============================================================================

/// Serialize the full editable state as v2 JSON. Raw per-layer buffers are
/// stored; the composite is derived and never serialized.
pub fn encode(canvas: &CanvasState, settings: &ToolSettings) -> Result<String, DocError> {
    let mut layer_images = BTreeMap::new();
    for layer in &canvas.layers {
        if let Some(buf) = canvas.buffer(layer.id) {
            layer_images.insert(layer.id.to_string(), encode_png_base64(buf)?);
        }
    }

    let doc = DocumentV2 {
        version: DOC_VERSION,
        width: canvas.width,
        height: canvas.height,
        tool: settings.tool.doc_name().to_string(),
        brush_size: settings.brush_size,
        pressure_enabled: settings.pressure_enabled,
        color: color_to_hex(settings.color),
        layers: canvas
            .layers
            .iter()
            .map(|l| DocLayer {
                id: l.id.to_string(),
                name: l.name.clone(),
                opacity: l.opacity,
                visible: l.visible,
            })
            .collect(),
        active_layer_id: canvas.active_layer.to_string(),
        layer_images,
    };

    Ok(serde_json::to_string(&doc)?)
}

/// PNG bytes of the composited display buffer.
pub fn encode_composite_png(canvas: &CanvasState) -> Result<Vec<u8>, DocError> {
    encode_png(canvas.display())
}

fn encode_png(buf: &RgbaImage) -> Result<Vec<u8>, DocError> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out).write_image(
        buf.as_raw(),
        buf.width(),
        buf.height(),
        image::ColorType::Rgba8,
    )?;
    Ok(out)
}

fn encode_png_base64(buf: &RgbaImage) -> Result<String, DocError> {
    Ok(BASE64.encode(encode_png(buf)?))
}

// ============================================================================
// DECODE
// ============================================================================

/// A fully reconstructed project, handed back to the caller in one piece so
/// a failed decode can never disturb the previous state.
pub struct DecodedProject {
    pub canvas: CanvasState,
    pub settings: ToolSettings,
}

/// Parse a v1 or v2 document. Unknown fields are ignored; structural
/// problems abort the whole load.
pub fn decode(text: &str) -> Result<DecodedProject, DocError> {
    let probe: VersionProbe = serde_json::from_str(text)?;
    if probe.version >= 2 {
        decode_v2(serde_json::from_str(text)?)
    } else {
        decode_v1(serde_json::from_str(text)?)
    }
}

fn check_dimensions(width: u32, height: u32) -> Result<(), DocError> {
    if width == 0 || height == 0 || width > MAX_CANVAS_DIM || height > MAX_CANVAS_DIM {
        return Err(DocError::Invalid(format!(
            "canvas dimensions {width}x{height} out of range"
        )));
    }
    Ok(())
}

fn settings_from_fields(tool: &str, brush_size: f32, pressure_enabled: bool, color: &str) -> ToolSettings {
    let defaults = ToolSettings::default();
    ToolSettings {
        tool: Tool::from_doc_name(tool),
        brush_size: if brush_size.is_finite() {
            brush_size.clamp(1.0, 512.0)
        } else {
            defaults.brush_size
        },
        color: parse_hex_color(color).unwrap_or(defaults.color),
        pressure_enabled,
    }
}

fn decode_v1(doc: DocumentV1) -> Result<DecodedProject, DocError> {
    check_dimensions(doc.width, doc.height)?;
    let mut canvas = CanvasState::new(doc.width, doc.height);
    let layer_id = canvas.active_layer;
    let image = decode_png_base64(&doc.image_data)?;
    if let Some(buf) = canvas.buffer_mut(layer_id) {
        copy_overlap(buf, &image);
    }
    canvas.composite();
    Ok(DecodedProject {
        canvas,
        settings: settings_from_fields(&doc.tool, doc.brush_size, false, &doc.color),
    })
}

fn decode_v2(doc: DocumentV2) -> Result<DecodedProject, DocError> {
    if doc.version > DOC_VERSION {
        crate::log_warn!(
            "document version {} is newer than {DOC_VERSION}; unknown fields ignored",
            doc.version
        );
    }
    check_dimensions(doc.width, doc.height)?;
    if doc.layers.is_empty() {
        return Err(DocError::Invalid("document has no layers".to_string()));
    }
    if doc.layers.len() > MAX_LAYERS {
        return Err(DocError::Invalid(format!(
            "document has {} layers (limit {MAX_LAYERS})",
            doc.layers.len()
        )));
    }

    // Document ids are opaque strings; every layer gets a fresh internal id
    // and `layer_images` is resolved through the mapping.
    let mut id_map: HashMap<String, LayerId> = HashMap::new();
    let mut layers = Vec::with_capacity(doc.layers.len());
    for doc_layer in &doc.layers {
        let mut layer = Layer::new(doc_layer.name.clone());
        layer.visible = doc_layer.visible;
        layer.opacity = if doc_layer.opacity.is_finite() {
            doc_layer.opacity.clamp(0.0, 1.0)
        } else {
            1.0
        };
        id_map.insert(doc_layer.id.clone(), layer.id);
        layers.push(layer);
    }

    let active = match id_map.get(&doc.active_layer_id) {
        Some(id) => *id,
        None => {
            crate::log_warn!(
                "decode: active layer '{}' not in document, using topmost",
                doc.active_layer_id
            );
            layers[0].id
        }
    };
    let mut canvas = CanvasState::from_layers(doc.width, doc.height, layers, active);

    // Each per-layer image decode is an independent completion unit; the
    // load finalizes only when the remaining-count reaches zero, which a
    // document with no images hits immediately.
    let jobs: Vec<(LayerId, &String)> = doc
        .layer_images
        .iter()
        .filter_map(|(doc_id, data)| match id_map.get(doc_id) {
            Some(id) => Some((*id, data)),
            None => {
                crate::log_warn!("decode: image for unknown layer '{doc_id}' skipped");
                None
            }
        })
        .collect();
    let mut remaining = jobs.len();
    for (layer_id, data) in jobs {
        let image = decode_png_base64(data)?;
        if let Some(buf) = canvas.buffer_mut(layer_id) {
            copy_overlap(buf, &image);
        }
        remaining -= 1;
    }
    debug_assert_eq!(remaining, 0);
    canvas.composite();

    Ok(DecodedProject {
        canvas,
        settings: settings_from_fields(
            &doc.tool,
            doc.brush_size,
            doc.pressure_enabled,
            &doc.color,
        ),
    })
}

/// Decode a base64 PNG payload; a `data:image/png;base64,` prefix from
/// older documents is tolerated.
fn decode_png_base64(data: &str) -> Result<RgbaImage, DocError> {
    let payload = match data.split_once("base64,") {
        Some((_, rest)) => rest,
        None => data,
    };
    let bytes = BASE64.decode(payload.trim())?;
    let image = image::load_from_memory_with_format(&bytes, image::ImageFormat::Png)?;
    Ok(image.to_rgba8())
}

/// Copy `src` into `dst` through the overlapping region. Differing sizes
/// lose (or leave transparent) the non-overlapping part.
fn copy_overlap(dst: &mut RgbaImage, src: &RgbaImage) {
    let w = dst.width().min(src.width());
    let h = dst.height().min(src.height());
    for y in 0..h {
        for x in 0..w {
            dst.put_pixel(x, y, *src.get_pixel(x, y));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn sample_project() -> (CanvasState, ToolSettings) {
        let mut canvas = CanvasState::new(6, 4);
        let bottom = canvas.active_layer;
        let top = canvas.add_layer();
        canvas
            .buffer_mut(bottom)
            .unwrap()
            .put_pixel(1, 1, Rgba([0, 128, 255, 255]));
        canvas
            .buffer_mut(top)
            .unwrap()
            .put_pixel(2, 3, Rgba([255, 0, 0, 200]));
        canvas.set_layer_opacity(bottom, 0.75);
        canvas.rename_layer(top, "Sketch".to_string());
        canvas.composite();
        let settings = ToolSettings {
            tool: Tool::Eraser,
            brush_size: 12.0,
            color: Rgba([255, 0, 127, 255]),
            pressure_enabled: true,
        };
        (canvas, settings)
    }

    #[test]
    fn v2_roundtrip_preserves_metadata_and_pixels() {
        let (canvas, settings) = sample_project();
        let text = encode(&canvas, &settings).unwrap();
        let decoded = decode(&text).unwrap();

        assert_eq!(decoded.canvas.width, 6);
        assert_eq!(decoded.canvas.height, 4);
        assert_eq!(decoded.canvas.layers.len(), 2);
        assert_eq!(decoded.canvas.layers[0].name, "Sketch");
        assert_eq!(decoded.canvas.layers[1].opacity, 0.75);
        assert_eq!(decoded.canvas.active_layer, decoded.canvas.layers[0].id);

        let top = decoded.canvas.buffer(decoded.canvas.layers[0].id).unwrap();
        assert_eq!(*top.get_pixel(2, 3), Rgba([255, 0, 0, 200]));
        let bottom = decoded.canvas.buffer(decoded.canvas.layers[1].id).unwrap();
        assert_eq!(*bottom.get_pixel(1, 1), Rgba([0, 128, 255, 255]));

        assert_eq!(decoded.settings.tool, Tool::Eraser);
        assert_eq!(decoded.settings.brush_size, 12.0);
        assert_eq!(decoded.settings.color, Rgba([255, 0, 127, 255]));
        assert!(decoded.settings.pressure_enabled);
    }

    #[test]
    fn v1_document_loads_as_single_layer() {
        let mut image = RgbaImage::new(3, 3);
        image.put_pixel(0, 0, Rgba([9, 8, 7, 255]));
        let text = format!(
            r##"{{"width":3,"height":3,"tool":"pen","brushSize":4,"color":"#102030","imageData":"{}"}}"##,
            BASE64.encode(encode_png(&image).unwrap())
        );
        let decoded = decode(&text).unwrap();
        assert_eq!(decoded.canvas.layers.len(), 1);
        let buf = decoded.canvas.buffer(decoded.canvas.active_layer).unwrap();
        assert_eq!(*buf.get_pixel(0, 0), Rgba([9, 8, 7, 255]));
        assert_eq!(decoded.settings.tool, Tool::Pen);
        assert_eq!(decoded.settings.color, Rgba([16, 32, 48, 255]));
    }

    #[test]
    fn empty_layer_images_completes_with_transparent_layers() {
        let text = r##"{
            "version": 2, "width": 4, "height": 4,
            "tool": "pen", "brushSize": 5, "pressureEnabled": false,
            "color": "#000000",
            "layers": [{"id": "a", "name": "One", "opacity": 1.0, "visible": true}],
            "activeLayerId": "a",
            "layerImages": {}
        }"##;
        let decoded = decode(text).unwrap();
        let buf = decoded.canvas.buffer(decoded.canvas.active_layer).unwrap();
        assert!(buf.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn stale_layer_image_id_is_skipped() {
        let mut canvas = CanvasState::new(2, 2);
        canvas
            .active_buffer_mut()
            .unwrap()
            .put_pixel(0, 0, Rgba([1, 2, 3, 255]));
        let png = encode_png_base64(canvas.buffer(canvas.active_layer).unwrap()).unwrap();
        let text = format!(
            r#"{{
                "version": 2, "width": 2, "height": 2,
                "layers": [{{"id": "kept", "name": "Kept", "opacity": 1.0, "visible": true}}],
                "activeLayerId": "kept",
                "layerImages": {{"kept": "{png}", "deleted-layer": "{png}"}}
            }}"#
        );
        let decoded = decode(&text).unwrap();
        assert_eq!(decoded.canvas.layers.len(), 1);
        let buf = decoded.canvas.buffer(decoded.canvas.active_layer).unwrap();
        assert_eq!(*buf.get_pixel(0, 0), Rgba([1, 2, 3, 255]));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let text = r#"{
            "version": 2, "width": 2, "height": 2,
            "futureFeature": {"nested": [1, 2, 3]},
            "layers": [{"id": "x", "name": "L", "opacity": 0.5, "visible": false}],
            "activeLayerId": "x",
            "layerImages": {}
        }"#;
        let decoded = decode(text).unwrap();
        assert_eq!(decoded.canvas.layers[0].opacity, 0.5);
        assert!(!decoded.canvas.layers[0].visible);
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"version": 2, "width": 2}"#).is_err());
        assert!(
            decode(r#"{"version": 2, "width": 2, "height": 2, "layers": [], "activeLayerId": ""}"#)
                .is_err()
        );
        assert!(
            decode(r#"{"version": 2, "width": 0, "height": 2, "layers": [{"id":"a","name":"n","opacity":1.0,"visible":true}], "activeLayerId": "a"}"#)
                .is_err()
        );
        // Corrupt embedded image aborts the load.
        assert!(
            decode(r#"{"version": 2, "width": 2, "height": 2, "layers": [{"id":"a","name":"n","opacity":1.0,"visible":true}], "activeLayerId": "a", "layerImages": {"a": "!!!"}}"#)
                .is_err()
        );
    }

    #[test]
    fn data_url_prefix_is_tolerated() {
        let mut image = RgbaImage::new(2, 2);
        image.put_pixel(1, 1, Rgba([4, 5, 6, 255]));
        let payload = format!(
            "data:image/png;base64,{}",
            BASE64.encode(encode_png(&image).unwrap())
        );
        let text = format!(
            r#"{{"width":2,"height":2,"imageData":"{payload}"}}"#
        );
        let decoded = decode(&text).unwrap();
        let buf = decoded.canvas.buffer(decoded.canvas.active_layer).unwrap();
        assert_eq!(*buf.get_pixel(1, 1), Rgba([4, 5, 6, 255]));
    }

    #[test]
    fn composite_png_export_is_decodable() {
        let (canvas, _) = sample_project();
        let bytes = encode_composite_png(&canvas).unwrap();
        let round =
            image::load_from_memory_with_format(&bytes, image::ImageFormat::Png).unwrap();
        assert_eq!(round.to_rgba8().dimensions(), (6, 4));
    }
}
