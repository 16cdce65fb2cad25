use std::collections::{HashMap, HashSet};
use std::fmt;

use image::{Rgba, RgbaImage};
use uuid::Uuid;

/// Stable identifier of a layer, independent of its position in the stack.
pub type LayerId = Uuid;

/// Dimension cap per axis. Keeps buffer indices comfortably inside `u32`
/// and bounds worst-case allocation for a single canvas.
pub const MAX_CANVAS_DIM: u32 = 16_384;

fn clamp_dimension(value: u32, axis: &str) -> u32 {
    if value == 0 || value > MAX_CANVAS_DIM {
        crate::log_warn!("canvas {axis} {value} out of range, clamped");
        value.clamp(1, MAX_CANVAS_DIM)
    } else {
        value
    }
}

/// Failure of a single drawing or fill operation. Never fatal: the buffer is
/// left untouched and no history entry is recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EditError {
    /// A seed or draw point fell outside the canvas.
    OutOfRange { x: f32, y: f32 },
}

impl fmt::Display for EditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditError::OutOfRange { x, y } => {
                write!(f, "point ({x}, {y}) is outside the canvas")
            }
        }
    }
}

/// Layer metadata. Pixel data lives in the [`CanvasState`] buffer store,
/// keyed by `id`; a `Layer` record never owns pixels itself.
#[derive(Clone, Debug)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub visible: bool,
    /// Opacity in `[0, 1]`, applied during compositing.
    pub opacity: f32,
}

impl Layer {
    pub fn new(name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            visible: true,
            opacity: 1.0,
        }
    }
}

/// Direction for [`CanvasState::reorder_layer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerShift {
    /// Toward the top of the stack (index 0).
    Raise,
    /// Toward the bottom of the stack.
    Lower,
}

/// The layer store and compositor.
///
/// `layers[0]` is the topmost layer (rendered last). Every layer in the list
/// has exactly one pixel buffer in the store and vice versa; at least one
/// layer always exists. Canvas dimensions are fixed at creation.
///
/// The display buffer is derived state: it is fully recomputed by
/// [`composite`](Self::composite) and never written by drawing operations.
pub struct CanvasState {
    pub width: u32,
    pub height: u32,
    /// Ordered metadata, index 0 topmost.
    pub layers: Vec<Layer>,
    /// Pixel buffers keyed by stable id, reconciled against `layers`.
    buffers: HashMap<LayerId, RgbaImage>,
    pub active_layer: LayerId,
    display: RgbaImage,
}

impl CanvasState {
    /// Create a canvas with a single transparent layer.
    pub fn new(width: u32, height: u32) -> Self {
        let width = clamp_dimension(width, "width");
        let height = clamp_dimension(height, "height");
        let first = Layer::new("Layer 1".to_string());
        let active = first.id;
        let mut state = Self {
            width,
            height,
            layers: vec![first],
            buffers: HashMap::new(),
            active_layer: active,
            display: RgbaImage::new(width, height),
        };
        state.reconcile_buffers();
        state.composite();
        state
    }

    /// Rebuild a canvas from loaded layer metadata. Falls back to a single
    /// default layer when `layers` is empty so the no-layers state stays
    /// unrepresentable.
    pub fn from_layers(width: u32, height: u32, layers: Vec<Layer>, active: LayerId) -> Self {
        if layers.is_empty() {
            return Self::new(width, height);
        }
        let width = clamp_dimension(width, "width");
        let height = clamp_dimension(height, "height");
        let active = if layers.iter().any(|l| l.id == active) {
            active
        } else {
            layers[0].id
        };
        let mut state = Self {
            width,
            height,
            layers,
            buffers: HashMap::new(),
            active_layer: active,
            display: RgbaImage::new(width, height),
        };
        state.reconcile_buffers();
        state.composite();
        state
    }

    // ---- buffer store -------------------------------------------------------

    /// Bring the buffer store back in sync with the layer list: buffers whose
    /// id left the list are discarded, new ids get a fully transparent buffer.
    pub fn reconcile_buffers(&mut self) {
        let live: HashSet<LayerId> = self.layers.iter().map(|l| l.id).collect();
        self.buffers.retain(|id, _| live.contains(id));
        for layer in &self.layers {
            self.buffers
                .entry(layer.id)
                .or_insert_with(|| RgbaImage::new(self.width, self.height));
        }
    }

    pub fn buffer(&self, id: LayerId) -> Option<&RgbaImage> {
        self.buffers.get(&id)
    }

    pub fn buffer_mut(&mut self, id: LayerId) -> Option<&mut RgbaImage> {
        self.buffers.get_mut(&id)
    }

    pub fn active_buffer_mut(&mut self) -> Option<&mut RgbaImage> {
        self.buffers.get_mut(&self.active_layer)
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    fn layer_index(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    // ---- structural operations ----------------------------------------------

    /// Add a new transparent layer on top of the stack and make it active.
    pub fn add_layer(&mut self) -> LayerId {
        let name = format!("Layer {}", self.layers.len() + 1);
        let layer = Layer::new(name);
        let id = layer.id;
        self.layers.insert(0, layer);
        self.active_layer = id;
        self.reconcile_buffers();
        id
    }

    /// Insert a copy of `id` directly above it and make the copy active.
    pub fn duplicate_layer(&mut self, id: LayerId) -> Option<LayerId> {
        let idx = self.layer_index(id)?;
        let source = &self.layers[idx];
        let mut copy = Layer::new(format!("{} copy", source.name));
        copy.visible = source.visible;
        copy.opacity = source.opacity;
        let copy_id = copy.id;
        self.layers.insert(idx, copy);
        self.reconcile_buffers();
        if let Some(pixels) = self.buffers.get(&id).cloned() {
            self.buffers.insert(copy_id, pixels);
        }
        self.active_layer = copy_id;
        Some(copy_id)
    }

    /// Remove a layer and its buffer. Deleting the sole remaining layer is
    /// refused (returns `false`): the empty stack is not a valid state.
    pub fn delete_layer(&mut self, id: LayerId) -> bool {
        if self.layers.len() <= 1 {
            return false;
        }
        let Some(idx) = self.layer_index(id) else {
            crate::log_warn!("delete_layer: unknown layer {id}");
            return false;
        };
        self.layers.remove(idx);
        if self.active_layer == id {
            let fallback = idx.min(self.layers.len() - 1);
            self.active_layer = self.layers[fallback].id;
        }
        self.reconcile_buffers();
        true
    }

    /// Move a layer one slot toward the top (`Raise`) or bottom (`Lower`).
    /// A shift past either end is a no-op; returns whether the order changed.
    pub fn reorder_layer(&mut self, id: LayerId, shift: LayerShift) -> bool {
        let Some(idx) = self.layer_index(id) else {
            crate::log_warn!("reorder_layer: unknown layer {id}");
            return false;
        };
        match shift {
            LayerShift::Raise if idx > 0 => {
                self.layers.swap(idx, idx - 1);
                true
            }
            LayerShift::Lower if idx + 1 < self.layers.len() => {
                self.layers.swap(idx, idx + 1);
                true
            }
            _ => false,
        }
    }

    pub fn set_layer_visibility(&mut self, id: LayerId, visible: bool) {
        match self.layers.iter_mut().find(|l| l.id == id) {
            Some(layer) => layer.visible = visible,
            None => crate::log_warn!("set_layer_visibility: unknown layer {id}"),
        }
    }

    pub fn set_layer_opacity(&mut self, id: LayerId, opacity: f32) {
        match self.layers.iter_mut().find(|l| l.id == id) {
            Some(layer) => layer.opacity = opacity.clamp(0.0, 1.0),
            None => crate::log_warn!("set_layer_opacity: unknown layer {id}"),
        }
    }

    pub fn rename_layer(&mut self, id: LayerId, name: String) {
        match self.layers.iter_mut().find(|l| l.id == id) {
            Some(layer) => layer.name = name,
            None => crate::log_warn!("rename_layer: unknown layer {id}"),
        }
    }

    pub fn select_layer(&mut self, id: LayerId) {
        if self.layer_index(id).is_some() {
            self.active_layer = id;
        } else {
            crate::log_warn!("select_layer: unknown layer {id}");
        }
    }

    /// Reset a layer's buffer to fully transparent.
    pub fn clear_layer(&mut self, id: LayerId) {
        match self.buffers.get_mut(&id) {
            Some(buf) => {
                for px in buf.pixels_mut() {
                    *px = Rgba([0, 0, 0, 0]);
                }
            }
            None => crate::log_warn!("clear_layer: unknown layer {id}"),
        }
    }

    // ---- compositing --------------------------------------------------------

    /// Recompute the display buffer from scratch: opaque white background,
    /// then every visible layer bottom-to-top, source-over at its opacity.
    /// Pure in its inputs: identical state always yields identical output.
    pub fn composite(&mut self) {
        for px in self.display.pixels_mut() {
            *px = Rgba([255, 255, 255, 255]);
        }
        for layer in self.layers.iter().rev() {
            if !layer.visible {
                continue;
            }
            let Some(buf) = self.buffers.get(&layer.id) else {
                continue;
            };
            for (dst, src) in self.display.pixels_mut().zip(buf.pixels()) {
                *dst = blend_over(*dst, *src, layer.opacity);
            }
        }
    }

    /// The composited image. Derived state; callers must treat it as
    /// read-only and let [`composite`](Self::composite) refresh it.
    pub fn display(&self) -> &RgbaImage {
        &self.display
    }
}

/// Straight-alpha source-over with an extra opacity factor on the top pixel.
/// Channel math rounds to nearest so e.g. 50% red over white lands on 128.
pub fn blend_over(base: Rgba<u8>, top: Rgba<u8>, opacity: f32) -> Rgba<u8> {
    if top[3] == 0 {
        return base;
    }
    if top[3] == 255 && opacity >= 1.0 {
        return top;
    }
    let a = (top[3] as f32 / 255.0) * opacity.clamp(0.0, 1.0);
    let inv = 1.0 - a;
    let base_a = base[3] as f32 / 255.0;
    let out_a = a + base_a * inv;
    Rgba([
        (top[0] as f32 * a + base[0] as f32 * inv + 0.5) as u8,
        (top[1] as f32 * a + base[1] as f32 * inv + 0.5) as u8,
        (top[2] as f32 * a + base[2] as f32 * inv + 0.5) as u8,
        (out_a * 255.0 + 0.5) as u8,
    ])
}
