use image::{Rgba, RgbaImage};

use crate::canvas::{CanvasState, EditError, LayerId, LayerShift};
use crate::components::fill::{self, FillOutcome};
use crate::components::history::HistoryManager;
use crate::components::tools::{self, Tool, ToolSettings};
use crate::io::{self, DocError};

/// An in-flight freehand stroke, alive between pointer-down and pointer-up.
struct StrokeSession {
    last: (f32, f32),
}

/// Single open document: the layer store, its history, the current tool
/// settings, and the interaction state of an in-flight stroke.
///
/// Every operation here runs synchronously and recomposites the display
/// buffer before returning, so callers always observe a consistent image.
pub struct Project {
    canvas: CanvasState,
    history: HistoryManager,
    pub settings: ToolSettings,
    stroke: Option<StrokeSession>,
}

impl Project {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            canvas: CanvasState::new(width, height),
            history: HistoryManager::default(),
            settings: ToolSettings::default(),
            stroke: None,
        }
    }

    pub fn canvas(&self) -> &CanvasState {
        &self.canvas
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    /// The composited image, current as of the last completed operation.
    pub fn composited_image(&self) -> &RgbaImage {
        self.canvas.display()
    }

    fn check_bounds(&self, point: (f32, f32)) -> Result<(), EditError> {
        let (x, y) = point;
        if x < 0.0 || y < 0.0 || x >= self.canvas.width as f32 || y >= self.canvas.height as f32 {
            return Err(EditError::OutOfRange { x, y });
        }
        Ok(())
    }

    /// Brush radius for one stamp. Pressure modulates the pen only.
    fn stroke_radius(&self, pressure: Option<f32>) -> f32 {
        let base = self.settings.brush_size / 2.0;
        if self.settings.tool == Tool::Pen && self.settings.pressure_enabled {
            base * pressure.unwrap_or(1.0).clamp(0.0, 1.0)
        } else {
            base
        }
    }

    // ---- stroke lifecycle ---------------------------------------------------

    /// Begin a stroke: snapshot the active layer for history, then draw the
    /// starting dot. An out-of-range point fails without opening a stroke.
    pub fn draw_start(&mut self, point: (f32, f32), pressure: Option<f32>) -> Result<(), EditError> {
        // A stray second pointer-down finalizes the stroke already open.
        if self.stroke.is_some() {
            self.draw_end();
        }
        self.check_bounds(point)?;

        self.history.capture_before(&self.canvas, self.canvas.active_layer);
        let radius = self.stroke_radius(pressure);
        let (color, tool) = (self.settings.color, self.settings.tool);
        if let Some(buf) = self.canvas.active_buffer_mut() {
            tools::draw_dot(buf, point, radius, color, tool);
        }
        self.stroke = Some(StrokeSession { last: point });
        self.canvas.composite();
        Ok(())
    }

    /// Extend the stroke with a round-capped segment from the previous
    /// point. Without an open stroke this is a silent no-op; an out-of-range
    /// point fails just this segment and keeps the stroke alive.
    pub fn draw_move(&mut self, point: (f32, f32), pressure: Option<f32>) -> Result<(), EditError> {
        let Some(session) = &self.stroke else {
            return Ok(());
        };
        let from = session.last;
        self.check_bounds(point)?;

        let radius = self.stroke_radius(pressure);
        let (color, tool) = (self.settings.color, self.settings.tool);
        if let Some(buf) = self.canvas.active_buffer_mut() {
            tools::draw_segment(buf, from, point, radius, color, tool);
        }
        if let Some(session) = &mut self.stroke {
            session.last = point;
        }
        self.canvas.composite();
        Ok(())
    }

    /// Finish the stroke and commit its before-snapshot as one history step.
    /// Idempotent: callers also invoke this on loss of pointer capture, so a
    /// stroke is never left open.
    pub fn draw_end(&mut self) {
        if self.stroke.take().is_some() {
            self.history.commit();
        }
    }

    // ---- fill ---------------------------------------------------------------

    /// Flood-fill the active layer from `point`. Filling an area that
    /// already has the fill color records no history.
    pub fn fill(&mut self, point: (f32, f32), color: Rgba<u8>) -> Result<FillOutcome, EditError> {
        self.check_bounds(point)?;
        let seed = (point.0 as u32, point.1 as u32);
        let active = self.canvas.active_layer;

        self.history.capture_before(&self.canvas, active);
        let Some(buf) = self.canvas.active_buffer_mut() else {
            self.history.discard_pending();
            return Err(EditError::OutOfRange { x: point.0, y: point.1 });
        };
        match fill::flood_fill(buf, seed, color) {
            Ok(FillOutcome::Filled) => {
                self.history.commit();
                self.canvas.composite();
                Ok(FillOutcome::Filled)
            }
            Ok(FillOutcome::AlreadyFilled) => {
                self.history.discard_pending();
                Ok(FillOutcome::AlreadyFilled)
            }
            Err(e) => {
                self.history.discard_pending();
                Err(e)
            }
        }
    }

    /// Fill the active layer from a `#RRGGBB` color string.
    pub fn fill_hex(&mut self, point: (f32, f32), color: &str) -> Result<FillOutcome, EditError> {
        let color = tools::parse_hex_color(color).unwrap_or(self.settings.color);
        self.fill(point, color)
    }

    // ---- history ------------------------------------------------------------

    pub fn undo(&mut self) -> bool {
        let changed = self.history.undo(&mut self.canvas);
        if changed {
            self.canvas.composite();
        }
        changed
    }

    pub fn redo(&mut self) -> bool {
        let changed = self.history.redo(&mut self.canvas);
        if changed {
            self.canvas.composite();
        }
        changed
    }

    /// Wipe the active layer to transparent, as one undoable step.
    pub fn clear_active_layer(&mut self) {
        let active = self.canvas.active_layer;
        self.history.capture_before(&self.canvas, active);
        self.canvas.clear_layer(active);
        self.history.commit();
        self.canvas.composite();
    }

    // ---- layer management ---------------------------------------------------

    pub fn add_layer(&mut self) -> LayerId {
        let id = self.canvas.add_layer();
        self.canvas.composite();
        id
    }

    pub fn duplicate_layer(&mut self, id: LayerId) -> Option<LayerId> {
        let copy = self.canvas.duplicate_layer(id);
        if copy.is_some() {
            self.canvas.composite();
        }
        copy
    }

    /// Delete a layer; its history entries become permanently unreachable
    /// and are purged. Refuses to delete the sole remaining layer.
    pub fn delete_layer(&mut self, id: LayerId) -> bool {
        if !self.canvas.delete_layer(id) {
            return false;
        }
        self.history.purge_layer(id);
        self.canvas.composite();
        true
    }

    pub fn reorder_layer(&mut self, id: LayerId, shift: LayerShift) -> bool {
        let moved = self.canvas.reorder_layer(id, shift);
        if moved {
            self.canvas.composite();
        }
        moved
    }

    pub fn set_layer_visibility(&mut self, id: LayerId, visible: bool) {
        self.canvas.set_layer_visibility(id, visible);
        self.canvas.composite();
    }

    pub fn set_layer_opacity(&mut self, id: LayerId, opacity: f32) {
        self.canvas.set_layer_opacity(id, opacity);
        self.canvas.composite();
    }

    pub fn rename_layer(&mut self, id: LayerId, name: String) {
        self.canvas.rename_layer(id, name);
    }

    pub fn select_layer(&mut self, id: LayerId) {
        self.canvas.select_layer(id);
    }

    // ---- documents ----------------------------------------------------------

    /// Serialize the full editable state as v2 JSON text.
    pub fn export_project(&self) -> Result<String, DocError> {
        io::encode(&self.canvas, &self.settings)
    }

    /// PNG bytes of the composited image.
    pub fn export_composite_png(&self) -> Result<Vec<u8>, DocError> {
        io::encode_composite_png(&self.canvas)
    }

    /// Replace the whole editable state from a v1/v2 document. On any
    /// decode failure the current state is left untouched. History is
    /// cleared, since cross-session undo is not supported.
    pub fn import_project(&mut self, text: &str) -> Result<(), DocError> {
        let decoded = io::decode(text)?;
        self.canvas = decoded.canvas;
        self.settings = decoded.settings;
        self.history.clear();
        self.stroke = None;
        Ok(())
    }

    /// Build a project directly from document text.
    pub fn from_document(text: &str) -> Result<Self, DocError> {
        let decoded = io::decode(text)?;
        Ok(Self {
            canvas: decoded.canvas,
            history: HistoryManager::default(),
            settings: decoded.settings,
            stroke: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    fn active_buffer(project: &Project) -> &RgbaImage {
        project
            .canvas()
            .buffer(project.canvas().active_layer)
            .unwrap()
    }

    #[test]
    fn stroke_draws_and_undoes_as_one_step() {
        let mut project = Project::new(20, 20);
        project.settings.brush_size = 4.0;
        let before = active_buffer(&project).clone();

        project.draw_start((5.0, 5.0), None).unwrap();
        project.draw_move((15.0, 5.0), None).unwrap();
        project.draw_move((15.0, 15.0), None).unwrap();
        project.draw_end();

        assert_ne!(before.as_raw(), active_buffer(&project).as_raw());
        assert_eq!(project.history().len(), 1);

        assert!(project.undo());
        assert_eq!(before.as_raw(), active_buffer(&project).as_raw());
    }

    #[test]
    fn mid_stroke_moves_are_not_individual_steps() {
        let mut project = Project::new(20, 20);
        project.draw_start((2.0, 2.0), None).unwrap();
        for i in 3..=12 {
            project.draw_move((i as f32, 2.0), None).unwrap();
        }
        assert_eq!(project.history().len(), 0);
        project.draw_end();
        assert_eq!(project.history().len(), 1);
    }

    #[test]
    fn out_of_range_start_draws_nothing_and_records_nothing() {
        let mut project = Project::new(10, 10);
        let before = active_buffer(&project).clone();
        assert!(project.draw_start((-1.0, 5.0), None).is_err());
        assert!(project.draw_start((5.0, 10.0), None).is_err());
        assert_eq!(before.as_raw(), active_buffer(&project).as_raw());
        project.draw_end();
        assert_eq!(project.history().len(), 0);
    }

    #[test]
    fn out_of_range_move_fails_segment_but_stroke_survives() {
        let mut project = Project::new(10, 10);
        project.draw_start((5.0, 5.0), None).unwrap();
        assert!(project.draw_move((50.0, 5.0), None).is_err());
        // The stroke is still alive and continues from the last good point.
        project.draw_move((8.0, 5.0), None).unwrap();
        project.draw_end();
        assert_eq!(project.history().len(), 1);
    }

    #[test]
    fn eraser_stroke_removes_pen_pixels() {
        let mut project = Project::new(10, 10);
        project.settings.brush_size = 6.0;
        project.draw_start((5.0, 5.0), None).unwrap();
        project.draw_end();
        assert_eq!(active_buffer(&project).get_pixel(5, 5)[3], 255);

        project.settings.tool = Tool::Eraser;
        project.draw_start((5.0, 5.0), None).unwrap();
        project.draw_end();
        assert_eq!(active_buffer(&project).get_pixel(5, 5)[3], 0);
    }

    #[test]
    fn pressure_scales_pen_width_only_when_enabled() {
        let mut project = Project::new(32, 32);
        project.settings.brush_size = 10.0;
        project.draw_start((8.0, 8.0), Some(0.2)).unwrap();
        project.draw_end();
        // Pressure disabled: full radius 5 despite the light touch.
        assert_eq!(active_buffer(&project).get_pixel(12, 8)[3], 255);
        project.undo();

        project.settings.pressure_enabled = true;
        project.draw_start((8.0, 8.0), Some(0.2)).unwrap();
        project.draw_end();
        // Radius 1: four pixels away stays empty.
        assert_eq!(active_buffer(&project).get_pixel(12, 8)[3], 0);
        assert_eq!(active_buffer(&project).get_pixel(8, 8)[3], 255);
    }

    #[test]
    fn fill_then_undo_then_redo() {
        let mut project = Project::new(8, 8);
        project.fill((4.0, 4.0), RED).unwrap();
        assert_eq!(*active_buffer(&project).get_pixel(0, 0), RED);

        assert!(project.undo());
        assert_eq!(active_buffer(&project).get_pixel(0, 0)[3], 0);
        assert!(project.redo());
        assert_eq!(*active_buffer(&project).get_pixel(0, 0), RED);
    }

    #[test]
    fn refill_records_no_history() {
        let mut project = Project::new(8, 8);
        project.fill((4.0, 4.0), RED).unwrap();
        assert_eq!(project.history().len(), 1);
        let outcome = project.fill((4.0, 4.0), RED).unwrap();
        assert_eq!(outcome, FillOutcome::AlreadyFilled);
        assert_eq!(project.history().len(), 1);
        assert!(!project.history().has_pending());
    }

    #[test]
    fn fill_out_of_range_is_an_error() {
        let mut project = Project::new(8, 8);
        assert!(project.fill((8.0, 0.0), RED).is_err());
        assert_eq!(project.history().len(), 0);
    }

    #[test]
    fn interleaved_strokes_and_fills_roundtrip() {
        let mut project = Project::new(16, 16);
        let initial = active_buffer(&project).clone();

        project.draw_start((3.0, 3.0), None).unwrap();
        project.draw_move((12.0, 3.0), None).unwrap();
        project.draw_end();
        project.fill((8.0, 12.0), RED).unwrap();
        project.draw_start((8.0, 8.0), None).unwrap();
        project.draw_end();

        assert_eq!(project.history().len(), 3);
        for _ in 0..3 {
            assert!(project.undo());
        }
        assert_eq!(initial.as_raw(), active_buffer(&project).as_raw());
    }

    #[test]
    fn deleting_a_layer_purges_its_history() {
        let mut project = Project::new(8, 8);
        let first = project.canvas().active_layer;
        project.fill((4.0, 4.0), RED).unwrap();

        let second = project.add_layer();
        project.draw_start((4.0, 4.0), None).unwrap();
        project.draw_end();
        assert_eq!(project.history().len(), 2);

        assert!(project.delete_layer(second));
        assert_eq!(project.history().len(), 1);

        // The remaining entry still undoes the fill on the first layer.
        assert!(project.undo());
        assert_eq!(project.canvas().buffer(first).unwrap().get_pixel(4, 4)[3], 0);
        assert!(!project.undo());
    }

    #[test]
    fn clear_active_layer_is_undoable() {
        let mut project = Project::new(8, 8);
        project.fill((4.0, 4.0), RED).unwrap();
        project.clear_active_layer();
        assert_eq!(active_buffer(&project).get_pixel(4, 4)[3], 0);
        assert!(project.undo());
        assert_eq!(*active_buffer(&project).get_pixel(4, 4), RED);
    }

    #[test]
    fn layer_scenario_from_single_to_three() {
        let mut project = Project::new(4, 4);
        let l1 = project.canvas().active_layer;
        let l2 = project.add_layer();
        let l3 = project.add_layer();
        let order: Vec<LayerId> = project.canvas().layers.iter().map(|l| l.id).collect();
        assert_eq!(order, vec![l3, l2, l1]);
        assert_eq!(project.canvas().active_layer, l3);

        assert!(project.delete_layer(l1));
        assert!(project.delete_layer(l2));
        assert!(!project.delete_layer(l3));
        assert_eq!(project.canvas().layers.len(), 1);
    }

    #[test]
    fn import_replaces_state_and_clears_history() {
        let mut project = Project::new(8, 8);
        project.fill((4.0, 4.0), RED).unwrap();
        let text = project.export_project().unwrap();

        let mut other = Project::new(2, 2);
        other.draw_start((0.0, 0.0), None).unwrap();
        other.draw_end();
        assert!(other.history().can_undo());

        other.import_project(&text).unwrap();
        assert_eq!(other.canvas().width, 8);
        assert!(!other.history().can_undo());
        assert_eq!(*active_buffer(&other).get_pixel(4, 4), RED);
    }

    #[test]
    fn failed_import_leaves_state_untouched() {
        let mut project = Project::new(8, 8);
        project.fill((4.0, 4.0), RED).unwrap();
        let before = active_buffer(&project).clone();

        assert!(project.import_project("{\"version\": 2}").is_err());
        assert_eq!(project.canvas().width, 8);
        assert_eq!(before.as_raw(), active_buffer(&project).as_raw());
        assert!(project.history().can_undo());
    }

    #[test]
    fn display_reflects_fill_over_white_background() {
        let mut project = Project::new(4, 4);
        project.fill_hex((1.0, 1.0), "#FF0000").unwrap();
        assert_eq!(*project.composited_image().get_pixel(1, 1), RED);

        project.undo();
        assert_eq!(
            *project.composited_image().get_pixel(1, 1),
            Rgba([255, 255, 255, 255])
        );
    }
}
