use image::RgbaImage;

use crate::canvas::{CanvasState, LayerId};

/// Maximum number of retained history entries.
pub const MAX_HISTORY: usize = 50;

/// One recorded operation: the mutated layer and its buffer as it was
/// immediately before the mutation.
///
/// After an undo the roles flip: the snapshot then holds the state that was
/// just left, ready to be swapped back in by redo. Exactly one buffer is
/// stored per entry either way.
pub struct HistoryEntry {
    pub layer_id: LayerId,
    snapshot: RgbaImage,
}

/// Undo/redo history over a single ordered entry list.
///
/// `cursor` counts applied entries: `entries[..cursor]` have been committed
/// and not undone. Undo swaps the live buffer with `entries[cursor - 1]`,
/// redo with `entries[cursor]`. A before-snapshot is held in `pending`
/// between capture (pointer-down) and commit (operation end) and never
/// enters the list early.
pub struct HistoryManager {
    entries: Vec<HistoryEntry>,
    cursor: usize,
    pending: Option<HistoryEntry>,
    limit: usize,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(MAX_HISTORY)
    }
}

impl HistoryManager {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            pending: None,
            limit: limit.max(1),
        }
    }

    /// Snapshot a layer's buffer before a mutation. Held transiently until
    /// [`commit`](Self::commit) or [`discard_pending`](Self::discard_pending).
    pub fn capture_before(&mut self, canvas: &CanvasState, layer_id: LayerId) {
        match canvas.buffer(layer_id) {
            Some(buf) => {
                self.pending = Some(HistoryEntry {
                    layer_id,
                    snapshot: buf.clone(),
                });
            }
            None => crate::log_warn!("history: capture for unknown layer {layer_id}"),
        }
    }

    /// Drop the held before-snapshot (the operation turned out to be a no-op).
    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// Move the pending snapshot into the history: stale redo entries beyond
    /// the cursor are discarded, and past the size bound the oldest entry is
    /// dropped so the most recent operations always stay undoable.
    pub fn commit(&mut self) -> bool {
        let Some(entry) = self.pending.take() else {
            return false;
        };
        self.entries.truncate(self.cursor);
        self.entries.push(entry);
        self.cursor += 1;
        if self.entries.len() > self.limit {
            self.entries.remove(0);
            self.cursor -= 1;
        }
        true
    }

    /// Swap the last applied entry back into its layer. No-op at the start
    /// of history.
    pub fn undo(&mut self, canvas: &mut CanvasState) -> bool {
        if self.cursor == 0 {
            return false;
        }
        self.cursor -= 1;
        self.swap_entry(self.cursor, canvas);
        true
    }

    /// Re-apply the next entry. No-op at the end of history.
    pub fn redo(&mut self, canvas: &mut CanvasState) -> bool {
        if self.cursor == self.entries.len() {
            return false;
        }
        self.swap_entry(self.cursor, canvas);
        self.cursor += 1;
        true
    }

    /// Exchange the live buffer with the entry's snapshot. With one stored
    /// buffer per entry this is the whole undo/redo mechanism.
    fn swap_entry(&mut self, index: usize, canvas: &mut CanvasState) {
        let entry = &mut self.entries[index];
        match canvas.buffer_mut(entry.layer_id) {
            Some(buf) => std::mem::swap(buf, &mut entry.snapshot),
            None => crate::log_warn!(
                "history: layer {} no longer in store, swap skipped",
                entry.layer_id
            ),
        }
    }

    /// Remove every entry for a deleted layer. Entries at or before the
    /// cursor pull it back so the remaining history stays aligned.
    pub fn purge_layer(&mut self, layer_id: LayerId) {
        if self.pending.as_ref().is_some_and(|p| p.layer_id == layer_id) {
            self.pending = None;
        }
        let removed_before = self.entries[..self.cursor]
            .iter()
            .filter(|e| e.layer_id == layer_id)
            .count();
        self.entries.retain(|e| e.layer_id != layer_id);
        self.cursor = (self.cursor - removed_before).min(self.entries.len());
    }

    /// Forget everything, including any pending snapshot. Used on project
    /// load, since cross-session undo is not supported.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
        self.pending = None;
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
