use crate::item::{retain_valid, PlayableItem};

/// Ordered items plus a position.  `None` position means "no current item"
/// (empty playlist, or navigated past a boundary without looping).
#[derive(Debug, Clone, Default)]
pub struct PlaylistCursor {
    items: Vec<PlayableItem>,
    position: Option<usize>,
    looping: bool,
}

impl PlaylistCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the sequence wholesale.  Invalid items are dropped first, then
    /// `start_index` is clamped into range.
    pub fn set_playlist(&mut self, items: Vec<PlayableItem>, start_index: usize) {
        self.items = retain_valid(items);
        self.position = if self.items.is_empty() {
            None
        } else {
            Some(start_index.min(self.items.len() - 1))
        };
    }

    pub fn current(&self) -> Option<&PlayableItem> {
        self.position.and_then(|pos| self.items.get(pos))
    }

    pub fn next(&mut self) -> Option<&PlayableItem> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.position = match self.position {
            Some(pos) if pos < last => Some(pos + 1),
            Some(_) if self.looping => Some(0),
            // Parked past the end: stays parked until looping or a reset.
            None if self.looping => Some(0),
            _ => None,
        };
        self.current()
    }

    pub fn previous(&mut self) -> Option<&PlayableItem> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.position = match self.position {
            Some(pos) if pos > 0 => Some(pos - 1),
            Some(_) if self.looping => Some(last),
            None if self.looping => Some(last),
            _ => None,
        };
        self.current()
    }

    pub fn set_looping(&mut self, enabled: bool) {
        self.looping = enabled;
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    /// Align the position with an index reported by the player.  Out of
    /// range indices are ignored.
    pub fn select(&mut self, index: usize) -> Option<&PlayableItem> {
        if index < self.items.len() {
            self.position = Some(index);
        }
        self.current()
    }

    /// Swap the item at the current position for `item`, which must carry the
    /// same id.  Returns false when nothing was replaced.
    pub fn replace_current(&mut self, item: PlayableItem) -> bool {
        match self.position.and_then(|pos| self.items.get_mut(pos)) {
            Some(slot) if slot.id == item.id => {
                *slot = item;
                true
            }
            _ => false,
        }
    }

    pub fn items(&self) -> &[PlayableItem] {
        &self.items
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }
}
