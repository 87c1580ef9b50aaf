use std::collections::VecDeque;

/// Default undo depth for both the mask and curve histories.
pub const DEFAULT_CAPACITY: usize = 32;

/// Bounded linear undo/redo stack over immutable snapshots.
///
/// A ring of at most `capacity` entries with a cursor marking the current
/// position. Pushing after an undo truncates the redo tail; exceeding the
/// capacity evicts the oldest entry, keeping the cursor valid. The session
/// runs two independent instances, one over mask stroke-log snapshots and
/// one over curve snapshots.
pub struct History<T: Clone> {
    entries: VecDeque<T>,
    /// Number of entries up to and including the current snapshot.
    cursor: usize,
    capacity: usize,
}

impl<T: Clone> History<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            cursor: 0,
            capacity,
        }
    }

    /// Commits a snapshot, destroying any redo history past the cursor.
    pub fn push(&mut self, snapshot: T) {
        self.entries.truncate(self.cursor);
        self.entries.push_back(snapshot);
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        self.cursor = self.entries.len();
    }

    /// Steps back and returns the snapshot at the new position.
    pub fn undo(&mut self) -> Option<T> {
        if !self.can_undo() {
            return None;
        }
        self.cursor -= 1;
        Some(self.entries[self.cursor - 1].clone())
    }

    /// Steps forward and returns the snapshot at the new position.
    pub fn redo(&mut self) -> Option<T> {
        if !self.can_redo() {
            return None;
        }
        self.cursor += 1;
        Some(self.entries[self.cursor - 1].clone())
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 1
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    /// The snapshot at the current position, if any.
    pub fn current(&self) -> Option<&T> {
        if self.cursor > 0 {
            Some(&self.entries[self.cursor - 1])
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }
}
