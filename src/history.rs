use std::collections::VecDeque;

use crate::memory::Word;

/// Maximum number of steps that can be undone.
pub const HISTORY_CAPACITY: usize = 100;

/// The minimal record needed to invert one step.
///
/// A move-only step can change only three cells: its destination, PC and
/// (through the output port) OUT. Everything else is derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub pc_before: Word,
    pub instruction: Word,
    pub src: usize,
    pub dst: usize,
    pub src_value: Word,
    pub dst_value: Word,
    pub out_before: Word,
}

/// Bounded undo buffer. When full, pushing drops the oldest entry.
#[derive(Debug, Default)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() >= HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Remove and return the most recent entry.
    pub fn pop(&mut self) -> Option<HistoryEntry> {
        self.entries.pop_back()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
