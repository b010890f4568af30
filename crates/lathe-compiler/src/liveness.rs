//! Live ranges of draft values, measured in instruction indices.

use rustc_hash::FxHashSet;

use crate::compile::{Step, Value, ValueId};

/// Inclusive instruction span in which a value must stay in its register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub start: usize,
    pub end: usize,
}

impl LiveRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Compute one range per value.
///
/// A value lives from the step that writes it to its last reader. Inputs live
/// from the start and pinned values (inputs, fetches) until past the last step.
pub(crate) fn analyze(values: &[Value], steps: &[Step], pinned: &FxHashSet<ValueId>) -> Vec<LiveRange> {
    let end_of_program = steps.len();
    let mut ranges = vec![LiveRange::new(0, 0); values.len()];

    for (i, step) in steps.iter().enumerate() {
        if let Some(v) = step.writes() {
            ranges[v] = LiveRange::new(i, i);
        }
        for &v in step.reads() {
            ranges[v].end = ranges[v].end.max(i);
        }
    }
    for (v, value) in values.iter().enumerate() {
        if value.input {
            ranges[v].start = 0;
        }
        if value.input || pinned.contains(&v) {
            ranges[v].end = end_of_program;
        }
    }
    ranges
}
