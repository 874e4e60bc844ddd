//! Change encoder
//!
//! Turns the editor widget's "text changed" events into positional [`Edit`]s.
//! Widgets that report the changed range are encoded without looking at the
//! document; full before/after snapshots fall back to a bounded diff.

use similar::{Algorithm, DiffOp, TextDiff};

use crate::config::DiffLimits;
use crate::document::Edit;

/// One range reported by the editor widget: `removed` chars at `offset` were
/// replaced by `inserted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeChange {
    pub offset: usize,
    pub removed: usize,
    pub inserted: String,
}

impl RangeChange {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            removed: 0,
            inserted: text.into(),
        }
    }

    pub fn delete(offset: usize, removed: usize) -> Self {
        Self {
            offset,
            removed,
            inserted: String::new(),
        }
    }
}

/// Raw change event from the editor widget
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextChange {
    /// Changed ranges, each relative to the text after the previous one
    Ranges(Vec<RangeChange>),

    /// Only the full text before and after is known
    Full { before: String, after: String },
}

#[derive(Debug, Clone)]
pub struct ChangeEncoder {
    limits: DiffLimits,
    coalescing: bool,
}

impl ChangeEncoder {
    pub fn new(limits: DiffLimits) -> Self {
        Self {
            limits,
            coalescing: false,
        }
    }

    /// While set, output is merged into as few edits as possible.
    pub fn set_backpressure(&mut self, on: bool) {
        if on != self.coalescing {
            tracing::debug!(coalescing = on, "encoder backpressure changed");
        }
        self.coalescing = on;
    }

    pub fn is_coalescing(&self) -> bool {
        self.coalescing
    }

    pub fn encode(&self, change: TextChange) -> Vec<Edit> {
        match change {
            TextChange::Ranges(ranges) => {
                let edits = ranges.into_iter().flat_map(range_edits).collect();
                if self.coalescing {
                    coalesce(edits)
                } else {
                    edits
                }
            }
            TextChange::Full { before, after } => self.encode_full(&before, &after),
        }
    }

    fn encode_full(&self, before: &str, after: &str) -> Vec<Edit> {
        let prefix = before
            .chars()
            .zip(after.chars())
            .take_while(|(a, b)| a == b)
            .count();
        let old_rest = &before[byte_offset(before, prefix)..];
        let new_rest = &after[byte_offset(after, prefix)..];

        let suffix = old_rest
            .chars()
            .rev()
            .zip(new_rest.chars().rev())
            .take_while(|(a, b)| a == b)
            .count();
        let old_len = old_rest.chars().count() - suffix;
        let new_len = new_rest.chars().count() - suffix;
        let old_mid = &old_rest[..byte_offset(old_rest, old_len)];
        let new_mid = &new_rest[..byte_offset(new_rest, new_len)];

        if old_len == 0 && new_len == 0 {
            return Vec::new();
        }

        let region = old_len.max(new_len);
        if self.coalescing || region > self.limits.line_diff_limit {
            return replace(prefix, old_len, new_mid);
        }

        let mut config = TextDiff::configure();
        config
            .algorithm(Algorithm::Myers)
            .timeout(self.limits.timeout());

        if region <= self.limits.char_diff_limit {
            diff_edits(&config.diff_chars(old_mid, new_mid), prefix)
        } else {
            diff_edits(&config.diff_lines(old_mid, new_mid), prefix)
        }
    }
}

fn range_edits(range: RangeChange) -> Vec<Edit> {
    let mut edits = Vec::with_capacity(2);
    if range.removed > 0 {
        edits.push(Edit::Delete {
            position: range.offset,
            length: range.removed,
        });
    }
    if !range.inserted.is_empty() {
        edits.push(Edit::Insert {
            position: range.offset,
            text: range.inserted,
        });
    }
    edits
}

fn replace(position: usize, removed: usize, inserted: &str) -> Vec<Edit> {
    range_edits(RangeChange {
        offset: position,
        removed,
        inserted: inserted.to_string(),
    })
}

fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(index, _)| index)
}

/// Walk the diff, emitting edits against the progressively edited text.
fn diff_edits(diff: &TextDiff<'_, '_, '_, str>, offset: usize) -> Vec<Edit> {
    let old = diff.old_slices();
    let new = diff.new_slices();
    let chars = |slices: &[&str]| slices.iter().map(|s| s.chars().count()).sum::<usize>();

    let mut cursor = offset;
    let mut edits = Vec::new();

    for op in diff.ops() {
        match *op {
            DiffOp::Equal { old_index, len, .. } => {
                cursor += chars(&old[old_index..old_index + len]);
            }
            DiffOp::Delete {
                old_index, old_len, ..
            } => {
                edits.push(Edit::Delete {
                    position: cursor,
                    length: chars(&old[old_index..old_index + old_len]),
                });
            }
            DiffOp::Insert {
                new_index, new_len, ..
            } => {
                let text = new[new_index..new_index + new_len].concat();
                let inserted = text.chars().count();
                edits.push(Edit::Insert {
                    position: cursor,
                    text,
                });
                cursor += inserted;
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                edits.push(Edit::Delete {
                    position: cursor,
                    length: chars(&old[old_index..old_index + old_len]),
                });
                let text = new[new_index..new_index + new_len].concat();
                let inserted = text.chars().count();
                edits.push(Edit::Insert {
                    position: cursor,
                    text,
                });
                cursor += inserted;
            }
        }
    }

    edits
}

/// Merge runs of contiguous typing and deleting.
fn coalesce(edits: Vec<Edit>) -> Vec<Edit> {
    let mut merged: Vec<Edit> = Vec::with_capacity(edits.len());

    for edit in edits {
        let absorbed = match (merged.last_mut(), &edit) {
            (
                Some(Edit::Insert { position, text }),
                Edit::Insert {
                    position: next,
                    text: more,
                },
            ) => {
                if *next == *position + text.chars().count() {
                    text.push_str(more);
                    true
                } else if *next == *position {
                    text.insert_str(0, more);
                    true
                } else {
                    false
                }
            }
            (
                Some(Edit::Delete { position, length }),
                Edit::Delete {
                    position: next,
                    length: more,
                },
            ) => {
                if *next == *position {
                    *length += more;
                    true
                } else if *next + more == *position {
                    *position = *next;
                    *length += more;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        if !absorbed {
            merged.push(edit);
        }
    }

    merged
}
