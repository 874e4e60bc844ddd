//! Document replica
//!
//! Plain-text model of the shared buffer. The replica only understands
//! positional [`Edit`]s that have already been transformed by the sequencer;
//! replaying the same list of applied edits from empty always produces the
//! same text.

use ropey::Rope;
use serde::{Deserialize, Serialize};

use crate::crdt::TextDelta;
use crate::error::{CollabError, Result};

/// A positional edit against the replica's current content.
/// Positions and lengths count chars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Edit {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
}

impl Edit {
    pub fn position(&self) -> usize {
        match self {
            Edit::Insert { position, .. } | Edit::Delete { position, .. } => *position,
        }
    }

    /// Map a char offset in the pre-edit text to the post-edit text.
    /// Offsets at an insertion point stay before the inserted text.
    pub fn shift(&self, offset: usize) -> usize {
        match self {
            Edit::Insert { position, text } => {
                if offset > *position {
                    offset + text.chars().count()
                } else {
                    offset
                }
            }
            Edit::Delete { position, length } => {
                if offset <= *position {
                    offset
                } else if offset >= position + length {
                    offset - length
                } else {
                    *position
                }
            }
        }
    }
}

/// Outcome of one successful [`DocumentReplica::apply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedResult {
    /// Revision after the apply
    pub revision: u64,
    pub edits: Vec<Edit>,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentReplica {
    text: Rope,
    revision: u64,
}

impl DocumentReplica {
    /// Empty document at revision 0
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: &str, revision: u64) -> Self {
        Self {
            text: Rope::from_str(text),
            revision,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len_chars(&self) -> usize {
        self.text.len_chars()
    }

    pub fn len_bytes(&self) -> usize {
        self.text.len_bytes()
    }

    pub fn text(&self) -> String {
        self.text.to_string()
    }

    /// UTF-8 byte offset of char `position`
    pub fn byte_offset(&self, position: usize) -> Result<u32> {
        let byte = self
            .text
            .try_char_to_byte(position)
            .map_err(|_| CollabError::OutOfRangeOperation {
                position,
                length: 0,
                document_len: self.text.len_chars(),
            })?;
        u32::try_from(byte).map_err(|_| CollabError::OutOfRangeOperation {
            position,
            length: 0,
            document_len: self.text.len_chars(),
        })
    }

    /// Translate a byte-offset delta over the current content into the char
    /// edits [`apply`](Self::apply) expects. Nothing is changed here.
    pub fn edits_from_delta(&self, delta: &[TextDelta]) -> Result<Vec<Edit>> {
        let mut scratch = self.text.clone();
        let mut cursor = 0usize;
        let mut edits = Vec::new();

        let char_at = |rope: &Rope, byte: usize, length: usize| {
            rope.try_byte_to_char(byte)
                .map_err(|_| CollabError::OutOfRangeOperation {
                    position: byte,
                    length,
                    document_len: rope.len_chars(),
                })
        };

        for step in delta {
            match step {
                TextDelta::Retain(len) => cursor += *len as usize,
                TextDelta::Insert(text) => {
                    let position = char_at(&scratch, cursor, 0)?;
                    scratch.insert(position, text);
                    cursor += text.len();
                    edits.push(Edit::Insert {
                        position,
                        text: text.clone(),
                    });
                }
                TextDelta::Delete(len) => {
                    let len = *len as usize;
                    let start = char_at(&scratch, cursor, len)?;
                    let end = char_at(&scratch, cursor + len, len)?;
                    scratch.remove(start..end);
                    edits.push(Edit::Delete {
                        position: start,
                        length: end - start,
                    });
                }
            }
        }

        Ok(edits)
    }

    /// Read-only `(text, revision)` view for rendering
    pub fn snapshot(&self) -> (String, u64) {
        (self.text(), self.revision)
    }

    /// Apply one transformed operation. Edits are applied in order, each
    /// against the result of the previous one. Nothing is changed unless all
    /// of them fit.
    pub fn apply(&mut self, edits: Vec<Edit>) -> Result<AppliedResult> {
        let mut len = self.text.len_chars();
        for edit in &edits {
            len = match edit {
                Edit::Insert { position, text } => {
                    if *position > len {
                        return Err(CollabError::OutOfRangeOperation {
                            position: *position,
                            length: 0,
                            document_len: len,
                        });
                    }
                    len + text.chars().count()
                }
                Edit::Delete { position, length } => {
                    if position + length > len {
                        return Err(CollabError::OutOfRangeOperation {
                            position: *position,
                            length: *length,
                            document_len: len,
                        });
                    }
                    len - length
                }
            };
        }

        for edit in &edits {
            match edit {
                Edit::Insert { position, text } => self.text.insert(*position, text),
                Edit::Delete { position, length } => {
                    self.text.remove(*position..position + length)
                }
            }
        }
        self.revision += 1;

        Ok(AppliedResult {
            revision: self.revision,
            edits,
        })
    }

    /// Replace the content wholesale (resync). The revision never goes back;
    /// an identical reset is a no-op.
    pub fn reset(&mut self, text: &str, revision: u64) -> bool {
        if self.text == text {
            return false;
        }
        self.text = Rope::from_str(text);
        self.revision = revision.max(self.revision + 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(position: usize, text: &str) -> Edit {
        Edit::Insert {
            position,
            text: text.into(),
        }
    }

    fn delete(position: usize, length: usize) -> Edit {
        Edit::Delete { position, length }
    }

    #[test]
    fn apply_bumps_revision_once_per_operation() {
        let mut doc = DocumentReplica::new();
        let applied = doc.apply(vec![insert(0, "hello"), insert(5, " world")]).unwrap();
        assert_eq!(applied.revision, 1);
        assert_eq!(doc.snapshot(), ("hello world".to_string(), 1));

        doc.apply(vec![delete(0, 6)]).unwrap();
        assert_eq!(doc.snapshot(), ("world".to_string(), 2));
    }

    #[test]
    fn empty_apply_still_counts() {
        let mut doc = DocumentReplica::with_text("ab", 4);
        let applied = doc.apply(Vec::new()).unwrap();
        assert_eq!(applied.revision, 5);
        assert_eq!(doc.text(), "ab");
    }

    #[test]
    fn out_of_range_leaves_document_untouched() {
        let mut doc = DocumentReplica::with_text("abc", 0);
        let err = doc.apply(vec![insert(3, "d"), delete(2, 5)]).unwrap_err();
        assert_eq!(
            err,
            CollabError::OutOfRangeOperation {
                position: 2,
                length: 5,
                document_len: 4
            }
        );
        assert_eq!(doc.snapshot(), ("abc".to_string(), 0));
    }

    #[test]
    fn positions_count_chars_not_bytes() {
        let mut doc = DocumentReplica::with_text("héllo", 0);
        doc.apply(vec![delete(1, 1), insert(1, "é")]).unwrap();
        assert_eq!(doc.text(), "héllo");
        assert_eq!(doc.len_chars(), 5);
    }

    #[test]
    fn replay_reproduces_content() {
        let log = vec![
            vec![insert(0, "fn main() {}")],
            vec![insert(11, "\n")],
            vec![delete(0, 3)],
        ];
        let mut first = DocumentReplica::new();
        let mut second = DocumentReplica::new();
        for edits in &log {
            first.apply(edits.clone()).unwrap();
        }
        for edits in log {
            second.apply(edits).unwrap();
        }
        assert_eq!(first.snapshot(), second.snapshot());
    }

    #[test]
    fn reset_is_idempotent_and_monotonic() {
        let mut doc = DocumentReplica::with_text("old", 7);
        assert!(doc.reset("new", 3));
        assert_eq!(doc.snapshot(), ("new".to_string(), 8));
        assert!(!doc.reset("new", 3));
        assert_eq!(doc.snapshot(), ("new".to_string(), 8));
        assert!(doc.reset("newer", 20));
        assert_eq!(doc.revision(), 20);
    }

    #[test]
    fn byte_delta_becomes_char_edits() {
        let doc = DocumentReplica::with_text("héllo wörld", 0);
        let delta = vec![
            TextDelta::Retain(1),
            TextDelta::Delete(2),
            TextDelta::Insert("e".into()),
            TextDelta::Retain(5),
            TextDelta::Delete(2),
            TextDelta::Insert("o".into()),
        ];
        let edits = doc.edits_from_delta(&delta).unwrap();
        assert_eq!(edits, vec![delete(1, 1), insert(1, "e"), delete(7, 1), insert(7, "o")]);

        let mut doc = doc;
        doc.apply(edits).unwrap();
        assert_eq!(doc.text(), "hello world");
    }

    #[test]
    fn delta_past_the_end_is_out_of_range() {
        let doc = DocumentReplica::with_text("ab", 0);
        let delta = vec![TextDelta::Retain(5), TextDelta::Insert("x".into())];
        assert!(matches!(
            doc.edits_from_delta(&delta),
            Err(CollabError::OutOfRangeOperation { .. })
        ));
        assert_eq!(doc.byte_offset(2).unwrap(), 2);
        assert!(doc.byte_offset(3).is_err());
    }

    #[test]
    fn shift_through_edits() {
        assert_eq!(insert(2, "xy").shift(2), 2);
        assert_eq!(insert(2, "xy").shift(3), 5);
        assert_eq!(delete(2, 3).shift(1), 1);
        assert_eq!(delete(2, 3).shift(4), 2);
        assert_eq!(delete(2, 3).shift(6), 3);
    }
}
