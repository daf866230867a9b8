//! In-memory character sequence backing a shared document.
//!
//! The document is a flat, totally ordered sequence of [`Character`]s
//! bracketed by two invisible sentinels:
//!
//! ```text
//! ┌───────┬──────┬──────┬─────┬──────┬─────┐
//! │ start │ 1@1  │ 2@3  │ 1@2 │ 4@1  │ end │
//! │ (inv) │ "h"  │ "i"  │ ✝   │ "!"  │(inv)│
//! └───────┴──────┴──────┴─────┴──────┴─────┘
//! ```
//!
//! Deleted characters stay in the sequence as tombstones (`visible =
//! false`) so that the neighbor references of later operations keep
//! resolving. The user-facing text is the concatenation of the visible
//! characters in sequence order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of the leading sentinel.
pub const START_ID: &str = "start";

/// Identifier of the trailing sentinel.
pub const END_ID: &str = "end";

/// Errors produced by document and integration operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrdtError {
    #[error("position {0} out of bounds")]
    PositionOutOfBounds(usize),
    #[error("empty character id")]
    EmptyId,
    #[error("duplicate character id {0}")]
    DuplicateId(String),
    #[error("character {0} not found")]
    NotFound(String),
    #[error("subsequence bound(s) not present")]
    BoundsNotPresent,
    #[error("invalid document: {0}")]
    Invalid(String),
}

/// A single element of the shared sequence.
///
/// `prev_id`/`next_id` are identifiers, never indices: they name the
/// neighbors the character was generated between, and are the causal
/// anchors used to order concurrent insertions. They are immutable after
/// generation; integration at every site depends on reading the same
/// anchors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    /// Globally unique id, canonically `"<counter>@<site>"`.
    pub id: String,
    /// One user-visible code point; empty for the sentinels.
    pub value: String,
    /// Tombstone flag: false for sentinels and deleted characters.
    pub visible: bool,
    pub prev_id: String,
    pub next_id: String,
}

impl Character {
    pub fn new(
        id: impl Into<String>,
        value: impl Into<String>,
        visible: bool,
        prev_id: impl Into<String>,
        next_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            visible,
            prev_id: prev_id.into(),
            next_id: next_id.into(),
        }
    }

    fn start() -> Self {
        Self::new(START_ID, "", false, "", END_ID)
    }

    fn end() -> Self {
        Self::new(END_ID, "", false, START_ID, "")
    }

    /// Whether this is one of the two sentinels.
    pub fn is_sentinel(&self) -> bool {
        self.id == START_ID || self.id == END_ID
    }
}

/// Parse a canonical `"<counter>@<site>"` id.
fn parse_id(id: &str) -> Option<(u64, u64)> {
    let (counter, site) = id.split_once('@')?;
    Some((counter.parse().ok()?, site.parse().ok()?))
}

/// Total order on character ids.
///
/// Canonical ids compare numerically on `(counter, site)`; anything else
/// falls back to byte order. Ties are impossible for distinct characters
/// because `(counter, site)` pairs are unique per document.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (parse_id(a), parse_id(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// The ordered character store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub(crate) characters: Vec<Character>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// An empty document: just the two sentinels.
    pub fn new() -> Self {
        Self {
            characters: vec![Character::start(), Character::end()],
        }
    }

    /// Rebuild a document from a raw character sequence, re-checking the
    /// structural invariants. Used when loading snapshots.
    pub fn from_characters(characters: Vec<Character>) -> Result<Self, CrdtError> {
        let doc = Self { characters };
        doc.validate()?;
        Ok(doc)
    }

    /// Total number of characters, sentinels and tombstones included.
    pub fn len(&self) -> usize {
        self.characters.len()
    }

    /// Number of visible characters.
    pub fn visible_len(&self) -> usize {
        self.characters.iter().filter(|c| c.visible).count()
    }

    /// The character at a sequence position.
    pub fn element_at(&self, pos: usize) -> Result<&Character, CrdtError> {
        self.characters
            .get(pos)
            .ok_or(CrdtError::PositionOutOfBounds(pos))
    }

    /// Sequence position of the character with the given id.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.characters.iter().position(|c| c.id == id)
    }

    /// The character with the given id.
    pub fn find(&self, id: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// The `pos`-th visible character, 1-based. `None` when fewer than
    /// `pos` characters are visible (or `pos` is zero).
    pub fn ith_visible(&self, pos: usize) -> Option<&Character> {
        if pos == 0 {
            return None;
        }
        self.characters.iter().filter(|c| c.visible).nth(pos - 1)
    }

    /// The user-facing text: every visible value in sequence order.
    pub fn content(&self) -> String {
        self.characters
            .iter()
            .filter(|c| c.visible)
            .map(|c| c.value.as_str())
            .collect()
    }

    /// The raw sequence, sentinels and tombstones included.
    pub fn characters(&self) -> &[Character] {
        &self.characters
    }

    /// Insert `ch` so that it occupies sequence position `pos`.
    ///
    /// Rejects positions that would displace a sentinel, empty ids, and
    /// ids already present in the document.
    pub(crate) fn splice(&mut self, pos: usize, ch: Character) -> Result<usize, CrdtError> {
        if pos == 0 || pos >= self.characters.len() {
            return Err(CrdtError::PositionOutOfBounds(pos));
        }
        if ch.id.is_empty() {
            return Err(CrdtError::EmptyId);
        }
        if self.contains(&ch.id) {
            return Err(CrdtError::DuplicateId(ch.id));
        }

        self.characters.insert(pos, ch);
        Ok(pos)
    }

    pub(crate) fn set_invisible(&mut self, id: &str) -> Result<(), CrdtError> {
        let pos = self
            .position(id)
            .ok_or_else(|| CrdtError::NotFound(id.to_owned()))?;
        self.characters[pos].visible = false;
        Ok(())
    }

    /// Check the structural invariants: sentinels at both ends, unique
    /// ids, and every neighbor reference resolvable.
    pub fn validate(&self) -> Result<(), CrdtError> {
        let first = self
            .characters
            .first()
            .ok_or_else(|| CrdtError::Invalid("empty character sequence".into()))?;
        let last = self
            .characters
            .last()
            .ok_or_else(|| CrdtError::Invalid("empty character sequence".into()))?;
        if first.id != START_ID || !first.prev_id.is_empty() || first.visible {
            return Err(CrdtError::Invalid("missing start sentinel".into()));
        }
        if last.id != END_ID || !last.next_id.is_empty() || last.visible {
            return Err(CrdtError::Invalid("missing end sentinel".into()));
        }

        for (i, c) in self.characters.iter().enumerate() {
            if self.characters[..i].iter().any(|other| other.id == c.id) {
                return Err(CrdtError::Invalid(format!("duplicate id {}", c.id)));
            }
            if c.id != START_ID && !self.contains(&c.prev_id) {
                return Err(CrdtError::Invalid(format!(
                    "character {} references missing predecessor {}",
                    c.id, c.prev_id
                )));
            }
            if c.id != END_ID && !self.contains(&c.next_id) {
                return Err(CrdtError::Invalid(format!(
                    "character {} references missing successor {}",
                    c.id, c.next_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document_has_sentinels() {
        let doc = Document::new();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.characters()[0].id, START_ID);
        assert_eq!(doc.characters()[1].id, END_ID);
        assert!(!doc.characters()[0].visible);
        assert!(!doc.characters()[1].visible);
        assert_eq!(doc.content(), "");
        assert_eq!(doc.visible_len(), 0);
    }

    #[test]
    fn test_splice_between_sentinels() {
        let mut doc = Document::new();
        let ch = Character::new("1@1", "a", true, START_ID, END_ID);
        doc.splice(1, ch).unwrap();

        assert_eq!(doc.len(), 3);
        assert_eq!(doc.characters()[1].id, "1@1");
        assert_eq!(doc.content(), "a");
        doc.validate().unwrap();
    }

    #[test]
    fn test_splice_rejects_sentinel_positions() {
        let mut doc = Document::new();
        let ch = Character::new("1@1", "a", true, START_ID, END_ID);
        assert_eq!(
            doc.splice(0, ch.clone()),
            Err(CrdtError::PositionOutOfBounds(0))
        );
        assert_eq!(doc.splice(2, ch), Err(CrdtError::PositionOutOfBounds(2)));
    }

    #[test]
    fn test_splice_rejects_duplicate_id() {
        let mut doc = Document::new();
        doc.splice(1, Character::new("1@1", "a", true, START_ID, END_ID))
            .unwrap();
        let dup = Character::new("1@1", "b", true, START_ID, END_ID);
        assert_eq!(doc.splice(1, dup), Err(CrdtError::DuplicateId("1@1".into())));
    }

    #[test]
    fn test_splice_rejects_empty_id() {
        let mut doc = Document::new();
        let ch = Character::new("", "a", true, START_ID, END_ID);
        assert_eq!(doc.splice(1, ch), Err(CrdtError::EmptyId));
    }

    #[test]
    fn test_ith_visible_skips_tombstones() {
        let mut doc = Document::new();
        doc.splice(1, Character::new("1@1", "a", true, START_ID, END_ID))
            .unwrap();
        doc.splice(2, Character::new("2@1", "b", true, "1@1", END_ID))
            .unwrap();
        doc.set_invisible("1@1").unwrap();

        assert_eq!(doc.ith_visible(1).unwrap().id, "2@1");
        assert!(doc.ith_visible(2).is_none());
        assert!(doc.ith_visible(0).is_none());
        assert_eq!(doc.visible_len(), 1);
        assert_eq!(doc.content(), "b");
    }

    #[test]
    fn test_element_at_out_of_bounds() {
        let doc = Document::new();
        assert!(doc.element_at(1).is_ok());
        assert_eq!(
            doc.element_at(2).unwrap_err(),
            CrdtError::PositionOutOfBounds(2)
        );
    }

    #[test]
    fn test_set_invisible_unknown_id() {
        let mut doc = Document::new();
        assert_eq!(
            doc.set_invisible("9@9"),
            Err(CrdtError::NotFound("9@9".into()))
        );
    }

    #[test]
    fn test_compare_ids_numeric_over_lexicographic() {
        assert_eq!(compare_ids("2@1", "10@1"), Ordering::Less);
        assert_eq!(compare_ids("1@1", "1@2"), Ordering::Less);
        assert_eq!(compare_ids("3@2", "3@2"), Ordering::Equal);
        // Non-canonical ids fall back to byte order.
        assert_eq!(compare_ids("abc", "abd"), Ordering::Less);
    }

    #[test]
    fn test_validate_catches_broken_links() {
        let characters = vec![
            Character::new(START_ID, "", false, "", "1@1"),
            Character::new("1@1", "a", true, "ghost", END_ID),
            Character::new(END_ID, "", false, "1@1", ""),
        ];
        assert!(Document::from_characters(characters).is_err());
    }

    #[test]
    fn test_validate_requires_sentinels() {
        let characters = vec![
            Character::new("1@1", "a", true, START_ID, END_ID),
            Character::new(END_ID, "", false, "1@1", ""),
        ];
        assert!(Document::from_characters(characters).is_err());
    }
}
