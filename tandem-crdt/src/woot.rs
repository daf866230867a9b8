//! WOOT insert/delete generation and remote integration.
//!
//! Convergence does not rely on any delivery order: a character carries
//! the ids of the neighbors it was generated between, and integration
//! walks the current subsequence between those anchors, ordering
//! concurrent characters by their ids. Deletion only flips the
//! visibility flag, leaving a tombstone other anchors can still resolve.
//!
//! Reference: Oster et al., "Data Consistency for P2P Collaborative
//! Editing" (CSCW 2006).

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::document::{compare_ids, Character, CrdtError, Document, END_ID, START_ID};

/// A replicated mutation of the shared document.
///
/// This is the stable wire schema: inserts carry the full character
/// (anchors included), deletes carry the bare id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Insert { character: Character },
    Delete { id: String },
}

impl Document {
    /// Integrate `ch` somewhere between the characters `prev_id` and
    /// `next_id`, resolving concurrent insertions by id order.
    ///
    /// Both anchors must already be present. Returns the sequence
    /// position the character landed at.
    pub fn integrate_insert(
        &mut self,
        ch: Character,
        prev_id: &str,
        next_id: &str,
    ) -> Result<usize, CrdtError> {
        let mut prev = prev_id.to_owned();
        let mut next = next_id.to_owned();

        loop {
            let prev_pos = self.position(&prev).ok_or(CrdtError::BoundsNotPresent)?;
            let next_pos = self.position(&next).ok_or(CrdtError::BoundsNotPresent)?;
            if next_pos <= prev_pos {
                return Err(CrdtError::BoundsNotPresent);
            }

            // Nothing between the anchors: the position is settled.
            if next_pos - prev_pos == 1 {
                return self.splice(next_pos, ch);
            }

            // Characters between the anchors whose own anchors are no
            // tighter than (prev, next). Concurrent siblings end up here;
            // characters inserted relative to them do not.
            let mut siblings: Vec<usize> = Vec::new();
            for idx in prev_pos + 1..next_pos {
                let c = &self.characters[idx];
                let (Some(cp), Some(cn)) = (self.position(&c.prev_id), self.position(&c.next_id))
                else {
                    continue;
                };
                if cp <= prev_pos && cn >= next_pos {
                    siblings.push(idx);
                }
            }

            if siblings.is_empty() {
                return self.splice(prev_pos + 1, ch);
            }

            // Walk the siblings in sequence order past every id smaller
            // than ours, then narrow the window and go again.
            let ordered_before = siblings
                .iter()
                .take_while(|&&idx| compare_ids(&self.characters[idx].id, &ch.id) == Ordering::Less)
                .count();

            if ordered_before > 0 {
                prev = self.characters[siblings[ordered_before - 1]].id.clone();
            }
            if ordered_before < siblings.len() {
                next = self.characters[siblings[ordered_before]].id.clone();
            }
        }
    }

    /// Mark the character with the given id invisible. Unknown ids fail
    /// with [`CrdtError::NotFound`]; deleting an already-invisible
    /// character is an idempotent success.
    pub fn integrate_delete(&mut self, id: &str) -> Result<(), CrdtError> {
        self.set_invisible(id)
    }
}

/// One site's view of the shared document.
///
/// Owns the document, the site identity used to mint character ids, and
/// the buffer of remote operations whose anchors have not arrived yet.
#[derive(Debug, Clone, Default)]
pub struct Replica {
    doc: Document,
    site_id: u64,
    clock: u64,
    /// Operations parked until the keyed character id is integrated.
    pending: HashMap<String, Vec<Operation>>,
}

impl Replica {
    pub fn new(site_id: u64) -> Self {
        Self {
            doc: Document::new(),
            site_id,
            clock: 0,
            pending: HashMap::new(),
        }
    }

    pub fn site_id(&self) -> u64 {
        self.site_id
    }

    /// Set the site id once the server has assigned one.
    pub fn set_site_id(&mut self, site_id: u64) {
        self.site_id = site_id;
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn content(&self) -> String {
        self.doc.content()
    }

    /// Number of operations waiting for an anchor.
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Insert `value` so it becomes the `pos`-th visible character
    /// (1-based; `visible_len() + 1` appends). Integrates locally and
    /// returns the operation to replicate.
    pub fn local_insert(&mut self, pos: usize, value: char) -> Result<Operation, CrdtError> {
        if pos == 0 {
            return Err(CrdtError::PositionOutOfBounds(pos));
        }
        let visible_len = self.doc.visible_len();
        if pos > visible_len + 1 {
            return Err(CrdtError::PositionOutOfBounds(pos));
        }

        let prev_id = if pos == 1 {
            START_ID.to_owned()
        } else {
            self.doc
                .ith_visible(pos - 1)
                .ok_or(CrdtError::PositionOutOfBounds(pos))?
                .id
                .clone()
        };
        let next_id = match self.doc.ith_visible(pos) {
            Some(c) => c.id.clone(),
            None => END_ID.to_owned(),
        };

        self.clock += 1;
        let ch = Character::new(
            format!("{}@{}", self.clock, self.site_id),
            value.to_string(),
            true,
            prev_id.clone(),
            next_id.clone(),
        );

        self.doc.integrate_insert(ch.clone(), &prev_id, &next_id)?;
        Ok(Operation::Insert { character: ch })
    }

    /// Delete the `pos`-th visible character (1-based). Returns the
    /// operation to replicate.
    pub fn local_delete(&mut self, pos: usize) -> Result<Operation, CrdtError> {
        let id = self
            .doc
            .ith_visible(pos)
            .ok_or(CrdtError::PositionOutOfBounds(pos))?
            .id
            .clone();
        self.doc.integrate_delete(&id)?;
        Ok(Operation::Delete { id })
    }

    /// Apply a remote operation.
    ///
    /// Operations are idempotent: re-delivered inserts and deletes of
    /// already-invisible characters succeed without effect. Operations
    /// whose anchors (or delete target) are not integrated yet are
    /// parked and retried when the missing character arrives.
    pub fn apply(&mut self, op: Operation) -> Result<(), CrdtError> {
        // First decide whether the operation must wait on a character
        // that has not been integrated here yet.
        let missing = match &op {
            Operation::Insert { character } => {
                if self.doc.contains(&character.id) {
                    return Ok(());
                }
                [&character.prev_id, &character.next_id]
                    .into_iter()
                    .find(|anchor| !self.doc.contains(anchor.as_str()))
                    .cloned()
            }
            Operation::Delete { id } => (!self.doc.contains(id)).then(|| id.clone()),
        };
        if let Some(anchor) = missing {
            self.park(anchor, op);
            return Ok(());
        }

        match op {
            Operation::Insert { character } => {
                let id = character.id.clone();
                let (prev_id, next_id) =
                    (character.prev_id.clone(), character.next_id.clone());
                self.doc.integrate_insert(character, &prev_id, &next_id)?;
                self.unpark(&id)
            }
            Operation::Delete { id } => self.doc.integrate_delete(&id),
        }
    }

    /// Replace the local document with a newcomer snapshot, then retry
    /// anything that was parked while the snapshot was in flight.
    pub fn adopt(&mut self, doc: Document) -> Result<(), CrdtError> {
        self.doc = doc;
        let parked: Vec<Operation> = self.pending.drain().flat_map(|(_, ops)| ops).collect();
        for op in parked {
            self.apply(op)?;
        }
        Ok(())
    }

    fn park(&mut self, anchor: String, op: Operation) {
        self.pending.entry(anchor).or_default().push(op);
    }

    /// Retry operations that were waiting on `id`, transitively.
    fn unpark(&mut self, id: &str) -> Result<(), CrdtError> {
        if let Some(ops) = self.pending.remove(id) {
            for op in ops {
                self.apply(op)?;
            }
        }
        Ok(())
    }
}
