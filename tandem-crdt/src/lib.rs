//! # tandem-crdt — WOOT sequence CRDT for shared text
//!
//! Models a collaboratively edited document as a totally ordered
//! sequence of uniquely identified characters. Concurrent insertions
//! are ordered by character id between immutable causal anchors, and
//! deletions leave tombstones, so any set of sites applying the same
//! operations converges to the same text without a central serializer.
//!
//! ## Modules
//!
//! - [`document`] — the character store (sentinels, tombstones, queries)
//! - [`woot`] — operation generation and remote integration
//! - [`snapshot`] — byte-level save/load for newcomer sync and files

pub mod document;
pub mod snapshot;
pub mod woot;

pub use document::{compare_ids, Character, CrdtError, Document, END_ID, START_ID};
pub use snapshot::SnapshotError;
pub use woot::{Operation, Replica};
