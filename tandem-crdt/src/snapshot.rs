//! Byte-level save/load of a document.
//!
//! The encoded form is the full character sequence, sentinels and
//! tombstones included — dropping tombstones would orphan the causal
//! anchors of concurrent operations and reintroduce divergence. The
//! same bytes serve both newcomer sync (inside a `docSync` frame) and
//! local files.

use std::path::Path;

use thiserror::Error;

use crate::document::{CrdtError, Document};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("failed to encode document: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode document: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("snapshot failed validation: {0}")]
    Invalid(#[from] CrdtError),
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize the full character sequence.
pub fn save(doc: &Document) -> Result<Vec<u8>, SnapshotError> {
    serde_json::to_vec(doc).map_err(SnapshotError::Encode)
}

/// Deserialize a document, re-checking the structural invariants.
/// Failures never yield a partial document.
pub fn load(bytes: &[u8]) -> Result<Document, SnapshotError> {
    let doc: Document = serde_json::from_slice(bytes).map_err(SnapshotError::Decode)?;
    doc.validate()?;
    Ok(doc)
}

/// Save a document to a file.
pub fn save_file(path: impl AsRef<Path>, doc: &Document) -> Result<(), SnapshotError> {
    let bytes = save(doc)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Load a document from a file.
pub fn load_file(path: impl AsRef<Path>) -> Result<Document, SnapshotError> {
    let bytes = std::fs::read(path)?;
    load(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::woot::Operation;
    use crate::Replica;

    fn doc_with_content(text: &str) -> Document {
        let mut site = Replica::new(1);
        for (i, ch) in text.chars().enumerate() {
            site.local_insert(i + 1, ch).unwrap();
        }
        site.document().clone()
    }

    #[test]
    fn test_round_trip_multiline_content() {
        let doc = doc_with_content("cat\ndog");
        assert_eq!(doc.visible_len(), 7);

        let restored = load(&save(&doc).unwrap()).unwrap();
        assert_eq!(restored, doc);
        assert_eq!(restored.content(), "cat\ndog");
    }

    #[test]
    fn test_round_trip_preserves_tombstones() {
        let mut site = Replica::new(2);
        site.local_insert(1, 'a').unwrap();
        site.local_insert(2, 'b').unwrap();
        site.local_delete(1).unwrap();

        let doc = site.document().clone();
        let restored = load(&save(&doc).unwrap()).unwrap();

        assert_eq!(restored, doc);
        assert_eq!(restored.content(), "b");
        // The tombstone survives the trip.
        assert!(!restored.find("1@2").unwrap().visible);
    }

    #[test]
    fn test_round_trip_empty_document() {
        let doc = Document::new();
        let restored = load(&save(&doc).unwrap()).unwrap();
        assert_eq!(restored, doc);
    }

    #[test]
    fn test_load_rejects_garbage() {
        assert!(matches!(
            load(b"\xff\xfe not json"),
            Err(SnapshotError::Decode(_))
        ));
    }

    #[test]
    fn test_load_rejects_structurally_invalid_document() {
        // Well-formed JSON, but no sentinels.
        let bytes = br#"{"characters":[{"id":"1@1","value":"a","visible":true,"prev_id":"start","next_id":"end"}]}"#;
        assert!(matches!(load(bytes), Err(SnapshotError::Invalid(_))));
    }

    #[test]
    fn test_snapshot_bootstraps_a_replica() {
        let doc = doc_with_content("sync me");
        let bytes = save(&doc).unwrap();

        let mut newcomer = Replica::new(9);
        newcomer.adopt(load(&bytes).unwrap()).unwrap();
        assert_eq!(newcomer.content(), "sync me");

        // The newcomer can keep editing on top of the adopted state.
        let op = newcomer.local_insert(1, '>').unwrap();
        assert!(matches!(op, Operation::Insert { .. }));
        assert_eq!(newcomer.content(), ">sync me");
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.tandem");

        let doc = doc_with_content("on disk");
        save_file(&path, &doc).unwrap();
        let restored = load_file(&path).unwrap();
        assert_eq!(restored, doc);
    }
}
