//! Snapshot records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::BlobId;

/// An immutable snapshot record: a labeled root tree id plus metadata.
///
/// Stored as an unpacked JSON blob; the record's content hash is the
/// snapshot id. Field names follow the repository's snapshot schema so
/// non-VFS readers list these snapshots like any other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Creation time, RFC3339.
    pub time: DateTime<Utc>,
    /// Content id of the root tree blob.
    pub tree: BlobId,
    /// Source paths recorded for the snapshot (the object database dir).
    pub paths: Vec<String>,
    /// Host that produced the snapshot.
    pub hostname: String,
    /// User that produced the snapshot.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let snapshot = Snapshot {
            time: "2024-05-01T12:00:00Z".parse().unwrap(),
            tree: BlobId::hash(b"root"),
            paths: vec!["/tmp/repo".to_string()],
            hostname: "builder".to_string(),
            username: "amy".to_string(),
            tags: vec!["push".to_string()],
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tree, snapshot.tree);
        assert_eq!(back.paths, snapshot.paths);
        assert_eq!(back.time, snapshot.time);
    }

    #[test]
    fn test_empty_tags_omitted() {
        let snapshot = Snapshot {
            time: Utc::now(),
            tree: BlobId::hash(b"root"),
            paths: vec![],
            hostname: String::new(),
            username: String::new(),
            tags: vec![],
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("tags"));
        assert!(!json.contains("username"));
    }
}
