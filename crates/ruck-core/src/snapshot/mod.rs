pub mod node;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ruck_types::Id;

use crate::platform;

pub use node::{Node, NodeType, Tree};

/// The root object of one backup run: references the top-level tree plus
/// the run's metadata. Stored encrypted under `snapshots/<id>` where the ID
/// is the SHA-256 of the canonical JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<Id>,
    pub tree: Id,
    pub paths: Vec<String>,
    pub hostname: String,
    pub username: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
}

impl Snapshot {
    pub fn new(
        tree: Id,
        paths: Vec<String>,
        tags: Vec<String>,
        parent: Option<Id>,
        time: DateTime<Utc>,
    ) -> Self {
        Snapshot {
            time,
            parent,
            tree,
            paths,
            hostname: platform::hostname(),
            username: platform::username(),
            tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip() {
        let sn = Snapshot::new(
            Id::hash(b"tree"),
            vec!["/home/user".into()],
            vec!["nightly".into()],
            Some(Id::hash(b"parent")),
            Utc::now(),
        );
        let json = serde_json::to_vec(&sn).unwrap();
        let back: Snapshot = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.tree, sn.tree);
        assert_eq!(back.paths, sn.paths);
        assert_eq!(back.parent, sn.parent);
        assert_eq!(back.tags, sn.tags);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let sn = Snapshot::new(Id::hash(b"tree"), vec![], vec![], None, Utc::now());
        let json = serde_json::to_string(&sn).unwrap();
        assert!(!json.contains("parent"));
        assert!(!json.contains("tags"));
    }
}
