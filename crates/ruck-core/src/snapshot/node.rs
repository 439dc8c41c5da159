use std::fs::Metadata;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ruck_types::{Id, Result, RuckError};

/// Kind of a captured filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Dir,
    Symlink,
    Dev,
    Chardev,
    Fifo,
    Socket,
}

/// A captured filesystem entry.
///
/// For files, `content` is the ordered list of data-blob IDs whose
/// plaintexts concatenate to the file's bytes. For directories, `subtree`
/// is the ID of the tree blob holding the children. Symlinks carry
/// `linktarget`; device nodes, fifos and sockets carry neither content nor
/// subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub linktarget: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<Vec<Id>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subtree: Option<Id>,
}

fn timestamp(secs: i64, nsecs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, nsecs.clamp(0, 999_999_999) as u32)
        .unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap())
}

impl Node {
    /// Capture a node from lstat metadata. `path` is only consulted for the
    /// symlink target.
    pub fn from_metadata(name: &str, path: &Path, meta: &Metadata) -> Result<Node> {
        let node_type = node_type_of(meta)?;
        let linktarget = if node_type == NodeType::Symlink {
            Some(
                std::fs::read_link(path)?
                    .to_string_lossy()
                    .into_owned(),
            )
        } else {
            None
        };

        #[cfg(unix)]
        let (mode, uid, gid, mtime, atime, ctime) = {
            use std::os::unix::fs::MetadataExt;
            (
                meta.mode(),
                meta.uid(),
                meta.gid(),
                timestamp(meta.mtime(), meta.mtime_nsec()),
                timestamp(meta.atime(), meta.atime_nsec()),
                timestamp(meta.ctime(), meta.ctime_nsec()),
            )
        };
        #[cfg(not(unix))]
        let (mode, uid, gid, mtime, atime, ctime) = {
            let mtime = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| timestamp(0, 0));
            (0u32, 0u32, 0u32, mtime, mtime, mtime)
        };

        Ok(Node {
            name: name.to_string(),
            node_type,
            mode,
            uid,
            gid,
            mtime,
            atime,
            ctime,
            size: if node_type == NodeType::File {
                meta.len()
            } else {
                0
            },
            linktarget,
            content: None,
            subtree: None,
        })
    }
}

fn node_type_of(meta: &Metadata) -> Result<NodeType> {
    let ft = meta.file_type();
    if ft.is_file() {
        return Ok(NodeType::File);
    }
    if ft.is_dir() {
        return Ok(NodeType::Dir);
    }
    if ft.is_symlink() {
        return Ok(NodeType::Symlink);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_block_device() {
            return Ok(NodeType::Dev);
        }
        if ft.is_char_device() {
            return Ok(NodeType::Chardev);
        }
        if ft.is_fifo() {
            return Ok(NodeType::Fifo);
        }
        if ft.is_socket() {
            return Ok(NodeType::Socket);
        }
    }
    Err(RuckError::Other(format!("unsupported file type {ft:?}")))
}

/// A directory listing: nodes sorted by name, stored as a tree blob.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Tree { nodes: Vec::new() }
    }

    /// Insert a node, keeping `nodes` sorted by name. Duplicate names are
    /// an error; the archiver resolves collisions before insertion.
    pub fn insert(&mut self, node: Node) -> Result<()> {
        match self.nodes.binary_search_by(|n| n.name.cmp(&node.name)) {
            Ok(_) => Err(RuckError::InvalidFormat(format!(
                "tree already contains node '{}'",
                node.name
            ))),
            Err(pos) => {
                self.nodes.insert(pos, node);
                Ok(())
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes
            .binary_search_by(|n| n.name.as_str().cmp(name))
            .ok()
            .map(|pos| &self.nodes[pos])
    }

    /// Canonical JSON body; its SHA-256 is the tree's ID.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Tree> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_node(name: &str) -> Node {
        Node {
            name: name.to_string(),
            node_type: NodeType::File,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            mtime: timestamp(1_700_000_000, 0),
            atime: timestamp(1_700_000_000, 0),
            ctime: timestamp(1_700_000_000, 0),
            size: 0,
            linktarget: None,
            content: Some(vec![]),
            subtree: None,
        }
    }

    #[test]
    fn insert_keeps_nodes_sorted() {
        let mut tree = Tree::new();
        for name in ["zeta", "alpha", "mid"] {
            tree.insert(dummy_node(name)).unwrap();
        }
        let names: Vec<&str> = tree.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut tree = Tree::new();
        tree.insert(dummy_node("a")).unwrap();
        assert!(tree.insert(dummy_node("a")).is_err());
    }

    #[test]
    fn find_locates_nodes() {
        let mut tree = Tree::new();
        tree.insert(dummy_node("foo")).unwrap();
        assert!(tree.find("foo").is_some());
        assert!(tree.find("bar").is_none());
    }

    #[test]
    fn json_roundtrip_preserves_order() {
        let mut tree = Tree::new();
        tree.insert(dummy_node("b")).unwrap();
        tree.insert(dummy_node("a")).unwrap();
        let json = tree.to_json().unwrap();
        let back = Tree::from_json(&json).unwrap();
        assert_eq!(back.nodes.len(), 2);
        assert_eq!(back.nodes[0].name, "a");
        // Identical bodies hash to identical tree IDs.
        assert_eq!(Id::hash(&json), Id::hash(&back.to_json().unwrap()));
    }

    #[test]
    fn node_serializes_type_tag() {
        let node = dummy_node("x");
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"type\":\"file\""));
        // Empty optional fields are omitted entirely.
        assert!(!json.contains("subtree"));
        assert!(!json.contains("linktarget"));
    }

    #[cfg(unix)]
    #[test]
    fn from_metadata_captures_file_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        let meta = std::fs::symlink_metadata(&path).unwrap();
        let node = Node::from_metadata("f", &path, &meta).unwrap();
        assert_eq!(node.node_type, NodeType::File);
        assert_eq!(node.size, 5);
        assert!(node.mode & 0o400 != 0);
    }

    #[cfg(unix)]
    #[test]
    fn from_metadata_captures_symlink_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let meta = std::fs::symlink_metadata(&link).unwrap();
        let node = Node::from_metadata("link", &link, &meta).unwrap();
        assert_eq!(node.node_type, NodeType::Symlink);
        assert_eq!(
            node.linktarget.as_deref(),
            Some(target.to_str().unwrap())
        );
    }
}
