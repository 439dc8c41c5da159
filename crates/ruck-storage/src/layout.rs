use crate::{FileType, Handle};

/// Maps handles to `/`-separated remote paths under a repository prefix.
///
/// Layout under `PREFIX`:
///
/// ```text
/// config
/// data/XX/<hex-pack-id>     (XX = first byte of the ID in hex)
/// index/<hex-index-id>
/// snapshots/<hex-snapshot-id>
/// keys/<hex-key-id>
/// locks/<hex-lock-id>
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    prefix: String,
}

impl Layout {
    pub fn new(prefix: &str) -> Self {
        Layout {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Remote path of the object named by `h`.
    pub fn filename(&self, h: &Handle) -> String {
        match h.file_type {
            FileType::Config => format!("{}/config", self.prefix),
            t if t.sharded() => {
                // Sharded types place each file under a two-hex-char subdir.
                let shard = &h.name[..2.min(h.name.len())];
                format!("{}/{}/{}/{}", self.prefix, t.dirname(), shard, h.name)
            }
            t => format!("{}/{}/{}", self.prefix, t.dirname(), h.name),
        }
    }

    /// Remote path of the directory containing the object named by `h`.
    pub fn dirname(&self, h: &Handle) -> String {
        let file = self.filename(h);
        match file.rfind('/') {
            Some(idx) => file[..idx].to_string(),
            None => String::new(),
        }
    }

    /// Root directory for a file type, plus whether listings must descend
    /// into shard subdirectories.
    pub fn basedir(&self, t: FileType) -> (String, bool) {
        let dir = if t == FileType::Config {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, t.dirname())
        };
        (dir, t.sharded())
    }

    /// All directories that make up the repository skeleton (excluding the
    /// 256 data shards, which are created lazily on first save).
    pub fn paths(&self) -> Vec<String> {
        [
            FileType::Data,
            FileType::Index,
            FileType::Snapshot,
            FileType::Key,
            FileType::Lock,
        ]
        .iter()
        .map(|t| format!("{}/{}", self.prefix, t.dirname()))
        .collect()
    }
}
