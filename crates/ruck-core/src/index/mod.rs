pub mod stream;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use ruck_storage::{Backend, FileType, Handle};
use ruck_types::{BlobType, CancelToken, Id, Result, RuckError};

use crate::crypto::CryptoEngine;

/// Location of one blob: which pack holds it, where, and how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub pack_id: Id,
    pub blob_type: BlobType,
    pub offset: u64,
    pub length: u32,
}

/// One blob's wire record inside an index object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRecord {
    pub id: Id,
    #[serde(rename = "type")]
    pub blob_type: BlobType,
    pub offset: u64,
    pub length: u32,
}

/// One pack's wire record inside an index object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackRecord {
    pub id: Id,
    pub blobs: Vec<BlobRecord>,
}

impl PackRecord {
    /// Digest over the canonical entry encoding, used to detect two live
    /// indexes describing the same pack differently.
    pub fn digest(&self) -> Id {
        let mut buf = Vec::with_capacity(self.blobs.len() * 45);
        for blob in &self.blobs {
            buf.extend_from_slice(&blob.id.0);
            buf.push(match blob.blob_type {
                BlobType::Data => 0,
                BlobType::Tree => 1,
            });
            buf.extend_from_slice(&blob.offset.to_be_bytes());
            buf.extend_from_slice(&blob.length.to_be_bytes());
        }
        Id::hash(&buf)
    }
}

/// Serialized form of one index object.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<Vec<Id>>,
    pub packs: Vec<PackRecord>,
}

struct PackMeta {
    digest: Id,
    /// Index object this pack was first seen in; `None` for packs added
    /// live during the current session.
    source: Option<Id>,
}

/// In-memory union of all live index objects: blob ID → location.
///
/// Also tracks "tree packs" (packs holding no data blobs), which
/// accelerates structure-only scans.
pub struct MasterIndex {
    entries: HashMap<Id, IndexEntry>,
    packs: HashMap<Id, PackMeta>,
    tree_packs: HashSet<Id>,
}

impl MasterIndex {
    pub fn new() -> Self {
        MasterIndex {
            entries: HashMap::new(),
            packs: HashMap::new(),
            tree_packs: HashSet::new(),
        }
    }

    pub fn has(&self, id: &Id, blob_type: BlobType) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| e.blob_type == blob_type)
    }

    pub fn lookup(&self, id: &Id, blob_type: BlobType) -> Option<IndexEntry> {
        self.entries
            .get(id)
            .filter(|e| e.blob_type == blob_type)
            .copied()
    }

    pub fn list_packs(&self) -> HashSet<Id> {
        self.packs.keys().copied().collect()
    }

    pub fn tree_packs(&self) -> &HashSet<Id> {
        &self.tree_packs
    }

    pub fn each(&self, mut f: impl FnMut(&Id, &IndexEntry)) {
        for (id, entry) in &self.entries {
            f(id, entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge one pack record into the index.
    ///
    /// If two live indexes describe the same pack, the entries must be
    /// identical; a mismatch signals `DuplicatePacks`. An identical
    /// re-listing is harmless and ignored.
    pub fn add_pack(&mut self, record: &PackRecord, source: Option<Id>) -> Result<()> {
        let digest = record.digest();
        if let Some(existing) = self.packs.get(&record.id) {
            if existing.digest != digest {
                return Err(RuckError::DuplicatePacks(record.id.short()));
            }
            return Ok(());
        }

        let mut has_data = false;
        for blob in &record.blobs {
            if blob.blob_type == BlobType::Data {
                has_data = true;
            }
            self.entries.insert(
                blob.id,
                IndexEntry {
                    pack_id: record.id,
                    blob_type: blob.blob_type,
                    offset: blob.offset,
                    length: blob.length,
                },
            );
        }
        if !has_data {
            self.tree_packs.insert(record.id);
        }
        self.packs.insert(record.id, PackMeta { digest, source });
        Ok(())
    }
}

impl Default for MasterIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Load and merge every live index object from the backend.
///
/// Resolution happens in two streaming passes: the first reads only each
/// object's `supersedes` list to compute the shadowed set; the second
/// commits pack records of the surviving objects one at a time.
pub fn load_all(
    backend: &dyn Backend,
    crypto: &dyn CryptoEngine,
    cancel: &CancelToken,
) -> Result<MasterIndex> {
    let mut names: Vec<Id> = Vec::new();
    for name in backend.list(FileType::Index, cancel) {
        names.push(name.parse()?);
    }
    cancel.check()?;

    let fetch = |id: &Id| -> Result<Vec<u8>> {
        let raw = backend.load_all(&Handle::new(FileType::Index, id.to_hex()), cancel)?;
        let plain = crypto
            .decrypt(&raw)
            .map_err(|_| RuckError::Integrity(format!("index {id} failed to decrypt")))?;
        if Id::hash(&plain) != *id {
            return Err(RuckError::Integrity(format!(
                "index {id} does not match its content hash"
            )));
        }
        Ok(plain)
    };

    // Pass 1: which index objects are shadowed? One body in memory at a
    // time; pack records are skipped token-wise.
    let mut shadowed: HashSet<Id> = HashSet::new();
    for id in &names {
        cancel.check()?;
        let body = fetch(id)?;
        for superseded in stream::parse_supersedes(body.as_slice())? {
            shadowed.insert(superseded);
        }
    }

    // Pass 2: stream pack records of the live objects into the map.
    let mut index = MasterIndex::new();
    for id in &names {
        if shadowed.contains(id) {
            debug!("index {id} is superseded, skipping");
            continue;
        }
        cancel.check()?;
        let body = fetch(id)?;
        stream::parse_index(body.as_slice(), |pack| index.add_pack(&pack, Some(*id)))?;
    }

    debug!(
        indexes = names.len(),
        shadowed = shadowed.len(),
        blobs = index.len(),
        "loaded master index"
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pack_seed: &str, blob_seeds: &[(&str, BlobType)]) -> PackRecord {
        let mut offset = 0;
        let blobs = blob_seeds
            .iter()
            .map(|(seed, t)| {
                let r = BlobRecord {
                    id: Id::hash(seed.as_bytes()),
                    blob_type: *t,
                    offset,
                    length: 100,
                };
                offset += 100;
                r
            })
            .collect();
        PackRecord {
            id: Id::hash(pack_seed.as_bytes()),
            blobs,
        }
    }

    #[test]
    fn lookup_respects_blob_type() {
        let mut index = MasterIndex::new();
        index
            .add_pack(&record("p1", &[("b1", BlobType::Data)]), None)
            .unwrap();
        let id = Id::hash(b"b1");
        assert!(index.has(&id, BlobType::Data));
        assert!(!index.has(&id, BlobType::Tree));
        let entry = index.lookup(&id, BlobType::Data).unwrap();
        assert_eq!(entry.pack_id, Id::hash(b"p1"));
        assert_eq!(entry.length, 100);
    }

    #[test]
    fn tree_packs_hold_no_data_blobs() {
        let mut index = MasterIndex::new();
        index
            .add_pack(&record("p1", &[("t1", BlobType::Tree)]), None)
            .unwrap();
        index
            .add_pack(
                &record("p2", &[("d1", BlobType::Data), ("t2", BlobType::Tree)]),
                None,
            )
            .unwrap();
        assert!(index.tree_packs().contains(&Id::hash(b"p1")));
        assert!(!index.tree_packs().contains(&Id::hash(b"p2")));
    }

    #[test]
    fn identical_pack_relisting_is_ignored() {
        let mut index = MasterIndex::new();
        let r = record("p1", &[("b1", BlobType::Data)]);
        index.add_pack(&r, Some(Id::hash(b"idx1"))).unwrap();
        index.add_pack(&r, Some(Id::hash(b"idx2"))).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.list_packs().len(), 1);
    }

    #[test]
    fn conflicting_pack_entries_signal_duplicate_packs() {
        let mut index = MasterIndex::new();
        index
            .add_pack(&record("p1", &[("b1", BlobType::Data)]), Some(Id::hash(b"idx1")))
            .unwrap();
        let err = index
            .add_pack(
                &record("p1", &[("other", BlobType::Data)]),
                Some(Id::hash(b"idx2")),
            )
            .unwrap_err();
        assert!(matches!(err, RuckError::DuplicatePacks(_)));
    }

    #[test]
    fn each_visits_all_entries() {
        let mut index = MasterIndex::new();
        index
            .add_pack(
                &record("p1", &[("a", BlobType::Data), ("b", BlobType::Data)]),
                None,
            )
            .unwrap();
        let mut count = 0;
        index.each(|_, _| count += 1);
        assert_eq!(count, 2);
    }
}
