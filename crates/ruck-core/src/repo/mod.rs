pub mod config;
pub mod pack;

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use ruck_storage::{Backend, FileType, Handle};
use ruck_types::{BlobType, CancelToken, Id, Result, RuckError};

use crate::crypto::CryptoEngine;
use crate::index::{self, BlobRecord, IndexFile, MasterIndex, PackRecord};
use crate::snapshot::{Snapshot, Tree};

pub use config::RepoConfig;
pub use pack::{PackWriter, PackedBlob};

/// Target pack size: blobs accumulate until the open pack reaches this many
/// payload bytes, then it is sealed and uploaded.
pub const PACK_TARGET_SIZE: usize = 16 * 1024 * 1024;

/// An opened repository: the blob store plus its master index.
///
/// All methods take `&self`; concurrent `save_blob` calls funnel through a
/// mutex guarding the currently-open pack of each blob type, and index
/// readers during archiving tolerate in-progress entries (the `has_blob`
/// check is best-effort for dedup).
pub struct Repository {
    backend: Arc<dyn Backend>,
    crypto: Arc<dyn CryptoEngine>,
    config: RepoConfig,
    index: RwLock<MasterIndex>,
    data_packer: Mutex<PackWriter>,
    tree_packer: Mutex<PackWriter>,
    /// Packs sealed during this session, for the next `save_index`.
    session_packs: Mutex<Vec<PackRecord>>,
    pack_target: AtomicUsize,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Initialize a fresh repository: generates a config and uploads it.
    /// Fails with `ConfigExists` when the location already holds one — the
    /// config upload itself is overwrite-protected, so concurrent
    /// initializations are detected server-side.
    pub fn init(
        backend: Arc<dyn Backend>,
        crypto: Arc<dyn CryptoEngine>,
        cancel: &CancelToken,
    ) -> Result<Repository> {
        let cfg = RepoConfig::generate();
        let body = serde_json::to_vec(&cfg)?;
        let sealed = crypto.encrypt(&body)?;
        match backend.save_bytes(&Handle::config(), &sealed, cancel) {
            Ok(()) => {}
            Err(RuckError::Transport { status: 412, .. }) | Err(RuckError::ConfigExists) => {
                return Err(RuckError::ConfigExists)
            }
            Err(e) => return Err(e),
        }
        debug!(repo_id = %cfg.id, "initialized repository");
        Ok(Self::assemble(backend, crypto, cfg))
    }

    /// Open an existing repository by reading and decrypting its config.
    /// The master index starts empty; call [`load_index`] to populate it.
    pub fn open(
        backend: Arc<dyn Backend>,
        crypto: Arc<dyn CryptoEngine>,
        cancel: &CancelToken,
    ) -> Result<Repository> {
        let sealed = backend.load_all(&Handle::config(), cancel)?;
        let body = crypto
            .decrypt(&sealed)
            .map_err(|_| RuckError::Integrity("repository config failed to decrypt".into()))?;
        let cfg: RepoConfig = serde_json::from_slice(&body)?;
        if cfg.version != RepoConfig::VERSION {
            return Err(RuckError::Config(format!(
                "unsupported repository version {}",
                cfg.version
            )));
        }
        Ok(Self::assemble(backend, crypto, cfg))
    }

    fn assemble(
        backend: Arc<dyn Backend>,
        crypto: Arc<dyn CryptoEngine>,
        config: RepoConfig,
    ) -> Repository {
        Repository {
            backend,
            crypto,
            config,
            index: RwLock::new(MasterIndex::new()),
            data_packer: Mutex::new(PackWriter::new()),
            tree_packer: Mutex::new(PackWriter::new()),
            session_packs: Mutex::new(Vec::new()),
            pack_target: AtomicUsize::new(PACK_TARGET_SIZE),
        }
    }

    /// Replace the in-memory index with the union of all live index objects.
    pub fn load_index(&self, cancel: &CancelToken) -> Result<()> {
        let loaded = index::load_all(self.backend.as_ref(), self.crypto.as_ref(), cancel)?;
        *self.index.write().unwrap() = loaded;
        Ok(())
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoEngine> {
        &self.crypto
    }

    /// Run `f` against the master index under the read lock.
    pub fn with_index<T>(&self, f: impl FnOnce(&MasterIndex) -> T) -> T {
        f(&self.index.read().unwrap())
    }

    /// Adjust the pack target size (mainly for tests exercising multi-pack
    /// repositories with small payloads).
    pub fn set_pack_target(&self, bytes: usize) {
        self.pack_target.store(bytes.max(1), Ordering::Relaxed);
    }

    fn pack_target_size(&self) -> usize {
        self.pack_target.load(Ordering::Relaxed)
    }

    fn packer_for(&self, blob_type: BlobType) -> &Mutex<PackWriter> {
        match blob_type {
            BlobType::Data => &self.data_packer,
            BlobType::Tree => &self.tree_packer,
        }
    }

    /// Whether a blob is already stored or pending in an open pack.
    /// Best-effort during concurrent archiving: a miss merely costs a
    /// duplicate encode that the packer-level re-check then drops.
    pub fn has_blob(&self, id: &Id, blob_type: BlobType) -> bool {
        if self.index.read().unwrap().has(id, blob_type) {
            return true;
        }
        self.packer_for(blob_type)
            .lock()
            .unwrap()
            .pending_length(id, blob_type)
            .is_some()
    }

    /// Plaintext size of a stored blob without materializing it.
    pub fn blob_size(&self, id: &Id, blob_type: BlobType) -> Option<u32> {
        let stored = match self.index.read().unwrap().lookup(id, blob_type) {
            Some(entry) => Some(entry.length),
            None => self
                .packer_for(blob_type)
                .lock()
                .unwrap()
                .pending_length(id, blob_type),
        };
        stored.map(|len| len - self.crypto.overhead() as u32)
    }

    /// Store a blob: hash, dedup against the index, encrypt, hand to the
    /// open pack. Returns `(id, true)` when the blob was newly written.
    pub fn save_blob(
        &self,
        blob_type: BlobType,
        data: &[u8],
        cancel: &CancelToken,
    ) -> Result<(Id, bool)> {
        cancel.check()?;
        let id = Id::hash(data);
        if self.has_blob(&id, blob_type) {
            return Ok((id, false));
        }

        let ciphertext = self.crypto.encrypt(data)?;

        let mut writer = self.packer_for(blob_type).lock().unwrap();
        // Re-check now that the writer is locked: a racing saver may have
        // added the same blob after our best-effort check.
        if writer.pending_length(&id, blob_type).is_some()
            || self.index.read().unwrap().has(&id, blob_type)
        {
            return Ok((id, false));
        }

        writer.add(blob_type, id, &ciphertext);
        if writer.size() >= self.pack_target_size() {
            let full = mem::take(&mut *writer);
            // The packer stays locked through seal and upload: packs are
            // single-owner, and a racing saver must not start a second open
            // pack of this type mid-finalize.
            self.seal_and_store(full, cancel)?;
        }

        Ok((id, true))
    }

    /// Finalize a pack and upload it under its content hash. The pack
    /// becomes externally visible only after the upload succeeds; entries
    /// are then registered with the index.
    fn seal_and_store(&self, writer: PackWriter, cancel: &CancelToken) -> Result<()> {
        let finished = writer.finalize(self.crypto.as_ref())?;
        let handle = Handle::new(FileType::Data, finished.id.to_hex());
        self.backend
            .save_bytes(&handle, &finished.bytes, cancel)?;

        let record = PackRecord {
            id: finished.id,
            blobs: finished
                .blobs
                .iter()
                .map(|b| BlobRecord {
                    id: b.id,
                    blob_type: b.blob_type,
                    offset: b.offset,
                    length: b.length,
                })
                .collect(),
        };
        debug!(pack = %finished.id, blobs = record.blobs.len(), bytes = finished.bytes.len(), "sealed pack");

        self.index.write().unwrap().add_pack(&record, None)?;
        self.session_packs.lock().unwrap().push(record);
        Ok(())
    }

    /// Seal and upload any open packs.
    pub fn flush(&self, cancel: &CancelToken) -> Result<()> {
        for packer in [&self.data_packer, &self.tree_packer] {
            let mut writer = packer.lock().unwrap();
            if !writer.is_empty() {
                let full = mem::take(&mut *writer);
                self.seal_and_store(full, cancel)?;
            }
        }
        Ok(())
    }

    /// Load a blob: range-read from its pack, decrypt, verify the content
    /// address.
    pub fn load_blob(&self, blob_type: BlobType, id: &Id, cancel: &CancelToken) -> Result<Vec<u8>> {
        let entry = self
            .index
            .read()
            .unwrap()
            .lookup(id, blob_type)
            .ok_or_else(|| RuckError::NotExist(format!("blob {id} not in index")))?;

        let handle = Handle::new(FileType::Data, entry.pack_id.to_hex());
        let raw = self
            .backend
            .load_range(&handle, entry.length, entry.offset, cancel)?;
        let plain = self
            .crypto
            .decrypt(&raw)
            .map_err(|_| RuckError::Integrity(format!("blob {id} failed to decrypt")))?;
        if Id::hash(&plain) != *id {
            return Err(RuckError::Integrity(format!(
                "blob {id}: plaintext does not match its content address"
            )));
        }
        Ok(plain)
    }

    /// Write a fresh index object covering every pack sealed this session.
    /// Returns `None` when no packs were written (everything deduplicated).
    pub fn save_index(&self, cancel: &CancelToken) -> Result<Option<Id>> {
        let packs = mem::take(&mut *self.session_packs.lock().unwrap());
        if packs.is_empty() {
            return Ok(None);
        }
        let count = packs.len();
        let file = IndexFile {
            supersedes: None,
            packs,
        };
        let body = serde_json::to_vec(&file)?;
        let id = Id::hash(&body);
        let sealed = self.crypto.encrypt(&body)?;
        self.backend
            .save_bytes(&Handle::new(FileType::Index, id.to_hex()), &sealed, cancel)?;
        debug!(index = %id, packs = count, "saved index");
        Ok(Some(id))
    }

    pub fn save_tree(&self, tree: &Tree, cancel: &CancelToken) -> Result<(Id, bool)> {
        let body = tree.to_json()?;
        self.save_blob(BlobType::Tree, &body, cancel)
    }

    pub fn load_tree(&self, id: &Id, cancel: &CancelToken) -> Result<Tree> {
        let body = self.load_blob(BlobType::Tree, id, cancel)?;
        Tree::from_json(&body)
    }

    pub fn save_snapshot(&self, snapshot: &Snapshot, cancel: &CancelToken) -> Result<Id> {
        let body = serde_json::to_vec(snapshot)?;
        let id = Id::hash(&body);
        let sealed = self.crypto.encrypt(&body)?;
        self.backend.save_bytes(
            &Handle::new(FileType::Snapshot, id.to_hex()),
            &sealed,
            cancel,
        )?;
        debug!(snapshot = %id, "saved snapshot");
        Ok(id)
    }

    pub fn load_snapshot(&self, id: &Id, cancel: &CancelToken) -> Result<Snapshot> {
        let sealed = self
            .backend
            .load_all(&Handle::new(FileType::Snapshot, id.to_hex()), cancel)?;
        let body = self
            .crypto
            .decrypt(&sealed)
            .map_err(|_| RuckError::Integrity(format!("snapshot {id} failed to decrypt")))?;
        if Id::hash(&body) != *id {
            return Err(RuckError::Integrity(format!(
                "snapshot {id} does not match its content hash"
            )));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    pub fn list_snapshots(&self, cancel: &CancelToken) -> Result<Vec<Id>> {
        let mut ids = Vec::new();
        for name in self.backend.list(FileType::Snapshot, cancel) {
            ids.push(name.parse()?);
        }
        cancel.check()?;
        Ok(ids)
    }

    /// Read and verify a pack's trailing header directly from the backend.
    pub fn read_pack_header(&self, pack_id: &Id, cancel: &CancelToken) -> Result<Vec<PackedBlob>> {
        pack::read_header(self.backend.as_ref(), self.crypto.as_ref(), pack_id, cancel)
    }
}
