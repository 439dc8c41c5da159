use serde::{Deserialize, Serialize};

use ruck_storage::{Backend, FileType, Handle};
use ruck_types::{BlobType, CancelToken, Id, Result, RuckError};

use crate::crypto::CryptoEngine;

/// Size of the trailing big-endian header-length field.
pub const HEADER_LEN_SIZE: u64 = 4;

/// One entry of a pack's trailing header, in blob write order.
///
/// Offsets are implicit: the prefix sum of the preceding entries' lengths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderEntry {
    #[serde(rename = "type")]
    pub blob_type: BlobType,
    pub length: u32,
    pub id: Id,
}

/// A header entry resolved to its byte range within the pack.
#[derive(Debug, Clone)]
pub struct PackedBlob {
    pub blob_type: BlobType,
    pub id: Id,
    pub offset: u64,
    pub length: u32,
}

/// A finalized pack: named by the SHA-256 of its complete contents.
pub struct FinishedPack {
    pub id: Id,
    pub bytes: Vec<u8>,
    pub blobs: Vec<PackedBlob>,
}

/// Accumulates encrypted blobs and seals them into an append-only pack:
///
/// ```text
/// [ct₀ ‖ ct₁ ‖ … ‖ encrypted header ‖ u32 BE header length]
/// ```
///
/// A pack is never rewritten: it is either fully uploaded under its content
/// hash, or it does not exist.
pub struct PackWriter {
    payload: Vec<u8>,
    entries: Vec<HeaderEntry>,
}

impl PackWriter {
    pub fn new() -> Self {
        PackWriter {
            payload: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Append one encrypted blob; returns its offset within the pack.
    pub fn add(&mut self, blob_type: BlobType, id: Id, ciphertext: &[u8]) -> u64 {
        let offset = self.payload.len() as u64;
        self.payload.extend_from_slice(ciphertext);
        self.entries.push(HeaderEntry {
            blob_type,
            length: ciphertext.len() as u32,
            id,
        });
        offset
    }

    /// Whether a blob with this ID is already buffered in this pack.
    pub fn contains(&self, id: &Id) -> bool {
        self.entries.iter().any(|e| e.id == *id)
    }

    /// Plaintext size of a pending blob, if buffered here.
    pub fn pending_length(&self, id: &Id, blob_type: BlobType) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.id == *id && e.blob_type == blob_type)
            .map(|e| e.length)
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seal the pack: append the encrypted header and its length, compute
    /// the pack ID over the complete file bytes.
    pub fn finalize(self, crypto: &dyn CryptoEngine) -> Result<FinishedPack> {
        if self.entries.is_empty() {
            return Err(RuckError::Other("cannot finalize empty pack".into()));
        }

        let mut blobs = Vec::with_capacity(self.entries.len());
        let mut offset = 0u64;
        for entry in &self.entries {
            blobs.push(PackedBlob {
                blob_type: entry.blob_type,
                id: entry.id,
                offset,
                length: entry.length,
            });
            offset += entry.length as u64;
        }

        let header_plain = serde_json::to_vec(&self.entries)?;
        let header = crypto.encrypt(&header_plain)?;

        let mut bytes = self.payload;
        bytes.reserve(header.len() + HEADER_LEN_SIZE as usize);
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&(header.len() as u32).to_be_bytes());

        let id = Id::hash(&bytes);
        Ok(FinishedPack { id, bytes, blobs })
    }
}

impl Default for PackWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Read and decrypt a pack's trailing header using two partial range reads:
/// the 4-byte length field, then the header itself.
///
/// Fails with an integrity error when the header does not decrypt or its
/// declared lengths do not sum to the file size minus header and trailer.
pub fn read_header(
    backend: &dyn Backend,
    crypto: &dyn CryptoEngine,
    pack_id: &Id,
    cancel: &CancelToken,
) -> Result<Vec<PackedBlob>> {
    let handle = Handle::new(FileType::Data, pack_id.to_hex());
    let size = backend.stat(&handle, cancel)?.size;
    if size <= HEADER_LEN_SIZE {
        return Err(RuckError::Integrity(format!(
            "pack {pack_id} too small ({size} bytes)"
        )));
    }

    let len_field = backend.load_range(&handle, HEADER_LEN_SIZE as u32, size - HEADER_LEN_SIZE, cancel)?;
    let header_len = u32::from_be_bytes(
        len_field
            .as_slice()
            .try_into()
            .map_err(|_| RuckError::Integrity(format!("pack {pack_id}: bad length field")))?,
    ) as u64;

    if header_len == 0 || header_len + HEADER_LEN_SIZE > size {
        return Err(RuckError::Integrity(format!(
            "pack {pack_id}: header length {header_len} exceeds pack size {size}"
        )));
    }

    let header_raw = backend.load_range(
        &handle,
        header_len as u32,
        size - HEADER_LEN_SIZE - header_len,
        cancel,
    )?;
    let header_plain = crypto.decrypt(&header_raw).map_err(|_| {
        RuckError::Integrity(format!("pack {pack_id}: header failed to decrypt"))
    })?;
    let entries: Vec<HeaderEntry> = serde_json::from_slice(&header_plain)
        .map_err(|e| RuckError::Integrity(format!("pack {pack_id}: malformed header: {e}")))?;

    let mut blobs = Vec::with_capacity(entries.len());
    let mut offset = 0u64;
    for entry in &entries {
        blobs.push(PackedBlob {
            blob_type: entry.blob_type,
            id: entry.id,
            offset,
            length: entry.length,
        });
        offset += entry.length as u64;
    }

    let payload_size = size - HEADER_LEN_SIZE - header_len;
    if offset != payload_size {
        return Err(RuckError::Integrity(format!(
            "pack {pack_id}: entries declare {offset} payload bytes, pack holds {payload_size}"
        )));
    }

    Ok(blobs)
}
