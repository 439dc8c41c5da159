pub mod layout;
pub mod memory;
pub mod onedrive;
pub mod retry;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crossbeam_channel::Receiver;

use ruck_types::{CancelToken, Result, RuckError};

/// Kind of a repository object as stored by a backend.
///
/// Tree blobs are not a file type: they live inside packs under `data/`,
/// so the backend only ever sees the types below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Config,
    Data,
    Index,
    Snapshot,
    Key,
    Lock,
}

impl FileType {
    /// Subdirectory name for this type; empty for the config singleton.
    pub fn dirname(&self) -> &'static str {
        match self {
            FileType::Config => "",
            FileType::Data => "data",
            FileType::Index => "index",
            FileType::Snapshot => "snapshots",
            FileType::Key => "keys",
            FileType::Lock => "locks",
        }
    }

    /// Whether files of this type are sharded into 256 hex-prefix
    /// subdirectories to cap directory size.
    pub fn sharded(&self) -> bool {
        matches!(self, FileType::Data)
    }
}

/// Names one repository object: a `(type, name)` pair where `name` is the
/// hex ID, or `"config"` for the singleton.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
}

impl Handle {
    pub fn new(file_type: FileType, name: impl Into<String>) -> Self {
        Handle {
            file_type,
            name: name.into(),
        }
    }

    /// The config singleton handle.
    pub fn config() -> Self {
        Handle::new(FileType::Config, "config")
    }

    pub fn valid(&self) -> Result<()> {
        if self.file_type != FileType::Config && self.name.is_empty() {
            return Err(RuckError::InvalidFormat("handle has empty name".into()));
        }
        Ok(())
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.file_type {
            FileType::Config => f.write_str("config"),
            t => write!(f, "{}/{}", t.dirname(), self.name),
        }
    }
}

/// Object metadata returned by [`Backend::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
}

/// Upload body: a reader plus its remaining length, when known.
///
/// Backends that must declare the total upload size up front (OneDrive's
/// upload sessions) fail with `UnknownSize` when `size` is `None`.
pub struct SaveStream<'a> {
    reader: &'a mut dyn Read,
    size: Option<u64>,
}

impl<'a> SaveStream<'a> {
    pub fn new(reader: &'a mut dyn Read, size: Option<u64>) -> Self {
        SaveStream { reader, size }
    }

    /// Wrap an open file; the size is the file length minus the current
    /// seek position.
    pub fn from_file(file: &'a mut File) -> Result<Self> {
        let len = file.metadata()?.len();
        let pos = file.seek(SeekFrom::Current(0))?;
        Ok(SaveStream {
            size: Some(len.saturating_sub(pos)),
            reader: file,
        })
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn into_parts(self) -> (&'a mut dyn Read, Option<u64>) {
        (self.reader, self.size)
    }
}

impl Read for SaveStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Abstract blob-file I/O surface consumed by the repository, index and
/// archiver. All objects are write-once; names are content addresses except
/// for the config singleton.
pub trait Backend: Send + Sync {
    /// Human-readable description of where this backend stores data.
    fn location(&self) -> String;

    /// Whether an object with the given handle exists.
    fn test(&self, h: &Handle, cancel: &CancelToken) -> Result<bool>;

    /// Upload a named object. Backends never overwrite the config singleton;
    /// a concurrent or repeated config save fails with a 412-bearing error.
    fn save(&self, h: &Handle, body: SaveStream<'_>, cancel: &CancelToken) -> Result<()>;

    /// Read `length` bytes starting at `offset`; `length == 0` means "to the
    /// end". The returned reader must be dropped promptly — backends may tie
    /// scarce resources (connection permits) to it.
    fn load(
        &self,
        h: &Handle,
        length: u32,
        offset: u64,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Read + Send>>;

    /// Object metadata without reading the content.
    fn stat(&self, h: &Handle, cancel: &CancelToken) -> Result<FileInfo>;

    /// Remove a single object.
    fn remove(&self, h: &Handle, cancel: &CancelToken) -> Result<()>;

    /// Enumerate names of all objects of the given type as a bounded stream.
    /// The producer closes the channel when done, on error, or on
    /// cancellation; errors are logged, not surfaced.
    fn list(&self, t: FileType, cancel: &CancelToken) -> Receiver<String>;

    /// Remove the entire repository tree. Absence is not an error.
    fn delete(&self, cancel: &CancelToken) -> Result<()>;

    /// Convenience: upload an in-memory buffer.
    fn save_bytes(&self, h: &Handle, data: &[u8], cancel: &CancelToken) -> Result<()> {
        let mut cursor = std::io::Cursor::new(data);
        let len = data.len() as u64;
        self.save(h, SaveStream::new(&mut cursor, Some(len)), cancel)
    }

    /// Convenience: read an entire object into memory.
    fn load_all(&self, h: &Handle, cancel: &CancelToken) -> Result<Vec<u8>> {
        let mut rd = self.load(h, 0, 0, cancel)?;
        let mut buf = Vec::new();
        rd.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Convenience: read an exact byte range into memory. A short read is an
    /// error, not a silent truncation.
    fn load_range(
        &self,
        h: &Handle,
        length: u32,
        offset: u64,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        let mut rd = self.load(h, length, offset, cancel)?;
        let mut buf = Vec::with_capacity(length as usize);
        rd.read_to_end(&mut buf)?;
        if buf.len() != length as usize {
            return Err(RuckError::Integrity(format!(
                "short range read on {h}: wanted {length} bytes at offset {offset}, got {}",
                buf.len()
            )));
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_display() {
        assert_eq!(Handle::config().to_string(), "config");
        assert_eq!(Handle::new(FileType::Data, "ab12").to_string(), "data/ab12");
        assert_eq!(
            Handle::new(FileType::Snapshot, "cd34").to_string(),
            "snapshots/cd34"
        );
    }

    #[test]
    fn handle_validation() {
        assert!(Handle::config().valid().is_ok());
        assert!(Handle::new(FileType::Data, "").valid().is_err());
    }

    #[test]
    fn save_stream_from_file_accounts_for_position() {
        use std::io::Write;
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        tmp.seek(SeekFrom::Start(4)).unwrap();
        let stream = SaveStream::from_file(&mut tmp).unwrap();
        assert_eq!(stream.size(), Some(6));
    }
}
