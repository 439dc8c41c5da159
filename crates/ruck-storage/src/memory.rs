use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;

use ruck_types::{CancelToken, Result, RuckError};

use crate::{Backend, FileInfo, FileType, Handle, SaveStream};

/// In-memory backend for tests. Thread-safe via Mutex.
///
/// Objects are write-once, matching the `If-None-Match: *` semantics of the
/// remote backends: saving an existing name fails with a 412-bearing error.
pub struct MemoryBackend {
    inner: Arc<Mutex<HashMap<(FileType, String), Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of stored objects of the given type.
    pub fn count(&self, t: FileType) -> usize {
        let map = self.inner.lock().unwrap();
        map.keys().filter(|(ft, _)| *ft == t).count()
    }

    /// Total stored bytes across all objects.
    pub fn total_bytes(&self) -> u64 {
        let map = self.inner.lock().unwrap();
        map.values().map(|v| v.len() as u64).sum()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn location(&self) -> String {
        "memory:".into()
    }

    fn test(&self, h: &Handle, _cancel: &CancelToken) -> Result<bool> {
        let map = self.inner.lock().unwrap();
        Ok(map.contains_key(&(h.file_type, h.name.clone())))
    }

    fn save(&self, h: &Handle, body: SaveStream<'_>, cancel: &CancelToken) -> Result<()> {
        h.valid()?;
        cancel.check()?;
        let (reader, _size) = body.into_parts();
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let mut map = self.inner.lock().unwrap();
        let key = (h.file_type, h.name.clone());
        if map.contains_key(&key) {
            return Err(RuckError::http(412, "Precondition Failed"));
        }
        map.insert(key, data);
        Ok(())
    }

    fn load(
        &self,
        h: &Handle,
        length: u32,
        offset: u64,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Read + Send>> {
        cancel.check()?;
        let map = self.inner.lock().unwrap();
        let data = map
            .get(&(h.file_type, h.name.clone()))
            .ok_or_else(|| RuckError::NotExist(h.to_string()))?;

        let start = (offset as usize).min(data.len());
        let end = if length == 0 {
            data.len()
        } else {
            (start + length as usize).min(data.len())
        };
        Ok(Box::new(Cursor::new(data[start..end].to_vec())))
    }

    fn stat(&self, h: &Handle, _cancel: &CancelToken) -> Result<FileInfo> {
        let map = self.inner.lock().unwrap();
        let data = map
            .get(&(h.file_type, h.name.clone()))
            .ok_or_else(|| RuckError::NotExist(h.to_string()))?;
        Ok(FileInfo {
            size: data.len() as u64,
        })
    }

    fn remove(&self, h: &Handle, _cancel: &CancelToken) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        map.remove(&(h.file_type, h.name.clone()))
            .ok_or_else(|| RuckError::NotExist(h.to_string()))?;
        Ok(())
    }

    fn list(&self, t: FileType, cancel: &CancelToken) -> Receiver<String> {
        let (tx, rx) = crossbeam_channel::bounded(128);
        let names: Vec<String> = {
            let map = self.inner.lock().unwrap();
            map.keys()
                .filter(|(ft, _)| *ft == t)
                .map(|(_, name)| name.clone())
                .collect()
        };
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            for name in names {
                if cancel.is_cancelled() {
                    return;
                }
                loop {
                    match tx.send_timeout(name.clone(), Duration::from_millis(100)) {
                        Ok(()) => break,
                        Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => {
                            if cancel.is_cancelled() {
                                return;
                            }
                        }
                        Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return,
                    }
                }
            }
        });
        rx
    }

    fn delete(&self, _cancel: &CancelToken) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        map.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancelToken {
        CancelToken::new()
    }

    #[test]
    fn save_load_roundtrip() {
        let be = MemoryBackend::new();
        let h = Handle::new(FileType::Data, "ab12");
        be.save_bytes(&h, b"payload", &cancel()).unwrap();
        assert_eq!(be.load_all(&h, &cancel()).unwrap(), b"payload");
        assert_eq!(be.stat(&h, &cancel()).unwrap().size, 7);
    }

    #[test]
    fn second_save_fails_with_412() {
        let be = MemoryBackend::new();
        let h = Handle::config();
        be.save_bytes(&h, b"one", &cancel()).unwrap();
        let err = be.save_bytes(&h, b"two", &cancel()).unwrap_err();
        assert!(matches!(err, RuckError::Transport { status: 412, .. }));
    }

    #[test]
    fn range_read() {
        let be = MemoryBackend::new();
        let h = Handle::new(FileType::Data, "ab");
        be.save_bytes(&h, b"0123456789", &cancel()).unwrap();
        assert_eq!(be.load_range(&h, 4, 3, &cancel()).unwrap(), b"3456");
        // length 0 reads to the end
        let mut rd = be.load(&h, 0, 6, &cancel()).unwrap();
        let mut buf = Vec::new();
        rd.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"6789");
    }

    #[test]
    fn missing_object_is_not_exist() {
        let be = MemoryBackend::new();
        let h = Handle::new(FileType::Index, "ffff");
        assert!(!be.test(&h, &cancel()).unwrap());
        let err = be.stat(&h, &cancel()).unwrap_err();
        assert!(err.is_not_exist());
    }

    #[test]
    fn list_yields_all_names() {
        let be = MemoryBackend::new();
        for i in 0..10 {
            let h = Handle::new(FileType::Snapshot, format!("{i:02x}"));
            be.save_bytes(&h, b"x", &cancel()).unwrap();
        }
        let names: Vec<String> = be.list(FileType::Snapshot, &cancel()).iter().collect();
        assert_eq!(names.len(), 10);
    }
}
