use std::sync::Arc;

use ruck_storage::memory::MemoryBackend;
use ruck_types::CancelToken;

use crate::crypto::aes_ctr_poly1305::AesCtrPoly1305Engine;
use crate::crypto::key::MasterKey;
use crate::crypto::PlaintextEngine;
use crate::repo::Repository;

/// Fresh in-memory repository without encryption.
pub fn memory_repo() -> Arc<Repository> {
    let backend = Arc::new(MemoryBackend::new());
    Arc::new(
        Repository::init(backend, Arc::new(PlaintextEngine), &CancelToken::new())
            .expect("init test repo"),
    )
}

/// Fresh in-memory repository encrypted with a fixed key; the backend is
/// shared with the caller for inspection.
pub fn encrypted_memory_repo() -> (Arc<Repository>, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let engine = Arc::new(AesCtrPoly1305Engine::new(&MasterKey::from_bytes([0xA5; 32])));
    let repo = Repository::init(backend.clone(), engine, &CancelToken::new())
        .expect("init test repo");
    (Arc::new(repo), backend)
}
