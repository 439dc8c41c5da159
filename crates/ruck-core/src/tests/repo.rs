use std::sync::Arc;

use ruck_storage::memory::MemoryBackend;
use ruck_storage::{Backend, FileType};
use ruck_types::{BlobType, CancelToken, Id, RuckError};

use crate::crypto::aes_ctr_poly1305::AesCtrPoly1305Engine;
use crate::crypto::key::MasterKey;
use crate::crypto::PlaintextEngine;
use crate::repo::Repository;
use crate::testutil::{encrypted_memory_repo, memory_repo};

fn cancel() -> CancelToken {
    CancelToken::new()
}

#[test]
fn save_three_blobs_and_read_back_header() {
    let repo = memory_repo();
    for payload in [&b"a"[..], b"bb", b"ccc"] {
        let (id, new) = repo.save_blob(BlobType::Data, payload, &cancel()).unwrap();
        assert_eq!(id, Id::hash(payload));
        assert!(new);
    }
    repo.flush(&cancel()).unwrap();

    let packs = repo.with_index(|idx| idx.list_packs());
    assert_eq!(packs.len(), 1);
    let pack_id = *packs.iter().next().unwrap();

    let blobs = repo.read_pack_header(&pack_id, &cancel()).unwrap();
    assert_eq!(blobs.len(), 3);
    // Entries in write order with implicit prefix-sum offsets.
    assert_eq!(blobs[0].length, 1);
    assert_eq!(blobs[1].length, 2);
    assert_eq!(blobs[2].length, 3);
    assert_eq!(blobs[0].id, Id::hash(b"a"));
    assert_eq!(blobs[1].id, Id::hash(b"bb"));
    assert_eq!(blobs[2].id, Id::hash(b"ccc"));

    let plain = repo
        .load_blob(BlobType::Data, &Id::hash(b"a"), &cancel())
        .unwrap();
    assert_eq!(plain, b"a");
}

#[test]
fn pack_name_is_hash_of_stored_bytes() {
    let (repo, backend) = encrypted_memory_repo();
    repo.save_blob(BlobType::Data, b"payload", &cancel()).unwrap();
    repo.flush(&cancel()).unwrap();

    let packs = repo.with_index(|idx| idx.list_packs());
    let pack_id = *packs.iter().next().unwrap();
    let stored = backend
        .load_all(
            &ruck_storage::Handle::new(FileType::Data, pack_id.to_hex()),
            &cancel(),
        )
        .unwrap();
    assert_eq!(Id::hash(&stored), pack_id);
}

#[test]
fn duplicate_blob_is_stored_once() {
    let repo = memory_repo();
    let (id1, new1) = repo.save_blob(BlobType::Data, b"same", &cancel()).unwrap();
    let (id2, new2) = repo.save_blob(BlobType::Data, b"same", &cancel()).unwrap();
    assert_eq!(id1, id2);
    assert!(new1);
    assert!(!new2);

    repo.flush(&cancel()).unwrap();
    let packs = repo.with_index(|idx| idx.list_packs());
    assert_eq!(packs.len(), 1);
    let blobs = repo
        .read_pack_header(packs.iter().next().unwrap(), &cancel())
        .unwrap();
    assert_eq!(blobs.len(), 1, "exactly one in-pack copy");

    // A later save of the same content adds nothing to the repository.
    let (_, new3) = repo.save_blob(BlobType::Data, b"same", &cancel()).unwrap();
    assert!(!new3);
    repo.flush(&cancel()).unwrap();
    assert_eq!(repo.with_index(|idx| idx.list_packs()).len(), 1);
}

#[test]
fn blob_size_without_load() {
    let (repo, _) = encrypted_memory_repo();
    let (id, _) = repo
        .save_blob(BlobType::Data, &[7u8; 1234], &cancel())
        .unwrap();
    assert_eq!(repo.blob_size(&id, BlobType::Data), Some(1234));
    repo.flush(&cancel()).unwrap();
    assert_eq!(repo.blob_size(&id, BlobType::Data), Some(1234));
    assert_eq!(repo.blob_size(&id, BlobType::Tree), None);
}

#[test]
fn data_and_tree_blobs_go_to_separate_packs() {
    let repo = memory_repo();
    repo.save_blob(BlobType::Data, b"data blob", &cancel()).unwrap();
    repo.save_blob(BlobType::Tree, b"{\"nodes\":[]}", &cancel())
        .unwrap();
    repo.flush(&cancel()).unwrap();

    let (packs, tree_packs) =
        repo.with_index(|idx| (idx.list_packs(), idx.tree_packs().clone()));
    assert_eq!(packs.len(), 2);
    assert_eq!(tree_packs.len(), 1);
}

#[test]
fn index_roundtrip_through_storage() {
    let backend = Arc::new(MemoryBackend::new());
    let crypto = Arc::new(AesCtrPoly1305Engine::new(&MasterKey::from_bytes([3; 32])));

    let id = {
        let repo =
            Repository::init(backend.clone(), crypto.clone(), &cancel()).unwrap();
        let (id, _) = repo.save_blob(BlobType::Data, b"persisted", &cancel()).unwrap();
        repo.flush(&cancel()).unwrap();
        repo.save_index(&cancel()).unwrap().expect("one pack written");
        id
    };

    let reopened = Repository::open(backend, crypto, &cancel()).unwrap();
    reopened.load_index(&cancel()).unwrap();
    assert!(reopened.with_index(|idx| idx.has(&id, BlobType::Data)));
    let plain = reopened.load_blob(BlobType::Data, &id, &cancel()).unwrap();
    assert_eq!(plain, b"persisted");
}

#[test]
fn second_init_fails_with_config_exists() {
    let backend = Arc::new(MemoryBackend::new());
    Repository::init(backend.clone(), Arc::new(PlaintextEngine), &cancel()).unwrap();
    let err =
        Repository::init(backend, Arc::new(PlaintextEngine), &cancel()).unwrap_err();
    assert!(matches!(err, RuckError::ConfigExists));
}

#[test]
fn open_with_wrong_key_fails() {
    let backend = Arc::new(MemoryBackend::new());
    let right = Arc::new(AesCtrPoly1305Engine::new(&MasterKey::from_bytes([1; 32])));
    let wrong = Arc::new(AesCtrPoly1305Engine::new(&MasterKey::from_bytes([2; 32])));
    Repository::init(backend.clone(), right, &cancel()).unwrap();
    let err = Repository::open(backend, wrong, &cancel()).unwrap_err();
    assert!(matches!(err, RuckError::Integrity(_)));
}

#[test]
fn missing_blob_is_not_exist() {
    let repo = memory_repo();
    let err = repo
        .load_blob(BlobType::Data, &Id::hash(b"nope"), &cancel())
        .unwrap_err();
    assert!(err.is_not_exist());
}

#[test]
fn corrupted_pack_fails_integrity_on_load() {
    let backend = Arc::new(MemoryBackend::new());
    let crypto = Arc::new(AesCtrPoly1305Engine::new(&MasterKey::from_bytes([9; 32])));
    let repo = Repository::init(backend.clone(), crypto.clone(), &cancel()).unwrap();
    let (id, _) = repo.save_blob(BlobType::Data, b"fragile", &cancel()).unwrap();
    repo.flush(&cancel()).unwrap();

    // Corrupt the stored pack in place.
    let packs = repo.with_index(|idx| idx.list_packs());
    let pack_id = *packs.iter().next().unwrap();
    let handle = ruck_storage::Handle::new(FileType::Data, pack_id.to_hex());
    let mut bytes = backend.load_all(&handle, &cancel()).unwrap();
    bytes[20] ^= 0xFF;
    backend.remove(&handle, &cancel()).unwrap();
    backend.save_bytes(&handle, &bytes, &cancel()).unwrap();

    let err = repo.load_blob(BlobType::Data, &id, &cancel()).unwrap_err();
    assert!(matches!(err, RuckError::Integrity(_)));
}

#[test]
fn small_pack_target_rolls_packs() {
    let repo = memory_repo();
    repo.set_pack_target(64);
    for i in 0u32..16 {
        let payload = vec![i as u8; 64];
        repo.save_blob(BlobType::Data, &payload, &cancel()).unwrap();
    }
    repo.flush(&cancel()).unwrap();
    let packs = repo.with_index(|idx| idx.list_packs());
    assert!(packs.len() > 1, "expected multiple sealed packs");

    // Every blob remains loadable from whichever pack holds it.
    for i in 0u32..16 {
        let payload = vec![i as u8; 64];
        let plain = repo
            .load_blob(BlobType::Data, &Id::hash(&payload), &cancel())
            .unwrap();
        assert_eq!(plain, payload);
    }
}

#[test]
fn concurrent_savers_share_the_open_pack() {
    let repo = memory_repo();
    let mut handles = Vec::new();
    for worker in 0u8..4 {
        let repo = Arc::clone(&repo);
        handles.push(std::thread::spawn(move || {
            for i in 0u32..50 {
                // Half the payloads are shared across workers (dedup), half
                // are distinct.
                let payload = if i % 2 == 0 {
                    format!("shared-{i}")
                } else {
                    format!("worker-{worker}-{i}")
                };
                repo.save_blob(BlobType::Data, payload.as_bytes(), &CancelToken::new())
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    repo.flush(&cancel()).unwrap();

    // 25 shared + 4×25 distinct payloads.
    let total = repo.with_index(|idx| idx.len());
    assert_eq!(total, 25 + 100);
}
