//! End-to-end barrier lifecycle against an on-disk database.

use std::path::Path;
use std::sync::Arc;

use sealbase::{Barrier, BarrierError, KeyStore, KeyTier, StaticUnsealProvider};
use sealbase_crypto::peek_key_id;
use uuid::Uuid;

fn open_store(path: &Path) -> Arc<KeyStore> {
    Arc::new(KeyStore::open(path).unwrap())
}

#[test]
fn unseal_bootstraps_and_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.db");
    let provider = StaticUnsealProvider::generate().unwrap();

    let barrier = Barrier::unseal(open_store(&path), &provider).unwrap();
    let ciphertext = barrier.encrypt(b"account secret").unwrap();
    assert_ne!(ciphertext, b"account secret");
    assert_eq!(barrier.decrypt(&ciphertext).unwrap(), b"account secret");
}

#[test]
fn reopen_with_same_kek_reads_old_ciphertext() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.db");
    let provider = StaticUnsealProvider::generate().unwrap();

    let ciphertext = {
        let barrier = Barrier::unseal(open_store(&path), &provider).unwrap();
        barrier.encrypt(b"survives restart").unwrap()
    };

    let barrier = Barrier::unseal(open_store(&path), &provider).unwrap();
    assert_eq!(barrier.decrypt(&ciphertext).unwrap(), b"survives restart");
}

#[test]
fn wrong_kek_fails_unseal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.db");

    let provider = StaticUnsealProvider::generate().unwrap();
    Barrier::unseal(open_store(&path), &provider).unwrap();

    let wrong = StaticUnsealProvider::new(provider.id(), &[7u8; 32]).unwrap();
    let err = Barrier::unseal(open_store(&path), &wrong).err().unwrap();
    assert!(matches!(err, BarrierError::UnsealFailure(_)), "{err}");
}

#[test]
fn full_tier_rotation_preserves_old_ciphertext() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.db");
    let provider = StaticUnsealProvider::generate().unwrap();
    let barrier = Barrier::unseal(open_store(&path), &provider).unwrap();

    let before = barrier.encrypt(b"pre-rotation").unwrap();
    let old_key_id = peek_key_id(&before).unwrap();

    barrier.rotate(KeyTier::Content).unwrap();
    barrier.rotate(KeyTier::Intermediate).unwrap();
    barrier.rotate(KeyTier::Root).unwrap();

    let after = barrier.encrypt(b"post-rotation").unwrap();
    assert_ne!(peek_key_id(&after).unwrap(), old_key_id);

    assert_eq!(barrier.decrypt(&before).unwrap(), b"pre-rotation");
    assert_eq!(barrier.decrypt(&after).unwrap(), b"post-rotation");

    // And the whole chain still opens after a restart.
    let barrier = Barrier::unseal(open_store(&path), &provider).unwrap();
    assert_eq!(barrier.decrypt(&before).unwrap(), b"pre-rotation");
}

#[test]
fn ciphertext_with_unknown_key_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.db");
    let provider = StaticUnsealProvider::generate().unwrap();
    let barrier = Barrier::unseal(open_store(&path), &provider).unwrap();

    let mut ciphertext = barrier.encrypt(b"payload").unwrap();
    // Overwrite the embedded key id with one that was never issued.
    ciphertext[2..18].copy_from_slice(Uuid::new_v4().as_bytes());
    let err = barrier.decrypt(&ciphertext).unwrap_err();
    assert!(matches!(err, BarrierError::UnknownKey { .. }), "{err}");
}
