//! Tests for the image store.
//!
//! Validates the cache layout, staging + atomic commit, per-image locking
//! and listing/removal.

use magikjail::{Error, ImageReference, ImageStore};
use std::fs;
use std::sync::mpsc;
use std::time::Duration;
use tempfile::TempDir;

fn reference(s: &str) -> ImageReference {
    ImageReference::parse(s).unwrap()
}

// =============================================================================
// Creation Tests
// =============================================================================

#[test]
fn test_store_creates_layout() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("deeply").join("nested").join("images");

    let store = ImageStore::with_path(&base).unwrap();

    assert_eq!(store.base_dir(), base);
    assert!(base.join(".staging").is_dir());
    assert!(base.join(".locks").is_dir());
}

// =============================================================================
// Staging and Commit Tests
// =============================================================================

#[test]
fn test_commit_makes_image_visible() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::with_path(temp.path()).unwrap();
    let alpine = reference("alpine:latest");
    assert!(!store.is_pulled(&alpine));

    let staging = store.stage(&alpine).unwrap();
    fs::create_dir_all(staging.path().join("bin")).unwrap();
    fs::write(staging.path().join("bin/sh"), b"sh").unwrap();
    let staged_path = staging.path().to_path_buf();

    let dir = store.commit(staging, &alpine).unwrap();

    assert!(store.is_pulled(&alpine));
    assert_eq!(dir, temp.path().join("alpine:latest"));
    assert_eq!(fs::read(dir.join("bin/sh")).unwrap(), b"sh");
    assert!(!staged_path.exists());
}

#[test]
fn test_commit_refuses_to_replace_existing_image() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::with_path(temp.path()).unwrap();
    let alpine = reference("alpine");
    fs::create_dir(store.image_dir(&alpine)).unwrap();

    let staging = store.stage(&alpine).unwrap();
    let staged_path = staging.path().to_path_buf();
    let err = store.commit(staging, &alpine).unwrap_err();

    assert!(matches!(err, Error::Storage { .. }));
    // the failed commit still cleans up after itself
    assert!(!staged_path.exists());
}

#[test]
fn test_concurrent_stagings_are_distinct() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::with_path(temp.path()).unwrap();
    let alpine = reference("alpine");

    let a = store.stage(&alpine).unwrap();
    let b = store.stage(&alpine).unwrap();

    assert_ne!(a.path(), b.path());
}

// =============================================================================
// Locking Tests
// =============================================================================

#[test]
fn test_lock_serializes_pulls_of_same_image() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::with_path(temp.path()).unwrap();
    let alpine = reference("alpine");

    let held = store.lock(&alpine).unwrap();
    assert!(held.path().exists());

    let (tx, rx) = mpsc::channel();
    let contender = store.clone();
    let handle = std::thread::spawn(move || {
        let _lock = contender.lock(&reference("alpine")).unwrap();
        tx.send(()).unwrap();
    });

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    drop(held);
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    handle.join().unwrap();
}

#[test]
fn test_locks_of_different_images_are_independent() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::with_path(temp.path()).unwrap();

    let _alpine = store.lock(&reference("alpine")).unwrap();
    let _ubuntu = store.lock(&reference("ubuntu")).unwrap();
}

// =============================================================================
// Listing and Removal Tests
// =============================================================================

#[test]
fn test_list_skips_internal_directories() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::with_path(temp.path()).unwrap();

    for image in ["ubuntu:22.04", "alpine", "bitnami/redis:7"] {
        let r = reference(image);
        let staging = store.stage(&r).unwrap();
        store.commit(staging, &r).unwrap();
    }
    let _in_flight = store.stage(&reference("busybox")).unwrap();
    fs::write(temp.path().join("stray-file"), b"").unwrap();

    assert_eq!(
        store.list().unwrap(),
        ["alpine:latest", "bitnami/redis:7", "ubuntu:22.04"]
    );
}

#[test]
fn test_remove() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::with_path(temp.path()).unwrap();
    let alpine = reference("alpine");
    let staging = store.stage(&alpine).unwrap();
    fs::write(staging.path().join("file"), b"x").unwrap();
    store.commit(staging, &alpine).unwrap();

    assert!(store.remove(&alpine).unwrap());
    assert!(!store.is_pulled(&alpine));
    assert!(!store.remove(&alpine).unwrap());
}
