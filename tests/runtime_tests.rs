//! Tests for the engine's pull path.
//!
//! Drives full pulls against a wiremock registry into a temporary image
//! store: layer ordering, cache reuse and the failures that must leave the
//! cache untouched. Running commands needs root and lives in
//! `isolation_tests.rs`.

mod common;

use common::{
    Entry, digest_of, gz_layer, image_manifest, manifest_list, mount_blobs, mount_image,
    mount_manifest, mount_token, test_config,
};
use magikjail::{
    Arch, Engine, Error, ExecutionRoot, ImageReference, Os, Platform, RunMode, RunRequest,
};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REPO: &str = "library/alpine";

fn engine(server: &MockServer, images: &Path) -> Engine {
    Engine::new(test_config(server, images))
        .unwrap()
        .with_platform(Platform::new(Os::Linux, Arch::Amd64))
}

fn staging_is_empty(images: &Path) -> bool {
    fs::read_dir(images.join(".staging")).unwrap().count() == 0
}

fn alpine() -> ImageReference {
    ImageReference::parse("alpine:latest").unwrap()
}

// =============================================================================
// Pull Tests
// =============================================================================

#[tokio::test]
async fn test_pull_assembles_layers_in_order() {
    let server = MockServer::start().await;
    let layers = vec![
        gz_layer(&[
            Entry::Dir("etc/", 0o755),
            Entry::File("etc/conf", 0o600, b"base"),
            Entry::File("etc/only-base", 0o644, b"kept"),
        ]),
        gz_layer(&[Entry::File("etc/conf", 0o644, b"override")]),
        gz_layer(&[
            Entry::File("bin/busybox", 0o755, b"\x7fELF"),
            Entry::Symlink("bin/echo", "/bin/busybox"),
        ]),
    ];
    mount_image(&server, REPO, "latest", &layers, 1).await;
    let images = TempDir::new().unwrap();

    let root = engine(&server, images.path()).pull(&alpine()).await.unwrap();

    assert_eq!(root, images.path().join("alpine:latest"));
    assert_eq!(fs::read(root.join("etc/conf")).unwrap(), b"override");
    assert_eq!(common::mode_of(&root.join("etc/conf")), 0o644);
    assert_eq!(fs::read(root.join("etc/only-base")).unwrap(), b"kept");
    assert_eq!(fs::read_link(root.join("bin/echo")).unwrap().to_str(), Some("/bin/busybox"));
    assert!(staging_is_empty(images.path()));
}

#[tokio::test]
async fn test_ordering_holds_with_single_download_slot() {
    let server = MockServer::start().await;
    let layers = vec![
        gz_layer(&[Entry::File("f", 0o644, b"one")]),
        gz_layer(&[Entry::File("f", 0o644, b"two")]),
        gz_layer(&[Entry::File("f", 0o644, b"three")]),
    ];
    mount_image(&server, REPO, "latest", &layers, 1).await;
    let images = TempDir::new().unwrap();
    let mut config = test_config(&server, images.path());
    config.download_concurrency = 1;

    let root = Engine::new(config).unwrap().pull(&alpine()).await.unwrap();

    assert_eq!(fs::read(root.join("f")).unwrap(), b"three");
}

#[tokio::test]
async fn test_pull_through_manifest_list() {
    let server = MockServer::start().await;
    let layers = vec![gz_layer(&[Entry::File("arch", 0o644, b"amd64")])];
    let list = manifest_list(&[("linux", "arm64", "sha256:arm"), ("linux", "amd64", "sha256:x86")]);
    mount_token(&server, 1).await;
    mount_manifest(&server, REPO, "latest", &list, 1).await;
    mount_manifest(&server, REPO, "sha256:x86", &image_manifest(&layers), 1).await;
    mount_blobs(&server, REPO, &layers, 1).await;
    let images = TempDir::new().unwrap();

    let root = engine(&server, images.path()).pull(&alpine()).await.unwrap();

    assert_eq!(fs::read(root.join("arch")).unwrap(), b"amd64");
}

#[tokio::test]
async fn test_second_pull_does_not_touch_registry() {
    let server = MockServer::start().await;
    let layers = vec![gz_layer(&[Entry::File("hello", 0o644, b"hi")])];
    // exactly one token, manifest and blob request across both pulls
    mount_image(&server, REPO, "latest", &layers, 1).await;
    let images = TempDir::new().unwrap();
    let engine = engine(&server, images.path());

    let first = engine.pull(&alpine()).await.unwrap();
    let second = engine.pull(&alpine()).await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_prepare_root_in_image_mode() {
    let server = MockServer::start().await;
    let layers = vec![gz_layer(&[Entry::File("bin/tool", 0o755, b"x")])];
    mount_image(&server, REPO, "latest", &layers, 1).await;
    let images = TempDir::new().unwrap();

    let request = RunRequest::new("alpine", "bin/tool", vec![]);
    let root = engine(&server, images.path()).prepare_root(&request).await.unwrap();

    match &root {
        ExecutionRoot::Image { path, command } => {
            assert_eq!(path, &images.path().join("alpine:latest"));
            assert_eq!(command, "/bin/tool");
        }
        other => panic!("expected image root, got {:?}", other),
    }
}

#[tokio::test]
async fn test_prepare_root_in_sandbox_mode_skips_registry() {
    let server = MockServer::start().await;
    mount_token(&server, 0).await;
    let images = TempDir::new().unwrap();
    let host = TempDir::new().unwrap();
    let exe = host.path().join("tool");
    fs::write(&exe, b"binary").unwrap();

    let mut config = test_config(&server, images.path());
    config.mode = RunMode::Sandbox;
    let engine = Engine::new(config).unwrap();

    let request = RunRequest::new("ignored", exe.to_str().unwrap(), vec![]);
    let root = engine.prepare_root(&request).await.unwrap();

    assert_eq!(root.command(), "/tool");
    assert_eq!(fs::read(root.path().join("tool")).unwrap(), b"binary");
    let sandbox_path = root.path().to_path_buf();
    drop(root);
    assert!(!sandbox_path.exists());
}

// =============================================================================
// Failure Tests
// =============================================================================

#[tokio::test]
async fn test_manifest_401_leaves_no_image() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/latest", REPO)))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    let images = TempDir::new().unwrap();

    let err = engine(&server, images.path()).pull(&alpine()).await.unwrap_err();

    assert!(matches!(err, Error::Registry { status: 401, .. }), "got {:?}", err);
    assert!(!images.path().join("alpine:latest").exists());
    assert!(staging_is_empty(images.path()));
}

#[tokio::test]
async fn test_unsupported_platform_downloads_nothing() {
    let server = MockServer::start().await;
    let layers = vec![gz_layer(&[Entry::File("f", 0o644, b"arm")])];
    let list = manifest_list(&[("linux", "arm64", "sha256:arm")]);
    mount_token(&server, 1).await;
    mount_manifest(&server, REPO, "latest", &list, 1).await;
    mount_manifest(&server, REPO, "sha256:arm", &image_manifest(&layers), 0).await;
    mount_blobs(&server, REPO, &layers, 0).await;
    let images = TempDir::new().unwrap();

    let err = engine(&server, images.path()).pull(&alpine()).await.unwrap_err();

    assert!(matches!(err, Error::UnsupportedPlatform { .. }), "got {:?}", err);
    assert!(!images.path().join("alpine:latest").exists());
}

#[tokio::test]
async fn test_corrupt_layer_discards_partial_pull() {
    let server = MockServer::start().await;
    let good = gz_layer(&[Entry::File("good", 0o644, b"ok")]);
    let mut bad = vec![0x1f, 0x8b];
    bad.extend_from_slice(b"definitely not deflate data");
    let layers = vec![good, bad];
    mount_image(&server, REPO, "latest", &layers, 1).await;
    let images = TempDir::new().unwrap();

    let err = engine(&server, images.path()).pull(&alpine()).await.unwrap_err();

    assert!(matches!(err, Error::CorruptArchive { .. }), "got {:?}", err);
    assert!(!images.path().join("alpine:latest").exists());
    assert!(staging_is_empty(images.path()));
}

#[tokio::test]
async fn test_tampered_blob_is_rejected() {
    let server = MockServer::start().await;
    let declared = gz_layer(&[Entry::File("f", 0o644, b"expected")]);
    let served = gz_layer(&[Entry::File("f", 0o644, b"tampered")]);
    mount_token(&server, 1).await;
    mount_manifest(&server, REPO, "latest", &image_manifest(&[declared.clone()]), 1).await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, digest_of(&declared))))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(served))
        .mount(&server)
        .await;
    let images = TempDir::new().unwrap();

    let err = engine(&server, images.path()).pull(&alpine()).await.unwrap_err();

    assert!(
        matches!(err, Error::DigestMismatch { .. } | Error::CorruptArchive { .. }),
        "got {:?}",
        err
    );
    assert!(!images.path().join("alpine:latest").exists());
}

#[tokio::test]
async fn test_pull_timeout() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/latest", REPO)))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    let images = TempDir::new().unwrap();
    let mut config = test_config(&server, images.path());
    config.pull_timeout = Duration::from_millis(300);

    let err = Engine::new(config).unwrap().pull(&alpine()).await.unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }), "got {:?}", err);
    assert!(!images.path().join("alpine:latest").exists());
}

#[tokio::test]
async fn test_invalid_reference_fails_before_network() {
    let server = MockServer::start().await;
    mount_token(&server, 0).await;
    let images = TempDir::new().unwrap();

    let request = RunRequest::new("bad image!", "/bin/sh", vec![]);
    let err = engine(&server, images.path()).prepare_root(&request).await.unwrap_err();

    assert!(matches!(err, Error::InvalidImageReference { .. }), "got {:?}", err);
}
