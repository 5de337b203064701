//! Shared fixtures: layer tarballs and a fake registry.

#![allow(dead_code)]

use flate2::Compression;
use flate2::write::GzEncoder;
use magikjail::RuntimeConfig;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tar::{EntryType, Header};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_TOKEN: &str = "test-token";

pub const DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_LAYER: &str = magikjail::DOCKER_LAYER_MEDIA_TYPE_GZIP;

// =============================================================================
// Layer Fixtures
// =============================================================================

/// One tar entry of a fixture layer.
pub enum Entry<'a> {
    Dir(&'a str, u32),
    File(&'a str, u32, &'a [u8]),
    Symlink(&'a str, &'a str),
    HardLink(&'a str, &'a str),
    Fifo(&'a str),
}

/// Builds an uncompressed tar stream.
pub fn tar_layer(entries: &[Entry<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    for entry in entries {
        let mut header = Header::new_gnu();
        match entry {
            Entry::Dir(name, mode) => {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(*mode);
                header.set_size(0);
                builder.append_data(&mut header, name, std::io::empty()).unwrap();
            }
            Entry::File(name, mode, data) => {
                header.set_entry_type(EntryType::Regular);
                header.set_mode(*mode);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, name, *data).unwrap();
            }
            Entry::Symlink(name, target) => {
                header.set_entry_type(EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                header.set_link_name(target).unwrap();
                builder.append_data(&mut header, name, std::io::empty()).unwrap();
            }
            Entry::HardLink(name, target) => {
                header.set_entry_type(EntryType::Link);
                header.set_mode(0o644);
                header.set_size(0);
                header.set_link_name(target).unwrap();
                builder.append_data(&mut header, name, std::io::empty()).unwrap();
            }
            Entry::Fifo(name) => {
                header.set_entry_type(EntryType::Fifo);
                header.set_mode(0o644);
                header.set_size(0);
                builder.append_data(&mut header, name, std::io::empty()).unwrap();
            }
        }
    }

    builder.into_inner().unwrap()
}

/// Gzip-compresses `data`.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Builds a gzip-compressed layer.
pub fn gz_layer(entries: &[Entry<'_>]) -> Vec<u8> {
    gzip(&tar_layer(entries))
}

/// `sha256:<hex>` digest of `data`.
pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Mode bits of a path, without following symlinks.
pub fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::symlink_metadata(path).unwrap().permissions().mode() & 0o7777
}

// =============================================================================
// Fake Registry
// =============================================================================

/// Engine configuration pointing at `server`, caching under `images_root`.
pub fn test_config(server: &MockServer, images_root: &Path) -> RuntimeConfig {
    RuntimeConfig {
        images_root: images_root.to_path_buf(),
        max_retries: 2,
        retry_backoff: Duration::from_millis(10),
        ..RuntimeConfig::default()
    }
    .with_registry_base(&server.uri())
}

/// Mounts the token endpoint, expecting `expected` calls.
pub async fn mount_token(server: &MockServer, expected: u64) {
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": TEST_TOKEN })))
        .expect(expected)
        .mount(server)
        .await;
}

/// Single-platform manifest body for `layers`.
pub fn image_manifest(layers: &[Vec<u8>]) -> serde_json::Value {
    json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": digest_of(b"{}"),
            "size": 2
        },
        "layers": layers.iter().map(|layer| json!({
            "mediaType": DOCKER_LAYER,
            "digest": digest_of(layer),
            "size": layer.len()
        })).collect::<Vec<_>>()
    })
}

/// Manifest list body with one entry per `(os, arch, digest)`.
pub fn manifest_list(entries: &[(&str, &str, &str)]) -> serde_json::Value {
    json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_LIST,
        "manifests": entries.iter().map(|(os, arch, digest)| json!({
            "mediaType": DOCKER_MANIFEST,
            "digest": digest,
            "size": 100,
            "platform": { "os": os, "architecture": arch }
        })).collect::<Vec<_>>()
    })
}

/// Mounts a manifest body at `/v2/<repo>/manifests/<reference>`.
pub async fn mount_manifest(
    server: &MockServer,
    repo: &str,
    reference: &str,
    body: &serde_json::Value,
    expected: u64,
) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/{}", repo, reference)))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(expected)
        .mount(server)
        .await;
}

/// Mounts each layer at `/v2/<repo>/blobs/<digest>`.
pub async fn mount_blobs(server: &MockServer, repo: &str, layers: &[Vec<u8>], expected: u64) {
    for layer in layers {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", repo, digest_of(layer))))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(layer.clone()))
            .expect(expected)
            .mount(server)
            .await;
    }
}

/// Mounts token, single-platform manifest and blobs for `repo:tag`, each
/// expected exactly `expected` times.
pub async fn mount_image(
    server: &MockServer,
    repo: &str,
    tag: &str,
    layers: &[Vec<u8>],
    expected: u64,
) {
    mount_token(server, expected).await;
    mount_manifest(server, repo, tag, &image_manifest(layers), expected).await;
    mount_blobs(server, repo, layers, expected).await;
}
