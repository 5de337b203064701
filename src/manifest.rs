//! Manifest decoding and platform resolution.
//!
//! A tag on a registry points either at a single-platform image manifest
//! (with a `layers` array) or at a manifest list / OCI image index (with a
//! `manifests` array, one entry per platform). The body is decoded once into
//! [`Manifest`], whose variant is chosen by which of the two arrays is
//! present, and resolution dispatches on that variant:
//!
//! ```text
//! GET manifests/<tag>  (Accept: list + single)
//!   ├── Manifest::Image(layers) ──────────────────────────► layers
//!   └── Manifest::List(entries)
//!         └── first entry with host os/arch
//!               └── GET manifests/<digest> (Accept: single)
//!                     └── Manifest::Image(layers) ────────► layers
//! ```
//!
//! There is no fallback to another architecture: a list without a matching
//! entry fails with [`Error::UnsupportedPlatform`] before any blob is
//! downloaded.
//!
//! [`Error::UnsupportedPlatform`]: crate::error::Error::UnsupportedPlatform

use crate::constants::MAX_LAYERS;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::registry::{AuthToken, ManifestKind, RegistryClient};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Platform of a manifest list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSpec {
    /// e.g. `linux`.
    pub os: String,
    /// e.g. `amd64`.
    pub architecture: String,
    /// e.g. `v8` for arm64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// One per-platform entry of a manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDescriptor {
    pub digest: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub platform: Option<PlatformSpec>,
    #[serde(default)]
    pub size: u64,
}

/// One filesystem layer blob.
///
/// Order matters: an image's layers are applied bottom-to-top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    pub digest: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
}

/// Decoded manifest body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    /// Manifest list or OCI index.
    List(Vec<ManifestDescriptor>),
    /// Single-platform image manifest.
    Image(Vec<LayerDescriptor>),
}

/// Wire shape shared by every manifest flavour; only used to find the
/// discriminant.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    schema_version: Option<u32>,
    #[serde(default)]
    manifests: Option<Vec<ManifestDescriptor>>,
    #[serde(default)]
    layers: Option<Vec<LayerDescriptor>>,
}

impl Manifest {
    /// Decodes a manifest body and classifies it.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let raw: RawManifest =
            serde_json::from_slice(body).map_err(|e| Error::InvalidManifest {
                reason: e.to_string(),
            })?;

        if raw.schema_version == Some(1) {
            return Err(Error::InvalidManifest {
                reason: "schema version 1 manifests are not supported".to_string(),
            });
        }

        match (raw.manifests, raw.layers) {
            (Some(entries), _) if !entries.is_empty() => Ok(Self::List(entries)),
            (_, Some(layers)) => Ok(Self::Image(layers)),
            _ => Err(Error::InvalidManifest {
                reason: "manifest has neither platform entries nor layers".to_string(),
            }),
        }
    }
}

/// Picks the first list entry matching `platform`.
pub fn select_platform<'a>(
    entries: &'a [ManifestDescriptor],
    platform: &Platform,
) -> Result<&'a ManifestDescriptor> {
    entries
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| platform.matches(&p.os, &p.architecture))
        })
        .ok_or_else(|| Error::UnsupportedPlatform {
            platform: platform.oci_platform(),
            available: entries
                .iter()
                .filter_map(|e| e.platform.as_ref())
                .map(|p| format!("{}/{}", p.os, p.architecture))
                .collect(),
        })
}

/// Resolves `image_name:tag` to its ordered layer list for `platform`.
pub async fn resolve_layers(
    client: &RegistryClient,
    token: &AuthToken,
    image_name: &str,
    tag: &str,
    platform: &Platform,
) -> Result<Vec<LayerDescriptor>> {
    let body = client
        .get_manifest(token, image_name, tag, ManifestKind::List)
        .await?;

    let layers = match Manifest::from_slice(&body)? {
        Manifest::Image(layers) => {
            debug!(image = %image_name, tag = %tag, "Single-platform manifest");
            layers
        }
        Manifest::List(entries) => {
            let entry = select_platform(&entries, platform)?;
            info!(
                image = %image_name,
                platform = %platform.oci_platform(),
                digest = %entry.digest,
                "Selected platform manifest"
            );

            let body = client
                .get_manifest(token, image_name, &entry.digest, ManifestKind::Image)
                .await?;

            match Manifest::from_slice(&body)? {
                Manifest::Image(layers) => layers,
                Manifest::List(_) => {
                    return Err(Error::InvalidManifest {
                        reason: format!("nested manifest list at {}", entry.digest),
                    });
                }
            }
        }
    };

    if layers.len() > MAX_LAYERS {
        return Err(Error::ImageTooLarge {
            what: "layer count",
            size: layers.len() as u64,
            limit: MAX_LAYERS as u64,
        });
    }
    if let Some(bad) = layers.iter().find(|l| !is_sha256_digest(&l.digest)) {
        return Err(Error::InvalidManifest {
            reason: format!("unsupported or malformed layer digest '{}'", bad.digest),
        });
    }

    Ok(layers)
}

/// `sha256:` followed by 64 hex digits; the only form blobs are verified in.
fn is_sha256_digest(digest: &str) -> bool {
    digest
        .strip_prefix("sha256:")
        .is_some_and(|hex| hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
}
