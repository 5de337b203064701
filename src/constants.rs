//! # Runtime Constants
//!
//! Registry endpoints, resource limits, timeouts and media types used across
//! the crate. These are the defaults behind [`RuntimeConfig`]; anything an
//! operator may want to change is overridable there.
//!
//! ## Cross-References
//!
//! - [`crate::registry`]: endpoints, timeouts, retry policy
//! - [`crate::manifest`]: media types and manifest size bound
//! - [`crate::layer`]: layer size bound
//! - [`crate::storage`]: cache directory layout
//!
//! [`RuntimeConfig`]: crate::config::RuntimeConfig

use std::time::Duration;

// =============================================================================
// Registry Endpoints
// =============================================================================
//
// Defaults target Docker Hub. The token service issues anonymous pull tokens
// scoped to a single repository.
// =============================================================================

/// Default token service URL.
pub const DEFAULT_AUTH_URL: &str = "https://auth.docker.io/token";

/// Default `service` parameter sent to the token endpoint.
pub const DEFAULT_AUTH_SERVICE: &str = "registry.docker.io";

/// Default registry base URL (the `/v2/...` API is appended).
pub const DEFAULT_REGISTRY_URL: &str = "https://registry.hub.docker.com";

/// Default repository namespace for single-component image names.
pub const DEFAULT_NAMESPACE: &str = "library";

/// Tag used when the image reference does not carry one.
pub const DEFAULT_TAG: &str = "latest";

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum tag length, as enforced by registries.
pub const MAX_TAG_LEN: usize = 128;

/// Maximum size of a single compressed layer blob (512 MiB).
///
/// **Attack Vector**: A malicious registry could serve an endless blob.
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum number of layers accepted from one manifest.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest body size (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

// =============================================================================
// Timeouts & Retries
// =============================================================================
//
// A hung registry connection must not block a run forever. Individual
// requests are bounded by REQUEST_TIMEOUT; the pull as a whole (token,
// manifests and every layer) by IMAGE_PULL_TIMEOUT.
// =============================================================================

/// Timeout for a single registry request, and for each blob chunk read.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a complete image pull (5 minutes).
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Number of retries for 429/5xx responses.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay for exponential retry backoff.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Number of layer blobs downloaded concurrently.
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 3;

// =============================================================================
// Storage Paths
// =============================================================================
//
// Layout under the images root:
//
//   <images-root>/
//   ├── alpine:latest/        (flattened rootfs, present == pulled)
//   ├── .staging/             (in-progress pulls, renamed on success)
//   └── .locks/               (one flock file per image)
// =============================================================================

/// Directory under the user's home holding all runtime state.
pub const STATE_DIR_NAME: &str = ".magikjail";

/// Subdirectory of the state dir holding flattened image roots.
pub const IMAGES_DIR: &str = "images";

/// Subdirectory of the images root for in-progress pulls.
pub const STAGING_DIR: &str = ".staging";

/// Subdirectory of the images root for per-image lock files.
pub const LOCKS_DIR: &str = ".locks";

/// Prefix for temporary sandbox roots in the host temp directory.
pub const SANDBOX_PREFIX: &str = "magikjail-";

// =============================================================================
// Media Types
// =============================================================================
//
// Reference: <https://github.com/opencontainers/image-spec/blob/main/media-types.md>
// =============================================================================

/// Docker manifest list (multi-platform).
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker image manifest (single platform).
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// OCI Image Index media type (multi-platform manifest list).
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// OCI Image Manifest media type (single-platform image).
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Docker gzip-compressed layer.
pub const DOCKER_LAYER_MEDIA_TYPE_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// OCI Layer media type (gzip-compressed tar archive).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI Layer media type (uncompressed tar archive).
pub const OCI_LAYER_MEDIA_TYPE_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit status for engine-level failures (auth, pull, isolation, spawn).
///
/// Child exit codes are propagated verbatim, so a child exiting 1 and an
/// engine failure are only distinguishable through the `error:` line on
/// stderr.
pub const EXIT_ENGINE_FAILURE: u8 = 1;

/// Offset added to the signal number when the child was killed by a signal.
pub const EXIT_SIGNAL_OFFSET: i32 = 128;

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for image references.
///
/// The `@` is for digest references like `alpine@sha256:abc...`.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";
