//! Error types for image pulling, layer assembly and isolated execution.

use std::path::PathBuf;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while pulling, assembling or running an image.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Token endpoint unreachable, non-200, or malformed body.
    #[error("registry authentication failed for '{image}': {reason}")]
    Auth { image: String, reason: String },

    /// Manifest or blob request answered with a non-200 status.
    #[error("registry returned HTTP {status} for {url}")]
    Registry { status: u16, url: String },

    /// Manifest or blob request failed before a status was received.
    #[error("registry unreachable at {url}: {reason}")]
    RegistryUnreachable { url: String, reason: String },

    /// Manifest body could not be decoded or has neither `manifests` nor `layers`.
    #[error("invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// No manifest list entry matches the host OS/architecture.
    #[error("no manifest for platform {platform} (available: {})", .available.join(", "))]
    UnsupportedPlatform {
        platform: String,
        available: Vec<String>,
    },

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Failed to parse or validate an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Downloaded blob does not hash to its digest.
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Blob or layer count exceeded limits.
    #[error("image exceeds limit: {what} {size} > {limit}")]
    ImageTooLarge {
        what: &'static str,
        size: u64,
        limit: u64,
    },

    // =========================================================================
    // Extraction Errors
    // =========================================================================
    /// Malformed tar framing, bad compression, or truncated payload.
    #[error("corrupt layer archive: {reason}")]
    CorruptArchive { reason: String },

    /// Archive entry escapes the destination root.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// I/O failure while writing the extracted filesystem.
    #[error("failed to extract {}: {source}", .path.display())]
    Extraction {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Image cache could not be prepared, locked or committed.
    #[error("image store error at {}: {reason}", .path.display())]
    Storage { path: PathBuf, reason: String },

    // =========================================================================
    // Isolation & Execution Errors
    // =========================================================================
    /// Root change (or the mandatory cwd reset after it) failed.
    #[error("isolation failed during {operation}: {source}")]
    Isolation {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Target command missing or not executable inside the new root.
    #[error("failed to execute '{command}': {source}")]
    Execution {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Control Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Pull interrupted by the user.
    #[error("interrupted: {0}")]
    Cancelled(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for registry responses worth retrying (429 and 5xx).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Registry { status, .. } => *status == 429 || (500..600).contains(status),
            Self::RegistryUnreachable { .. } => true,
            _ => false,
        }
    }

    /// Returns the HTTP status carried by a registry error.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Registry { status, .. } => Some(*status),
            _ => None,
        }
    }
}
