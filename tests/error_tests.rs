//! Tests for error types.
//!
//! Validates display formatting (what ends up after `error:` on stderr),
//! source chaining and retry classification.

use magikjail::Error;
use std::error::Error as _;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Registry Error Tests
// =============================================================================

#[test]
fn test_registry_error_display() {
    let err = Error::Registry {
        status: 401,
        url: "https://registry.example/v2/library/alpine/manifests/latest".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.contains("401"), "should include status");
    assert!(msg.contains("manifests/latest"), "should include URL");
    assert_eq!(err.http_status(), Some(401));
}

#[test]
fn test_auth_error_display() {
    let err = Error::Auth {
        image: "alpine".to_string(),
        reason: "token endpoint returned HTTP 503".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.contains("alpine"));
    assert!(msg.contains("HTTP 503"));
    assert_eq!(err.http_status(), None);
}

#[test]
fn test_unreachable_is_retryable() {
    let err = Error::RegistryUnreachable {
        url: "https://registry.example".to_string(),
        reason: "connection refused".to_string(),
    };
    assert!(err.is_retryable());
    assert!(!Error::InvalidManifest { reason: "x".into() }.is_retryable());
}

// =============================================================================
// Extraction and Execution Error Tests
// =============================================================================

#[test]
fn test_extraction_error_chains_io_source() {
    let err = Error::Extraction {
        path: PathBuf::from("/images/alpine:latest/etc/conf"),
        source: io::Error::new(io::ErrorKind::StorageFull, "no space left"),
    };

    assert!(err.to_string().contains("/images/alpine:latest/etc/conf"));
    assert!(err.source().is_some(), "io error should be the source");
}

#[test]
fn test_execution_error_names_command() {
    let err = Error::Execution {
        command: "/bin/missing".to_string(),
        source: io::Error::from(io::ErrorKind::NotFound),
    };

    assert!(err.to_string().contains("/bin/missing"));
}

#[test]
fn test_isolation_error_names_operation() {
    let err = Error::Isolation {
        operation: "chroot",
        source: io::Error::from_raw_os_error(libc::EPERM),
    };

    assert!(err.to_string().contains("chroot"));
}

#[test]
fn test_timeout_display() {
    let err = Error::Timeout {
        operation: "pull alpine:latest".to_string(),
        duration: Duration::from_secs(300),
    };
    let msg = err.to_string();

    assert!(msg.contains("pull alpine:latest"));
    assert!(msg.contains("300s"));
}

#[test]
fn test_io_error_converts() {
    let err: Error = io::Error::from(io::ErrorKind::PermissionDenied).into();
    assert!(matches!(err, Error::Io(_)));
}
