//! # Image Store
//!
//! Holds flattened image roots, one directory per `name:tag`, ready to be
//! used as a chroot target.
//!
//! ## Layout
//!
//! ```text
//! ~/.magikjail/images/
//! ├── alpine:latest/              (flattened root, complete)
//! ├── bitnami+redis:7/            ('/' in names becomes '+')
//! ├── .staging/
//! │   ├── alpine:3.19-0192...     (pull in progress)
//! │   └── layer-XXXXXX            (layer blob being downloaded)
//! └── .locks/
//!     └── alpine:latest.lock      (flock held while pulling)
//! ```
//!
//! ## Cache Validity
//!
//! The presence of `<images>/<key>` is the only cache check: no manifest
//! digest comparison, no registry round-trip. That is only sound if a
//! directory at the final path is always a *complete* pull, so pulls are
//! built under `.staging/` and moved into place with a single `rename(2)`
//! once every layer has been applied. A failed or interrupted pull leaves
//! nothing at the final path; its staging directory is removed when the
//! [`StagingDir`] guard drops.
//!
//! ## Concurrency
//!
//! Two processes pulling the same image serialize on an exclusive `flock`
//! of `.locks/<key>.lock`. The second one re-checks [`ImageStore::is_pulled`]
//! after acquiring the lock and skips the pull. The lock is released when
//! the [`ImageLock`] drops (or the process dies).

use crate::constants::{LOCKS_DIR, STAGING_DIR};
use crate::error::{Error, Result};
use crate::reference::ImageReference;
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory of flattened image roots.
#[derive(Debug, Clone)]
pub struct ImageStore {
    base_dir: PathBuf,
}

impl ImageStore {
    /// Opens (creating if needed) an image store at `base_dir`.
    pub fn with_path(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        for dir in [
            base_dir.clone(),
            base_dir.join(STAGING_DIR),
            base_dir.join(LOCKS_DIR),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::Storage {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }

        debug!("Image store at {}", base_dir.display());
        Ok(Self { base_dir })
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Final location of an image's flattened root.
    pub fn image_dir(&self, reference: &ImageReference) -> PathBuf {
        self.base_dir.join(reference.cache_key())
    }

    /// Scratch directory for in-flight downloads (same filesystem as the
    /// image roots).
    pub fn scratch_dir(&self) -> PathBuf {
        self.base_dir.join(STAGING_DIR)
    }

    /// Returns true if a complete root for `reference` is cached.
    pub fn is_pulled(&self, reference: &ImageReference) -> bool {
        self.image_dir(reference).is_dir()
    }

    /// Takes the per-image pull lock, blocking until it is free.
    ///
    /// Blocking; call from a blocking context.
    pub fn lock(&self, reference: &ImageReference) -> Result<ImageLock> {
        let path = self
            .base_dir
            .join(LOCKS_DIR)
            .join(format!("{}.lock", reference.cache_key()));
        let storage_err = |reason: String| Error::Storage {
            path: path.clone(),
            reason,
        };

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| storage_err(e.to_string()))?;

        // SAFETY: flock on a descriptor owned by `file`, which outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(storage_err(format!(
                "flock failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        debug!(image = %reference, "Acquired pull lock");
        Ok(ImageLock { _file: file, path })
    }

    /// Creates a fresh staging directory for a pull of `reference`.
    pub fn stage(&self, reference: &ImageReference) -> Result<StagingDir> {
        let path = self.scratch_dir().join(format!(
            "{}-{}",
            reference.cache_key(),
            uuid::Uuid::now_v7()
        ));
        fs::create_dir(&path).map_err(|e| Error::Storage {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(StagingDir {
            path,
            committed: false,
        })
    }

    /// Moves a fully extracted staging directory to its final location.
    pub fn commit(&self, mut staging: StagingDir, reference: &ImageReference) -> Result<PathBuf> {
        let target = self.image_dir(reference);
        if target.exists() {
            return Err(Error::Storage {
                path: target,
                reason: "image directory already exists".to_string(),
            });
        }

        fs::rename(&staging.path, &target).map_err(|e| Error::Storage {
            path: target.clone(),
            reason: format!("failed to move staged root into place: {}", e),
        })?;
        staging.committed = true;

        info!(image = %reference, path = %target.display(), "Image committed");
        Ok(target)
    }

    /// Deletes a cached image. Returns false if it was not present.
    pub fn remove(&self, reference: &ImageReference) -> Result<bool> {
        let dir = self.image_dir(reference);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).map_err(|e| Error::Storage {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        info!(image = %reference, "Image removed");
        Ok(true)
    }

    /// Lists cached images as reference strings, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.base_dir).map_err(|e| Error::Storage {
            path: self.base_dir.clone(),
            reason: e.to_string(),
        })?;

        let mut images = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(key) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if key.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match decode_cache_key(&key) {
                Some(reference) => images.push(reference),
                None => warn!("Ignoring unrecognized entry in image store: {}", key),
            }
        }
        images.sort();
        Ok(images)
    }
}

/// Inverse of [`ImageReference::cache_key`], in display form.
fn decode_cache_key(key: &str) -> Option<String> {
    let (name, tag) = key.split_once(':')?;
    let name = name.replace('+', "/");
    let tag = tag.replace('+', "/");
    let sep = if tag.starts_with("sha256:") { '@' } else { ':' };
    Some(format!("{}{}{}", name, sep, tag))
}

/// Exclusive pull lock on one image. Released on drop.
#[derive(Debug)]
pub struct ImageLock {
    _file: File,
    path: PathBuf,
}

impl ImageLock {
    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A pull in progress. Removed on drop unless committed.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    committed: bool,
}

impl StagingDir {
    /// Directory layers are extracted into.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                "Failed to remove staging directory {}: {}",
                self.path.display(),
                e
            );
        }
    }
}
