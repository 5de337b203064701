//! Layer download and extraction.
//!
//! Layers are downloaded into a scratch file while their SHA-256 is
//! computed, verified against the descriptor digest, and then unpacked
//! entry-by-entry onto the destination root. The tar stream is never held in
//! memory as a whole.
//!
//! ## Entry Handling
//!
//! | Entry type          | Action                                              |
//! |---------------------|-----------------------------------------------------|
//! | Directory           | `mkdir -p`, then chmod to header mode               |
//! | Regular file        | replace, copy exactly `size` bytes, chmod           |
//! | Symlink / hard link | recreated (best effort, failures logged)            |
//! | `.wh.<name>`        | removes `<name>` left by an earlier layer           |
//! | `.wh..wh..opq`      | empties the directory                               |
//! | Anything else       | logged and skipped                                  |
//!
//! ## Path Safety
//!
//! Entry names are normalized (leading `/` and `./` dropped) and rejected if
//! they contain `..`. Parent directories are resolved *inside* the root:
//! a symlink `bin -> /usr/bin` left by an earlier layer leads to
//! `<root>/usr/bin`, never to the host's `/usr/bin`.
//!
//! ## Failure Classes
//!
//! - [`Error::CorruptArchive`]: bad gzip, bad tar header, truncated payload.
//!   Structural; retrying the same blob will fail again.
//! - [`Error::Extraction`]: the destination could not be written (disk full,
//!   permissions). A partially written file is removed before returning.
//!
//! [`Error::CorruptArchive`]: crate::error::Error::CorruptArchive
//! [`Error::Extraction`]: crate::error::Error::Extraction

use crate::constants::{
    DOCKER_LAYER_MEDIA_TYPE_GZIP, MAX_LAYER_SIZE, OCI_LAYER_MEDIA_TYPE_GZIP, OCI_LAYER_MEDIA_TYPE_TAR,
};
use crate::error::{Error, Result};
use crate::manifest::LayerDescriptor;
use crate::registry::{AuthToken, RegistryClient};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Symlinks followed while resolving one path inside the root.
const MAX_SYMLINK_HOPS: usize = 40;

/// Copy buffer for file payloads.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Counters from one layer extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub directories: u64,
    pub files: u64,
    pub links: u64,
    pub whiteouts: u64,
    pub skipped: u64,
    pub bytes: u64,
}

/// A verified layer blob waiting in a scratch file.
#[derive(Debug)]
pub struct DownloadedLayer {
    descriptor: LayerDescriptor,
    file: NamedTempFile,
}

impl DownloadedLayer {
    /// Descriptor this blob was downloaded for.
    pub fn descriptor(&self) -> &LayerDescriptor {
        &self.descriptor
    }

    /// Unpacks the blob onto `dest`. The scratch file is removed afterwards.
    pub fn extract_into(self, dest: &Path) -> Result<ExtractStats> {
        let reader = self.file.reopen()?;
        let stats = extract_layer(reader, dest)?;
        debug!(
            digest = %self.descriptor.digest,
            files = stats.files,
            dirs = stats.directories,
            skipped = stats.skipped,
            "Layer extracted"
        );
        Ok(stats)
    }
}

/// Downloads one layer blob into `scratch_dir`, verifying size and digest.
pub async fn download_layer(
    client: &RegistryClient,
    token: &AuthToken,
    image_name: &str,
    layer: &LayerDescriptor,
    scratch_dir: &Path,
) -> Result<DownloadedLayer> {
    if layer.size > MAX_LAYER_SIZE {
        return Err(Error::ImageTooLarge {
            what: "layer bytes",
            size: layer.size,
            limit: MAX_LAYER_SIZE,
        });
    }

    let accept = if layer.media_type.is_empty() {
        [
            DOCKER_LAYER_MEDIA_TYPE_GZIP,
            OCI_LAYER_MEDIA_TYPE_GZIP,
            OCI_LAYER_MEDIA_TYPE_TAR,
        ]
        .join(", ")
    } else {
        layer.media_type.clone()
    };
    let mut stream = client
        .get_blob(token, image_name, &layer.digest, &accept)
        .await?;

    if let Some(len) = stream.content_length()
        && len > MAX_LAYER_SIZE
    {
        return Err(Error::ImageTooLarge {
            what: "layer bytes",
            size: len,
            limit: MAX_LAYER_SIZE,
        });
    }

    let file = tempfile::Builder::new()
        .prefix("layer-")
        .tempfile_in(scratch_dir)?;
    let mut out = tokio::fs::File::from_std(file.as_file().try_clone()?);
    let mut hasher = Sha256::new();
    let mut received = 0u64;

    while let Some(chunk) = stream.next_chunk().await? {
        received += chunk.len() as u64;
        if received > MAX_LAYER_SIZE {
            return Err(Error::ImageTooLarge {
                what: "layer bytes",
                size: received,
                limit: MAX_LAYER_SIZE,
            });
        }
        hasher.update(&chunk);
        out.write_all(&chunk).await?;
    }
    out.flush().await?;

    if layer.size != 0 && received != layer.size {
        return Err(Error::CorruptArchive {
            reason: format!(
                "blob {} is {} bytes, manifest declares {}",
                layer.digest, received, layer.size
            ),
        });
    }
    verify_digest(&layer.digest, &hex::encode(hasher.finalize()))?;

    debug!(digest = %layer.digest, size = received, "Layer downloaded");

    Ok(DownloadedLayer {
        descriptor: layer.clone(),
        file,
    })
}

/// Downloads one layer and unpacks it onto `dest_dir`.
pub async fn fetch_and_extract(
    client: &RegistryClient,
    token: &AuthToken,
    image_name: &str,
    layer: &LayerDescriptor,
    dest_dir: &Path,
) -> Result<ExtractStats> {
    let downloaded =
        download_layer(client, token, image_name, layer, &std::env::temp_dir()).await?;
    let dest = dest_dir.to_path_buf();
    tokio::task::spawn_blocking(move || downloaded.extract_into(&dest))
        .await
        .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))?
}

fn verify_digest(digest: &str, computed_hex: &str) -> Result<()> {
    let (algo, expected) = digest.split_once(':').unwrap_or(("sha256", digest));
    if algo != "sha256" {
        return Err(Error::InvalidManifest {
            reason: format!("unsupported digest algorithm '{}'", algo),
        });
    }
    if !expected.eq_ignore_ascii_case(computed_hex) {
        return Err(Error::DigestMismatch {
            expected: digest.to_string(),
            actual: format!("sha256:{}", computed_hex),
        });
    }
    Ok(())
}

/// Unpacks a layer archive (gzip-compressed or plain tar) onto `dest`.
///
/// Entries are applied in stream order. Existing files at the same path are
/// replaced, so applying layers bottom-to-top yields the merged root.
pub fn extract_layer<R: Read>(reader: R, dest: &Path) -> Result<ExtractStats> {
    let mut reader = BufReader::new(reader);
    let head = reader.fill_buf().map_err(corrupt)?;

    if head.starts_with(GZIP_MAGIC) {
        unpack_tar(GzDecoder::new(reader), dest)
    } else if head.starts_with(ZSTD_MAGIC) {
        Err(Error::CorruptArchive {
            reason: "zstd-compressed layers are not supported".to_string(),
        })
    } else {
        unpack_tar(reader, dest)
    }
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<ExtractStats> {
    let mut stats = ExtractStats::default();
    let mut archive = Archive::new(reader);

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let raw_path = entry.path().map_err(corrupt)?.into_owned();
        let Some(rel) = normalize_entry_path(&raw_path)? else {
            continue;
        };

        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = resolve_in_root(dest, rel.parent().unwrap_or(Path::new("")))?;

        if file_name == WHITEOUT_OPAQUE {
            clear_directory(&parent)?;
            stats.whiteouts += 1;
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            // `.wh.`, `.wh..` and `.wh...` would name the parent or its parent
            if matches!(hidden, "" | "." | "..") {
                return Err(Error::PathTraversal {
                    path: raw_path.display().to_string(),
                });
            }
            remove_existing(&parent.join(hidden))?;
            stats.whiteouts += 1;
            continue;
        }

        let target = parent.join(&file_name);
        let header = entry.header();
        let entry_type = header.entry_type();
        let mode = header.mode().map_err(corrupt)? & 0o7777;

        match entry_type {
            EntryType::Directory => {
                write_directory(&target, mode)?;
                stats.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                let size = entry.size();
                write_file(&mut entry, size, &target, mode)?;
                stats.files += 1;
                stats.bytes += size;
            }
            EntryType::Symlink => {
                let link = entry.link_name().map_err(corrupt)?.map(|l| l.into_owned());
                match link {
                    Some(link) => match write_symlink(&link, &target) {
                        Ok(()) => stats.links += 1,
                        Err(e) => {
                            warn!(path = %rel.display(), "Skipping symlink: {}", e);
                            stats.skipped += 1;
                        }
                    },
                    None => {
                        warn!(path = %rel.display(), "Skipping symlink without target");
                        stats.skipped += 1;
                    }
                }
            }
            EntryType::Link => {
                let link = entry.link_name().map_err(corrupt)?.map(|l| l.into_owned());
                let source = match link.as_deref().map(normalize_entry_path) {
                    Some(Ok(Some(source))) => resolve_in_root(dest, &source)?,
                    _ => {
                        warn!(path = %rel.display(), "Skipping hard link with invalid target");
                        stats.skipped += 1;
                        continue;
                    }
                };
                match write_hard_link(&source, &target) {
                    Ok(()) => stats.links += 1,
                    Err(e) => {
                        warn!(path = %rel.display(), "Skipping hard link: {}", e);
                        stats.skipped += 1;
                    }
                }
            }
            other => {
                warn!(path = %rel.display(), "Skipping unsupported entry type {:?}", other);
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}

/// Strips root and `.` components; rejects `..`. `None` for the root itself.
fn normalize_entry_path(raw: &Path) -> Result<Option<PathBuf>> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal {
                    path: raw.display().to_string(),
                });
            }
        }
    }
    Ok(if out.as_os_str().is_empty() { None } else { Some(out) })
}

/// Resolves `rel` under `root`, following symlinks as if `root` were `/`.
///
/// The final path always lies inside `root`: absolute link targets restart
/// at `root` and `..` never climbs above it.
fn resolve_in_root(root: &Path, rel: &Path) -> Result<PathBuf> {
    let mut resolved: Vec<OsString> = Vec::new();
    let mut pending: VecDeque<OsString> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_os_string()),
            _ => None,
        })
        .collect();
    let mut hops = 0usize;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }

        let candidate: PathBuf = std::iter::once(root.as_os_str())
            .chain(resolved.iter().map(|p| p.as_os_str()))
            .chain(std::iter::once(part.as_os_str()))
            .collect();

        let is_symlink = fs::symlink_metadata(&candidate)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            resolved.push(part);
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(Error::CorruptArchive {
                reason: format!("too many symlinks resolving {}", rel.display()),
            });
        }

        let link = fs::read_link(&candidate).map_err(|source| Error::Extraction {
            path: candidate.clone(),
            source,
        })?;
        if link.is_absolute() {
            resolved.clear();
        }
        for component in link.components().rev() {
            match component {
                Component::Normal(p) => pending.push_front(p.to_os_string()),
                Component::ParentDir => pending.push_front(OsString::from("..")),
                _ => {}
            }
        }
    }

    Ok(resolved.iter().fold(root.to_path_buf(), |acc, p| acc.join(p)))
}

fn write_directory(target: &Path, mode: u32) -> Result<()> {
    let extraction = |source| Error::Extraction {
        path: target.to_path_buf(),
        source,
    };

    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => fs::remove_file(target).map_err(extraction)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(extraction(e)),
    }

    fs::create_dir_all(target).map_err(extraction)?;
    fs::set_permissions(target, fs::Permissions::from_mode(mode)).map_err(extraction)
}

fn write_file<R: Read>(entry: &mut R, size: u64, target: &Path, mode: u32) -> Result<()> {
    let extraction = |source| Error::Extraction {
        path: target.to_path_buf(),
        source,
    };

    prepare_leaf(target)?;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(target)
        .map_err(extraction)?;

    let written = copy_payload(entry, &mut file, size, target)
        .and_then(|()| file.flush().map_err(extraction));
    drop(file);

    let result = written.and_then(|()| {
        fs::set_permissions(target, fs::Permissions::from_mode(mode)).map_err(extraction)
    });
    if result.is_err() {
        // a half-written file must not survive into a later retry
        let _ = fs::remove_file(target);
    }
    result
}

/// Copies exactly `size` bytes, separating archive read errors from
/// destination write errors.
fn copy_payload<R: Read>(entry: &mut R, out: &mut File, size: u64, target: &Path) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = match entry.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(corrupt(e)),
        };
        out.write_all(&buf[..n]).map_err(|source| Error::Extraction {
            path: target.to_path_buf(),
            source,
        })?;
        copied += n as u64;
    }

    if copied != size {
        return Err(Error::CorruptArchive {
            reason: format!(
                "truncated payload for {}: {} of {} bytes",
                target.display(),
                copied,
                size
            ),
        });
    }
    Ok(())
}

fn write_symlink(link: &Path, target: &Path) -> Result<()> {
    prepare_leaf(target)?;
    std::os::unix::fs::symlink(link, target).map_err(|source| Error::Extraction {
        path: target.to_path_buf(),
        source,
    })
}

fn write_hard_link(source: &Path, target: &Path) -> Result<()> {
    prepare_leaf(target)?;
    fs::hard_link(source, target).map_err(|e| Error::Extraction {
        path: target.to_path_buf(),
        source: e,
    })
}

/// Clears the way for a non-directory entry: parents exist, nothing but a
/// directory may remain at `target`.
fn prepare_leaf(target: &Path) -> Result<()> {
    let extraction = |source| Error::Extraction {
        path: target.to_path_buf(),
        source,
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(extraction)?;
    }
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => Err(extraction(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "a directory exists at this path",
        ))),
        Ok(_) => fs::remove_file(target).map_err(extraction),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(extraction(e)),
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|source| Error::Extraction {
        path: path.to_path_buf(),
        source,
    })
}

fn clear_directory(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(Error::Extraction {
                path: dir.to_path_buf(),
                source,
            });
        }
    };
    for entry in entries {
        let entry = entry.map_err(|source| Error::Extraction {
            path: dir.to_path_buf(),
            source,
        })?;
        remove_existing(&entry.path())?;
    }
    Ok(())
}

fn corrupt(e: io::Error) -> Error {
    Error::CorruptArchive {
        reason: e.to_string(),
    }
}
