//! # Execution Engine
//!
//! Orchestrates one run: produce an execution root, enter it, spawn the
//! command in fresh namespaces and report its exit code.
//!
//! ## Run Phases
//!
//! ```text
//! Init ──► RootPrepared ──► RootChanged ──► Executing ──► Terminated
//!   │            │               │              │
//!   └────────────┴───────────────┴──────────────┴──► error (terminal)
//! ```
//!
//! Phases advance strictly in order; [`RunPhase::advance`] refuses to skip
//! one. The root is complete before `RootChanged`: nothing is chrooted into
//! a half-extracted image.
//!
//! ## Pull
//!
//! ```text
//! is_pulled? ── yes ──► done (no registry traffic)
//!     │ no
//! flock(.locks/<key>) ── is_pulled? ── yes ──► done (someone else pulled)
//!     │ no
//! token ─► resolve_layers ─► stage
//!     │
//! download L1 ┐
//! download L2 ├─ up to `download_concurrency` in flight
//! download L3 ┘
//!     │
//! extract L1 ─► extract L2 ─► extract L3   (strictly in manifest order)
//!     │
//! rename(staging, <key>)
//! ```
//!
//! The whole pull is bounded by `pull_timeout` and aborted by Ctrl-C. In
//! both cases the staging directory is removed and the cache is left as it
//! was.

use crate::config::{RunMode, RuntimeConfig};
use crate::constants::SANDBOX_PREFIX;
use crate::error::{Error, Result};
use crate::isolation::{ExitOutcome, IsolationContext, Namespaces};
use crate::layer::download_layer;
use crate::manifest::resolve_layers;
use crate::platform::Platform;
use crate::reference::ImageReference;
use crate::registry::RegistryClient;
use crate::storage::ImageStore;
use futures_util::StreamExt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, info, warn};

// =============================================================================
// Run Phases
// =============================================================================

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Nothing done yet.
    Init,
    /// Execution root exists and is complete.
    RootPrepared,
    /// Process root and cwd point into the execution root.
    RootChanged,
    /// Command is running.
    Executing,
    /// Command has exited.
    Terminated,
}

impl RunPhase {
    /// The only phase allowed after this one.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Init => Some(Self::RootPrepared),
            Self::RootPrepared => Some(Self::RootChanged),
            Self::RootChanged => Some(Self::Executing),
            Self::Executing => Some(Self::Terminated),
            Self::Terminated => None,
        }
    }

    /// Moves to `next`, which must be the direct successor.
    pub fn advance(&mut self, next: Self) -> Result<()> {
        if self.successor() != Some(next) {
            return Err(Error::Internal(format!(
                "invalid phase transition {:?} -> {:?}",
                self, next
            )));
        }
        debug!(from = ?self, to = ?next, "Run phase");
        *self = next;
        Ok(())
    }
}

// =============================================================================
// Requests and Roots
// =============================================================================

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Image reference (`name[:tag]`). Unused in sandbox mode.
    pub image: String,
    /// Command path. Inside the image in image mode; on the host in
    /// sandbox mode.
    pub command: String,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
}

impl RunRequest {
    pub fn new(image: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            image: image.into(),
            command: command.into(),
            args,
        }
    }
}

/// Directory that becomes `/` for the command, plus the command's path
/// inside it.
#[derive(Debug)]
pub enum ExecutionRoot {
    /// Cached image root; persists after the run.
    Image { path: PathBuf, command: String },
    /// Throwaway root holding a single executable.
    Sandbox(SandboxRoot),
}

impl ExecutionRoot {
    /// Root directory on the host.
    pub fn path(&self) -> &Path {
        match self {
            Self::Image { path, .. } => path,
            Self::Sandbox(sandbox) => sandbox.path(),
        }
    }

    /// Absolute command path inside the root.
    pub fn command(&self) -> &str {
        match self {
            Self::Image { command, .. } => command,
            Self::Sandbox(sandbox) => sandbox.command(),
        }
    }
}

/// Temporary root containing only a copy of the target executable.
///
/// Removed on drop; a failed removal is logged.
#[derive(Debug)]
pub struct SandboxRoot {
    dir: Option<TempDir>,
    path: PathBuf,
    command: String,
}

impl SandboxRoot {
    /// Creates a root and copies `executable` to `/<basename>` with mode 0755.
    pub fn create(executable: &Path) -> Result<Self> {
        let exec_err = |source: io::Error| Error::Execution {
            command: executable.display().to_string(),
            source,
        };

        let name = executable
            .file_name()
            .ok_or_else(|| {
                exec_err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "executable path has no file name",
                ))
            })?
            .to_os_string();
        if !executable.is_file() {
            return Err(exec_err(io::Error::new(
                io::ErrorKind::NotFound,
                "executable not found on host",
            )));
        }

        let dir = tempfile::Builder::new()
            .prefix(SANDBOX_PREFIX)
            .tempdir()
            .map_err(|e| Error::Storage {
                path: std::env::temp_dir(),
                reason: format!("failed to create sandbox root: {}", e),
            })?;

        let target = dir.path().join(&name);
        fs::copy(executable, &target).map_err(|source| Error::Extraction {
            path: target.clone(),
            source,
        })?;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).map_err(|source| {
            Error::Extraction {
                path: target.clone(),
                source,
            }
        })?;

        let path = dir.path().to_path_buf();
        debug!(root = %path.display(), "Sandbox root created");

        Ok(Self {
            dir: Some(dir),
            path,
            command: format!("/{}", name.to_string_lossy()),
        })
    }

    /// Root directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// In-root path of the copied executable.
    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Drop for SandboxRoot {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take()
            && let Err(e) = dir.close()
        {
            warn!("Failed to remove sandbox root {}: {}", self.path.display(), e);
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Pulls images and runs commands inside them.
pub struct Engine {
    config: RuntimeConfig,
    client: RegistryClient,
    store: ImageStore,
    platform: Platform,
}

impl Engine {
    /// Creates an engine for the host platform.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let client = RegistryClient::new(&config)?;
        let store = ImageStore::with_path(config.images_root.clone())?;
        let platform = Platform::detect();

        info!(platform = %platform.oci_platform(), mode = %config.mode, "Engine initialized");

        Ok(Self {
            config,
            client,
            store,
            platform,
        })
    }

    /// Resolves images for `platform`'s OS and architecture instead of the
    /// host's. Namespace capabilities stay those of the host.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform.os = platform.os;
        self.platform.arch = platform.arch;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Ensures `reference` is in the image store and returns its root.
    ///
    /// A cached image returns immediately without contacting the registry.
    pub async fn pull(&self, reference: &ImageReference) -> Result<PathBuf> {
        if self.store.is_pulled(reference) {
            debug!(image = %reference, "Image already pulled");
            return Ok(self.store.image_dir(reference));
        }

        let store = self.store.clone();
        let locked = reference.clone();
        let _lock = tokio::task::spawn_blocking(move || store.lock(&locked))
            .await
            .map_err(|e| Error::Internal(format!("lock task failed: {}", e)))??;

        if self.store.is_pulled(reference) {
            debug!(image = %reference, "Image pulled by another process");
            return Ok(self.store.image_dir(reference));
        }

        let interrupted = async {
            // never resolve if the handler could not be installed
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        let timeout = self.config.pull_timeout;
        tokio::select! {
            result = tokio::time::timeout(timeout, self.pull_uncached(reference)) => {
                result.map_err(|_| Error::Timeout {
                    operation: format!("pull {}", reference),
                    duration: timeout,
                })?
            }
            () = interrupted => Err(Error::Cancelled(format!("pull of {}", reference))),
        }
    }

    async fn pull_uncached(&self, reference: &ImageReference) -> Result<PathBuf> {
        let started = Instant::now();
        info!(image = %reference, "Pulling image");

        let name = reference.name();
        let token = self.client.get_token(name).await?;
        let layers =
            resolve_layers(&self.client, &token, name, reference.tag(), &self.platform).await?;

        let staging = self.store.stage(reference)?;
        let scratch = self.store.scratch_dir();

        let mut downloads = futures_util::stream::iter(
            layers
                .iter()
                .map(|layer| download_layer(&self.client, &token, name, layer, &scratch)),
        )
        .buffered(self.config.download_concurrency);

        let mut index = 0usize;
        while let Some(downloaded) = downloads.next().await {
            let downloaded = downloaded?;
            index += 1;
            debug!(
                image = %reference,
                layer = index,
                total = layers.len(),
                digest = %downloaded.descriptor().digest,
                "Extracting layer"
            );

            let dest = staging.path().to_path_buf();
            tokio::task::spawn_blocking(move || downloaded.extract_into(&dest))
                .await
                .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))??;
        }

        let path = self.store.commit(staging, reference)?;
        info!(
            image = %reference,
            layers = layers.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image pulled"
        );
        Ok(path)
    }

    /// Produces the execution root for `request` according to the run mode.
    pub async fn prepare_root(&self, request: &RunRequest) -> Result<ExecutionRoot> {
        match self.config.mode {
            RunMode::Sandbox => {
                Ok(ExecutionRoot::Sandbox(SandboxRoot::create(Path::new(&request.command))?))
            }
            RunMode::Image => {
                let reference = ImageReference::parse(&request.image)?;
                let path = self.pull(&reference).await?;
                let command = if request.command.starts_with('/') {
                    request.command.clone()
                } else {
                    format!("/{}", request.command)
                };
                Ok(ExecutionRoot::Image { path, command })
            }
        }
    }

    /// Runs `request` and returns the command's exit code.
    ///
    /// Engine failures are returned as errors; a command that runs and
    /// fails is not an error. The chroot and the wait run on the blocking
    /// pool, and a sandbox root is removed there once the host root is
    /// back.
    pub async fn run(&self, request: &RunRequest) -> Result<i32> {
        let mut phase = RunPhase::Init;

        let root = self.prepare_root(request).await?;
        phase.advance(RunPhase::RootPrepared)?;

        let platform = self.platform.clone();
        let args = request.args.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            execute_root(&platform, &root, &args, &mut phase)
        })
        .await
        .map_err(|e| Error::Internal(format!("execution task failed: {}", e)))??;

        Ok(outcome.code())
    }

    /// Enters `root` and runs its command, blocking until it exits.
    ///
    /// The host root is restored before returning, so `root` can be cleaned
    /// up afterwards.
    pub fn execute(
        &self,
        root: &ExecutionRoot,
        args: &[String],
        phase: &mut RunPhase,
    ) -> Result<ExitOutcome> {
        execute_root(&self.platform, root, args, phase)
    }
}

fn execute_root(
    platform: &Platform,
    root: &ExecutionRoot,
    args: &[String],
    phase: &mut RunPhase,
) -> Result<ExitOutcome> {
    if !platform.supports_isolation() {
        return Err(Error::Isolation {
            operation: "namespace probe",
            source: io::Error::new(
                io::ErrorKind::Unsupported,
                "PID and network namespaces are not available",
            ),
        });
    }

    let context = IsolationContext::new(root.path(), Namespaces::ALL);
    let guard = context.enter()?;
    phase.advance(RunPhase::RootChanged)?;

    phase.advance(RunPhase::Executing)?;
    let outcome = context.spawn(root.command(), args);
    drop(guard);

    let outcome = outcome?;
    phase.advance(RunPhase::Terminated)?;
    info!(command = %root.command(), code = outcome.code(), "Run finished");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_advance_in_order() {
        let mut phase = RunPhase::Init;
        phase.advance(RunPhase::RootPrepared).unwrap();
        phase.advance(RunPhase::RootChanged).unwrap();
        phase.advance(RunPhase::Executing).unwrap();
        phase.advance(RunPhase::Terminated).unwrap();
        assert_eq!(phase.successor(), None);
    }

    #[test]
    fn test_phase_skip_is_rejected() {
        let mut phase = RunPhase::Init;
        assert!(phase.advance(RunPhase::RootChanged).is_err());
        assert_eq!(phase, RunPhase::Init);
    }

    #[test]
    fn test_sandbox_root_copies_executable() {
        let host = tempfile::TempDir::new().unwrap();
        let exe = host.path().join("tool");
        fs::write(&exe, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o600)).unwrap();

        let sandbox = SandboxRoot::create(&exe).unwrap();
        let root = sandbox.path().to_path_buf();
        let copied = root.join("tool");
        assert_eq!(sandbox.command(), "/tool");
        assert_eq!(fs::read(&copied).unwrap(), b"#!/bin/sh\n");
        assert_eq!(fs::metadata(&copied).unwrap().permissions().mode() & 0o777, 0o755);
        assert_eq!(fs::read_dir(&root).unwrap().count(), 1);

        drop(sandbox);
        assert!(!root.exists());
    }

    #[test]
    fn test_sandbox_missing_executable() {
        let err = SandboxRoot::create(Path::new("/nonexistent/magikjail-tool")).unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
    }
}
