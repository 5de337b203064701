//! # magikjail
//!
//! **Minimal chroot + namespace container runtime**
//!
//! Given an image reference and a command, `magikjail` pulls the image from
//! an OCI distribution registry, flattens its layers into a private root
//! directory, and runs the command inside that root with its own PID and
//! network namespaces. Standard I/O is passed straight through and the
//! child's exit code becomes the process exit code.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              magikjail                              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                    Engine (runtime.rs)                      │    │
//! │  │  Init → RootPrepared → RootChanged → Executing → Terminated │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │            │                                      │                 │
//! │  ┌─────────▼────────────────────┐     ┌───────────▼─────────────┐   │
//! │  │        Image Pull            │     │   Isolation             │   │
//! │  │  token → manifest → layers   │     │   chroot + chdir("/")   │   │
//! │  │  registry.rs / manifest.rs   │     │   CLONE_NEWPID/NEWNET   │   │
//! │  └─────────┬────────────────────┘     └─────────────────────────┘   │
//! │            │                                                        │
//! │  ┌─────────▼────────────────────┐     ┌─────────────────────────┐   │
//! │  │     Layer Assembler          │────►│      Image Store        │   │
//! │  │  gzip/tar → rootfs, in order │     │  staging → atomic commit│   │
//! │  └──────────────────────────────┘     └─────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Run Modes
//!
//! | Mode    | Root directory                          | Lifetime          |
//! |---------|-----------------------------------------|-------------------|
//! | Image   | `<images-root>/<name>:<tag>` (cached)   | Persistent        |
//! | Sandbox | Temp dir holding only the executable    | Removed on exit   |
//!
//! # Key Properties
//!
//! - **Ordered layers**: downloads may overlap, extraction never does. Later
//!   layers overwrite earlier ones at the same path.
//! - **Complete roots only**: layers are extracted into a staging directory
//!   and renamed into the cache once every layer succeeded.
//! - **Fail closed**: a failed `chroot` aborts the run before anything is
//!   executed.
//! - **Bounded network**: every registry request has a timeout and the whole
//!   pull is bounded by [`RuntimeConfig::pull_timeout`].
//!
//! # Example
//!
//! ```rust,ignore
//! use magikjail::{Engine, RunRequest, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> magikjail::Result<()> {
//!     let engine = Engine::new(RuntimeConfig::default())?;
//!     let request = RunRequest::new("alpine:latest", "/bin/echo", vec!["hi".into()]);
//!     let code = engine.run(&request).await?;
//!     std::process::exit(code);
//! }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod isolation;
pub mod layer;
pub mod manifest;
pub mod platform;
pub mod reference;
pub mod registry;
pub mod runtime;
pub mod storage;

// Re-exports
pub use config::{RunMode, RuntimeConfig};
pub use constants::*;
pub use error::{Error, Result};
pub use isolation::{ExitOutcome, IsolationContext, Namespaces, RootGuard};
pub use layer::{DownloadedLayer, ExtractStats, download_layer, extract_layer, fetch_and_extract};
pub use manifest::{LayerDescriptor, Manifest, ManifestDescriptor, resolve_layers};
pub use platform::{Arch, Capability, Os, Platform};
pub use reference::ImageReference;
pub use registry::{AuthToken, BlobStream, ManifestKind, RegistryClient};
pub use runtime::{Engine, ExecutionRoot, RunPhase, RunRequest, SandboxRoot};
pub use storage::{ImageLock, ImageStore, StagingDir};
