//! magikjail - minimal container runtime CLI
//!
//! ## Usage
//!
//! ```sh
//! magikjail run alpine:latest /bin/echo hi        # pull (if needed) and run
//! magikjail run --sandbox x /usr/local/bin/tool   # run a host binary alone in a temp root
//! magikjail pull ubuntu:22.04                     # populate the cache only
//! magikjail images                                # list cached images
//! magikjail rmi ubuntu:22.04                      # remove a cached image
//! ```
//!
//! ## Exit Status
//!
//! `run` exits with the command's own status (128+N if it was killed by
//! signal N). Any engine failure prints one `error: ...` line on stderr and
//! exits with 1. Logs go to stderr; stdout belongs to the command.

use clap::{Args, Parser, Subcommand};
use magikjail::{EXIT_ENGINE_FAILURE, Engine, ImageReference, RunMode, RunRequest, RuntimeConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "magikjail",
    version,
    about = "Run a command inside a registry image with chroot + namespaces"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Directory holding flattened image roots
    #[arg(long, global = true, env = "MAGIKJAIL_IMAGES_ROOT")]
    images_root: Option<PathBuf>,

    /// Registry base URL
    #[arg(long, global = true, env = "MAGIKJAIL_REGISTRY_URL")]
    registry_url: Option<String>,

    /// Token service URL
    #[arg(long, global = true, env = "MAGIKJAIL_AUTH_URL")]
    auth_url: Option<String>,

    /// `service` parameter sent to the token service
    #[arg(long, global = true, env = "MAGIKJAIL_AUTH_SERVICE")]
    auth_service: Option<String>,

    /// Namespace prepended to single-component image names
    #[arg(long, global = true, env = "MAGIKJAIL_NAMESPACE")]
    namespace: Option<String>,

    /// Timeout for a whole pull, in seconds
    #[arg(long, global = true, env = "MAGIKJAIL_PULL_TIMEOUT")]
    pull_timeout: Option<u64>,

    /// Layer downloads in flight at once
    #[arg(long, global = true, env = "MAGIKJAIL_DOWNLOAD_CONCURRENCY")]
    download_concurrency: Option<usize>,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a command inside an image
    Run(RunArgs),
    /// Pull an image into the cache without running anything
    Pull {
        /// Image reference (`name[:tag]`)
        image: String,
    },
    /// List cached images
    Images,
    /// Remove a cached image
    Rmi {
        /// Image reference (`name[:tag]`)
        image: String,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Copy the command into an empty temp root instead of using the image
    #[arg(long, env = "MAGIKJAIL_SANDBOX")]
    sandbox: bool,

    /// Image reference (`name[:tag]`)
    image: String,

    /// Command to execute (absolute path inside the image)
    command: String,

    /// Arguments passed to the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl GlobalArgs {
    fn to_config(&self, mode: RunMode) -> RuntimeConfig {
        let mut config = RuntimeConfig {
            mode,
            ..RuntimeConfig::default()
        };
        if let Some(root) = &self.images_root {
            config.images_root = root.clone();
        }
        if let Some(url) = &self.registry_url {
            config.registry_url = url.clone();
        }
        if let Some(url) = &self.auth_url {
            config.auth_url = url.clone();
        }
        if let Some(service) = &self.auth_service {
            config.auth_service = service.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(secs) = self.pull_timeout {
            config.pull_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = self.download_concurrency {
            config.download_concurrency = n;
        }
        config
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_run(global: &GlobalArgs, args: RunArgs) -> magikjail::Result<ExitCode> {
    let mode = if args.sandbox {
        RunMode::Sandbox
    } else {
        RunMode::Image
    };
    let engine = Engine::new(global.to_config(mode))?;
    let request = RunRequest::new(args.image, args.command, args.args);

    let code = engine.run(&request).await?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(EXIT_ENGINE_FAILURE)))
}

async fn cmd_pull(global: &GlobalArgs, image: &str) -> magikjail::Result<ExitCode> {
    let engine = Engine::new(global.to_config(RunMode::Image))?;
    let reference = ImageReference::parse(image)?;
    let path = engine.pull(&reference).await?;
    println!("{}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_images(global: &GlobalArgs) -> magikjail::Result<ExitCode> {
    let engine = Engine::new(global.to_config(RunMode::Image))?;
    for image in engine.store().list()? {
        println!("{}", image);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_rmi(global: &GlobalArgs, image: &str) -> magikjail::Result<ExitCode> {
    let engine = Engine::new(global.to_config(RunMode::Image))?;
    let reference = ImageReference::parse(image)?;
    if !engine.store().remove(&reference)? {
        eprintln!("error: image {} is not cached", reference);
        return Ok(ExitCode::from(EXIT_ENGINE_FAILURE));
    }
    println!("{}", reference);
    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// Main
// =============================================================================

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "magikjail=info",
        2 => "magikjail=debug",
        _ => "magikjail=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // a subscriber may already be installed
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // usage errors share the engine failure status instead of clap's 2
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_ENGINE_FAILURE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_tracing(cli.global.verbose);

    let result = match cli.command {
        Command::Run(args) => cmd_run(&cli.global, args).await,
        Command::Pull { image } => cmd_pull(&cli.global, &image).await,
        Command::Images => cmd_images(&cli.global),
        Command::Rmi { image } => cmd_rmi(&cli.global, &image),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(EXIT_ENGINE_FAILURE)
        }
    }
}
