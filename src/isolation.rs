//! # Process Isolation
//!
//! Confines the target command to a prepared root directory and fresh PID
//! and network namespaces.
//!
//! ## Sequence
//!
//! ```text
//! engine (parent)                               child
//! ───────────────                               ─────
//! open("/")            keep host root fd
//! chroot(<root>)   ─┐  always performed together,
//! chdir("/")       ─┘  never one without the other
//! spawner thread:
//!   unshare(NEWPID)    children of this thread get a new PID ns
//!   fork ────────────────────────────────────►  unshare(NEWNET)
//!                                               execve(<command>)
//!   wait  ◄──────────────────────────────────── exit / signal
//!   (thread exits, its PID ns reference goes with it)
//! fchdir(host fd) + chroot(".")  restore
//! ```
//!
//! `CLONE_NEWPID` only affects processes created *after* the call, so it
//! is unshared right before the fork, on a thread that exists only for
//! that fork and its wait; the command becomes PID 1 of its namespace and
//! every run gets a fresh one. The root is per process, so the spawner
//! thread sees the chroot made by [`IsolationContext::enter`]. The network
//! namespace is unshared in the child itself, leaving it with nothing but a
//! down loopback interface.
//!
//! ## Security
//!
//! The chroot and the namespaces are the whole isolation story: no user
//! namespace, no seccomp, no capability dropping, no cgroup limits. Both
//! operations need `CAP_SYS_CHROOT` / `CAP_SYS_ADMIN`, i.e. root.
//!
//! The [`RootGuard`] returned by [`IsolationContext::enter`] holds a
//! descriptor to the host root so the engine can leave the jail after the
//! child exits (to remove a sandbox root, for instance). It is never
//! inherited by the child (`O_CLOEXEC`).

use crate::constants::EXIT_SIGNAL_OFFSET;
use crate::error::{Error, Result};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use tracing::{debug, info, warn};

/// Namespaces the child is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespaces {
    /// New PID namespace; the command runs as PID 1.
    pub pid: bool,
    /// New network namespace; no interfaces besides loopback.
    pub net: bool,
}

impl Namespaces {
    /// PID and network namespaces.
    pub const ALL: Self = Self {
        pid: true,
        net: true,
    };

    /// No namespaces; chroot only.
    pub const NONE: Self = Self {
        pid: false,
        net: false,
    };
}

impl Default for Namespaces {
    fn default() -> Self {
        Self::ALL
    }
}

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
}

impl ExitOutcome {
    /// Maps a wait status.
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Signaled(signal),
            // neither exited nor signaled; only reachable for stopped children
            (None, None) => Self::Exited(1),
        }
    }

    /// Shell-style exit code: the child's status, or 128+N for signal N.
    pub fn code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(signal) => EXIT_SIGNAL_OFFSET + signal,
        }
    }
}

/// A root directory plus the namespaces to run a command in.
#[derive(Debug, Clone)]
pub struct IsolationContext {
    root: PathBuf,
    namespaces: Namespaces,
}

impl IsolationContext {
    /// Creates a context for `root`.
    pub fn new(root: impl Into<PathBuf>, namespaces: Namespaces) -> Self {
        Self {
            root: root.into(),
            namespaces,
        }
    }

    /// Root directory the command is confined to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Namespaces the command is placed in.
    pub fn namespaces(&self) -> Namespaces {
        self.namespaces
    }

    /// Changes the process root to [`root`](Self::root) and the working
    /// directory to its `/`.
    ///
    /// Affects the whole process. The previous root and working directory
    /// come back when the returned guard drops.
    pub fn enter(&self) -> Result<RootGuard> {
        let host_root = File::open("/").map_err(|source| Error::Isolation {
            operation: "open host root",
            source,
        })?;
        let host_cwd = File::open(".").ok();

        let root = CString::new(self.root.as_os_str().as_bytes()).map_err(|_| {
            Error::Isolation {
                operation: "chroot",
                source: io::Error::new(io::ErrorKind::InvalidInput, "root path contains NUL"),
            }
        })?;

        // SAFETY: `root` is a valid NUL-terminated path.
        if unsafe { libc::chroot(root.as_ptr()) } != 0 {
            return Err(Error::Isolation {
                operation: "chroot",
                source: io::Error::last_os_error(),
            });
        }

        let guard = RootGuard {
            host_root,
            host_cwd,
        };

        // The old cwd would still point outside the new root.
        std::env::set_current_dir("/").map_err(|source| Error::Isolation {
            operation: "chdir",
            source,
        })?;

        debug!(root = %self.root.display(), "Entered root");
        Ok(guard)
    }

    /// Runs `command` with inherited stdio and waits for it.
    ///
    /// Must be called after [`enter`](Self::enter); `command` is resolved
    /// against the current root. The fork and the wait happen on a
    /// short-lived thread: `unshare(CLONE_NEWPID)` is per thread and
    /// permanent, so it never touches the caller's thread.
    pub fn spawn(&self, command: &str, args: &[String]) -> Result<ExitOutcome> {
        let mut cmd = Command::new(command);
        cmd.args(args).current_dir("/");

        if self.namespaces.net {
            // SAFETY: unshare is async-signal-safe; the closure allocates nothing.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::unshare(libc::CLONE_NEWNET) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let new_pid_ns = self.namespaces.pid;
        std::thread::scope(|scope| {
            scope
                .spawn(move || spawn_and_wait(cmd, command, new_pid_ns))
                .join()
                .map_err(|_| Error::Internal(format!("spawner thread for {} panicked", command)))?
        })
    }
}

/// Forks `cmd` from the current thread and waits for it. With `new_pid_ns`
/// the thread's children land in a fresh PID namespace; the thread must
/// not fork anything else afterwards.
fn spawn_and_wait(mut cmd: Command, command: &str, new_pid_ns: bool) -> Result<ExitOutcome> {
    if new_pid_ns {
        // SAFETY: plain syscall; only changes the namespace of this thread's future children.
        if unsafe { libc::unshare(libc::CLONE_NEWPID) } != 0 {
            return Err(Error::Isolation {
                operation: "unshare(CLONE_NEWPID)",
                source: io::Error::last_os_error(),
            });
        }
    }

    let mut child = cmd.spawn().map_err(|source| Error::Execution {
        command: command.to_string(),
        source,
    })?;

    info!(command = %command, pid = child.id(), "Command started");

    // Terminal signals reach the whole foreground group; let the child
    // decide, and report whatever it does.
    let _signals = IgnoreInteractiveSignals::install();

    let status = child.wait().map_err(|source| Error::Execution {
        command: command.to_string(),
        source,
    })?;
    let outcome = ExitOutcome::from_status(status);

    debug!(command = %command, outcome = ?outcome, "Command finished");
    Ok(outcome)
}

/// Restores the host root and working directory on drop.
#[derive(Debug)]
pub struct RootGuard {
    host_root: File,
    host_cwd: Option<File>,
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        // SAFETY: descriptors are owned by self; "." is a valid C string.
        unsafe {
            if libc::fchdir(self.host_root.as_raw_fd()) != 0
                || libc::chroot(c".".as_ptr()) != 0
            {
                warn!(
                    "Failed to restore host root: {}",
                    io::Error::last_os_error()
                );
                return;
            }
            if let Some(cwd) = &self.host_cwd {
                libc::fchdir(cwd.as_raw_fd());
            }
        }
    }
}

/// Ignores SIGINT and SIGQUIT in the engine while the child runs.
struct IgnoreInteractiveSignals {
    previous: [(libc::c_int, libc::sighandler_t); 2],
}

impl IgnoreInteractiveSignals {
    fn install() -> Self {
        // SAFETY: SIG_IGN is a valid disposition for both signals.
        let previous = unsafe {
            [
                (libc::SIGINT, libc::signal(libc::SIGINT, libc::SIG_IGN)),
                (libc::SIGQUIT, libc::signal(libc::SIGQUIT, libc::SIG_IGN)),
            ]
        };
        Self { previous }
    }
}

impl Drop for IgnoreInteractiveSignals {
    fn drop(&mut self) {
        for (signal, handler) in self.previous {
            if handler != libc::SIG_ERR {
                // SAFETY: restoring the disposition returned by signal().
                unsafe { libc::signal(signal, handler) };
            }
        }
    }
}
