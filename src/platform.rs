//! Platform detection and capability enumeration.
//!
//! Detects the host OS and architecture (used to pick an entry out of a
//! multi-platform manifest list) and whether the kernel offers the
//! namespaces the engine isolates children with.

use std::collections::HashSet;
use std::path::Path;

/// Detected platform information.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
    /// Available capabilities.
    pub capabilities: HashSet<Capability>,
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
    Unknown,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    Unknown,
}

/// Kernel capabilities the isolation engine relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// PID namespaces (`/proc/self/ns/pid`).
    PidNamespace,
    /// Network namespaces (`/proc/self/ns/net`).
    NetNamespace,
}

impl Os {
    /// OCI `platform.os` string.
    pub fn as_oci_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Windows => "windows",
            Os::Unknown => "unknown",
        }
    }
}

impl Arch {
    /// OCI `platform.architecture` string.
    pub fn as_oci_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::Unknown => "unknown",
        }
    }
}

impl Platform {
    /// Detects the current platform and its capabilities.
    pub fn detect() -> Self {
        let os = Self::detect_os();
        Self {
            os,
            arch: Self::detect_arch(),
            capabilities: Self::detect_capabilities(os),
        }
    }

    /// Builds a platform without probing the host.
    ///
    /// Used to resolve images for another target and in tests.
    pub fn new(os: Os, arch: Arch) -> Self {
        Self {
            os,
            arch,
            capabilities: HashSet::new(),
        }
    }

    /// Detects the operating system.
    fn detect_os() -> Os {
        #[cfg(target_os = "linux")]
        return Os::Linux;

        #[cfg(target_os = "macos")]
        return Os::Darwin;

        #[cfg(target_os = "windows")]
        return Os::Windows;

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        return Os::Unknown;
    }

    /// Detects the CPU architecture.
    fn detect_arch() -> Arch {
        #[cfg(target_arch = "x86_64")]
        return Arch::Amd64;

        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(target_arch = "arm")]
        return Arch::Arm;

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
        return Arch::Unknown;
    }

    /// Detects available capabilities based on OS.
    fn detect_capabilities(os: Os) -> HashSet<Capability> {
        let mut caps = HashSet::new();

        if os == Os::Linux {
            if Path::new("/proc/self/ns/pid").exists() {
                caps.insert(Capability::PidNamespace);
            }
            if Path::new("/proc/self/ns/net").exists() {
                caps.insert(Capability::NetNamespace);
            }
        }

        caps
    }

    /// Returns true if children can be isolated in PID and network namespaces.
    pub fn supports_isolation(&self) -> bool {
        self.capabilities.contains(&Capability::PidNamespace)
            && self.capabilities.contains(&Capability::NetNamespace)
    }

    /// Returns true if a manifest list entry's platform matches this one.
    pub fn matches(&self, os: &str, architecture: &str) -> bool {
        os == self.os.as_oci_str() && architecture == self.arch.as_oci_str()
    }

    /// Returns the OCI platform string (e.g., "linux/amd64").
    pub fn oci_platform(&self) -> String {
        format!("{}/{}", self.os.as_oci_str(), self.arch.as_oci_str())
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (capabilities: {:?})", self.oci_platform(), self.capabilities)
    }
}
