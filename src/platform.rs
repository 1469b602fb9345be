//! Normalized os/arch identification used as the release catalog key.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    /// Build a platform from loosely formatted names (`"Linux"`, `"AMD64"`, `"macos"`, ...).
    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: normalize_os(os),
            arch: normalize_arch(arch),
        }
    }

    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    /// `<os>-<arch>`, used in marker and directory names.
    pub fn key(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

fn normalize_os(os: &str) -> String {
    let lower = os.trim().to_lowercase();
    match lower.as_str() {
        "macos" | "osx" | "mac" => "darwin".to_string(),
        "win32" | "win64" => "windows".to_string(),
        _ => lower,
    }
}

fn normalize_arch(arch: &str) -> String {
    let lower = arch.trim().to_lowercase();
    match lower.as_str() {
        "amd64" | "x64" => "x86_64".to_string(),
        "arm64" => "aarch64".to_string(),
        "arm" | "armv7" | "armhf" => "armv7l".to_string(),
        "x86" | "i386" | "i586" => "i686".to_string(),
        _ => lower,
    }
}
