//! Pinned btop release artifacts, one per supported os/arch pair.

use crate::error::{PluginError, Result};
use crate::platform::Platform;

/// Upstream btop release pinned for Linux builds.
pub const BTOP_VERSION: &str = "1.3.2";

/// Upstream btop4win release pinned for Windows builds.
pub const BTOP4WIN_VERSION: &str = "1.0.4";

/// Bump whenever a catalog URL changes so existing installs are discarded.
pub const CACHE_BUST_TOKEN: &str = "btop-1.3.2+btop4win-1.0.4/1";

/// Archive format of a release artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    Zip,
    TarBzip2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    pub download_url: &'static str,
    /// Executable location relative to the extracted tree.
    pub executable_path: &'static str,
    pub extractor: ExtractorKind,
}

const fn linux(download_url: &'static str) -> ReleaseDescriptor {
    ReleaseDescriptor {
        download_url,
        executable_path: "btop/bin/btop",
        extractor: ExtractorKind::TarBzip2,
    }
}

const fn windows(download_url: &'static str) -> ReleaseDescriptor {
    ReleaseDescriptor {
        download_url,
        executable_path: "btop4win/btop4win.exe",
        extractor: ExtractorKind::Zip,
    }
}

const CATALOG: &[(&str, &str, ReleaseDescriptor)] = &[
    (
        "linux",
        "x86_64",
        linux("https://github.com/aristocratos/btop/releases/download/v1.3.2/btop-x86_64-linux-musl.tbz"),
    ),
    (
        "linux",
        "aarch64",
        linux("https://github.com/aristocratos/btop/releases/download/v1.3.2/btop-aarch64-linux-musl.tbz"),
    ),
    (
        "linux",
        "armv7l",
        linux("https://github.com/aristocratos/btop/releases/download/v1.3.2/btop-armv7l-linux-musleabihf.tbz"),
    ),
    (
        "linux",
        "i686",
        linux("https://github.com/aristocratos/btop/releases/download/v1.3.2/btop-i686-linux-musl.tbz"),
    ),
    (
        "windows",
        "x86_64",
        windows("https://github.com/aristocratos/btop4win/releases/download/v1.0.4/btop4win-x64.zip"),
    ),
];

/// Find the release artifact for `platform`.
pub fn lookup(platform: &Platform) -> Result<ReleaseDescriptor> {
    CATALOG
        .iter()
        .find(|(os, arch, _)| *os == platform.os && *arch == platform.arch)
        .map(|(_, _, descriptor)| *descriptor)
        .ok_or_else(|| PluginError::UnsupportedPlatform {
            os: platform.os.clone(),
            arch: platform.arch.clone(),
        })
}

/// All catalog keys, for diagnostics.
pub fn supported_platforms() -> impl Iterator<Item = Platform> {
    CATALOG.iter().map(|(os, arch, _)| Platform::new(os, arch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_x86_64_is_a_tarball() {
        let d = lookup(&Platform::new("linux", "x86_64")).unwrap();
        assert_eq!(d.extractor, ExtractorKind::TarBzip2);
        assert_eq!(d.executable_path, "btop/bin/btop");
        assert!(d.download_url.ends_with(".tbz"));
    }

    #[test]
    fn windows_amd64_resolves_through_normalization() {
        let d = lookup(&Platform::new("Windows", "AMD64")).unwrap();
        assert_eq!(d.extractor, ExtractorKind::Zip);
        assert!(d.executable_path.ends_with(".exe"));
    }

    #[test]
    fn unknown_platform_is_unsupported() {
        let err = lookup(&Platform::new("linux", "s390x")).unwrap_err();
        assert!(matches!(err, PluginError::UnsupportedPlatform { ref arch, .. } if arch == "s390x"));
    }

    #[test]
    fn catalog_keys_are_unique() {
        let mut keys: Vec<String> = supported_platforms().map(|p| p.key()).collect();
        let before = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(before, keys.len());
    }

    #[test]
    fn urls_are_pinned_to_the_declared_versions() {
        for platform in supported_platforms() {
            let d = lookup(&platform).unwrap();
            assert!(d.download_url.starts_with("https://github.com/aristocratos/"));
            let pinned = if platform.is_windows() { BTOP4WIN_VERSION } else { BTOP_VERSION };
            assert!(d.download_url.contains(&format!("/v{pinned}/")), "{}", d.download_url);
        }
    }
}
