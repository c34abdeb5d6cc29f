//! # Core Releases
//!
//! GitHub release metadata and the asset-picking rules for the cores the
//! updater installs. Downloading and unpacking live in the app crate.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating system / architecture pair as named in release assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl Platform {
    /// Map Rust/`uname` names onto release names. Unknown values fall back
    /// to `windows` / `amd64`.
    #[must_use]
    pub fn from_names(os: &str, arch: &str) -> Self {
        let os = os.to_ascii_lowercase();
        let arch = arch.to_ascii_lowercase();
        let os = if os.starts_with("win") {
            "windows"
        } else if os.starts_with("linux") {
            "linux"
        } else if os.starts_with("darwin") || os.starts_with("macos") {
            "darwin"
        } else {
            "windows"
        };
        let arch = match arch.as_str() {
            "arm64" | "aarch64" => "arm64",
            _ => "amd64",
        };
        Self { os, arch }
    }

    /// The platform this binary was built for.
    #[must_use]
    pub fn current() -> Self {
        Self::from_names(std::env::consts::OS, std::env::consts::ARCH)
    }

    #[must_use]
    pub fn is_windows(self) -> bool {
        self.os == "windows"
    }

    /// `name` or `name.exe`.
    #[must_use]
    pub fn exe_name(self, name: &str) -> String {
        if self.is_windows() {
            format!("{name}.exe")
        } else {
            name.to_string()
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

/// One downloadable release file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// The subset of the GitHub "latest release" response Umbra reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    #[serde(default = "latest_tag")]
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

fn latest_tag() -> String {
    "latest".to_string()
}

/// Packaging of a release asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    /// A single gzip-compressed file.
    Gz,
    Executable,
    Other,
}

impl ArchiveKind {
    #[must_use]
    pub fn of(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            ArchiveKind::Zip
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if lower.ends_with(".gz") {
            ArchiveKind::Gz
        } else if lower.ends_with(".exe") {
            ArchiveKind::Executable
        } else {
            ArchiveKind::Other
        }
    }
}

/// A core the updater knows how to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreRelease {
    SingBox,
    Mihomo,
}

impl CoreRelease {
    /// Map a settings key (`singbox`, `clash`) to a release target.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "singbox" | "sing-box" => Some(CoreRelease::SingBox),
            "clash" | "mihomo" => Some(CoreRelease::Mihomo),
            _ => None,
        }
    }

    /// Key in `core_updates.repos`.
    #[must_use]
    pub fn settings_key(self) -> &'static str {
        match self {
            CoreRelease::SingBox => "singbox",
            CoreRelease::Mihomo => "clash",
        }
    }

    /// Directory under `cores/` and the binary's base name.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            CoreRelease::SingBox => "sing-box",
            CoreRelease::Mihomo => "mihomo",
        }
    }

    /// Asset name patterns, tried in order (case-insensitive).
    #[must_use]
    pub fn asset_patterns(self, platform: Platform) -> Vec<String> {
        let Platform { os, arch } = platform;
        match self {
            CoreRelease::SingBox => vec![
                format!(r"sing-box-.*-{os}-{arch}\.zip$"),
                format!(r"sing-box-.*-{os}-{arch}\.tar\.gz$"),
            ],
            CoreRelease::Mihomo => vec![
                format!(r"mihomo.*{os}.*{arch}.*\.zip$"),
                format!(r"mihomo.*{os}.*{arch}.*\.gz$"),
                format!(r"mihomo.*{os}.*{arch}.*\.exe$"),
            ],
        }
    }

    /// Whether an extracted file is this core's binary.
    #[must_use]
    pub fn is_binary(self, file_name: &str, platform: Platform) -> bool {
        let lower = file_name.to_ascii_lowercase();
        match self {
            CoreRelease::SingBox => lower == platform.exe_name("sing-box"),
            CoreRelease::Mihomo => {
                lower.starts_with("mihomo")
                    && (!platform.is_windows() || lower.ends_with(".exe"))
                    && !lower.ends_with(".zip")
                    && !lower.ends_with(".gz")
            }
        }
    }
}

impl fmt::Display for CoreRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// First asset whose name matches any pattern, in asset order.
#[must_use]
pub fn find_asset<'a>(release: &'a ReleaseInfo, patterns: &[String]) -> Option<&'a ReleaseAsset> {
    let regexes: Vec<_> = patterns
        .iter()
        .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
        .collect();
    release
        .assets
        .iter()
        .find(|a| regexes.iter().any(|re| re.is_match(&a.name)))
}

/// `https://api.github.com/repos/<repo>/releases/latest` for a given API base.
#[must_use]
pub fn latest_release_url(api_base: &str, repo: &str) -> String {
    format!(
        "{}/repos/{}/releases/latest",
        api_base.trim_end_matches('/'),
        repo.trim().trim_matches('/')
    )
}

// =============================================================================
// TESTS
// =============================================================================
