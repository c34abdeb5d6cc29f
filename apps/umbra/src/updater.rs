//! # Core Updater
//!
//! Installs the latest sing-box / mihomo release from GitHub:
//!
//! 1. look up the latest release of the configured repository
//! 2. pick the asset for this platform
//! 3. stream it to `cores/_tmp/<core>/`
//! 4. unpack and locate the binary
//! 5. back up the installed binary to `cores/_backups/<core>/<ts>/`
//! 6. install, restoring the backup if that fails
//!
//! `cores/_tmp` is removed whatever the outcome.

use crate::error::{Result, UmbraError};
use crate::store::AppPaths;
use flate2::read::GzDecoder;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use umbra_core::release::{
    self, ArchiveKind, CoreRelease, Platform, ReleaseAsset, ReleaseInfo,
};
use umbra_core::settings::CoreUpdates;

/// Default GitHub API base.
pub const GITHUB_API: &str = "https://api.github.com";

const USER_AGENT: &str = "Umbra-Updater";
const ACCEPT: &str = "application/vnd.github+json";

/// Result of a successful update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub core: CoreRelease,
    pub tag: String,
    pub asset: String,
    pub binary: PathBuf,
    pub backup: Option<PathBuf>,
}

/// Release lookup and installation for one Umbra home.
#[derive(Debug, Clone)]
pub struct Updater {
    client: reqwest::Client,
    api_base: String,
    paths: AppPaths,
    platform: Platform,
}

impl Updater {
    pub fn new(client: reqwest::Client, paths: AppPaths) -> Self {
        Self {
            client,
            api_base: GITHUB_API.to_string(),
            paths,
            platform: Platform::current(),
        }
    }

    #[must_use]
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.to_string();
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    fn tmp_dir(&self) -> PathBuf {
        self.paths.cores_dir().join("_tmp")
    }

    /// Installed binary location for a core.
    pub fn binary_path(&self, core: CoreRelease) -> PathBuf {
        self.paths
            .core_dir(core.dir_name())
            .join(self.platform.exe_name(core.dir_name()))
    }

    /// Latest release metadata for a repository.
    pub async fn latest_release(&self, repo: &str) -> Result<ReleaseInfo> {
        let url = release::latest_release_url(&self.api_base, repo);
        let info = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?
            .error_for_status()?
            .json::<ReleaseInfo>()
            .await?;
        Ok(info)
    }

    /// Update one core to its latest release.
    pub async fn update(&self, core: CoreRelease, updates: &CoreUpdates) -> Result<UpdateOutcome> {
        let repo = updates.repo(core.settings_key());
        info!(core = %core, repo, platform = %self.platform, "checking for core update");

        let result = self.update_from(core, &repo).await;
        let tmp = self.tmp_dir();
        if tmp.exists() {
            if let Err(e) = std::fs::remove_dir_all(&tmp) {
                warn!(path = %tmp.display(), error = %e, "could not clean temporary files");
            }
        }
        match &result {
            Ok(outcome) => info!(core = %core, tag = %outcome.tag, "core updated"),
            Err(e) => warn!(core = %core, error = %e, "core update failed"),
        }
        result
    }

    async fn update_from(&self, core: CoreRelease, repo: &str) -> Result<UpdateOutcome> {
        let release = self.latest_release(repo).await?;
        let asset = release::find_asset(&release, &core.asset_patterns(self.platform))
            .ok_or_else(|| {
                UmbraError::Update(format!(
                    "no {core} asset for {} in {}",
                    self.platform, release.tag_name
                ))
            })?;

        let kind = ArchiveKind::of(&asset.name);
        if kind == ArchiveKind::Other {
            return Err(UmbraError::Update(format!(
                "unsupported archive format: {}",
                asset.name
            )));
        }

        let work = self.tmp_dir().join(core.dir_name());
        if work.exists() {
            std::fs::remove_dir_all(&work)?;
        }
        std::fs::create_dir_all(&work)?;
        let download = self.download(asset, &work).await?;

        let new_binary = if kind == ArchiveKind::Executable {
            download
        } else {
            let extract_dir = work.join("extract");
            let archive = download.clone();
            let target = extract_dir.clone();
            tokio::task::spawn_blocking(move || unpack(kind, &archive, &target))
                .await
                .map_err(|e| UmbraError::Update(format!("extraction task failed: {e}")))??;
            find_binary(&extract_dir, core, self.platform)?.ok_or_else(|| {
                UmbraError::Update(format!("{core} binary not found in {}", asset.name))
            })?
        };

        if std::fs::metadata(&new_binary)?.len() == 0 {
            return Err(UmbraError::Update("downloaded binary is empty".to_string()));
        }

        let (binary, backup) = self.install(core, &new_binary)?;
        Ok(UpdateOutcome {
            core,
            tag: release.tag_name.clone(),
            asset: asset.name.clone(),
            binary,
            backup,
        })
    }

    async fn download(&self, asset: &ReleaseAsset, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(&asset.name);
        let response = self
            .client
            .get(&asset.browser_download_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(&path).await?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        info!(asset = %asset.name, bytes = written, "asset downloaded");
        Ok(path)
    }

    /// Back up the current binary and move the new one into place.
    fn install(&self, core: CoreRelease, new_binary: &Path) -> Result<(PathBuf, Option<PathBuf>)> {
        let target = self.binary_path(core);
        let target_dir = self.paths.core_dir(core.dir_name());
        std::fs::create_dir_all(&target_dir)?;

        let backup = if target.is_file() {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
            let dir = self
                .paths
                .cores_dir()
                .join("_backups")
                .join(core.dir_name())
                .join(stamp);
            std::fs::create_dir_all(&dir)?;
            let copy = dir.join(self.platform.exe_name(core.dir_name()));
            std::fs::copy(&target, &copy)?;
            Some(copy)
        } else {
            None
        };

        if let Err(e) = std::fs::copy(new_binary, &target).and_then(|_| make_executable(&target)) {
            if let Some(saved) = &backup {
                if let Err(restore) = std::fs::copy(saved, &target) {
                    warn!(error = %restore, "could not restore previous binary");
                }
            }
            return Err(UmbraError::Update(format!("install failed: {e}")));
        }
        Ok((target, backup))
    }
}

/// Unpack a downloaded asset into `into`. A bare `.gz` becomes one file
/// named after the asset without its extension.
fn unpack(kind: ArchiveKind, archive: &Path, into: &Path) -> Result<()> {
    std::fs::create_dir_all(into)?;
    let file = std::fs::File::open(archive)?;
    match kind {
        ArchiveKind::Zip => zip::ZipArchive::new(file)?.extract(into)?,
        ArchiveKind::TarGz => tar::Archive::new(GzDecoder::new(file)).unpack(into)?,
        ArchiveKind::Gz => {
            let name = archive
                .file_stem()
                .ok_or_else(|| UmbraError::Update(format!("bad asset path {}", archive.display())))?;
            let mut out = std::fs::File::create(into.join(name))?;
            std::io::copy(&mut GzDecoder::new(file), &mut out)?;
        }
        ArchiveKind::Executable | ArchiveKind::Other => {
            return Err(UmbraError::Update(format!(
                "not an archive: {}",
                archive.display()
            )));
        }
    }
    Ok(())
}

/// First file under `dir` (depth-first) that is the core's binary.
fn find_binary(dir: &Path, core: CoreRelease, platform: Platform) -> Result<Option<PathBuf>> {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries: Vec<_> = std::fs::read_dir(&current)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if core.is_binary(&entry.file_name().to_string_lossy(), platform) {
                return Ok(Some(path));
            }
        }
    }
    Ok(None)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn finds_nested_binary() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sing-box-1.10.0-linux-amd64");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("LICENSE"), "x").unwrap();
        std::fs::write(nested.join("sing-box"), "bin").unwrap();

        let linux = Platform::from_names("linux", "amd64");
        let found = find_binary(dir.path(), CoreRelease::SingBox, linux).unwrap();
        assert_eq!(found, Some(nested.join("sing-box")));
        let windows = Platform::from_names("windows", "amd64");
        assert!(find_binary(dir.path(), CoreRelease::SingBox, windows).unwrap().is_none());
    }

    #[test]
    fn unpacks_single_gz_file() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("mihomo-linux-amd64-v1.18.0.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"mihomo-bin").unwrap();
        std::fs::write(&archive, encoder.finish().unwrap()).unwrap();

        let out = dir.path().join("extract");
        unpack(ArchiveKind::Gz, &archive, &out).unwrap();
        let linux = Platform::from_names("linux", "amd64");
        let found = find_binary(&out, CoreRelease::Mihomo, linux).unwrap().unwrap();
        assert_eq!(found, out.join("mihomo-linux-amd64-v1.18.0"));
        assert_eq!(std::fs::read(found).unwrap(), b"mihomo-bin");
    }

    #[test]
    fn unpack_rejects_non_archives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.exe");
        std::fs::write(&path, "x").unwrap();
        assert!(unpack(ArchiveKind::Executable, &path, &dir.path().join("out")).is_err());
    }

    #[test]
    fn install_backs_up_existing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path());
        let updater = Updater::new(reqwest::Client::new(), paths.clone())
            .with_platform(Platform::from_names("linux", "amd64"));

        let target = updater.binary_path(CoreRelease::SingBox);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, "old").unwrap();
        let fresh = dir.path().join("fresh");
        std::fs::write(&fresh, "new").unwrap();

        let (binary, backup) = updater.install(CoreRelease::SingBox, &fresh).unwrap();
        assert_eq!(std::fs::read_to_string(binary).unwrap(), "new");
        let backup = backup.unwrap();
        assert!(backup.starts_with(paths.cores_dir().join("_backups").join("sing-box")));
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "old");
    }
}
