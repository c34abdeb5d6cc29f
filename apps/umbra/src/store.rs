//! # Settings Store
//!
//! File-backed persistence for [`Settings`] plus the on-disk layout of an
//! Umbra home directory:
//!
//! ```text
//! <home>/configs/settings.json        settings document
//! <home>/configs/active_singbox.json  config handed to sing-box
//! <home>/cores/<core>/                installed core binaries
//! <home>/cores/_backups/<core>/<ts>/  binaries replaced by the updater
//! <home>/logs/umbra.log               log file
//! ```
//!
//! Saves are atomic: the document is written to `<path>.tmp` and renamed
//! over the target.

use crate::error::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use umbra_core::Settings;
use umbra_core::settings::DEFAULT_SETTINGS_PATH;

/// Directory layout rooted at the Umbra home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub home: PathBuf,
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new(".")
    }
}

impl AppPaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.home.join(DEFAULT_SETTINGS_PATH)
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.home.join("configs")
    }

    pub fn cores_dir(&self) -> PathBuf {
        self.home.join("cores")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    /// Where the installed binary of a core lives.
    pub fn core_dir(&self, core: &str) -> PathBuf {
        self.cores_dir().join(core)
    }

    pub fn active_singbox_config(&self) -> PathBuf {
        self.configs_dir().join("active_singbox.json")
    }
}

/// Loads and saves the settings document.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Load the document, filling missing keys from the defaults.
    ///
    /// A missing file is created with defaults. A file that is not valid
    /// JSON is moved to `<path>.bak` and replaced by defaults. Valid JSON
    /// with values of the wrong type is copied to `<path>.bak` and only
    /// those values are reset. A valid file is rewritten only when the
    /// defaults-merge added something.
    pub fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "settings file missing, writing defaults");
            let mut settings = Settings::default();
            self.save(&mut settings)?;
            return Ok(settings);
        }

        let text = std::fs::read_to_string(&self.path)?;
        let original = match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(e) => return self.reset(&e.to_string()),
        };

        match Settings::from_value(original.clone()) {
            Ok(mut settings) => {
                if settings.to_value()? != original {
                    self.save(&mut settings)?;
                }
                Ok(settings)
            }
            Err(e) => {
                let (mut settings, repaired) = Settings::from_value_repaired(original)?;
                let backup = self.backup_path();
                warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %e,
                    repaired = %repaired.join(", "),
                    "settings had values of the wrong type, reset them to defaults"
                );
                std::fs::copy(&self.path, &backup)?;
                self.save(&mut settings)?;
                Ok(settings)
            }
        }
    }

    /// Move an unreadable file aside and start over from defaults.
    fn reset(&self, reason: &str) -> Result<Settings> {
        let backup = self.backup_path();
        warn!(
            path = %self.path.display(),
            backup = %backup.display(),
            reason,
            "settings file unreadable, resetting to defaults"
        );
        std::fs::rename(&self.path, &backup)?;
        let mut settings = Settings::default();
        self.save(&mut settings)?;
        Ok(settings)
    }

    /// Refresh `meta.updated_at` and write the document atomically.
    pub fn save(&self, settings: &mut Settings) -> Result<()> {
        settings.touch();
        let body = serde_json::to_string_pretty(&settings.to_value()?)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path();
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load, mutate, save. Returns whatever the closure returns.
    pub fn update<R>(&self, f: impl FnOnce(&mut Settings) -> R) -> Result<R> {
        let mut settings = self.load()?;
        let out = f(&mut settings);
        self.save(&mut settings)?;
        Ok(out)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_in(dir: &tempfile::TempDir) -> SettingsStore {
        SettingsStore::new(AppPaths::new(dir.path()).settings_file())
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let settings = store.load().unwrap();
        assert_eq!(settings.meta.app, "Umbra");
        assert!(store.path().exists());
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn corrupt_file_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{ not json").unwrap();

        let settings = store.load().unwrap();
        assert_eq!(settings.profiles.active, "Gaming");
        let backup = std::fs::read_to_string(store.backup_path()).unwrap();
        assert_eq!(backup, "{ not json");
        let reloaded: Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(reloaded["meta"]["app"], json!("Umbra"));
    }

    #[test]
    fn partial_file_is_completed_and_unknown_keys_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"ui": {"refresh_interval_s": 5}, "plugin_state": [1, 2]}"#,
        )
        .unwrap();

        let settings = store.load().unwrap();
        assert_eq!(settings.ui.refresh_interval_s, 5);
        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk["plugin_state"], json!([1, 2]));
        assert_eq!(on_disk["ui"]["tray_enabled"], json!(true));
    }

    #[test]
    fn mistyped_field_keeps_the_rest_of_the_document() {
        for interval in [json!("60"), json!(60.0)] {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(&dir);
            std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
            let doc = json!({
                "subscriptions": ["https://sub.example/a"],
                "ui": {"refresh_interval_s": interval}
            });
            let text = doc.to_string();
            std::fs::write(store.path(), &text).unwrap();

            let settings = store.load().unwrap();
            assert_eq!(settings.subscriptions, vec!["https://sub.example/a".to_string()]);
            assert_eq!(settings.ui.refresh_interval_s, 60);
            assert_eq!(std::fs::read_to_string(store.backup_path()).unwrap(), text);

            let on_disk: Value =
                serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
            assert_eq!(on_disk["ui"]["refresh_interval_s"], json!(60));
            assert_eq!(on_disk["subscriptions"], json!(["https://sub.example/a"]));

            // The repaired file loads cleanly
            assert_eq!(store.load().unwrap().subscriptions.len(), 1);
        }
    }

    #[test]
    fn update_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let added = store
            .update(|s| s.add_subscription("https://sub.example/list"))
            .unwrap();
        assert!(added);
        assert_eq!(store.load().unwrap().subscriptions.len(), 1);
    }

    #[test]
    fn layout_paths() {
        let paths = AppPaths::new("/opt/umbra");
        assert_eq!(
            paths.settings_file(),
            PathBuf::from("/opt/umbra/configs/settings.json")
        );
        assert_eq!(
            paths.core_dir("sing-box"),
            PathBuf::from("/opt/umbra/cores/sing-box")
        );
    }
}
