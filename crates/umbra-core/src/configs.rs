//! # VPN Configs
//!
//! The imported config catalogue, subscription list and the per-profile
//! active config.
//!
//! Import is "smart": a pasted block may be a base64 subscription body, a
//! sing-box JSON document, a WireGuard INI file or a list of share links.
//! Entries are deduplicated by their trimmed raw text.

use crate::detect::{self, ConfigKind, CoreKind};
use crate::settings::Settings;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kinds counted in the protocol support summary.
pub const COUNTED_KINDS: [ConfigKind; 4] = [
    ConfigKind::Socks,
    ConfigKind::Http,
    ConfigKind::WireGuard,
    ConfigKind::Hysteria2,
];

/// An imported config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ConfigKind,
    pub core: CoreKind,
    pub raw: String,
    pub source: String,
    pub added_at: String,
    pub tags: Vec<String>,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: ConfigKind::Unknown,
            core: CoreKind::Auto,
            raw: String::new(),
            source: "manual".to_string(),
            added_at: String::new(),
            tags: Vec::new(),
        }
    }
}

impl VpnConfig {
    /// Build a config from raw text, detecting kind, core and name.
    #[must_use]
    pub fn from_raw(raw: &str, source: &str) -> Self {
        let raw = raw.trim();
        let kind = ConfigKind::detect(raw);
        Self {
            name: detect::auto_name(raw, kind),
            kind,
            core: kind.suggested_core(),
            raw: raw.to_string(),
            source: source.to_string(),
            added_at: crate::timestamp(),
            tags: Vec::new(),
        }
    }
}

/// Split import text into individual config items.
///
/// A base64 body without `://` is decoded first when the decoded text
/// contains share links.
#[must_use]
pub fn split_import(text: &str) -> Vec<String> {
    let mut raw = text.trim().to_string();
    if raw.is_empty() {
        return Vec::new();
    }

    if detect::looks_base64(&raw) && !raw.contains("://") {
        if let Some(decoded) = detect::decode_base64_lossy(&raw) {
            if decoded.contains("://") {
                raw = decoded.trim().to_string();
            }
        }
    }

    if (raw.starts_with('{') && raw.ends_with('}')) || detect::is_wireguard_ini(&raw) {
        return vec![raw];
    }
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

impl Settings {
    /// Add one config unless its raw text is blank or already present.
    pub fn add_config(&mut self, raw: &str, source: &str) -> bool {
        let raw = raw.trim();
        if raw.is_empty() || self.configs.iter().any(|c| c.raw.trim() == raw) {
            return false;
        }
        self.configs.push(VpnConfig::from_raw(raw, source));
        true
    }

    /// Import pasted or fetched text. Returns the number of configs added.
    pub fn import_smart_input(&mut self, text: &str, source: &str) -> usize {
        split_import(text)
            .iter()
            .filter(|item| self.add_config(item, source))
            .count()
    }

    /// Configs of one kind, with their catalogue indices. `None` shows all.
    #[must_use]
    pub fn configs_of_kind(&self, kind: Option<ConfigKind>) -> Vec<(usize, &VpnConfig)> {
        self.configs
            .iter()
            .enumerate()
            .filter(|(_, c)| kind.is_none_or(|k| c.kind == k))
            .collect()
    }

    /// Counts for the protocol support summary.
    #[must_use]
    pub fn protocol_counts(&self) -> BTreeMap<ConfigKind, usize> {
        let mut counts: BTreeMap<ConfigKind, usize> =
            COUNTED_KINDS.iter().map(|k| (*k, 0)).collect();
        for config in &self.configs {
            if let Some(n) = counts.get_mut(&config.kind) {
                *n += 1;
            }
        }
        counts
    }

    /// Raw text of the config at `index`, for export.
    pub fn export_config(&self, index: usize) -> Result<&str> {
        self.configs
            .get(index)
            .map(|c| c.raw.as_str())
            .ok_or(CoreError::OutOfRange {
                what: "config",
                index,
                len: self.configs.len(),
            })
    }

    /// Add a subscription URL. Blank and duplicate URLs are ignored.
    pub fn add_subscription(&mut self, url: &str) -> bool {
        let url = url.trim();
        if url.is_empty() || self.subscriptions.iter().any(|u| u == url) {
            return false;
        }
        self.subscriptions.push(url.to_string());
        true
    }

    /// Make the config at `index` the active one for the active profile.
    pub fn set_active_config(&mut self, index: usize) -> Result<()> {
        if index >= self.configs.len() {
            return Err(CoreError::OutOfRange {
                what: "config",
                index,
                len: self.configs.len(),
            });
        }
        self.profiles.active_entry_mut().active_config_idx = Some(index);
        Ok(())
    }

    /// The active profile's config, if set and still in range.
    #[must_use]
    pub fn active_config(&self) -> Option<&VpnConfig> {
        let index = self.profiles.active_entry()?.active_config_idx?;
        self.configs.get(index)
    }
}

// =============================================================================
// TESTS
// =============================================================================
