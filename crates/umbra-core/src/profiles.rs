//! # Profiles
//!
//! Gaming, Streaming and Work are predefined and read-only. Custom is the
//! only profile the user edits; changes aimed at a predefined profile land
//! there instead.

use crate::settings::Settings;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The profile that receives edits of predefined profiles.
pub const CUSTOM_PROFILE: &str = "Custom";

/// Default active profile.
pub const DEFAULT_PROFILE: &str = "Gaming";

/// Profile names in display order.
pub const PROFILE_NAMES: [&str; 4] = ["Gaming", "Streaming", "Work", "Custom"];

/// Streaming platforms with a known bitrate cap.
pub const PLATFORMS: [&str; 4] = ["Kick", "Aparat", "Twitch", "YouTube"];

/// Share of upload bandwidth given to the stream, in percent.
pub const UPLOAD_HEADROOM_PERCENT: u64 = 70;

/// One profile entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub readonly: bool,
    pub dns_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_config_idx: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_dns: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            readonly: false,
            dns_mode: "AUTO".to_string(),
            platform: None,
            notes: String::new(),
            active_config_idx: None,
            suggested_dns: None,
            extra: BTreeMap::new(),
        }
    }
}

impl Profile {
    fn predefined(notes: &str, platform: Option<&str>) -> Self {
        Self {
            readonly: true,
            notes: notes.to_string(),
            platform: platform.map(str::to_string),
            ..Self::default()
        }
    }
}

/// `profiles`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileBook {
    pub active: String,
    pub items: BTreeMap<String, Profile>,
}

impl Default for ProfileBook {
    fn default() -> Self {
        let mut items = BTreeMap::new();
        items.insert(
            "Gaming".to_string(),
            Profile::predefined("Lower latency preference.", None),
        );
        items.insert(
            "Streaming".to_string(),
            Profile::predefined("Stability preference (loss/jitter-aware).", Some("Kick")),
        );
        items.insert("Work".to_string(), Profile::predefined("Balanced.", None));
        items.insert(
            CUSTOM_PROFILE.to_string(),
            Profile {
                notes: "User customized.".to_string(),
                ..Profile::default()
            },
        );
        Self {
            active: DEFAULT_PROFILE.to_string(),
            items,
        }
    }
}

/// Outcome of [`Settings::apply_profile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileChange {
    /// The active profile changed.
    Switched(String),
    /// The chosen profile was already active; nothing changed.
    Unchanged(String),
    /// Re-applying a predefined profile needs the user's confirmation.
    NeedsConfirmation(String),
    /// Confirmed edit of a predefined profile, written to Custom.
    RedirectedToCustom { from: String },
}

impl ProfileBook {
    #[must_use]
    pub fn is_readonly(&self, name: &str) -> bool {
        self.items.get(name).is_some_and(|p| p.readonly)
    }

    /// The active profile entry, if it exists in the book.
    #[must_use]
    pub fn active_entry(&self) -> Option<&Profile> {
        self.items.get(&self.active)
    }

    /// Mutable active entry, created if missing.
    pub fn active_entry_mut(&mut self) -> &mut Profile {
        self.items.entry(self.active.clone()).or_default()
    }
}

impl Settings {
    #[must_use]
    pub fn active_profile(&self) -> &str {
        &self.profiles.active
    }

    /// Set the active profile. Blank names are ignored.
    pub fn set_active_profile(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        self.profiles.active = name.to_string();
        true
    }

    /// Apply a profile picked by the user.
    ///
    /// Switching to a different profile always succeeds. Re-applying the
    /// predefined Streaming profile is an edit: without `confirmed` it
    /// returns [`ProfileChange::NeedsConfirmation`], with it the platform
    /// and DNS mode are copied into Custom, which becomes active.
    pub fn apply_profile(&mut self, chosen: &str, confirmed: bool) -> Result<ProfileChange> {
        let chosen = chosen.trim();
        if !self.profiles.items.contains_key(chosen) {
            return Err(CoreError::UnknownProfile(chosen.to_string()));
        }
        let readonly = self.profiles.is_readonly(chosen);

        if chosen != self.profiles.active {
            self.profiles.active = chosen.to_string();
            return Ok(ProfileChange::Switched(chosen.to_string()));
        }

        if readonly && chosen == "Streaming" {
            if !confirmed {
                return Ok(ProfileChange::NeedsConfirmation(chosen.to_string()));
            }
            let (platform, dns_mode) = self
                .profiles
                .items
                .get(chosen)
                .map(|p| (p.platform.clone(), p.dns_mode.clone()))
                .unwrap_or_default();
            let custom = self
                .profiles
                .items
                .entry(CUSTOM_PROFILE.to_string())
                .or_default();
            custom.readonly = false;
            custom.platform = platform;
            custom.dns_mode = dns_mode;
            self.profiles.active = CUSTOM_PROFILE.to_string();
            return Ok(ProfileChange::RedirectedToCustom {
                from: chosen.to_string(),
            });
        }

        Ok(ProfileChange::Unchanged(chosen.to_string()))
    }
}

// =============================================================================
// BITRATE
// =============================================================================

/// Soft bitrate cap for a streaming platform, in kbps.
#[must_use]
pub fn platform_cap_kbps(platform: &str) -> u64 {
    match platform.trim() {
        "Aparat" | "Twitch" => 6000,
        "YouTube" => 9000,
        _ => 8000,
    }
}

/// Recommended stream bitrate: 70 % of upload, capped per platform.
#[must_use]
pub fn recommended_bitrate_kbps(platform: &str, upload_kbps: u64) -> u64 {
    let safe = upload_kbps.saturating_mul(UPLOAD_HEADROOM_PERCENT) / 100;
    safe.min(platform_cap_kbps(platform))
}

// =============================================================================
// TESTS
// =============================================================================
