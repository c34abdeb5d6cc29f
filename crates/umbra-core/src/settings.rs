//! # Settings Document
//!
//! The typed model of `configs/settings.json`.
//!
//! Every section carries `#[serde(default)]`, so a partial file loads with the
//! missing pieces filled in. [`merge_missing`] does the same at the JSON level
//! before typing, which keeps nested defaults (e.g. a new key inside `ui`)
//! without touching anything the user already has. Keys the model does not
//! know are kept in [`Settings::extra`] and written back untouched.

use crate::apps::AppCatalog;
use crate::configs::VpnConfig;
use crate::dns::DnsSection;
use crate::profiles::ProfileBook;
use crate::routing::Priority;
use crate::snapshot::History;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Default location of the settings file, relative to the working directory.
pub const DEFAULT_SETTINGS_PATH: &str = "configs/settings.json";

/// Application name stored in `meta.app`.
pub const APP_NAME: &str = "Umbra";

/// Settings schema version stored in `meta.version`.
pub const SETTINGS_VERSION: &str = "2.0.0-phase1";

// =============================================================================
// SECTIONS
// =============================================================================

/// `meta`: provenance and first-run state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Meta {
    pub created_at: String,
    pub updated_at: String,
    pub app: String,
    pub version: String,
    pub first_run_completed: bool,
}

impl Default for Meta {
    fn default() -> Self {
        let now = crate::timestamp();
        Self {
            created_at: now.clone(),
            updated_at: now,
            app: APP_NAME.to_string(),
            version: SETTINGS_VERSION.to_string(),
            first_run_completed: false,
        }
    }
}

/// What closing the dashboard window does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CloseAction {
    #[default]
    MinimizeToTray,
    Exit,
}

impl CloseAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CloseAction::MinimizeToTray => "minimize_to_tray",
            CloseAction::Exit => "exit",
        }
    }
}

impl From<String> for CloseAction {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("exit") {
            CloseAction::Exit
        } else {
            CloseAction::MinimizeToTray
        }
    }
}

impl From<CloseAction> for String {
    fn from(value: CloseAction) -> Self {
        value.as_str().to_string()
    }
}

/// `ui`: dashboard and tray preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiPrefs {
    pub tray_enabled: bool,
    pub close_action: CloseAction,
    pub show_stream_bitrate_on_dashboard: bool,
    pub refresh_enabled: bool,
    pub refresh_interval_s: u64,
    pub pause_refresh_when_minimized: bool,
}

impl Default for UiPrefs {
    fn default() -> Self {
        Self {
            tray_enabled: true,
            close_action: CloseAction::MinimizeToTray,
            show_stream_bitrate_on_dashboard: true,
            refresh_enabled: true,
            refresh_interval_s: 60,
            pause_refresh_when_minimized: true,
        }
    }
}

impl UiPrefs {
    /// Whether closing the window keeps the process alive in the tray.
    #[must_use]
    pub fn close_minimizes(&self) -> bool {
        self.tray_enabled && self.close_action == CloseAction::MinimizeToTray
    }

    /// Whether periodic refresh should be skipped for a hidden window.
    #[must_use]
    pub fn refresh_paused(&self, window_hidden: bool) -> bool {
        self.pause_refresh_when_minimized && window_hidden
    }

    /// Whether an auto-refresh is due, given seconds since the last one.
    #[must_use]
    pub fn refresh_due(&self, secs_since_last: u64) -> bool {
        self.refresh_enabled
            && self.refresh_interval_s > 0
            && secs_since_last >= self.refresh_interval_s
    }
}

/// `behavior`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Behavior {
    /// Offer suggestions (Accept/Deny). Never applied without consent.
    pub auto_suggestions: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            auto_suggestions: true,
        }
    }
}

/// Copilot intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopilotMode {
    Basic,
    #[default]
    Helpful,
    Expert,
}

impl CopilotMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CopilotMode::Basic => "Basic",
            CopilotMode::Helpful => "Helpful",
            CopilotMode::Expert => "Expert",
        }
    }

    /// Parse a mode name; anything unknown is `Helpful`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "Basic" => CopilotMode::Basic,
            "Expert" => CopilotMode::Expert,
            _ => CopilotMode::Helpful,
        }
    }
}

impl fmt::Display for CopilotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `copilot`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Copilot {
    pub mode: String,
    pub suppressed: Vec<String>,
    pub last_analysis_at: Option<String>,
}

impl Default for Copilot {
    fn default() -> Self {
        Self {
            mode: CopilotMode::Helpful.as_str().to_string(),
            suppressed: Vec::new(),
            last_analysis_at: None,
        }
    }
}

/// `assist`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Assist {
    pub default_dns_packs_enabled: bool,
    pub streaming_auto_vpn_fallback: bool,
    pub ask_once_per_session: bool,
    pub last_checks: BTreeMap<String, Value>,
}

impl Default for Assist {
    fn default() -> Self {
        Self {
            default_dns_packs_enabled: true,
            streaming_auto_vpn_fallback: false,
            ask_once_per_session: true,
            last_checks: BTreeMap::new(),
        }
    }
}

/// A speed-test / ping target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedTarget {
    pub name: String,
    pub host: String,
    pub loc: String,
    pub download_url: String,
}

/// An upload endpoint accepting POST.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadEndpoint {
    pub name: String,
    pub url: String,
}

/// Fallback download URL when a target has none.
pub const FALLBACK_DOWNLOAD_URL: &str = "https://cachefly.cachefly.net/10mb.test";

/// Fallback upload URL when no endpoint is configured.
pub const FALLBACK_UPLOAD_URL: &str = "https://httpbin.org/post";

/// Fallback ping host.
pub const FALLBACK_PING_HOST: &str = "1.1.1.1";

/// `speedtest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedtestSection {
    pub targets: Vec<SpeedTarget>,
    pub advanced_download_bytes: u64,
    pub advanced_upload_bytes: u64,
    pub upload_endpoints: Vec<UploadEndpoint>,
}

impl Default for SpeedtestSection {
    fn default() -> Self {
        let target = |name: &str, host: &str, loc: &str, url: &str| SpeedTarget {
            name: name.to_string(),
            host: host.to_string(),
            loc: loc.to_string(),
            download_url: url.to_string(),
        };
        Self {
            targets: vec![
                target(
                    "ArvanCloud Edge (IR)",
                    "simin.iperf3.ir",
                    "IR",
                    "http://simin.iperf3.ir/files/100mb.bin",
                ),
                target(
                    "Cloudflare DNS",
                    "1.1.1.1",
                    "GLOBAL",
                    "https://speed.cloudflare.com/__down?bytes=10000000",
                ),
                target(
                    "Google DNS",
                    "8.8.8.8",
                    "GLOBAL",
                    "https://cachefly.cachefly.net/10mb.test",
                ),
                target(
                    "Hetzner (FSN1)",
                    "fsn1-speed.hetzner.com",
                    "GLOBAL",
                    "https://fsn1-speed.hetzner.com/100MB.bin",
                ),
            ],
            advanced_download_bytes: 10_000_000,
            advanced_upload_bytes: 2_000_000,
            upload_endpoints: vec![UploadEndpoint {
                name: "HTTPBin".to_string(),
                url: FALLBACK_UPLOAD_URL.to_string(),
            }],
        }
    }
}

impl SpeedtestSection {
    /// Host pinged by the engine monitor: the second target, else the first.
    #[must_use]
    pub fn monitor_host(&self) -> String {
        self.targets
            .get(1)
            .or_else(|| self.targets.first())
            .map(|t| t.host.trim())
            .filter(|h| !h.is_empty())
            .unwrap_or(FALLBACK_PING_HOST)
            .to_string()
    }

    /// Target by index, falling back to the first target.
    #[must_use]
    pub fn target(&self, index: usize) -> Option<&SpeedTarget> {
        self.targets.get(index).or_else(|| self.targets.first())
    }

    /// Ping host for a target index.
    #[must_use]
    pub fn ping_host(&self, index: usize) -> String {
        self.targets
            .get(index)
            .map(|t| t.host.trim())
            .filter(|h| !h.is_empty())
            .unwrap_or(FALLBACK_PING_HOST)
            .to_string()
    }

    /// Download URL for a target index.
    #[must_use]
    pub fn download_url(&self, index: usize) -> String {
        self.target(index)
            .map(|t| t.download_url.trim())
            .filter(|u| !u.is_empty())
            .unwrap_or(FALLBACK_DOWNLOAD_URL)
            .to_string()
    }

    /// First configured upload URL.
    #[must_use]
    pub fn upload_url(&self) -> String {
        self.upload_endpoints
            .first()
            .map(|e| e.url.trim())
            .filter(|u| !u.is_empty())
            .unwrap_or(FALLBACK_UPLOAD_URL)
            .to_string()
    }
}

/// `engine`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Manual port list shown next to detected listening ports.
    pub port_override: String,
}

/// `core_updates`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreUpdates {
    /// GitHub `owner/repo` per core.
    pub repos: BTreeMap<String, String>,
    /// Externally installed core binaries (openvpn, openconnect).
    pub paths: BTreeMap<String, String>,
}

impl Default for CoreUpdates {
    fn default() -> Self {
        let mut repos = BTreeMap::new();
        repos.insert("singbox".to_string(), "SagerNet/sing-box".to_string());
        repos.insert("clash".to_string(), "MetaCubeX/mihomo".to_string());
        Self {
            repos,
            paths: BTreeMap::new(),
        }
    }
}

impl CoreUpdates {
    /// Repository for a core, with the built-in fallback.
    #[must_use]
    pub fn repo(&self, core: &str) -> String {
        if let Some(repo) = self.repos.get(core).filter(|r| !r.trim().is_empty()) {
            return repo.clone();
        }
        match core {
            "clash" => "MetaCubeX/mihomo".to_string(),
            _ => "SagerNet/sing-box".to_string(),
        }
    }

    /// Configured binary path for a core, if any.
    #[must_use]
    pub fn path(&self, core: &str) -> Option<&str> {
        self.paths
            .get(core)
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
    }
}

// =============================================================================
// SETTINGS
// =============================================================================

/// The whole settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub meta: Meta,
    pub ui: UiPrefs,
    pub behavior: Behavior,
    pub copilot: Copilot,
    pub history: History,
    pub assist: Assist,
    pub dns: DnsSection,
    pub speedtest: SpeedtestSection,
    pub engine: EngineSection,
    pub profiles: ProfileBook,
    pub configs: Vec<VpnConfig>,
    pub subscriptions: Vec<String>,
    pub app_dns_routes: BTreeMap<String, String>,
    pub app_vpn_routes: BTreeMap<String, String>,
    pub app_interfaces: BTreeMap<String, String>,
    pub app_priorities: BTreeMap<String, Priority>,
    pub apps: AppCatalog,
    pub core_updates: CoreUpdates,

    /// Keys this version does not model. Preserved on save.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            meta: Meta::default(),
            ui: UiPrefs::default(),
            behavior: Behavior::default(),
            copilot: Copilot::default(),
            history: History::default(),
            assist: Assist::default(),
            dns: DnsSection::default(),
            speedtest: SpeedtestSection::default(),
            engine: EngineSection::default(),
            profiles: ProfileBook::default(),
            configs: Vec::new(),
            subscriptions: Vec::new(),
            app_dns_routes: BTreeMap::new(),
            app_vpn_routes: BTreeMap::new(),
            app_interfaces: BTreeMap::new(),
            app_priorities: BTreeMap::new(),
            apps: AppCatalog::default(),
            core_updates: CoreUpdates::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Create the default document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build settings from a loaded JSON document.
    ///
    /// Missing keys (at any depth) are filled from the defaults first.
    /// A non-object document is treated as empty.
    pub fn from_value(mut value: Value) -> Result<Self> {
        if !value.is_object() {
            value = Value::Object(Map::new());
        }
        let defaults = serde_json::to_value(Settings::default())?;
        merge_missing(&mut value, &defaults);
        serde_json::from_value(value).map_err(CoreError::from)
    }

    /// Like [`Settings::from_value`], but values that do not fit the model
    /// are reset to their defaults instead of failing the whole document.
    ///
    /// Array entries and map entries without a default are dropped. Returns
    /// the settings and the paths that were reset, e.g. `ui.refresh_interval_s`.
    pub fn from_value_repaired(mut value: Value) -> Result<(Self, Vec<String>)> {
        if !value.is_object() {
            value = Value::Object(Map::new());
        }
        let defaults = serde_json::to_value(Settings::default())?;
        merge_missing(&mut value, &defaults);
        if let Ok(settings) = serde_json::from_value::<Settings>(value.clone()) {
            return Ok((settings, Vec::new()));
        }

        let mut repaired = Vec::new();
        if let Value::Object(map) = &mut value {
            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                let mut path = vec![Step::Key(key.clone())];
                let keep = map.get_mut(&key).is_none_or(|section| {
                    repair(&mut path, section, defaults.get(&key), &defaults, &mut repaired)
                });
                if !keep {
                    map.remove(&key);
                }
            }
        }
        let settings = serde_json::from_value(value)?;
        Ok((settings, repaired))
    }

    /// Serialize to a JSON value.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(CoreError::from)
    }

    /// Refresh `meta.updated_at`. Called by the store on every save.
    pub fn touch(&mut self) {
        self.meta.updated_at = crate::timestamp();
    }

    // -------------------------------------------------------------------------
    // First run / copilot
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn is_first_run_pending(&self) -> bool {
        !self.meta.first_run_completed
    }

    pub fn mark_first_run_completed(&mut self) {
        self.meta.first_run_completed = true;
    }

    #[must_use]
    pub fn copilot_mode(&self) -> CopilotMode {
        CopilotMode::from_name(&self.copilot.mode)
    }

    /// Set the copilot mode from a name; unknown names become `Helpful`.
    pub fn set_copilot_mode(&mut self, mode: &str) {
        self.copilot.mode = CopilotMode::from_name(mode).as_str().to_string();
    }

    /// Suppress a suggestion id. Returns true when newly suppressed.
    pub fn suppress_suggestion(&mut self, id: &str) -> bool {
        let id = id.trim();
        if id.is_empty() || self.copilot.suppressed.iter().any(|s| s == id) {
            return false;
        }
        self.copilot.suppressed.push(id.to_string());
        true
    }

    #[must_use]
    pub fn is_suggestion_suppressed(&self, id: &str) -> bool {
        let id = id.trim();
        !id.is_empty() && self.copilot.suppressed.iter().any(|s| s == id)
    }

    // -------------------------------------------------------------------------
    // Engine
    // -------------------------------------------------------------------------

    /// Store a manual port list, keeping only numeric entries.
    ///
    /// Returns the normalised value that was stored.
    pub fn set_port_override(&mut self, raw: &str) -> String {
        let cleaned = normalize_port_list(raw);
        self.engine.port_override = cleaned.clone();
        cleaned
    }
}

/// Normalise a comma-separated port list: `"080, x, 443"` → `"80, 443"`.
///
/// Entries outside `1..=65535` are dropped.
#[must_use]
pub fn normalize_port_list(raw: &str) -> String {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|p| p.parse::<u16>().ok())
        .filter(|&p| p != 0)
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// -----------------------------------------------------------------------------
// Repair
// -----------------------------------------------------------------------------

/// One step from the document root to a nested value.
enum Step {
    Key(String),
    Elem,
}

/// Wrap `leaf` in the objects and one-element arrays named by `path`.
fn nest(path: &[Step], leaf: Value) -> Value {
    path.iter().rev().fold(leaf, |inner, step| match step {
        Step::Key(key) => {
            let mut map = Map::new();
            map.insert(key.clone(), inner);
            Value::Object(map)
        }
        Step::Elem => Value::Array(vec![inner]),
    })
}

fn dotted(path: &[Step]) -> String {
    let mut out = String::new();
    for step in path {
        match step {
            Step::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            Step::Elem => out.push_str("[]"),
        }
    }
    out
}

/// Whether `value`, placed at `path` in an otherwise default document, maps.
fn fits(path: &[Step], value: &Value, defaults: &Value) -> bool {
    let mut doc = nest(path, value.clone());
    merge_missing(&mut doc, defaults);
    serde_json::from_value::<Settings>(doc).is_ok()
}

/// Fix `value` in place, innermost values first. Returns false when the
/// value has no default and must be removed from its parent.
fn repair(
    path: &mut Vec<Step>,
    value: &mut Value,
    default: Option<&Value>,
    defaults: &Value,
    repaired: &mut Vec<String>,
) -> bool {
    if fits(path, value, defaults) {
        return true;
    }
    match value {
        Value::Object(map) => {
            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                let child_default = default.and_then(|d| d.get(&key));
                path.push(Step::Key(key.clone()));
                let keep = map
                    .get_mut(&key)
                    .is_none_or(|child| repair(path, child, child_default, defaults, repaired));
                path.pop();
                if !keep {
                    map.remove(&key);
                }
            }
        }
        Value::Array(items) => {
            path.push(Step::Elem);
            items.retain_mut(|item| repair(path, item, None, defaults, repaired));
            path.pop();
        }
        _ => {}
    }
    if fits(path, value, defaults) {
        return true;
    }
    repaired.push(dotted(path));
    match default {
        Some(d) => {
            *value = d.clone();
            true
        }
        None => false,
    }
}

/// Insert every key of `defaults` that `dst` lacks, recursing into objects.
///
/// Existing values are never replaced, including arrays and values whose
/// type differs from the default.
pub fn merge_missing(dst: &mut Value, defaults: &Value) {
    let (Value::Object(dst), Value::Object(src)) = (dst, defaults) else {
        return;
    };
    for (key, default) in src {
        match dst.get_mut(key) {
            None => {
                dst.insert(key.clone(), default.clone());
            }
            Some(existing) => {
                if existing.is_object() && default.is_object() {
                    merge_missing(existing, default);
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
