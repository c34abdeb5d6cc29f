//! # Per-App Routing Rules
//!
//! Rules are recorded, displayed and exported. Nothing here changes how the
//! operating system routes traffic.
//!
//! A rule is stored across four maps keyed by process name
//! (`app_dns_routes`, `app_vpn_routes`, `app_interfaces`, `app_priorities`),
//! matching the layout of the settings file.

use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Value meaning "let the system decide".
pub const AUTO: &str = "AUTO";

/// Process names that receive the OBS quick profile.
pub const OBS_KEYS: [&str; 2] = ["obs64.exe", "obs.exe"];

/// Maximum number of processes shown in the routing list.
pub const PROCESS_LIST_LIMIT: usize = 250;

const SYSTEM_PROCESS_NAMES: [&str; 11] = [
    "system",
    "system idle process",
    "idle",
    "services.exe",
    "wininit.exe",
    "csrss.exe",
    "lsass.exe",
    "smss.exe",
    "fontdrvhost.exe",
    "dwm.exe",
    "spoolsv.exe",
];

const SYSTEM_DIRS: [&str; 2] = ["\\windows\\system32", "\\windows\\syswow64"];

const SERVICE_ACCOUNTS: [&str; 5] = [
    "nt authority\\system",
    "system",
    "local service",
    "nt authority\\local service",
    "nt authority\\network service",
];

// =============================================================================
// RULES
// =============================================================================

/// Process priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Priority {
    #[default]
    Auto,
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Auto,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Auto => "Auto",
            Priority::High => "High",
            Priority::Normal => "Normal",
            Priority::Low => "Low",
        }
    }

    /// Parse a priority name (case-insensitive); unknown names are `Auto`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(name))
            .unwrap_or(Priority::Auto)
    }
}

impl From<String> for Priority {
    fn from(value: String) -> Self {
        Priority::from_name(&value)
    }
}

impl From<Priority> for String {
    fn from(value: Priority) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The rule recorded for one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRule {
    pub dns: String,
    pub vpn: String,
    pub interface: String,
    pub priority: Priority,
}

impl Default for AppRule {
    fn default() -> Self {
        Self {
            dns: AUTO.to_string(),
            vpn: AUTO.to_string(),
            interface: AUTO.to_string(),
            priority: Priority::Auto,
        }
    }
}

/// Normalise a picker value: anything starting with `AUTO` is `AUTO`.
#[must_use]
pub fn normalize_choice(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() || value.starts_with(AUTO) {
        AUTO.to_string()
    } else {
        value.to_string()
    }
}

impl Settings {
    /// The recorded rule for `app`, `AUTO` where nothing is recorded.
    #[must_use]
    pub fn rule_for(&self, app: &str) -> AppRule {
        let get = |map: &BTreeMap<String, String>| {
            map.get(app)
                .cloned()
                .unwrap_or_else(|| AUTO.to_string())
        };
        AppRule {
            dns: get(&self.app_dns_routes),
            vpn: get(&self.app_vpn_routes),
            interface: get(&self.app_interfaces),
            priority: self.app_priorities.get(app).copied().unwrap_or_default(),
        }
    }

    /// Record a rule for `app`. Blank app names are ignored.
    pub fn apply_rule(&mut self, app: &str, rule: &AppRule) -> bool {
        let app = app.trim();
        if app.is_empty() {
            return false;
        }
        self.app_dns_routes
            .insert(app.to_string(), normalize_choice(&rule.dns));
        self.app_vpn_routes
            .insert(app.to_string(), normalize_choice(&rule.vpn));
        self.app_interfaces
            .insert(app.to_string(), normalize_choice(&rule.interface));
        self.app_priorities.insert(app.to_string(), rule.priority);
        true
    }

    /// Drop the DNS choice for `app`. Returns true when one was recorded.
    pub fn reset_dns(&mut self, app: &str) -> bool {
        self.app_dns_routes.remove(app.trim()).is_some()
    }

    /// Record `rule` for both OBS executables, with `Auto` priority raised
    /// to `High`.
    pub fn apply_obs_quick_profile(&mut self, rule: &AppRule) {
        let mut rule = rule.clone();
        if rule.priority == Priority::Auto {
            rule.priority = Priority::High;
        }
        for key in OBS_KEYS {
            self.apply_rule(key, &rule);
        }
    }

    /// Every app with at least one recorded field, sorted by name.
    #[must_use]
    pub fn routed_apps(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .app_dns_routes
            .keys()
            .chain(self.app_vpn_routes.keys())
            .chain(self.app_interfaces.keys())
            .chain(self.app_priorities.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

// =============================================================================
// PROCESS CLASSIFICATION
// =============================================================================

/// A running process as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub exe: Option<String>,
    pub user: Option<String>,
    /// Sockets with a state (established, listening, ...).
    pub connections: usize,
}

impl ProcessInfo {
    #[must_use]
    pub fn has_system_name(&self) -> bool {
        let name = self.name.to_lowercase();
        SYSTEM_PROCESS_NAMES.contains(&name.as_str())
    }

    #[must_use]
    pub fn in_system_dir(&self) -> bool {
        self.exe.as_deref().is_some_and(is_system_path)
    }

    #[must_use]
    pub fn runs_as_service(&self) -> bool {
        self.user
            .as_deref()
            .is_some_and(|u| SERVICE_ACCOUNTS.contains(&u.to_lowercase().as_str()))
    }
}

/// Whether an executable path lives in a Windows system directory.
#[must_use]
pub fn is_system_path(exe: &str) -> bool {
    let exe = exe.to_lowercase();
    SYSTEM_DIRS.iter().any(|d| exe.contains(d))
}

/// Which processes the routing list shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessFilter {
    /// Hide anything that looks like a system process.
    #[default]
    AppsOnly,
    /// Hide core OS services but keep third-party background apps.
    AppsAndBackground,
    /// No filtering.
    IncludeServices,
}

impl ProcessFilter {
    #[must_use]
    pub fn keeps(self, p: &ProcessInfo) -> bool {
        let named = p.has_system_name();
        let located = p.in_system_dir() || p.runs_as_service();
        match self {
            ProcessFilter::AppsOnly => !(named || located),
            ProcessFilter::AppsAndBackground => !(named && located),
            ProcessFilter::IncludeServices => true,
        }
    }

    /// Apply the filter, hiding `self_pid` and Umbra's own processes, and
    /// cap the list.
    #[must_use]
    pub fn apply(self, procs: &[ProcessInfo], self_pid: u32) -> Vec<ProcessInfo> {
        procs
            .iter()
            .filter(|p| p.pid != self_pid)
            .filter(|p| !p.name.to_lowercase().contains("umbra"))
            .filter(|p| self.keeps(p))
            .take(PROCESS_LIST_LIMIT)
            .cloned()
            .collect()
    }
}

/// Sort by connection count, then name, both descending.
pub fn sort_by_activity(procs: &mut [ProcessInfo]) {
    procs.sort_by(|a, b| {
        (b.connections, b.name.to_lowercase()).cmp(&(a.connections, a.name.to_lowercase()))
    });
}

// =============================================================================
// INTERFACES
// =============================================================================

/// Address metadata for one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceMeta {
    pub name: String,
    pub ip: String,
    pub subnet: String,
    pub gateway: String,
}

impl InterfaceMeta {
    /// Build metadata; missing values render as `-`.
    #[must_use]
    pub fn new(name: &str, ip: Option<Ipv4Addr>, prefix: Option<u8>, gateway: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            ip: ip.map_or_else(|| "-".to_string(), |ip| ip.to_string()),
            subnet: prefix.map_or_else(|| "-".to_string(), |p| format!("/{p}")),
            gateway: gateway.unwrap_or("-").to_string(),
        }
    }

    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "IP {} | Subnet {} | Gateway {}",
            self.ip, self.subnet, self.gateway
        )
    }
}

/// Prefix length of a contiguous IPv4 netmask.
#[must_use]
pub fn netmask_prefix(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    if bits.checked_shl(ones).unwrap_or(0) != 0 {
        return None;
    }
    u8::try_from(ones).ok()
}

/// Default gateways from `ip route show default`.
#[must_use]
pub fn parse_ip_route(output: &str) -> BTreeMap<String, String> {
    let mut gateways = BTreeMap::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let after = |key: &str| {
            parts
                .iter()
                .position(|p| *p == key)
                .and_then(|i| parts.get(i + 1))
                .copied()
        };
        if let (Some(gw), Some(dev)) = (after("via"), after("dev")) {
            gateways
                .entry(dev.to_string())
                .or_insert_with(|| gw.to_string());
        }
    }
    gateways
}

/// Default gateways from Windows `route print -4`, keyed by interface address.
#[must_use]
pub fn parse_route_print(output: &str) -> BTreeMap<String, String> {
    let mut gateways = BTreeMap::new();
    let mut in_routes = false;
    for line in output.lines() {
        let t = line.trim();
        if t.starts_with("Active Routes:") {
            in_routes = true;
            continue;
        }
        if in_routes && t.starts_with("====") {
            break;
        }
        if !in_routes || !t.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        let cols: Vec<&str> = t.split_whitespace().collect();
        if cols.len() >= 4 && cols[0] == "0.0.0.0" && cols[1] == "0.0.0.0" {
            gateways
                .entry(cols[3].to_string())
                .or_insert_with(|| cols[2].to_string());
        }
    }
    gateways
}

/// Default gateway from macOS `route -n get default`.
#[must_use]
pub fn parse_route_get(output: &str) -> BTreeMap<String, String> {
    let mut gateways = BTreeMap::new();
    let mut gateway = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some(gw) = line.strip_prefix("gateway:") {
            gateway = Some(gw.trim().to_string());
        } else if let Some(iface) = line.strip_prefix("interface:") {
            let iface = iface.trim();
            if let Some(gw) = gateway.as_ref().filter(|_| !iface.is_empty()) {
                gateways.insert(iface.to_string(), gw.clone());
            }
        }
    }
    gateways
}

// =============================================================================
// TESTS
// =============================================================================
