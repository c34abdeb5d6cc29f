//! # Config Detection
//!
//! Classifies pasted share links, subscription bodies and config files, and
//! picks the VPN core able to run them.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static WIREGUARD_INTERFACE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*\[Interface\]\s*").ok());

static SSH_INLINE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?i)^\s*ssh\s+").ok());

/// Maximum host length kept in an auto-generated config name.
pub const NAME_HOST_LIMIT: usize = 22;

// =============================================================================
// CONFIG KIND
// =============================================================================

/// The format of an imported config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConfigKind {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Socks,
    Http,
    Hysteria2,
    OpenVpn,
    OpenConnect,
    WireGuard,
    Ssh,
    SingboxJson,
    Unknown,
}

impl ConfigKind {
    /// Every kind, in detection order.
    pub const ALL: [ConfigKind; 13] = [
        ConfigKind::Vmess,
        ConfigKind::Vless,
        ConfigKind::Trojan,
        ConfigKind::Shadowsocks,
        ConfigKind::Socks,
        ConfigKind::Http,
        ConfigKind::Hysteria2,
        ConfigKind::OpenVpn,
        ConfigKind::OpenConnect,
        ConfigKind::WireGuard,
        ConfigKind::Ssh,
        ConfigKind::SingboxJson,
        ConfigKind::Unknown,
    ];

    /// Stable identifier used in the settings file.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKind::Vmess => "vmess",
            ConfigKind::Vless => "vless",
            ConfigKind::Trojan => "trojan",
            ConfigKind::Shadowsocks => "shadowsocks",
            ConfigKind::Socks => "socks",
            ConfigKind::Http => "http",
            ConfigKind::Hysteria2 => "hysteria2",
            ConfigKind::OpenVpn => "openvpn",
            ConfigKind::OpenConnect => "openconnect",
            ConfigKind::WireGuard => "wireguard",
            ConfigKind::Ssh => "ssh",
            ConfigKind::SingboxJson => "singbox_json",
            ConfigKind::Unknown => "unknown",
        }
    }

    /// Parse an identifier; anything unrecognised is `Unknown`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == name)
            .unwrap_or(ConfigKind::Unknown)
    }

    /// Detect the kind of a raw config.
    #[must_use]
    pub fn detect(raw: &str) -> Self {
        let t = raw.trim();
        if t.is_empty() {
            return ConfigKind::Unknown;
        }
        let low = t.to_ascii_lowercase();

        let prefixed = [
            ("vmess://", ConfigKind::Vmess),
            ("vless://", ConfigKind::Vless),
            ("trojan://", ConfigKind::Trojan),
            ("ss://", ConfigKind::Shadowsocks),
            ("socks://", ConfigKind::Socks),
            ("socks5://", ConfigKind::Socks),
            ("http://", ConfigKind::Http),
            ("https://", ConfigKind::Http),
            ("hysteria2://", ConfigKind::Hysteria2),
            ("hy2://", ConfigKind::Hysteria2),
        ];
        if let Some((_, kind)) = prefixed.iter().find(|(p, _)| low.starts_with(p)) {
            return *kind;
        }

        if low.contains("openvpn") || low.starts_with("ovpn://") || low.ends_with(".ovpn") {
            return ConfigKind::OpenVpn;
        }
        if low.contains("openconnect") || low.contains("anyconnect") {
            return ConfigKind::OpenConnect;
        }
        if is_wireguard_ini(t) {
            return ConfigKind::WireGuard;
        }
        let ssh_inline = SSH_INLINE.as_ref().is_some_and(|re| re.is_match(t));
        if ssh_inline || low.starts_with("ssh://") {
            return ConfigKind::Ssh;
        }
        if t.starts_with('{') && (t.contains("outbounds") || t.contains("inbounds")) {
            return ConfigKind::SingboxJson;
        }
        ConfigKind::Unknown
    }

    /// The core that should run this kind of config.
    #[must_use]
    pub fn suggested_core(self) -> CoreKind {
        match self {
            ConfigKind::Vmess
            | ConfigKind::Vless
            | ConfigKind::Trojan
            | ConfigKind::Shadowsocks
            | ConfigKind::Socks
            | ConfigKind::Http
            | ConfigKind::Hysteria2
            | ConfigKind::WireGuard
            | ConfigKind::SingboxJson => CoreKind::Singbox,
            ConfigKind::OpenVpn => CoreKind::OpenVpn,
            ConfigKind::OpenConnect => CoreKind::OpenConnect,
            ConfigKind::Ssh => CoreKind::Ssh,
            ConfigKind::Unknown => CoreKind::Auto,
        }
    }
}

impl From<String> for ConfigKind {
    fn from(value: String) -> Self {
        ConfigKind::from_name(&value)
    }
}

impl From<ConfigKind> for String {
    fn from(value: ConfigKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CORE KIND
// =============================================================================

/// The external VPN core that runs a config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CoreKind {
    Auto,
    Singbox,
    Clash,
    OpenVpn,
    OpenConnect,
    Ssh,
    Other,
}

impl CoreKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CoreKind::Auto => "auto",
            CoreKind::Singbox => "singbox",
            CoreKind::Clash => "clash",
            CoreKind::OpenVpn => "openvpn",
            CoreKind::OpenConnect => "openconnect",
            CoreKind::Ssh => "ssh",
            CoreKind::Other => "other",
        }
    }

    /// Parse a core name, accepting the common aliases.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => CoreKind::Auto,
            "singbox" | "sing-box" => CoreKind::Singbox,
            "clash" | "mihomo" => CoreKind::Clash,
            "openvpn" => CoreKind::OpenVpn,
            "openconnect" => CoreKind::OpenConnect,
            "ssh" => CoreKind::Ssh,
            _ => CoreKind::Other,
        }
    }

    /// The core actually launched. `Auto` resolves to sing-box.
    #[must_use]
    pub fn resolve(self) -> Self {
        match self {
            CoreKind::Auto => CoreKind::Singbox,
            other => other,
        }
    }
}

impl From<String> for CoreKind {
    fn from(value: String) -> Self {
        CoreKind::from_name(&value)
    }
}

impl From<CoreKind> for String {
    fn from(value: CoreKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for CoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Whether the text contains a WireGuard `[Interface]` section header.
#[must_use]
pub fn is_wireguard_ini(text: &str) -> bool {
    WIREGUARD_INTERFACE
        .as_ref()
        .is_some_and(|re| re.is_match(text))
}

/// Heuristic for base64 subscription bodies.
///
/// At least 16 characters, no whitespace, base64 alphabet only.
#[must_use]
pub fn looks_base64(s: &str) -> bool {
    let s = s.trim();
    s.len() >= 16
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

/// Decode URL-safe base64 with padding repair. Invalid UTF-8 is dropped.
///
/// Standard-alphabet input (`+`, `/`) is accepted as well.
#[must_use]
pub fn decode_base64_lossy(s: &str) -> Option<String> {
    let mut normalized: String = s
        .trim()
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .filter(|c| *c != '=')
        .collect();
    let pad = (4 - normalized.len() % 4) % 4;
    normalized.extend(std::iter::repeat_n('=', pad));

    let raw = URL_SAFE.decode(normalized.as_bytes()).ok()?;
    let text: String = String::from_utf8_lossy(&raw)
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .collect();
    Some(text)
}

/// Location bucket for a host: `IR` for `.ir` domains, `GLOBAL` otherwise.
#[must_use]
pub fn infer_location(host: &str) -> &'static str {
    let h = host.to_ascii_lowercase();
    if h.ends_with(".ir") || h.contains(".ir/") {
        "IR"
    } else {
        "GLOBAL"
    }
}

/// Hostname of a share link, if it has one.
#[must_use]
pub fn link_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if !raw.contains("://") || raw.starts_with('{') {
        return None;
    }
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_matches(['[', ']']).to_string()))
        .filter(|h| !h.is_empty())
}

/// Display name for an imported config: `<host> [LOC]` or `<KIND> [AUTO]`.
#[must_use]
pub fn auto_name(raw: &str, kind: ConfigKind) -> String {
    let (short, loc) = match link_host(raw) {
        Some(host) => {
            let loc = infer_location(&host);
            (host, loc)
        }
        None => (kind.as_str().to_ascii_uppercase(), "AUTO"),
    };

    let short = if short.chars().count() > NAME_HOST_LIMIT {
        let cut: String = short.chars().take(NAME_HOST_LIMIT).collect();
        format!("{cut}…")
    } else {
        short
    };
    format!("{short} [{loc}]")
}

// =============================================================================
// TESTS
// =============================================================================
