//! # DNS Catalogue
//!
//! The list of resolvers the user can pick per app or per profile, the
//! curated presets, and the ranking used by "Optimize DNS".
//!
//! Ranking score (microseconds, lower is better):
//!
//! ```text
//! score = mean_ping + 2 * jitter + loss_fraction * 2000 ms
//! ```
//!
//! A server that never answered is scored with a 999 ms ping.

use crate::detect::infer_location;
use crate::netstats::PingStats;
use crate::settings::Settings;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ping assumed for a server with no replies.
pub const NO_REPLY_PING_US: u64 = 999_000;

/// Penalty for 100 % loss.
pub const FULL_LOSS_PENALTY_US: u64 = 2_000_000;

/// Servers checked by the first-run safe check.
pub const SAFE_CHECK_LIMIT: usize = 8;

/// Pings sent per server while optimising.
pub const OPTIMIZE_PINGS_PER_SERVER: usize = 4;

/// A resolver entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsServer {
    pub name: String,
    pub server: String,
    pub loc: String,
    pub tags: Vec<String>,
}

impl DnsServer {
    fn new(name: &str, server: &str, loc: &str, tags: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            server: server.to_string(),
            loc: loc.to_string(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
        }
    }

    /// `name - server [LOC]` as shown in pickers.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} - {} [{}]", self.name, self.server, self.loc)
    }
}

/// A first-run safe ping result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafePing {
    pub ping_us: Option<u64>,
    pub at: String,
}

/// `dns.rank_cache`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RankCache {
    /// Safe check results keyed by server address.
    pub safe_ping: BTreeMap<String, SafePing>,
    /// Latest "Optimize DNS" ranking.
    pub last_ranking: Vec<RankedDns>,
}

/// `dns`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSection {
    pub servers: Vec<DnsServer>,
    pub rank_cache: RankCache,
    pub unreliable: Vec<String>,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            servers: curated_servers(),
            rank_cache: RankCache::default(),
            unreliable: Vec::new(),
        }
    }
}

/// The curated Iran + global list.
#[must_use]
pub fn curated_servers() -> Vec<DnsServer> {
    vec![
        DnsServer::new("Shecan 1", "178.22.122.100", "IR", &["ir", "public"]),
        DnsServer::new("Shecan 2", "185.51.200.2", "IR", &["ir", "public"]),
        DnsServer::new("Radar (IR)", "10.202.10.10", "IR", &["ir", "local"]),
        DnsServer::new("Cloudflare", "1.1.1.1", "GLOBAL", &["global", "public"]),
        DnsServer::new("Google", "8.8.8.8", "GLOBAL", &["global", "public"]),
        DnsServer::new("Quad9", "9.9.9.9", "GLOBAL", &["global", "security"]),
        DnsServer::new("AdGuard", "94.140.14.14", "GLOBAL", &["global", "adblock"]),
        DnsServer::new("OpenDNS", "208.67.222.222", "GLOBAL", &["global", "public"]),
    ]
}

// =============================================================================
// PRESETS
// =============================================================================

/// Names of the built-in presets.
pub const PRESET_NAMES: [&str; 4] = ["Mixed", "Iran", "Global", "Privacy"];

/// Preset names, in display order.
#[must_use]
pub fn preset_names() -> &'static [&'static str] {
    &PRESET_NAMES
}

/// Server list for a preset, if the name is known (case-insensitive).
#[must_use]
pub fn preset(name: &str) -> Option<Vec<DnsServer>> {
    let all = curated_servers();
    let servers = match name.trim().to_ascii_lowercase().as_str() {
        "mixed" => all,
        "iran" => all.into_iter().filter(|s| s.loc == "IR").collect(),
        "global" => all.into_iter().filter(|s| s.loc == "GLOBAL").collect(),
        "privacy" => all
            .into_iter()
            .filter(|s| {
                s.tags
                    .iter()
                    .any(|t| t == "security" || t == "adblock")
                    || s.name == "Cloudflare"
            })
            .collect(),
        _ => return None,
    };
    Some(servers)
}

impl DnsSection {
    /// Add a server. Blank or duplicate addresses are rejected.
    ///
    /// `loc == "AUTO"` infers the location from the address.
    pub fn add_dns(&mut self, name: &str, server: &str, loc: &str) -> Result<()> {
        let server = server.trim();
        let name = name.trim();
        if server.is_empty() {
            return Err(CoreError::Empty("DNS server"));
        }
        if self.servers.iter().any(|s| s.server.trim() == server) {
            return Err(CoreError::Duplicate(format!("DNS server {server}")));
        }
        let loc = match loc.trim() {
            "" | "AUTO" => infer_location(server).to_string(),
            other => other.to_string(),
        };
        self.servers.push(DnsServer {
            name: if name.is_empty() { server } else { name }.to_string(),
            server: server.to_string(),
            tags: vec![loc.to_ascii_lowercase()],
            loc,
        });
        Ok(())
    }

    /// Remove the server at `index`. Returns false when out of range.
    pub fn remove_dns(&mut self, index: usize) -> bool {
        if index >= self.servers.len() {
            return false;
        }
        self.servers.remove(index);
        true
    }

    /// Replace the server list with a preset.
    pub fn apply_preset(&mut self, name: &str) -> Result<usize> {
        let servers = preset(name).ok_or_else(|| CoreError::NotFound(format!("preset {name}")))?;
        self.servers = servers;
        Ok(self.servers.len())
    }

    /// Store first-run safe ping results keyed by address.
    pub fn record_safe_ping(&mut self, results: &[(String, Option<u64>)], at: &str) {
        self.rank_cache.safe_ping = results
            .iter()
            .map(|(ip, ping_us)| {
                (
                    ip.clone(),
                    SafePing {
                        ping_us: *ping_us,
                        at: at.to_string(),
                    },
                )
            })
            .collect();
    }
}

// =============================================================================
// RANKING
// =============================================================================

/// One ranked server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedDns {
    /// Index into `dns.servers` at ranking time.
    pub index: usize,
    pub name: String,
    pub server: String,
    pub ping_us: u64,
    pub jitter_us: u64,
    pub loss_percent: u8,
    pub score_us: u64,
}

/// Score a set of ping results.
#[must_use]
pub fn score(stats: &PingStats) -> u64 {
    let ping = stats.mean_us.unwrap_or(NO_REPLY_PING_US);
    let loss_penalty = if stats.sent == 0 {
        FULL_LOSS_PENALTY_US
    } else {
        FULL_LOSS_PENALTY_US.saturating_mul(stats.lost() as u64) / stats.sent as u64
    };
    ping.saturating_add(stats.jitter_us.saturating_mul(2))
        .saturating_add(loss_penalty)
}

/// Rank servers by score, ascending. Ties keep list order.
#[must_use]
pub fn rank(servers: &[DnsServer], results: &[(usize, PingStats)]) -> Vec<RankedDns> {
    let mut ranked: Vec<RankedDns> = results
        .iter()
        .filter_map(|(index, stats)| {
            let server = servers.get(*index)?;
            Some(RankedDns {
                index: *index,
                name: server.name.clone(),
                server: server.server.clone(),
                ping_us: stats.mean_us.unwrap_or(NO_REPLY_PING_US),
                jitter_us: stats.jitter_us,
                loss_percent: stats.loss_percent,
                score_us: score(stats),
            })
        })
        .collect();
    ranked.sort_by_key(|r| r.score_us);
    ranked
}

impl Settings {
    /// Record the suggested DNS on the active profile (user accepted it).
    pub fn accept_dns_suggestion(&mut self, best: &RankedDns) {
        let active = self.profiles.active.clone();
        self.profiles
            .items
            .entry(active)
            .or_default()
            .suggested_dns = Some(best.server.clone());
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn stats(samples: &[Option<u64>]) -> PingStats {
        PingStats::from_samples(samples)
    }

    #[test]
    fn add_infers_location_and_rejects_duplicates() {
        let mut dns = DnsSection::default();
        dns.add_dns("", "dns.example.ir", "AUTO").unwrap();
        let added = dns.servers.last().unwrap();
        assert_eq!(added.name, "dns.example.ir");
        assert_eq!(added.loc, "IR");
        assert_eq!(added.tags, vec!["ir".to_string()]);

        assert!(matches!(
            dns.add_dns("dup", " 1.1.1.1 ", "AUTO"),
            Err(CoreError::Duplicate(_))
        ));
        assert!(matches!(dns.add_dns("x", "  ", "AUTO"), Err(CoreError::Empty(_))));
    }

    #[test]
    fn remove_by_index() {
        let mut dns = DnsSection::default();
        assert!(dns.remove_dns(0));
        assert_eq!(dns.servers[0].name, "Shecan 2");
        assert!(!dns.remove_dns(100));
        assert_eq!(dns.servers.len(), 7);
    }

    #[test]
    fn presets_filter_curated_list() {
        assert_eq!(preset("iran").unwrap().len(), 3);
        assert_eq!(preset("Global").unwrap().len(), 5);
        assert_eq!(preset("mixed").unwrap().len(), 8);
        let privacy = preset("Privacy").unwrap();
        assert!(privacy.iter().any(|s| s.name == "Quad9"));
        assert!(privacy.iter().all(|s| s.loc == "GLOBAL"));
        assert!(preset("nope").is_none());

        let mut dns = DnsSection::default();
        assert_eq!(dns.apply_preset("Iran").unwrap(), 3);
        assert!(dns.apply_preset("nope").is_err());
    }

    #[test]
    fn score_penalizes_loss_and_jitter() {
        let clean = stats(&[Some(20_000), Some(20_000)]);
        let jittery = stats(&[Some(10_000), Some(30_000)]);
        let lossy = stats(&[Some(20_000), None]);
        assert_eq!(score(&clean), 20_000);
        assert_eq!(score(&jittery), 20_000 + 2 * 10_000);
        assert_eq!(score(&lossy), 20_000 + 1_000_000);
        assert_eq!(score(&stats(&[None, None])), NO_REPLY_PING_US + 2_000_000);
    }

    #[test]
    fn rank_orders_by_score() {
        let servers = curated_servers();
        let results = vec![
            (0, stats(&[None, None, None, None])),
            (3, stats(&[Some(5_000); 4])),
            (4, stats(&[Some(15_000); 4])),
            (99, stats(&[Some(1_000); 4])),
        ];
        let ranked = rank(&servers, &results);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].name, "Cloudflare");
        assert_eq!(ranked[1].name, "Google");
        assert_eq!(ranked[2].ping_us, NO_REPLY_PING_US);
        assert_eq!(ranked[2].loss_percent, 100);
    }

    #[test]
    fn accepting_suggestion_targets_active_profile() {
        let mut s = Settings::default();
        let best = RankedDns {
            index: 3,
            name: "Cloudflare".to_string(),
            server: "1.1.1.1".to_string(),
            ping_us: 1,
            jitter_us: 0,
            loss_percent: 0,
            score_us: 1,
        };
        s.accept_dns_suggestion(&best);
        assert_eq!(
            s.profiles.items["Gaming"].suggested_dns.as_deref(),
            Some("1.1.1.1")
        );
    }

    #[test]
    fn safe_ping_cache() {
        let mut dns = DnsSection::default();
        dns.record_safe_ping(
            &[("1.1.1.1".to_string(), Some(12_000)), ("8.8.8.8".to_string(), None)],
            "12:00:00",
        );
        assert_eq!(dns.rank_cache.safe_ping.len(), 2);
        assert_eq!(dns.rank_cache.safe_ping["1.1.1.1"].ping_us, Some(12_000));
    }
}
