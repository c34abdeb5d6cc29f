//! # Network Statistics
//!
//! Integer arithmetic for ping results, throughput and socket tables.
//! Latencies are microseconds, rates are bits per second.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

/// Samples kept by the dashboard monitor (one per second).
pub const PING_WINDOW_LEN: usize = 60;

static PING_TIME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"time[=<]\s*([0-9]+(?:\.[0-9]+)?)\s*ms").ok());

static SS_PID: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"pid=(\d+)").ok());

static SS_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"users:\(\("([^"]*)""#).ok());

// =============================================================================
// PING
// =============================================================================

/// Round-trip time from `ping` output, in microseconds.
///
/// Accepts `time=12.3 ms`, `time=12ms` and `time<1ms`.
#[must_use]
pub fn parse_ping_output(output: &str) -> Option<u64> {
    let lower = output.to_lowercase();
    let caps = PING_TIME.as_ref()?.captures(&lower)?;
    parse_millis(caps.get(1)?.as_str())
}

/// `"12.345"` (milliseconds) → 12345 µs. Digits past the third decimal are
/// dropped.
fn parse_millis(s: &str) -> Option<u64> {
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    let whole: u64 = whole.parse().ok()?;
    let mut micros = 0u64;
    let mut scale = 100u64;
    for b in frac.bytes().take(3) {
        micros += u64::from(b.checked_sub(b'0')?) * scale;
        scale /= 10;
    }
    whole.checked_mul(1000)?.checked_add(micros)
}

/// Arguments for a single ping with a one second timeout.
#[must_use]
pub fn ping_command(host: &str, os: &str) -> (String, Vec<String>) {
    let args: &[&str] = if os.starts_with("win") {
        &["-n", "1", "-w", "1000"]
    } else {
        &["-c", "1", "-W", "1"]
    };
    let mut argv: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
    argv.push(host.to_string());
    ("ping".to_string(), argv)
}

/// Summary of a series of pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PingStats {
    pub sent: usize,
    pub received: usize,
    /// Mean of the replies; `None` when nothing answered.
    pub mean_us: Option<u64>,
    /// Population standard deviation of the replies (0 with < 2 replies).
    pub jitter_us: u64,
    pub loss_percent: u8,
}

impl PingStats {
    /// `None` entries are lost pings.
    #[must_use]
    pub fn from_samples(samples: &[Option<u64>]) -> Self {
        let oks: Vec<u64> = samples.iter().flatten().copied().collect();
        let sent = samples.len();
        let received = oks.len();

        let mean_us = if received == 0 {
            None
        } else {
            let sum: u128 = oks.iter().map(|&v| u128::from(v)).sum();
            u64::try_from(sum / received as u128).ok()
        };

        let jitter_us = match mean_us {
            Some(mean) if received >= 2 => {
                let var: u128 = oks
                    .iter()
                    .map(|&v| {
                        let d = u128::from(v.abs_diff(mean));
                        d * d
                    })
                    .sum::<u128>()
                    / received as u128;
                u64::try_from(var.isqrt()).unwrap_or(u64::MAX)
            }
            _ => 0,
        };

        let loss_percent = if sent == 0 {
            0
        } else {
            let lost = sent - received;
            u8::try_from((lost * 100 + sent / 2) / sent).unwrap_or(100)
        };

        Self {
            sent,
            received,
            mean_us,
            jitter_us,
            loss_percent,
        }
    }

    #[must_use]
    pub fn lost(&self) -> usize {
        self.sent.saturating_sub(self.received)
    }
}

impl fmt::Display for PingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ping = self.mean_us.map_or(0, |us| (us + 500) / 1000);
        write!(
            f,
            "Ping {ping} ms | Jitter {} ms | Loss {}%",
            format_tenths_ms(self.jitter_us),
            self.loss_percent
        )
    }
}

/// `12345` µs → `"12.3"`.
#[must_use]
pub fn format_tenths_ms(us: u64) -> String {
    format!("{}.{}", us / 1000, (us % 1000) / 100)
}

/// Rolling window of monitor samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingWindow {
    samples: VecDeque<Option<u64>>,
    cap: usize,
}

impl Default for PingWindow {
    fn default() -> Self {
        Self::new(PING_WINDOW_LEN)
    }
}

impl PingWindow {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    /// Record a sample; `None` is a lost ping.
    pub fn push(&mut self, sample: Option<u64>) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn samples(&self) -> Vec<Option<u64>> {
        self.samples.iter().copied().collect()
    }

    #[must_use]
    pub fn stats(&self) -> PingStats {
        PingStats::from_samples(&self.samples())
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

// =============================================================================
// THROUGHPUT
// =============================================================================

/// A transfer rate in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Rate(pub u64);

impl Rate {
    #[must_use]
    pub fn bps(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn kbps(self) -> u64 {
        self.0 / 1000
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hundredths = self.0 / 10_000;
        write!(f, "{}.{:02} Mbps", hundredths / 100, hundredths % 100)
    }
}

/// Bits per second for `bytes` moved in `elapsed` (floored at 1 ms).
#[must_use]
pub fn throughput_bps(bytes: u64, elapsed: Duration) -> Rate {
    let micros = elapsed.as_micros().max(1000);
    let bps = u128::from(bytes) * 8 * 1_000_000 / micros;
    Rate(u64::try_from(bps).unwrap_or(u64::MAX))
}

/// Total interface counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CounterSample {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub at_ms: u64,
}

impl CounterSample {
    /// Down/up rates since `prev`. Counter resets read as zero.
    #[must_use]
    pub fn rates_since(&self, prev: &CounterSample) -> (Rate, Rate) {
        let elapsed = Duration::from_millis(self.at_ms.saturating_sub(prev.at_ms));
        (
            throughput_bps(self.rx_bytes.saturating_sub(prev.rx_bytes), elapsed),
            throughput_bps(self.tx_bytes.saturating_sub(prev.tx_bytes), elapsed),
        )
    }
}

// =============================================================================
// SOCKET TABLES
// =============================================================================

/// Which tool produced a socket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketTableFormat {
    /// Windows `netstat -ano`.
    Netstat,
    /// Linux `ss -tanpH`.
    Ss,
}

/// One TCP socket row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub state: String,
    pub local_port: u16,
    pub pids: Vec<u32>,
    pub process: Option<String>,
}

impl SocketEntry {
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state.eq_ignore_ascii_case("LISTEN") || self.state.eq_ignore_ascii_case("LISTENING")
    }
}

/// A listening port with its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListeningPort {
    pub port: u16,
    pub pid: u32,
    pub name: String,
}

fn port_of(addr: &str) -> Option<u16> {
    addr.rsplit_once(':')?.1.parse().ok()
}

/// Parse TCP rows of a socket table. UDP and header rows are skipped.
#[must_use]
pub fn parse_socket_table(output: &str, format: SocketTableFormat) -> Vec<SocketEntry> {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match format {
                SocketTableFormat::Netstat => {
                    // TCP  local  foreign  state  pid
                    if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("TCP") {
                        return None;
                    }
                    Some(SocketEntry {
                        state: cols[3].to_string(),
                        local_port: port_of(cols[1])?,
                        pids: cols[4].parse().ok().into_iter().collect(),
                        process: None,
                    })
                }
                SocketTableFormat::Ss => {
                    // state  recv-q  send-q  local  peer  [process]
                    if cols.len() < 5 || cols[1].parse::<u64>().is_err() {
                        return None;
                    }
                    let users = cols.get(5..).map(|rest| rest.join(" ")).unwrap_or_default();
                    let pids = SS_PID
                        .as_ref()
                        .map(|re| {
                            re.captures_iter(&users)
                                .filter_map(|c| c.get(1)?.as_str().parse().ok())
                                .collect()
                        })
                        .unwrap_or_default();
                    let process = SS_NAME
                        .as_ref()
                        .and_then(|re| re.captures(&users))
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_string());
                    Some(SocketEntry {
                        state: cols[0].to_string(),
                        local_port: port_of(cols[3])?,
                        pids,
                        process,
                    })
                }
            }
        })
        .collect()
}

/// Distinct listening ports, ascending, at most `limit`.
///
/// `name_of` resolves a PID to a process name when the table has none.
#[must_use]
pub fn listening_ports<F>(entries: &[SocketEntry], limit: usize, name_of: F) -> Vec<ListeningPort>
where
    F: Fn(u32) -> Option<String>,
{
    let mut by_port: BTreeMap<u16, ListeningPort> = BTreeMap::new();
    for e in entries.iter().filter(|e| e.is_listening() && e.local_port != 0) {
        let pid = e.pids.first().copied().unwrap_or(0);
        by_port.entry(e.local_port).or_insert_with(|| {
            let name = e
                .process
                .clone()
                .or_else(|| (pid != 0).then(|| name_of(pid)).flatten())
                .unwrap_or_else(|| "-".to_string());
            ListeningPort {
                port: e.local_port,
                pid,
                name,
            }
        });
    }
    by_port.into_values().take(limit).collect()
}

/// Sockets per PID.
#[must_use]
pub fn connection_counts(entries: &[SocketEntry]) -> BTreeMap<u32, usize> {
    let mut counts = BTreeMap::new();
    for pid in entries.iter().flat_map(|e| e.pids.iter()) {
        *counts.entry(*pid).or_insert(0) += 1;
    }
    counts
}

/// `port:name` list for the dashboard, `-` when empty.
#[must_use]
pub fn ports_summary(ports: &[ListeningPort]) -> String {
    if ports.is_empty() {
        return "-".to_string();
    }
    ports
        .iter()
        .map(|p| format!("{}:{}", p.port, p.name))
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_ping_formats() {
        let linux = "64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=12.3 ms";
        assert_eq!(parse_ping_output(linux), Some(12_300));
        let windows = "Reply from 8.8.8.8: bytes=32 time=45ms TTL=117";
        assert_eq!(parse_ping_output(windows), Some(45_000));
        let fast = "Reply from 192.168.1.1: bytes=32 time<1ms TTL=64";
        assert_eq!(parse_ping_output(fast), Some(1_000));
        assert_eq!(parse_ping_output("TIME=0.0415 MS"), Some(41));
        assert_eq!(parse_ping_output("Request timed out."), None);
    }

    #[test]
    fn ping_command_per_os() {
        let (bin, args) = ping_command("1.1.1.1", "windows");
        assert_eq!(bin, "ping");
        assert_eq!(args, vec!["-n", "1", "-w", "1000", "1.1.1.1"]);
        let (_, args) = ping_command("1.1.1.1", "linux");
        assert_eq!(args, vec!["-c", "1", "-W", "1", "1.1.1.1"]);
    }

    #[test]
    fn stats_from_samples() {
        let s = PingStats::from_samples(&[Some(10_000), Some(30_000), None, None]);
        assert_eq!(s.sent, 4);
        assert_eq!(s.received, 2);
        assert_eq!(s.lost(), 2);
        assert_eq!(s.mean_us, Some(20_000));
        assert_eq!(s.jitter_us, 10_000);
        assert_eq!(s.loss_percent, 50);
        assert_eq!(s.to_string(), "Ping 20 ms | Jitter 10.0 ms | Loss 50%");

        let one = PingStats::from_samples(&[Some(5_000)]);
        assert_eq!(one.jitter_us, 0);
        let none = PingStats::from_samples(&[]);
        assert_eq!(none.mean_us, None);
        assert_eq!(none.loss_percent, 0);
        assert_eq!(PingStats::from_samples(&[None; 3]).loss_percent, 100);
    }

    #[test]
    fn window_keeps_last_samples() {
        let mut w = PingWindow::new(3);
        for v in 1..=5u64 {
            w.push(Some(v * 1000));
        }
        w.push(None);
        assert_eq!(w.len(), 3);
        assert_eq!(w.samples(), vec![Some(4_000), Some(5_000), None]);
        assert_eq!(w.stats().loss_percent, 33);
        assert_eq!(PingWindow::default().stats().sent, 0);
    }

    #[test]
    fn rates_display_as_mbps() {
        assert_eq!(Rate(12_345_678).to_string(), "12.34 Mbps");
        assert_eq!(Rate(0).to_string(), "0.00 Mbps");
        assert_eq!(Rate(50_000).to_string(), "0.05 Mbps");
        assert_eq!(Rate(2_500_000).kbps(), 2_500);
    }

    #[test]
    fn throughput_math() {
        let r = throughput_bps(1_250_000, Duration::from_secs(1));
        assert_eq!(r, Rate(10_000_000));
        // floored at 1 ms
        assert_eq!(throughput_bps(1, Duration::ZERO), Rate(8_000));

        let a = CounterSample { rx_bytes: 1_000, tx_bytes: 500, at_ms: 1_000 };
        let b = CounterSample { rx_bytes: 126_000, tx_bytes: 400, at_ms: 2_000 };
        let (down, up) = b.rates_since(&a);
        assert_eq!(down, Rate(1_000_000));
        assert_eq!(up, Rate(0));
    }

    #[test]
    fn parses_netstat_table() {
        let out = "\
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1104
  TCP    0.0.0.0:445            0.0.0.0:0              LISTENING       4
  TCP    192.168.1.5:50000      142.250.1.1:443        ESTABLISHED     7000
  TCP    192.168.1.5:50001      142.250.1.1:443        ESTABLISHED     7000
  TCP    [::]:135               [::]:0                 LISTENING       1104
  UDP    0.0.0.0:5353           *:*                                    2000
";
        let entries = parse_socket_table(out, SocketTableFormat::Netstat);
        assert_eq!(entries.len(), 5);
        let ports = listening_ports(&entries, 8, |pid| Some(format!("p{pid}")));
        assert_eq!(
            ports,
            vec![
                ListeningPort { port: 135, pid: 1104, name: "p1104".to_string() },
                ListeningPort { port: 445, pid: 4, name: "p4".to_string() },
            ]
        );
        let counts = connection_counts(&entries);
        assert_eq!(counts[&7000], 2);
        assert_eq!(counts[&1104], 2);
        assert!(!counts.contains_key(&2000));
        assert_eq!(ports_summary(&ports), "135:p1104, 445:p4");
        assert_eq!(ports_summary(&[]), "-");
    }

    #[test]
    fn parses_ss_table() {
        let out = r#"LISTEN 0      4096   127.0.0.53%lo:53        0.0.0.0:*     users:(("systemd-resolve",pid=812,fd=14))
LISTEN 0      128          0.0.0.0:22        0.0.0.0:*     users:(("sshd",pid=1000,fd=3),("sshd",pid=1001,fd=3))
ESTAB  0      0        10.0.0.2:22          10.0.0.9:51234
LISTEN 0      511                *:8080            *:*"#;
        let entries = parse_socket_table(out, SocketTableFormat::Ss);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1].pids, vec![1000, 1001]);
        let ports = listening_ports(&entries, 2, |_| None);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, 22);
        assert_eq!(ports[0].name, "sshd");
        assert_eq!(ports[1].name, "systemd-resolve");
        let all = listening_ports(&entries, 10, |_| None);
        assert_eq!(all[2].name, "-");
    }

    proptest! {
        #[test]
        fn millis_parse_matches_integer_input(ms in 0u64..100_000) {
            let line = format!("time={ms} ms");
            prop_assert_eq!(parse_ping_output(&line), Some(ms * 1000));
        }

        #[test]
        fn loss_is_bounded(samples in proptest::collection::vec(proptest::option::of(0u64..1_000_000), 0..80)) {
            let s = PingStats::from_samples(&samples);
            prop_assert!(s.loss_percent <= 100);
            if let Some(mean) = s.mean_us {
                prop_assert!(mean < 1_000_000);
            }
        }
    }
}
