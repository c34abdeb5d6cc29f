//! # Scanner
//!
//! Read-only views of the machine: processes with their socket counts,
//! interface counters and addresses, listening ports.
//!
//! Process and interface data come from `sysinfo`. Socket ownership comes
//! from the platform socket table (`netstat -ano` on Windows, `ss -tanpH`
//! elsewhere) because `sysinfo` does not expose it.

use crate::error::{Result, UmbraError};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use sysinfo::{Networks, Pid, System, Users};
use tracing::{debug, warn};
use umbra_core::netstats::{
    self, CounterSample, ListeningPort, SocketEntry, SocketTableFormat,
};
use umbra_core::routing::{self, InterfaceMeta, sort_by_activity};
use umbra_core::{ProcessFilter, ProcessInfo, Rate};

// =============================================================================
// SOCKETS
// =============================================================================

async fn command_stdout(program: &str, args: &[&str]) -> Result<String> {
    let out = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await?;
    if !out.status.success() && out.stdout.is_empty() {
        return Err(UmbraError::Invalid(format!(
            "{program} exited with {}",
            out.status
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Current TCP socket table.
pub async fn socket_table() -> Result<Vec<SocketEntry>> {
    let (program, args, format) = if cfg!(windows) {
        ("netstat", vec!["-ano", "-p", "TCP"], SocketTableFormat::Netstat)
    } else {
        ("ss", vec!["-tanpH"], SocketTableFormat::Ss)
    };
    let text = command_stdout(program, &args).await?;
    Ok(netstats::parse_socket_table(&text, format))
}

/// Process name lookup backed by one `sysinfo` snapshot.
pub struct ProcessNames {
    system: System,
}

impl ProcessNames {
    pub fn snapshot() -> Self {
        Self {
            system: System::new_all(),
        }
    }

    pub fn name_of(&self, pid: u32) -> Option<String> {
        self.system
            .process(Pid::from_u32(pid))
            .map(|p| p.name().to_string_lossy().into_owned())
    }
}

/// Listening TCP ports, ascending, at most `limit`.
pub async fn listening_ports(limit: usize) -> Result<Vec<ListeningPort>> {
    let entries = socket_table().await?;
    let names = ProcessNames::snapshot();
    Ok(netstats::listening_ports(&entries, limit, |pid| {
        names.name_of(pid)
    }))
}

// =============================================================================
// PROCESSES
// =============================================================================

/// Every process in `system`, without socket counts.
pub fn process_table(system: &System, users: &Users) -> Vec<ProcessInfo> {
    system
        .processes()
        .iter()
        .map(|(pid, p)| ProcessInfo {
            pid: pid.as_u32(),
            name: p.name().to_string_lossy().into_owned(),
            exe: p.exe().map(|e| e.to_string_lossy().into_owned()),
            user: p
                .user_id()
                .and_then(|uid| users.get_user_by_id(uid))
                .map(|u| u.name().to_string()),
            connections: 0,
        })
        .collect()
}

/// Attach socket counts and order the list for the routing view.
///
/// `only_active` drops processes without sockets.
pub fn rank_processes(
    mut procs: Vec<ProcessInfo>,
    counts: &BTreeMap<u32, usize>,
    filter: ProcessFilter,
    only_active: bool,
    self_pid: u32,
) -> Vec<ProcessInfo> {
    for p in &mut procs {
        p.connections = counts.get(&p.pid).copied().unwrap_or(0);
    }
    if only_active {
        procs.retain(|p| p.connections > 0);
    }
    sort_by_activity(&mut procs);
    filter.apply(&procs, self_pid)
}

/// Live process list for the routing view.
pub async fn scan_processes(filter: ProcessFilter, only_active: bool) -> Vec<ProcessInfo> {
    let counts = match socket_table().await {
        Ok(entries) => netstats::connection_counts(&entries),
        Err(e) => {
            warn!(error = %e, "socket table unavailable, connection counts are zero");
            BTreeMap::new()
        }
    };
    let system = System::new_all();
    let users = Users::new_with_refreshed_list();
    let procs = process_table(&system, &users);
    debug!(total = procs.len(), "process table read");
    rank_processes(procs, &counts, filter, only_active, std::process::id())
}

// =============================================================================
// INTERFACES
// =============================================================================

/// Sum of all interface counters now.
pub fn counter_sample() -> CounterSample {
    let networks = Networks::new_with_refreshed_list();
    let (rx_bytes, tx_bytes) = networks
        .iter()
        .fold((0u64, 0u64), |(rx, tx), (_, data)| {
            (
                rx.saturating_add(data.total_received()),
                tx.saturating_add(data.total_transmitted()),
            )
        });
    CounterSample {
        rx_bytes,
        tx_bytes,
        at_ms: umbra_core::epoch_millis(),
    }
}

/// Total down/up rate over `interval`. Reads counters only.
pub async fn network_rate(interval: Duration) -> (Rate, Rate) {
    let before = counter_sample();
    tokio::time::sleep(interval).await;
    counter_sample().rates_since(&before)
}

/// Default gateways from the platform routing table.
pub async fn default_gateways() -> BTreeMap<String, String> {
    let parsed = if cfg!(windows) {
        command_stdout("route", &["print", "-4"])
            .await
            .map(|t| routing::parse_route_print(&t))
    } else if cfg!(target_os = "macos") {
        command_stdout("route", &["-n", "get", "default"])
            .await
            .map(|t| routing::parse_route_get(&t))
    } else {
        command_stdout("ip", &["route", "show", "default"])
            .await
            .map(|t| routing::parse_ip_route(&t))
    };
    parsed.unwrap_or_else(|e| {
        warn!(error = %e, "could not read routing table");
        BTreeMap::new()
    })
}

/// IPv4 address, prefix and gateway per interface, sorted by name.
pub async fn interfaces() -> Vec<InterfaceMeta> {
    let gateways = default_gateways().await;
    let networks = Networks::new_with_refreshed_list();
    let mut out: Vec<InterfaceMeta> = networks
        .iter()
        .map(|(name, data)| {
            let v4 = data.ip_networks().iter().find_map(|n| match n.addr {
                IpAddr::V4(addr) => Some((addr, n.prefix)),
                IpAddr::V6(_) => None,
            });
            let gateway = gateways
                .get(name)
                .or_else(|| v4.and_then(|(addr, _)| gateways.get(&addr.to_string())))
                .map(String::as_str);
            InterfaceMeta::new(name, v4.map(|(a, _)| a), v4.map(|(_, p)| p), gateway)
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

// =============================================================================
// TESTS
// =============================================================================
