//! App launcher: start, stop and batch-launch catalogue entries.

use crate::error::{Result, UmbraError};
use crate::scanner;
use serde::Serialize;
use std::time::Duration;
use sysinfo::{Pid, Signal, System, Users};
use tracing::{info, warn};
use umbra_core::apps::AppSelection;
use umbra_core::{AppCatalog, AppEntry, ProcessFilter, Settings};

/// Pause after terminating an app before it is started again.
const RELAUNCH_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LaunchOutcome {
    Started { pid: Option<u32> },
    AlreadyRunning { pids: Vec<u32> },
}

/// PIDs of running processes that belong to `entry`.
pub fn running_pids(system: &System, entry: &AppEntry) -> Vec<u32> {
    let mut pids: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(_, p)| {
            let exe = p.exe().map(|e| e.to_string_lossy().into_owned());
            entry.matches_process(&p.name().to_string_lossy(), exe.as_deref())
        })
        .map(|(pid, _)| pid.as_u32())
        .filter(|pid| *pid != std::process::id())
        .collect();
    pids.sort_unstable();
    pids
}

fn terminate(system: &System, pids: &[u32]) -> usize {
    pids.iter()
        .filter_map(|pid| system.process(Pid::from_u32(*pid)))
        .filter(|p| p.kill_with(Signal::Term).unwrap_or_else(|| p.kill()))
        .count()
}

/// Start an app. A running app is left alone unless `relaunch` is set, in
/// which case its processes are terminated first.
pub async fn launch(entry: &AppEntry, relaunch: bool) -> Result<LaunchOutcome> {
    let path = entry.path.trim();
    if path.is_empty() {
        return Err(UmbraError::Invalid(format!("{} has no path", entry.name)));
    }

    let system = System::new_all();
    let pids = running_pids(&system, entry);
    if !pids.is_empty() {
        if !relaunch {
            info!(app = %entry.name, ?pids, "already running, not launching");
            return Ok(LaunchOutcome::AlreadyRunning { pids });
        }
        let stopped = terminate(&system, &pids);
        info!(app = %entry.name, stopped, "terminated for relaunch");
        tokio::time::sleep(RELAUNCH_PAUSE).await;
    }

    let child = tokio::process::Command::new(path)
        .args(entry.argv())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| UmbraError::Invalid(format!("could not start {}: {e}", entry.name)))?;
    let pid = child.id();
    info!(app = %entry.name, ?pid, "app launched");
    Ok(LaunchOutcome::Started { pid })
}

/// Terminate every process of an app. Returns how many were signalled.
pub fn stop(entry: &AppEntry) -> usize {
    let system = System::new_all();
    let pids = running_pids(&system, entry);
    let stopped = terminate(&system, &pids);
    info!(app = %entry.name, stopped, "app stopped");
    stopped
}

/// Result for one app of a batch launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub name: String,
    /// Profile that was active while this app launched.
    pub profile: String,
    pub outcome: std::result::Result<LaunchOutcome, String>,
}

/// Launch a selection in catalogue order.
///
/// Apps with a launch profile are started with that profile active; the
/// profile that was active before the batch is restored at the end.
pub async fn launch_batch(
    settings: &mut Settings,
    selection: &AppSelection,
    relaunch: bool,
) -> Vec<BatchReport> {
    let entries: Vec<AppEntry> = settings
        .apps
        .select(selection)
        .into_iter()
        .cloned()
        .collect();
    let original = settings.active_profile().to_string();
    let mut reports = Vec::with_capacity(entries.len());

    for entry in entries {
        if let Some(profile) = entry.launch_profile() {
            settings.set_active_profile(profile);
        }
        let profile = settings.active_profile().to_string();
        let outcome = launch(&entry, relaunch).await;
        match &outcome {
            Ok(LaunchOutcome::Started { .. }) => {
                settings
                    .apps
                    .mark_launched(&entry.name, &umbra_core::timestamp());
            }
            Ok(LaunchOutcome::AlreadyRunning { .. }) => {}
            Err(e) => warn!(app = %entry.name, error = %e, "launch failed"),
        }
        reports.push(BatchReport {
            name: entry.name.clone(),
            profile,
            outcome: outcome.map_err(|e| e.to_string()),
        });
    }

    settings.set_active_profile(&original);
    reports
}

/// Add running user apps to the catalogue under `Detected`.
pub fn add_running(catalog: &mut AppCatalog) -> usize {
    let system = System::new_all();
    let users = Users::new_with_refreshed_list();
    let procs = ProcessFilter::AppsOnly.apply(
        &scanner::process_table(&system, &users),
        std::process::id(),
    );
    let added = procs
        .iter()
        .filter(|p| {
            p.exe
                .as_deref()
                .is_some_and(|exe| catalog.add_detected(&p.name, exe))
        })
        .count();
    info!(added, "running apps added");
    added
}

// =============================================================================
// TESTS
// =============================================================================
