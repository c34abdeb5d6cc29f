//! # Engine
//!
//! The group of background tasks a user starts and stops as one unit.
//!
//! ## Tasks
//!
//! | Task | Period | Work |
//! |---|---|---|
//! | watchdog | 500 ms | polls the VPN core, logs an unexpected exit |
//! | monitor | 1 s | one ping to the dashboard target into the ping window |
//!
//! Neither task runs bandwidth tests; those live in [`crate::probe`] and need
//! consent. Stopping the engine cancels both tasks through a `watch`
//! channel, terminates the core process tree and joins the tasks with a
//! bounded timeout.

use crate::error::{Result, UmbraError};
use crate::probe::{Pinger, SystemPinger};
use crate::scanner;
use crate::store::AppPaths;
use serde::Serialize;
use serde_json::Value;
use std::process::Stdio;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, Signal, System};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use umbra_core::netstats::ListeningPort;
use umbra_core::release::Platform;
use umbra_core::settings::CoreUpdates;
use umbra_core::{CoreKind, PingStats, PingWindow, VpnConfig};

/// Watchdog poll period.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);

/// Monitor ping period.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Time a stopping core gets before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(3);

/// Time the tasks get to finish after cancellation.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

// =============================================================================
// STATUS TYPES
// =============================================================================

/// A running core as reported by [`EngineManager::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreStatus {
    pub pid: u32,
    pub core: String,
    pub config: String,
    pub started_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub core_process: Option<CoreStatus>,
    pub message: String,
}

/// Contents of the monitor's ping window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingReport {
    pub samples: Vec<Option<u64>>,
    pub stats: PingStats,
}

// =============================================================================
// CORE PROCESS
// =============================================================================

struct CoreHandle {
    child: Child,
    pid: u32,
    core: CoreKind,
    config: String,
    started_at: String,
}

impl CoreHandle {
    fn status(&self) -> CoreStatus {
        CoreStatus {
            pid: self.pid,
            core: self.core.as_str().to_string(),
            config: self.config.clone(),
            started_at: self.started_at.clone(),
        }
    }
}

type SharedCore = Arc<Mutex<Option<CoreHandle>>>;

/// Installed binary of a managed core, if present.
pub fn find_core_binary(paths: &AppPaths, dir_name: &str) -> Option<std::path::PathBuf> {
    let bin = paths
        .core_dir(dir_name)
        .join(Platform::current().exe_name(dir_name));
    bin.is_file().then_some(bin)
}

/// Every process below `root`, parents before their children.
fn descendants(system: &System, root: Pid) -> Vec<Pid> {
    let mut out = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, p) in system.processes() {
            if p.parent() == Some(parent) && *pid != root && !out.contains(pid) {
                out.push(*pid);
                frontier.push(*pid);
            }
        }
    }
    out
}

/// Ask a process to exit; falls back to a hard kill where SIGTERM is
/// unavailable.
fn terminate(system: &System, pid: Pid) -> bool {
    match system.process(pid) {
        Some(p) => p.kill_with(Signal::Term).unwrap_or_else(|| p.kill()),
        None => false,
    }
}

/// Children first, then the core itself; kill whatever survives the grace
/// period.
async fn stop_process_tree(handle: &mut CoreHandle) {
    let root = Pid::from_u32(handle.pid);
    let system = System::new_all();
    let children = descendants(&system, root);
    for pid in &children {
        terminate(&system, *pid);
    }
    if !terminate(&system, root) {
        let _ = handle.child.start_kill();
    }

    match tokio::time::timeout(STOP_GRACE, handle.child.wait()).await {
        Ok(Ok(status)) => info!(pid = handle.pid, %status, "core stopped"),
        Ok(Err(e)) => warn!(pid = handle.pid, error = %e, "could not wait for core"),
        Err(_) => {
            warn!(pid = handle.pid, "core ignored terminate, killing");
            if let Err(e) = handle.child.kill().await {
                error!(pid = handle.pid, error = %e, "core kill failed");
            }
        }
    }

    let system = System::new_all();
    for pid in children {
        if let Some(p) = system.process(pid) {
            p.kill();
        }
    }
}

/// Forward a core's output lines to the log.
fn forward_output<R>(reader: R, core: CoreKind)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(core = %core, "{line}");
        }
    });
}

// =============================================================================
// TASKS
// =============================================================================

async fn watchdog_loop(core: SharedCore, mut cancel: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(WATCHDOG_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            _ = tick.tick() => {
                let mut guard = core.lock().await;
                let exited = match guard.as_mut() {
                    Some(handle) => match handle.child.try_wait() {
                        Ok(Some(status)) => {
                            warn!(pid = handle.pid, core = %handle.core, %status, "core exited unexpectedly");
                            true
                        }
                        Ok(None) => false,
                        Err(e) => {
                            warn!(pid = handle.pid, error = %e, "core status unavailable");
                            false
                        }
                    },
                    None => false,
                };
                if exited {
                    *guard = None;
                }
            }
        }
    }
    debug!("watchdog stopped");
}

async fn monitor_loop<P: Pinger>(
    pinger: Arc<P>,
    host: String,
    window: Arc<std::sync::Mutex<PingWindow>>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(MONITOR_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            _ = tick.tick() => {
                let sample = tokio::select! {
                    _ = cancel.changed() => break,
                    sample = pinger.ping(&host) => sample,
                };
                window
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(sample);
            }
        }
    }
    debug!(host, "monitor stopped");
}

// =============================================================================
// ENGINE MANAGER
// =============================================================================

#[derive(Default)]
struct EngineInner {
    cancel: Option<watch::Sender<bool>>,
    tasks: JoinSet<()>,
    message: String,
}

/// Owner of the engine tasks and the VPN core process.
pub struct EngineManager<P = SystemPinger> {
    paths: AppPaths,
    pinger: Arc<P>,
    window: Arc<std::sync::Mutex<PingWindow>>,
    core: SharedCore,
    inner: Mutex<EngineInner>,
}

impl EngineManager<SystemPinger> {
    pub fn new(paths: AppPaths) -> Self {
        Self::with_pinger(paths, SystemPinger)
    }
}

impl<P: Pinger + 'static> EngineManager<P> {
    pub fn with_pinger(paths: AppPaths, pinger: P) -> Self {
        Self {
            paths,
            pinger: Arc::new(pinger),
            window: Arc::new(std::sync::Mutex::new(PingWindow::default())),
            core: Arc::new(Mutex::new(None)),
            inner: Mutex::new(EngineInner {
                message: "Engine stopped".to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    /// Start the watchdog and monitor. False when already running.
    pub async fn start(&self, monitor_host: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.cancel.is_some() {
            return false;
        }
        let (tx, rx) = watch::channel(false);
        inner
            .tasks
            .spawn(watchdog_loop(Arc::clone(&self.core), rx.clone()));
        inner.tasks.spawn(monitor_loop(
            Arc::clone(&self.pinger),
            monitor_host.to_string(),
            Arc::clone(&self.window),
            rx,
        ));
        inner.cancel = Some(tx);
        inner.message = format!("Engine running (monitor {monitor_host})");
        info!(monitor_host, "engine started");
        true
    }

    /// Cancel the tasks, stop the core, join. False when not running.
    pub async fn stop(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(cancel) = inner.cancel.take() else {
            return false;
        };
        let _ = cancel.send(true);
        self.stop_core().await;

        let tasks = &mut inner.tasks;
        let joined = tokio::time::timeout(JOIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!("engine tasks did not finish in time, aborting");
            inner.tasks.abort_all();
        }
        inner.message = "Engine stopped".to_string();
        info!("engine stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.cancel.is_some()
    }

    pub async fn status(&self) -> EngineStatus {
        let inner = self.inner.lock().await;
        let core = self.core.lock().await;
        EngineStatus {
            running: inner.cancel.is_some(),
            core_process: core.as_ref().map(CoreHandle::status),
            message: inner.message.clone(),
        }
    }

    /// Stop everything. Safe to call when nothing runs.
    pub async fn shutdown(&self) {
        if !self.stop().await {
            self.stop_core().await;
        }
    }

    pub fn ping_report(&self) -> PingReport {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        PingReport {
            samples: window.samples(),
            stats: window.stats(),
        }
    }

    // -------------------------------------------------------------------------
    // Core
    // -------------------------------------------------------------------------

    /// Launch the external core for `config`. Returns the core's PID.
    pub async fn start_core(&self, config: &VpnConfig, updates: &CoreUpdates) -> Result<u32> {
        if config.raw.trim().is_empty() {
            return Err(UmbraError::Engine("config is empty".to_string()));
        }
        let mut slot = self.core.lock().await;
        if let Some(handle) = slot.as_mut() {
            if matches!(handle.child.try_wait(), Ok(None)) {
                return Err(UmbraError::Engine(format!(
                    "{} is already running (pid {})",
                    handle.core, handle.pid
                )));
            }
        }

        let core = config.core.resolve();
        let mut command = match core {
            CoreKind::Singbox => self.singbox_command(config)?,
            CoreKind::Clash | CoreKind::OpenVpn | CoreKind::OpenConnect => {
                let configured = updates.path(core.as_str()).is_some()
                    || (core == CoreKind::Clash && find_core_binary(&self.paths, "mihomo").is_some());
                let reason = if configured {
                    "runtime not implemented"
                } else {
                    "binary path not configured"
                };
                return Err(UmbraError::Engine(format!("{core}: {reason}")));
            }
            other => {
                return Err(UmbraError::Engine(format!("unsupported core: {other}")));
            }
        };

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| UmbraError::Engine("core exited immediately".to_string()))?;
        if let Some(out) = child.stdout.take() {
            forward_output(out, core);
        }
        if let Some(err) = child.stderr.take() {
            forward_output(err, core);
        }

        info!(pid, core = %core, config = %config.name, "core started");
        *slot = Some(CoreHandle {
            child,
            pid,
            core,
            config: config.name.clone(),
            started_at: umbra_core::timestamp(),
        });
        Ok(pid)
    }

    fn singbox_command(&self, config: &VpnConfig) -> Result<Command> {
        let doc: Value = serde_json::from_str(config.raw.trim())
            .map_err(|_| UmbraError::Engine("sing-box needs a JSON config".to_string()))?;
        if !doc.is_object() {
            return Err(UmbraError::Engine("sing-box needs a JSON config".to_string()));
        }
        let bin = find_core_binary(&self.paths, "sing-box").ok_or_else(|| {
            UmbraError::Engine(format!(
                "sing-box binary not found in {}",
                self.paths.core_dir("sing-box").display()
            ))
        })?;

        let config_path = self.paths.active_singbox_config();
        std::fs::create_dir_all(self.paths.configs_dir())?;
        std::fs::write(&config_path, serde_json::to_string_pretty(&doc)?)?;

        let mut command = Command::new(bin);
        command.arg("run").arg("-c").arg(&config_path);
        Ok(command)
    }

    /// Stop the core process tree. False when no core was running.
    pub async fn stop_core(&self) -> bool {
        let mut slot = self.core.lock().await;
        match slot.as_mut() {
            Some(handle) => {
                stop_process_tree(handle).await;
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// Listening TCP ports, ascending.
    pub async fn listening_ports(&self, limit: usize) -> Result<Vec<ListeningPort>> {
        scanner::listening_ports(limit).await
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct FixedPinger(Option<u64>);

    impl Pinger for FixedPinger {
        async fn ping(&self, _host: &str) -> Option<u64> {
            self.0
        }
    }

    fn engine(dir: &tempfile::TempDir) -> EngineManager<FixedPinger> {
        EngineManager::with_pinger(AppPaths::new(dir.path()), FixedPinger(Some(15_000)))
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        assert!(!engine.stop().await);
        assert!(engine.start("1.1.1.1").await);
        assert!(!engine.start("1.1.1.1").await);
        assert!(engine.status().await.running);
        assert!(engine.stop().await);
        let status = engine.status().await;
        assert!(!status.running);
        assert!(status.core_process.is_none());
        assert_eq!(status.message, "Engine stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_fills_ping_window() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        engine.start("1.1.1.1").await;
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let report = engine.ping_report();
        assert!(report.samples.len() >= 3);
        assert_eq!(report.stats.mean_us, Some(15_000));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn start_core_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let updates = CoreUpdates::default();

        let empty = VpnConfig::default();
        assert!(engine.start_core(&empty, &updates).await.is_err());

        let link = VpnConfig::from_raw("vless://id@example.com:443", "manual");
        let err = engine.start_core(&link, &updates).await.unwrap_err();
        assert!(err.to_string().contains("JSON"));

        let json = VpnConfig::from_raw(r#"{"outbounds": []}"#, "manual");
        let err = engine.start_core(&json, &updates).await.unwrap_err();
        assert!(err.to_string().contains("binary not found"));

        let ovpn = VpnConfig::from_raw("client\nremote vpn.example 1194\n# openvpn", "manual");
        let err = engine.start_core(&ovpn, &updates).await.unwrap_err();
        assert!(err.to_string().contains("binary path not configured"));

        let mut with_path = CoreUpdates::default();
        with_path
            .paths
            .insert("openvpn".to_string(), "/usr/sbin/openvpn".to_string());
        let err = engine.start_core(&ovpn, &with_path).await.unwrap_err();
        assert!(err.to_string().contains("runtime not implemented"));
        assert!(!engine.stop_core().await);
    }
}
