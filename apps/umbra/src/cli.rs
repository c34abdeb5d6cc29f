//! # CLI
//!
//! `clap` command tree and one public `cmd_*` function per command.
//!
//! Settings commands load the document through [`SettingsStore`], mutate it
//! through `umbra-core` and save it back. Commands that put traffic on the
//! network take a [`Consent`] obtained from `--yes` or a prompt. `core
//! start|stop` drive the long-running `umbra serve` process over its
//! control API, since the core belongs to that process.

use crate::api::{self, AppState, DEFAULT_PORT, DEFAULT_RATE_LIMIT};
use crate::engine::EngineManager;
use crate::error::{Result, UmbraError};
use crate::launcher;
use crate::logging::LogRing;
use crate::probe::{self, Consent, SpeedtestPlan, SystemPinger};
use crate::scanner;
use crate::store::{AppPaths, SettingsStore};
use crate::subscription;
use crate::updater::{GITHUB_API, Updater};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use umbra_core::apps::{ALL_GROUPS, AppSelection};
use umbra_core::netstats::ports_summary;
use umbra_core::profiles;
use umbra_core::release::CoreRelease;
use umbra_core::routing::AUTO;
use umbra_core::settings::CloseAction;
use umbra_core::{AppRule, ConfigKind, CoreError, Priority, ProcessFilter, ProfileChange};

// =============================================================================
// COMMAND TREE
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "umbra", version, about = "Umbra network utility")]
pub struct Cli {
    /// Umbra home directory (configs/, cores/, logs/).
    #[arg(long, env = "UMBRA_HOME", default_value = ".", global = true)]
    pub home: PathBuf,

    /// Settings file; defaults to <home>/configs/settings.json.
    #[arg(long, env = "UMBRA_SETTINGS", global = true)]
    pub settings: Option<PathBuf>,

    /// Log directory; defaults to <home>/logs.
    #[arg(long, env = "UMBRA_LOG_DIR", global = true)]
    pub log_dir: Option<PathBuf>,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn paths(&self) -> AppPaths {
        AppPaths::new(&self.home)
    }

    pub fn store(&self) -> SettingsStore {
        SettingsStore::new(
            self.settings
                .clone()
                .unwrap_or_else(|| self.paths().settings_file()),
        )
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.paths().logs_dir())
    }
}

/// Control API address for commands that talk to `umbra serve`.
#[derive(Debug, Clone, Args)]
pub struct ApiTarget {
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
    #[arg(long, env = "UMBRA_API_KEY")]
    pub api_key: Option<String>,
}

/// Confirmation for network tests.
#[derive(Debug, Clone, Copy, Args)]
pub struct Confirm {
    /// Run without asking.
    #[arg(long, short = 'y')]
    pub yes: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create the home layout and a default settings file.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Settings summary.
    Status,
    /// First-run setup.
    Setup {
        /// Copilot mode: Basic, Helpful or Expert.
        #[arg(long)]
        copilot: Option<String>,
        /// Ping the first DNS servers once to seed the cache.
        #[arg(long)]
        dns_check: bool,
        #[command(flatten)]
        confirm: Confirm,
    },
    /// Run the engine in the foreground until Ctrl-C.
    Run,
    /// Serve the control API.
    Serve {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        #[arg(long, env = "UMBRA_API_KEY")]
        api_key: Option<String>,
        /// Requests per second.
        #[arg(long, default_value_t = DEFAULT_RATE_LIMIT)]
        rate_limit: u32,
        /// Start the engine right away.
        #[arg(long)]
        engine: bool,
    },
    /// Import configs from a file, or stdin when no file is given.
    Import {
        file: Option<PathBuf>,
        #[arg(long, default_value = "manual")]
        source: String,
    },
    /// List configs, optionally of one type.
    Configs {
        #[arg(long = "type")]
        kind: Option<String>,
    },
    /// Make a config the active profile's config.
    Activate { index: usize },
    /// Print or write the raw text of a config.
    Export {
        index: usize,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Subscriptions.
    Sub {
        #[command(subcommand)]
        action: SubAction,
    },
    /// VPN core of the running `umbra serve`.
    Core {
        #[command(subcommand)]
        action: CoreAction,
    },
    /// DNS catalogue.
    Dns {
        #[command(subcommand)]
        action: DnsAction,
    },
    /// Profiles.
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Per-app routing rules (recorded, not enforced).
    Route {
        #[command(subcommand)]
        action: RouteAction,
    },
    /// App launcher.
    Apps {
        #[command(subcommand)]
        action: AppsAction,
    },
    /// Settings snapshots.
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
    /// Safe ping test.
    Ping {
        /// Speed-test target index.
        #[arg(long, default_value_t = 0)]
        target: usize,
        /// Ping this host instead of a target.
        #[arg(long)]
        host: Option<String>,
        #[command(flatten)]
        confirm: Confirm,
    },
    /// Advanced download/upload test.
    Speedtest {
        #[arg(long, default_value_t = 0)]
        target: usize,
        #[command(flatten)]
        confirm: Confirm,
    },
    /// Install the latest sing-box or mihomo release.
    UpdateCore {
        /// singbox or clash.
        core: String,
        #[arg(long, default_value = GITHUB_API)]
        api_base: String,
    },
    /// Processes with network activity.
    Scan {
        /// apps, background or all.
        #[arg(long, default_value = "apps")]
        filter: String,
        #[arg(long)]
        only_active: bool,
    },
    /// Listening TCP ports.
    Ports {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Interface addresses and gateways.
    Interfaces,
    /// Recommended stream bitrate.
    Bitrate {
        #[arg(long, default_value = "Kick")]
        platform: String,
        /// Measured upload in kbps.
        upload_kbps: u64,
    },
    /// UI and behaviour preferences.
    Ui(UiUpdate),
}

#[derive(Debug, Subcommand)]
pub enum SubAction {
    Add { url: String },
    /// Fetch every subscription and import new configs.
    Update,
    List,
}

#[derive(Debug, Subcommand)]
pub enum CoreAction {
    Start {
        /// Config index; the active config when absent.
        index: Option<usize>,
        #[command(flatten)]
        api: ApiTarget,
    },
    Stop {
        #[command(flatten)]
        api: ApiTarget,
    },
}

#[derive(Debug, Subcommand)]
pub enum DnsAction {
    List,
    Add {
        server: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "AUTO")]
        loc: String,
    },
    Remove { index: usize },
    /// Replace the list with a preset (Mixed, Iran, Global, Privacy).
    Preset { name: String },
    /// Rank servers by ping.
    Optimize {
        #[command(flatten)]
        confirm: Confirm,
        /// Use the best server for the active profile without asking.
        #[arg(long)]
        accept: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProfileAction {
    List,
    Set { name: String },
    Apply {
        name: String,
        /// Confirm editing a predefined profile.
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

/// Fields of a routing rule; unset fields are `AUTO`.
#[derive(Debug, Clone, Args)]
pub struct RuleArgs {
    #[arg(long, default_value = AUTO)]
    pub dns: String,
    #[arg(long, default_value = AUTO)]
    pub vpn: String,
    #[arg(long, default_value = AUTO)]
    pub interface: String,
    /// Auto, High, Normal or Low.
    #[arg(long, default_value = "Auto")]
    pub priority: String,
}

impl RuleArgs {
    pub fn rule(&self) -> AppRule {
        AppRule {
            dns: self.dns.clone(),
            vpn: self.vpn.clone(),
            interface: self.interface.clone(),
            priority: Priority::from_name(&self.priority),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum RouteAction {
    Show { app: Option<String> },
    Set {
        app: String,
        #[command(flatten)]
        rule: RuleArgs,
    },
    ResetDns { app: String },
    /// Apply one rule to both OBS executables.
    Obs {
        #[command(flatten)]
        rule: RuleArgs,
    },
}

#[derive(Debug, Subcommand)]
pub enum AppsAction {
    List {
        #[arg(long)]
        group: Option<String>,
    },
    Add {
        name: String,
        path: String,
        #[arg(long, default_value = "")]
        args: String,
        #[arg(long, default_value = "")]
        group: String,
    },
    /// Add running user apps under "Detected".
    AddRunning,
    Remove { names: Vec<String> },
    Launch {
        names: Vec<String>,
        /// Every enabled app.
        #[arg(long, conflicts_with = "group")]
        enabled: bool,
        #[arg(long)]
        group: Option<String>,
        /// Terminate running instances first.
        #[arg(long)]
        relaunch: bool,
    },
    Stop { names: Vec<String> },
    Group {
        group: String,
        names: Vec<String>,
    },
    Profile {
        profile: String,
        names: Vec<String>,
    },
    Enable {
        names: Vec<String>,
        #[arg(long)]
        off: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum SnapshotAction {
    List,
    Create {
        #[arg(default_value = "")]
        label: String,
    },
    /// Roll back to a snapshot, the newest when no id is given.
    Rollback { id: Option<String> },
}

/// Preference changes; only the given flags are applied.
#[derive(Debug, Clone, Default, Args)]
pub struct UiUpdate {
    #[arg(long)]
    pub tray: Option<bool>,
    /// minimize_to_tray or exit.
    #[arg(long)]
    pub close_action: Option<String>,
    #[arg(long)]
    pub refresh: Option<bool>,
    #[arg(long)]
    pub refresh_interval: Option<u64>,
    #[arg(long)]
    pub pause_when_minimized: Option<bool>,
    #[arg(long)]
    pub show_bitrate: Option<bool>,
    #[arg(long)]
    pub auto_suggestions: Option<bool>,
    #[arg(long)]
    pub copilot: Option<String>,
    /// Suppress a copilot suggestion id.
    #[arg(long)]
    pub suppress: Option<String>,
    /// Manual port list, comma separated.
    #[arg(long)]
    pub port_override: Option<String>,
}

// =============================================================================
// OUTPUT
// =============================================================================

fn emit(json_mode: bool, value: &Value, text: impl FnOnce() -> String) -> Result<()> {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

fn ms(us: u64) -> String {
    umbra_core::netstats::format_tenths_ms(us)
}

// =============================================================================
// SETUP COMMANDS
// =============================================================================

/// Create `configs/`, `cores/`, `logs/` and a default settings file.
pub fn cmd_init(paths: &AppPaths, store: &SettingsStore, force: bool) -> Result<()> {
    if store.path().exists() && !force {
        return Err(UmbraError::Invalid(format!(
            "{} already exists (use --force to reset)",
            store.path().display()
        )));
    }
    for dir in [paths.configs_dir(), paths.cores_dir(), paths.logs_dir()] {
        std::fs::create_dir_all(dir)?;
    }
    let mut settings = umbra_core::Settings::default();
    store.save(&mut settings)?;
    info!(path = %store.path().display(), "settings initialised");
    println!("Initialised {}", store.path().display());
    Ok(())
}

pub fn cmd_status(store: &SettingsStore, json_mode: bool) -> Result<()> {
    let s = store.load()?;
    let value = json!({
        "settings": store.path().display().to_string(),
        "first_run_pending": s.is_first_run_pending(),
        "active_profile": s.active_profile(),
        "active_config": s.active_config().map(|c| c.name.clone()),
        "configs": s.configs.len(),
        "subscriptions": s.subscriptions.len(),
        "dns_servers": s.dns.servers.len(),
        "apps": s.apps.all().count(),
        "snapshots": s.history.snapshots.len(),
        "copilot": s.copilot_mode().as_str(),
        "updated_at": s.meta.updated_at,
    });
    emit(json_mode, &value, || {
        format!(
            "Settings:      {}\nFirst run:     {}\nProfile:       {}\nActive config: {}\nConfigs:       {}\nDNS servers:   {}\nApps:          {}\nSnapshots:     {}\nCopilot:       {}",
            store.path().display(),
            if s.is_first_run_pending() { "pending" } else { "done" },
            s.active_profile(),
            s.active_config().map_or("-", |c| c.name.as_str()),
            s.configs.len(),
            s.dns.servers.len(),
            s.apps.all().count(),
            s.history.snapshots.len(),
            s.copilot_mode(),
        )
    })
}

/// Finish first-run setup. With `dns_check` consent, one ping per server
/// seeds the DNS cache first.
pub async fn cmd_setup(
    store: &SettingsStore,
    copilot: Option<&str>,
    dns_check: Option<Consent>,
) -> Result<()> {
    let mut settings = store.load()?;
    if let Some(mode) = copilot {
        settings.set_copilot_mode(mode);
    }
    if let Some(consent) = dns_check {
        let results = probe::first_run_dns_check(&SystemPinger, &settings.dns.servers, consent).await;
        for (server, ping) in &results {
            println!("{server:<16} {}", ping.map_or("timeout".to_string(), ms));
        }
        settings
            .dns
            .record_safe_ping(&results, &umbra_core::timestamp());
    }
    settings.mark_first_run_completed();
    store.save(&mut settings)?;
    println!("Setup complete (copilot: {})", settings.copilot_mode());
    Ok(())
}

/// Engine in the foreground; Ctrl-C stops it.
pub async fn cmd_run(paths: &AppPaths, store: &SettingsStore) -> Result<()> {
    let host = store.load()?.speedtest.monitor_host();
    let engine = EngineManager::new(paths.clone());
    engine.start(&host).await;
    println!("Engine running (monitor {host}); press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    engine.shutdown().await;
    let report = engine.ping_report();
    println!("{}", report.stats);
    Ok(())
}

pub async fn cmd_serve(
    paths: &AppPaths,
    store: &SettingsStore,
    ring: LogRing,
    port: u16,
    api_key: Option<String>,
    rate_limit: u32,
    start_engine: bool,
) -> Result<()> {
    let engine = Arc::new(EngineManager::new(paths.clone()));
    if start_engine {
        engine.start(&store.load()?.speedtest.monitor_host()).await;
    }
    let state = AppState::new(store.clone(), engine, ring)
        .with_api_key(api_key)
        .with_rate_limit(rate_limit);
    api::serve(state, port).await
}

// =============================================================================
// CONFIG COMMANDS
// =============================================================================

/// Smart import of pasted text.
pub fn cmd_import(store: &SettingsStore, text: &str, source: &str) -> Result<()> {
    let added = store.update(|s| s.import_smart_input(text, source))?;
    info!(added, source, "configs imported");
    println!("Imported {added} config(s)");
    Ok(())
}

/// [`cmd_import`] from a file, or stdin when `file` is `None`.
pub fn cmd_import_file(store: &SettingsStore, file: Option<&Path>, source: &str) -> Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)?,
        None => std::io::read_to_string(std::io::stdin())?,
    };
    cmd_import(store, &text, source)
}

pub fn cmd_configs(store: &SettingsStore, kind: Option<&str>, json_mode: bool) -> Result<()> {
    let s = store.load()?;
    let filter = kind
        .filter(|k| !k.eq_ignore_ascii_case("all"))
        .map(ConfigKind::from_name);
    let items = s.configs_of_kind(filter);
    let value = json!(items
        .iter()
        .map(|(i, c)| json!({"index": i, "name": c.name, "type": c.kind, "core": c.core}))
        .collect::<Vec<_>>());
    emit(json_mode, &value, || {
        let mut out = String::new();
        for (i, c) in &items {
            out.push_str(&format!("{i:>3}  {:<12} {:<8} {}\n", c.kind.as_str(), c.core.as_str(), c.name));
        }
        let counts = s.protocol_counts();
        let summary: Vec<String> = umbra_core::configs::COUNTED_KINDS
            .iter()
            .map(|k| format!("{}: {}", k, counts.get(k).copied().unwrap_or(0)))
            .collect();
        out.push_str(&format!("{} config(s) | {}", items.len(), summary.join(" | ")));
        out
    })
}

pub fn cmd_activate(store: &SettingsStore, index: usize) -> Result<()> {
    let name = store.update(|s| {
        s.set_active_config(index)?;
        Ok::<_, CoreError>(s.active_config().map(|c| c.name.clone()).unwrap_or_default())
    })??;
    println!("Active config: {name}");
    Ok(())
}

pub fn cmd_export(store: &SettingsStore, index: usize, output: Option<&Path>) -> Result<()> {
    let s = store.load()?;
    let raw = s.export_config(index)?;
    match output {
        Some(path) => {
            std::fs::write(path, raw)?;
            println!("Exported config {index} to {}", path.display());
        }
        None => println!("{raw}"),
    }
    Ok(())
}

pub fn cmd_sub_add(store: &SettingsStore, url: &str) -> Result<()> {
    if store.update(|s| s.add_subscription(url))? {
        println!("Subscription added");
    } else {
        println!("Subscription already present or empty");
    }
    Ok(())
}

pub fn cmd_sub_list(store: &SettingsStore, json_mode: bool) -> Result<()> {
    let s = store.load()?;
    emit(json_mode, &json!(s.subscriptions), || {
        if s.subscriptions.is_empty() {
            "No subscriptions".to_string()
        } else {
            s.subscriptions.join("\n")
        }
    })
}

pub async fn cmd_sub_update(store: &SettingsStore, client: &reqwest::Client) -> Result<()> {
    let mut settings = store.load()?;
    let reports = subscription::update_all(client, &mut settings).await;
    store.save(&mut settings)?;
    for r in &reports {
        match &r.outcome {
            Ok(n) => println!("{}: {n} new", r.url),
            Err(e) => println!("{}: failed ({e})", r.url),
        }
    }
    Ok(())
}

// =============================================================================
// CORE COMMANDS (via control API)
// =============================================================================

/// Minimal client for a running `umbra serve`.
#[derive(Debug, Clone)]
pub struct ControlClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ControlClient {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn local(client: reqwest::Client, target: &ApiTarget) -> Self {
        Self::new(
            client,
            &format!("http://127.0.0.1:{}", target.port),
            target.api_key.clone(),
        )
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        let value: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = value["error"].as_str().unwrap_or("request failed");
            return Err(UmbraError::Engine(format!("{status}: {message}")));
        }
        Ok(value)
    }
}

pub async fn cmd_core_start(control: &ControlClient, index: Option<usize>) -> Result<()> {
    let reply = control.post("/core/start", &json!({ "index": index })).await?;
    println!(
        "Core started: {} (pid {})",
        reply["config"].as_str().unwrap_or("-"),
        reply["pid"]
    );
    Ok(())
}

pub async fn cmd_core_stop(control: &ControlClient) -> Result<()> {
    let reply = control.post("/core/stop", &json!({})).await?;
    if reply["stopped"].as_bool().unwrap_or(false) {
        println!("Core stopped");
    } else {
        println!("No core was running");
    }
    Ok(())
}

// =============================================================================
// DNS COMMANDS
// =============================================================================

pub fn cmd_dns_list(store: &SettingsStore, json_mode: bool) -> Result<()> {
    let s = store.load()?;
    emit(json_mode, &json!(s.dns.servers), || {
        s.dns
            .servers
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let cached = s
                    .dns
                    .rank_cache
                    .safe_ping
                    .get(&d.server)
                    .and_then(|p| p.ping_us)
                    .map(ms)
                    .unwrap_or_default();
                format!("{i:>3}  {:<34} {cached}", d.label())
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

pub fn cmd_dns_add(store: &SettingsStore, name: &str, server: &str, loc: &str) -> Result<()> {
    store.update(|s| s.dns.add_dns(name, server, loc))??;
    println!("DNS server {server} added");
    Ok(())
}

pub fn cmd_dns_remove(store: &SettingsStore, index: usize) -> Result<()> {
    if !store.update(|s| s.dns.remove_dns(index))? {
        return Err(UmbraError::Invalid(format!("no DNS server at index {index}")));
    }
    println!("DNS server {index} removed");
    Ok(())
}

pub fn cmd_dns_preset(store: &SettingsStore, name: &str) -> Result<()> {
    let n = store.update(|s| s.dns.apply_preset(name))??;
    println!("Preset {name} applied ({n} servers)");
    Ok(())
}

/// Rank the configured servers and offer the best one.
///
/// The suggestion is applied to the active profile only with `accept`, or
/// when the user says yes at the prompt. Without a terminal (or in JSON
/// mode) an unaccepted suggestion is only reported.
pub async fn cmd_dns_optimize(
    store: &SettingsStore,
    consent: Consent,
    accept: bool,
    json_mode: bool,
) -> Result<()> {
    let servers = store.load()?.dns.servers;
    let ranked = probe::optimize_dns(&SystemPinger, &servers, consent).await;
    let suggestion = store.update(|s| probe::store_ranking(s, &ranked))?;

    if !json_mode {
        for r in &ranked {
            println!(
                "{:<24} {:<16} ping {} ms | jitter {} ms | loss {}%",
                r.name,
                r.server,
                ms(r.ping_us),
                ms(r.jitter_us),
                r.loss_percent
            );
        }
    }

    let accepted = match &suggestion {
        None => false,
        Some(_) if accept => true,
        Some(best) if !json_mode && std::io::stdin().is_terminal() => probe::ask(&format!(
            "Use {} ({}) as DNS for the active profile?",
            best.name, best.server
        ))?,
        Some(_) => false,
    };
    if let Some(best) = suggestion.as_ref().filter(|_| accepted) {
        store.update(|s| s.accept_dns_suggestion(best))?;
        info!(server = %best.server, "DNS suggestion accepted");
    }

    let suggested = suggestion.as_ref().map(|b| b.server.clone());
    emit(
        json_mode,
        &json!({"ranking": ranked, "suggested": suggested, "accepted": accepted}),
        || match (&suggested, accepted) {
            (Some(server), true) => format!("Suggested DNS for the active profile: {server}"),
            (Some(server), false) => {
                format!("Best DNS: {server} (not applied; rerun with --accept to use it)")
            }
            (None, _) => "No suggestion".to_string(),
        },
    )
}

// =============================================================================
// PROFILE COMMANDS
// =============================================================================

pub fn cmd_profile_list(store: &SettingsStore, json_mode: bool) -> Result<()> {
    let s = store.load()?;
    emit(json_mode, &json!(s.profiles), || {
        s.profiles
            .items
            .iter()
            .map(|(name, p)| {
                let marker = if name == s.active_profile() { "*" } else { " " };
                let lock = if p.readonly { " (read-only)" } else { "" };
                format!("{marker} {name}{lock}: {}", p.notes)
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

pub fn cmd_profile_set(store: &SettingsStore, name: &str) -> Result<()> {
    store.update(|s| {
        if !s.profiles.items.contains_key(name.trim()) {
            return Err(CoreError::UnknownProfile(name.to_string()));
        }
        s.set_active_profile(name);
        Ok(())
    })??;
    println!("Active profile: {}", name.trim());
    Ok(())
}

pub fn cmd_profile_apply(store: &SettingsStore, name: &str, confirmed: bool) -> Result<()> {
    let change = store.update(|s| s.apply_profile(name, confirmed))??;
    match change {
        ProfileChange::Switched(p) => println!("Switched to {p}"),
        ProfileChange::Unchanged(p) => println!("{p} is already active"),
        ProfileChange::NeedsConfirmation(p) => {
            println!("{p} is read-only; re-run with --yes to copy it into Custom");
        }
        ProfileChange::RedirectedToCustom { from } => {
            println!("{from} copied into Custom, which is now active");
        }
    }
    Ok(())
}

// =============================================================================
// ROUTING COMMANDS
// =============================================================================

pub fn cmd_route_show(store: &SettingsStore, app: Option<&str>, json_mode: bool) -> Result<()> {
    let s = store.load()?;
    let apps = match app {
        Some(a) => vec![a.to_string()],
        None => s.routed_apps(),
    };
    let rules: Vec<(String, AppRule)> = apps
        .into_iter()
        .map(|a| {
            let rule = s.rule_for(&a);
            (a, rule)
        })
        .collect();
    let value = json!(rules
        .iter()
        .map(|(a, r)| json!({"app": a, "rule": r}))
        .collect::<Vec<_>>());
    emit(json_mode, &value, || {
        if rules.is_empty() {
            return "No routing rules recorded".to_string();
        }
        rules
            .iter()
            .map(|(a, r)| {
                format!(
                    "{a:<24} dns={} vpn={} iface={} priority={}",
                    r.dns, r.vpn, r.interface, r.priority
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

pub fn cmd_route_set(store: &SettingsStore, app: &str, rule: &AppRule) -> Result<()> {
    if !store.update(|s| s.apply_rule(app, rule))? {
        return Err(UmbraError::Invalid("app name is empty".to_string()));
    }
    println!("Rule recorded for {}", app.trim());
    Ok(())
}

pub fn cmd_route_reset_dns(store: &SettingsStore, app: &str) -> Result<()> {
    if store.update(|s| s.reset_dns(app))? {
        println!("DNS choice for {} reset to {AUTO}", app.trim());
    } else {
        println!("No DNS choice recorded for {}", app.trim());
    }
    Ok(())
}

pub fn cmd_route_obs(store: &SettingsStore, rule: &AppRule) -> Result<()> {
    store.update(|s| s.apply_obs_quick_profile(rule))?;
    println!("OBS quick profile recorded");
    Ok(())
}

// =============================================================================
// APP COMMANDS
// =============================================================================

pub fn cmd_apps_list(store: &SettingsStore, group: Option<&str>, json_mode: bool) -> Result<()> {
    let s = store.load()?;
    let apps: Vec<_> = match group.filter(|g| *g != ALL_GROUPS) {
        Some(g) => s.apps.select(&AppSelection::Group(g.to_string())),
        None => s.apps.all().collect(),
    };
    emit(json_mode, &json!(apps), || {
        apps.iter()
            .map(|a| {
                let last = s.apps.last_launch.get(&a.name).map_or("-", String::as_str);
                format!(
                    "[{}] {:<20} {:<10} profile={:<9} last={last}  {}",
                    if a.enabled { "x" } else { " " },
                    a.name,
                    a.group(),
                    a.profile,
                    a.path
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

pub fn cmd_apps_add(store: &SettingsStore, name: &str, path: &str, args: &str, group: &str) -> Result<()> {
    store.update(|s| s.apps.add(name, path, args, group).map(|_| ()))??;
    println!("App {} added", name.trim());
    Ok(())
}

pub fn cmd_apps_add_running(store: &SettingsStore) -> Result<()> {
    let added = store.update(|s| launcher::add_running(&mut s.apps))?;
    println!("Added {added} running app(s)");
    Ok(())
}

pub fn cmd_apps_remove(store: &SettingsStore, names: &[String]) -> Result<()> {
    let removed = store.update(|s| s.apps.remove(names))?;
    println!("Removed {removed} app(s)");
    Ok(())
}

/// Selection from CLI flags: explicit names, `--enabled` or `--group`.
pub fn app_selection(names: &[String], enabled: bool, group: Option<&str>) -> Result<AppSelection> {
    match (names.is_empty(), enabled, group) {
        (false, _, _) => Ok(AppSelection::Names(names.to_vec())),
        (true, true, _) => Ok(AppSelection::Enabled),
        (true, false, Some(g)) => Ok(AppSelection::Group(g.to_string())),
        (true, false, None) => Err(UmbraError::Invalid(
            "name apps, or pass --enabled or --group".to_string(),
        )),
    }
}

pub async fn cmd_apps_launch(store: &SettingsStore, selection: &AppSelection, relaunch: bool) -> Result<()> {
    let mut settings = store.load()?;
    if let AppSelection::Names(names) = selection {
        settings.apps.remember_selection(names);
    }
    if let AppSelection::Group(g) = selection {
        settings.apps.remember_group(g);
    }
    let reports = launcher::launch_batch(&mut settings, selection, relaunch).await;
    store.save(&mut settings)?;
    if reports.is_empty() {
        println!("No apps selected");
    }
    for r in reports {
        match r.outcome {
            Ok(launcher::LaunchOutcome::Started { pid }) => {
                println!("{}: started (pid {}, profile {})", r.name, pid.map_or("-".to_string(), |p| p.to_string()), r.profile);
            }
            Ok(launcher::LaunchOutcome::AlreadyRunning { pids }) => {
                println!("{}: already running {pids:?}", r.name);
            }
            Err(e) => println!("{}: {e}", r.name),
        }
    }
    Ok(())
}

pub fn cmd_apps_stop(store: &SettingsStore, names: &[String]) -> Result<()> {
    let s = store.load()?;
    for app in s.apps.select(&AppSelection::Names(names.to_vec())) {
        let n = launcher::stop(app);
        println!("{}: {n} process(es) signalled", app.name);
    }
    Ok(())
}

pub fn cmd_apps_group(store: &SettingsStore, names: &[String], group: &str) -> Result<()> {
    let n = store.update(|s| s.apps.move_to_group(names, group))?;
    println!("Moved {n} app(s)");
    Ok(())
}

pub fn cmd_apps_profile(store: &SettingsStore, names: &[String], profile: &str) -> Result<()> {
    let n = store.update(|s| s.apps.set_profile(names, profile))?;
    println!("Updated {n} app(s)");
    Ok(())
}

pub fn cmd_apps_enable(store: &SettingsStore, names: &[String], enabled: bool) -> Result<()> {
    let n = store.update(|s| s.apps.set_enabled(names, enabled))?;
    println!("{} {n} app(s)", if enabled { "Enabled" } else { "Disabled" });
    Ok(())
}

// =============================================================================
// SNAPSHOT COMMANDS
// =============================================================================

pub fn cmd_snapshot_list(store: &SettingsStore, json_mode: bool) -> Result<()> {
    let s = store.load()?;
    let value = json!(s
        .history
        .snapshots
        .iter()
        .map(|snap| json!({"id": snap.id, "at": snap.at, "label": snap.label}))
        .collect::<Vec<_>>());
    emit(json_mode, &value, || {
        if s.history.snapshots.is_empty() {
            return "No snapshots".to_string();
        }
        s.history
            .snapshots
            .iter()
            .map(|snap| format!("{}  {}  {}", snap.id, snap.at, snap.label))
            .collect::<Vec<_>>()
            .join("\n")
    })
}

pub fn cmd_snapshot_create(store: &SettingsStore, label: &str) -> Result<()> {
    let id = store.update(|s| s.create_snapshot(label))??;
    println!("Snapshot {id} created");
    Ok(())
}

pub fn cmd_snapshot_rollback(store: &SettingsStore, id: Option<&str>) -> Result<()> {
    let restored = store.update(|s| match id {
        Some(id) => s.rollback_snapshot(id).map(|()| id.to_string()),
        None => s.rollback_last(),
    })??;
    println!("Rolled back to snapshot {restored}");
    Ok(())
}

// =============================================================================
// NETWORK TEST COMMANDS
// =============================================================================

pub async fn cmd_ping(
    store: &SettingsStore,
    target: usize,
    host: Option<&str>,
    consent: Consent,
    json_mode: bool,
) -> Result<()> {
    let host = match host.map(str::trim).filter(|h| !h.is_empty()) {
        Some(h) => h.to_string(),
        None => store.load()?.speedtest.ping_host(target),
    };
    let stats = probe::safe_ping_test(&SystemPinger, &host, consent).await;
    emit(json_mode, &json!({"host": host, "stats": stats}), || {
        format!("{host}: {stats}")
    })
}

pub async fn cmd_speedtest(
    store: &SettingsStore,
    client: &reqwest::Client,
    target: usize,
    consent: Consent,
    json_mode: bool,
) -> Result<()> {
    let settings = store.load()?;
    let plan = SpeedtestPlan::from_settings(&settings, target);
    let result = probe::speedtest(client, &plan, consent).await?;

    let platform = settings
        .profiles
        .active_entry()
        .and_then(|p| p.platform.clone())
        .unwrap_or_else(|| profiles::PLATFORMS[0].to_string());
    let bitrate = result
        .upload
        .map(|up| profiles::recommended_bitrate_kbps(&platform, up.kbps()));

    emit(
        json_mode,
        &json!({
            "download_bps": result.download.bps(),
            "upload_bps": result.upload.map(|r| r.bps()),
            "downloaded_bytes": result.downloaded,
            "recommended_bitrate_kbps": bitrate,
            "platform": platform,
        }),
        || {
            let mut out = format!("Download: {}", result.download);
            match result.upload {
                Some(up) => out.push_str(&format!("\nUpload:   {up}")),
                None => out.push_str("\nUpload:   failed"),
            }
            if let Some(kbps) = bitrate {
                out.push_str(&format!("\nRecommended {platform} bitrate: {kbps} kbps"));
            }
            out
        },
    )
}

pub fn cmd_bitrate(platform: &str, upload_kbps: u64) -> Result<()> {
    let kbps = profiles::recommended_bitrate_kbps(platform, upload_kbps);
    println!(
        "{platform}: {kbps} kbps (cap {} kbps)",
        profiles::platform_cap_kbps(platform)
    );
    Ok(())
}

// =============================================================================
// CORE UPDATE
// =============================================================================

pub async fn cmd_update_core(
    paths: &AppPaths,
    store: &SettingsStore,
    client: &reqwest::Client,
    core: &str,
    api_base: &str,
) -> Result<()> {
    let release = CoreRelease::from_key(core)
        .ok_or_else(|| UmbraError::Invalid(format!("unknown core {core} (use singbox or clash)")))?;
    let settings = store.load()?;
    let updater = Updater::new(client.clone(), paths.clone()).with_api_base(api_base);
    let outcome = updater.update(release, &settings.core_updates).await?;
    println!(
        "{} updated to {} ({})",
        outcome.core,
        outcome.tag,
        outcome.binary.display()
    );
    if let Some(backup) = outcome.backup {
        println!("Previous binary saved to {}", backup.display());
    }
    Ok(())
}

// =============================================================================
// SCANNER COMMANDS
// =============================================================================

pub fn process_filter(name: &str) -> Result<ProcessFilter> {
    match name.trim().to_ascii_lowercase().as_str() {
        "apps" | "apps_only" => Ok(ProcessFilter::AppsOnly),
        "background" | "apps_and_background" => Ok(ProcessFilter::AppsAndBackground),
        "all" | "services" | "include_services" => Ok(ProcessFilter::IncludeServices),
        other => Err(UmbraError::Invalid(format!(
            "unknown filter {other} (use apps, background or all)"
        ))),
    }
}

pub async fn cmd_scan(filter: ProcessFilter, only_active: bool, json_mode: bool) -> Result<()> {
    let procs = scanner::scan_processes(filter, only_active).await;
    emit(json_mode, &json!(procs), || {
        procs
            .iter()
            .map(|p| format!("{:>7}  {:>4}  {}", p.pid, p.connections, p.name))
            .collect::<Vec<_>>()
            .join("\n")
    })
}

pub async fn cmd_ports(store: &SettingsStore, limit: usize, json_mode: bool) -> Result<()> {
    let ports = scanner::listening_ports(limit).await?;
    let port_override = store.load()?.engine.port_override;
    emit(
        json_mode,
        &json!({"ports": ports, "port_override": port_override}),
        || {
            let mut out = format!("Listening: {}", ports_summary(&ports));
            if !port_override.is_empty() {
                out.push_str(&format!("\nOverride:  {port_override}"));
            }
            out
        },
    )
}

pub async fn cmd_interfaces(json_mode: bool) -> Result<()> {
    let interfaces = scanner::interfaces().await;
    emit(json_mode, &json!(interfaces), || {
        interfaces
            .iter()
            .map(|i| format!("{:<16} {}", i.name, i.summary()))
            .collect::<Vec<_>>()
            .join("\n")
    })
}

// =============================================================================
// PREFERENCES
// =============================================================================

pub fn cmd_ui(store: &SettingsStore, update: &UiUpdate, json_mode: bool) -> Result<()> {
    let settings = store.update(|s| {
        if let Some(v) = update.tray {
            s.ui.tray_enabled = v;
        }
        if let Some(v) = &update.close_action {
            s.ui.close_action = CloseAction::from(v.clone());
        }
        if let Some(v) = update.refresh {
            s.ui.refresh_enabled = v;
        }
        if let Some(v) = update.refresh_interval {
            s.ui.refresh_interval_s = v;
        }
        if let Some(v) = update.pause_when_minimized {
            s.ui.pause_refresh_when_minimized = v;
        }
        if let Some(v) = update.show_bitrate {
            s.ui.show_stream_bitrate_on_dashboard = v;
        }
        if let Some(v) = update.auto_suggestions {
            s.behavior.auto_suggestions = v;
        }
        if let Some(v) = &update.copilot {
            s.set_copilot_mode(v);
        }
        if let Some(v) = &update.suppress {
            s.suppress_suggestion(v);
        }
        if let Some(v) = &update.port_override {
            s.set_port_override(v);
        }
        s.clone()
    })?;
    emit(
        json_mode,
        &json!({"ui": settings.ui, "behavior": settings.behavior, "copilot": settings.copilot}),
        || {
            format!(
                "Tray: {} | Close: {} | Refresh: {} every {}s | Pause hidden: {} | Suggestions: {} | Copilot: {}",
                settings.ui.tray_enabled,
                settings.ui.close_action.as_str(),
                settings.ui.refresh_enabled,
                settings.ui.refresh_interval_s,
                settings.ui.pause_refresh_when_minimized,
                settings.behavior.auto_suggestions,
                settings.copilot_mode(),
            )
        },
    )
}

// =============================================================================
// DISPATCH
// =============================================================================

fn consent(confirm: Confirm, what: &str) -> Result<Consent> {
    Consent::obtain(confirm.yes, &format!("{what} sends network traffic. Continue?"))
}

/// Run a parsed command line.
pub async fn run(cli: Cli, ring: LogRing) -> Result<()> {
    let paths = cli.paths();
    let store = cli.store();
    let json_mode = cli.json;
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Init { force } => cmd_init(&paths, &store, force),
        Commands::Status => cmd_status(&store, json_mode),
        Commands::Setup {
            copilot,
            dns_check,
            confirm,
        } => {
            let check = if dns_check {
                Some(consent(confirm, "The first-run DNS check")?)
            } else {
                None
            };
            cmd_setup(&store, copilot.as_deref(), check).await
        }
        Commands::Run => cmd_run(&paths, &store).await,
        Commands::Serve {
            port,
            api_key,
            rate_limit,
            engine,
        } => cmd_serve(&paths, &store, ring, port, api_key, rate_limit, engine).await,
        Commands::Import { file, source } => cmd_import_file(&store, file.as_deref(), &source),
        Commands::Configs { kind } => cmd_configs(&store, kind.as_deref(), json_mode),
        Commands::Activate { index } => cmd_activate(&store, index),
        Commands::Export { index, output } => cmd_export(&store, index, output.as_deref()),
        Commands::Sub { action } => match action {
            SubAction::Add { url } => cmd_sub_add(&store, &url),
            SubAction::Update => cmd_sub_update(&store, &client).await,
            SubAction::List => cmd_sub_list(&store, json_mode),
        },
        Commands::Core { action } => match action {
            CoreAction::Start { index, api } => {
                cmd_core_start(&ControlClient::local(client, &api), index).await
            }
            CoreAction::Stop { api } => cmd_core_stop(&ControlClient::local(client, &api)).await,
        },
        Commands::Dns { action } => match action {
            DnsAction::List => cmd_dns_list(&store, json_mode),
            DnsAction::Add { server, name, loc } => cmd_dns_add(&store, &name, &server, &loc),
            DnsAction::Remove { index } => cmd_dns_remove(&store, index),
            DnsAction::Preset { name } => cmd_dns_preset(&store, &name),
            DnsAction::Optimize { confirm, accept } => {
                let consent = consent(confirm, "DNS optimisation")?;
                cmd_dns_optimize(&store, consent, accept, json_mode).await
            }
        },
        Commands::Profile { action } => match action {
            ProfileAction::List => cmd_profile_list(&store, json_mode),
            ProfileAction::Set { name } => cmd_profile_set(&store, &name),
            ProfileAction::Apply { name, yes } => cmd_profile_apply(&store, &name, yes),
        },
        Commands::Route { action } => match action {
            RouteAction::Show { app } => cmd_route_show(&store, app.as_deref(), json_mode),
            RouteAction::Set { app, rule } => cmd_route_set(&store, &app, &rule.rule()),
            RouteAction::ResetDns { app } => cmd_route_reset_dns(&store, &app),
            RouteAction::Obs { rule } => cmd_route_obs(&store, &rule.rule()),
        },
        Commands::Apps { action } => match action {
            AppsAction::List { group } => cmd_apps_list(&store, group.as_deref(), json_mode),
            AppsAction::Add {
                name,
                path,
                args,
                group,
            } => cmd_apps_add(&store, &name, &path, &args, &group),
            AppsAction::AddRunning => cmd_apps_add_running(&store),
            AppsAction::Remove { names } => cmd_apps_remove(&store, &names),
            AppsAction::Launch {
                names,
                enabled,
                group,
                relaunch,
            } => {
                let selection = app_selection(&names, enabled, group.as_deref())?;
                cmd_apps_launch(&store, &selection, relaunch).await
            }
            AppsAction::Stop { names } => cmd_apps_stop(&store, &names),
            AppsAction::Group { group, names } => cmd_apps_group(&store, &names, &group),
            AppsAction::Profile { profile, names } => cmd_apps_profile(&store, &names, &profile),
            AppsAction::Enable { names, off } => cmd_apps_enable(&store, &names, !off),
        },
        Commands::Snapshot { action } => match action {
            SnapshotAction::List => cmd_snapshot_list(&store, json_mode),
            SnapshotAction::Create { label } => cmd_snapshot_create(&store, &label),
            SnapshotAction::Rollback { id } => cmd_snapshot_rollback(&store, id.as_deref()),
        },
        Commands::Ping {
            target,
            host,
            confirm,
        } => {
            let consent = consent(confirm, "The ping test")?;
            cmd_ping(&store, target, host.as_deref(), consent, json_mode).await
        }
        Commands::Speedtest { target, confirm } => {
            let consent = consent(confirm, "The speed test")?;
            cmd_speedtest(&store, &client, target, consent, json_mode).await
        }
        Commands::UpdateCore { core, api_base } => {
            cmd_update_core(&paths, &store, &client, &core, &api_base).await
        }
        Commands::Scan {
            filter,
            only_active,
        } => cmd_scan(process_filter(&filter)?, only_active, json_mode).await,
        Commands::Ports { limit } => cmd_ports(&store, limit, json_mode).await,
        Commands::Interfaces => cmd_interfaces(json_mode).await,
        Commands::Bitrate {
            platform,
            upload_kbps,
        } => cmd_bitrate(&platform, upload_kbps),
        Commands::Ui(update) => cmd_ui(&store, &update, json_mode),
    }
}

// =============================================================================
// TESTS
// =============================================================================
