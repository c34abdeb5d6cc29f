//! # Probes
//!
//! Network tests that put traffic on the wire: ping series, DNS
//! optimisation and the advanced speed test.
//!
//! Every probe takes a [`Consent`]. The token can only be obtained from an
//! explicit `--yes`, an interactive prompt, or a `confirm: true` API body,
//! so nothing here can be reached by a background task on its own.

use crate::error::{Result, UmbraError};
use futures::StreamExt;
use futures::future::join_all;
use rand::RngCore;
use std::future::Future;
use std::io::{BufRead, Write};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use umbra_core::dns::{self, DnsServer, OPTIMIZE_PINGS_PER_SERVER, SAFE_CHECK_LIMIT};
use umbra_core::netstats::{parse_ping_output, ping_command, throughput_bps};
use umbra_core::{PingStats, Rate, RankedDns, Settings};

/// Pings in a safe ping test.
pub const SAFE_PING_COUNT: usize = 10;

/// Pause between consecutive pings to the same host.
pub const PING_SPACING: Duration = Duration::from_millis(80);

/// Upper bound for one `ping` process.
const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Request timeout for speed-test transfers.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// CONSENT
// =============================================================================

/// Proof that the user confirmed a network test.
#[derive(Debug, Clone, Copy)]
pub struct Consent(());

impl Consent {
    /// From a `--yes` flag or an API `confirm` field.
    pub fn from_flag(confirmed: bool) -> Option<Self> {
        confirmed.then_some(Consent(()))
    }

    /// Ask on the terminal. Anything but `y`/`yes` is a refusal.
    pub fn prompt(question: &str) -> Result<Option<Self>> {
        Ok(Self::from_flag(ask(question)?))
    }

    /// `--yes`, else prompt; refusal is [`UmbraError::NotConfirmed`].
    pub fn obtain(yes: bool, question: &str) -> Result<Self> {
        if let Some(consent) = Self::from_flag(yes) {
            return Ok(consent);
        }
        Self::prompt(question)?.ok_or(UmbraError::NotConfirmed)
    }
}

/// Yes/no question on stderr, answered on stdin. Defaults to no.
pub fn ask(question: &str) -> Result<bool> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{question} [y/N] ")?;
    stderr.flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

// =============================================================================
// PINGER
// =============================================================================

/// Source of single ping round-trips, in microseconds.
pub trait Pinger: Send + Sync {
    /// `None` when the host did not answer.
    fn ping(&self, host: &str) -> impl Future<Output = Option<u64>> + Send;
}

/// Runs the system `ping` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPinger;

impl Pinger for SystemPinger {
    async fn ping(&self, host: &str) -> Option<u64> {
        let (program, args) = ping_command(host, std::env::consts::OS);
        let run = tokio::process::Command::new(program)
            .args(&args)
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(PING_TIMEOUT, run).await {
            Ok(Ok(out)) => reply_time(&out),
            Ok(Err(e)) => {
                warn!(host, error = %e, "ping could not be started");
                None
            }
            Err(_) => None,
        }
    }
}

/// Round-trip of a finished `ping` run. A failed run is no reply, whatever
/// it printed.
fn reply_time(output: &std::process::Output) -> Option<u64> {
    if !output.status.success() {
        debug!(status = %output.status, "ping exited with failure");
        return None;
    }
    parse_ping_output(&String::from_utf8_lossy(&output.stdout))
}

/// `count` pings to one host, `PING_SPACING` apart.
pub async fn ping_series<P: Pinger>(pinger: &P, host: &str, count: usize) -> Vec<Option<u64>> {
    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        if i > 0 {
            tokio::time::sleep(PING_SPACING).await;
        }
        samples.push(pinger.ping(host).await);
    }
    samples
}

// =============================================================================
// PROBES
// =============================================================================

/// Safe ping test: [`SAFE_PING_COUNT`] pings to one host.
pub async fn safe_ping_test<P: Pinger>(pinger: &P, host: &str, _consent: Consent) -> PingStats {
    let stats = PingStats::from_samples(&ping_series(pinger, host, SAFE_PING_COUNT).await);
    info!(host, %stats, "safe ping test finished");
    stats
}

/// Ping every server [`OPTIMIZE_PINGS_PER_SERVER`] times and rank them.
pub async fn optimize_dns<P: Pinger>(
    pinger: &P,
    servers: &[DnsServer],
    _consent: Consent,
) -> Vec<RankedDns> {
    let runs = servers
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.server.trim().is_empty())
        .map(|(index, s)| async move {
            let samples = ping_series(pinger, s.server.trim(), OPTIMIZE_PINGS_PER_SERVER).await;
            (index, PingStats::from_samples(&samples))
        });
    let results = join_all(runs).await;
    let ranked = dns::rank(servers, &results);
    if let Some(best) = ranked.first() {
        info!(
            best = %best.server,
            score_us = best.score_us,
            servers = ranked.len(),
            "DNS optimisation finished"
        );
    }
    ranked
}

/// Store a ranking in the cache. With auto-suggestions on, returns the
/// best entry as a suggestion. Nothing is applied to the profile here; the
/// caller does that with [`Settings::accept_dns_suggestion`] once the user
/// accepts.
pub fn store_ranking(settings: &mut Settings, ranked: &[RankedDns]) -> Option<RankedDns> {
    settings.dns.rank_cache.last_ranking = ranked.to_vec();
    if !settings.behavior.auto_suggestions {
        return None;
    }
    ranked.first().cloned()
}

/// First-run check: one ping to each of the first [`SAFE_CHECK_LIMIT`] servers.
pub async fn first_run_dns_check<P: Pinger>(
    pinger: &P,
    servers: &[DnsServer],
    _consent: Consent,
) -> Vec<(String, Option<u64>)> {
    let runs = servers
        .iter()
        .filter(|s| !s.server.trim().is_empty())
        .take(SAFE_CHECK_LIMIT)
        .map(|s| async move {
            let host = s.server.trim();
            (host.to_string(), pinger.ping(host).await)
        });
    join_all(runs).await
}

// =============================================================================
// SPEED TEST
// =============================================================================

/// Parameters of one advanced speed test.
#[derive(Debug, Clone)]
pub struct SpeedtestPlan {
    pub download_url: String,
    pub download_bytes: u64,
    pub upload_url: String,
    pub upload_bytes: u64,
}

impl SpeedtestPlan {
    /// Plan for a configured target index.
    pub fn from_settings(settings: &Settings, target: usize) -> Self {
        let st = &settings.speedtest;
        Self {
            download_url: st.download_url(target),
            download_bytes: st.advanced_download_bytes,
            upload_url: st.upload_url(),
            upload_bytes: st.advanced_upload_bytes,
        }
    }
}

/// Measured transfer rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedtestResult {
    pub downloaded: u64,
    pub download: Rate,
    /// `None` when the upload endpoint failed.
    pub upload: Option<Rate>,
}

/// Ranged download then POST upload.
pub async fn speedtest(
    client: &reqwest::Client,
    plan: &SpeedtestPlan,
    _consent: Consent,
) -> Result<SpeedtestResult> {
    let (downloaded, download) = measure_download(client, &plan.download_url, plan.download_bytes).await?;
    let upload = match measure_upload(client, &plan.upload_url, plan.upload_bytes).await {
        Ok(rate) => Some(rate),
        Err(e) => {
            warn!(url = %plan.upload_url, error = %e, "upload test failed");
            None
        }
    };
    info!(
        download = %download,
        upload = %upload.map(|r| r.to_string()).unwrap_or_else(|| "n/a".to_string()),
        "speed test finished"
    );
    Ok(SpeedtestResult {
        downloaded,
        download,
        upload,
    })
}

/// Stream at most `bytes` from `url` with a `Range` request.
pub async fn measure_download(client: &reqwest::Client, url: &str, bytes: u64) -> Result<(u64, Rate)> {
    let limit = bytes.max(1);
    let started = Instant::now();
    let response = client
        .get(url)
        .header(reqwest::header::RANGE, format!("bytes=0-{}", limit - 1))
        .timeout(TRANSFER_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;

    let mut received: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        received = received.saturating_add(chunk?.len() as u64);
        if received >= limit {
            break;
        }
    }
    let counted = received.min(limit);
    Ok((counted, throughput_bps(counted, started.elapsed())))
}

/// POST `bytes` of random data to `url`.
pub async fn measure_upload(client: &reqwest::Client, url: &str, bytes: u64) -> Result<Rate> {
    let len = usize::try_from(bytes.max(1))
        .map_err(|_| UmbraError::Invalid(format!("upload size {bytes} too large")))?;
    let mut payload = vec![0u8; len];
    rand::rng().fill_bytes(&mut payload);

    let started = Instant::now();
    client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .timeout(TRANSFER_TIMEOUT)
        .body(payload)
        .send()
        .await?
        .error_for_status()?;
    Ok(throughput_bps(len as u64, started.elapsed()))
}

// =============================================================================
// TESTS
// =============================================================================
