//! Subscription fetching.
//!
//! A subscription URL returns either a plain list of share links or a
//! base64 body of one; both go through the smart importer.

use crate::error::{Result, UmbraError};
use std::time::Duration;
use tracing::{info, warn};
use umbra_core::Settings;

const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// User-Agent sent with subscription requests.
pub const SUBSCRIPTION_USER_AGENT: &str = "Umbra-Subscription";

/// Download one subscription body.
pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(UmbraError::Invalid("subscription URL is empty".to_string()));
    }
    let body = client
        .get(url)
        .header(reqwest::header::USER_AGENT, SUBSCRIPTION_USER_AGENT)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(body)
}

/// Per-URL outcome of [`update_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionReport {
    pub url: String,
    /// Configs added, or the fetch error.
    pub outcome: std::result::Result<usize, String>,
}

/// Fetch every stored subscription and import new configs.
///
/// A failing URL is reported and does not stop the others.
pub async fn update_all(client: &reqwest::Client, settings: &mut Settings) -> Vec<SubscriptionReport> {
    let urls = settings.subscriptions.clone();
    let mut reports = Vec::with_capacity(urls.len());
    for url in urls {
        let outcome = match fetch(client, &url).await {
            Ok(body) => {
                let added = settings.import_smart_input(&body, "subscription");
                info!(%url, added, "subscription updated");
                Ok(added)
            }
            Err(e) => {
                warn!(%url, error = %e, "subscription update failed");
                Err(e.to_string())
            }
        };
        reports.push(SubscriptionReport { url, outcome });
    }
    reports
}
