//! # Umbra Core
//!
//! The pure model behind the Umbra network utility.
//!
//! Everything persisted in `configs/settings.json` is described here, together
//! with the parsers and scoring used by the app layer. This crate performs no
//! I/O: processes, sockets, HTTP and files are handled by `apps/umbra`.
//!
//! ## Layout
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`settings`] | The settings document, defaults, defaults-merge |
//! | [`detect`] | Share-link / config format detection |
//! | [`configs`] | VPN config catalogue and subscriptions |
//! | [`dns`] | DNS catalogue, presets, ranking |
//! | [`profiles`] | Gaming / Streaming / Work / Custom profiles |
//! | [`routing`] | Per-app rules and process classification |
//! | [`apps`] | App launcher catalogue |
//! | [`snapshot`] | Snapshots and rollback |
//! | [`netstats`] | Ping, socket-table and throughput arithmetic |
//! | [`release`] | Core release asset selection |

pub mod apps;
pub mod configs;
pub mod detect;
pub mod dns;
pub mod netstats;
pub mod profiles;
pub mod release;
pub mod routing;
pub mod settings;
pub mod snapshot;

pub use apps::{AppCatalog, AppEntry, AppKind};
pub use configs::VpnConfig;
pub use detect::{ConfigKind, CoreKind};
pub use dns::{DnsServer, RankedDns};
pub use netstats::{PingStats, PingWindow, Rate};
pub use profiles::{Profile, ProfileBook, ProfileChange};
pub use routing::{AppRule, Priority, ProcessFilter, ProcessInfo};
pub use settings::{CopilotMode, Settings};
pub use snapshot::Snapshot;

use thiserror::Error;

// =============================================================================
// ERROR TYPE
// =============================================================================

/// Errors raised by core validation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The settings document could not be mapped onto the model.
    #[error("invalid settings document: {0}")]
    InvalidSettings(#[from] serde_json::Error),

    /// A profile name that is not in the profile book.
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// An index outside the addressed list.
    #[error("{what} index {index} out of range (len {len})")]
    OutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },

    /// A required field was empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// The named entry already exists.
    #[error("{0} already exists")]
    Duplicate(String),

    /// A lookup by name or id failed.
    #[error("{0} not found")]
    NotFound(String),
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, CoreError>;

// =============================================================================
// CLOCK
// =============================================================================

/// Wall-clock stamp in the settings file format (`%Y-%m-%d %H:%M:%S`).
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
