//! Application error type.

use thiserror::Error;
use umbra_core::CoreError;

/// Errors surfaced by CLI commands, the control API and background tasks.
#[derive(Debug, Error)]
pub enum UmbraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// A network test was requested without the user's confirmation.
    #[error("network tests need explicit confirmation (pass --yes)")]
    NotConfirmed,

    /// Engine or core lifecycle failure.
    #[error("engine: {0}")]
    Engine(String),

    /// Core update failure.
    #[error("update failed: {0}")]
    Update(String),

    /// Invalid user input.
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, UmbraError>;
