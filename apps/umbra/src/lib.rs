//! # Umbra Library
//!
//! This library exposes the Umbra modules for testing and integration.
//!
//! The main binary uses these modules through the `main.rs` entry point.

pub mod api;
pub mod cli;
pub mod engine;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod probe;
pub mod scanner;
pub mod store;
pub mod subscription;
pub mod updater;

// Re-export umbra_core for convenience
pub use umbra_core;
