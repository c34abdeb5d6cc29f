//! # Umbra
//!
//! Entry point: parse the command line, install logging, dispatch.

use clap::Parser;
use umbra::cli::{self, Cli};
use umbra::logging::{LogRing, LoggingConfig, init_logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let ring = LogRing::default();
    let config = LoggingConfig {
        log_dir: Some(cli.log_dir()),
        ..LoggingConfig::default()
    };
    let _guard = match init_logging(&config, &ring) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("warning: file logging disabled: {e}");
            None
        }
    };

    if let Err(e) = cli::run(cli, ring).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
