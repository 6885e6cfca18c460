//! # scstore
//!
//! Command-line binary for the scstore graph store.
//!
//! ## Usage
//!
//! ```bash
//! scstore --repo ./kb init
//! scstore --repo ./kb import -f graph.json
//! scstore --repo ./kb stats --json
//! scstore --config scstore.toml arcs --seg 0 --offset 1 --incoming
//! ```
//!
//! Logging goes to stderr. `SCSTORE_LOG` (or `RUST_LOG`) sets the filter,
//! `SCSTORE_LOG_FORMAT=json` switches to JSON lines.

use clap::Parser;
use scstore::cli;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let cli = cli::Cli::parse();
    init_tracing(cli.log_level());

    if let Err(e) = cli::execute(cli) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("SCSTORE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let log_format = std::env::var("SCSTORE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
