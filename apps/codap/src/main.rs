//! # CODAP Document Host
//!
//! The main binary around `codap-core`.
//!
//! This application provides:
//! - HTTP "data interactive" API server (axum-based)
//! - CLI interface for document operations
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │               apps/codap (THE BINARY)            │
//! │                                                  │
//! │   ┌─────────────┐          ┌─────────────┐       │
//! │   │    CLI      │          │  HTTP API   │       │
//! │   │   (clap)    │          │   (axum)    │       │
//! │   └──────┬──────┘          └──────┬──────┘       │
//! │          └──────────────┬─────────┘              │
//! │                         ▼                        │
//! │                 ┌───────────────┐                │
//! │                 │  codap-core   │                │
//! │                 │  (THE LOGIC)  │                │
//! │                 └───────────────┘                │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start the HTTP server
//! codap server --host 0.0.0.0 --port 8080
//!
//! # CLI operations
//! codap status
//! codap apply -f changes.json --context Mammals
//! codap rows --context Mammals --collection Animals --collapse 1,4
//! ```

use clap::Parser;
use codap::{
    cli,
    config::{AppConfig, LogFormat, LoggingConfig},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&config.logging, cli.verbose);

    if !cli.quiet {
        print_banner();
    }

    if let Err(e) = cli::execute(cli, config).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing. `RUST_LOG` wins over the configured filter.
fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            "codap=debug,codap_core=debug,tower_http=debug".into()
        } else {
            logging.filter.as_str().into()
        }
    });

    match logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

/// Print the startup banner.
fn print_banner() {
    println!(
        r#"
   ____ ___  ____    _    ____
  / ___/ _ \|  _ \  / \  |  _ \
 | |  | | | | | | |/ _ \ | |_) |
 | |__| |_| | |_| / ___ \|  __/
  \____\___/|____/_/   \_\_|

  Common Online Data Analysis Platform v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
