//! # CODAP CLI Module
//!
//! ## Available Commands
//!
//! - `server` - Serve the document over the data interactive API
//! - `status` - Show contexts, collections and case counts
//! - `init` - Write an empty document
//! - `apply` - Apply change descriptors from a JSON file
//! - `rows` - Print the case table rows of one collection
//! - `export` - Write the document as JSON or binary
//! - `import` - Replace the document with an exported file

mod commands;

use crate::config::AppConfig;
use clap::{Parser, Subcommand, ValueEnum};
use codap_core::CodapError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// CODAP document host
///
/// Hierarchical case data with undoable changes, served to data
/// interactives over HTTP.
#[derive(Parser, Debug)]
#[command(name = "codap")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the document (`.cdap` is binary, anything else JSON)
    #[arg(short = 'd', long, global = true, default_value = "codap.json")]
    pub document: PathBuf,

    /// Path to the TOML configuration file
    #[arg(short = 'c', long, global = true, default_value = "codap.toml")]
    pub config: PathBuf,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// On-disk encodings for `export`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Binary,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Server {
        /// Host to bind to (overrides config)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show document status
    Status,

    /// Write an empty document
    Init {
        /// Overwrite an existing document
        #[arg(short, long)]
        force: bool,
    },

    /// Apply a JSON array of change descriptors
    Apply {
        /// Path to the change file
        #[arg(short, long)]
        file: PathBuf,

        /// Context to apply to; created when missing
        #[arg(long, default_value = "Data")]
        context: String,
    },

    /// Print the case table rows of a collection
    Rows {
        /// Context name or ID
        #[arg(long)]
        context: String,

        /// Collection name or ID
        #[arg(long)]
        collection: String,

        /// Ancestor case IDs to collapse before printing
        #[arg(long, value_delimiter = ',')]
        collapse: Vec<u64>,
    },

    /// Export the document
    Export {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Output encoding
        #[arg(short = 't', long, value_enum, default_value = "binary")]
        format: ExportFormat,
    },

    /// Replace the document with an exported file
    Import {
        /// Input file path (JSON or binary)
        #[arg(short, long)]
        input: PathBuf,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli, mut config: AppConfig) -> Result<(), CodapError> {
    let path = cli.document;
    let json_mode = cli.json_mode;
    let capacity = config.history.capacity;

    match cli.command {
        Some(Commands::Server { host, port }) => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            cmd_server(&config, path).await
        }
        Some(Commands::Status) => cmd_status(&path, capacity, json_mode),
        Some(Commands::Init { force }) => cmd_init(&path, force),
        Some(Commands::Apply { file, context }) => {
            cmd_apply(&path, capacity, json_mode, &file, &context)
        }
        Some(Commands::Rows {
            context,
            collection,
            collapse,
        }) => cmd_rows(&path, capacity, json_mode, &context, &collection, &collapse),
        Some(Commands::Export { output, format }) => cmd_export(&path, capacity, &output, format),
        Some(Commands::Import { input }) => cmd_import(&path, capacity, &input),
        None => cmd_status(&path, capacity, json_mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn rows_collapse_takes_a_list() {
        let cli = Cli::try_parse_from([
            "codap",
            "rows",
            "--context",
            "Mammals",
            "--collection",
            "Animals",
            "--collapse",
            "3,7",
        ])
        .expect("parse");
        assert!(matches!(
            cli.command,
            Some(Commands::Rows { ref collapse, .. }) if collapse == &[3, 7]
        ));
    }

    #[test]
    fn export_defaults_to_binary() {
        let cli = Cli::try_parse_from(["codap", "export", "-o", "out.cdap"]).expect("parse");
        assert!(matches!(
            cli.command,
            Some(Commands::Export {
                format: ExportFormat::Binary,
                ..
            })
        ));
    }
}
