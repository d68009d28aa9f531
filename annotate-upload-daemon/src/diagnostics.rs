//! Command Line and Logging
//!
//! Command-line interface and logging setup for the upload daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Upload daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "annotate-upload")]
#[command(about = "Upload images into annotation projects", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value = "true")]
    pub timestamps: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload image files or directories into a project
    Upload {
        /// Project ID
        #[arg(short, long)]
        project: String,

        /// Image files or directories containing images
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Resume uploads interrupted by a previous run
    Resume {
        /// Project ID
        #[arg(short, long)]
        project: String,
    },

    /// Show persisted upload state for a project
    Status {
        /// Project ID
        #[arg(short, long)]
        project: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fetch image and annotation counts for a project
    Counts {
        /// Project ID
        #[arg(short, long)]
        project: String,
    },

    /// Show current configuration
    DumpConfig,

    /// Show version and platform information
    Version,
}

/// Initialize logging based on CLI configuration
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit_index = 0;

    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit_index])
    }
}

pub fn print_version() {
    println!("annotate-upload v{}", env!("CARGO_PKG_VERSION"));
    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_cli_parses_upload() {
        let cli = Cli::parse_from(["annotate-upload", "upload", "-p", "42", "a.png", "shots/"]);
        match cli.command {
            Command::Upload { project, paths } => {
                assert_eq!(project, "42");
                assert_eq!(paths.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_requires_paths() {
        assert!(Cli::try_parse_from(["annotate-upload", "upload", "-p", "42"]).is_err());
    }
}
