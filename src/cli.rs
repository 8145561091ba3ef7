//! CLI argument definitions for apm.
//!
//! This module contains the clap-derived `Cli` and `Commands` types. Command
//! execution lives in [`crate::commands`]; the CLI is a thin adapter that
//! resolves the transaction, picks the event sink, and renders the envelope.

use crate::response::OutputFormat;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "apm")]
#[command(about = "Atomic package manager for mutable and bootc-based ALT hosts")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format for the response envelope
    #[arg(long, short = 'f', global = true, value_enum, default_value_t)]
    pub format: OutputFormat,

    /// Correlation id attached to events and the response
    #[arg(long, short = 't', global = true)]
    pub transaction: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Refresh the package cache and rebuild the catalog
    Update,

    /// Install packages (name+ / name- force the action in a mixed batch)
    Install {
        /// Package names
        packages: Vec<String>,
        /// Also record the packages in the image config and rebuild
        #[arg(short = 'a', long)]
        apply: bool,
    },

    /// Remove packages
    Remove {
        /// Package names
        packages: Vec<String>,
        /// Also record the removal in the image config and rebuild
        #[arg(short = 'a', long)]
        apply: bool,
    },

    /// Simulate an install or remove without touching the system
    Check {
        #[arg(value_enum)]
        action: CheckVerb,
        /// Package names
        packages: Vec<String>,
    },

    /// Show one package record from the catalog
    Info {
        /// Package name
        package: String,
    },

    /// Search the catalog by name substring
    Search {
        /// Substring to look for
        query: String,
        /// Only installed packages
        #[arg(long)]
        installed: bool,
    },

    /// List catalog entries with filters and paging
    List {
        /// Filter as field=value (repeatable)
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
        /// Sort field
        #[arg(long)]
        sort: Option<String>,
        /// Sort descending
        #[arg(long)]
        desc: bool,
        /// Page size
        #[arg(long)]
        limit: Option<u32>,
        /// Page offset
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// System-level subcommands
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },

    /// Manage packages inside distrobox containers
    Distrobox {
        #[command(subcommand)]
        command: DistroboxCommands,
    },

    /// Run the bus daemon
    Serve,
}

/// Dry-run verbs.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CheckVerb {
    Install,
    Remove,
}

#[derive(Debug, Subcommand)]
pub enum SystemCommands {
    /// Atomic image lifecycle
    Image {
        #[command(subcommand)]
        command: ImageCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum ImageCommands {
    /// Show the host image status and the current config
    Status,

    /// Build the configured image and switch the root to it
    Apply {
        /// Force a pull of the base image
        #[arg(long)]
        pull: bool,
        /// Rebuild even when the config is unchanged
        #[arg(long)]
        allow_same: bool,
    },

    /// Check the base image for drift and reapply when it moved
    Update,

    /// Show recorded configuration snapshots
    History {
        /// Maximum entries to show
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Apply the configured package lists (runs inside the image build)
    Build,

    /// Read or replace the declarative config
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print the current config
    Get,
    /// Replace the config with a JSON document
    Set {
        /// JSON-encoded image configuration
        config: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum DistroboxCommands {
    /// Refresh a container's package catalog
    Update {
        /// Container name
        container: String,
    },

    /// Show one package record from a container's catalog
    Info {
        container: String,
        package: String,
    },

    /// Search a container's catalog
    Search {
        container: String,
        query: String,
        #[arg(long)]
        installed: bool,
    },

    /// List a container's catalog entries
    List {
        container: String,
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        desc: bool,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Install packages inside a container
    Install {
        container: String,
        packages: Vec<String>,
        /// Export the installed applications to the host menu
        #[arg(long)]
        export: bool,
    },

    /// Remove packages from a container
    Remove {
        container: String,
        packages: Vec<String>,
    },

    /// Export (or remove the export of) an application
    Export {
        container: String,
        package: String,
        /// Remove the export instead of creating it
        #[arg(long)]
        delete: bool,
    },

    /// Manage the containers themselves
    Container {
        #[command(subcommand)]
        command: ContainerCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum ContainerCommands {
    /// List known containers
    List,
    /// Create a container from an image
    Add { name: String, image: String },
    /// Destroy a container
    Remove { name: String },
}

/// Parse a `field=value` filter argument.
fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected field=value, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_install_with_apply() {
        let cli = Cli::parse_from(["apm", "install", "zip", "unzip", "-a"]);
        match cli.command {
            Commands::Install { packages, apply } => {
                assert_eq!(packages, vec!["zip", "unzip"]);
                assert!(apply);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_global_format_and_transaction() {
        let cli = Cli::parse_from(["apm", "--format", "json", "-t", "tx-1", "update"]);
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.transaction.as_deref(), Some("tx-1"));
    }

    #[test]
    fn filter_arguments_split_on_equals() {
        assert_eq!(
            parse_key_value("name=zip").unwrap(),
            ("name".to_string(), "zip".to_string())
        );
        assert!(parse_key_value("no-equals").is_err());
        assert!(parse_key_value("=value").is_err());
    }

    #[test]
    fn parses_image_apply_flags() {
        let cli = Cli::parse_from(["apm", "system", "image", "apply", "--pull", "--allow-same"]);
        match cli.command {
            Commands::System {
                command: SystemCommands::Image {
                    command: ImageCommands::Apply { pull, allow_same },
                },
            } => {
                assert!(pull);
                assert!(allow_same);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
