//! apm - atomic package manager for ALT hosts.
//!
//! A privileged coordinator that reconciles the installed package set with
//! either the mutable APT database (classic hosts) or an immutable
//! container-backed image (`bootc` hosts). A secondary domain manages
//! packages inside distrobox containers, including exporting applications
//! onto the host menu.
//!
//! # Architecture
//!
//! - [`apt`] drives the package tool: dry-run parsing, error classification,
//!   serialized mutation, catalog refresh.
//! - [`catalog`] is the durable package store, scoped per host/container.
//! - [`image`] compiles the declarative config into a containerfile, builds
//!   it, and swaps the root via the host tool.
//! - [`events`], [`response`] and [`progress`] carry task lifecycle events
//!   and the uniform response envelope to the terminal or the bus.
//! - [`commands`] holds the handlers shared by the CLI and [`dbus`].

pub mod apt;
pub mod catalog;
pub mod cli;
pub mod commands;
pub mod config;
pub mod dbus;
pub mod dialog;
pub mod distrobox;
pub mod error;
pub mod events;
pub mod image;
pub mod progress;
pub mod response;
pub mod runner;
pub mod transaction;

pub use cli::{Cli, Commands};
pub use error::ApmError;
pub use response::{Envelope, OutputFormat};
