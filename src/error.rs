//! Custom error types for apm.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by apm's own logic, as opposed to errors matched out of
/// package tool output (see [`crate::apt::errors`]).
#[derive(Error, Debug)]
pub enum ApmError {
    #[error("Invalid filter field '{field}', allowed fields: {}", allowed.join(", "))]
    InvalidFilterField {
        field: String,
        allowed: Vec<&'static str>,
    },

    #[error("Invalid sort field '{field}', allowed fields: {}", allowed.join(", "))]
    InvalidSortField {
        field: String,
        allowed: Vec<&'static str>,
    },

    #[error("Package database is empty, run 'apm update' first")]
    DatabaseNotPopulated,

    #[error("Package not found: {name}")]
    PackageNotFound { name: String },

    #[error("At least one package name is required")]
    PackageNameRequired,

    #[error("Container not found: {name}")]
    ContainerNotFound { name: String },

    #[error("Container already exists: {name}")]
    ContainerAlreadyExists { name: String },

    #[error("This system is not managed as an atomic image")]
    NotAtomicSystem,

    #[error("{action} dialog cancelled")]
    DialogCancelled { action: String },

    #[error("This operation requires root privileges")]
    PrivilegeRequired,

    #[error("This operation must not be run as root")]
    PrivilegeForbidden,

    #[error("Image not changed")]
    ImageNotChanged,

    #[error("Containerfile not found at {}", path.display())]
    ContainerfileMissing { path: PathBuf },

    #[error("Failed to inspect remote image {reference}")]
    RemoteInspectFailed { reference: String },

    #[error("Image build failed: {message}")]
    BuildFailed { message: String },

    #[error("Image switch failed: {message}")]
    SwitchFailed { message: String },

    #[error("Malformed configuration file {}: {message}", path.display())]
    MalformedConfig { path: PathBuf, message: String },

    #[error("Not connected to the system bus")]
    BusNotConnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_filter_field_names_allowed_set() {
        let err = ApmError::InvalidFilterField {
            field: "bogus".into(),
            allowed: vec!["name", "section"],
        };
        let msg = err.to_string();
        assert!(msg.contains("bogus"));
        assert!(msg.contains("name, section"));
    }

    #[test]
    fn dialog_cancelled_carries_action() {
        let err = ApmError::DialogCancelled {
            action: "installation".into(),
        };
        assert_eq!(err.to_string(), "installation dialog cancelled");
    }
}
