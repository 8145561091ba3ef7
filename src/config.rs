//! Application paths and privilege checks.
//!
//! State is system-scoped when running as root (the privileged coordinator)
//! and user-scoped otherwise. `APM_STATE_DIR` overrides the base directory
//! for tests and development sandboxes.

use crate::error::ApmError;
use crate::image::ImagePaths;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

/// Resolved filesystem locations for one process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database holding the catalogs and image history.
    pub database_path: PathBuf,
    /// The declarative `image.yml`.
    pub image_config_path: PathBuf,
    /// Generated containerfile inside the build context.
    pub containerfile_path: PathBuf,
    /// apm's resource directory copied into the image during build.
    pub resources_dir: PathBuf,
    /// The invoking user's home, for export detection.
    pub home: PathBuf,
}

impl AppConfig {
    /// Resolve paths for the current invocation.
    pub fn resolve() -> Result<Self> {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/root"));

        if let Some(base) = std::env::var_os("APM_STATE_DIR") {
            let base = PathBuf::from(base);
            return Ok(Self {
                database_path: base.join("apm.db"),
                image_config_path: base.join("image.yml"),
                containerfile_path: base.join("Containerfile"),
                resources_dir: base.join("resources"),
                home,
            });
        }

        if running_as_root() {
            Ok(Self {
                database_path: PathBuf::from("/var/lib/apm/apm.db"),
                image_config_path: PathBuf::from("/etc/apm/image.yml"),
                containerfile_path: PathBuf::from("/var/Containerfile"),
                resources_dir: PathBuf::from("/usr/share/apm"),
                home,
            })
        } else {
            let dirs = ProjectDirs::from("org", "altlinux", "apm")
                .context("Failed to resolve user data directory")?;
            let data = dirs.data_dir();
            Ok(Self {
                database_path: data.join("apm.db"),
                image_config_path: data.join("image.yml"),
                containerfile_path: data.join("Containerfile"),
                resources_dir: data.join("resources"),
                home,
            })
        }
    }

    /// The subset of paths the image reconciler works with.
    pub fn image_paths(&self) -> ImagePaths {
        ImagePaths {
            config: self.image_config_path.clone(),
            containerfile: self.containerfile_path.clone(),
            resources_dir: self.resources_dir.clone(),
        }
    }
}

/// Whether the process runs with root privileges.
pub fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Mutating host operations require root.
pub fn require_root() -> Result<()> {
    if running_as_root() || std::env::var_os("APM_SKIP_PRIVILEGE_CHECK").is_some() {
        Ok(())
    } else {
        Err(ApmError::PrivilegeRequired.into())
    }
}
