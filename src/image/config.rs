//! Declarative image configuration.
//!
//! `image.yml` is the single source of truth for the desired state of an
//! atomic host: the base image plus the packages layered on top of (or
//! carved out of) it, and extra build commands. The file compiles into a
//! containerfile whose build produces the next root image.

use crate::error::ApmError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Desired install/remove lists. A name lives in at most one list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSets {
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// The `image.yml` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Base image reference: registry URL or local tag.
    pub image: String,
    #[serde(default)]
    pub packages: PackageSets,
    /// Extra shell commands appended to the image build.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl ImageConfig {
    /// Load the config from `path`. When the file is missing, a default is
    /// synthesized with the base image produced by `default_image`.
    pub fn load_or_default(
        path: &Path,
        default_image: impl FnOnce() -> Result<String>,
    ) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                image: default_image()?,
                ..Default::default()
            });
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read image config {}", path.display()))?;
        serde_yaml::from_str(&content).map_err(|err| {
            ApmError::MalformedConfig {
                path: path.to_path_buf(),
                message: err.to_string(),
            }
            .into()
        })
    }

    /// Write the whole document back atomically (write-then-rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let content =
            serde_yaml::to_string(self).context("Failed to serialize image config")?;
        let tmp = path.with_extension("yml.tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write image config to {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace image config {}", path.display()))?;
        Ok(())
    }

    /// Add `name` to the install list, dropping it from the remove list.
    /// Returns whether the document changed.
    pub fn add_install(&mut self, name: &str) -> bool {
        let dropped = drop_name(&mut self.packages.remove, name);
        if self.packages.install.iter().any(|n| n == name) {
            return dropped;
        }
        self.packages.install.push(name.to_string());
        true
    }

    /// Add `name` to the remove list, dropping it from the install list.
    /// Returns whether the document changed.
    pub fn add_remove(&mut self, name: &str) -> bool {
        let dropped = drop_name(&mut self.packages.install, name);
        if self.packages.remove.iter().any(|n| n == name) {
            return dropped;
        }
        self.packages.remove.push(name.to_string());
        true
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.packages.install.iter().any(|n| n == name)
    }

    pub fn is_removed(&self, name: &str) -> bool {
        self.packages.remove.iter().any(|n| n == name)
    }

    /// Render the containerfile that realizes this configuration.
    ///
    /// The image builds itself: apm's resources and the config are copied
    /// in, `apm system image build` applies the package lists from inside,
    /// and the copied files are removed again.
    pub fn generate_containerfile(&self, resources_dir: &str, config_path: &str) -> String {
        let mut lines = Vec::new();
        lines.push(format!("FROM \"{}\"", self.image));
        lines.push(format!("COPY \"{resources_dir}\" \"{resources_dir}\""));
        lines.push(format!("COPY \"{config_path}\" \"{config_path}\""));
        lines.push("RUN apm system image build".to_string());
        for command in &self.commands {
            lines.push(format!("RUN {command}"));
        }
        lines.push(format!("RUN rm -rf \"{resources_dir}\" \"{config_path}\""));
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// Write the containerfile next to the build context.
    pub fn write_containerfile(
        &self,
        containerfile: &Path,
        resources_dir: &str,
        config_path: &str,
    ) -> Result<()> {
        if let Some(parent) = containerfile.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        fs::write(
            containerfile,
            self.generate_containerfile(resources_dir, config_path),
        )
        .with_context(|| format!("Failed to write {}", containerfile.display()))?;
        Ok(())
    }
}

fn drop_name(list: &mut Vec<String>, name: &str) -> bool {
    let before = list.len();
    list.retain(|n| n != name);
    before != list.len()
}

/// Read the base image out of a previously generated containerfile.
///
/// Used to seed a default config on a host whose image was already modified
/// locally: the `FROM` line remembers what it was built from.
pub fn base_image_of_containerfile(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path).map_err(|_| ApmError::ContainerfileMissing {
        path: path.to_path_buf(),
    })?;
    for line in content.lines() {
        if let Some(rest) = line.trim().strip_prefix("FROM ") {
            return Ok(rest.trim().trim_matches('"').to_string());
        }
    }
    Err(ApmError::ContainerfileMissing {
        path: path.to_path_buf(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ImageConfig {
        ImageConfig {
            image: "registry.altlinux.org/alt/atomic:latest".to_string(),
            packages: PackageSets {
                install: vec!["zip".to_string()],
                remove: vec!["nano".to_string()],
            },
            commands: vec!["echo done".to_string()],
        }
    }

    #[test]
    fn round_trip_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.yml");
        let config = sample();
        config.save(&path).unwrap();
        let loaded = ImageConfig::load_or_default(&path, || unreachable!()).unwrap();
        assert_eq!(loaded, config);
        // Saving the untouched structure is a no-op on content.
        let first = fs::read_to_string(&path).unwrap();
        loaded.save(&path).unwrap();
        let second = fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_file_synthesizes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.yml");
        let config =
            ImageConfig::load_or_default(&path, || Ok("alt/atomic:sisyphus".to_string())).unwrap();
        assert_eq!(config.image, "alt/atomic:sisyphus");
        assert!(config.packages.install.is_empty());
    }

    #[test]
    fn malformed_file_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.yml");
        fs::write(&path, "image: [unclosed").unwrap();
        let err = ImageConfig::load_or_default(&path, || unreachable!()).unwrap_err();
        assert!(err.to_string().contains("image.yml"));
    }

    #[test]
    fn install_and_remove_lists_stay_disjoint() {
        let mut config = sample();
        assert!(config.add_install("nano"));
        assert!(config.is_installed("nano"));
        assert!(!config.is_removed("nano"));

        assert!(config.add_remove("zip"));
        assert!(config.is_removed("zip"));
        assert!(!config.is_installed("zip"));
    }

    #[test]
    fn add_install_is_idempotent() {
        let mut config = sample();
        assert!(!config.add_install("zip"));
        assert_eq!(
            config.packages.install.iter().filter(|n| *n == "zip").count(),
            1
        );
    }

    #[test]
    fn containerfile_directives_are_exact() {
        let config = ImageConfig {
            image: "alt/atomic:latest".to_string(),
            ..Default::default()
        };
        let text = config.generate_containerfile("/usr/share/apm", "/etc/apm/image.yml");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "FROM \"alt/atomic:latest\"",
                "COPY \"/usr/share/apm\" \"/usr/share/apm\"",
                "COPY \"/etc/apm/image.yml\" \"/etc/apm/image.yml\"",
                "RUN apm system image build",
                "RUN rm -rf \"/usr/share/apm\" \"/etc/apm/image.yml\"",
            ]
        );
    }

    #[test]
    fn extra_commands_run_after_the_build_step() {
        let text = sample().generate_containerfile("/usr/share/apm", "/etc/apm/image.yml");
        let build_at = text.find("RUN apm system image build").unwrap();
        let command_at = text.find("RUN echo done").unwrap();
        let cleanup_at = text.find("RUN rm -rf").unwrap();
        assert!(build_at < command_at);
        assert!(command_at < cleanup_at);
    }

    #[test]
    fn base_image_recovered_from_containerfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Containerfile");
        fs::write(&path, "FROM \"alt/atomic:latest\"\nRUN true\n").unwrap();
        assert_eq!(
            base_image_of_containerfile(&path).unwrap(),
            "alt/atomic:latest"
        );
        assert!(base_image_of_containerfile(&dir.path().join("missing")).is_err());
    }
}
