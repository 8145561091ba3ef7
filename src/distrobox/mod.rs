//! Distrobox container package management.
//!
//! A second catalog instance over user-side sandbox containers: the guest
//! distribution is detected from `/etc/os-release`, a per-distro provider
//! runs the guest's package commands through `distrobox enter`, and results
//! flow through the same catalog pipeline as the host. Export state is
//! tracked per package.

pub mod export;
pub mod providers;

use crate::catalog::{CatalogStore, Scope};
use crate::error::ApmError;
use crate::events::Reporter;
use crate::runner::{CancelToken, CommandRunner};
use anyhow::{Context, Result, bail};
use providers::GuestProvider;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// One row of `distrobox ls`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub name: String,
    pub status: String,
    pub image: String,
}

/// Manager over all distrobox containers.
pub struct DistroboxManager<'a> {
    runner: &'a dyn CommandRunner,
    store: &'a CatalogStore,
    reporter: &'a Reporter,
    cancel: &'a CancelToken,
    home: PathBuf,
}

impl<'a> DistroboxManager<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        store: &'a CatalogStore,
        reporter: &'a Reporter,
        cancel: &'a CancelToken,
        home: PathBuf,
    ) -> Self {
        Self {
            runner,
            store,
            reporter,
            cancel,
            home,
        }
    }

    /// All known containers.
    pub fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let output = self.runner.run("distrobox ls --no-color", self.cancel)?;
        if !output.success() {
            bail!("distrobox ls failed");
        }
        Ok(parse_container_list(&output.stdout))
    }

    fn ensure_container(&self, name: &str) -> Result<()> {
        let known = self.list_containers()?;
        if known.iter().any(|c| c.name == name) {
            Ok(())
        } else {
            Err(ApmError::ContainerNotFound {
                name: name.to_string(),
            }
            .into())
        }
    }

    /// Create a container from an image.
    pub fn add_container(&self, name: &str, image: &str) -> Result<()> {
        let _task = self
            .reporter
            .task("distrobox.container.add", "Creating container");
        if self.list_containers()?.iter().any(|c| c.name == name) {
            return Err(ApmError::ContainerAlreadyExists {
                name: name.to_string(),
            }
            .into());
        }
        let command = format!("distrobox create --yes --name {name} --image {image}");
        let output = self.runner.run(&command, self.cancel)?;
        if !output.success() {
            bail!("Failed to create container '{name}'");
        }
        Ok(())
    }

    /// Destroy a container and drop its catalog rows.
    pub fn remove_container(&self, name: &str) -> Result<()> {
        let _task = self
            .reporter
            .task("distrobox.container.remove", "Removing container");
        self.ensure_container(name)?;
        let output = self
            .runner
            .run(&format!("distrobox rm --force {name}"), self.cancel)?;
        if !output.success() {
            bail!("Failed to remove container '{name}'");
        }
        self.store.save(&Scope::Container(name.to_string()), &[])?;
        Ok(())
    }

    /// Detect the guest distribution and select its provider.
    pub fn provider(&self, container: &str) -> Result<Box<dyn GuestProvider>> {
        let output = self.run_in(container, "cat /etc/os-release")?;
        let id = providers::os_release_id(&output).ok_or_else(|| {
            anyhow::anyhow!("Container '{container}' has no parseable /etc/os-release")
        })?;
        providers::provider_for(&id)
            .ok_or_else(|| anyhow::anyhow!("Unsupported guest distribution '{id}'"))
    }

    /// Refresh the container's catalog from the guest package tool.
    pub fn update(&self, container: &str) -> Result<usize> {
        let _task = self
            .reporter
            .task("distrobox.update", "Updating container packages");
        self.ensure_container(container)?;
        let provider = self.provider(container)?;
        let scope = Scope::Container(container.to_string());

        self.run_in(container, provider.update_command())?;
        let listing = self.run_in(container, provider.list_command())?;
        let mut records = provider.parse_available(&listing);
        debug!(container, count = records.len(), "guest catalog parsed");

        let installed_output = self.run_in(container, provider.installed_command())?;
        let installed = provider.parse_installed(&installed_output);
        for record in &mut records {
            if let Some(version) = installed.get(&record.name) {
                record.installed = true;
                record.installed_version = version.clone();
            }
        }

        let count = records.len();
        self.store.save(&scope, &records)?;
        self.store.sync_installed(&scope, &installed)?;
        export::sync_export_flags(self.store, &scope, &self.home, container)?;
        Ok(count)
    }

    /// Install packages inside the container.
    pub fn install(&self, container: &str, packages: &[String]) -> Result<()> {
        let _task = self
            .reporter
            .task("distrobox.install", "Installing container packages");
        if packages.is_empty() {
            return Err(ApmError::PackageNameRequired.into());
        }
        self.ensure_container(container)?;
        let provider = self.provider(container)?;
        let output = self.run_in_raw(container, &provider.install_command(packages))?;
        if !output.success() {
            bail!(
                "Guest install failed: {}",
                output.combined().lines().last().unwrap_or("").trim()
            );
        }
        self.sync_installed(container, provider.as_ref())
    }

    /// Remove packages inside the container.
    pub fn remove(&self, container: &str, packages: &[String]) -> Result<()> {
        let _task = self
            .reporter
            .task("distrobox.remove", "Removing container packages");
        if packages.is_empty() {
            return Err(ApmError::PackageNameRequired.into());
        }
        self.ensure_container(container)?;
        let provider = self.provider(container)?;
        let output = self.run_in_raw(container, &provider.remove_command(packages))?;
        if !output.success() {
            bail!(
                "Guest remove failed: {}",
                output.combined().lines().last().unwrap_or("").trim()
            );
        }
        self.sync_installed(container, provider.as_ref())
    }

    /// Export an application to the host menu and record the flag.
    pub fn export(&self, container: &str, package: &str) -> Result<()> {
        let _task = self.reporter.task("distrobox.export", "Exporting application");
        self.ensure_container(container)?;
        export::export_app(self.runner, self.cancel, container, package)?;
        let scope = Scope::Container(container.to_string());
        self.store.update_field(&scope, package, "exporting", true)?;
        Ok(())
    }

    /// Remove an exported application and clear the flag.
    pub fn unexport(&self, container: &str, package: &str) -> Result<()> {
        let _task = self.reporter.task("distrobox.export", "Removing exported application");
        self.ensure_container(container)?;
        export::unexport_app(self.runner, self.cancel, container, package)?;
        let scope = Scope::Container(container.to_string());
        self.store.update_field(&scope, package, "exporting", false)?;
        Ok(())
    }

    fn sync_installed(&self, container: &str, provider: &dyn GuestProvider) -> Result<()> {
        let scope = Scope::Container(container.to_string());
        let output = self.run_in(container, provider.installed_command())?;
        let installed = provider.parse_installed(&output);
        self.store.sync_installed(&scope, &installed)
    }

    /// Run a guest command, requiring success, returning stdout.
    fn run_in(&self, container: &str, inner: &str) -> Result<String> {
        let output = self.run_in_raw(container, inner)?;
        if !output.success() {
            bail!(
                "Command failed in container '{container}': {}",
                output.combined().lines().last().unwrap_or("").trim()
            );
        }
        Ok(output.stdout)
    }

    fn run_in_raw(&self, container: &str, inner: &str) -> Result<crate::runner::ToolOutput> {
        let quoted = shlex::try_quote(inner).context("unquotable guest command")?;
        let command = format!("distrobox enter {container} -- sh -c {quoted}");
        self.runner.run(&command, self.cancel)
    }
}

/// Parse `distrobox ls --no-color` output.
///
/// Columns are pipe-separated: `ID | NAME | STATUS | IMAGE`; the first line
/// is the header.
pub fn parse_container_list(output: &str) -> Vec<ContainerInfo> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('|').map(str::trim).collect();
            if fields.len() < 4 {
                return None;
            }
            Some(ContainerInfo {
                name: fields[1].to_string(),
                status: fields[2].to_string(),
                image: fields[3].to_string(),
            })
        })
        .collect()
}
