//! Atomic image reconciliation.
//!
//! Drives the host image lifecycle: compiling the declarative config into a
//! containerfile, building it into a local OCI image, switching the root to
//! it via `bootc`, and detecting base-image drift against the remote
//! registry by comparing layer digests. Tags are never trusted; layer
//! equality is the authoritative signal.

pub mod config;
pub mod history;

use crate::error::ApmError;
use crate::events::Reporter;
use crate::image::config::ImageConfig;
use crate::image::history::HistoryStore;
use crate::runner::{CancelToken, CommandRunner};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

/// Local tag the rebuilt root image is stored under.
pub const IMAGE_TAG: &str = "os";

/// Build context handed to the container engine.
pub const BUILD_CONTEXT: &str = "/var";

/// An image reference plus its transport, as `bootc status` reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageReference {
    pub image: String,
    pub transport: String,
}

/// The fetched image state inside a boot entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageState {
    pub image: ImageReference,
    pub image_digest: String,
    pub timestamp: Option<String>,
    pub version: Option<String>,
}

/// One bootable deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BootEntry {
    pub image: Option<ImageState>,
    pub pinned: bool,
    pub store: Option<String>,
}

/// What the host is configured to track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostSpec {
    pub image: Option<ImageReference>,
}

/// Staged and booted deployments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostState {
    pub staged: Option<BootEntry>,
    pub booted: Option<BootEntry>,
}

/// The host tool's view of the system, derived and never written by apm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostStatus {
    pub spec: HostSpec,
    pub status: HostState,
}

impl HostStatus {
    /// Transport of the currently booted image, if any.
    pub fn booted_transport(&self) -> Option<&str> {
        self.status
            .booted
            .as_ref()
            .and_then(|entry| entry.image.as_ref())
            .map(|image| image.image.transport.as_str())
    }

    /// Reference of the currently booted image, if any.
    pub fn booted_image(&self) -> Option<&str> {
        self.status
            .booted
            .as_ref()
            .and_then(|entry| entry.image.as_ref())
            .map(|image| image.image.image.as_str())
    }
}

/// What `skopeo inspect` returns, reduced to the fields drift detection
/// needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InspectReport {
    #[serde(rename = "Digest", default)]
    pub digest: String,
    #[serde(rename = "Layers", default)]
    pub layers: Vec<String>,
}

/// Outcome of a base-image freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    Upgraded,
    Rebuilt,
}

/// Filesystem locations the reconciler works against.
#[derive(Debug, Clone)]
pub struct ImagePaths {
    pub config: PathBuf,
    pub containerfile: PathBuf,
    pub resources_dir: PathBuf,
}

/// Drives `bootc`, `podman` and `skopeo` to realize the declarative config.
pub struct ImageReconciler<'a> {
    runner: &'a dyn CommandRunner,
    cancel: &'a CancelToken,
    paths: &'a ImagePaths,
    history: &'a HistoryStore,
    reporter: &'a Reporter,
}

impl<'a> ImageReconciler<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        cancel: &'a CancelToken,
        paths: &'a ImagePaths,
        history: &'a HistoryStore,
        reporter: &'a Reporter,
    ) -> Self {
        Self {
            runner,
            cancel,
            paths,
            history,
            reporter,
        }
    }

    /// Current host image status per the host tool.
    pub fn status(&self) -> Result<HostStatus> {
        let output = self.runner.run("bootc status --format json", self.cancel)?;
        if !output.success() {
            return Err(ApmError::NotAtomicSystem.into());
        }
        serde_json::from_str(&output.stdout).context("Failed to parse bootc status output")
    }

    /// Whether this host is managed as an atomic image at all.
    pub fn is_atomic(&self) -> bool {
        self.status()
            .map(|status| status.status.booted.is_some())
            .unwrap_or(false)
    }

    /// The base image a synthesized default config should reference: the
    /// configured spec image, or the `FROM` of the previously generated
    /// containerfile when the host already runs a locally modified image.
    pub fn default_base_image(&self) -> Result<String> {
        let status = self.status()?;
        if status.booted_transport() == Some("containers-storage") {
            return config::base_image_of_containerfile(&self.paths.containerfile);
        }
        status
            .spec
            .image
            .clone()
            .map(|image| image.image)
            .or_else(|| status.booted_image().map(str::to_string))
            .ok_or_else(|| ApmError::NotAtomicSystem.into())
    }

    /// Build the local root image from the generated containerfile.
    ///
    /// Returns the resulting local image id; failing to find an image under
    /// the fixed tag afterwards is a build failure.
    pub fn build_image(&self, pull_always: bool) -> Result<String> {
        self.reporter.progress("image.build", "Building image", 0);
        let pull = if pull_always { " --pull=always" } else { "" };
        let command = format!("podman build{pull} --squash -t {IMAGE_TAG} {BUILD_CONTEXT}");
        let output = self.runner.run(&command, self.cancel)?;
        if !output.success() {
            return Err(ApmError::BuildFailed {
                message: last_line(&output.combined()),
            }
            .into());
        }
        self.reporter.progress("image.build", "Building image", 90);

        let listed = self
            .runner
            .run(&format!("podman images -q {IMAGE_TAG}"), self.cancel)?;
        let id = listed.stdout.lines().next().unwrap_or("").trim().to_string();
        if id.is_empty() {
            return Err(ApmError::BuildFailed {
                message: format!("no image tagged '{IMAGE_TAG}' after build"),
            }
            .into());
        }
        self.reporter.progress("image.build", "Building image", 100);
        info!(image = %id, "image built");
        Ok(id)
    }

    /// Point the host root at a locally stored image.
    pub fn switch_image(&self, id: &str) -> Result<()> {
        let command = format!("bootc switch --transport containers-storage {id}");
        let output = self.runner.run(&command, self.cancel)?;
        if !output.success() {
            return Err(ApmError::SwitchFailed {
                message: last_line(&output.combined()),
            }
            .into());
        }
        Ok(())
    }

    /// Mount a transient writable overlay over `/usr`.
    pub fn usr_overlay(&self) -> Result<()> {
        let output = self.runner.run("bootc usr-overlay", self.cancel)?;
        if !output.success() {
            anyhow::bail!("bootc usr-overlay failed: {}", last_line(&output.combined()));
        }
        Ok(())
    }

    /// Layer digests of an image, via the registry inspector.
    fn inspect_layers(&self, transport_ref: &str) -> Result<Vec<String>> {
        let output = self
            .runner
            .run(&format!("skopeo inspect {transport_ref}"), self.cancel)?;
        if !output.success() {
            return Err(ApmError::RemoteInspectFailed {
                reference: transport_ref.to_string(),
            }
            .into());
        }
        let report: InspectReport = serde_json::from_str(&output.stdout)
            .map_err(|_| ApmError::RemoteInspectFailed {
                reference: transport_ref.to_string(),
            })?;
        Ok(report.layers)
    }

    /// Check whether the base image moved; pull and reapply when it did.
    ///
    /// Pristine hosts (booted straight off a registry image) defer to the
    /// host tool's own upgrade. Locally built hosts compare the remote base
    /// layers against the stored image and rebuild on mismatch.
    pub fn check_and_update_base(&self, cfg: &ImageConfig) -> Result<UpdateOutcome> {
        let _task = self.reporter.task("image.update", "Checking base image");
        let status = self.status()?;

        if status.booted_transport() != Some("containers-storage") {
            let check = self.runner.run("bootc upgrade --check", self.cancel)?;
            if check.success() && check.stdout.contains("No changes") {
                debug!("pristine image is current");
                return Ok(UpdateOutcome::UpToDate);
            }
            let upgrade = self.runner.run("bootc upgrade", self.cancel)?;
            if upgrade.code != Some(0) {
                anyhow::bail!("bootc upgrade failed: {}", last_line(&upgrade.combined()));
            }
            return Ok(UpdateOutcome::Upgraded);
        }

        let base = config::base_image_of_containerfile(&self.paths.containerfile)?;
        let remote = self.inspect_layers(&format!("docker://{base}"))?;
        let local = self.inspect_layers(&format!("containers-storage:{IMAGE_TAG}"))?;
        if remote == local {
            debug!("layer digests match, no drift");
            return Ok(UpdateOutcome::UpToDate);
        }

        info!("base image drifted, rebuilding");
        let id = self.build_image(true)?;
        self.switch_image(&id)?;
        self.history.append(cfg, &id)?;
        self.prune_old_images();
        Ok(UpdateOutcome::Rebuilt)
    }

    /// Build the configured image and make it the next root.
    ///
    /// Refuses to rebuild an unchanged configuration unless `allow_same`.
    /// History is appended only after a successful switch; a failed switch
    /// leaves the built image in storage for the next prune.
    pub fn build_and_switch(
        &self,
        cfg: &ImageConfig,
        pull: bool,
        allow_same: bool,
    ) -> Result<String> {
        let _task = self.reporter.task("image.apply", "Applying image configuration");

        if !allow_same
            && let Some(last) = self.history.latest()?
            && last.config == *cfg
        {
            return Err(ApmError::ImageNotChanged.into());
        }

        cfg.write_containerfile(
            &self.paths.containerfile,
            &self.paths.resources_dir.to_string_lossy(),
            &self.paths.config.to_string_lossy(),
        )?;

        let id = self.build_image(pull)?;
        self.switch_image(&id)?;
        self.history.append(cfg, &id)?;
        self.prune_old_images();
        Ok(id)
    }

    /// Best-effort cleanup of superseded local images.
    fn prune_old_images(&self) {
        if let Err(err) = self.runner.run("podman image prune -f", self.cancel) {
            debug!(error = %err, "image prune failed");
        }
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("unknown error")
        .trim()
        .to_string()
}
