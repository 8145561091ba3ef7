//! Atomic image operations.

use super::{AppState, envelope};
use crate::apt::{AptActions, NoCandidates};
use crate::config::require_root;
use crate::dialog::AutoApprove;
use crate::error::ApmError;
use crate::events::Reporter;
use crate::image::config::ImageConfig;
use crate::image::{ImageReconciler, UpdateOutcome};
use crate::response::{Envelope, to_data};
use crate::runner::CancelToken;
use anyhow::Result;
use serde_json::{Value, json};

fn reconciler<'a>(
    state: &'a AppState,
    reporter: &'a Reporter,
    cancel: &'a CancelToken,
    paths: &'a crate::image::ImagePaths,
) -> ImageReconciler<'a> {
    ImageReconciler::new(state.runner.as_ref(), cancel, paths, &state.history, reporter)
}

fn load_config(
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
) -> Result<ImageConfig> {
    let paths = state.config.image_paths();
    let runner = state.runner.as_ref();
    let history = &state.history;
    ImageConfig::load_or_default(&state.config.image_config_path, || {
        ImageReconciler::new(runner, cancel, &paths, history, reporter).default_base_image()
    })
}

/// Host image status with the declarative config overlaid.
pub fn status(state: &AppState, reporter: &Reporter, cancel: &CancelToken) -> Envelope {
    let result = (|| -> Result<Value> {
        let paths = state.config.image_paths();
        let status = reconciler(state, reporter, cancel, &paths).status()?;
        let config = load_config(state, reporter, cancel)?;
        Ok(json!({
            "message": "Image status",
            "status": to_data(&status),
            "config": to_data(&config),
        }))
    })();
    envelope(reporter, result)
}

/// Build the configured image and switch the root to it.
pub fn apply(
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
    pull: bool,
    allow_same: bool,
) -> Envelope {
    let result = (|| -> Result<Value> {
        require_root()?;
        let paths = state.config.image_paths();
        let rec = reconciler(state, reporter, cancel, &paths);
        if !rec.is_atomic() {
            return Err(ApmError::NotAtomicSystem.into());
        }
        let config = load_config(state, reporter, cancel)?;
        let id = rec.build_and_switch(&config, pull, allow_same)?;
        Ok(json!({
            "message": "Image applied, reboot to use the new deployment",
            "image": id,
        }))
    })();
    envelope(reporter, result)
}

/// Check the base image for drift and reapply when it moved.
pub fn update(state: &AppState, reporter: &Reporter, cancel: &CancelToken) -> Envelope {
    let result = (|| -> Result<Value> {
        require_root()?;
        let paths = state.config.image_paths();
        let rec = reconciler(state, reporter, cancel, &paths);
        if !rec.is_atomic() {
            return Err(ApmError::NotAtomicSystem.into());
        }
        let config = load_config(state, reporter, cancel)?;
        let outcome = rec.check_and_update_base(&config)?;
        let message = match outcome {
            UpdateOutcome::UpToDate => "Base image is up to date",
            UpdateOutcome::Upgraded => "Host upgraded to the latest image",
            UpdateOutcome::Rebuilt => "Base image changed, local image rebuilt",
        };
        Ok(json!({
            "message": message,
            "updated": outcome != UpdateOutcome::UpToDate,
        }))
    })();
    envelope(reporter, result)
}

/// Recorded configuration snapshots, newest first.
pub fn history(state: &AppState, reporter: &Reporter, limit: Option<u32>) -> Envelope {
    let result = (|| -> Result<Value> {
        let entries = state.history.list(limit)?;
        Ok(json!({
            "message": format!("{} history entries", entries.len()),
            "history": to_data(&entries),
            "totalCount": entries.len(),
        }))
    })();
    envelope(reporter, result)
}

/// The current declarative config.
pub fn config_get(state: &AppState, reporter: &Reporter, cancel: &CancelToken) -> Envelope {
    let result = (|| -> Result<Value> {
        let config = load_config(state, reporter, cancel)?;
        Ok(json!({
            "message": "Current image configuration",
            "config": to_data(&config),
        }))
    })();
    envelope(reporter, result)
}

/// Replace the declarative config wholesale.
pub fn config_save(state: &AppState, reporter: &Reporter, raw: &str) -> Envelope {
    let result = (|| -> Result<Value> {
        require_root()?;
        let config: ImageConfig = serde_json::from_str(raw).map_err(|err| {
            ApmError::MalformedConfig {
                path: state.config.image_config_path.clone(),
                message: err.to_string(),
            }
        })?;
        config.save(&state.config.image_config_path)?;
        Ok(json!({ "message": "Image configuration saved" }))
    })();
    envelope(reporter, result)
}

/// Apply the configured package lists from inside the image build.
///
/// This is the `RUN apm system image build` step of the generated
/// containerfile: the running container refreshes its catalog, installs the
/// desired list, and removes the undesired one.
pub fn build(state: &AppState, reporter: &Reporter, cancel: &CancelToken) -> Envelope {
    let result = (|| -> Result<Value> {
        require_root()?;
        let config = ImageConfig::load_or_default(&state.config.image_config_path, || {
            Err(ApmError::MalformedConfig {
                path: state.config.image_config_path.clone(),
                message: "missing image configuration inside the build".to_string(),
            }
            .into())
        })?;
        let engine = AptActions::new(state.runner.as_ref(), &state.store, reporter, cancel);
        engine.update()?;
        if !config.packages.install.is_empty() {
            tolerate_no_candidates(engine.install(&config.packages.install, &AutoApprove, None))?;
        }
        if !config.packages.remove.is_empty() {
            tolerate_no_candidates(engine.remove(&config.packages.remove, &AutoApprove, None))?;
        }
        Ok(json!({
            "message": "Image build finished",
            "installed": config.packages.install,
            "removed": config.packages.remove,
        }))
    })();
    envelope(reporter, result)
}

/// Idempotent replay: a list already realized by a previous build is fine.
fn tolerate_no_candidates<T>(result: Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.downcast_ref::<NoCandidates>().is_some() => Ok(()),
        Err(err) => Err(err),
    }
}
