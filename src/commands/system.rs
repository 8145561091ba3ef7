//! Host package operations.

use super::{AppState, envelope};
use crate::apt::{AptActions, CheckAction, CriticalToolError};
use crate::catalog::{CatalogQuery, Filter, Scope, SortOrder};
use crate::config::require_root;
use crate::dialog::ChangeGate;
use crate::error::ApmError;
use crate::events::Reporter;
use crate::image::history::HistoryStore;
use crate::image::{ImagePaths, ImageReconciler};
use crate::image::config::ImageConfig;
use crate::response::{Envelope, to_data};
use crate::runner::{CancelToken, CommandRunner};
use anyhow::Result;
use serde_json::{Value, json};
use tracing::info;

/// Refresh the cache and rebuild the catalog.
pub fn update(state: &AppState, reporter: &Reporter, cancel: &CancelToken) -> Envelope {
    let result = (|| -> Result<Value> {
        require_root()?;
        let engine = AptActions::new(state.runner.as_ref(), &state.store, reporter, cancel);
        let count = engine.update()?;
        Ok(json!({
            "message": format!("Package database updated, {count} packages"),
            "count": count,
        }))
    })();
    envelope(reporter, result)
}

/// Dry-run an install or remove.
pub fn check(
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
    action: CheckAction,
    packages: &[String],
) -> Envelope {
    let result = (|| -> Result<Value> {
        let engine = AptActions::new(state.runner.as_ref(), &state.store, reporter, cancel);
        let (changes, errors) = engine.check(action, packages)?;
        let messages: Vec<String> = errors.iter().map(|e| e.message()).collect();
        Ok(json!({
            "message": format!("Simulated {} finished", action.verb()),
            "info": to_data(&changes),
            "errors": messages,
        }))
    })();
    envelope(reporter, result)
}

/// Install packages on the host.
pub fn install(
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
    packages: &[String],
    apply: bool,
    gate: &dyn ChangeGate,
) -> Envelope {
    mutate(state, reporter, cancel, CheckAction::Install, packages, apply, gate)
}

/// Remove packages from the host.
pub fn remove(
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
    packages: &[String],
    apply: bool,
    gate: &dyn ChangeGate,
) -> Envelope {
    mutate(state, reporter, cancel, CheckAction::Remove, packages, apply, gate)
}

fn mutate(
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
    action: CheckAction,
    packages: &[String],
    apply: bool,
    gate: &dyn ChangeGate,
) -> Envelope {
    let result = (|| -> Result<Value> {
        require_root()?;
        let engine = AptActions::new(state.runner.as_ref(), &state.store, reporter, cancel);
        let applier = if apply {
            Some(make_applier(state, reporter, cancel)?)
        } else {
            None
        };
        let applier_ref = applier
            .as_ref()
            .map(|a| a as &dyn crate::apt::AtomicApplier);

        let run = |engine: &AptActions<'_>| match action {
            CheckAction::Install => engine.install(packages, gate, applier_ref),
            CheckAction::Remove => engine.remove(packages, gate, applier_ref),
        };

        let outcome = match run(&engine) {
            Ok(outcome) => outcome,
            // One refresh-and-retry when the failure smells like a stale
            // cache; never more.
            Err(err)
                if err
                    .downcast_ref::<CriticalToolError>()
                    .is_some_and(|c| c.0.suggests_cache_refresh()) =>
            {
                info!("stale cache suspected, refreshing and retrying once");
                engine.update()?;
                run(&engine)?
            }
            Err(err) => return Err(err),
        };

        let verb = match action {
            CheckAction::Install => "installed",
            CheckAction::Remove => "removed",
        };
        let touched = match action {
            CheckAction::Install => outcome.changes.new_installed_count + outcome.changes.upgraded_count,
            CheckAction::Remove => outcome.changes.removed_count,
        };
        let mut data = json!({
            "message": format!("{touched} packages {verb}"),
            "info": to_data(&outcome.changes),
        });
        if apply {
            data["imageUpdated"] = Value::Bool(outcome.image_rebuilt);
        }
        Ok(data)
    })();
    envelope(reporter, result)
}

/// Detailed record for one package.
pub fn info(state: &AppState, reporter: &Reporter, package: &str) -> Envelope {
    let result = (|| -> Result<Value> {
        ensure_populated(state)?;
        let record = state.store.get_by_name(&Scope::Host, package)?;
        Ok(json!({
            "message": format!("Information about {package}"),
            "package": to_data(&record),
        }))
    })();
    envelope(reporter, result)
}

/// Substring search over the catalog.
pub fn search(
    state: &AppState,
    reporter: &Reporter,
    query: &str,
    installed_only: bool,
) -> Envelope {
    let result = (|| -> Result<Value> {
        ensure_populated(state)?;
        let records = state.store.search(&Scope::Host, query, installed_only)?;
        Ok(json!({
            "message": format!("{} packages found", records.len()),
            "packages": to_data(&records),
            "totalCount": records.len(),
        }))
    })();
    envelope(reporter, result)
}

/// Filtered, sorted, paged listing.
pub fn list(
    state: &AppState,
    reporter: &Reporter,
    filters: &[(String, String)],
    sort: Option<String>,
    descending: bool,
    limit: Option<u32>,
    offset: u32,
) -> Envelope {
    let result = (|| -> Result<Value> {
        ensure_populated(state)?;
        let filters: Vec<Filter> = filters
            .iter()
            .map(|(field, value)| Filter {
                field: field.clone(),
                value: value.clone(),
            })
            .collect();
        let query = CatalogQuery {
            filters: filters.clone(),
            sort_field: sort,
            sort_order: if descending {
                SortOrder::Desc
            } else {
                SortOrder::Asc
            },
            limit,
            offset,
        };
        let records = state.store.query(&Scope::Host, &query)?;
        let total = state.store.count(&Scope::Host, &filters)?;
        Ok(json!({
            "message": format!("{total} packages"),
            "packages": to_data(&records),
            "totalCount": total,
        }))
    })();
    envelope(reporter, result)
}

fn ensure_populated(state: &AppState) -> Result<()> {
    if state.store.count_all(&Scope::Host)? == 0 {
        return Err(ApmError::DatabaseNotPopulated.into());
    }
    Ok(())
}

/// Atomic-apply bridge from the action engine into the image subsystem.
pub(crate) struct ConfigApplier<'a> {
    runner: &'a dyn CommandRunner,
    cancel: &'a CancelToken,
    paths: ImagePaths,
    history: &'a HistoryStore,
    reporter: &'a Reporter,
}

impl<'a> ConfigApplier<'a> {
    fn reconciler(&self) -> ImageReconciler<'_> {
        ImageReconciler::new(self.runner, self.cancel, &self.paths, self.history, self.reporter)
    }

    fn load_config(&self) -> Result<ImageConfig> {
        ImageConfig::load_or_default(&self.paths.config, || self.reconciler().default_base_image())
    }
}

impl crate::apt::AtomicApplier for ConfigApplier<'_> {
    fn record_install(&self, name: &str) -> Result<bool> {
        let mut config = self.load_config()?;
        let changed = config.add_install(name);
        if changed {
            config.save(&self.paths.config)?;
        }
        Ok(changed)
    }

    fn record_remove(&self, name: &str) -> Result<bool> {
        let mut config = self.load_config()?;
        let changed = config.add_remove(name);
        if changed {
            config.save(&self.paths.config)?;
        }
        Ok(changed)
    }

    fn rebuild(&self) -> Result<()> {
        let config = self.load_config()?;
        self.reconciler().build_and_switch(&config, false, true)?;
        Ok(())
    }
}

/// Build the applier, refusing on non-atomic hosts.
fn make_applier<'a>(
    state: &'a AppState,
    reporter: &'a Reporter,
    cancel: &'a CancelToken,
) -> Result<ConfigApplier<'a>> {
    let applier = ConfigApplier {
        runner: state.runner.as_ref(),
        cancel,
        paths: state.config.image_paths(),
        history: &state.history,
        reporter,
    };
    if !applier.reconciler().is_atomic() {
        return Err(ApmError::NotAtomicSystem.into());
    }
    Ok(applier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PackageRecord;
    use crate::config::AppConfig;
    use crate::dialog::AutoApprove;
    use crate::runner::MockCommandRunner;
    use serial_test::serial;
    use std::sync::Arc;

    fn test_state(runner: MockCommandRunner) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            database_path: dir.path().join("apm.db"),
            image_config_path: dir.path().join("image.yml"),
            containerfile_path: dir.path().join("Containerfile"),
            resources_dir: dir.path().join("resources"),
            home: dir.path().to_path_buf(),
        };
        let state = AppState::with_runner(config, Arc::new(runner)).unwrap();
        (state, dir)
    }

    fn seeded(state: &AppState) {
        state
            .store
            .save(
                &Scope::Host,
                &[PackageRecord {
                    name: "zip".to_string(),
                    version: "3.0".to_string(),
                    ..Default::default()
                }],
            )
            .unwrap();
    }

    #[test]
    #[serial]
    fn install_envelope_carries_change_info() {
        unsafe { std::env::set_var("APM_SKIP_PRIVILEGE_CHECK", "1") };
        let runner = MockCommandRunner::new();
        runner.respond(
            0,
            "The following NEW packages will be installed:\n  zip\n0 upgraded, 1 newly installed, 0 removed and 4 not upgraded.\n",
            "",
        );
        runner.respond(0, "", "");
        runner.respond(0, "Name        : zip\nVersion     : 3.0\n", "");
        let (state, _dir) = test_state(runner);
        seeded(&state);

        let reporter = Reporter::disabled();
        let cancel = CancelToken::new();
        let env = install(&state, &reporter, &cancel, &["zip".to_string()], false, &AutoApprove);
        assert!(!env.error);
        assert_eq!(env.data["info"]["newInstalledCount"], 1);
        assert_eq!(env.data["info"]["newInstalledPackages"][0], "zip");
        let zip = state.store.get_by_name(&Scope::Host, "zip").unwrap();
        assert!(zip.installed);
        assert_eq!(zip.installed_version, "3.0");
        unsafe { std::env::remove_var("APM_SKIP_PRIVILEGE_CHECK") };
    }

    #[test]
    #[serial]
    fn stale_cache_triggers_one_update_and_retry() {
        unsafe { std::env::set_var("APM_SKIP_PRIVILEGE_CHECK", "1") };
        let runner = MockCommandRunner::new();
        // First dry run: package unknown (stale-cache kind).
        runner.respond(0, "", "E: Couldn't find package zip");
        // update(): apt-get update, rpm -qia, dumpavail stream.
        runner.respond(0, "", "");
        runner.respond(0, "", "");
        runner.respond_stream("Package: zip\nVersion: 3.0\n\n");
        // Retry: dry run, mutate, rpm sync.
        runner.respond(
            0,
            "The following NEW packages will be installed:\n  zip\n0 upgraded, 1 newly installed, 0 removed and 0 not upgraded.\n",
            "",
        );
        runner.respond(0, "", "");
        runner.respond(0, "Name        : zip\nVersion     : 3.0\n", "");
        let (state, _dir) = test_state(runner);

        let reporter = Reporter::disabled();
        let cancel = CancelToken::new();
        let env = install(&state, &reporter, &cancel, &["zip".to_string()], false, &AutoApprove);
        assert!(!env.error, "message: {}", env.data["message"]);
        unsafe { std::env::remove_var("APM_SKIP_PRIVILEGE_CHECK") };
    }

    #[test]
    fn info_requires_populated_database() {
        let (state, _dir) = test_state(MockCommandRunner::new());
        let reporter = Reporter::disabled();
        let env = info(&state, &reporter, "zip");
        assert!(env.error);
        assert!(
            env.data["message"]
                .as_str()
                .unwrap()
                .contains("apm update")
        );
    }

    #[test]
    fn list_rejects_bad_filter_via_envelope() {
        let (state, _dir) = test_state(MockCommandRunner::new());
        seeded(&state);
        let reporter = Reporter::disabled();
        let env = list(
            &state,
            &reporter,
            &[("bogus".to_string(), "x".to_string())],
            None,
            false,
            None,
            0,
        );
        assert!(env.error);
        assert!(
            env.data["message"]
                .as_str()
                .unwrap()
                .contains("Invalid filter field")
        );
    }

    #[test]
    fn search_reports_total_count() {
        let (state, _dir) = test_state(MockCommandRunner::new());
        seeded(&state);
        let reporter = Reporter::new(Arc::new(crate::events::NullSink), "tx-9");
        let env = search(&state, &reporter, "zi", false);
        assert!(!env.error);
        assert_eq!(env.data["totalCount"], 1);
        assert_eq!(env.transaction.as_deref(), Some("tx-9"));
    }
}
