//! APT orchestration engine.
//!
//! Drives `apt-get`/`apt-cache` from the parent process: dry runs are parsed
//! into change-sets, mutating invocations are serialized through the
//! process-wide tool lock, output is classified against the error catalog,
//! and the catalog store is kept in sync with what the tool actually did.

pub mod errors;
pub mod parser;
pub mod rpm;

use crate::catalog::{CatalogStore, PackageRecord, Scope};
use crate::dialog::ChangeGate;
use crate::error::ApmError;
use crate::events::Reporter;
use crate::runner::{CancelToken, CommandRunner};
use anyhow::{Context, Result, bail};
use errors::{AptError, find_critical};
use parser::ChangeSet;
use std::io::BufReader;
use std::sync::Mutex;
use tracing::{debug, info};

/// Process-wide lock over mutating package tool invocations.
///
/// Held for the whole subprocess lifetime of `install`/`remove` and for the
/// cache-refresh step of `update`. Dry runs do not take it.
static TOOL_LOCK: Mutex<()> = Mutex::new(());

/// Which mutating verb a request maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckAction {
    Install,
    Remove,
}

impl CheckAction {
    pub fn verb(self) -> &'static str {
        match self {
            CheckAction::Install => "install",
            CheckAction::Remove => "remove",
        }
    }

    fn display(self) -> &'static str {
        match self {
            CheckAction::Install => "installation",
            CheckAction::Remove => "removal",
        }
    }
}

/// Seam into the image subsystem for atomic-apply mode.
///
/// When a mutating request carries `--apply`, the engine records the user's
/// desire in the declarative config and requests one rebuild, regardless of
/// whether the tool had anything left to do.
pub trait AtomicApplier {
    /// Record a desired install. Returns whether the config changed.
    fn record_install(&self, name: &str) -> Result<bool>;
    /// Record a desired removal. Returns whether the config changed.
    fn record_remove(&self, name: &str) -> Result<bool>;
    /// Rebuild and switch to the updated image.
    fn rebuild(&self) -> Result<()>;
}

/// Result of a successful mutating action.
#[derive(Debug, Default)]
pub struct ActionOutcome {
    pub changes: ChangeSet,
    /// Non-critical catalog matches that accompanied the run.
    pub errors: Vec<AptError>,
    /// Whether atomic apply mutated the declarative config.
    pub config_updated: bool,
    /// Whether an image rebuild was requested.
    pub image_rebuilt: bool,
}

/// The tool found nothing to do for the requested action.
///
/// In atomic-apply mode the declarative config may still have been brought
/// in line with the request; the message reflects that.
#[derive(Debug)]
pub struct NoCandidates {
    pub action: CheckAction,
    pub config_updated: bool,
}

impl std::error::Error for NoCandidates {}

/// A critical tool error, kept structured so callers can read the
/// stale-cache bit and decide whether to refresh and retry.
#[derive(Debug)]
pub struct CriticalToolError(pub AptError);

impl std::fmt::Display for CriticalToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.message())
    }
}

impl std::error::Error for CriticalToolError {}

impl std::fmt::Display for NoCandidates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "No candidates for {} found", self.action.display())?;
        if self.config_updated {
            write!(
                f,
                ". A difference in the package list was found in the local configuration, the image has been updated"
            )?;
        }
        Ok(())
    }
}

/// The APT action engine.
pub struct AptActions<'a> {
    runner: &'a dyn CommandRunner,
    store: &'a CatalogStore,
    reporter: &'a Reporter,
    cancel: &'a CancelToken,
}

impl<'a> AptActions<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        store: &'a CatalogStore,
        reporter: &'a Reporter,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            runner,
            store,
            reporter,
            cancel,
        }
    }

    /// Dry-run the action and return the parsed change-set plus every
    /// catalog match. Side-effect free and unlocked; concurrent checks are
    /// fine.
    pub fn check(
        &self,
        action: CheckAction,
        packages: &[String],
    ) -> Result<(ChangeSet, Vec<AptError>)> {
        let _task = self.reporter.task("system.check", "Checking packages");
        if packages.is_empty() {
            return Err(ApmError::PackageNameRequired.into());
        }
        let command = format!("apt-get -s {} {}", action.verb(), packages.join(" "));
        let output = self.runner.run(&command, self.cancel)?;
        let errors = errors::analyze(&output.combined());
        let mut changes = parser::parse_changes(&output.stdout);
        self.canonicalize(&mut changes);
        Ok((changes, errors))
    }

    /// Install packages, optionally recording them in the image config.
    pub fn install(
        &self,
        packages: &[String],
        gate: &dyn ChangeGate,
        applier: Option<&dyn AtomicApplier>,
    ) -> Result<ActionOutcome> {
        self.mutate(CheckAction::Install, packages, gate, applier)
    }

    /// Remove packages, optionally recording them in the image config.
    pub fn remove(
        &self,
        packages: &[String],
        gate: &dyn ChangeGate,
        applier: Option<&dyn AtomicApplier>,
    ) -> Result<ActionOutcome> {
        self.mutate(CheckAction::Remove, packages, gate, applier)
    }

    fn mutate(
        &self,
        action: CheckAction,
        packages: &[String],
        gate: &dyn ChangeGate,
        applier: Option<&dyn AtomicApplier>,
    ) -> Result<ActionOutcome> {
        let (event, display) = match action {
            CheckAction::Install => ("system.install", "Installing packages"),
            CheckAction::Remove => ("system.remove", "Removing packages"),
        };
        let _task = self.reporter.task(event, display);
        if packages.is_empty() {
            return Err(ApmError::PackageNameRequired.into());
        }

        let (changes, preflight) = self.check(action, packages)?;
        if let Some(critical) = find_critical(&preflight) {
            return Err(CriticalToolError(critical.clone()).into());
        }

        let planned = match action {
            CheckAction::Install => changes.new_installed_count > 0 || changes.upgraded_count > 0,
            CheckAction::Remove => changes.removed_count > 0,
        };
        if !planned {
            // Nothing for the tool to do; atomic apply still reconciles the
            // declarative config with the user's expressed desire.
            let config_updated = self.reconcile_config(action, packages, applier)?;
            return Err(NoCandidates {
                action,
                config_updated,
            }
            .into());
        }

        let candidates = self.candidate_records(action, &changes);
        if !gate.confirm(action, &changes, &candidates)? {
            return Err(ApmError::DialogCancelled {
                action: action.display().to_string(),
            }
            .into());
        }

        let output = {
            let _lock = TOOL_LOCK.lock().unwrap();
            let command = format!("apt-get -y {} {}", action.verb(), packages.join(" "));
            info!(command, "executing package tool");
            self.runner.run(&command, self.cancel)?
        };
        let run_errors = errors::analyze(&output.combined());
        if let Some(critical) = find_critical(&run_errors) {
            return Err(CriticalToolError(critical.clone()).into());
        }
        if !output.success() {
            bail!(
                "package tool exited with status {}",
                output.code.map_or_else(|| "signal".to_string(), |c| c.to_string())
            );
        }

        // Reflect what the tool actually did before touching anything else.
        let installed = rpm::installed_map(self.runner, self.cancel)?;
        self.store.sync_installed(&Scope::Host, &installed)?;

        let mut outcome = ActionOutcome {
            changes,
            errors: run_errors,
            ..Default::default()
        };
        if applier.is_some() {
            outcome.config_updated = self.reconcile_config(action, packages, applier)?;
            outcome.image_rebuilt = outcome.config_updated;
        }
        Ok(outcome)
    }

    /// Refresh the cache and rebuild the catalog from the metadata dump.
    ///
    /// This is the only path that creates catalog rows. Returns the record
    /// count.
    pub fn update(&self) -> Result<usize> {
        let _task = self.reporter.task("system.update", "Updating package database");

        let output = {
            let _lock = TOOL_LOCK.lock().unwrap();
            self.runner.run("apt-get update", self.cancel)?
        };
        let refresh_errors = errors::analyze(&output.combined());
        if let Some(critical) = find_critical(&refresh_errors) {
            return Err(CriticalToolError(critical.clone()).into());
        }

        self.reporter
            .progress("system.update", "Updating package database", 30);

        let installed = rpm::installed_map(self.runner, self.cancel)?;
        let stream = self
            .runner
            .open_stream("apt-cache dumpavail", self.cancel)?;
        let mut records: Vec<PackageRecord> = Vec::new();
        let count = parser::parse_dumpavail(BufReader::new(stream), |meta| {
            let installed_version = installed.get(&meta.name).cloned();
            records.push(PackageRecord {
                installed: installed_version.is_some(),
                installed_version: installed_version.unwrap_or_default(),
                changelog: parser::latest_changelog_entry(&meta.changelog),
                name: meta.name,
                section: meta.section,
                maintainer: meta.maintainer,
                version: meta.version,
                installed_size: meta.installed_size,
                download_size: meta.size,
                filename: meta.filename,
                description: meta.description,
                depends: meta.depends,
                provides: meta.provides,
                exporting: false,
            });
            Ok(())
        })
        .context("Failed to parse package metadata dump")?;

        self.reporter
            .progress("system.update", "Updating package database", 80);

        self.store.save(&Scope::Host, &records)?;
        self.store.sync_installed(&Scope::Host, &installed)?;
        debug!(count, "catalog rebuilt");
        Ok(count)
    }

    /// Bring the declarative config in line with the requested names.
    fn reconcile_config(
        &self,
        action: CheckAction,
        packages: &[String],
        applier: Option<&dyn AtomicApplier>,
    ) -> Result<bool> {
        let Some(applier) = applier else {
            return Ok(false);
        };
        let mut changed = false;
        for token in packages {
            let name = rpm::canonical_name(token);
            let recorded = match action {
                CheckAction::Install => applier.record_install(name)?,
                CheckAction::Remove => applier.record_remove(name)?,
            };
            changed = changed || recorded;
        }
        if changed {
            applier.rebuild()?;
        }
        Ok(changed)
    }

    /// Catalog rows for the packages a dry run plans to touch, used by the
    /// confirmation dialog.
    fn candidate_records(&self, action: CheckAction, changes: &ChangeSet) -> Vec<PackageRecord> {
        let names: Vec<&String> = match action {
            CheckAction::Install => changes
                .new_installed_packages
                .iter()
                .chain(&changes.extra_installed_packages)
                .chain(&changes.upgraded_packages)
                .collect(),
            CheckAction::Remove => changes.removed_packages.iter().collect(),
        };
        names
            .into_iter()
            .filter_map(|name| self.store.get_by_name(&Scope::Host, name).ok())
            .collect()
    }

    /// Canonicalize `.32bit` echoes back to the bare name when the bare name
    /// is the one the catalog knows.
    fn canonicalize(&self, changes: &mut ChangeSet) {
        for list in [
            &mut changes.extra_installed_packages,
            &mut changes.upgraded_packages,
            &mut changes.new_installed_packages,
            &mut changes.removed_packages,
        ] {
            for name in list.iter_mut() {
                if let Some(bare) = rpm::strip_biarch_suffix(name)
                    && self.store.get_by_name(&Scope::Host, name).is_err()
                    && self.store.get_by_name(&Scope::Host, bare).is_ok()
                {
                    *name = bare.to_string();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::{AutoApprove, RejectAll};
    use crate::runner::{MockCommandRunner, ToolOutput};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const INSTALL_DRY_RUN: &str = "\
The following NEW packages will be installed:
  zip
0 upgraded, 1 newly installed, 0 removed and 4 not upgraded.
";

    const QIA_ZIP: &str = "Name        : zip\nVersion     : 3.0\n";

    fn seeded_store() -> CatalogStore {
        let store = CatalogStore::open_in_memory().unwrap();
        store
            .save(
                &Scope::Host,
                &[PackageRecord {
                    name: "zip".to_string(),
                    version: "3.0".to_string(),
                    ..Default::default()
                }],
            )
            .unwrap();
        store
    }

    struct NullApplier {
        installs: std::sync::Mutex<Vec<String>>,
        removes: std::sync::Mutex<Vec<String>>,
        rebuilds: AtomicUsize,
        config_changes: bool,
    }

    impl NullApplier {
        fn new(config_changes: bool) -> Self {
            Self {
                installs: std::sync::Mutex::new(Vec::new()),
                removes: std::sync::Mutex::new(Vec::new()),
                rebuilds: AtomicUsize::new(0),
                config_changes,
            }
        }
    }

    impl AtomicApplier for NullApplier {
        fn record_install(&self, name: &str) -> Result<bool> {
            self.installs.lock().unwrap().push(name.to_string());
            Ok(self.config_changes)
        }

        fn record_remove(&self, name: &str) -> Result<bool> {
            self.removes.lock().unwrap().push(name.to_string());
            Ok(self.config_changes)
        }

        fn rebuild(&self) -> Result<()> {
            self.rebuilds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn check_parses_changes_and_errors() {
        let store = seeded_store();
        let runner = MockCommandRunner::new();
        runner.respond(0, INSTALL_DRY_RUN, "W: Permission denied");
        let cancel = CancelToken::new();
        let reporter = Reporter::disabled();
        let engine = AptActions::new(&runner, &store, &reporter, &cancel);

        let (changes, errors) = engine
            .check(CheckAction::Install, &["zip".to_string()])
            .unwrap();
        assert_eq!(changes.new_installed_packages, vec!["zip"]);
        assert_eq!(errors.len(), 1);
        assert!(runner.calls()[0].starts_with("apt-get -s install"));
    }

    #[test]
    fn check_requires_a_package_name() {
        let store = seeded_store();
        let runner = MockCommandRunner::new();
        let cancel = CancelToken::new();
        let reporter = Reporter::disabled();
        let engine = AptActions::new(&runner, &store, &reporter, &cancel);
        let err = engine.check(CheckAction::Install, &[]).unwrap_err();
        assert!(err.to_string().contains("package name"));
    }

    #[test]
    fn install_runs_tool_and_syncs_catalog() {
        let store = seeded_store();
        let runner = MockCommandRunner::new();
        runner.respond(0, INSTALL_DRY_RUN, ""); // dry run
        runner.respond(0, "Completed.", ""); // apt-get -y install
        runner.respond(0, QIA_ZIP, ""); // rpm -qia
        let cancel = CancelToken::new();
        let reporter = Reporter::disabled();
        let engine = AptActions::new(&runner, &store, &reporter, &cancel);

        let outcome = engine
            .install(&["zip".to_string()], &AutoApprove, None)
            .unwrap();
        assert_eq!(outcome.changes.new_installed_count, 1);
        assert!(!outcome.image_rebuilt);

        let zip = store.get_by_name(&Scope::Host, "zip").unwrap();
        assert!(zip.installed);
        assert_eq!(zip.installed_version, "3.0");
        assert!(
            runner
                .calls()
                .iter()
                .any(|c| c == "apt-get -y install zip")
        );
    }

    #[test]
    fn install_passes_suffixed_tokens_verbatim() {
        let store = seeded_store();
        let runner = MockCommandRunner::new();
        runner.respond(0, INSTALL_DRY_RUN, "");
        runner.respond(0, "", "");
        runner.respond(0, QIA_ZIP, "");
        let cancel = CancelToken::new();
        let reporter = Reporter::disabled();
        let engine = AptActions::new(&runner, &store, &reporter, &cancel);
        let applier = NullApplier::new(true);

        engine
            .install(&["zip+".to_string()], &AutoApprove, Some(&applier))
            .unwrap();
        assert!(
            runner
                .calls()
                .iter()
                .any(|c| c == "apt-get -y install zip+")
        );
        // The canonical name reaches the image config.
        assert_eq!(*applier.installs.lock().unwrap(), vec!["zip".to_string()]);
        assert_eq!(applier.rebuilds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn critical_preflight_error_stops_before_the_tool_runs() {
        let store = seeded_store();
        let runner = MockCommandRunner::new();
        runner.respond(0, "", "E: Couldn't find package ghost");
        let cancel = CancelToken::new();
        let reporter = Reporter::disabled();
        let engine = AptActions::new(&runner, &store, &reporter, &cancel);

        let err = engine
            .install(&["ghost".to_string()], &AutoApprove, None)
            .unwrap_err();
        assert!(err.to_string().contains("Couldn't find package ghost"));
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn rejected_gate_leaves_everything_unchanged() {
        let store = seeded_store();
        let runner = MockCommandRunner::new();
        runner.respond(0, INSTALL_DRY_RUN, "");
        let cancel = CancelToken::new();
        let reporter = Reporter::disabled();
        let engine = AptActions::new(&runner, &store, &reporter, &cancel);

        let err = engine
            .install(&["zip".to_string()], &RejectAll, None)
            .unwrap_err();
        assert!(err.to_string().contains("dialog cancelled"));
        // Only the dry run ran.
        assert_eq!(runner.calls().len(), 1);
        assert!(!store.get_by_name(&Scope::Host, "zip").unwrap().installed);
    }

    #[test]
    fn remove_of_absent_package_reconciles_atomic_config() {
        let store = seeded_store();
        let runner = MockCommandRunner::new();
        runner.respond(
            0,
            "Package zip is not installed, so not removed\n0 upgraded, 0 newly installed, 0 removed and 0 not upgraded.\n",
            "",
        );
        let cancel = CancelToken::new();
        let reporter = Reporter::disabled();
        let engine = AptActions::new(&runner, &store, &reporter, &cancel);
        let applier = NullApplier::new(true);

        let err = engine
            .remove(&["zip".to_string()], &AutoApprove, Some(&applier))
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("No candidates for removal found"));
        assert!(message.contains("the image has been updated"));
        assert_eq!(*applier.removes.lock().unwrap(), vec!["zip".to_string()]);
        assert_eq!(applier.rebuilds.load(Ordering::SeqCst), 1);
        // No mutating tool call happened.
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn no_candidates_without_config_change_keeps_short_message() {
        let store = seeded_store();
        let runner = MockCommandRunner::new();
        runner.respond(
            0,
            "0 upgraded, 0 newly installed, 0 removed and 0 not upgraded.\n",
            "",
        );
        let cancel = CancelToken::new();
        let reporter = Reporter::disabled();
        let engine = AptActions::new(&runner, &store, &reporter, &cancel);
        let applier = NullApplier::new(false);

        let err = engine
            .remove(&["zip".to_string()], &AutoApprove, Some(&applier))
            .unwrap_err();
        assert_eq!(err.to_string(), "No candidates for removal found");
        assert_eq!(applier.rebuilds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn update_streams_dump_and_syncs_once() {
        let store = CatalogStore::open_in_memory().unwrap();
        let runner = MockCommandRunner::new();
        runner.respond(0, "", ""); // apt-get update
        runner.respond(0, QIA_ZIP, ""); // rpm -qia
        runner.respond_stream(
            "Package: zip\nVersion: 2:3.0-alt2\nChangelog: log\n * today\n - fix\n * yesterday\n - old\n\nPackage: unzip\nVersion: 6.0\n\n",
        );
        let cancel = CancelToken::new();
        let reporter = Reporter::disabled();
        let engine = AptActions::new(&runner, &store, &reporter, &cancel);

        let count = engine.update().unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.count_all(&Scope::Host).unwrap(), 2);
        let zip = store.get_by_name(&Scope::Host, "zip").unwrap();
        assert!(zip.installed);
        assert_eq!(zip.installed_version, "3.0");
        assert_eq!(zip.version, "3.0");
        assert!(zip.changelog.contains("today"));
        assert!(!zip.changelog.contains("yesterday"));
        let unzip = store.get_by_name(&Scope::Host, "unzip").unwrap();
        assert!(!unzip.installed);
    }

    #[test]
    fn update_surfaces_critical_refresh_errors() {
        let store = CatalogStore::open_in_memory().unwrap();
        let runner = MockCommandRunner::new();
        runner.respond(0, "", "E: Unable to lock the list directory");
        let cancel = CancelToken::new();
        let reporter = Reporter::disabled();
        let engine = AptActions::new(&runner, &store, &reporter, &cancel);
        let err = engine.update().unwrap_err();
        assert!(err.to_string().contains("Unable to lock the list directory"));
    }

    #[test]
    fn biarch_echo_canonicalizes_to_known_bare_name() {
        let store = seeded_store();
        let runner = MockCommandRunner::new();
        runner.respond(
            0,
            "The following NEW packages will be installed:\n  zip.32bit\n0 upgraded, 1 newly installed, 0 removed and 0 not upgraded.\n",
            "",
        );
        let cancel = CancelToken::new();
        let reporter = Reporter::disabled();
        let engine = AptActions::new(&runner, &store, &reporter, &cancel);
        let (changes, _) = engine
            .check(CheckAction::Install, &["zip".to_string()])
            .unwrap();
        assert_eq!(changes.new_installed_packages, vec!["zip"]);
    }

    /// Runner that asserts mutating invocations never overlap.
    struct SerializingRunner {
        in_flight: AtomicBool,
        overlapped: AtomicBool,
    }

    impl SerializingRunner {
        fn new() -> Self {
            Self {
                in_flight: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
            }
        }
    }

    impl CommandRunner for SerializingRunner {
        fn run(&self, command: &str, _cancel: &CancelToken) -> Result<ToolOutput> {
            if command.starts_with("apt-get -y") {
                if self.in_flight.swap(true, Ordering::SeqCst) {
                    self.overlapped.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(std::time::Duration::from_millis(30));
                self.in_flight.store(false, Ordering::SeqCst);
                return Ok(ToolOutput {
                    code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            let stdout = if command.starts_with("apt-get -s") {
                INSTALL_DRY_RUN.to_string()
            } else if command.starts_with("rpm -qia") {
                QIA_ZIP.to_string()
            } else {
                String::new()
            };
            Ok(ToolOutput {
                code: Some(0),
                stdout,
                stderr: String::new(),
            })
        }

        fn open_stream(
            &self,
            _command: &str,
            _cancel: &CancelToken,
        ) -> Result<Box<dyn std::io::Read + Send>> {
            Ok(Box::new(std::io::Cursor::new(Vec::new())))
        }
    }

    #[test]
    fn concurrent_installs_serialize_tool_invocations() {
        let store = Arc::new(seeded_store());
        let runner = Arc::new(SerializingRunner::new());
        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = Arc::clone(&store);
            let runner = Arc::clone(&runner);
            handles.push(std::thread::spawn(move || {
                let cancel = CancelToken::new();
                let reporter = Reporter::disabled();
                let engine = AptActions::new(runner.as_ref(), &store, &reporter, &cancel);
                engine
                    .install(&["zip".to_string()], &AutoApprove, None)
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!runner.overlapped.load(Ordering::SeqCst));
    }
}
