//! Tracking of applications exported from a container to the host.
//!
//! `distrobox-export` surfaces GUI apps as prefixed desktop entries under
//! `~/.local/share/applications` and console tools as wrapper scripts in
//! `~/.local/bin` carrying a marker line. The catalog's `exporting` flag
//! mirrors what is actually present on disk.

use crate::catalog::{CatalogStore, Scope};
use crate::runner::{CancelToken, CommandRunner};
use anyhow::{Context, Result, bail};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Marker `distrobox-export` writes into generated wrapper scripts.
const BINARY_MARKER: &str = "# distrobox_binary";

/// Desktop entries exported from `container`, by bare application name.
///
/// Exported entries are named `<container>-<app>.desktop`.
pub fn exported_apps(home: &Path, container: &str) -> HashSet<String> {
    let dir = home.join(".local/share/applications");
    let prefix = format!("{container}-");
    let mut apps = HashSet::new();
    let Ok(entries) = fs::read_dir(&dir) else {
        return apps;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(stem) = name.strip_suffix(".desktop")
            && let Some(app) = stem.strip_prefix(&prefix)
        {
            apps.insert(app.to_string());
        }
    }
    apps
}

/// Console wrappers in `~/.local/bin` generated by `distrobox-export`.
pub fn exported_binaries(home: &Path) -> HashSet<String> {
    let dir = home.join(".local/bin");
    let mut binaries = HashSet::new();
    let Ok(entries) = fs::read_dir(&dir) else {
        return binaries;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        if content.lines().any(|line| line.trim() == BINARY_MARKER)
            && let Some(name) = path.file_name().and_then(|n| n.to_str())
        {
            binaries.insert(name.to_string());
        }
    }
    binaries
}

/// Export an application from the container onto the host menu.
pub fn export_app(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    container: &str,
    app: &str,
) -> Result<()> {
    let inner = format!("distrobox-export --app {app}");
    let command = format!(
        "distrobox enter {container} -- sh -c {}",
        shlex::try_quote(&inner).context("unquotable export command")?
    );
    let output = runner.run(&command, cancel)?;
    if !output.success() {
        bail!("Failed to export '{app}' from '{container}'");
    }
    Ok(())
}

/// Remove a previously exported application.
pub fn unexport_app(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
    container: &str,
    app: &str,
) -> Result<()> {
    let inner = format!("distrobox-export --app {app} --delete");
    let command = format!(
        "distrobox enter {container} -- sh -c {}",
        shlex::try_quote(&inner).context("unquotable export command")?
    );
    let output = runner.run(&command, cancel)?;
    if !output.success() {
        bail!("Failed to unexport '{app}' from '{container}'");
    }
    Ok(())
}

/// Mirror on-disk export state into the catalog's `exporting` flags.
pub fn sync_export_flags(
    store: &CatalogStore,
    scope: &Scope,
    home: &Path,
    container: &str,
) -> Result<()> {
    let mut exported = exported_apps(home, container);
    exported.extend(exported_binaries(home));
    let rows = store.search(scope, "", false)?;
    for row in rows {
        let should = exported.contains(&row.name);
        if row.exporting != should {
            store.update_field(scope, &row.name, "exporting", should)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PackageRecord;

    fn touch(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn desktop_entries_are_matched_by_container_prefix() {
        let home = tempfile::tempdir().unwrap();
        let apps = home.path().join(".local/share/applications");
        touch(&apps.join("ubuntu-gimp.desktop"), "[Desktop Entry]");
        touch(&apps.join("ubuntu-code.desktop"), "[Desktop Entry]");
        touch(&apps.join("arch-krita.desktop"), "[Desktop Entry]");
        touch(&apps.join("native.desktop"), "[Desktop Entry]");

        let exported = exported_apps(home.path(), "ubuntu");
        assert_eq!(exported.len(), 2);
        assert!(exported.contains("gimp"));
        assert!(exported.contains("code"));
    }

    #[test]
    fn binaries_need_the_marker_line() {
        let home = tempfile::tempdir().unwrap();
        let bin = home.path().join(".local/bin");
        touch(
            &bin.join("cargo"),
            "#!/bin/sh\n# distrobox_binary\nexec distrobox enter dev -- cargo \"$@\"\n",
        );
        touch(&bin.join("unrelated"), "#!/bin/sh\necho hi\n");

        let exported = exported_binaries(home.path());
        assert_eq!(exported.len(), 1);
        assert!(exported.contains("cargo"));
    }

    #[test]
    fn missing_directories_mean_no_exports() {
        let home = tempfile::tempdir().unwrap();
        assert!(exported_apps(home.path(), "ubuntu").is_empty());
        assert!(exported_binaries(home.path()).is_empty());
    }

    #[test]
    fn sync_updates_only_divergent_flags() {
        let home = tempfile::tempdir().unwrap();
        let apps = home.path().join(".local/share/applications");
        touch(&apps.join("ubuntu-gimp.desktop"), "[Desktop Entry]");

        let store = CatalogStore::open_in_memory().unwrap();
        let scope = Scope::Container("ubuntu".to_string());
        store
            .save(
                &scope,
                &[
                    PackageRecord {
                        name: "gimp".to_string(),
                        ..Default::default()
                    },
                    PackageRecord {
                        name: "curl".to_string(),
                        exporting: true,
                        ..Default::default()
                    },
                ],
            )
            .unwrap();

        sync_export_flags(&store, &scope, home.path(), "ubuntu").unwrap();
        assert!(store.get_by_name(&scope, "gimp").unwrap().exporting);
        assert!(!store.get_by_name(&scope, "curl").unwrap().exporting);
    }
}
