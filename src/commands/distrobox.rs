//! Distrobox operations.

use super::{AppState, envelope};
use crate::catalog::{CatalogQuery, Filter, Scope, SortOrder, filter_fields};
use crate::distrobox::DistroboxManager;
use crate::error::ApmError;
use crate::events::Reporter;
use crate::response::{Envelope, to_data};
use crate::runner::CancelToken;
use anyhow::Result;
use serde_json::{Value, json};

fn manager<'a>(
    state: &'a AppState,
    reporter: &'a Reporter,
    cancel: &'a CancelToken,
) -> DistroboxManager<'a> {
    DistroboxManager::new(
        state.runner.as_ref(),
        &state.store,
        reporter,
        cancel,
        state.config.home.clone(),
    )
}

/// Refresh one container's package catalog.
pub fn update(
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
    container: &str,
) -> Envelope {
    let result = (|| -> Result<Value> {
        let count = manager(state, reporter, cancel).update(container)?;
        Ok(json!({
            "message": format!("Container database updated, {count} packages"),
            "count": count,
        }))
    })();
    envelope(reporter, result)
}

/// Install packages inside a container.
pub fn install(
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
    container: &str,
    packages: &[String],
    export: bool,
) -> Envelope {
    let result = (|| -> Result<Value> {
        let manager = manager(state, reporter, cancel);
        manager.install(container, packages)?;
        if export {
            for package in packages {
                manager.export(container, package)?;
            }
        }
        Ok(json!({
            "message": format!("{} packages installed in {container}", packages.len()),
            "packages": packages,
        }))
    })();
    envelope(reporter, result)
}

/// Remove packages from a container.
pub fn remove(
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
    container: &str,
    packages: &[String],
) -> Envelope {
    let result = (|| -> Result<Value> {
        manager(state, reporter, cancel).remove(container, packages)?;
        Ok(json!({
            "message": format!("{} packages removed from {container}", packages.len()),
            "packages": packages,
        }))
    })();
    envelope(reporter, result)
}

/// Detailed record for one package in a container.
pub fn info(state: &AppState, reporter: &Reporter, container: &str, package: &str) -> Envelope {
    let result = (|| -> Result<Value> {
        let scope = container_scope(state, container)?;
        let record = state.store.get_by_name(&scope, package)?;
        Ok(json!({
            "message": format!("Information about {package} in {container}"),
            "package": to_data(&record),
        }))
    })();
    envelope(reporter, result)
}

/// Substring search within one container's catalog.
pub fn search(
    state: &AppState,
    reporter: &Reporter,
    container: &str,
    query: &str,
    installed_only: bool,
) -> Envelope {
    let result = (|| -> Result<Value> {
        let scope = container_scope(state, container)?;
        let records = state.store.search(&scope, query, installed_only)?;
        Ok(json!({
            "message": format!("{} packages found", records.len()),
            "packages": to_data(&records),
            "totalCount": records.len(),
        }))
    })();
    envelope(reporter, result)
}

/// Filtered listing of a container's catalog.
pub fn list(
    state: &AppState,
    reporter: &Reporter,
    container: &str,
    filters: &[(String, String)],
    sort: Option<String>,
    descending: bool,
    limit: Option<u32>,
    offset: u32,
) -> Envelope {
    let result = (|| -> Result<Value> {
        let scope = container_scope(state, container)?;
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
        let records = state.store.query(&scope, &query)?;
        let total = state.store.count(&scope, &filters)?;
        Ok(json!({
            "message": format!("{total} packages"),
            "packages": to_data(&records),
            "totalCount": total,
        }))
    })();
    envelope(reporter, result)
}

/// Containers known to distrobox.
pub fn container_list(state: &AppState, reporter: &Reporter, cancel: &CancelToken) -> Envelope {
    let result = (|| -> Result<Value> {
        let containers = manager(state, reporter, cancel).list_containers()?;
        Ok(json!({
            "message": format!("{} containers", containers.len()),
            "containers": to_data(&containers),
            "totalCount": containers.len(),
        }))
    })();
    envelope(reporter, result)
}

/// Create a container.
pub fn container_add(
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
    name: &str,
    image: &str,
) -> Envelope {
    let result = (|| -> Result<Value> {
        manager(state, reporter, cancel).add_container(name, image)?;
        Ok(json!({ "message": format!("Container {name} created") }))
    })();
    envelope(reporter, result)
}

/// Destroy a container and its catalog rows.
pub fn container_remove(
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
    name: &str,
) -> Envelope {
    let result = (|| -> Result<Value> {
        manager(state, reporter, cancel).remove_container(name)?;
        Ok(json!({ "message": format!("Container {name} removed") }))
    })();
    envelope(reporter, result)
}

/// Export (or unexport) an application to the host menu.
pub fn export(
    state: &AppState,
    reporter: &Reporter,
    cancel: &CancelToken,
    container: &str,
    package: &str,
    delete: bool,
) -> Envelope {
    let result = (|| -> Result<Value> {
        let manager = manager(state, reporter, cancel);
        if delete {
            manager.unexport(container, package)?;
            Ok(json!({ "message": format!("{package} unexported from {container}") }))
        } else {
            manager.export(container, package)?;
            Ok(json!({ "message": format!("{package} exported from {container}") }))
        }
    })();
    envelope(reporter, result)
}

/// Filter fields accepted by container queries.
pub fn get_filter_fields(reporter: &Reporter) -> Envelope {
    let fields = filter_fields(&Scope::Container(String::new()));
    envelope(
        reporter,
        Ok(json!({
            "message": "Available filter fields",
            "fields": fields,
        })),
    )
}

/// Scope for a container that must have been cataloged before.
fn container_scope(state: &AppState, container: &str) -> Result<Scope> {
    let scope = Scope::Container(container.to_string());
    if state.store.count_all(&scope)? == 0 {
        return Err(ApmError::ContainerNotFound {
            name: container.to_string(),
        }
        .into());
    }
    Ok(scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PackageRecord;
    use crate::config::AppConfig;
    use crate::runner::MockCommandRunner;
    use std::sync::Arc;

    fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            database_path: dir.path().join("apm.db"),
            image_config_path: dir.path().join("image.yml"),
            containerfile_path: dir.path().join("Containerfile"),
            resources_dir: dir.path().join("resources"),
            home: dir.path().to_path_buf(),
        };
        let state = AppState::with_runner(config, Arc::new(MockCommandRunner::new())).unwrap();
        (state, dir)
    }

    #[test]
    fn info_for_unknown_container_fails() {
        let (state, _dir) = test_state();
        let reporter = Reporter::disabled();
        let env = info(&state, &reporter, "ghost", "zip");
        assert!(env.error);
        assert!(env.data["message"].as_str().unwrap().contains("ghost"));
    }

    #[test]
    fn search_scopes_to_the_container() {
        let (state, _dir) = test_state();
        let scope = Scope::Container("ubuntu".to_string());
        state
            .store
            .save(
                &scope,
                &[PackageRecord {
                    name: "curl".to_string(),
                    installed: true,
                    ..Default::default()
                }],
            )
            .unwrap();
        let reporter = Reporter::disabled();
        let env = search(&state, &reporter, "ubuntu", "cur", false);
        assert!(!env.error);
        assert_eq!(env.data["totalCount"], 1);
    }

    #[test]
    fn filter_fields_envelope_names_the_allow_list() {
        let reporter = Reporter::disabled();
        let env = get_filter_fields(&reporter);
        assert!(!env.error);
        let fields: Vec<String> = env.data["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(fields.contains(&"exporting".to_string()));
        assert!(fields.contains(&"installed".to_string()));
    }
}
