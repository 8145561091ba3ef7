//! Durable package catalog.
//!
//! SQLite-backed store with one table for the host catalog and one for
//! distrobox packages (keyed by container + name). All write paths are
//! serialized by the store mutex; `save` replaces a scope wholesale inside a
//! single transaction, and `sync_installed` reconciles installed flags from
//! an authoritative name→version map without losing rows.

use crate::error::ApmError;
use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Mutex;

/// Batch size for the delete-then-insert rewrite in [`CatalogStore::save`].
const INSERT_BATCH: usize = 1000;

/// Which catalog a request addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Host,
    Container(String),
}

impl Scope {
    fn table(&self) -> &'static str {
        match self {
            Scope::Host => "host_packages",
            Scope::Container(_) => "distrobox_packages",
        }
    }

    fn container(&self) -> Option<&str> {
        match self {
            Scope::Host => None,
            Scope::Container(name) => Some(name),
        }
    }
}

/// One catalog row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRecord {
    pub name: String,
    pub section: String,
    pub maintainer: String,
    /// Version available from the repositories.
    pub version: String,
    /// Version present on the system, empty when not installed.
    pub installed_version: String,
    pub installed_size: u64,
    pub download_size: u64,
    pub filename: String,
    pub description: String,
    pub changelog: String,
    pub depends: Vec<String>,
    pub provides: Vec<String>,
    pub installed: bool,
    /// Whether the package has been exported to the host menu. Only
    /// meaningful for distrobox scopes.
    pub exporting: bool,
}

/// Filter on one allow-listed field.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Paged, filtered catalog query.
#[derive(Debug, Clone, Default)]
pub struct CatalogQuery {
    pub filters: Vec<Filter>,
    pub sort_field: Option<String>,
    pub sort_order: SortOrder,
    pub limit: Option<u32>,
    pub offset: u32,
}

const HOST_FILTER_FIELDS: &[&str] = &["name", "section", "maintainer", "version", "installed"];
const CONTAINER_FILTER_FIELDS: &[&str] =
    &["name", "version", "description", "installed", "exporting"];
const HOST_SORT_FIELDS: &[&str] = &[
    "name",
    "section",
    "version",
    "installed_size",
    "download_size",
    "installed",
];
const CONTAINER_SORT_FIELDS: &[&str] = &["name", "version", "installed", "exporting"];
const BOOL_FIELDS: &[&str] = &["installed", "exporting"];

/// Filter fields a caller may use for the given scope, exposed on the bus.
pub fn filter_fields(scope: &Scope) -> &'static [&'static str] {
    match scope {
        Scope::Host => HOST_FILTER_FIELDS,
        Scope::Container(_) => CONTAINER_FILTER_FIELDS,
    }
}

fn sort_fields(scope: &Scope) -> &'static [&'static str] {
    match scope {
        Scope::Host => HOST_SORT_FIELDS,
        Scope::Container(_) => CONTAINER_SORT_FIELDS,
    }
}

/// Truthy forms accepted for boolean filters.
fn parse_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// SQLite-backed catalog store.
pub struct CatalogStore {
    conn: Mutex<Connection>,
}

impl CatalogStore {
    /// Open (or create) the catalog database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS host_packages (
                name TEXT PRIMARY KEY,
                section TEXT NOT NULL DEFAULT '',
                maintainer TEXT NOT NULL DEFAULT '',
                version TEXT NOT NULL DEFAULT '',
                installed_version TEXT NOT NULL DEFAULT '',
                installed_size INTEGER NOT NULL DEFAULT 0,
                download_size INTEGER NOT NULL DEFAULT 0,
                filename TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                changelog TEXT NOT NULL DEFAULT '',
                depends TEXT NOT NULL DEFAULT '[]',
                provides TEXT NOT NULL DEFAULT '[]',
                installed INTEGER NOT NULL DEFAULT 0,
                exporting INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS distrobox_packages (
                container TEXT NOT NULL,
                name TEXT NOT NULL,
                section TEXT NOT NULL DEFAULT '',
                maintainer TEXT NOT NULL DEFAULT '',
                version TEXT NOT NULL DEFAULT '',
                installed_version TEXT NOT NULL DEFAULT '',
                installed_size INTEGER NOT NULL DEFAULT 0,
                download_size INTEGER NOT NULL DEFAULT 0,
                filename TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                changelog TEXT NOT NULL DEFAULT '',
                depends TEXT NOT NULL DEFAULT '[]',
                provides TEXT NOT NULL DEFAULT '[]',
                installed INTEGER NOT NULL DEFAULT 0,
                exporting INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (container, name)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Atomically replace every row of `scope` with `records`.
    pub fn save(&self, scope: &Scope, records: &[PackageRecord]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        match scope.container() {
            None => {
                tx.execute("DELETE FROM host_packages", [])?;
            }
            Some(container) => {
                tx.execute(
                    "DELETE FROM distrobox_packages WHERE container = ?1",
                    params![container],
                )?;
            }
        }
        for batch in records.chunks(INSERT_BATCH) {
            let mut stmt = tx.prepare_cached(&insert_sql(scope))?;
            for record in batch {
                bind_insert(&mut stmt, scope, record)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Fetch one record or fail with the exact missing name.
    pub fn get_by_name(&self, scope: &Scope, name: &str) -> Result<PackageRecord> {
        let conn = self.conn.lock().unwrap();
        let (sql, container) = scoped_sql(scope, "name = ?1", None);
        let mut stmt = conn.prepare_cached(&sql)?;
        let found = match container {
            None => stmt.query_row(params![name], row_to_record),
            Some(c) => stmt.query_row(params![name, c], row_to_record),
        };
        match found {
            Ok(record) => Ok(record),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(ApmError::PackageNotFound {
                name: name.to_string(),
            }
            .into()),
            Err(err) => Err(err.into()),
        }
    }

    /// Substring search on package name.
    pub fn search(
        &self,
        scope: &Scope,
        needle: &str,
        installed_only: bool,
    ) -> Result<Vec<PackageRecord>> {
        let conn = self.conn.lock().unwrap();
        let clause = if installed_only {
            "name LIKE '%' || ?1 || '%' AND installed = 1"
        } else {
            "name LIKE '%' || ?1 || '%'"
        };
        let (sql, container) = scoped_sql(scope, clause, Some("name ASC"));
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = match container {
            None => stmt.query_map(params![needle], row_to_record)?,
            Some(c) => stmt.query_map(params![needle, c], row_to_record)?,
        };
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Filtered, sorted, paged query.
    pub fn query(&self, scope: &Scope, query: &CatalogQuery) -> Result<Vec<PackageRecord>> {
        let (clause, binds) = build_filters(scope, &query.filters)?;
        let order = match &query.sort_field {
            Some(field) => {
                let allowed = sort_fields(scope);
                if !allowed.contains(&field.as_str()) {
                    return Err(ApmError::InvalidSortField {
                        field: field.clone(),
                        allowed: allowed.to_vec(),
                    }
                    .into());
                }
                let dir = match query.sort_order {
                    SortOrder::Asc => "ASC",
                    SortOrder::Desc => "DESC",
                };
                format!("{field} {dir}")
            }
            None => "name ASC".to_string(),
        };
        let conn = self.conn.lock().unwrap();
        let (mut sql, container) = scoped_sql_with_binds(scope, &clause, binds.len());
        write!(sql, " ORDER BY {order}").unwrap();
        if let Some(limit) = query.limit {
            write!(sql, " LIMIT {limit} OFFSET {}", query.offset).unwrap();
        } else if query.offset > 0 {
            write!(sql, " LIMIT -1 OFFSET {}", query.offset).unwrap();
        }
        let mut stmt = conn.prepare(&sql)?;
        let mut all_binds = binds;
        if let Some(c) = container {
            all_binds.push(c.to_string());
        }
        let rows = stmt.query_map(rusqlite::params_from_iter(all_binds.iter()), row_to_record)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Row count under the given filters.
    pub fn count(&self, scope: &Scope, filters: &[Filter]) -> Result<u64> {
        let (clause, binds) = build_filters(scope, filters)?;
        let conn = self.conn.lock().unwrap();
        let mut sql = format!("SELECT COUNT(*) FROM {} WHERE {clause}", scope.table());
        if scope.container().is_some() {
            write!(sql, " AND container = ?{}", binds.len() + 1).unwrap();
        }
        let mut all_binds = binds;
        if let Some(c) = scope.container() {
            all_binds.push(c.to_string());
        }
        let count: u64 = conn.prepare(&sql)?.query_row(
            rusqlite::params_from_iter(all_binds.iter()),
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Reconcile installed flags from a name→version map.
    ///
    /// Rows named in the map become `installed = true` with the mapped
    /// version; every other row in the scope becomes `installed = false`
    /// with an empty installed version. Runs as one transaction over a
    /// temporary table so the scope is never observed half-synced.
    pub fn sync_installed(&self, scope: &Scope, installed: &HashMap<String, String>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS sync_state (name TEXT PRIMARY KEY, version TEXT);
             DELETE FROM sync_state;",
        )?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT OR REPLACE INTO sync_state (name, version) VALUES (?1, ?2)")?;
            for (name, version) in installed {
                stmt.execute(params![name, version])?;
            }
        }
        let update = match scope.container() {
            None => "UPDATE host_packages SET
                installed = EXISTS(SELECT 1 FROM sync_state s WHERE s.name = host_packages.name),
                installed_version = COALESCE(
                    (SELECT s.version FROM sync_state s WHERE s.name = host_packages.name), '')"
                .to_string(),
            Some(container) => format!(
                "UPDATE distrobox_packages SET
                installed = EXISTS(SELECT 1 FROM sync_state s WHERE s.name = distrobox_packages.name),
                installed_version = COALESCE(
                    (SELECT s.version FROM sync_state s WHERE s.name = distrobox_packages.name), '')
                WHERE container = '{}'",
                container.replace('\'', "''")
            ),
        };
        tx.execute(&update, [])?;
        tx.execute("DELETE FROM sync_state", [])?;
        tx.commit()?;
        Ok(())
    }

    /// Update one allow-listed field of one row.
    pub fn update_field(&self, scope: &Scope, name: &str, field: &str, value: bool) -> Result<()> {
        const ALLOWED: &[&str] = &["installed", "exporting"];
        if !ALLOWED.contains(&field) {
            return Err(ApmError::InvalidFilterField {
                field: field.to_string(),
                allowed: ALLOWED.to_vec(),
            }
            .into());
        }
        let conn = self.conn.lock().unwrap();
        let changed = match scope.container() {
            None => conn.execute(
                &format!("UPDATE host_packages SET {field} = ?1 WHERE name = ?2"),
                params![value, name],
            )?,
            Some(container) => conn.execute(
                &format!(
                    "UPDATE distrobox_packages SET {field} = ?1 WHERE name = ?2 AND container = ?3"
                ),
                params![value, name, container],
            )?,
        };
        if changed == 0 {
            return Err(ApmError::PackageNotFound {
                name: name.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Total rows in the scope, for populated-database checks.
    pub fn count_all(&self, scope: &Scope) -> Result<u64> {
        self.count(scope, &[])
    }
}

fn insert_sql(scope: &Scope) -> String {
    match scope.container() {
        None => "INSERT OR REPLACE INTO host_packages
            (name, section, maintainer, version, installed_version, installed_size,
             download_size, filename, description, changelog, depends, provides,
             installed, exporting)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            .to_string(),
        Some(_) => "INSERT OR REPLACE INTO distrobox_packages
            (name, section, maintainer, version, installed_version, installed_size,
             download_size, filename, description, changelog, depends, provides,
             installed, exporting, container)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            .to_string(),
    }
}

fn bind_insert(
    stmt: &mut rusqlite::CachedStatement<'_>,
    scope: &Scope,
    record: &PackageRecord,
) -> Result<()> {
    let depends = serde_json::to_string(&record.depends)?;
    let provides = serde_json::to_string(&record.provides)?;
    match scope.container() {
        None => {
            stmt.execute(params![
                record.name,
                record.section,
                record.maintainer,
                record.version,
                record.installed_version,
                record.installed_size,
                record.download_size,
                record.filename,
                record.description,
                record.changelog,
                depends,
                provides,
                record.installed,
                record.exporting,
            ])?;
        }
        Some(container) => {
            stmt.execute(params![
                record.name,
                record.section,
                record.maintainer,
                record.version,
                record.installed_version,
                record.installed_size,
                record.download_size,
                record.filename,
                record.description,
                record.changelog,
                depends,
                provides,
                record.installed,
                record.exporting,
                container,
            ])?;
        }
    }
    Ok(())
}

/// `SELECT ... WHERE <clause> [AND container = ?n]`, with the container
/// bound as the parameter after the clause's single `?1`.
fn scoped_sql(scope: &Scope, clause: &str, order: Option<&str>) -> (String, Option<String>) {
    let mut sql = format!("SELECT {COLUMNS} FROM {} WHERE {clause}", scope.table());
    let container = scope.container().map(str::to_string);
    if container.is_some() {
        sql.push_str(" AND container = ?2");
    }
    if let Some(order) = order {
        write!(sql, " ORDER BY {order}").unwrap();
    }
    (sql, container)
}

fn scoped_sql_with_binds(scope: &Scope, clause: &str, bound: usize) -> (String, Option<String>) {
    let mut sql = format!("SELECT {COLUMNS} FROM {} WHERE {clause}", scope.table());
    let container = scope.container().map(str::to_string);
    if container.is_some() {
        write!(sql, " AND container = ?{}", bound + 1).unwrap();
    }
    (sql, container)
}

const COLUMNS: &str = "name, section, maintainer, version, installed_version, installed_size,
    download_size, filename, description, changelog, depends, provides, installed, exporting";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PackageRecord> {
    let depends: String = row.get(10)?;
    let provides: String = row.get(11)?;
    Ok(PackageRecord {
        name: row.get(0)?,
        section: row.get(1)?,
        maintainer: row.get(2)?,
        version: row.get(3)?,
        installed_version: row.get(4)?,
        installed_size: row.get(5)?,
        download_size: row.get(6)?,
        filename: row.get(7)?,
        description: row.get(8)?,
        changelog: row.get(9)?,
        depends: serde_json::from_str(&depends).unwrap_or_default(),
        provides: serde_json::from_str(&provides).unwrap_or_default(),
        installed: row.get(12)?,
        exporting: row.get(13)?,
    })
}

/// Build the WHERE clause for allow-listed filters.
///
/// Boolean fields compare exactly after truthy parsing; other fields match
/// as `LIKE %value%`.
fn build_filters(scope: &Scope, filters: &[Filter]) -> Result<(String, Vec<String>)> {
    let allowed = filter_fields(scope);
    let mut clause = String::from("1 = 1");
    let mut binds: Vec<String> = Vec::new();
    for filter in filters {
        if !allowed.contains(&filter.field.as_str()) {
            return Err(ApmError::InvalidFilterField {
                field: filter.field.clone(),
                allowed: allowed.to_vec(),
            }
            .into());
        }
        if BOOL_FIELDS.contains(&filter.field.as_str()) {
            let flag = if parse_truthy(&filter.value) { 1 } else { 0 };
            write!(clause, " AND {} = {}", filter.field, flag).unwrap();
        } else {
            binds.push(filter.value.clone());
            write!(
                clause,
                " AND {} LIKE '%' || ?{} || '%'",
                filter.field,
                binds.len()
            )
            .unwrap();
        }
    }
    Ok((clause, binds))
}
