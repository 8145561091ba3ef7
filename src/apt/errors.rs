//! Closed catalog of package tool error patterns.
//!
//! `apt-get` and the RPM layer under it report failures as free-form text.
//! The catalog maps known lines to a typed kind plus the positional
//! parameters captured out of the line. Callers receive every match from a
//! run and use [`find_critical`] to decide whether the requested work can
//! proceed; non-critical matches (already newest, not installed) accompany
//! the parsed change-set so declarative apply can still reconcile.
//!
//! Patterns use `%s` holes. Matching compiles each pattern once into an
//! anchored regex: literal segments are escaped, each hole becomes a greedy
//! capture.

use regex::Regex;
use std::sync::OnceLock;

/// Typed kinds for every pattern in [`CATALOG`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AptErrorKind {
    PackageNotFound,
    NoInstallCandidate,
    PackageNotAvailable,
    VirtualMultipleProviders,
    VirtualNoProviders,
    PackageIsAlreadyNewest,
    PackageNotInstalled,
    ReleaseNotFound,
    VersionNotFound,
    BrokenPackages,
    HeldBrokenPackages,
    UnmetDependencies,
    FixBrokenSuggested,
    CorrectDependenciesFailed,
    MinimizeUpgradeFailed,
    ReinstallRequired,
    RemoveDisabled,
    ResolverInternal,
    ImmediateConfiguration,
    FetchArchivesFailed,
    FailedToFetch,
    HashSumMismatch,
    SizeMismatch,
    ResolveHost,
    ConnectFailed,
    MethodDriverMissing,
    SourcesUnreadable,
    MalformedSourceList,
    ListsParseFailed,
    LockDownloadDir,
    LockListDir,
    LockAdminDir,
    LockFileOpen,
    LockHeld,
    RpmDatabaseLocked,
    RpmDatabaseOpen,
    NoSpace,
    FreeSpaceUnknown,
    PermissionDenied,
    WriteError,
    ReadError,
    FileUnreadable,
    ChangeDirFailed,
    UnlinkFailed,
    RegexCompilation,
    OperationCancelledByTool,
}

impl AptErrorKind {
    /// Whether a match of this kind means the requested work cannot proceed.
    ///
    /// The two reconciliation kinds are exempt: they describe a no-op, not a
    /// failure, and atomic apply still mutates the declarative config for
    /// them.
    pub fn is_critical(self) -> bool {
        !matches!(
            self,
            AptErrorKind::PackageIsAlreadyNewest | AptErrorKind::PackageNotInstalled
        )
    }

    /// Whether a match of this kind hints at a stale package cache, so the
    /// caller may run `update` once and retry.
    pub fn suggests_cache_refresh(self) -> bool {
        matches!(
            self,
            AptErrorKind::PackageNotFound
                | AptErrorKind::NoInstallCandidate
                | AptErrorKind::PackageNotAvailable
                | AptErrorKind::FetchArchivesFailed
                | AptErrorKind::FailedToFetch
                | AptErrorKind::HashSumMismatch
                | AptErrorKind::SizeMismatch
                | AptErrorKind::ListsParseFailed
                | AptErrorKind::ReleaseNotFound
                | AptErrorKind::VersionNotFound
        )
    }
}

/// One catalog row: kind, pattern with `%s` holes, expected hole count.
pub struct CatalogEntry {
    pub kind: AptErrorKind,
    pub pattern: &'static str,
    pub params: usize,
}

macro_rules! entry {
    ($kind:ident, $pattern:literal, $params:literal) => {
        CatalogEntry {
            kind: AptErrorKind::$kind,
            pattern: $pattern,
            params: $params,
        }
    };
}

/// The closed, ordered catalog. First match per line wins.
pub static CATALOG: &[CatalogEntry] = &[
    entry!(PackageNotFound, "Couldn't find package %s", 1),
    entry!(PackageNotFound, "Unable to locate package %s", 1),
    entry!(NoInstallCandidate, "Package %s has no installation candidate", 1),
    entry!(
        PackageNotAvailable,
        "Package %s is not available, but is referred to by another package.",
        1
    ),
    entry!(
        VirtualMultipleProviders,
        "Package %s is a virtual package provided by:",
        1
    ),
    entry!(
        VirtualMultipleProviders,
        "You should explicitly select one to install.",
        0
    ),
    entry!(
        VirtualNoProviders,
        "Package %s is a virtual package with no good providers.",
        1
    ),
    entry!(
        PackageIsAlreadyNewest,
        "Package %s is already the newest version.",
        1
    ),
    entry!(PackageIsAlreadyNewest, "%s is already the newest version.", 1),
    entry!(
        PackageNotInstalled,
        "Package %s is not installed, so not removed",
        1
    ),
    entry!(ReleaseNotFound, "Release '%s' for '%s' was not found", 2),
    entry!(VersionNotFound, "Version '%s' for '%s' was not found", 2),
    entry!(
        BrokenPackages,
        "Some packages could not be installed. This may mean that you have requested an impossible situation or if you are using the unstable distribution that some required packages have not yet been created or been moved out of Incoming.",
        0
    ),
    entry!(
        HeldBrokenPackages,
        "Unable to correct problems, you have held broken packages.",
        0
    ),
    entry!(
        UnmetDependencies,
        "Unmet dependencies. Try 'apt-get -f install' with no packages (or specify a solution).",
        0
    ),
    entry!(UnmetDependencies, "The following packages have unmet dependencies:", 0),
    entry!(
        FixBrokenSuggested,
        "You might want to run 'apt-get -f install' to correct these.",
        0
    ),
    entry!(
        FixBrokenSuggested,
        "You might want to run 'apt-get -f install' to correct these:",
        0
    ),
    entry!(CorrectDependenciesFailed, "Unable to correct dependencies", 0),
    entry!(MinimizeUpgradeFailed, "Unable to minimize the upgrade set", 0),
    entry!(
        ReinstallRequired,
        "The package %s needs to be reinstalled, but I can't find an archive for it.",
        1
    ),
    entry!(
        RemoveDisabled,
        "Packages need to be removed but remove is disabled.",
        0
    ),
    entry!(ResolverInternal, "Internal Error, AllUpgrade broke stuff", 0),
    entry!(ResolverInternal, "Internal error, Ordering didn't finish", 0),
    entry!(
        ResolverInternal,
        "Error, pkgProblemResolver::Resolve generated breaks, this may be caused by held packages.",
        0
    ),
    entry!(
        ResolverInternal,
        "Internal error, problem resolver broke stuff",
        0
    ),
    entry!(
        ImmediateConfiguration,
        "Internal Error, Could not perform immediate configuration (%s) on %s",
        2
    ),
    entry!(
        FetchArchivesFailed,
        "Unable to fetch some archives, maybe run apt-get update or try with --fix-missing?",
        0
    ),
    entry!(FailedToFetch, "Failed to fetch %s %s", 2),
    entry!(HashSumMismatch, "Hash Sum mismatch", 0),
    entry!(SizeMismatch, "Size mismatch", 0),
    entry!(ResolveHost, "Could not resolve '%s'", 1),
    entry!(ResolveHost, "Temporary failure resolving '%s'", 1),
    entry!(ConnectFailed, "Could not connect to %s:%s (%s).", 3),
    entry!(ConnectFailed, "Unable to connect to %s:", 1),
    entry!(MethodDriverMissing, "The method driver %s could not be found.", 1),
    entry!(SourcesUnreadable, "The list of sources could not be read.", 0),
    entry!(MalformedSourceList, "Malformed line %s in source list %s", 2),
    entry!(
        ListsParseFailed,
        "The package lists or status file could not be parsed or opened.",
        0
    ),
    entry!(LockDownloadDir, "Unable to lock the download directory", 0),
    entry!(LockListDir, "Unable to lock the list directory", 0),
    entry!(LockAdminDir, "Unable to lock the administration directory (%s), are you root?", 1),
    entry!(LockFileOpen, "Could not open lock file %s", 1),
    entry!(LockHeld, "Could not get lock %s", 1),
    entry!(RpmDatabaseLocked, "cannot get exclusive lock on %s", 1),
    entry!(RpmDatabaseLocked, "rpmdb: Lock table is out of available locker entries", 0),
    entry!(RpmDatabaseOpen, "could not open RPM database", 0),
    entry!(RpmDatabaseOpen, "Unable to open DB file %s: %s", 2),
    entry!(NoSpace, "You don't have enough free space in %s", 1),
    entry!(FreeSpaceUnknown, "Couldn't determine free space in %s", 1),
    entry!(PermissionDenied, "Permission denied", 0),
    entry!(PermissionDenied, "You have to be root to do that.", 0),
    entry!(WriteError, "Write error", 0),
    entry!(WriteError, "Unable to write to %s", 1),
    entry!(ReadError, "Read error", 0),
    entry!(FileUnreadable, "Unable to read %s", 1),
    entry!(ChangeDirFailed, "Unable to change to %s", 1),
    entry!(UnlinkFailed, "Problem unlinking %s", 1),
    entry!(RegexCompilation, "Regex compilation error - %s", 1),
    entry!(OperationCancelledByTool, "Operation cancelled", 0),
    entry!(OperationCancelledByTool, "Aborting Installation.", 0),
    entry!(OperationCancelledByTool, "Abort.", 0),
];

/// One matched error from a tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AptError {
    pub kind: AptErrorKind,
    /// The catalog pattern that matched.
    pub pattern: &'static str,
    /// Captured parameters, ordered by hole position.
    pub params: Vec<String>,
}

impl AptError {
    /// Reconstruct the human-readable line by substituting the parameters
    /// back into the pattern.
    pub fn message(&self) -> String {
        let mut out = String::new();
        let mut params = self.params.iter();
        let mut rest = self.pattern;
        while let Some(idx) = rest.find("%s") {
            out.push_str(&rest[..idx]);
            if let Some(param) = params.next() {
                out.push_str(param);
            }
            rest = &rest[idx + 2..];
        }
        out.push_str(rest);
        out
    }

    pub fn is_critical(&self) -> bool {
        self.kind.is_critical()
    }

    pub fn suggests_cache_refresh(&self) -> bool {
        self.kind.suggests_cache_refresh()
    }
}

fn compiled() -> &'static Vec<Regex> {
    static COMPILED: OnceLock<Vec<Regex>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        CATALOG
            .iter()
            .map(|entry| {
                let body = entry
                    .pattern
                    .split("%s")
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join("(.+)");
                Regex::new(&format!("^{body}$")).expect("catalog pattern compiles")
            })
            .collect()
    })
}

/// Scan tool output and return every catalog match, in line order.
///
/// Lines are stripped of the leading `E: `/`W: ` marker and surrounding
/// whitespace; empty lines are skipped. The first matching pattern per line
/// wins.
pub fn analyze(output: &str) -> Vec<AptError> {
    let regexes = compiled();
    let mut found = Vec::new();
    for raw in output.lines() {
        let line = raw
            .trim()
            .trim_start_matches("E: ")
            .trim_start_matches("W: ")
            .trim();
        if line.is_empty() {
            continue;
        }
        for (entry, regex) in CATALOG.iter().zip(regexes.iter()) {
            if let Some(caps) = regex.captures(line) {
                let params = caps
                    .iter()
                    .skip(1)
                    .flatten()
                    .map(|m| m.as_str().to_string())
                    .collect();
                found.push(AptError {
                    kind: entry.kind,
                    pattern: entry.pattern,
                    params,
                });
                break;
            }
        }
    }
    found
}

/// Pick the first error that prevents the requested work from proceeding.
pub fn find_critical(errors: &[AptError]) -> Option<&AptError> {
    errors.iter().find(|e| e.is_critical())
}
