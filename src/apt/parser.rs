//! Parsers for package tool output.
//!
//! Two modes: the change-set scanner over `apt-get -s` dry-run text, and the
//! streaming metadata reader over `apt-cache dumpavail`. The dump can reach
//! hundreds of megabytes, so metadata parsing never buffers more than one
//! record.

use anyhow::{Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::sync::OnceLock;

/// Upper bound for a single dumpavail line. Description blocks are known to
/// get enormous; anything beyond this is a corrupt stream.
const MAX_LINE_BYTES: usize = 350 * 1024 * 1024;

/// The four lists plus four counters a dry run produces.
///
/// When the tool elides the lists, the counters remain authoritative and the
/// lists stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub extra_installed_packages: Vec<String>,
    pub upgraded_packages: Vec<String>,
    pub new_installed_packages: Vec<String>,
    pub removed_packages: Vec<String>,
    pub upgraded_count: u32,
    pub new_installed_count: u32,
    pub removed_count: u32,
    pub not_upgraded_count: u32,
}

impl ChangeSet {
    /// Whether the dry run found any work to do.
    pub fn is_empty(&self) -> bool {
        self.upgraded_count == 0
            && self.new_installed_count == 0
            && self.removed_count == 0
            && self.new_installed_packages.is_empty()
            && self.removed_packages.is_empty()
            && self.upgraded_packages.is_empty()
            && self.extra_installed_packages.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Extra,
    Upgraded,
    NewInstalled,
    Removed,
}

fn section_header(line: &str) -> Option<Section> {
    if line == "The following extra packages will be installed:" {
        Some(Section::Extra)
    } else if line == "The following NEW packages will be installed:" {
        Some(Section::NewInstalled)
    } else if line == "The following packages will be REMOVED:" {
        Some(Section::Removed)
    } else if line.starts_with("The following packages will be upgraded")
        || line.ends_with("will be upgraded:")
    {
        Some(Section::Upgraded)
    } else {
        None
    }
}

fn counters_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+) upgraded, (\d+) newly installed, (\d+) removed and (\d+) not upgraded\.")
            .expect("counters regex compiles")
    })
}

/// Scan dry-run output into a [`ChangeSet`].
///
/// Tokens under a section header are collected until a blank line or the
/// next header. A package seen under several headers keeps its last one.
/// Progress echoes (lines ending `...`) are skipped.
pub fn parse_changes(output: &str) -> ChangeSet {
    let mut set = ChangeSet::default();
    let mut membership: Vec<(String, Section)> = Vec::new();
    let mut current: Option<Section> = None;

    for raw in output.lines() {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            current = None;
            continue;
        }
        if line.trim_start().ends_with("...") {
            continue;
        }
        if let Some(section) = section_header(line.trim()) {
            current = Some(section);
            continue;
        }
        if let Some(caps) = counters_regex().captures(line) {
            set.upgraded_count = caps[1].parse().unwrap_or(0);
            set.new_installed_count = caps[2].parse().unwrap_or(0);
            set.removed_count = caps[3].parse().unwrap_or(0);
            set.not_upgraded_count = caps[4].parse().unwrap_or(0);
            current = None;
            continue;
        }
        match current {
            Some(section) if line.starts_with(' ') || line.starts_with('\t') => {
                for token in line.split_whitespace() {
                    // Later section wins when the tool repeats a name.
                    membership.retain(|(name, _)| name != token);
                    membership.push((token.to_string(), section));
                }
            }
            _ => {
                current = None;
            }
        }
    }

    for (name, section) in membership {
        match section {
            Section::Extra => set.extra_installed_packages.push(name),
            Section::Upgraded => set.upgraded_packages.push(name),
            Section::NewInstalled => set.new_installed_packages.push(name),
            Section::Removed => set.removed_packages.push(name),
        }
    }
    set
}

/// One record out of `apt-cache dumpavail`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageMeta {
    pub name: String,
    pub section: String,
    pub installed_size: u64,
    pub maintainer: String,
    pub version: String,
    pub depends: Vec<String>,
    pub provides: Vec<String>,
    pub size: u64,
    pub filename: String,
    pub description: String,
    pub changelog: String,
}

/// Stream an RFC-822-style metadata dump, invoking `on_record` per record.
///
/// Records are separated by blank lines; `Description` and `Changelog`
/// accumulate indented continuation lines. Returns the record count.
pub fn parse_dumpavail<R: BufRead>(
    mut reader: R,
    mut on_record: impl FnMut(PackageMeta) -> Result<()>,
) -> Result<usize> {
    let mut count = 0usize;
    let mut record = PackageMeta::default();
    let mut started = false;
    let mut last_key = String::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if buf.len() > MAX_LINE_BYTES {
            bail!("metadata line exceeds {MAX_LINE_BYTES} bytes");
        }
        let eof = read == 0;
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);

        if eof || line.trim().is_empty() {
            if started {
                count += 1;
                on_record(std::mem::take(&mut record))?;
                started = false;
                last_key.clear();
            }
            if eof {
                return Ok(count);
            }
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation lines only extend the multi-line fields.
            match last_key.as_str() {
                "Description" => {
                    if !record.description.is_empty() {
                        record.description.push('\n');
                    }
                    record.description.push_str(line.trim_start());
                }
                "Changelog" => {
                    if !record.changelog.is_empty() {
                        record.changelog.push('\n');
                    }
                    record.changelog.push_str(line.trim_start());
                }
                _ => {}
            }
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        started = true;
        last_key = key.to_string();
        match key {
            "Package" => record.name = value.to_string(),
            "Section" => record.section = value.to_string(),
            "Installed Size" | "Installed-Size" => {
                record.installed_size = value.parse().unwrap_or(0);
            }
            "Maintainer" => record.maintainer = value.to_string(),
            "Version" => record.version = normalize_version(value),
            "Depends" => record.depends = split_relations(value),
            "Provides" => record.provides = split_relations(value),
            "Size" => record.size = value.parse().unwrap_or(0),
            "Filename" => record.filename = value.to_string(),
            "Description" => record.description = value.to_string(),
            "Changelog" => record.changelog = value.to_string(),
            _ => {}
        }
    }
}

/// Normalize a package version string.
///
/// Drops an all-digit `N:` epoch prefix. If the remainder carries an `-alt`
/// release suffix preceded by a dotted upstream version, the suffix is
/// trimmed.
pub fn normalize_version(raw: &str) -> String {
    let mut version = raw;
    if let Some((epoch, rest)) = raw.split_once(':')
        && !epoch.is_empty()
        && epoch.bytes().all(|b| b.is_ascii_digit())
    {
        version = rest;
    }
    if let Some(alt_at) = version.find("-alt")
        && version[..alt_at].contains('.')
    {
        return version[..alt_at].to_string();
    }
    version.to_string()
}

/// Split a `Depends:`/`Provides:` line into normalized names.
///
/// Version constraints in parentheses are stripped, whitespace trimmed, and
/// duplicates removed preserving first occurrence.
pub fn split_relations(value: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for token in value.split(',') {
        let name = match token.find('(') {
            Some(idx) => token[..idx].trim(),
            None => token.trim(),
        };
        if name.is_empty() {
            continue;
        }
        if seen.insert(name.to_string()) {
            names.push(name.to_string());
        }
    }
    names
}

/// Reduce a full changelog to its most recent entry: the lines from the
/// first `*`-prefixed line up to, but excluding, the next one.
pub fn latest_changelog_entry(changelog: &str) -> String {
    let mut lines = Vec::new();
    let mut in_entry = false;
    for line in changelog.lines() {
        let starred = line.trim_start().starts_with('*');
        if starred {
            if in_entry {
                break;
            }
            in_entry = true;
        }
        if in_entry {
            lines.push(line);
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DRY_RUN: &str = "\
Reading Package Lists...
Building Dependency Tree...
The following extra packages will be installed:
  libzip libbz2
The following NEW packages will be installed:
  zip libzip libbz2
The following packages will be REMOVED:
  old-zip
1 upgraded, 3 newly installed, 1 removed and 7 not upgraded.
";

    #[test]
    fn parses_sections_and_counters() {
        let set = parse_changes(DRY_RUN);
        assert_eq!(set.new_installed_packages, vec!["zip", "libzip", "libbz2"]);
        assert_eq!(set.removed_packages, vec!["old-zip"]);
        // libzip/libbz2 moved from "extra" to "NEW": later section wins.
        assert!(set.extra_installed_packages.is_empty());
        assert_eq!(set.upgraded_count, 1);
        assert_eq!(set.new_installed_count, 3);
        assert_eq!(set.removed_count, 1);
        assert_eq!(set.not_upgraded_count, 7);
    }

    #[test]
    fn counters_only_output_keeps_lists_empty() {
        let set = parse_changes("0 upgraded, 0 newly installed, 1 removed and 2 not upgraded.\n");
        assert!(set.removed_packages.is_empty());
        assert_eq!(set.removed_count, 1);
        assert_eq!(set.not_upgraded_count, 2);
    }

    #[test]
    fn progress_echoes_are_ignored() {
        let text = "The following packages will be REMOVED:\n  zip\nReading Package Lists...\n0 upgraded, 0 newly installed, 1 removed and 0 not upgraded.\n";
        let set = parse_changes(text);
        assert_eq!(set.removed_packages, vec!["zip"]);
    }

    #[test]
    fn blank_line_terminates_a_section() {
        let text = "The following NEW packages will be installed:\n  zip\n\n  stray\n";
        let set = parse_changes(text);
        assert_eq!(set.new_installed_packages, vec!["zip"]);
    }

    const DUMP: &str = "\
Package: zip
Section: Archiving/Compression
Installed Size: 598016
Maintainer: Example Packager <pkg@example.org>
Version: 2:3.0-alt2
Depends: libc.so.6, rpmlib(PayloadIsLzma) (= 1.0), libc.so.6
Provides: zip (= 2:3.0-alt2)
Size: 274840
Filename: zip-3.0-alt2.x86_64.rpm
Description: file compression utility
 Zip is a compression and file packaging utility.
 It is compatible with PKZIP.

Package: unzip
Version: 6.0
Description: extraction utility
";

    #[test]
    fn streams_records_with_continuations() {
        let mut records = Vec::new();
        let count = parse_dumpavail(DUMP.as_bytes(), |r| {
            records.push(r);
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);

        let zip = &records[0];
        assert_eq!(zip.name, "zip");
        assert_eq!(zip.version, "3.0");
        assert_eq!(zip.installed_size, 598016);
        assert_eq!(zip.size, 274840);
        assert_eq!(
            zip.depends,
            vec!["libc.so.6".to_string(), "rpmlib(PayloadIsLzma)".to_string()]
        );
        assert_eq!(zip.provides, vec!["zip".to_string()]);
        assert!(zip.description.contains("packaging utility"));
        assert!(zip.description.contains("compression utility"));

        assert_eq!(records[1].name, "unzip");
        assert_eq!(records[1].version, "6.0");
    }

    #[test]
    fn dump_without_trailing_blank_line_closes_last_record() {
        let mut names = Vec::new();
        parse_dumpavail("Package: a\n\nPackage: b".as_bytes(), |r| {
            names.push(r.name);
            Ok(())
        })
        .unwrap();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn version_normalization_rules() {
        assert_eq!(normalize_version("2:3.0-alt2"), "3.0");
        assert_eq!(normalize_version("3.0-alt1.qa1"), "3.0");
        assert_eq!(normalize_version("1:6.0"), "6.0");
        // No dot before -alt: the release suffix stays.
        assert_eq!(normalize_version("6-alt3"), "6-alt3");
        // Epoch must be all digits.
        assert_eq!(normalize_version("a:1.0"), "a:1.0");
        assert_eq!(normalize_version("1.2.3"), "1.2.3");
    }

    #[test]
    fn relations_strip_constraints_and_dedup() {
        let names = split_relations("a (>= 1.0), b, a, c (= 2)");
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn changelog_reduces_to_latest_entry() {
        let log = "* Tue Jan 02 2024 Dev <dev@example.org> 3.0-alt2\n- fix build\n- update docs\n* Mon Dec 04 2023 Dev <dev@example.org> 3.0-alt1\n- initial";
        let latest = latest_changelog_entry(log);
        assert!(latest.starts_with("* Tue Jan 02 2024"));
        assert!(latest.contains("update docs"));
        assert!(!latest.contains("3.0-alt1"));
    }
}
