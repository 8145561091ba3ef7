//! System RPM database queries.
//!
//! The installed state of the catalog is resolved by parsing `rpm -qia`
//! output: each record contributes its `Name` and `Version` header lines.

use crate::runner::{CancelToken, CommandRunner};
use anyhow::Result;
use std::collections::HashMap;

/// Parse `rpm -qia` output into a name→version map.
///
/// Records open with a `Name : ...` line; the next `Version : ...` line
/// belongs to that record. Other header lines and the file payload sections
/// are skipped.
pub fn parse_installed(output: &str) -> HashMap<String, String> {
    let mut installed = HashMap::new();
    let mut current: Option<String> = None;
    for line in output.lines() {
        if let Some(value) = header_value(line, "Name") {
            current = Some(value.to_string());
        } else if let Some(value) = header_value(line, "Version")
            && let Some(name) = current.take()
        {
            installed.insert(name, value.to_string());
        }
    }
    installed
}

/// Extract `Key : value` from an rpm header line, tolerating the aligned
/// padding rpm emits.
fn header_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(key)?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix(':')?;
    Some(rest.trim())
}

/// Query the system RPM database for every installed package.
pub fn installed_map(
    runner: &dyn CommandRunner,
    cancel: &CancelToken,
) -> Result<HashMap<String, String>> {
    let output = runner.run("rpm -qia", cancel)?;
    Ok(parse_installed(&output.stdout))
}

/// Strip the `+`/`-` batch suffix a user may attach to force an action
/// within a mixed install/remove invocation. The suffixed token still goes
/// to the tool verbatim; the canonical name is used for catalog lookups and
/// image-config mutation.
pub fn canonical_name(token: &str) -> &str {
    token
        .strip_suffix('+')
        .or_else(|| token.strip_suffix('-'))
        .unwrap_or(token)
}

/// Canonicalize a `.32bit` name echoed by the tool back to the bare name
/// when the bare name is the one the catalog knows.
pub fn strip_biarch_suffix(name: &str) -> Option<&str> {
    name.strip_suffix(".32bit")
}

#[cfg(test)]
mod tests {
    use super::*;

    const QIA: &str = "\
Name        : zip
Epoch       : 2
Version     : 3.0
Release     : alt2
Summary     : file compression utility
Description :
Zip is a compression and file packaging utility.

Name        : unzip
Version     : 6.0
Release     : alt1
";

    #[test]
    fn parses_name_version_pairs() {
        let map = parse_installed(QIA);
        assert_eq!(map.len(), 2);
        assert_eq!(map["zip"], "3.0");
        assert_eq!(map["unzip"], "6.0");
    }

    #[test]
    fn version_without_open_record_is_ignored() {
        let map = parse_installed("Version     : 1.0\n");
        assert!(map.is_empty());
    }

    #[test]
    fn description_lines_do_not_leak_into_records() {
        // "Name" inside free text lacks the column padding and colon layout.
        let map = parse_installed("Name : a\nVersion : 1\nNameless line\n");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn canonical_name_strips_batch_suffix() {
        assert_eq!(canonical_name("zip+"), "zip");
        assert_eq!(canonical_name("zip-"), "zip");
        assert_eq!(canonical_name("zip"), "zip");
    }

    #[test]
    fn biarch_suffix_detection() {
        assert_eq!(strip_biarch_suffix("glibc.32bit"), Some("glibc"));
        assert_eq!(strip_biarch_suffix("glibc"), None);
    }
}
