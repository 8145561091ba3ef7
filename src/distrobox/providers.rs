//! Per-distribution package providers for sandbox containers.
//!
//! A provider knows the guest's package commands and how to parse their
//! output into catalog records. The guest distribution is detected from
//! `/etc/os-release` inside the container.

use crate::apt::parser;
use crate::apt::rpm;
use crate::catalog::PackageRecord;
use std::collections::HashMap;

/// Package plumbing for one guest distribution family.
pub trait GuestProvider: Send + Sync {
    /// Stable provider id, matching the os-release `ID`.
    fn id(&self) -> &'static str;

    /// Refresh the guest's package index.
    fn update_command(&self) -> &'static str;

    /// Dump the available package set.
    fn list_command(&self) -> &'static str;

    /// Dump installed name/version pairs.
    fn installed_command(&self) -> &'static str;

    fn install_command(&self, packages: &[String]) -> String;

    fn remove_command(&self, packages: &[String]) -> String;

    /// Parse the output of [`list_command`](GuestProvider::list_command).
    fn parse_available(&self, output: &str) -> Vec<PackageRecord>;

    /// Parse the output of
    /// [`installed_command`](GuestProvider::installed_command).
    fn parse_installed(&self, output: &str) -> HashMap<String, String> {
        parse_name_version_lines(output)
    }
}

/// Select a provider from the os-release `ID` value.
pub fn provider_for(os_id: &str) -> Option<Box<dyn GuestProvider>> {
    match os_id {
        "altlinux" | "alt" => Some(Box::new(AltProvider)),
        "ubuntu" | "debian" => Some(Box::new(UbuntuProvider)),
        "arch" | "archlinux" => Some(Box::new(ArchProvider)),
        _ => None,
    }
}

/// `name version` per line, the common installed-dump shape.
fn parse_name_version_lines(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let version = parts.next().unwrap_or_default();
            Some((name.to_string(), version.to_string()))
        })
        .collect()
}

/// ALT guests run the same apt-rpm stack as the host.
pub struct AltProvider;

impl GuestProvider for AltProvider {
    fn id(&self) -> &'static str {
        "altlinux"
    }

    fn update_command(&self) -> &'static str {
        "apt-get update"
    }

    fn list_command(&self) -> &'static str {
        "apt-cache dumpavail"
    }

    fn installed_command(&self) -> &'static str {
        "rpm -qa --queryformat '%{NAME} %{VERSION}\\n'"
    }

    fn install_command(&self, packages: &[String]) -> String {
        format!("apt-get -y install {}", packages.join(" "))
    }

    fn remove_command(&self, packages: &[String]) -> String {
        format!("apt-get -y remove {}", packages.join(" "))
    }

    fn parse_available(&self, output: &str) -> Vec<PackageRecord> {
        parse_dumpavail_records(output)
    }
}

/// Debian-family guests: apt metadata, dpkg install state.
pub struct UbuntuProvider;

impl GuestProvider for UbuntuProvider {
    fn id(&self) -> &'static str {
        "ubuntu"
    }

    fn update_command(&self) -> &'static str {
        "apt-get update"
    }

    fn list_command(&self) -> &'static str {
        "apt-cache dumpavail"
    }

    fn installed_command(&self) -> &'static str {
        "dpkg-query -W -f '${Package} ${Version}\\n'"
    }

    fn install_command(&self, packages: &[String]) -> String {
        format!("apt-get -y install {}", packages.join(" "))
    }

    fn remove_command(&self, packages: &[String]) -> String {
        format!("apt-get -y remove {}", packages.join(" "))
    }

    fn parse_available(&self, output: &str) -> Vec<PackageRecord> {
        parse_dumpavail_records(output)
    }
}

/// Arch guests: pacman sync database.
pub struct ArchProvider;

impl GuestProvider for ArchProvider {
    fn id(&self) -> &'static str {
        "arch"
    }

    fn update_command(&self) -> &'static str {
        "pacman -Sy --noconfirm"
    }

    fn list_command(&self) -> &'static str {
        "pacman -Sl"
    }

    fn installed_command(&self) -> &'static str {
        "pacman -Q"
    }

    fn install_command(&self, packages: &[String]) -> String {
        format!("pacman -S --noconfirm {}", packages.join(" "))
    }

    fn remove_command(&self, packages: &[String]) -> String {
        format!("pacman -R --noconfirm {}", packages.join(" "))
    }

    /// `pacman -Sl` lines: `repo name version [installed]`.
    fn parse_available(&self, output: &str) -> Vec<PackageRecord> {
        output
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let section = parts.next()?.to_string();
                let name = parts.next()?.to_string();
                let version = parts.next().unwrap_or_default().to_string();
                let installed = line.trim_end().ends_with("[installed]");
                Some(PackageRecord {
                    name,
                    section,
                    version,
                    installed,
                    ..Default::default()
                })
            })
            .collect()
    }
}

fn parse_dumpavail_records(output: &str) -> Vec<PackageRecord> {
    let mut records = Vec::new();
    let _ = parser::parse_dumpavail(output.as_bytes(), |meta| {
        records.push(PackageRecord {
            name: meta.name,
            section: meta.section,
            maintainer: meta.maintainer,
            version: meta.version,
            installed_size: meta.installed_size,
            download_size: meta.size,
            filename: meta.filename,
            description: meta.description,
            changelog: parser::latest_changelog_entry(&meta.changelog),
            depends: meta.depends,
            provides: meta.provides,
            ..Default::default()
        });
        Ok(())
    });
    records
}

/// Parse `/etc/os-release` content down to the `ID` value.
pub fn os_release_id(content: &str) -> Option<String> {
    for line in content.lines() {
        if let Some(value) = line.trim().strip_prefix("ID=") {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

/// Reuse of the host RPM parser for guests that expose `rpm -qia`.
#[allow(dead_code)]
pub fn parse_rpm_installed(output: &str) -> HashMap<String, String> {
    rpm::parse_installed(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_release_id_extraction() {
        let content = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\n";
        assert_eq!(os_release_id(content).as_deref(), Some("ubuntu"));
        let quoted = "ID=\"altlinux\"\n";
        assert_eq!(os_release_id(quoted).as_deref(), Some("altlinux"));
        assert!(os_release_id("NAME=Plain\n").is_none());
    }

    #[test]
    fn provider_selection_covers_known_families() {
        assert_eq!(provider_for("ubuntu").unwrap().id(), "ubuntu");
        assert_eq!(provider_for("debian").unwrap().id(), "ubuntu");
        assert_eq!(provider_for("arch").unwrap().id(), "arch");
        assert_eq!(provider_for("altlinux").unwrap().id(), "altlinux");
        assert!(provider_for("gentoo").is_none());
    }

    #[test]
    fn arch_list_parsing_reads_repo_name_version() {
        let output = "extra zip 3.0-11\ncore pacman 6.1.0-3 [installed]\n";
        let records = ArchProvider.parse_available(output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "zip");
        assert_eq!(records[0].section, "extra");
        assert!(!records[0].installed);
        assert!(records[1].installed);
    }

    #[test]
    fn installed_lines_parse_to_map() {
        let map = parse_name_version_lines("zip 3.0\nunzip 6.0\n");
        assert_eq!(map["zip"], "3.0");
        assert_eq!(map["unzip"], "6.0");
    }

    #[test]
    fn dumpavail_providers_share_the_host_parser() {
        let output = "Package: curl\nVersion: 8.5.0\nSection: net\n\n";
        let records = UbuntuProvider.parse_available(output);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "curl");
        assert_eq!(records[0].section, "net");
    }
}
