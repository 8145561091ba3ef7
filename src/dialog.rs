//! Interactive confirmation of a planned change-set.
//!
//! Before a terminal-mode install or remove, the user is shown what the dry
//! run planned (per-package metadata plus aggregate counts) and asked to
//! confirm. Machine callers (json/dbus output) bypass the gate entirely.

use crate::apt::CheckAction;
use crate::apt::parser::ChangeSet;
use crate::catalog::PackageRecord;
use crate::progress::TrackerHandle;
use anyhow::Result;
use is_terminal::IsTerminal;

/// Decision seam between the engine and the terminal.
pub trait ChangeGate: Sync {
    /// Present the planned changes; `Ok(false)` means the user declined.
    fn confirm(
        &self,
        action: CheckAction,
        changes: &ChangeSet,
        candidates: &[PackageRecord],
    ) -> Result<bool>;
}

/// Gate for machine callers: everything is pre-approved.
pub struct AutoApprove;

impl ChangeGate for AutoApprove {
    fn confirm(&self, _: CheckAction, _: &ChangeSet, _: &[PackageRecord]) -> Result<bool> {
        Ok(true)
    }
}

/// Terminal gate built on cliclack prompts.
///
/// The task tracker owns the screen while work is in flight, so the prompt
/// runs inside its suspend scope.
pub struct TerminalGate {
    tracker: Option<TrackerHandle>,
}

impl TerminalGate {
    pub fn new(tracker: Option<TrackerHandle>) -> Self {
        Self { tracker }
    }

    fn prompt(
        &self,
        action: CheckAction,
        changes: &ChangeSet,
        candidates: &[PackageRecord],
    ) -> Result<bool> {
        // Without a terminal nobody can answer; treat it as a decline.
        if !std::io::stdin().is_terminal() {
            return Ok(false);
        }
        let summary = render_summary(changes, candidates);
        let (title, question) = match action {
            CheckAction::Install => ("Planned installation", "Install these packages?"),
            CheckAction::Remove => ("Planned removal", "Remove these packages?"),
        };
        cliclack::note(title, summary)?;
        // Esc / q cancel the prompt; cliclack reports that as an error,
        // which the engine turns into a cancelled-dialog response.
        let confirmed = cliclack::confirm(question)
            .initial_value(matches!(action, CheckAction::Install))
            .interact()
            .unwrap_or(false);
        Ok(confirmed)
    }
}

impl ChangeGate for TerminalGate {
    fn confirm(
        &self,
        action: CheckAction,
        changes: &ChangeSet,
        candidates: &[PackageRecord],
    ) -> Result<bool> {
        match &self.tracker {
            Some(tracker) => tracker.suspend(|| self.prompt(action, changes, candidates)),
            None => self.prompt(action, changes, candidates),
        }
    }
}

/// Summary body shown above the confirm prompt.
fn render_summary(changes: &ChangeSet, candidates: &[PackageRecord]) -> String {
    let mut lines = Vec::new();
    for record in candidates {
        let version = if record.version.is_empty() {
            String::new()
        } else {
            format!(" {}", record.version)
        };
        let summary = record
            .description
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        if summary.is_empty() {
            lines.push(format!("{}{}", record.name, version));
        } else {
            lines.push(format!("{}{} - {}", record.name, version, summary));
        }
    }
    lines.push(String::new());
    lines.push(format!(
        "{} to install, {} to upgrade, {} to remove, {} held back",
        changes.new_installed_count,
        changes.upgraded_count,
        changes.removed_count,
        changes.not_upgraded_count
    ));
    lines.join("\n")
}

/// Gate that declines everything; test helper.
#[cfg(test)]
pub struct RejectAll;

#[cfg(test)]
impl ChangeGate for RejectAll {
    fn confirm(&self, _: CheckAction, _: &ChangeSet, _: &[PackageRecord]) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_candidates_and_counts() {
        let changes = ChangeSet {
            new_installed_count: 2,
            not_upgraded_count: 4,
            ..Default::default()
        };
        let candidates = vec![
            PackageRecord {
                name: "zip".to_string(),
                version: "3.0".to_string(),
                description: "file compression utility\nlong tail".to_string(),
                ..Default::default()
            },
            PackageRecord {
                name: "unzip".to_string(),
                ..Default::default()
            },
        ];
        let summary = render_summary(&changes, &candidates);
        assert!(summary.contains("zip 3.0 - file compression utility"));
        assert!(!summary.contains("long tail"));
        assert!(summary.contains("2 to install"));
        assert!(summary.contains("4 held back"));
    }

    #[test]
    fn auto_approve_always_confirms() {
        let ok = AutoApprove
            .confirm(CheckAction::Remove, &ChangeSet::default(), &[])
            .unwrap();
        assert!(ok);
    }
}
