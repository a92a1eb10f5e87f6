use std::{collections::BTreeMap, sync::Mutex};

use colored::Colorize;

use crate::mirror::SyncKind;

/// What a recorded unit of work was about
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnitKind {
    Group,
    Project,
    Repository,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Group => write!(f, "group"),
            Self::Project => write!(f, "project"),
            Self::Repository => write!(f, "repository"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Created on the destination during this run
    Created,
    /// Already present on the destination
    Existing,
    /// Would be created (dry run)
    Planned,
    /// Excluded by the operator
    Skipped,
    /// Repository content pushed
    Synced(SyncKind),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub kind: UnitKind,
    pub path: String,
    pub outcome: Outcome,
}

/// Per-kind tallies
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Counts {
    pub created: u64,
    pub existing: u64,
    pub planned: u64,
    pub skipped: u64,
    pub synced: u64,
    pub failed: u64,
}

impl Counts {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Existing => self.existing += 1,
            Outcome::Planned => self.planned += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Synced(_) => self.synced += 1,
            Outcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.created + self.existing + self.planned + self.skipped + self.synced + self.failed
    }
}

/// Outcomes of every group, project, and repository handled in a run.
///
/// Shared by reference between the reconciler and the sync workers.
#[derive(Debug, Default)]
pub struct Report {
    entries: Mutex<Vec<Entry>>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one unit's outcome. Failures are logged here with their path.
    pub fn record(&self, kind: UnitKind, path: impl Into<String>, outcome: Outcome) {
        let path = path.into();
        match &outcome {
            Outcome::Failed(error) => tracing::error!(%kind, %path, %error, "{} failed", kind),
            Outcome::Skipped => tracing::debug!(%kind, %path, "skipped (excluded)"),
            _ => tracing::trace!(%kind, %path, ?outcome, "recorded"),
        }
        self.lock().push(Entry {
            kind,
            path,
            outcome,
        });
    }

    /// Latest outcome recorded for `path`.
    pub fn outcome_of(&self, kind: UnitKind, path: &str) -> Option<Outcome> {
        self.lock()
            .iter()
            .rev()
            .find(|e| e.kind == kind && e.path == path)
            .map(|e| e.outcome.clone())
    }

    pub fn failures(&self) -> Vec<Entry> {
        self.lock()
            .iter()
            .filter(|e| matches!(e.outcome, Outcome::Failed(_)))
            .cloned()
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.lock()
            .iter()
            .any(|e| matches!(e.outcome, Outcome::Failed(_)))
    }

    pub fn counts(&self) -> BTreeMap<UnitKind, Counts> {
        let mut by_kind: BTreeMap<UnitKind, Counts> = BTreeMap::new();
        for entry in self.lock().iter() {
            by_kind.entry(entry.kind).or_default().record(&entry.outcome);
        }
        by_kind
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        // A worker that panicked mid-push leaves the vector intact.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Print a summary table, then every failure, to stderr
    pub fn print_summary(&self) {
        let counts = self.counts();

        eprintln!();
        eprintln!("{}", "=== Mirror Summary ===".yellow().bold());
        eprintln!();
        eprintln!(
            "{:<12} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
            "Kind", "Created", "Existing", "Planned", "Skipped", "Synced", "Failed", "Total"
        );
        eprintln!("{}", "-".repeat(77));

        for (kind, c) in &counts {
            let failed = if c.failed > 0 {
                c.failed.to_string().red().bold()
            } else {
                c.failed.to_string().normal()
            };
            eprintln!(
                "{:<12} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
                kind.to_string(),
                c.created,
                c.existing,
                c.planned,
                c.skipped,
                c.synced,
                failed,
                c.total()
            );
        }
        eprintln!("{}", "-".repeat(77));

        let failures = self.failures();
        if failures.is_empty() {
            eprintln!("{}", "No failures.".green());
        } else {
            eprintln!("{}", format!("{} failure(s):", failures.len()).red().bold());
            for entry in failures {
                if let Outcome::Failed(error) = &entry.outcome {
                    eprintln!("  {} {}: {}", entry.kind, entry.path.yellow(), error);
                }
            }
        }
        eprintln!();
    }
}
