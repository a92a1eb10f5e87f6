//! Run repository syncs on a bounded worker pool.

use std::path::Path;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use rayon::prelude::*;

use crate::{
    mirror::{Credentials, MirrorTarget, SyncKind, sync_repository},
    report::{Outcome, Report, UnitKind},
};

/// Worker count when none is given.
pub fn default_workers() -> usize {
    num_cpus::get()
}

/// Sync every target with at most `workers` running at once and wait for all
/// of them. Per-repository failures go to `report`; the `Err` case is only
/// for failing to start the pool.
pub fn sync_all(
    targets: &[MirrorTarget],
    cache_root: &Path,
    credentials: &Credentials,
    workers: usize,
    report: &Report,
) -> Result<()> {
    sync_all_with(targets, workers, report, |target| {
        sync_repository(target, cache_root, credentials)
    })
}

pub(crate) fn sync_all_with<F>(
    targets: &[MirrorTarget],
    workers: usize,
    report: &Report,
    sync: F,
) -> Result<()>
where
    F: Fn(&MirrorTarget) -> Result<SyncKind> + Sync,
{
    let workers = workers.max(1);
    tracing::info!(
        "syncing {} repositories with {} workers",
        targets.len(),
        workers
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("glmirror-sync-{}", i))
        .build()
        .context("Failed to start sync workers")?;

    let progress = ProgressBar::new(targets.len() as u64);

    pool.install(|| {
        targets.par_iter().for_each(|target| {
            let _span = tracing::info_span!("sync", path = %target.path).entered();
            tracing::debug!("sync started");
            progress.set_message(target.path.clone());

            let outcome = match sync(target) {
                Ok(kind) => {
                    tracing::debug!("sync completed ({:?})", kind);
                    Outcome::Synced(kind)
                }
                Err(e) => Outcome::Failed(format!("{e:#}")),
            };
            report.record(UnitKind::Repository, target.path.as_str(), outcome);
            progress.inc(1);
        });
    });

    progress.finish_and_clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };

    use anyhow::bail;

    use super::*;
    use crate::{
        reconcile::{Exclusions, Reconciler, SourceTree},
        testing::{FakeHosting, branch_names, commit_file, init_bare},
    };

    fn target(path: &str) -> MirrorTarget {
        MirrorTarget {
            path: path.to_string(),
            source_url: format!("/nonexistent/{path}.git"),
            destination_url: format!("/nonexistent/{path}-dest.git"),
        }
    }

    #[test]
    fn test_every_target_runs_once_within_the_worker_bound() {
        let targets: Vec<MirrorTarget> = (0..12).map(|i| target(&format!("g/p{i}"))).collect();
        let report = Report::new();
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let seen = Mutex::new(HashSet::new());

        sync_all_with(&targets, 3, &report, |t| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            seen.lock().unwrap().insert(t.path.clone());
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(SyncKind::Cloned)
        })
        .unwrap();

        assert_eq!(seen.lock().unwrap().len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(report.counts()[&UnitKind::Repository].synced, 12);
    }

    #[test]
    fn test_one_failure_does_not_affect_the_others() {
        let targets: Vec<MirrorTarget> = ["g/a", "g/b", "g/c", "g/d"]
            .iter()
            .map(|p| target(p))
            .collect();
        let report = Report::new();

        sync_all_with(&targets, 2, &report, |t| {
            if t.path == "g/c" {
                bail!("destination unreachable");
            }
            Ok(SyncKind::Refreshed)
        })
        .unwrap();

        let counts = report.counts();
        assert_eq!(counts[&UnitKind::Repository].synced, 3);
        assert_eq!(counts[&UnitKind::Repository].failed, 1);
        let failures = report.failures();
        assert_eq!(failures[0].path, "g/c");
        assert!(matches!(&failures[0].outcome, Outcome::Failed(m) if m.contains("unreachable")));
    }

    #[test]
    fn test_real_sync_isolated_from_unreachable_destination() {
        let dir = tempfile::tempdir().unwrap();
        let mut targets = Vec::new();
        let mut destinations = Vec::new();
        for name in ["p1", "p2", "p3"] {
            let source = init_bare(&dir.path().join(format!("{name}.git")));
            commit_file(&source, "main", "README", name);
            let destination_path = dir.path().join(format!("{name}-dest.git"));
            if name != "p2" {
                destinations.push(init_bare(&destination_path));
            }
            targets.push(MirrorTarget {
                path: format!("g/{name}"),
                source_url: dir.path().join(format!("{name}.git")).display().to_string(),
                destination_url: destination_path.display().to_string(),
            });
        }
        let report = Report::new();

        sync_all(
            &targets,
            &dir.path().join("cache"),
            &Credentials::default(),
            2,
            &report,
        )
        .unwrap();

        assert_eq!(report.counts()[&UnitKind::Repository].synced, 2);
        assert!(matches!(
            report.outcome_of(UnitKind::Repository, "g/p2"),
            Some(Outcome::Failed(_))
        ));
        for destination in &destinations {
            assert_eq!(branch_names(destination), vec!["main".to_string()]);
        }
    }

    #[test]
    fn test_reconciled_projects_are_mirrored_and_excluded_ones_never_synced() {
        let dir = tempfile::tempdir().unwrap();
        let repo_url = |name: &str| dir.path().join(name).display().to_string();

        let p1_source = init_bare(&dir.path().join("p1.git"));
        let p1_head = commit_file(&p1_source, "main", "README", "p1");
        let p2_source = init_bare(&dir.path().join("p2.git"));
        commit_file(&p2_source, "main", "README", "p2");
        let p1_destination = init_bare(&dir.path().join("p1-dest.git"));
        let p2_destination = init_bare(&dir.path().join("p2-dest.git"));

        let source = FakeHosting::new();
        source.add_group("g", "G");
        source.add_group("g/sub", "Sub");
        source.add_group("g/excluded", "Excluded");
        source.add_project("g/sub/p1", "P1");
        source.add_project("g/excluded/p2", "P2");
        source.set_repo_url("g/sub/p1", &repo_url("p1.git"));
        source.set_repo_url("g/excluded/p2", &repo_url("p2.git"));
        let destination = FakeHosting::new();
        destination.set_repo_url("g/sub/p1", &repo_url("p1-dest.git"));
        destination.set_repo_url("g/excluded/p2", &repo_url("p2-dest.git"));

        let report = Report::new();
        let tree = SourceTree::read(&source, source.find_group("g").unwrap()).unwrap();
        let exclusions = Exclusions::new(["g/excluded/p2"]);
        let reconciler = Reconciler::new(&source, &destination, &report);
        reconciler.reconcile_groups(&tree, &exclusions);
        let targets = reconciler.reconcile_projects(&tree, &exclusions);

        sync_all(
            &targets,
            &dir.path().join("cache"),
            &Credentials::default(),
            2,
            &report,
        )
        .unwrap();

        assert_eq!(destination.project_paths(), vec!["g/sub/p1"]);
        assert_eq!(
            report.outcome_of(UnitKind::Repository, "g/sub/p1"),
            Some(Outcome::Synced(SyncKind::Cloned))
        );
        assert_eq!(report.outcome_of(UnitKind::Repository, "g/excluded/p2"), None);
        assert_eq!(
            p1_destination.refname_to_id("refs/heads/main").unwrap(),
            p1_head
        );
        assert!(branch_names(&p2_destination).is_empty());
        assert!(!dir.path().join("cache/g/excluded").exists());
        assert!(!report.has_failures());
    }
}
