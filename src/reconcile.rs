//! Topology reconciliation: make every source group and project exist on the
//! destination.
//!
//! Each group and each project is its own unit of work. A unit that fails is
//! recorded in the [`Report`] with its path and the walk moves on. Only
//! failing to read the [`SourceTree`] at all is returned as an error.

use std::collections::HashSet;

use anyhow::{Context, Result, anyhow, bail};

use crate::{
    gitlab::{CreateProjectRequest, GitLabError, Group, HostingApi, Project},
    materialize::ensure_group,
    mirror::MirrorTarget,
    path,
    report::{Outcome, Report, UnitKind},
    resolver::{resolve_group, resolve_project},
};

/// Project full paths the operator asked to leave alone.
#[derive(Debug, Default, Clone)]
pub struct Exclusions(HashSet<String>);

impl Exclusions {
    /// From `--ignore-project-paths` values; blanks are dropped and
    /// surrounding slashes trimmed.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            paths
                .into_iter()
                .map(|p| p.as_ref().trim().trim_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        )
    }

    pub fn contains(&self, full_path: &str) -> bool {
        self.0.contains(full_path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Groups and projects under the root group, read once at the start of a run.
#[derive(Debug, Clone)]
pub struct SourceTree {
    pub root: Group,
    pub groups: Vec<Group>,
    pub projects: Vec<Project>,
}

impl SourceTree {
    pub fn read<S: HostingApi + ?Sized>(source: &S, root: Group) -> Result<Self> {
        let groups = source
            .descendant_groups(root.id)
            .with_context(|| format!("listing groups below {}", root.full_path))?;
        let projects = source
            .group_projects(root.id)
            .with_context(|| format!("listing projects below {}", root.full_path))?;
        tracing::info!(
            "found {} sub-groups and {} projects below {}",
            groups.len(),
            projects.len(),
            root.full_path
        );
        Ok(Self {
            root,
            groups,
            projects,
        })
    }

    /// Root first, then every descendant in listing order.
    pub fn group_paths(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.root.full_path.as_str())
            .chain(self.groups.iter().map(|g| g.full_path.as_str()))
    }

    /// Whether every project below `group_path` is excluded, and there is at
    /// least one.
    pub fn holds_only_excluded(&self, group_path: &str, exclusions: &Exclusions) -> bool {
        let prefix = format!("{group_path}/");
        let mut any_excluded = false;
        for project in &self.projects {
            if !project.path_with_namespace.starts_with(&prefix) {
                continue;
            }
            if !exclusions.contains(&project.path_with_namespace) {
                return false;
            }
            any_excluded = true;
        }
        any_excluded
    }

    /// Whether `group_path` exists only to hold excluded projects: it and
    /// every source group below it hold only excluded projects. A subgroup
    /// that is kept (including an empty one) needs this group as its ancestor.
    pub fn skipped_by_exclusions(&self, group_path: &str, exclusions: &Exclusions) -> bool {
        if exclusions.is_empty() || !self.holds_only_excluded(group_path, exclusions) {
            return false;
        }
        let prefix = format!("{group_path}/");
        self.groups
            .iter()
            .filter(|g| g.full_path.starts_with(&prefix))
            .all(|g| self.holds_only_excluded(&g.full_path, exclusions))
    }
}

pub struct Reconciler<'a, S: HostingApi + ?Sized, D: HostingApi + ?Sized> {
    source: &'a S,
    destination: &'a D,
    report: &'a Report,
    dry_run: bool,
}

impl<'a, S: HostingApi + ?Sized, D: HostingApi + ?Sized> Reconciler<'a, S, D> {
    pub fn new(source: &'a S, destination: &'a D, report: &'a Report) -> Self {
        Self {
            source,
            destination,
            report,
            dry_run: false,
        }
    }

    /// Record creations as planned rather than done. The destination is
    /// expected to be a [`crate::dry_run::DryRun`] overlay.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn created_outcome(&self) -> Outcome {
        if self.dry_run {
            Outcome::Planned
        } else {
            Outcome::Created
        }
    }

    /// Materialize the root and every group below it on the destination,
    /// except groups that would only hold excluded projects.
    pub fn reconcile_groups(&self, tree: &SourceTree, exclusions: &Exclusions) {
        let mut created_this_run: HashSet<String> = HashSet::new();

        for full_path in tree.group_paths() {
            // Created earlier in this walk as somebody's ancestor.
            if created_this_run.contains(full_path) {
                continue;
            }
            if tree.skipped_by_exclusions(full_path, exclusions) {
                tracing::debug!("skip creating group {}: only excluded projects", full_path);
                self.report
                    .record(UnitKind::Group, full_path, Outcome::Skipped);
                continue;
            }
            match ensure_group(self.destination, self.source, full_path) {
                Ok(Some(materialized)) if materialized.created.is_empty() => {
                    tracing::debug!("group [{}] FOUND in destination. SKIP creating.", full_path);
                    self.report
                        .record(UnitKind::Group, full_path, Outcome::Existing);
                }
                Ok(Some(materialized)) => {
                    for created in materialized.created {
                        self.report
                            .record(UnitKind::Group, created.as_str(), self.created_outcome());
                        created_this_run.insert(created);
                    }
                }
                Ok(None) => {}
                Err(incomplete) => {
                    for created in incomplete.created {
                        self.report
                            .record(UnitKind::Group, created.as_str(), self.created_outcome());
                        created_this_run.insert(created);
                    }
                    self.report.record(
                        UnitKind::Group,
                        full_path,
                        Outcome::Failed(format!("{:#}", incomplete.error)),
                    );
                }
            }
        }
    }

    /// Create every non-excluded source project in `tree` that the
    /// destination lacks. Groups must already be reconciled.
    ///
    /// Returns the projects whose content can be mirrored: those that exist
    /// on the destination after this call.
    pub fn reconcile_projects(
        &self,
        tree: &SourceTree,
        exclusions: &Exclusions,
    ) -> Vec<MirrorTarget> {
        let mut targets = Vec::new();
        for project in &tree.projects {
            let full_path = project.path_with_namespace.as_str();
            if exclusions.contains(full_path) {
                tracing::debug!("skip creating project {}", full_path);
                self.report
                    .record(UnitKind::Project, full_path, Outcome::Skipped);
                continue;
            }

            match self.ensure_project(project) {
                Ok((destination_project, outcome)) => {
                    self.report.record(UnitKind::Project, full_path, outcome);
                    targets.push(MirrorTarget {
                        path: full_path.to_string(),
                        source_url: project.http_url_to_repo.clone(),
                        destination_url: destination_project.http_url_to_repo,
                    });
                }
                Err(e) => self.report.record(
                    UnitKind::Project,
                    full_path,
                    Outcome::Failed(format!("{e:#}")),
                ),
            }
        }
        targets
    }

    /// Find or create the destination counterpart of `project`. An existing
    /// project is returned untouched; its metadata is never updated.
    fn ensure_project(&self, project: &Project) -> Result<(Project, Outcome)> {
        let full_path = project.path_with_namespace.as_str();
        path::validate_segments(full_path)?;
        let group_path = path::parent(full_path);
        if group_path.is_empty() {
            bail!("project {} is not inside a group", full_path);
        }

        let group = resolve_group(self.destination, group_path)
            .with_context(|| format!("looking up destination group {}", group_path))?
            .ok_or_else(|| anyhow!("destination group {} does not exist", group_path))?;

        if let Some(existing) = resolve_project(self.destination, full_path)
            .with_context(|| format!("looking up destination project {}", full_path))?
        {
            tracing::debug!("remote project {} exists. SKIP creating.", full_path);
            return Ok((existing, Outcome::Existing));
        }

        let description = format!("Mirrored from {}", project.http_url_to_repo);
        let request = CreateProjectRequest {
            name: &project.name,
            path: path::leaf(full_path),
            namespace_id: group.id,
            description: Some(&description),
        };
        match self.destination.create_project(&request) {
            Ok(created) => {
                tracing::info!("created project {} (id={})", full_path, created.id);
                Ok((created, self.created_outcome()))
            }
            Err(GitLabError::AlreadyExists { message }) => {
                match resolve_project(self.destination, full_path)
                    .with_context(|| format!("re-checking destination project {}", full_path))?
                {
                    Some(existing) => {
                        tracing::debug!(
                            "project {} appeared concurrently; reusing it",
                            full_path
                        );
                        Ok((existing, Outcome::Existing))
                    }
                    None => bail!(
                        "creating project {}: path reported as taken but no such project is visible: {}",
                        full_path,
                        message
                    ),
                }
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("creating project {}", full_path))),
        }
    }
}
