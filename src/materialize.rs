//! Make a source group, and every ancestor it needs, exist on the destination.

use std::fmt;

use anyhow::{Context, Result, anyhow, bail};

use crate::{
    gitlab::{CreateGroupRequest, GitLabError, Group, HostingApi},
    path,
    resolver::resolve_group,
};

/// The destination group for a path, plus every group created to reach it
/// (shallowest first).
#[derive(Debug)]
pub struct Materialized {
    pub group: Group,
    pub created: Vec<String>,
}

/// A materialization that stopped partway. `created` lists the levels that
/// were created before `error`; they exist on the destination.
#[derive(Debug)]
pub struct Incomplete {
    pub created: Vec<String>,
    pub error: anyhow::Error,
}

impl From<anyhow::Error> for Incomplete {
    fn from(error: anyhow::Error) -> Self {
        Self {
            created: Vec::new(),
            error,
        }
    }
}

impl fmt::Display for Incomplete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "{:#}", self.error)
        } else {
            write!(f, "{}", self.error)
        }
    }
}

/// Ensure the group at `full_path` exists on `destination`, creating any
/// missing ancestors first. Returns `None` for the empty path.
///
/// Missing levels are created top-down starting at the shallowest missing
/// ancestor, so every ancestor exists by the time a child is created. The
/// walk is bounded by the path's depth, which [`path::validate`] caps.
pub fn ensure_group<D, S>(
    destination: &D,
    source: &S,
    full_path: &str,
) -> Result<Option<Materialized>, Incomplete>
where
    D: HostingApi + ?Sized,
    S: HostingApi + ?Sized,
{
    if full_path.is_empty() {
        tracing::debug!("empty path => skipping");
        return Ok(None);
    }
    path::validate(full_path)?;

    if let Some(group) = resolve_group(destination, full_path)
        .with_context(|| format!("looking up destination group {}", full_path))?
    {
        return Ok(Some(Materialized {
            group,
            created: Vec::new(),
        }));
    }

    // The full path is missing; find the deepest ancestor that is not.
    let prefixes = path::prefixes(full_path);
    let mut first_missing = prefixes.len() - 1;
    let mut parent = None;
    while first_missing > 0 {
        let ancestor = prefixes[first_missing - 1];
        match resolve_group(destination, ancestor)
            .with_context(|| format!("looking up destination group {}", ancestor))?
        {
            Some(group) => {
                parent = Some(group);
                break;
            }
            None => {
                tracing::debug!("parent group ({}) not found", ancestor);
                first_missing -= 1;
            }
        }
    }

    let mut created = Vec::new();
    for prefix in &prefixes[first_missing..] {
        let level = create_group_at(destination, source, prefix, parent.as_ref());
        let (group, was_created) = match level {
            Ok(level) => level,
            Err(error) => return Err(Incomplete { created, error }),
        };
        if was_created {
            created.push(prefix.to_string());
        }
        parent = Some(group);
    }

    let group = parent.ok_or_else(|| anyhow!("no group materialized for {}", full_path))?;
    Ok(Some(Materialized { group, created }))
}

/// Create one level. `parent` is `None` only for a first-level group.
///
/// Returns the group and whether this call created it. A "path already
/// taken" answer counts as success only if the group is then visible.
fn create_group_at<D, S>(
    destination: &D,
    source: &S,
    full_path: &str,
    parent: Option<&Group>,
) -> Result<(Group, bool)>
where
    D: HostingApi + ?Sized,
    S: HostingApi + ?Sized,
{
    let source_group = resolve_group(source, full_path)
        .with_context(|| format!("looking up source group {}", full_path))?;
    let slug = path::leaf(full_path);
    let name = source_group.as_ref().map_or(slug, |g| g.name.as_str());
    let description = source_group
        .as_ref()
        .filter(|g| !g.web_url.is_empty())
        .map(|g| format!("Mirrored from {}", g.web_url));

    match parent {
        None => tracing::debug!("creating top level group {}", full_path),
        Some(p) => tracing::debug!("path {}, parent path {}", full_path, p.full_path),
    }

    let request = CreateGroupRequest {
        name,
        path: slug,
        parent_id: parent.map(|p| p.id),
        description: description.as_deref(),
    };
    match destination.create_group(&request) {
        Ok(group) => {
            if group.full_path != full_path {
                tracing::warn!(
                    "created group {} but destination reports it as {}",
                    full_path,
                    group.full_path
                );
            }
            tracing::info!("created group {} (id={})", full_path, group.id);
            Ok((group, true))
        }
        Err(GitLabError::AlreadyExists { message }) => {
            match resolve_group(destination, full_path)
                .with_context(|| format!("re-checking destination group {}", full_path))?
            {
                Some(group) => {
                    tracing::debug!("group {} appeared concurrently; reusing it", full_path);
                    Ok((group, false))
                }
                None => bail!(
                    "creating group {}: path reported as taken but no such group is visible: {}",
                    full_path,
                    message
                ),
            }
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("creating group {}", full_path))),
    }
}
