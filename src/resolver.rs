//! Look up groups and projects by exact path.
//!
//! A missing entity is a normal answer (`Ok(None)`); only transport, auth,
//! and other API failures are errors.

use crate::gitlab::{GitLabError, Group, HostingApi, Project};

#[derive(Debug, Clone)]
pub enum Entity {
    Group(Group),
    Project(Project),
}

impl Entity {
    pub fn full_path(&self) -> &str {
        match self {
            Self::Group(group) => &group.full_path,
            Self::Project(project) => &project.path_with_namespace,
        }
    }
}

pub fn resolve_group<H: HostingApi + ?Sized>(
    api: &H,
    full_path: &str,
) -> Result<Option<Group>, GitLabError> {
    if full_path.is_empty() {
        return Ok(None);
    }
    not_found_as_none(api.group(full_path))
}

pub fn resolve_project<H: HostingApi + ?Sized>(
    api: &H,
    full_path: &str,
) -> Result<Option<Project>, GitLabError> {
    if full_path.is_empty() {
        return Ok(None);
    }
    not_found_as_none(api.project(full_path))
}

/// Resolve `full_path` as a group first, then as a project.
pub fn resolve<H: HostingApi + ?Sized>(
    api: &H,
    full_path: &str,
) -> Result<Option<Entity>, GitLabError> {
    if let Some(group) = resolve_group(api, full_path)? {
        return Ok(Some(Entity::Group(group)));
    }
    Ok(resolve_project(api, full_path)?.map(Entity::Project))
}

fn not_found_as_none<T>(result: Result<T, GitLabError>) -> Result<Option<T>, GitLabError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(GitLabError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}
