//! A [`HostingApi`] overlay that plans creations instead of performing them.
//!
//! Lookups see the wrapped instance plus everything "created" so far, so the
//! reconciler walks exactly the path it would take for real.

use std::cell::RefCell;

use crate::gitlab::{
    CreateGroupRequest,
    CreateProjectRequest,
    GitLabError,
    Group,
    HostingApi,
    Namespace,
    Project,
    User,
};

#[derive(Default)]
struct Planned {
    groups: Vec<Group>,
    projects: Vec<Project>,
    created: u64,
}

pub struct DryRun<'a, H: HostingApi + ?Sized> {
    inner: &'a H,
    planned: RefCell<Planned>,
}

impl<'a, H: HostingApi + ?Sized> DryRun<'a, H> {
    pub fn new(inner: &'a H) -> Self {
        Self {
            inner,
            planned: RefCell::new(Planned::default()),
        }
    }

    /// Ids count down from the top of the range so they never collide with
    /// ids handed out by the real instance.
    fn next_id(&self) -> u64 {
        let mut planned = self.planned.borrow_mut();
        planned.created += 1;
        u64::MAX - planned.created
    }
}

impl<H: HostingApi + ?Sized> HostingApi for DryRun<'_, H> {
    fn current_user(&self) -> Result<User, GitLabError> {
        self.inner.current_user()
    }

    fn group(&self, id_or_path: &str) -> Result<Group, GitLabError> {
        let planned = self
            .planned
            .borrow()
            .groups
            .iter()
            .find(|g| g.full_path == id_or_path || g.id.to_string() == id_or_path)
            .cloned();
        match planned {
            Some(group) => Ok(group),
            None => self.inner.group(id_or_path),
        }
    }

    fn descendant_groups(&self, group_id: u64) -> Result<Vec<Group>, GitLabError> {
        self.inner.descendant_groups(group_id)
    }

    fn group_projects(&self, group_id: u64) -> Result<Vec<Project>, GitLabError> {
        self.inner.group_projects(group_id)
    }

    fn project(&self, full_path: &str) -> Result<Project, GitLabError> {
        let planned = self
            .planned
            .borrow()
            .projects
            .iter()
            .find(|p| p.path_with_namespace == full_path)
            .cloned();
        match planned {
            Some(project) => Ok(project),
            None => self.inner.project(full_path),
        }
    }

    fn create_group(&self, request: &CreateGroupRequest) -> Result<Group, GitLabError> {
        let full_path = match request.parent_id {
            Some(parent_id) => {
                let parent = self.group(&parent_id.to_string())?;
                format!("{}/{}", parent.full_path, request.path)
            }
            None => request.path.to_string(),
        };
        tracing::info!("[dry-run] would create group {}", full_path);

        let group = Group {
            id: self.next_id(),
            name: request.name.to_string(),
            path: request.path.to_string(),
            full_path,
            parent_id: request.parent_id,
            web_url: String::new(),
            description: request.description.map(str::to_string),
        };
        self.planned.borrow_mut().groups.push(group.clone());
        Ok(group)
    }

    fn create_project(&self, request: &CreateProjectRequest) -> Result<Project, GitLabError> {
        let namespace = self.group(&request.namespace_id.to_string())?;
        let full_path = format!("{}/{}", namespace.full_path, request.path);
        tracing::info!("[dry-run] would create project {}", full_path);

        let project = Project {
            id: self.next_id(),
            name: request.name.to_string(),
            path: request.path.to_string(),
            path_with_namespace: full_path,
            http_url_to_repo: String::new(),
            web_url: String::new(),
            namespace: Namespace {
                id: namespace.id,
                full_path: namespace.full_path,
            },
        };
        self.planned.borrow_mut().projects.push(project.clone());
        Ok(project)
    }
}
