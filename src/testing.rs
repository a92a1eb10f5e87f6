//! In-memory hosting instance and git fixtures for tests.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    path::Path,
};

use git2::{Oid, Repository, Signature};

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
struct FakeState {
    next_id: u64,
    groups: Vec<Group>,
    projects: Vec<Project>,
    /// Full paths whose lookups fail with a network error
    failing_lookups: HashSet<String>,
    /// Full paths whose creation fails with a server error
    failing_creates: HashSet<String>,
    /// Full paths that another client creates just before we do
    racing_creates: HashSet<String>,
    /// Full paths reported as taken that never become visible
    conflicting_creates: HashSet<String>,
    /// Clone URLs for projects, including ones not created yet
    repo_urls: HashMap<String, String>,
    /// Every successful creation, in order
    created: Vec<String>,
}

/// A hosting instance held in memory.
///
/// Creation enforces what GitLab does: the parent group must exist and a
/// path can only be taken once.
#[derive(Default)]
pub struct FakeHosting {
    state: RefCell<FakeState>,
}

impl FakeHosting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&self, full_path: &str, name: &str) -> Group {
        let mut state = self.state.borrow_mut();
        let parent_path = crate::path::parent(full_path);
        let parent_id = state
            .groups
            .iter()
            .find(|g| g.full_path == parent_path)
            .map(|g| g.id);
        state.next_id += 1;
        let group = Group {
            id: state.next_id,
            name: name.to_string(),
            path: crate::path::leaf(full_path).to_string(),
            full_path: full_path.to_string(),
            parent_id,
            web_url: format!("https://fake.example/groups/{full_path}"),
            description: None,
        };
        state.groups.push(group.clone());
        group
    }

    pub fn add_project(&self, full_path: &str, name: &str) -> Project {
        let mut state = self.state.borrow_mut();
        let parent_path = crate::path::parent(full_path);
        let namespace_id = state
            .groups
            .iter()
            .find(|g| g.full_path == parent_path)
            .map(|g| g.id)
            .unwrap_or_else(|| panic!("add group {parent_path} before project {full_path}"));
        state.next_id += 1;
        let project = Project {
            id: state.next_id,
            name: name.to_string(),
            path: crate::path::leaf(full_path).to_string(),
            path_with_namespace: full_path.to_string(),
            http_url_to_repo: state
                .repo_urls
                .get(full_path)
                .cloned()
                .unwrap_or_else(|| format!("https://fake.example/{full_path}.git")),
            web_url: format!("https://fake.example/{full_path}"),
            namespace: Namespace {
                id: namespace_id,
                full_path: parent_path.to_string(),
            },
        };
        state.projects.push(project.clone());
        project
    }

    /// Clone URL for the project at `full_path`, now or once it is created.
    pub fn set_repo_url(&self, full_path: &str, url: &str) {
        let mut state = self.state.borrow_mut();
        state
            .repo_urls
            .insert(full_path.to_string(), url.to_string());
        if let Some(project) = state
            .projects
            .iter_mut()
            .find(|p| p.path_with_namespace == full_path)
        {
            project.http_url_to_repo = url.to_string();
        }
    }

    pub fn fail_lookups_of(&self, full_path: &str) {
        self.state
            .borrow_mut()
            .failing_lookups
            .insert(full_path.to_string());
    }

    pub fn fail_creates_of(&self, full_path: &str) {
        self.state
            .borrow_mut()
            .failing_creates
            .insert(full_path.to_string());
    }

    pub fn race_on_create(&self, full_path: &str) {
        self.state
            .borrow_mut()
            .racing_creates
            .insert(full_path.to_string());
    }

    pub fn conflict_on_create(&self, full_path: &str) {
        self.state
            .borrow_mut()
            .conflicting_creates
            .insert(full_path.to_string());
    }

    /// Paths created through the API, in order.
    pub fn created(&self) -> Vec<String> {
        self.state.borrow().created.clone()
    }

    pub fn group_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .state
            .borrow()
            .groups
            .iter()
            .map(|g| g.full_path.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn project_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .state
            .borrow()
            .projects
            .iter()
            .map(|p| p.path_with_namespace.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn find_group(&self, full_path: &str) -> Option<Group> {
        self.state
            .borrow()
            .groups
            .iter()
            .find(|g| g.full_path == full_path)
            .cloned()
    }

    fn check_lookup(&self, full_path: &str) -> Result<(), GitLabError> {
        if self.state.borrow().failing_lookups.contains(full_path) {
            return Err(GitLabError::Network(format!("connection reset ({full_path})")));
        }
        Ok(())
    }

    /// GitLab's create-time validation: injected failures and taken paths.
    fn check_create(&self, full_path: &str) -> Result<(), GitLabError> {
        let taken = GitLabError::AlreadyExists {
            message: format!("{{\"path\":[\"has already been taken\"]}} ({full_path})"),
        };
        let state = self.state.borrow();
        if state.failing_creates.contains(full_path) {
            return Err(GitLabError::Api {
                status: 500,
                message: format!("internal error creating {full_path}"),
            });
        }
        if state.conflicting_creates.contains(full_path) {
            return Err(taken);
        }
        if state.groups.iter().any(|g| g.full_path == full_path)
            || state
                .projects
                .iter()
                .any(|p| p.path_with_namespace == full_path)
        {
            return Err(taken);
        }
        Ok(())
    }

    fn group_by_id(&self, id: u64) -> Option<Group> {
        self.state
            .borrow()
            .groups
            .iter()
            .find(|g| g.id == id)
            .cloned()
    }
}

impl HostingApi for FakeHosting {
    fn current_user(&self) -> Result<User, GitLabError> {
        Ok(User {
            id: 1,
            username: "mirror-bot".to_string(),
        })
    }

    fn group(&self, id_or_path: &str) -> Result<Group, GitLabError> {
        self.check_lookup(id_or_path)?;
        self.state
            .borrow()
            .groups
            .iter()
            .find(|g| g.full_path == id_or_path || g.id.to_string() == id_or_path)
            .cloned()
            .ok_or(GitLabError::NotFound)
    }

    fn descendant_groups(&self, group_id: u64) -> Result<Vec<Group>, GitLabError> {
        let root = self.group_by_id(group_id).ok_or(GitLabError::NotFound)?;
        let prefix = format!("{}/", root.full_path);
        Ok(self
            .state
            .borrow()
            .groups
            .iter()
            .filter(|g| g.full_path.starts_with(&prefix))
            .cloned()
            .collect())
    }

    fn group_projects(&self, group_id: u64) -> Result<Vec<Project>, GitLabError> {
        let root = self.group_by_id(group_id).ok_or(GitLabError::NotFound)?;
        let prefix = format!("{}/", root.full_path);
        Ok(self
            .state
            .borrow()
            .projects
            .iter()
            .filter(|p| p.path_with_namespace.starts_with(&prefix))
            .cloned()
            .collect())
    }

    fn project(&self, full_path: &str) -> Result<Project, GitLabError> {
        self.check_lookup(full_path)?;
        self.state
            .borrow()
            .projects
            .iter()
            .find(|p| p.path_with_namespace == full_path)
            .cloned()
            .ok_or(GitLabError::NotFound)
    }

    fn create_group(&self, request: &CreateGroupRequest) -> Result<Group, GitLabError> {
        let full_path = match request.parent_id {
            Some(parent_id) => {
                let parent = self.group_by_id(parent_id).ok_or(GitLabError::Api {
                    status: 400,
                    message: format!("parent group {parent_id} does not exist"),
                })?;
                format!("{}/{}", parent.full_path, request.path)
            }
            None => request.path.to_string(),
        };

        let racing = self.state.borrow_mut().racing_creates.remove(&full_path);
        if racing {
            self.add_group(&full_path, request.name);
        }
        self.check_create(&full_path)?;

        let mut group = self.add_group(&full_path, request.name);
        group.description = request.description.map(str::to_string);
        let mut state = self.state.borrow_mut();
        if let Some(stored) = state.groups.iter_mut().find(|g| g.id == group.id) {
            stored.description = group.description.clone();
        }
        state.created.push(full_path);
        Ok(group)
    }

    fn create_project(&self, request: &CreateProjectRequest) -> Result<Project, GitLabError> {
        let namespace = self
            .group_by_id(request.namespace_id)
            .ok_or(GitLabError::Api {
                status: 400,
                message: format!("namespace {} does not exist", request.namespace_id),
            })?;
        let full_path = format!("{}/{}", namespace.full_path, request.path);

        let racing = self.state.borrow_mut().racing_creates.remove(&full_path);
        if racing {
            self.add_project(&full_path, request.name);
        }
        self.check_create(&full_path)?;

        let project = self.add_project(&full_path, request.name);
        self.state.borrow_mut().created.push(full_path);
        Ok(project)
    }
}

// ============== Git Fixtures ==============

/// Bare repository whose HEAD points at `main`.
pub fn init_bare(path: &Path) -> Repository {
    let repo = Repository::init_bare(path).unwrap();
    repo.set_head("refs/heads/main").unwrap();
    repo
}

/// Commit a single file onto `branch` (creating it) without a working tree.
pub fn commit_file(repo: &Repository, branch: &str, file: &str, contents: &str) -> Oid {
    let refname = format!("refs/heads/{branch}");
    let parent = repo
        .find_reference(&refname)
        .ok()
        .and_then(|r| r.peel_to_commit().ok());

    let blob = repo.blob(contents.as_bytes()).unwrap();
    let mut builder = repo
        .treebuilder(parent.as_ref().map(|c| c.tree().unwrap()).as_ref())
        .unwrap();
    builder.insert(file, blob, 0o100644).unwrap();
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();

    let signature = Signature::now("Mirror Test", "mirror@example.com").unwrap();
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(
        Some(&refname),
        &signature,
        &signature,
        &format!("update {file} on {branch}"),
        &tree,
        &parents,
    )
    .unwrap()
}

/// Lightweight tag on the tip of `branch`.
pub fn tag(repo: &Repository, name: &str, branch: &str) {
    let target = repo
        .find_reference(&format!("refs/heads/{branch}"))
        .unwrap()
        .peel(git2::ObjectType::Commit)
        .unwrap();
    repo.tag_lightweight(name, &target, true).unwrap();
}

/// Annotated tag on the tip of `branch`.
pub fn annotated_tag(repo: &Repository, name: &str, branch: &str, message: &str) -> Oid {
    let target = repo
        .find_reference(&format!("refs/heads/{branch}"))
        .unwrap()
        .peel(git2::ObjectType::Commit)
        .unwrap();
    let signature = Signature::now("Mirror Test", "mirror@example.com").unwrap();
    repo.tag(name, &target, &signature, message, true).unwrap()
}

pub fn delete_ref(repo: &Repository, refname: &str) {
    repo.find_reference(refname).unwrap().delete().unwrap();
}

fn ref_names(repo: &Repository, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = repo
        .references()
        .unwrap()
        .filter_map(|r| r.ok())
        .filter_map(|r| r.name().and_then(|n| n.strip_prefix(prefix)).map(str::to_string))
        .collect();
    names.sort();
    names
}

pub fn branch_names(repo: &Repository) -> Vec<String> {
    ref_names(repo, "refs/heads/")
}

pub fn tag_names(repo: &Repository) -> Vec<String> {
    ref_names(repo, "refs/tags/")
}
