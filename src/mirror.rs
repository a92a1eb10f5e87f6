//! Repository content mirroring through a local clone cache.
//!
//! Each project gets an ordinary working copy at `<cache_root>/<full_path>`.
//! The first sync clones it; later syncs fetch into it. Either way every
//! source branch and tag is then force-pushed to the destination and
//! destination refs the source no longer has are deleted.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use git2::{
    AutotagOption,
    Cred,
    CredentialType,
    Direction,
    FetchOptions,
    PushOptions,
    RemoteCallbacks,
    Repository,
    build::{CheckoutBuilder, RepoBuilder},
};

use crate::path;

pub const ORIGIN: &str = "origin";
const REMOTE_PREFIX: &str = "refs/remotes/origin/";
const HEADS_PREFIX: &str = "refs/heads/";
const TAGS_PREFIX: &str = "refs/tags/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// No usable cache entry; cloned from scratch
    Cloned,
    /// Existing cache entry fetched and reused
    Refreshed,
}

/// Access tokens for the two instances
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub source: String,
    pub destination: String,
}

/// One project to mirror: its full path and the two token-free clone URLs.
#[derive(Debug, Clone)]
pub struct MirrorTarget {
    pub path: String,
    pub source_url: String,
    pub destination_url: String,
}

/// Local working copy for one project.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
}

impl CacheEntry {
    pub fn new(cache_root: &Path, full_path: &str) -> Result<Self> {
        path::validate_segments(full_path)?;
        Ok(Self {
            path: cache_root.join(full_path),
        })
    }

    /// The cached repository, if the directory holds a valid one.
    pub fn open(&self) -> Option<Repository> {
        Repository::open(&self.path).ok()
    }
}

/// Bring the destination repository in line with the source.
pub fn sync_repository(
    target: &MirrorTarget,
    cache_root: &Path,
    credentials: &Credentials,
) -> Result<SyncKind> {
    let entry = CacheEntry::new(cache_root, &target.path)?;
    let source_url = with_token(&target.source_url, &credentials.source);
    let destination_url = with_token(&target.destination_url, &credentials.destination);

    let (repo, kind) = match entry.open() {
        Some(repo) => {
            tracing::debug!(
                "found {} in cache at {}; fetching",
                target.path,
                entry.path.display()
            );
            (repo, SyncKind::Refreshed)
        }
        None => {
            tracing::debug!("cloning {} into {}", target.path, entry.path.display());
            let repo = clone_into(
                &target.source_url,
                &source_url,
                &credentials.source,
                &entry.path,
            )?;
            (repo, SyncKind::Cloned)
        }
    };

    // A fresh clone already holds every branch and tag.
    if kind == SyncKind::Refreshed {
        fetch_origin(&repo, &source_url, &credentials.source)
            .with_context(|| format!("fetching {}", target.source_url))?;
        fast_forward_head(&repo).context("fast-forwarding working copy")?;
    }
    push_mirror(&repo, &destination_url, &credentials.destination)
        .with_context(|| format!("pushing to {}", target.destination_url))?;

    Ok(kind)
}

/// Clone into `dest` with every tag, including tags on commits no branch
/// reaches. Only the token-free URL is left in the persisted remote.
fn clone_into(clean_url: &str, url: &str, token: &str, dest: &Path) -> Result<Repository> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating cache directory {}", parent.display()))?;
    }

    let mut fetch_options = FetchOptions::new();
    fetch_options
        .remote_callbacks(remote_callbacks(token))
        .download_tags(AutotagOption::All);
    let repo = RepoBuilder::new()
        .fetch_options(fetch_options)
        .clone(url, dest)
        .with_context(|| format!("cloning {}", clean_url))?;
    repo.remote_set_url(ORIGIN, clean_url)?;
    Ok(repo)
}

/// Fetch all source branches into `refs/remotes/origin/*` and all tags into
/// `refs/tags/*`, dropping local copies of refs the source has deleted.
fn fetch_origin(repo: &Repository, url: &str, token: &str) -> Result<()> {
    let advertised = list_remote_refs(repo, url, token, Direction::Fetch)?;
    let heads: BTreeSet<&str> = advertised
        .iter()
        .filter_map(|name| name.strip_prefix(HEADS_PREFIX))
        .collect();
    let tags: BTreeSet<&str> = advertised
        .iter()
        .filter_map(|name| name.strip_prefix(TAGS_PREFIX))
        .filter(|name| !name.ends_with("^{}"))
        .collect();

    let mut remote = repo.remote_anonymous(url)?;
    let mut fetch_options = FetchOptions::new();
    fetch_options
        .remote_callbacks(remote_callbacks(token))
        .download_tags(AutotagOption::All);
    remote.fetch(
        &[
            "+refs/heads/*:refs/remotes/origin/*",
            "+refs/tags/*:refs/tags/*",
        ],
        Some(&mut fetch_options),
        None,
    )?;

    for name in local_ref_names(repo, REMOTE_PREFIX)? {
        if name != "HEAD" && !heads.contains(name.as_str()) {
            tracing::debug!("pruning stale remote branch {}", name);
            repo.find_reference(&format!("{REMOTE_PREFIX}{name}"))?.delete()?;
        }
    }
    for name in local_ref_names(repo, TAGS_PREFIX)? {
        if !tags.contains(name.as_str()) {
            tracing::debug!("pruning stale tag {}", name);
            repo.find_reference(&format!("{TAGS_PREFIX}{name}"))?.delete()?;
        }
    }
    Ok(())
}

/// Fast-forward the checked-out branch to its remote-tracking ref when possible.
///
/// The push is driven by remote-tracking refs, so a branch that cannot be
/// fast-forwarded is left alone.
fn fast_forward_head(repo: &Repository) -> Result<()> {
    let Ok(head) = repo.head() else {
        return Ok(());
    };
    if !head.is_branch() {
        return Ok(());
    }
    let head_name = head
        .name()
        .ok_or_else(|| anyhow!("HEAD has a non-UTF-8 name"))?
        .to_string();
    let branch = head
        .shorthand()
        .ok_or_else(|| anyhow!("HEAD has no shorthand name"))?
        .to_string();

    let Ok(upstream) = repo.find_reference(&format!("{REMOTE_PREFIX}{branch}")) else {
        tracing::warn!("branch '{}' no longer exists on the source", branch);
        return Ok(());
    };
    let annotated = repo.reference_to_annotated_commit(&upstream)?;
    let (analysis, _) = repo.merge_analysis(&[&annotated])?;

    if analysis.is_up_to_date() {
        return Ok(());
    }
    if !analysis.is_fast_forward() {
        tracing::warn!(
            "local branch '{}' has diverged from the source; leaving it as is",
            branch
        );
        return Ok(());
    }

    repo.find_reference(&head_name)?
        .set_target(annotated.id(), "glmirror: fast-forward")?;
    repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
    tracing::debug!("fast-forwarded '{}' to {}", branch, annotated.id());
    Ok(())
}

/// Force-push every source branch and tag, and delete destination refs
/// that the source does not have.
fn push_mirror(repo: &Repository, url: &str, token: &str) -> Result<()> {
    let refspecs = mirror_refspecs(
        &local_ref_names(repo, REMOTE_PREFIX)?,
        &local_ref_names(repo, TAGS_PREFIX)?,
        &list_remote_refs(repo, url, token, Direction::Push)?,
    );
    if refspecs.is_empty() {
        tracing::debug!("source repository is empty; nothing to push");
        return Ok(());
    }
    tracing::debug!("pushing {} refspec(s)", refspecs.len());

    let mut rejected = Vec::new();
    {
        let mut callbacks = remote_callbacks(token);
        callbacks.push_update_reference(|refname, status| {
            if let Some(message) = status {
                rejected.push(format!("{refname}: {message}"));
            }
            Ok(())
        });
        let mut push_options = PushOptions::new();
        push_options.remote_callbacks(callbacks);

        let mut remote = repo.remote_anonymous(url)?;
        remote.push(&refspecs, Some(&mut push_options))?;
    }

    if !rejected.is_empty() {
        bail!("destination rejected {}", rejected.join(", "));
    }
    Ok(())
}

/// Refspecs that make the destination's branches and tags equal the source's.
pub(crate) fn mirror_refspecs(
    source_branches: &[String],
    source_tags: &[String],
    destination_refs: &[String],
) -> Vec<String> {
    let branches: BTreeSet<&str> = source_branches
        .iter()
        .map(String::as_str)
        .filter(|name| *name != "HEAD")
        .collect();
    let tags: BTreeSet<&str> = source_tags.iter().map(String::as_str).collect();

    let mut refspecs: Vec<String> = branches
        .iter()
        .map(|b| format!("+{REMOTE_PREFIX}{b}:{HEADS_PREFIX}{b}"))
        .chain(tags.iter().map(|t| format!("+{TAGS_PREFIX}{t}:{TAGS_PREFIX}{t}")))
        .collect();

    let stale: BTreeSet<&str> = destination_refs
        .iter()
        .map(String::as_str)
        .filter(|name| !name.ends_with("^{}"))
        .filter(|name| match name.strip_prefix(HEADS_PREFIX) {
            Some(branch) => !branches.contains(branch),
            None => match name.strip_prefix(TAGS_PREFIX) {
                Some(tag) => !tags.contains(tag),
                None => false,
            },
        })
        .collect();
    refspecs.extend(stale.into_iter().map(|name| format!(":{name}")));
    refspecs
}

/// Short names of local refs under `prefix`.
fn local_ref_names(repo: &Repository, prefix: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for reference in repo.references()? {
        let reference = reference?;
        if let Some(name) = reference.name().and_then(|n| n.strip_prefix(prefix)) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Full ref names advertised by the repository at `url`.
fn list_remote_refs(
    repo: &Repository,
    url: &str,
    token: &str,
    direction: Direction,
) -> Result<Vec<String>> {
    let mut remote = repo.remote_anonymous(url)?;
    let connection = remote.connect_auth(direction, Some(remote_callbacks(token)), None)?;
    let names = connection
        .list()?
        .iter()
        .map(|head| head.name().to_string())
        .collect();
    Ok(names)
}

/// Answer one credential prompt with the token, then give up so a rejected
/// token cannot loop forever.
fn remote_callbacks(token: &str) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0;
    callbacks.credentials(move |_url, _username, allowed| {
        attempts += 1;
        if attempts > 1 || token.is_empty() {
            return Err(git2::Error::from_str("authentication failed"));
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            Cred::userpass_plaintext("oauth2", token)
        } else {
            Cred::default()
        }
    });
    callbacks
}

/// Embed `token` as the userinfo of an HTTP(S) URL. Other URLs (local paths,
/// `file://`, ssh) are returned unchanged.
pub fn with_token(url: &str, token: &str) -> String {
    if token.is_empty() {
        return url.to_string();
    }
    for scheme in ["https://", "http://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            let host_end = rest.find('/').unwrap_or(rest.len());
            let rest = match rest[..host_end].rfind('@') {
                Some(at) => &rest[at + 1..],
                None => rest,
            };
            return format!("{scheme}oauth2:{token}@{rest}");
        }
    }
    url.to_string()
}
