//! Helpers for `/`-delimited group and project paths (`a/b/c`).

use anyhow::{Result, bail};

/// GitLab refuses to nest groups deeper than this.
pub const MAX_GROUP_DEPTH: usize = 20;

/// Everything but the last segment. `"a/b/c"` => `"a/b"`, `"a"` => `""`.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    }
}

/// The last segment, which is also the entity's slug.
pub fn leaf(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

pub fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split('/').count()
    }
}

/// All non-empty prefixes of `path`, shallowest first, ending with `path` itself.
/// `"a/b/c"` => `["a", "a/b", "a/b/c"]`.
pub fn prefixes(path: &str) -> Vec<&str> {
    if path.is_empty() {
        return Vec::new();
    }
    let mut out: Vec<&str> = path
        .match_indices('/')
        .map(|(pos, _)| &path[..pos])
        .collect();
    out.push(path);
    out
}

/// Reject empty, `.` and `..` segments.
pub fn validate_segments(path: &str) -> Result<()> {
    for segment in path.split('/') {
        if segment.is_empty() {
            bail!("malformed path '{}': empty segment", path);
        }
        if segment == "." || segment == ".." {
            bail!("malformed path '{}': relative segment '{}'", path, segment);
        }
    }
    Ok(())
}

/// Like [`validate_segments`], and also reject more levels than a group may have.
pub fn validate(path: &str) -> Result<()> {
    validate_segments(path)?;
    if depth(path) > MAX_GROUP_DEPTH {
        bail!(
            "path '{}' is nested {} levels deep (limit {})",
            path,
            depth(path),
            MAX_GROUP_DEPTH
        );
    }
    Ok(())
}
