//! GitLab REST v4 client.
//!
//! Only the handful of endpoints needed to walk a group hierarchy and to
//! create groups and projects are covered. Everything the reconciler needs
//! goes through the [`HostingApi`] trait so it can run against the real
//! client, the dry-run overlay, or an in-memory fake.

use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

const PER_PAGE: usize = 100;
const USER_AGENT: &str = "glmirror";

// ============== Configuration Types ==============

/// Connection settings for one GitLab instance
#[derive(Debug, Clone)]
pub struct GitLabConfig {
    /// Instance root, e.g. `https://gitlab.example.com`
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
}

// ============== API Response Types ==============

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Group {
    pub id: u64,
    pub name: String,
    /// Slug (last path segment)
    pub path: String,
    pub full_path: String,
    #[serde(default)]
    pub parent_id: Option<u64>,
    #[serde(default)]
    pub web_url: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Namespace {
    pub id: u64,
    pub full_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: u64,
    pub name: String,
    pub path: String,
    pub path_with_namespace: String,
    #[serde(default)]
    pub http_url_to_repo: String,
    #[serde(default)]
    pub web_url: String,
    pub namespace: Namespace,
}

/// Group creation request
#[derive(Debug, Serialize)]
pub struct CreateGroupRequest<'a> {
    pub name: &'a str,
    pub path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'a str>,
}

/// Project creation request
#[derive(Debug, Serialize)]
pub struct CreateProjectRequest<'a> {
    pub name: &'a str,
    pub path: &'a str,
    pub namespace_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'a str>,
}

// ============== Error Types ==============

#[derive(Debug)]
pub enum GitLabError {
    /// No token configured for this host
    NoToken { host: String },
    /// Token is invalid or expired
    Unauthorized,
    /// The requested group or project does not exist
    NotFound,
    /// A group or project with this path already exists
    AlreadyExists { message: String },
    /// Any other non-success response
    Api { status: u16, message: String },
    /// Network/HTTP error
    Network(String),
    /// Response body did not have the expected shape
    Decode(String),
}

impl std::fmt::Display for GitLabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoToken { host } => write!(f, "No GitLab token configured for {}", host),
            Self::Unauthorized => write!(f, "GitLab token is invalid or expired"),
            Self::NotFound => write!(f, "Not found"),
            Self::AlreadyExists { message } => write!(f, "Already exists: {}", message),
            Self::Api { status, message } => {
                write!(f, "GitLab API error ({}): {}", status, message)
            }
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::Decode(msg) => write!(f, "Unexpected response: {}", msg),
        }
    }
}

impl std::error::Error for GitLabError {}

// ============== Hosting API ==============

/// Operations the mirror consumes from a hosting instance.
pub trait HostingApi {
    /// Authenticated user; fails with [`GitLabError::Unauthorized`] on a bad token.
    fn current_user(&self) -> Result<User, GitLabError>;

    /// Group by numeric id or full path.
    fn group(&self, id_or_path: &str) -> Result<Group, GitLabError>;

    /// All groups below `group_id`, at every level.
    fn descendant_groups(&self, group_id: u64) -> Result<Vec<Group>, GitLabError>;

    /// All projects below `group_id`, including those in subgroups.
    fn group_projects(&self, group_id: u64) -> Result<Vec<Project>, GitLabError>;

    /// Project by full path.
    fn project(&self, full_path: &str) -> Result<Project, GitLabError>;

    fn create_group(&self, request: &CreateGroupRequest) -> Result<Group, GitLabError>;

    fn create_project(&self, request: &CreateProjectRequest) -> Result<Project, GitLabError>;
}

// ============== Client ==============

/// GitLab API client
pub struct GitLabClient {
    config: GitLabConfig,
    api_base: String,
    agent: ureq::Agent,
}

impl GitLabClient {
    pub fn new(config: GitLabConfig) -> Self {
        let api_base = format!("{}/api/v4", config.base_url.trim_end_matches('/'));
        // Status codes are mapped by hand so error bodies stay readable.
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(config.timeout))
            .build()
            .into();
        Self {
            config,
            api_base,
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GitLabError> {
        tracing::trace!("GET {}", url);
        let response = self
            .agent
            .get(url)
            .header("PRIVATE-TOKEN", &self.config.token)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .call()
            .map_err(handle_ureq_error)?;
        read_response(response)
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, GitLabError> {
        tracing::trace!("POST {}", url);
        let response = self
            .agent
            .post(url)
            .header("PRIVATE-TOKEN", &self.config.token)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .send_json(body)
            .map_err(handle_ureq_error)?;
        read_response(response)
    }

    /// Walk a paginated list endpoint until a short page comes back.
    fn get_all<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>, GitLabError> {
        let separator = if url.contains('?') { '&' } else { '?' };
        let mut all = Vec::new();
        let mut page = 1;

        loop {
            let page_url = format!("{url}{separator}per_page={PER_PAGE}&page={page}");
            let items: Vec<T> = self.get_json(&page_url)?;
            let count = items.len();
            all.extend(items);

            if count < PER_PAGE {
                break;
            }
            page += 1;
        }

        Ok(all)
    }
}

impl HostingApi for GitLabClient {
    fn current_user(&self) -> Result<User, GitLabError> {
        self.get_json(&format!("{}/user", self.api_base))
    }

    fn group(&self, id_or_path: &str) -> Result<Group, GitLabError> {
        self.get_json(&format!("{}/groups/{}", self.api_base, encode_id(id_or_path)))
    }

    fn descendant_groups(&self, group_id: u64) -> Result<Vec<Group>, GitLabError> {
        self.get_all(&format!(
            "{}/groups/{}/descendant_groups?all_available=true",
            self.api_base, group_id
        ))
    }

    fn group_projects(&self, group_id: u64) -> Result<Vec<Project>, GitLabError> {
        self.get_all(&format!(
            "{}/groups/{}/projects?include_subgroups=true",
            self.api_base, group_id
        ))
    }

    fn project(&self, full_path: &str) -> Result<Project, GitLabError> {
        self.get_json(&format!(
            "{}/projects/{}",
            self.api_base,
            encode_id(full_path)
        ))
    }

    fn create_group(&self, request: &CreateGroupRequest) -> Result<Group, GitLabError> {
        self.post_json(&format!("{}/groups", self.api_base), request)
    }

    fn create_project(&self, request: &CreateProjectRequest) -> Result<Project, GitLabError> {
        self.post_json(&format!("{}/projects", self.api_base), request)
    }
}

// ============== Helper Functions ==============

fn read_response<T: DeserializeOwned>(
    mut response: ureq::http::Response<ureq::Body>,
) -> Result<T, GitLabError> {
    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        return response
            .body_mut()
            .read_json()
            .map_err(|e| GitLabError::Decode(e.to_string()));
    }
    let body = response.body_mut().read_to_string().unwrap_or_default();
    Err(error_for_status(status, &body))
}

fn handle_ureq_error(error: ureq::Error) -> GitLabError {
    match error {
        ureq::Error::StatusCode(status) => error_for_status(status, ""),
        other => GitLabError::Network(other.to_string()),
    }
}

/// Classify a non-success response.
///
/// GitLab reports a duplicate group/project path either as 409 or as a 400
/// validation error whose message says the path "has already been taken".
pub(crate) fn error_for_status(status: u16, body: &str) -> GitLabError {
    let message = error_message(body);
    match status {
        401 => GitLabError::Unauthorized,
        404 => GitLabError::NotFound,
        409 => GitLabError::AlreadyExists { message },
        400 if message.contains("has already been taken") => {
            GitLabError::AlreadyExists { message }
        }
        _ => GitLabError::Api { status, message },
    }
}

/// Pull the human-readable part out of a GitLab error body.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };
    match value.get("message").or_else(|| value.get("error")) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => body.trim().to_string(),
    }
}

/// Numeric ids pass through; paths are percent-encoded into a single segment.
pub(crate) fn encode_id(id_or_path: &str) -> String {
    if !id_or_path.is_empty() && id_or_path.bytes().all(|b| b.is_ascii_digit()) {
        return id_or_path.to_string();
    }
    let mut out = String::with_capacity(id_or_path.len() + 8);
    for b in id_or_path.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Instance host (`gitlab.example.com`) from a base URL, for config lookups.
pub fn host_of(base_url: &str) -> &str {
    let without_scheme = base_url
        .strip_prefix("https://")
        .or_else(|| base_url.strip_prefix("http://"))
        .unwrap_or(base_url);
    without_scheme
        .split(['/', ':'])
        .next()
        .unwrap_or(without_scheme)
}
