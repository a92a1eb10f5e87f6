//! Token resolution and the optional XDG config file.

use std::{collections::HashMap, fs, path::PathBuf};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::gitlab::{GitLabError, host_of};

/// Which side of the mirror a token is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    fn env_var(self) -> &'static str {
        match self {
            Self::Source => "GLMIRROR_SRC_TOKEN",
            Self::Destination => "GLMIRROR_DEST_TOKEN",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Destination => write!(f, "destination"),
        }
    }
}

/// Config file structure
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    pub default_token: Option<String>,
    /// Host name => token
    pub hosts: Option<HashMap<String, String>>,
}

impl ConfigFile {
    fn token_for(&self, host: &str) -> Option<&str> {
        if let Some(hosts) = &self.hosts
            && let Some(token) = hosts.get(host)
        {
            return Some(token);
        }
        self.default_token.as_deref()
    }
}

/// Find the token for one instance.
///
/// Order: explicit flag, side-specific env var, `GITLAB_TOKEN`, then the
/// config file (host-specific entry before `default_token`).
pub fn find_token(
    side: Side,
    base_url: &str,
    explicit: Option<&str>,
    config_file: Option<&ConfigFile>,
) -> Result<String, GitLabError> {
    let host = host_of(base_url);

    if let Some(token) = explicit
        && !token.is_empty()
    {
        tracing::debug!("Using {} token from command line", side);
        return Ok(token.to_string());
    }

    if let Ok(token) = std::env::var(side.env_var())
        && !token.is_empty()
    {
        tracing::debug!("Using {} token from {} env var", side, side.env_var());
        return Ok(token);
    }

    if let Ok(token) = std::env::var("GITLAB_TOKEN")
        && !token.is_empty()
    {
        tracing::debug!("Using {} token from GITLAB_TOKEN env var", side);
        return Ok(token);
    }

    if let Some(token) = config_file.and_then(|c| c.token_for(host)) {
        tracing::debug!("Using {} token from config file", side);
        return Ok(token.to_string());
    }

    Err(GitLabError::NoToken {
        host: host.to_string(),
    })
}

/// Load the config file, if there is one. A malformed file is an error.
pub fn load_config_file() -> Result<Option<ConfigFile>> {
    let config_path = get_config_path()?;
    let contents = match fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(error) => {
            tracing::debug!(
                "No config file at {}: {}",
                config_path.display(),
                error
            );
            return Ok(None);
        }
    };
    let config = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow!("Failed to parse {}: {}", config_path.display(), e))?;
    Ok(Some(config))
}

fn get_config_path() -> Result<PathBuf> {
    let base_dirs = xdg::BaseDirectories::with_prefix(env!("CARGO_PKG_NAME"));
    base_dirs
        .get_config_file("config.yaml")
        .ok_or_else(|| anyhow!("Failed to determine config file path"))
}
