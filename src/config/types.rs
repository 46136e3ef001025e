use std::path::PathBuf;

use serde::Deserialize;

use crate::types::PrStateFilter;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub github: GitHubConfig,
    pub repo: RepoConfig,
    pub engine: EngineConfig,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub host: String,
    /// Repository owner. Detected from the remote URL when unset.
    pub owner: Option<String>,
    /// Repository name. Detected from the remote URL when unset.
    pub repo: Option<String>,
    /// Environment variable consulted first for the API token.
    pub token_env: Option<String>,
    /// Full API base URL, for GitHub Enterprise installs with a non-standard path.
    pub api_url: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            host: "github.com".to_owned(),
            owner: None,
            repo: None,
            token_env: None,
            api_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Local clone. Defaults to the current directory.
    pub path: Option<PathBuf>,
    pub remote: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: None,
            remote: "origin".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,
    pub default_state: PrStateFilter,
    pub content_cache_capacity: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_state: PrStateFilter::Open,
            content_cache_capacity: 2_000,
        }
    }
}
