use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use octocrab::Octocrab;

use crate::github::auth;

/// How the client obtains its token.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// Resolve from the environment and the gh CLI on first use.
    Discover { env_var: Option<String> },
    /// A fixed token (tests, scripted runs).
    Static(String),
}

/// Lazily-built Octocrab instance for one host.
///
/// The instance is built on first use and dropped by [`GitHubClient::invalidate`]
/// so the next call picks up rotated credentials.
pub struct GitHubClient {
    host: String,
    api_url: Option<String>,
    token: TokenSource,
    instance: RwLock<Option<Arc<Octocrab>>>,
}

impl GitHubClient {
    pub fn new(host: impl Into<String>, token: TokenSource) -> Self {
        Self {
            host: host.into(),
            api_url: None,
            token,
            instance: RwLock::new(None),
        }
    }

    /// Override the API base URL (GitHub Enterprise or a mock server).
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    /// Get or build the Octocrab instance.
    pub fn octocrab(&self) -> Result<Arc<Octocrab>> {
        if let Some(instance) = self
            .instance
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(Arc::clone(instance));
        }

        let token = match &self.token {
            TokenSource::Static(token) => token.clone(),
            TokenSource::Discover { env_var } => {
                let (token, origin) = auth::resolve_token(&self.host, env_var.as_deref())?;
                tracing::debug!("github: token for {} from {origin:?}", self.host);
                token
            }
        };

        let base_uri = match &self.api_url {
            Some(url) => Some(url.clone()),
            None if self.host == "github.com" => None,
            None => Some(format!("https://{}/api/v3", self.host)),
        };
        let mut builder = Octocrab::builder().personal_token(token);
        if let Some(uri) = base_uri {
            builder = builder.base_uri(uri).context("setting API base URI")?;
        }

        let instance = Arc::new(builder.build().context("building octocrab instance")?);
        let lock = &self.instance;
        *lock.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&instance));
        Ok(instance)
    }

    /// Drop the cached instance; the next call re-resolves the token.
    pub fn invalidate(&self) {
        self.instance
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::debug!("github: credentials for {} invalidated", self.host);
    }
}
