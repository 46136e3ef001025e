use std::sync::Arc;

use crate::config::types::AppConfig;
use crate::git::{Ensurer, LocalRepo};
use crate::github::RemoteApi;
use crate::types::PrStateFilter;

/// Everything the engine talks to, injected by the host at construction.
pub struct EngineContext {
    pub remote: Arc<dyn RemoteApi>,
    pub repo: Arc<dyn LocalRepo>,
    pub settings: EngineSettings,
}

impl EngineContext {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        repo: Arc<dyn LocalRepo>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            remote,
            repo,
            settings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Remote that PR and base refs are fetched from.
    pub remote_name: String,
    /// Host used to build fork clone URLs.
    pub host: String,
    /// Upper bound on concurrent blocking git workers.
    pub workers: usize,
    /// State used when a credential change forces a refresh before any was requested.
    pub default_state: PrStateFilter,
    pub content_cache_capacity: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            remote_name: "origin".to_owned(),
            host: "github.com".to_owned(),
            workers: 4,
            default_state: PrStateFilter::Open,
            content_cache_capacity: 2_000,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            remote_name: config.repo.remote.clone(),
            host: config.github.host.clone(),
            workers: config.engine.workers.max(1),
            default_state: config.engine.default_state,
            content_cache_capacity: config.engine.content_cache_capacity,
        }
    }
}

/// The handles a background task needs, cloned out of the context.
#[derive(Clone)]
pub(crate) struct TaskEnv {
    pub remote: Arc<dyn RemoteApi>,
    pub repo: Arc<dyn LocalRepo>,
    pub ensurer: Arc<Ensurer>,
    pub remote_name: String,
    pub host: String,
}
