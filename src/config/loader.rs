use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::types::AppConfig;

const LOCAL_FILE: &str = ".prsync.toml";
const ENV_VAR: &str = "PRSYNC_CONFIG";

/// Discover and load the app config.
///
/// Priority:
/// 1. `--config` flag (explicit path)
/// 2. `.prsync.toml` at the root of the Git repository containing `start`
/// 3. `$PRSYNC_CONFIG` environment variable
/// 4. `$XDG_CONFIG_HOME/prsync/config.toml`
/// 5. `~/.config/prsync/config.toml`
///
/// If both a global and a repo-local config exist, keys set in a local
/// section override the same keys of the global section; keys the local
/// file leaves out keep their global value.
pub fn load_config(explicit_path: Option<&Path>, start: &Path) -> Result<AppConfig> {
    if let Some(path) = explicit_path {
        return parse(read_table(path)?, path);
    }

    let global_path = find_global_config();
    let local_path = find_repo_local_config(start);

    match (global_path, local_path) {
        (Some(global), Some(local)) => {
            let merged = merge_tables(read_table(&global)?, read_table(&local)?);
            parse(merged, &local)
        }
        (Some(path), None) | (None, Some(path)) => parse(read_table(&path)?, &path),
        (None, None) => Ok(AppConfig::default()),
    }
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parsing TOML from {}", path.display()))
}

fn parse(table: toml::Table, origin: &Path) -> Result<AppConfig> {
    toml::Value::Table(table)
        .try_into()
        .with_context(|| format!("invalid configuration in {}", origin.display()))
}

/// Overlay `local` onto `global`, one section at a time.
pub fn merge_tables(mut global: toml::Table, local: toml::Table) -> toml::Table {
    for (key, value) in local {
        match value {
            toml::Value::Table(overlay) => match global.get_mut(&key) {
                Some(toml::Value::Table(base)) => base.extend(overlay),
                _ => {
                    global.insert(key, toml::Value::Table(overlay));
                }
            },
            other => {
                global.insert(key, other);
            }
        }
    }
    global
}

/// Walk up from `start` looking for `.prsync.toml`, stopping at the Git root.
pub fn find_repo_local_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(LOCAL_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        if dir.join(".git").exists() {
            return None;
        }
        if !dir.pop() {
            return None;
        }
    }
}

fn find_global_config() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(ENV_VAR) {
        let p = PathBuf::from(&path);
        if p.is_file() {
            return Some(p);
        }
    }

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let p = PathBuf::from(xdg).join("prsync/config.toml");
        if p.is_file() {
            return Some(p);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let p = PathBuf::from(home).join(".config/prsync/config.toml");
        if p.is_file() {
            return Some(p);
        }
    }

    None
}
