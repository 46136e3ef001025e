use std::process::Command;

use anyhow::{Context, Result, bail};

/// Where a resolved token came from. Logged, never the token itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOrigin {
    ConfiguredEnv(String),
    GhCli,
    GhTokenEnv,
    GithubTokenEnv,
}

/// Resolve a GitHub auth token for the given host.
///
/// Priority:
/// 1. the environment variable named by `github.token_env`, if configured
/// 2. `gh auth token --hostname {host}` (gh CLI)
/// 3. `GH_TOKEN` environment variable
/// 4. `GITHUB_TOKEN` environment variable
pub fn resolve_token(host: &str, configured_env: Option<&str>) -> Result<(String, TokenOrigin)> {
    if let Some(var) = configured_env
        && let Some(token) = non_empty_env(var)
    {
        return Ok((token, TokenOrigin::ConfiguredEnv(var.to_owned())));
    }

    if let Ok(token) = token_from_gh_cli(host) {
        return Ok((token, TokenOrigin::GhCli));
    }

    if let Some(token) = non_empty_env("GH_TOKEN") {
        return Ok((token, TokenOrigin::GhTokenEnv));
    }
    if let Some(token) = non_empty_env("GITHUB_TOKEN") {
        return Ok((token, TokenOrigin::GithubTokenEnv));
    }

    bail!(
        "no GitHub token found for host \"{host}\". \
         Run `gh auth login` or set GH_TOKEN / GITHUB_TOKEN."
    )
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|t| !t.trim().is_empty())
}

fn token_from_gh_cli(host: &str) -> Result<String> {
    let output = Command::new("gh")
        .args(["auth", "token", "--hostname", host])
        .output()
        .context("failed to run `gh auth token`")?;

    if !output.status.success() {
        bail!("gh auth token exited with non-zero status");
    }

    let token = String::from_utf8(output.stdout)
        .context("gh auth token produced non-UTF-8 output")?
        .trim()
        .to_owned();

    if token.is_empty() {
        bail!("gh auth token returned empty string");
    }

    Ok(token)
}
