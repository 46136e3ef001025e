//! User-facing descriptions of remote failures.
//!
//! GitHub signals trouble through:
//! - HTTP 401 for a missing or revoked token
//! - HTTP 403 with "API rate limit exceeded" in the body
//! - HTTP 429 or "secondary rate limit" for abuse throttling

use http::StatusCode;

/// HTTP status of the GitHub error somewhere in the chain, if any.
fn status_of(error: &anyhow::Error) -> Option<StatusCode> {
    error
        .chain()
        .find_map(|cause| match cause.downcast_ref::<octocrab::Error>() {
            Some(octocrab::Error::GitHub { source, .. }) => Some(source.status_code),
            _ => None,
        })
}

/// Check whether an error message indicates a GitHub rate limit.
pub(crate) fn is_rate_limited(error: &anyhow::Error) -> bool {
    if status_of(error) == Some(StatusCode::TOO_MANY_REQUESTS) {
        return true;
    }
    let msg = format!("{error:#}").to_lowercase();
    msg.contains("rate limit") || msg.contains("status code: 429")
}

/// Check whether the remote rejected our credentials.
pub(crate) fn is_auth_failure(error: &anyhow::Error) -> bool {
    if status_of(error) == Some(StatusCode::UNAUTHORIZED) {
        return true;
    }
    let msg = format!("{error:#}").to_lowercase();
    msg.contains("bad credentials")
        || msg.contains("requires authentication")
        || msg.contains("status code: 401")
        || msg.contains("no github token found")
}

/// One-line description of a remote failure for display.
pub fn describe(error: &anyhow::Error) -> String {
    if is_rate_limited(error) {
        let msg = format!("{error:#}").to_lowercase();
        if msg.contains("secondary rate limit") {
            return "secondary rate limit hit, wait a moment then retry".to_owned();
        }
        return "API rate limit exceeded, retry later".to_owned();
    }
    if is_auth_failure(error) {
        return format!("authentication failed ({error:#}); check your GitHub token");
    }
    format!("{error:#}")
}
