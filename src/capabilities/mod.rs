//! Capability contracts - thin interfaces over external systems
//!
//! Each external system sits behind a small trait with a live HTTP
//! implementation and an in-memory stub. Selection happens once at startup
//! based on credential presence: no token means the stub, never a crash.

pub mod issues;
pub mod secrets;
pub mod worker_api;

pub use issues::{Issue, IssueComment, IssueTracker, NewIssue};
pub use secrets::SecretStore;
pub use worker_api::{ApiSprite, ExecResult, ExecStreamItem, WorkerApi, WorkerApiError};

use std::sync::Arc;
use tracing::info;

/// Name of the secret holding the worker-API token.
pub const WORKER_API_TOKEN: &str = "LATTICE_WORKER_API_TOKEN";

/// Name of the secret holding the governance (GitHub) token.
pub const GOVERNANCE_TOKEN: &str = "LATTICE_GITHUB_TOKEN";

/// Pick the worker-API implementation: live when a token is present, stub
/// otherwise.
pub fn select_worker_api(secrets: &dyn SecretStore) -> Arc<dyn WorkerApi> {
    match secrets.get_secret(WORKER_API_TOKEN) {
        Some(token) => {
            let config = &crate::config::get().worker_api;
            info!(base_url = %config.base_url, "Worker API: live HTTP client");
            Arc::new(worker_api::HttpWorkerApi::new(&config.base_url, &token, config.timeout_ms))
        }
        None => {
            info!("Worker API: no token present — using stub");
            Arc::new(worker_api::StubWorkerApi::new())
        }
    }
}

/// Pick the issue-tracker implementation: live GitHub client when a token
/// and repo are configured, stub otherwise.
pub fn select_issue_tracker(secrets: &dyn SecretStore) -> Arc<dyn IssueTracker> {
    let repo = crate::config::get().governance.repo.clone();
    match (secrets.get_secret(GOVERNANCE_TOKEN), repo) {
        (Some(token), Some(repo)) => {
            info!(repo = %repo, "Issue tracker: live GitHub client");
            Arc::new(issues::GithubIssues::new(&repo, &token))
        }
        _ => {
            info!("Issue tracker: no token or repo configured — using stub");
            Arc::new(issues::StubIssueTracker::new())
        }
    }
}
