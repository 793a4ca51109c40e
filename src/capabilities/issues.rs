//! Governance-issue capability - GitHub-like issue tracker client
//!
//! The governance bridge mirrors awaiting intents to issues and reads
//! label changes back as approvals. The live client speaks the GitHub REST
//! surface; the stub keeps issues in memory with the same label/comment
//! semantics.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};

/// Issue tracker errors
#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("issue not found: #{0}")]
    NotFound(u64),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {0}")]
    Server(reqwest::StatusCode),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A comment on an issue.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueComment {
    pub author: String,
    pub body: String,
    pub created_at: String,
}

/// An issue as the tracker reports it.
#[derive(Debug, Clone)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    /// `open` or `closed`
    pub state: String,
    pub labels: Vec<String>,
    pub comments: Vec<IssueComment>,
}

/// Options for creating an issue.
#[derive(Debug, Clone, Default)]
pub struct NewIssue {
    pub body: String,
    pub labels: Vec<String>,
}

/// The issue-tracker surface the governance bridge consumes.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_issue(&self, title: &str, opts: NewIssue) -> Result<Issue, IssueError>;
    async fn get_issue(&self, number: u64) -> Result<Issue, IssueError>;
    /// Update mutable issue fields; currently only `state`.
    async fn update_issue(&self, number: u64, state: Option<&str>) -> Result<(), IssueError>;
    async fn add_label(&self, number: u64, label: &str) -> Result<(), IssueError>;
    async fn remove_label(&self, number: u64, label: &str) -> Result<(), IssueError>;
    async fn create_comment(&self, number: u64, body: &str) -> Result<(), IssueError>;
    async fn list_issues(&self, labels: Option<&[String]>) -> Result<Vec<Issue>, IssueError>;
}

// ============================================================================
// Live GitHub client
// ============================================================================

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    user: GhUser,
    body: Option<String>,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    labels: Vec<GhLabel>,
}

impl GhIssue {
    fn into_issue(self, comments: Vec<IssueComment>) -> Issue {
        Issue {
            number: self.number,
            title: self.title,
            body: self.body.unwrap_or_default(),
            state: self.state,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            comments,
        }
    }
}

/// Live GitHub REST client scoped to one repository.
#[derive(Clone)]
pub struct GithubIssues {
    http: reqwest::Client,
    repo: String,
    token: String,
}

impl GithubIssues {
    pub fn new(repo: &str, token: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("lattice")
            .build()
            .unwrap_or_default();
        Self { http, repo: repo.to_string(), token: token.to_string() }
    }

    fn url(&self, path: &str) -> String {
        format!("https://api.github.com/repos/{}{}", self.repo, path)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
    }

    async fn check(
        resp: reqwest::Response,
        number: u64,
    ) -> Result<reqwest::Response, IssueError> {
        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => Err(IssueError::NotFound(number)),
            status if status.is_success() => Ok(resp),
            status => Err(IssueError::Server(status)),
        }
    }

    async fn fetch_comments(&self, number: u64) -> Result<Vec<IssueComment>, IssueError> {
        let resp = self
            .authed(self.http.get(self.url(&format!("/issues/{number}/comments"))))
            .send()
            .await?;
        let resp = Self::check(resp, number).await?;
        let body = resp.bytes().await?;
        let raw: Vec<GhComment> = serde_json::from_slice(&body)?;
        Ok(raw
            .into_iter()
            .map(|c| IssueComment {
                author: c.user.login,
                body: c.body.unwrap_or_default(),
                created_at: c.created_at,
            })
            .collect())
    }
}

#[async_trait]
impl IssueTracker for GithubIssues {
    async fn create_issue(&self, title: &str, opts: NewIssue) -> Result<Issue, IssueError> {
        let resp = self
            .authed(self.http.post(self.url("/issues")))
            .json(&json!({"title": title, "body": opts.body, "labels": opts.labels}))
            .send()
            .await?;
        let resp = Self::check(resp, 0).await?;
        let body = resp.bytes().await?;
        let raw: GhIssue = serde_json::from_slice(&body)?;
        Ok(raw.into_issue(Vec::new()))
    }

    async fn get_issue(&self, number: u64) -> Result<Issue, IssueError> {
        let resp = self
            .authed(self.http.get(self.url(&format!("/issues/{number}"))))
            .send()
            .await?;
        let resp = Self::check(resp, number).await?;
        let body = resp.bytes().await?;
        let raw: GhIssue = serde_json::from_slice(&body)?;
        let comments = self.fetch_comments(number).await?;
        Ok(raw.into_issue(comments))
    }

    async fn update_issue(&self, number: u64, state: Option<&str>) -> Result<(), IssueError> {
        let mut patch = serde_json::Map::new();
        if let Some(state) = state {
            patch.insert("state".to_string(), json!(state));
        }
        let resp = self
            .authed(self.http.patch(self.url(&format!("/issues/{number}"))))
            .json(&patch)
            .send()
            .await?;
        Self::check(resp, number).await.map(|_| ())
    }

    async fn add_label(&self, number: u64, label: &str) -> Result<(), IssueError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/issues/{number}/labels"))))
            .json(&json!({"labels": [label]}))
            .send()
            .await?;
        Self::check(resp, number).await.map(|_| ())
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<(), IssueError> {
        let resp = self
            .authed(
                self.http
                    .delete(self.url(&format!("/issues/{number}/labels/{label}"))),
            )
            .send()
            .await?;
        // GitHub 404s when the label is already gone; that is a no-op here.
        match Self::check(resp, number).await {
            Ok(_) | Err(IssueError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_comment(&self, number: u64, body: &str) -> Result<(), IssueError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/issues/{number}/comments"))))
            .json(&json!({"body": body}))
            .send()
            .await?;
        Self::check(resp, number).await.map(|_| ())
    }

    async fn list_issues(&self, labels: Option<&[String]>) -> Result<Vec<Issue>, IssueError> {
        let mut req = self.authed(self.http.get(self.url("/issues")));
        if let Some(labels) = labels {
            req = req.query(&[("labels", labels.join(","))]);
        }
        let resp = req.send().await?;
        let resp = Self::check(resp, 0).await?;
        let body = resp.bytes().await?;
        let raw: Vec<GhIssue> = serde_json::from_slice(&body)?;
        Ok(raw.into_iter().map(|i| i.into_issue(Vec::new())).collect())
    }
}

// ============================================================================
// Stub
// ============================================================================

/// In-memory issue tracker with GitHub-shaped semantics. Tests flip labels
/// on it the way a human would in the GitHub UI.
#[derive(Default)]
pub struct StubIssueTracker {
    issues: DashMap<u64, Issue>,
    next_number: AtomicU64,
}

impl StubIssueTracker {
    pub fn new() -> Self {
        Self { issues: DashMap::new(), next_number: AtomicU64::new(1) }
    }

    /// Test hook: append a comment as a human author.
    pub fn add_human_comment(&self, number: u64, author: &str, body: &str) {
        if let Some(mut issue) = self.issues.get_mut(&number) {
            issue.comments.push(IssueComment {
                author: author.to_string(),
                body: body.to_string(),
                created_at: chrono::Utc::now().to_rfc3339(),
            });
        }
    }

    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }
}

#[async_trait]
impl IssueTracker for StubIssueTracker {
    async fn create_issue(&self, title: &str, opts: NewIssue) -> Result<Issue, IssueError> {
        let number = self.next_number.fetch_add(1, Ordering::Relaxed);
        let issue = Issue {
            number,
            title: title.to_string(),
            body: opts.body,
            state: "open".to_string(),
            labels: opts.labels,
            comments: Vec::new(),
        };
        self.issues.insert(number, issue.clone());
        Ok(issue)
    }

    async fn get_issue(&self, number: u64) -> Result<Issue, IssueError> {
        self.issues
            .get(&number)
            .map(|i| i.value().clone())
            .ok_or(IssueError::NotFound(number))
    }

    async fn update_issue(&self, number: u64, state: Option<&str>) -> Result<(), IssueError> {
        let mut issue = self.issues.get_mut(&number).ok_or(IssueError::NotFound(number))?;
        if let Some(state) = state {
            issue.state = state.to_string();
        }
        Ok(())
    }

    async fn add_label(&self, number: u64, label: &str) -> Result<(), IssueError> {
        let mut issue = self.issues.get_mut(&number).ok_or(IssueError::NotFound(number))?;
        if !issue.labels.iter().any(|l| l == label) {
            issue.labels.push(label.to_string());
        }
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<(), IssueError> {
        let mut issue = self.issues.get_mut(&number).ok_or(IssueError::NotFound(number))?;
        issue.labels.retain(|l| l != label);
        Ok(())
    }

    async fn create_comment(&self, number: u64, body: &str) -> Result<(), IssueError> {
        let mut issue = self.issues.get_mut(&number).ok_or(IssueError::NotFound(number))?;
        issue.comments.push(IssueComment {
            author: "lattice".to_string(),
            body: body.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        });
        Ok(())
    }

    async fn list_issues(&self, labels: Option<&[String]>) -> Result<Vec<Issue>, IssueError> {
        let mut issues: Vec<Issue> = self
            .issues
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|issue| match labels {
                Some(wanted) => wanted.iter().all(|w| issue.labels.contains(w)),
                None => true,
            })
            .collect();
        issues.sort_by_key(|i| i.number);
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_issue_lifecycle() {
        let tracker = StubIssueTracker::new();
        let issue = tracker
            .create_issue(
                "Approval requested",
                NewIssue { body: "details".to_string(), labels: vec!["lattice".to_string()] },
            )
            .await
            .unwrap();
        assert_eq!(issue.number, 1);
        assert_eq!(issue.state, "open");

        tracker.add_label(1, "lattice:approve").await.unwrap();
        tracker.add_label(1, "lattice:approve").await.unwrap(); // idempotent
        tracker.create_comment(1, "looks good").await.unwrap();
        tracker.update_issue(1, Some("closed")).await.unwrap();

        let fetched = tracker.get_issue(1).await.unwrap();
        assert_eq!(fetched.labels, vec!["lattice", "lattice:approve"]);
        assert_eq!(fetched.comments.len(), 1);
        assert_eq!(fetched.state, "closed");

        assert!(matches!(tracker.get_issue(99).await, Err(IssueError::NotFound(99))));
    }

    #[tokio::test]
    async fn test_stub_list_filters_by_label() {
        let tracker = StubIssueTracker::new();
        tracker
            .create_issue("a", NewIssue { body: String::new(), labels: vec!["x".to_string()] })
            .await
            .unwrap();
        tracker
            .create_issue("b", NewIssue { body: String::new(), labels: vec!["y".to_string()] })
            .await
            .unwrap();

        let filtered = tracker.list_issues(Some(&["x".to_string()])).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].title, "a");

        assert_eq!(tracker.list_issues(None).await.unwrap().len(), 2);
    }
}
