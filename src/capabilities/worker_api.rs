//! Worker API capability - HTTP client for the remote sprite fleet
//!
//! The live client talks to the worker platform's REST surface; the stub
//! keeps an in-memory fleet that tests and token-less deployments can
//! shape directly. Errors are classified so callers can distinguish
//! not-found (external deletion signal) from transient failure (backoff).

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A sprite record as the worker API reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSprite {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub last_started_at: Option<String>,
    #[serde(default)]
    pub last_active_at: Option<String>,
}

/// Result of a one-shot exec call.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub output: String,
}

/// One item on an exec output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStreamItem {
    Stdout(String),
    Stderr(String),
    Exit(i32),
}

/// Worker API errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerApiError {
    #[error("sprite not found")]
    NotFound,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {0}")]
    Server(reqwest::StatusCode),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("worker API unavailable: {0}")]
    Unavailable(String),
}

/// The worker API surface Lattice consumes.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    async fn list_sprites(&self) -> Result<Vec<ApiSprite>, WorkerApiError>;
    async fn get_sprite(&self, id: &str) -> Result<ApiSprite, WorkerApiError>;
    async fn wake(&self, id: &str) -> Result<(), WorkerApiError>;
    async fn sleep(&self, id: &str) -> Result<(), WorkerApiError>;
    async fn exec(&self, id: &str, command: &str) -> Result<ExecResult, WorkerApiError>;
    /// Open a streaming exec. Items arrive until the remote process exits
    /// or the receiver is dropped.
    async fn exec_stream(
        &self,
        id: &str,
        command: &str,
    ) -> Result<mpsc::Receiver<ExecStreamItem>, WorkerApiError>;
    async fn fetch_logs(&self, id: &str, limit: usize) -> Result<Vec<String>, WorkerApiError>;
}

// ============================================================================
// Live client
// ============================================================================

/// Live HTTP client for the worker API.
#[derive(Clone)]
pub struct HttpWorkerApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpWorkerApi {
    pub fn new(base_url: &str, token: &str, timeout_ms: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.token))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, WorkerApiError> {
        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => Err(WorkerApiError::NotFound),
            status if status.is_success() => Ok(resp),
            status => Err(WorkerApiError::Server(status)),
        }
    }
}

#[async_trait]
impl WorkerApi for HttpWorkerApi {
    async fn list_sprites(&self) -> Result<Vec<ApiSprite>, WorkerApiError> {
        let resp = self.authed(self.http.get(self.url("/v1/sprites"))).send().await?;
        let resp = Self::check(resp).await?;
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get_sprite(&self, id: &str) -> Result<ApiSprite, WorkerApiError> {
        let resp = self
            .authed(self.http.get(self.url(&format!("/v1/sprites/{id}"))))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn wake(&self, id: &str) -> Result<(), WorkerApiError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/v1/sprites/{id}/wake"))))
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    async fn sleep(&self, id: &str) -> Result<(), WorkerApiError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/v1/sprites/{id}/sleep"))))
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    async fn exec(&self, id: &str, command: &str) -> Result<ExecResult, WorkerApiError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/v1/sprites/{id}/exec"))))
            .json(&json!({"command": command}))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn exec_stream(
        &self,
        id: &str,
        command: &str,
    ) -> Result<mpsc::Receiver<ExecStreamItem>, WorkerApiError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/v1/sprites/{id}/exec/stream"))))
            .json(&json!({"command": command}))
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        // The stream is newline-delimited JSON:
        //   {"stream":"stdout","data":"..."} | {"stream":"stderr","data":"..."}
        //   | {"stream":"exit","code":0}
        let (tx, rx) = mpsc::channel(64);
        let sprite_id = id.to_string();
        tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(sprite_id = %sprite_id, error = %e, "Exec stream read failed");
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let Some(item) = parse_stream_line(line.trim_end()) else {
                        continue;
                    };
                    if tx.send(item).await.is_err() {
                        return; // receiver closed the session
                    }
                }
            }
            debug!(sprite_id = %sprite_id, "Exec stream ended");
        });
        Ok(rx)
    }

    async fn fetch_logs(&self, id: &str, limit: usize) -> Result<Vec<String>, WorkerApiError> {
        let resp = self
            .authed(
                self.http
                    .get(self.url(&format!("/v1/sprites/{id}/logs")))
                    .query(&[("limit", limit)]),
            )
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn parse_stream_line(line: &str) -> Option<ExecStreamItem> {
    if line.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    match value.get("stream")?.as_str()? {
        "stdout" => Some(ExecStreamItem::Stdout(value.get("data")?.as_str()?.to_string())),
        "stderr" => Some(ExecStreamItem::Stderr(value.get("data")?.as_str()?.to_string())),
        "exit" => Some(ExecStreamItem::Exit(value.get("code")?.as_i64()? as i32)),
        _ => None,
    }
}

// ============================================================================
// Stub
// ============================================================================

/// In-memory worker API for tests and token-less deployments.
///
/// The fleet is mutable from outside: insert and remove sprites, flip
/// statuses, inject failures, and script exec streams.
#[derive(Clone, Default)]
pub struct StubWorkerApi {
    sprites: Arc<RwLock<HashMap<String, ApiSprite>>>,
    /// When set, every call fails with `Unavailable(reason)`
    outage: Arc<RwLock<Option<String>>>,
    /// Scripted items handed to the next `exec_stream` call
    exec_script: Arc<Mutex<Vec<ExecStreamItem>>>,
    /// Keep exec streams open after the script drains (long-lived command)
    exec_hold_open: Arc<std::sync::atomic::AtomicBool>,
    /// Sender side of the most recent held-open exec stream
    exec_live_tx: Arc<Mutex<Option<mpsc::Sender<ExecStreamItem>>>>,
    /// When set, `list_sprites` reports exactly these ids even when the
    /// backing map disagrees (lets list and get diverge, as the real API
    /// briefly does)
    list_override: Arc<RwLock<Option<Vec<String>>>>,
    logs: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl StubWorkerApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_sprite(&self, sprite: ApiSprite) {
        if let Ok(mut sprites) = self.sprites.write() {
            sprites.insert(sprite.id.clone(), sprite);
        }
    }

    pub fn remove_sprite(&self, id: &str) {
        if let Ok(mut sprites) = self.sprites.write() {
            sprites.remove(id);
        }
    }

    pub fn set_status(&self, id: &str, status: &str) {
        if let Ok(mut sprites) = self.sprites.write() {
            if let Some(sprite) = sprites.get_mut(id) {
                sprite.status = status.to_string();
            }
        }
    }

    /// Make every call fail until `clear_outage`.
    pub fn set_outage(&self, reason: &str) {
        if let Ok(mut outage) = self.outage.write() {
            *outage = Some(reason.to_string());
        }
    }

    pub fn clear_outage(&self) {
        if let Ok(mut outage) = self.outage.write() {
            *outage = None;
        }
    }

    /// Script the items the next `exec_stream` call will deliver.
    pub fn script_exec(&self, items: Vec<ExecStreamItem>) {
        if let Ok(mut script) = self.exec_script.lock() {
            *script = items;
        }
    }

    /// Keep exec streams open after their script drains, as a long-running
    /// remote command would.
    pub fn set_exec_hold_open(&self, hold: bool) {
        self.exec_hold_open.store(hold, std::sync::atomic::Ordering::SeqCst);
    }

    /// Push one item into the most recent held-open exec stream.
    pub async fn push_exec(&self, item: ExecStreamItem) {
        let tx = self.exec_live_tx.lock().ok().and_then(|guard| guard.clone());
        if let Some(tx) = tx {
            let _ = tx.send(item).await;
        }
    }

    /// Pin the `list_sprites` response to these ids regardless of the map.
    pub fn set_list_override(&self, ids: Vec<String>) {
        if let Ok(mut over) = self.list_override.write() {
            *over = Some(ids);
        }
    }

    pub fn clear_list_override(&self) {
        if let Ok(mut over) = self.list_override.write() {
            *over = None;
        }
    }

    pub fn set_logs(&self, id: &str, lines: Vec<String>) {
        if let Ok(mut logs) = self.logs.write() {
            logs.insert(id.to_string(), lines);
        }
    }

    fn check_outage(&self) -> Result<(), WorkerApiError> {
        match self.outage.read() {
            Ok(outage) => match outage.as_ref() {
                Some(reason) => Err(WorkerApiError::Unavailable(reason.clone())),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

/// Convenience constructor for stub fleets.
pub fn make_api_sprite(id: &str, status: &str) -> ApiSprite {
    ApiSprite {
        id: id.to_string(),
        name: Some(id.to_string()),
        status: status.to_string(),
        created_at: None,
        updated_at: None,
        last_started_at: None,
        last_active_at: None,
    }
}

#[async_trait]
impl WorkerApi for StubWorkerApi {
    async fn list_sprites(&self) -> Result<Vec<ApiSprite>, WorkerApiError> {
        self.check_outage()?;
        if let Ok(over) = self.list_override.read() {
            if let Some(ids) = over.as_ref() {
                let sprites = self.sprites.read().ok();
                return Ok(ids
                    .iter()
                    .map(|id| {
                        sprites
                            .as_ref()
                            .and_then(|s| s.get(id).cloned())
                            .unwrap_or_else(|| make_api_sprite(id, "warm"))
                    })
                    .collect());
            }
        }
        let sprites = self
            .sprites
            .read()
            .map(|s| s.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(sprites)
    }

    async fn get_sprite(&self, id: &str) -> Result<ApiSprite, WorkerApiError> {
        self.check_outage()?;
        self.sprites
            .read()
            .ok()
            .and_then(|s| s.get(id).cloned())
            .ok_or(WorkerApiError::NotFound)
    }

    async fn wake(&self, id: &str) -> Result<(), WorkerApiError> {
        self.check_outage()?;
        match self.sprites.write() {
            Ok(mut sprites) => match sprites.get_mut(id) {
                Some(sprite) => {
                    sprite.status = "warm".to_string();
                    Ok(())
                }
                None => Err(WorkerApiError::NotFound),
            },
            Err(_) => Err(WorkerApiError::Unavailable("stub lock poisoned".to_string())),
        }
    }

    async fn sleep(&self, id: &str) -> Result<(), WorkerApiError> {
        self.check_outage()?;
        match self.sprites.write() {
            Ok(mut sprites) => match sprites.get_mut(id) {
                Some(sprite) => {
                    sprite.status = "sleeping".to_string();
                    Ok(())
                }
                None => Err(WorkerApiError::NotFound),
            },
            Err(_) => Err(WorkerApiError::Unavailable("stub lock poisoned".to_string())),
        }
    }

    async fn exec(&self, id: &str, _command: &str) -> Result<ExecResult, WorkerApiError> {
        self.check_outage()?;
        if self.sprites.read().map(|s| !s.contains_key(id)).unwrap_or(true) {
            return Err(WorkerApiError::NotFound);
        }
        Ok(ExecResult { exit_code: 0, output: String::new() })
    }

    async fn exec_stream(
        &self,
        id: &str,
        _command: &str,
    ) -> Result<mpsc::Receiver<ExecStreamItem>, WorkerApiError> {
        self.check_outage()?;
        if self.sprites.read().map(|s| !s.contains_key(id)).unwrap_or(true) {
            return Err(WorkerApiError::NotFound);
        }
        let items = self.exec_script.lock().map(|mut s| std::mem::take(&mut *s)).unwrap_or_default();
        let hold_open = self.exec_hold_open.load(std::sync::atomic::Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        if hold_open {
            // The retained sender keeps the stream open and lets tests push
            // items after attach.
            if let Ok(mut live) = self.exec_live_tx.lock() {
                *live = Some(tx.clone());
            }
        }
        tokio::spawn(async move {
            for item in items {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn fetch_logs(&self, id: &str, limit: usize) -> Result<Vec<String>, WorkerApiError> {
        self.check_outage()?;
        let lines = self
            .logs
            .read()
            .ok()
            .and_then(|logs| logs.get(id).cloned())
            .unwrap_or_default();
        Ok(lines.into_iter().rev().take(limit).rev().collect())
    }
}
