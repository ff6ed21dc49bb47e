//! Remote workspace API client.
//!
//! Everything that touches the document platform goes through the
//! [`RemoteBackend`] trait so tests can substitute an in-memory
//! backend. The HTTP implementation layers three concerns:
//!
//! - token lifecycle: app credentials from the environment, a cached
//!   access token refreshed under a single-writer lock
//! - error classification: HTTP status plus the envelope payload code
//!   map to a closed [`ErrorClass`]
//! - bounded retry with exponential backoff for transient errors, and
//!   a single coordinated refresh-and-retry for auth errors

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::RemoteConfig;

/// Payload codes the platform uses for expired or invalid tokens.
const INVALID_TOKEN_CODES: [i64; 4] = [99991663, 99991664, 99991665, 99991668];

/// Payload code returned when two workers create the same folder at
/// once; the loser re-lists instead of failing.
const CONCURRENT_FOLDER_CODE: i64 = 1061045;

/// Access tokens are refreshed this many seconds before they expire.
const EXPIRY_SLACK_SECS: i64 = 60;

/// Closed classification of remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, rate limit, or server error. Retried with backoff.
    Transient,
    /// Expired or invalid token. One coordinated refresh, then retry.
    Auth,
    /// Well-formed write rejected for policy reasons. Never retried in
    /// the same form; the caller switches strategy instead.
    Structural,
    /// Anything else. Fails the current document.
    Fatal,
}

/// A classified remote API failure.
#[derive(Debug)]
pub struct ApiError {
    pub class: ErrorClass,
    pub status: u16,
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "remote API error (status {}, code {}): {}",
            self.status, self.code, self.message
        )
    }
}

impl std::error::Error for ApiError {}

/// Failure of the token refresh itself. One failed refresh means every
/// later call would fail the same way, so the orchestrator aborts the
/// run instead of failing documents one at a time.
#[derive(Debug)]
pub struct TokenRefreshError(pub String);

impl std::fmt::Display for TokenRefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "token refresh failed: {}", self.0)
    }
}

impl std::error::Error for TokenRefreshError {}

/// True when the error carries a failed token refresh, through any
/// context layers added on the way up.
pub fn is_refresh_failure(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TokenRefreshError>().is_some()
}

/// Classification of an error value; non-[`ApiError`] causes are Fatal.
pub fn class_of(err: &anyhow::Error) -> ErrorClass {
    err.downcast_ref::<ApiError>()
        .map(|e| e.class)
        .unwrap_or(ErrorClass::Fatal)
}

/// Map an HTTP status and envelope payload code to an [`ErrorClass`].
pub fn classify(status: u16, code: i64, structural_codes: &[i64]) -> ErrorClass {
    if status == 401 || INVALID_TOKEN_CODES.contains(&code) {
        return ErrorClass::Auth;
    }
    if status == 429 || status >= 500 {
        return ErrorClass::Transient;
    }
    if structural_codes.contains(&code) {
        return ErrorClass::Structural;
    }
    ErrorClass::Fatal
}

#[derive(Debug, Clone)]
pub struct RemoteDoc {
    pub document_id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct FolderEntry {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
}

#[derive(Debug, Clone)]
pub struct WikiSpace {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct WikiNode {
    pub node_id: String,
    pub title: String,
}

/// The remote surface the pipeline writes through.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn create_document(&self, title: &str, folder_id: &str) -> Result<RemoteDoc>;
    async fn append_blocks(&self, document_id: &str, blocks: &[serde_json::Value]) -> Result<()>;
    /// Upload binary media; returns the platform's media handle.
    async fn upload_media(
        &self,
        document_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String>;
    async fn list_folder_children(&self, folder_id: &str) -> Result<Vec<FolderEntry>>;
    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String>;
    async fn list_spaces(&self) -> Result<Vec<WikiSpace>>;
    async fn create_space(&self, name: &str) -> Result<String>;
    async fn list_space_nodes(
        &self,
        space_id: &str,
        parent_node: Option<&str>,
    ) -> Result<Vec<WikiNode>>;
    /// Move an existing document under a wiki node; returns the new
    /// node token.
    async fn move_doc_to_wiki(
        &self,
        space_id: &str,
        parent_node: Option<&str>,
        document_id: &str,
    ) -> Result<String>;
}

// ============ Token lifecycle ============

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenState {
    access_token: String,
    expires_at: i64,
}

fn is_fresh(expires_at: i64, now: i64) -> bool {
    expires_at - EXPIRY_SLACK_SECS > now
}

/// A forced refresh is redundant when the stored token already differs
/// from the rejected one and is still fresh.
fn needs_refresh(current: Option<&TokenState>, stale: &str, now: i64) -> bool {
    match current {
        Some(state) => state.access_token == stale || !is_fresh(state.expires_at, now),
        None => true,
    }
}

/// Holds the shared access token. The lock is held across the refresh
/// call, so workers observing an expired token block on the in-flight
/// refresh instead of issuing their own.
pub struct TokenManager {
    client: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    cache_path: PathBuf,
    state: Mutex<Option<TokenState>>,
}

impl TokenManager {
    pub fn new(client: reqwest::Client, config: &RemoteConfig) -> Result<Self> {
        let app_id = std::env::var("DOCPORT_APP_ID")
            .map_err(|_| anyhow::anyhow!("DOCPORT_APP_ID environment variable not set"))?;
        let app_secret = std::env::var("DOCPORT_APP_SECRET")
            .map_err(|_| anyhow::anyhow!("DOCPORT_APP_SECRET environment variable not set"))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_id,
            app_secret,
            cache_path: config.token_cache_path.clone(),
            state: Mutex::new(None),
        })
    }

    /// Current access token, refreshing first when stale.
    pub async fn token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        let now = Utc::now().timestamp();

        if state.is_none() {
            *state = load_cached_token(&self.cache_path);
        }
        if let Some(current) = state.as_ref() {
            if is_fresh(current.expires_at, now) {
                return Ok(current.access_token.clone());
            }
        }

        let fresh = self
            .fetch_token()
            .await
            .map_err(|e| TokenRefreshError(format!("{:#}", e)))?;
        let token = fresh.access_token.clone();
        store_cached_token(&self.cache_path, &fresh);
        *state = Some(fresh);
        Ok(token)
    }

    /// Replace the token after the API rejected it. Callers pass the
    /// token they saw rejected; when a peer already refreshed while
    /// this caller waited on the lock, the stored token differs and is
    /// returned without a redundant fetch.
    pub async fn force_refresh(&self, stale: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        if !needs_refresh(state.as_ref(), stale, Utc::now().timestamp()) {
            if let Some(current) = state.as_ref() {
                return Ok(current.access_token.clone());
            }
        }
        let fresh = self
            .fetch_token()
            .await
            .map_err(|e| TokenRefreshError(format!("{:#}", e)))?;
        let token = fresh.access_token.clone();
        store_cached_token(&self.cache_path, &fresh);
        *state = Some(fresh);
        Ok(token)
    }

    async fn fetch_token(&self) -> Result<TokenState> {
        let body = serde_json::json!({
            "app_id": self.app_id,
            "app_secret": self.app_secret,
        });
        let response = self
            .client
            .post(format!("{}/api/auth/token", self.base_url))
            .json(&body)
            .send()
            .await
            .context("Token request failed")?;

        let status = response.status().as_u16();
        let json: serde_json::Value = response
            .json()
            .await
            .context("Token response was not JSON")?;
        let code = json.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        if status >= 400 || code != 0 {
            bail!(
                "Token endpoint rejected app credentials (status {}, code {})",
                status,
                code
            );
        }

        let data = json.get("data").cloned().unwrap_or_default();
        let access_token = data
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow::anyhow!("Token response missing access_token"))?
            .to_string();
        let expires_in = data.get("expires_in").and_then(|e| e.as_i64()).unwrap_or(0);

        tracing::debug!(expires_in, "Fetched fresh access token");
        Ok(TokenState {
            access_token,
            expires_at: Utc::now().timestamp() + expires_in,
        })
    }
}

fn load_cached_token(path: &PathBuf) -> Option<TokenState> {
    let raw = std::fs::read_to_string(path).ok()?;
    let state: TokenState = serde_json::from_str(&raw).ok()?;
    if is_fresh(state.expires_at, Utc::now().timestamp()) {
        Some(state)
    } else {
        None
    }
}

fn store_cached_token(path: &PathBuf, state: &TokenState) {
    let write = || -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string(state)?)?;
        Ok(())
    };
    if let Err(err) = write() {
        tracing::warn!(path = %path.display(), error = %err, "Failed to persist token cache");
    }
}

// ============ HTTP backend ============

/// [`RemoteBackend`] over the platform's REST API.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    tokens: TokenManager,
    structural_codes: Vec<i64>,
    max_retries: u32,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let tokens = TokenManager::new(client.clone(), config)?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens,
            structural_codes: config.structural_codes.clone(),
            max_retries: config.max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Issue one JSON request with retry, backoff, and token refresh.
    /// Returns the envelope's `data` field.
    async fn request_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut last_err: Option<anyhow::Error> = None;
        let mut refreshed = false;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let token = self.tokens.token().await?;
            let mut request = self
                .client
                .request(method.clone(), self.url(path))
                .header("Authorization", format!("Bearer {}", token));
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    last_err = Some(
                        ApiError {
                            class: ErrorClass::Transient,
                            status: 0,
                            code: 0,
                            message: e.to_string(),
                        }
                        .into(),
                    );
                    continue;
                }
            };

            let status = response.status().as_u16();
            let json: serde_json::Value = match response.json().await {
                Ok(json) => json,
                Err(e) => {
                    last_err = Some(
                        ApiError {
                            class: ErrorClass::Transient,
                            status,
                            code: 0,
                            message: format!("invalid response body: {}", e),
                        }
                        .into(),
                    );
                    continue;
                }
            };

            let code = json.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
            if status < 400 && code == 0 {
                return Ok(json.get("data").cloned().unwrap_or_default());
            }

            let message = json
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or("")
                .to_string();
            let class = classify(status, code, &self.structural_codes);
            let error = ApiError {
                class,
                status,
                code,
                message,
            };

            match class {
                ErrorClass::Transient => {
                    last_err = Some(error.into());
                }
                ErrorClass::Auth if !refreshed => {
                    tracing::info!(path, "Token rejected, refreshing once");
                    // A failed refresh is a TokenRefreshError: it
                    // propagates here and aborts the whole run.
                    self.tokens.force_refresh(&token).await?;
                    refreshed = true;
                    last_err = Some(error.into());
                }
                _ => return Err(error.into()),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Request failed after retries: {}", path)))
    }
}

#[async_trait]
impl RemoteBackend for HttpRemote {
    async fn create_document(&self, title: &str, folder_id: &str) -> Result<RemoteDoc> {
        let body = serde_json::json!({ "title": title, "folder_id": folder_id });
        let data = self
            .request_json(reqwest::Method::POST, "/api/documents", Some(&body))
            .await?;
        let document_id = data
            .get("document_id")
            .and_then(|d| d.as_str())
            .ok_or_else(|| anyhow::anyhow!("Create-document response missing document_id"))?
            .to_string();
        let url = data
            .get("url")
            .and_then(|u| u.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(RemoteDoc { document_id, url })
    }

    async fn append_blocks(&self, document_id: &str, blocks: &[serde_json::Value]) -> Result<()> {
        let body = serde_json::json!({ "children": blocks });
        let path = format!("/api/documents/{}/blocks", document_id);
        self.request_json(reqwest::Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }

    async fn upload_media(
        &self,
        document_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let token = self.tokens.token().await?;
        let form = reqwest::multipart::Form::new()
            .text("parent_id", document_id.to_string())
            .text("size", bytes.len().to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string()),
            );

        let response = self
            .client
            .post(self.url("/api/media/upload"))
            .header("Authorization", format!("Bearer {}", token))
            .multipart(form)
            .send()
            .await
            .context("Media upload request failed")?;

        let status = response.status().as_u16();
        let json: serde_json::Value = response.json().await.context("Media upload response")?;
        let code = json.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        if status >= 400 || code != 0 {
            let class = classify(status, code, &self.structural_codes);
            return Err(ApiError {
                class,
                status,
                code,
                message: format!("media upload rejected for {}", file_name),
            }
            .into());
        }
        json.get("data")
            .and_then(|d| d.get("media_id"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Media upload response missing media_id"))
    }

    async fn list_folder_children(&self, folder_id: &str) -> Result<Vec<FolderEntry>> {
        let path = format!("/api/folders/{}/children", folder_id);
        let data = self.request_json(reqwest::Method::GET, &path, None).await?;
        let children = data
            .get("children")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(children
            .iter()
            .map(|child| FolderEntry {
                id: child
                    .get("id")
                    .and_then(|i| i.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: child
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string(),
                is_folder: child.get("type").and_then(|t| t.as_str()) == Some("folder"),
            })
            .collect())
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String> {
        let body = serde_json::json!({ "name": name, "parent_id": parent_id });
        let data = self
            .request_json(reqwest::Method::POST, "/api/folders", Some(&body))
            .await?;
        data.get("folder_id")
            .and_then(|f| f.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Create-folder response missing folder_id"))
    }

    async fn list_spaces(&self) -> Result<Vec<WikiSpace>> {
        let data = self
            .request_json(reqwest::Method::GET, "/api/wiki/spaces", None)
            .await?;
        let items = data
            .get("items")
            .and_then(|i| i.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(items
            .iter()
            .map(|item| WikiSpace {
                id: item
                    .get("space_id")
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: item
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect())
    }

    async fn create_space(&self, name: &str) -> Result<String> {
        let body = serde_json::json!({ "name": name });
        let data = self
            .request_json(reqwest::Method::POST, "/api/wiki/spaces", Some(&body))
            .await?;
        data.get("space_id")
            .and_then(|s| s.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Create-space response missing space_id"))
    }

    async fn list_space_nodes(
        &self,
        space_id: &str,
        parent_node: Option<&str>,
    ) -> Result<Vec<WikiNode>> {
        let path = match parent_node {
            Some(parent) => format!(
                "/api/wiki/spaces/{}/nodes?parent_node={}",
                space_id, parent
            ),
            None => format!("/api/wiki/spaces/{}/nodes", space_id),
        };
        let data = self.request_json(reqwest::Method::GET, &path, None).await?;
        let items = data
            .get("items")
            .and_then(|i| i.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(items
            .iter()
            .map(|item| WikiNode {
                node_id: item
                    .get("node_id")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string(),
                title: item
                    .get("title")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect())
    }

    async fn move_doc_to_wiki(
        &self,
        space_id: &str,
        parent_node: Option<&str>,
        document_id: &str,
    ) -> Result<String> {
        let body = serde_json::json!({
            "document_id": document_id,
            "parent_node": parent_node,
        });
        let path = format!("/api/wiki/spaces/{}/move_doc", space_id);
        let data = self
            .request_json(reqwest::Method::POST, &path, Some(&body))
            .await?;
        Ok(data
            .get("node_id")
            .and_then(|n| n.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

/// Backend used for dry runs: any call means a dry-run guarantee was
/// violated somewhere upstream.
pub struct OfflineBackend;

#[async_trait]
impl RemoteBackend for OfflineBackend {
    async fn create_document(&self, _title: &str, _folder_id: &str) -> Result<RemoteDoc> {
        bail!("Network call attempted during dry run")
    }
    async fn append_blocks(&self, _document_id: &str, _blocks: &[serde_json::Value]) -> Result<()> {
        bail!("Network call attempted during dry run")
    }
    async fn upload_media(
        &self,
        _document_id: &str,
        _file_name: &str,
        _bytes: Vec<u8>,
    ) -> Result<String> {
        bail!("Network call attempted during dry run")
    }
    async fn list_folder_children(&self, _folder_id: &str) -> Result<Vec<FolderEntry>> {
        bail!("Network call attempted during dry run")
    }
    async fn create_folder(&self, _name: &str, _parent_id: &str) -> Result<String> {
        bail!("Network call attempted during dry run")
    }
    async fn list_spaces(&self) -> Result<Vec<WikiSpace>> {
        bail!("Network call attempted during dry run")
    }
    async fn create_space(&self, _name: &str) -> Result<String> {
        bail!("Network call attempted during dry run")
    }
    async fn list_space_nodes(
        &self,
        _space_id: &str,
        _parent_node: Option<&str>,
    ) -> Result<Vec<WikiNode>> {
        bail!("Network call attempted during dry run")
    }
    async fn move_doc_to_wiki(
        &self,
        _space_id: &str,
        _parent_node: Option<&str>,
        _document_id: &str,
    ) -> Result<String> {
        bail!("Network call attempted during dry run")
    }
}

// ============ Hierarchy helpers ============

/// Per-run cache of ensured folder ids, keyed by `parent_id/name`.
pub type FolderCache = HashMap<String, String>;

/// Return the id of `name` under `parent_id`, creating it if missing.
/// A create that loses a race against a concurrent worker re-lists the
/// parent instead of failing.
pub async fn ensure_folder(
    backend: &dyn RemoteBackend,
    cache: &mut FolderCache,
    parent_id: &str,
    name: &str,
) -> Result<String> {
    let key = format!("{}/{}", parent_id, name);
    if let Some(id) = cache.get(&key) {
        return Ok(id.clone());
    }

    let children = backend.list_folder_children(parent_id).await?;
    if let Some(existing) = children.iter().find(|c| c.is_folder && c.name == name) {
        cache.insert(key, existing.id.clone());
        return Ok(existing.id.clone());
    }

    match backend.create_folder(name, parent_id).await {
        Ok(id) => {
            cache.insert(key, id.clone());
            Ok(id)
        }
        Err(err) => {
            let lost_race = err
                .downcast_ref::<ApiError>()
                .map(|e| e.code == CONCURRENT_FOLDER_CODE)
                .unwrap_or(false);
            if !lost_race {
                return Err(err);
            }
            let children = backend.list_folder_children(parent_id).await?;
            let existing = children
                .into_iter()
                .find(|c| c.is_folder && c.name == name)
                .ok_or_else(|| anyhow::anyhow!("Folder '{}' vanished after create race", name))?;
            cache.insert(key, existing.id.clone());
            Ok(existing.id)
        }
    }
}

/// Walk `dir` (a `/`-separated relative directory) under `root_id`,
/// ensuring each level exists. Returns the leaf folder id.
pub async fn ensure_folder_path(
    backend: &dyn RemoteBackend,
    cache: &mut FolderCache,
    root_id: &str,
    dir: &str,
    name_max_bytes: usize,
) -> Result<String> {
    let mut current = root_id.to_string();
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        let name = crate::planner::normalize_folder_name(part, name_max_bytes);
        current = ensure_folder(backend, cache, &current, &name).await?;
    }
    Ok(current)
}

/// Find a wiki space by id or name, creating it by name when missing.
pub async fn ensure_space(
    backend: &dyn RemoteBackend,
    space_id: &str,
    space_name: &str,
) -> Result<String> {
    if !space_id.is_empty() {
        return Ok(space_id.to_string());
    }
    let spaces = backend.list_spaces().await?;
    if let Some(space) = spaces.iter().find(|s| s.name == space_name) {
        return Ok(space.id.clone());
    }
    backend
        .create_space(space_name)
        .await
        .with_context(|| format!("Failed to create wiki space '{}'", space_name))
}

/// Per-run cache of wiki node tokens keyed by directory path.
pub type NodeCache = HashMap<String, Option<String>>;

/// Ensure wiki nodes exist for each segment of `dir` and return the
/// parent node token for documents in that directory. Container nodes
/// are empty documents moved into the space.
pub async fn ensure_path_nodes(
    backend: &dyn RemoteBackend,
    cache: &mut NodeCache,
    space_id: &str,
    dir: &str,
) -> Result<Option<String>> {
    if dir.is_empty() {
        return Ok(None);
    }
    if let Some(node) = cache.get(dir) {
        return Ok(node.clone());
    }

    let mut parent: Option<String> = None;
    let mut walked = String::new();
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        if !walked.is_empty() {
            walked.push('/');
        }
        walked.push_str(part);

        if let Some(node) = cache.get(&walked) {
            parent = node.clone();
            continue;
        }

        let siblings = backend.list_space_nodes(space_id, parent.as_deref()).await?;
        let node = match siblings.iter().find(|n| n.title == part) {
            Some(existing) => Some(existing.node_id.clone()),
            None => {
                let doc = backend.create_document(part, "").await?;
                let node_id = backend
                    .move_doc_to_wiki(space_id, parent.as_deref(), &doc.document_id)
                    .await?;
                Some(node_id)
            }
        };
        cache.insert(walked.clone(), node.clone());
        parent = node;
    }
    Ok(parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn classifies_by_status_and_code() {
        let structural = vec![1770001];
        assert_eq!(classify(429, 0, &structural), ErrorClass::Transient);
        assert_eq!(classify(503, 0, &structural), ErrorClass::Transient);
        assert_eq!(classify(401, 0, &structural), ErrorClass::Auth);
        assert_eq!(classify(200, 99991663, &structural), ErrorClass::Auth);
        assert_eq!(classify(400, 1770001, &structural), ErrorClass::Structural);
        assert_eq!(classify(400, 42, &structural), ErrorClass::Fatal);
    }

    #[test]
    fn auth_wins_over_transient_status() {
        // An invalid-token code inside a 500 body still means refresh.
        assert_eq!(classify(500, 99991664, &[]), ErrorClass::Auth);
    }

    #[test]
    fn redundant_refresh_is_skipped_after_a_peer_refresh() {
        let now = 1000;
        let replaced = TokenState {
            access_token: "new".to_string(),
            expires_at: now + 3600,
        };
        // A peer already swapped the rejected token for a fresh one.
        assert!(!needs_refresh(Some(&replaced), "old", now));
        // Same token as the one rejected: refresh is still required.
        assert!(needs_refresh(Some(&replaced), "new", now));

        let nearly_expired = TokenState {
            access_token: "new".to_string(),
            expires_at: now + 10,
        };
        assert!(needs_refresh(Some(&nearly_expired), "old", now));
        assert!(needs_refresh(None, "old", now));
    }

    #[test]
    fn refresh_failures_are_detectable_through_context() {
        let err: anyhow::Error = TokenRefreshError("endpoint rejected credentials".to_string()).into();
        let err = err.context("while writing intro.md");
        assert!(is_refresh_failure(&err));
        assert!(!is_refresh_failure(&anyhow::anyhow!("plain failure")));
    }

    #[test]
    fn freshness_honors_expiry_slack() {
        assert!(is_fresh(1000 + EXPIRY_SLACK_SECS + 1, 1000));
        assert!(!is_fresh(1000 + EXPIRY_SLACK_SECS, 1000));
        assert!(!is_fresh(900, 1000));
    }

    #[test]
    fn token_cache_roundtrip_skips_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");

        let fresh = TokenState {
            access_token: "tok".to_string(),
            expires_at: Utc::now().timestamp() + 3600,
        };
        store_cached_token(&path, &fresh);
        let loaded = load_cached_token(&path).unwrap();
        assert_eq!(loaded.access_token, "tok");

        let stale = TokenState {
            access_token: "old".to_string(),
            expires_at: Utc::now().timestamp() - 10,
        };
        store_cached_token(&path, &stale);
        assert!(load_cached_token(&path).is_none());
    }

    /// Minimal scripted backend for the hierarchy helpers.
    struct ScriptedBackend {
        folders: StdMutex<Vec<(String, String, String)>>, // (parent, name, id)
        create_fails_with: Option<i64>,
        list_calls: StdMutex<u32>,
    }

    impl ScriptedBackend {
        fn new() -> Self {
            Self {
                folders: StdMutex::new(Vec::new()),
                create_fails_with: None,
                list_calls: StdMutex::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteBackend for ScriptedBackend {
        async fn create_document(&self, _title: &str, _folder_id: &str) -> Result<RemoteDoc> {
            Ok(RemoteDoc {
                document_id: "doc".to_string(),
                url: String::new(),
            })
        }
        async fn append_blocks(
            &self,
            _document_id: &str,
            _blocks: &[serde_json::Value],
        ) -> Result<()> {
            Ok(())
        }
        async fn upload_media(
            &self,
            _document_id: &str,
            _file_name: &str,
            _bytes: Vec<u8>,
        ) -> Result<String> {
            Ok("media".to_string())
        }
        async fn list_folder_children(&self, folder_id: &str) -> Result<Vec<FolderEntry>> {
            *self.list_calls.lock().unwrap() += 1;
            Ok(self
                .folders
                .lock()
                .unwrap()
                .iter()
                .filter(|(parent, _, _)| parent == folder_id)
                .map(|(_, name, id)| FolderEntry {
                    id: id.clone(),
                    name: name.clone(),
                    is_folder: true,
                })
                .collect())
        }
        async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String> {
            if let Some(code) = self.create_fails_with {
                // The racing winner has inserted the folder by now.
                self.folders.lock().unwrap().push((
                    parent_id.to_string(),
                    name.to_string(),
                    "raced".to_string(),
                ));
                return Err(ApiError {
                    class: ErrorClass::Fatal,
                    status: 400,
                    code,
                    message: "concurrent create".to_string(),
                }
                .into());
            }
            let id = format!("id-{}-{}", parent_id, name);
            self.folders.lock().unwrap().push((
                parent_id.to_string(),
                name.to_string(),
                id.clone(),
            ));
            Ok(id)
        }
        async fn list_spaces(&self) -> Result<Vec<WikiSpace>> {
            Ok(vec![WikiSpace {
                id: "sp1".to_string(),
                name: "Handbook".to_string(),
            }])
        }
        async fn create_space(&self, _name: &str) -> Result<String> {
            Ok("sp2".to_string())
        }
        async fn list_space_nodes(
            &self,
            _space_id: &str,
            _parent_node: Option<&str>,
        ) -> Result<Vec<WikiNode>> {
            Ok(Vec::new())
        }
        async fn move_doc_to_wiki(
            &self,
            _space_id: &str,
            _parent_node: Option<&str>,
            document_id: &str,
        ) -> Result<String> {
            Ok(format!("node-{}", document_id))
        }
    }

    #[tokio::test]
    async fn ensure_folder_path_creates_each_level_once() {
        let backend = ScriptedBackend::new();
        let mut cache = FolderCache::new();

        let leaf = ensure_folder_path(&backend, &mut cache, "root", "a/b", 256)
            .await
            .unwrap();
        assert_eq!(leaf, "id-id-root-a-b");

        // Second resolution hits the cache, no extra listing.
        let calls_before = *backend.list_calls.lock().unwrap();
        let again = ensure_folder_path(&backend, &mut cache, "root", "a/b", 256)
            .await
            .unwrap();
        assert_eq!(again, leaf);
        assert_eq!(*backend.list_calls.lock().unwrap(), calls_before);
    }

    #[tokio::test]
    async fn lost_folder_race_recovers_by_relisting() {
        let mut backend = ScriptedBackend::new();
        backend.create_fails_with = Some(CONCURRENT_FOLDER_CODE);
        let mut cache = FolderCache::new();

        let id = ensure_folder(&backend, &mut cache, "root", "shared")
            .await
            .unwrap();
        assert_eq!(id, "raced");
    }

    #[tokio::test]
    async fn ensure_space_prefers_explicit_id_then_name() {
        let backend = ScriptedBackend::new();
        assert_eq!(ensure_space(&backend, "sp9", "x").await.unwrap(), "sp9");
        assert_eq!(
            ensure_space(&backend, "", "Handbook").await.unwrap(),
            "sp1"
        );
        assert_eq!(ensure_space(&backend, "", "New").await.unwrap(), "sp2");
    }
}
