//! HTTP client for the music download backend.
//!
//! Every endpoint answers with the envelope
//! `{status, success, message, data?, error_code?}`. Successful calls unwrap
//! to `data`; everything else becomes an [`ApiError`]. Calls are never
//! retried here.

mod error;
pub mod types;

use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::task::{TaskId, TaskKind, TaskSnapshot};

pub use error::{ApiError, ReauthHook, TransportKind, COOKIE_EXPIRED};
pub use types::*;

const FILENAME_HEADER: &str = "x-download-filename";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error_code: Option<String>,
}

/// Request/response client. Cheap to clone.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    client: Client,
    reauth: Option<Arc<dyn ReauthHook>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ApiError::Setup(e.to_string()))?;

        let mut base_url = config.api_base_url.trim().to_string();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self {
            base_url,
            client,
            reauth: None,
        })
    }

    /// Register who gets told when the backend's credentials expire.
    pub fn with_reauth_hook(mut self, hook: Arc<dyn ReauthHook>) -> Self {
        self.reauth = Some(hook);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<Response, ApiError> {
        tracing::debug!(endpoint = endpoint, "Sending API request");
        request
            .send()
            .await
            .map_err(|e| ApiError::transport(endpoint, &e))
    }

    /// Unwrap the envelope, turning failures into typed errors.
    async fn read_envelope(&self, endpoint: &str, resp: Response) -> Result<Value, ApiError> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::transport(endpoint, &e))?;
        let envelope = serde_json::from_str::<Envelope>(&text);

        let rejected = match &envelope {
            Ok(env) => !status.is_success() || env.success == Some(false),
            Err(_) => !status.is_success(),
        };

        if rejected {
            let (code, message) = match envelope {
                Ok(env) => (env.error_code, env.message),
                Err(_) => (None, text),
            };
            return Err(self.rejection(endpoint, status.as_u16(), code, message));
        }

        let envelope = envelope.map_err(|e| {
            ApiError::decode(endpoint, format!("{}, body: {}", e, truncate(&text, 200)))
        })?;
        Ok(envelope.data.unwrap_or(Value::Null))
    }

    fn rejection(
        &self,
        endpoint: &str,
        status: u16,
        code: Option<String>,
        message: String,
    ) -> ApiError {
        if code.as_deref() == Some(COOKIE_EXPIRED) {
            tracing::error!(
                endpoint = endpoint,
                "Backend credentials expired, re-login required: {}",
                message
            );
            if let Some(hook) = &self.reauth {
                hook.credentials_expired(&message);
            }
            return ApiError::CredentialsExpired { message };
        }

        tracing::warn!(
            endpoint = endpoint,
            status = status,
            code = code.as_deref().unwrap_or("-"),
            "API request rejected: {}",
            message
        );
        ApiError::Backend {
            endpoint: endpoint.to_string(),
            status,
            code,
            message,
        }
    }

    async fn get_data(&self, endpoint: &str) -> Result<Value, ApiError> {
        let resp = self
            .send(endpoint, self.client.get(self.url(endpoint)))
            .await?;
        self.read_envelope(endpoint, resp).await
    }

    async fn post_data<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<Value, ApiError> {
        let mut request = self.client.post(self.url(endpoint));
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = self.send(endpoint, request).await?;
        self.read_envelope(endpoint, resp).await
    }

    fn parse<T: DeserializeOwned>(endpoint: &str, data: Value) -> Result<T, ApiError> {
        serde_json::from_value(data).map_err(|e| ApiError::decode(endpoint, e.to_string()))
    }

    fn submission(
        endpoint: &str,
        run_async: bool,
        kind: TaskKind,
        data: Value,
    ) -> Result<Submission, ApiError> {
        if !run_async {
            return Ok(Submission::Completed(data));
        }
        let ack: SubmitAck = Self::parse(endpoint, data)?;
        tracing::info!(task_id = %ack.task_id, kind = kind.as_str(), "Task submitted");
        Ok(Submission::Queued {
            task_id: ack.task_id,
            kind,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Job submission
    // ─────────────────────────────────────────────────────────────────────────

    /// `POST /download`. A synchronous `format = file` download returns the
    /// audio bytes.
    pub async fn download(&self, request: &DownloadRequest) -> Result<Submission, ApiError> {
        let endpoint = "/download";
        let resp = self
            .send(endpoint, self.client.post(self.url(endpoint)).json(request))
            .await?;

        let is_json = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("json"))
            .unwrap_or(false);

        if resp.status().is_success() && !is_json {
            let filename = resp
                .headers()
                .get(FILENAME_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|raw| {
                    urlencoding::decode(raw)
                        .map(|s| s.into_owned())
                        .unwrap_or_else(|_| raw.to_string())
                });
            let data = resp
                .bytes()
                .await
                .map_err(|e| ApiError::transport(endpoint, &e))?;
            tracing::info!(
                filename = filename.as_deref().unwrap_or("-"),
                bytes = data.len(),
                "Received track file"
            );
            return Ok(Submission::File {
                filename,
                data: data.to_vec(),
            });
        }

        let data = self.read_envelope(endpoint, resp).await?;
        Self::submission(endpoint, request.run_async, TaskKind::SingleTrack, data)
    }

    /// `POST /playlist/download`
    pub async fn download_playlist(
        &self,
        request: &PlaylistDownloadRequest,
    ) -> Result<Submission, ApiError> {
        let endpoint = "/playlist/download";
        let data = self.post_data(endpoint, Some(request)).await?;
        Self::submission(endpoint, request.run_async, TaskKind::PlaylistBatch, data)
    }

    /// `POST /artist/download`
    pub async fn download_artist(
        &self,
        request: &ArtistDownloadRequest,
    ) -> Result<Submission, ApiError> {
        let endpoint = "/artist/download";
        let data = self.post_data(endpoint, Some(request)).await?;
        Self::submission(endpoint, request.run_async, TaskKind::ArtistBatch, data)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Task management
    // ─────────────────────────────────────────────────────────────────────────

    /// `GET /tasks`
    pub async fn list_tasks(&self) -> Result<Vec<TaskSnapshot>, ApiError> {
        let endpoint = "/tasks";
        let data = self.get_data(endpoint).await?;
        let list: TaskList = Self::parse(endpoint, data)?;
        Ok(list.tasks)
    }

    /// `GET /tasks/{id}`
    pub async fn task_info(&self, id: &TaskId) -> Result<TaskSnapshot, ApiError> {
        let endpoint = format!("/tasks/{}", urlencoding::encode(id.as_str()));
        let data = self.get_data(&endpoint).await?;
        Self::parse(&endpoint, data)
    }

    /// `POST /tasks/{id}/cancel`. `Ok(true)` means the backend acknowledged
    /// the cancel; the job may still finish before the signal lands.
    pub async fn cancel_task(&self, id: &TaskId) -> Result<bool, ApiError> {
        let endpoint = format!("/tasks/{}/cancel", urlencoding::encode(id.as_str()));
        let data = self.post_data::<Value>(&endpoint, None).await?;
        let ack: CancelAck = Self::parse(&endpoint, data)?;
        Ok(ack.cancelled)
    }

    /// `POST /tasks/clear-cancelled`
    pub async fn clear_cancelled_tasks(&self) -> Result<ClearCancelledReport, ApiError> {
        let endpoint = "/tasks/clear-cancelled";
        let data = self.post_data::<Value>(endpoint, None).await?;
        Self::parse(endpoint, data)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Catalog
    // ─────────────────────────────────────────────────────────────────────────

    /// `GET /health`
    pub async fn health(&self) -> Result<Health, ApiError> {
        let endpoint = "/health";
        let data = self.get_data(endpoint).await?;
        Self::parse(endpoint, data)
    }

    /// `POST /search`
    pub async fn search(&self, request: &SearchRequest) -> Result<Value, ApiError> {
        self.post_data("/search", Some(request)).await
    }

    /// `POST /song`
    pub async fn song_info(&self, id: &str, level: Quality) -> Result<Value, ApiError> {
        let body = SongInfoRequest {
            id: id.to_string(),
            level,
        };
        self.post_data("/song", Some(&body)).await
    }

    /// `POST /playlist`
    pub async fn playlist_info(&self, id: &str) -> Result<Value, ApiError> {
        let body = IdRequest { id: id.to_string() };
        self.post_data("/playlist", Some(&body)).await
    }

    /// `POST /album`
    pub async fn album_info(&self, id: &str) -> Result<Value, ApiError> {
        let body = IdRequest { id: id.to_string() };
        self.post_data("/album", Some(&body)).await
    }

    /// `POST /hot/playlists`
    pub async fn hot_playlists(&self, request: &HotPlaylistsRequest) -> Result<Value, ApiError> {
        self.post_data("/hot/playlists", Some(request)).await
    }

    /// `GET /api/info`
    pub async fn api_info(&self) -> Result<Value, ApiError> {
        self.get_data("/api/info").await
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
