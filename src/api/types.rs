//! Request and response bodies for the HTTP API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::{TaskId, TaskKind, TaskSnapshot};

/// Audio quality level understood by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Standard,
    Exhigh,
    #[default]
    Lossless,
    Hires,
    Sky,
    Jyeffect,
    Jymaster,
}

/// How a synchronous single-track download is returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnFormat {
    /// Audio bytes as an attachment
    File,
    /// Track info and a download URL as JSON
    #[default]
    Json,
}

/// How strictly an artist name must match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    ExactSingle,
    ExactMulti,
    Partial,
    All,
}

/// Which hot playlist listing to fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotPlaylistType {
    #[default]
    Personalized,
    HighQuality,
    Categories,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    pub keyword: String,
    pub limit: u32,
    pub offset: u32,
    /// Backend search type code ("1" = songs)
    #[serde(rename = "type")]
    pub search_type: String,
}

impl SearchRequest {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            limit: 30,
            offset: 0,
            search_type: "1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SongInfoRequest {
    pub id: String,
    pub level: Quality,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdRequest {
    pub id: String,
}

/// `POST /download`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadRequest {
    pub id: String,
    pub quality: Quality,
    pub format: ReturnFormat,
    #[serde(rename = "async")]
    pub run_async: bool,
}

impl DownloadRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            quality: Quality::default(),
            format: ReturnFormat::default(),
            run_async: false,
        }
    }

    pub fn quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn format(mut self, format: ReturnFormat) -> Self {
        self.format = format;
        self
    }

    pub fn run_async(mut self, run_async: bool) -> Self {
        self.run_async = run_async;
        self
    }
}

/// `POST /playlist/download`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaylistDownloadRequest {
    pub playlist_id: String,
    pub quality: Quality,
    pub include_lyric: bool,
    pub max_concurrent: u32,
    #[serde(rename = "async")]
    pub run_async: bool,
    /// Download only these songs; sent only when non-empty.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub selected_songs: Vec<u64>,
}

impl PlaylistDownloadRequest {
    pub fn new(playlist_id: impl Into<String>) -> Self {
        Self {
            playlist_id: playlist_id.into(),
            quality: Quality::default(),
            include_lyric: true,
            max_concurrent: 3,
            run_async: false,
            selected_songs: Vec::new(),
        }
    }

    pub fn quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn include_lyric(mut self, include_lyric: bool) -> Self {
        self.include_lyric = include_lyric;
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn selected_songs(mut self, songs: impl IntoIterator<Item = u64>) -> Self {
        self.selected_songs = songs.into_iter().collect();
        self
    }

    pub fn run_async(mut self, run_async: bool) -> Self {
        self.run_async = run_async;
        self
    }
}

/// `POST /artist/download`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtistDownloadRequest {
    pub artist_name: String,
    pub quality: Quality,
    /// Maximum number of songs; the backend fetches everything when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    pub match_mode: MatchMode,
    pub include_lyric: bool,
    pub max_concurrent: u32,
    #[serde(rename = "async")]
    pub run_async: bool,
}

impl ArtistDownloadRequest {
    pub fn new(artist_name: impl Into<String>) -> Self {
        Self {
            artist_name: artist_name.into(),
            quality: Quality::default(),
            limit: None,
            match_mode: MatchMode::default(),
            include_lyric: true,
            max_concurrent: 3,
            run_async: false,
        }
    }

    pub fn quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn match_mode(mut self, match_mode: MatchMode) -> Self {
        self.match_mode = match_mode;
        self
    }

    pub fn include_lyric(mut self, include_lyric: bool) -> Self {
        self.include_lyric = include_lyric;
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn run_async(mut self, run_async: bool) -> Self {
        self.run_async = run_async;
        self
    }
}

/// `POST /hot/playlists`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HotPlaylistsRequest {
    #[serde(rename = "type")]
    pub playlist_type: HotPlaylistType,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Default for HotPlaylistsRequest {
    fn default() -> Self {
        Self {
            playlist_type: HotPlaylistType::default(),
            category: "全部".to_string(),
            limit: None,
        }
    }
}

/// Outcome of a job submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Accepted for background processing; track it by id.
    Queued { task_id: TaskId, kind: TaskKind },
    /// Finished inline; the backend's result payload.
    Completed(Value),
    /// Finished inline as an audio attachment.
    File {
        filename: Option<String>,
        data: Vec<u8>,
    },
}

impl Submission {
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Queued { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// `data` of an async submission response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SubmitAck {
    pub task_id: TaskId,
}

/// `data` of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub cookie_status: Option<String>,
    #[serde(default)]
    pub downloads_dir: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl Health {
    pub fn cookie_valid(&self) -> bool {
        self.cookie_status.as_deref() == Some("valid")
    }
}

/// `data` of `GET /tasks`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TaskList {
    #[serde(default)]
    pub tasks: Vec<TaskSnapshot>,
}

/// `data` of `POST /tasks/{id}/cancel`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CancelAck {
    #[serde(default)]
    pub cancelled: bool,
}

/// One entry removed by `POST /tasks/clear-cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearedTask {
    pub task_id: TaskId,
    #[serde(default = "unknown_kind")]
    pub task_type: TaskKind,
    #[serde(default)]
    pub created_at: Option<f64>,
    #[serde(default)]
    pub cancelled_at: Option<f64>,
}

fn unknown_kind() -> TaskKind {
    TaskKind::Unknown
}

/// `data` of `POST /tasks/clear-cancelled`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearCancelledReport {
    #[serde(default)]
    pub cleared_count: usize,
    #[serde(default)]
    pub total_before: usize,
    #[serde(default)]
    pub total_after: usize,
    #[serde(default)]
    pub cleared_tasks: Vec<ClearedTask>,
}
