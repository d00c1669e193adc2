//! Task tracker: wires the HTTP client, the push channel and the reconciler
//! together.
//!
//! Push progress is applied as it arrives. Every time the channel (re)connects
//! the full task list is polled, so updates missed while offline converge.
//! Trackers are plain values; create as many as needed (one per backend).

use std::sync::{Arc, Mutex, PoisonError, Weak};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::api::{
    ApiClient, ApiError, ArtistDownloadRequest, ClearCancelledReport, DownloadRequest,
    PlaylistDownloadRequest, ReauthHook, Submission,
};
use crate::channel::{ChannelError, ChannelEvent, EventChannel, EventKind, ListenerId};
use crate::config::ClientConfig;
use crate::task::{
    Applied, Reconciler, Task, TaskChange, TaskId, TaskSnapshot, TaskStatus, UpdateSource,
};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

struct Shared {
    api: ApiClient,
    channel: EventChannel,
    reconciler: Reconciler,
}

/// Listeners and resync worker installed by [`TaskTracker::start`].
struct Running {
    listeners: Vec<(EventKind, ListenerId)>,
    resync: JoinHandle<()>,
}

pub struct TaskTracker {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl TaskTracker {
    pub fn new(
        config: &ClientConfig,
        reauth: Option<Arc<dyn ReauthHook>>,
    ) -> Result<Self, TrackerError> {
        let mut api = ApiClient::new(config)?;
        if let Some(hook) = reauth {
            api = api.with_reauth_hook(hook);
        }
        let channel = EventChannel::from_config(config)?;
        Ok(Self::from_parts(
            api,
            channel,
            Reconciler::new(config.event_buffer),
        ))
    }

    pub fn from_parts(api: ApiClient, channel: EventChannel, reconciler: Reconciler) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                channel,
                reconciler,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.shared.api
    }

    pub fn channel(&self) -> &EventChannel {
        &self.shared.channel
    }

    /// Install channel listeners, start the resync worker and connect.
    /// Calling it again while started does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let channel = &self.shared.channel;
        let (resync_tx, resync_rx) = mpsc::unbounded_channel::<()>();
        let mut listeners = Vec::new();

        // Listeners hold a weak handle: the channel owns them, and the shared
        // state owns the channel.
        let weak = Arc::downgrade(&self.shared);
        listeners.push((
            EventKind::TaskProgress,
            channel.on(EventKind::TaskProgress, move |event| {
                if let ChannelEvent::TaskProgress(snapshot) = event {
                    if let Some(shared) = weak.upgrade() {
                        shared.apply_push(snapshot.clone());
                    }
                }
                Ok(())
            }),
        ));

        listeners.push((
            EventKind::TaskError,
            channel.on(EventKind::TaskError, |event| {
                if let ChannelEvent::TaskError(notice) = event {
                    match &notice.task_id {
                        Some(id) => {
                            tracing::warn!(task_id = %id, "Backend reported task error: {}", notice.message)
                        }
                        None => tracing::warn!("Backend reported task error: {}", notice.message),
                    }
                }
                Ok(())
            }),
        ));

        listeners.push((
            EventKind::Connected,
            channel.on(EventKind::Connected, move |_| {
                resync_tx.send(())?;
                Ok(())
            }),
        ));

        let resync = tokio::spawn(resync_loop(Arc::downgrade(&self.shared), resync_rx));
        channel.connect();

        tracing::info!(endpoint = %channel.endpoint(), "Task tracker started");
        *running = Some(Running { listeners, resync });
    }

    /// Remove listeners, stop the worker, disconnect and drop all state,
    /// including push subscriptions.
    pub fn shutdown(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            for (kind, id) in running.listeners {
                self.shared.channel.off(kind, id);
            }
            running.resync.abort();
        }
        self.shared.channel.disconnect();
        self.shared.channel.clear_subscriptions();
        self.shared.reconciler.reset();
        tracing::info!("Task tracker shut down");
    }

    pub fn is_started(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue a single-track download and track it.
    pub async fn submit_download(&self, request: DownloadRequest) -> Result<TaskId, ApiError> {
        let submission = self.shared.api.download(&request.run_async(true)).await?;
        self.track_submission("/download", submission)
    }

    /// Queue a playlist download and track it.
    pub async fn submit_playlist(
        &self,
        request: PlaylistDownloadRequest,
    ) -> Result<TaskId, ApiError> {
        let submission = self
            .shared
            .api
            .download_playlist(&request.run_async(true))
            .await?;
        self.track_submission("/playlist/download", submission)
    }

    /// Queue an artist download and track it.
    pub async fn submit_artist(&self, request: ArtistDownloadRequest) -> Result<TaskId, ApiError> {
        let submission = self
            .shared
            .api
            .download_artist(&request.run_async(true))
            .await?;
        self.track_submission("/artist/download", submission)
    }

    fn track_submission(&self, endpoint: &str, submission: Submission) -> Result<TaskId, ApiError> {
        let Submission::Queued { task_id, kind } = submission else {
            return Err(ApiError::Decode {
                endpoint: endpoint.to_string(),
                message: "backend finished the job inline instead of queueing it".to_string(),
            });
        };
        self.shared
            .reconciler
            .register_submitted(task_id.clone(), kind);
        self.shared.channel.subscribe_task(task_id.clone());
        Ok(task_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync and cancel
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch every task and apply it as an authoritative poll. Returns how
    /// many reports were accepted.
    pub async fn poll_all(&self) -> Result<usize, ApiError> {
        self.shared.poll_all().await
    }

    /// Fetch one task and apply it as a poll.
    pub async fn refresh_task(&self, id: &TaskId) -> Result<Option<Task>, ApiError> {
        let snapshot = self.shared.api.task_info(id).await?;
        self.shared.apply_poll(snapshot);
        Ok(self.shared.reconciler.get(id))
    }

    /// Ask the backend to cancel a job; on acknowledgement mark it cancelled
    /// locally. The backend may still finish the job, and its report wins.
    pub async fn cancel(&self, id: &TaskId) -> Result<Applied, ApiError> {
        if !self.shared.api.cancel_task(id).await? {
            tracing::warn!(task_id = %id, "Cancel request was not acknowledged");
            return Err(ApiError::Backend {
                endpoint: format!("/tasks/{}/cancel", id),
                status: 200,
                code: None,
                message: "cancel not acknowledged".to_string(),
            });
        }
        Ok(self.shared.reconciler.cancel_locally(id))
    }

    /// Clear cancelled jobs on the backend, then locally.
    pub async fn clear_cancelled(&self) -> Result<ClearCancelledReport, ApiError> {
        let report = self.shared.api.clear_cancelled_tasks().await?;
        let removed = self.shared.reconciler.clear_cancelled();
        for id in removed
            .iter()
            .chain(report.cleared_tasks.iter().map(|t| &t.task_id))
        {
            self.shared.channel.forget_task(id);
        }
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn tasks(&self) -> Vec<Task> {
        self.shared.reconciler.list()
    }

    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.shared.reconciler.get(id)
    }

    pub fn pending_tasks(&self) -> Vec<Task> {
        self.shared.reconciler.list_by_status(TaskStatus::Pending)
    }

    /// Pending and running tasks.
    pub fn active_tasks(&self) -> Vec<Task> {
        self.shared
            .reconciler
            .list()
            .into_iter()
            .filter(|t| !t.is_terminal())
            .collect()
    }

    pub fn changes(&self) -> broadcast::Receiver<TaskChange> {
        self.shared.reconciler.subscribe()
    }
}

impl Shared {
    fn apply_push(&self, snapshot: TaskSnapshot) {
        self.apply(snapshot, UpdateSource::Push);
    }

    fn apply_poll(&self, snapshot: TaskSnapshot) -> Applied {
        self.apply(snapshot, UpdateSource::Poll)
    }

    /// Apply a backend report, then keep the push subscription set equal to
    /// the non-terminal jobs we know about.
    fn apply(&self, snapshot: TaskSnapshot, source: UpdateSource) -> Applied {
        let id = snapshot.task_id.clone();
        let terminal = snapshot.status.is_terminal();
        let applied = self.reconciler.apply(snapshot.into_update(source));
        if terminal {
            if self.channel.forget_task(&id) {
                tracing::debug!(task_id = %id, "Task finished, dropped push subscription");
            }
        } else if !applied.is_ignored() && !self.channel.is_subscribed(&id) {
            self.channel.subscribe_task(id);
        }
        applied
    }

    async fn poll_all(&self) -> Result<usize, ApiError> {
        let snapshots = self.api.list_tasks().await?;
        let total = snapshots.len();
        let accepted = snapshots
            .into_iter()
            .map(|snapshot| self.apply_poll(snapshot))
            .filter(|applied| !applied.is_ignored())
            .count();
        tracing::debug!(total = total, accepted = accepted, "Polled task list");
        Ok(accepted)
    }
}

/// Poll the task list after every (re)connect.
async fn resync_loop(shared: Weak<Shared>, mut requests: mpsc::UnboundedReceiver<()>) {
    while requests.recv().await.is_some() {
        // Collapse a burst of reconnects into one poll.
        while requests.try_recv().is_ok() {}

        let Some(shared) = shared.upgrade() else {
            return;
        };
        match shared.poll_all().await {
            Ok(accepted) => tracing::info!(accepted = accepted, "Resynced tasks after connect"),
            Err(e) if e.is_transport() => {
                tracing::warn!("Resync after connect failed, backend unreachable: {}", e)
            }
            Err(e) => tracing::warn!("Resync after connect failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::spawn_backend;
    use crate::channel::tests::{fast_policy, spawn_socket_server};
    use crate::channel::ChannelState;
    use crate::task::TaskKind;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use url::Url;

    fn ok(data: Value) -> Json<Value> {
        Json(json!({"status": 200, "success": true, "message": "success", "data": data}))
    }

    fn tracker(api_base: &str, socket: Url) -> TaskTracker {
        let api = ApiClient::new(&ClientConfig::new(api_base)).unwrap();
        let channel = EventChannel::new(socket, fast_policy());
        TaskTracker::from_parts(api, channel, Reconciler::default())
    }

    fn offline_socket() -> Url {
        Url::parse("ws://127.0.0.1:9/socket.io/?EIO=4&transport=websocket").unwrap()
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn submit_router() -> Router {
        Router::new().route(
            "/api/playlist/download",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["async"], true);
                ok(json!({"task_id": "pl-1"}))
            }),
        )
    }

    #[tokio::test]
    async fn test_submit_registers_pending_and_subscribes() {
        let base = spawn_backend(submit_router()).await;
        let tracker = tracker(&base, offline_socket());
        let mut changes = tracker.changes();

        let id = tracker
            .submit_playlist(PlaylistDownloadRequest::new("77"))
            .await
            .unwrap();
        assert_eq!(id.as_str(), "pl-1");

        let task = tracker.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.kind, TaskKind::PlaylistBatch);
        assert_eq!(task.origin, UpdateSource::Submission);
        assert_eq!(tracker.pending_tasks().len(), 1);
        assert_eq!(tracker.channel().subscriptions(), vec![id.clone()]);

        match changes.try_recv().unwrap() {
            TaskChange::Upserted(task) => assert_eq!(task.id, id),
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inline_completion_is_not_tracked() {
        let router = Router::new().route(
            "/api/artist/download",
            post(|| async { ok(json!({"downloaded": 3})) }),
        );
        let base = spawn_backend(router).await;
        let tracker = tracker(&base, offline_socket());

        // A backend that ignores `async` answers without a task id.
        let err = tracker
            .submit_artist(ArtistDownloadRequest::new("Someone"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Decode { .. }));
        assert!(tracker.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_push_progress_and_resync_on_connect() {
        let router = submit_router().route(
            "/api/tasks",
            get(|| async {
                ok(json!({"tasks": [
                    {"task_id": "old", "task_type": "music_download", "status": "completed",
                     "progress": 100.0, "total_items": 1, "processed_items": 1}
                ]}))
            }),
        );
        let base = spawn_backend(router).await;
        let (socket, push, _received) = spawn_socket_server().await;
        let tracker = tracker(&base, socket);

        tracker.start();
        tracker.start();
        tokio::time::timeout(
            Duration::from_secs(5),
            tracker.channel().wait_for_state(ChannelState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        eventually("resync poll", || tracker.task(&"old".into()).is_some()).await;
        assert_eq!(
            tracker.task(&"old".into()).unwrap().status,
            TaskStatus::Completed
        );

        let id = tracker
            .submit_playlist(PlaylistDownloadRequest::new("77"))
            .await
            .unwrap();

        push.send(
            r#"42["task_progress",{"task_id":"pl-1","task_type":"playlist_download","status":"running","progress":50.0,"total_items":2,"processed_items":1}]"#
                .to_string(),
        )
        .unwrap();
        eventually("running push", || {
            tracker
                .task(&id)
                .is_some_and(|t| t.status == TaskStatus::Running)
        })
        .await;
        assert_eq!(tracker.active_tasks().len(), 1);

        push.send(
            r#"42["task_progress",{"task_id":"pl-1","task_type":"playlist_download","status":"completed","progress":100.0,"total_items":2,"processed_items":2}]"#
                .to_string(),
        )
        .unwrap();
        eventually("completed push", || {
            tracker
                .task(&id)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
        .await;
        assert!(tracker.channel().subscriptions().is_empty());
        assert!(tracker.active_tasks().is_empty());

        tracker.shutdown();
        assert!(!tracker.is_started());
        assert!(tracker.tasks().is_empty());
        assert_eq!(tracker.channel().state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_missed_push_converges_after_reconnect() {
        let backend_tasks = Arc::new(Mutex::new(json!({"tasks": []})));
        let state = Arc::clone(&backend_tasks);
        let router = submit_router().route(
            "/api/tasks",
            get(move || {
                let state = Arc::clone(&state);
                async move { ok(state.lock().unwrap().clone()) }
            }),
        );
        let base = spawn_backend(router).await;
        let (socket, push, mut received) = spawn_socket_server().await;
        let tracker = tracker(&base, socket);
        let (tx, mut disconnects) = mpsc::unbounded_channel();
        tracker.channel().on(EventKind::Disconnected, move |event| {
            tx.send(event.clone())?;
            Ok(())
        });

        tracker.start();
        assert_eq!(next_frame(&mut received).await, "40");
        let id = tracker
            .submit_playlist(PlaylistDownloadRequest::new("77"))
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut received).await,
            r#"42["subscribe_task",{"task_id":"pl-1"}]"#
        );

        push.send(
            r#"42["task_progress",{"task_id":"pl-1","task_type":"playlist_download","status":"running","progress":50.0,"total_items":2,"processed_items":1}]"#
                .to_string(),
        )
        .unwrap();
        eventually("running push", || {
            tracker
                .task(&id)
                .is_some_and(|t| t.status == TaskStatus::Running)
        })
        .await;

        // The job finishes while the socket is down, so its completion push
        // never arrives.
        *backend_tasks.lock().unwrap() = json!({"tasks": [
            {"task_id": "pl-1", "task_type": "playlist_download", "status": "completed",
             "progress": 100.0, "total_items": 2, "processed_items": 2}
        ]});
        push.send("close".to_string()).unwrap();
        let dropped = tokio::time::timeout(Duration::from_secs(5), disconnects.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(dropped, ChannelEvent::Disconnected { .. }));

        assert_eq!(next_frame(&mut received).await, "40");
        assert_eq!(
            next_frame(&mut received).await,
            r#"42["subscribe_task",{"task_id":"pl-1"}]"#
        );

        eventually("resync after reconnect", || {
            tracker
                .task(&id)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
        .await;
        let task = tracker.task(&id).unwrap();
        assert_eq!(task.origin, UpdateSource::Poll);
        assert_eq!(task.progress.processed_items, 2);
        assert!(tracker.channel().subscriptions().is_empty());
        assert!(tracker.active_tasks().is_empty());

        tracker.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_clears_subscriptions() {
        let base = spawn_backend(submit_router()).await;
        let tracker = tracker(&base, offline_socket());
        let (tx, mut disconnects) = mpsc::unbounded_channel();
        tracker.channel().on(EventKind::Disconnected, move |event| {
            tx.send(event.clone())?;
            Ok(())
        });

        tracker.start();
        let id = tracker
            .submit_playlist(PlaylistDownloadRequest::new("77"))
            .await
            .unwrap();
        assert!(tracker.channel().is_subscribed(&id));

        tracker.shutdown();
        assert!(tracker.channel().subscriptions().is_empty());
        assert!(tracker.tasks().is_empty());
        // The channel never got a session, so there is nothing to report.
        assert!(disconnects.try_recv().is_err());

        // A restarted tracker must not re-subscribe jobs from before.
        tracker.start();
        assert!(tracker.channel().subscriptions().is_empty());
        tracker.shutdown();
    }

    #[tokio::test]
    async fn test_poll_adopts_unknown_jobs() {
        let router = Router::new().route(
            "/api/tasks",
            get(|| async {
                ok(json!({"tasks": [
                    {"task_id": "found", "task_type": "artist_download", "status": "running",
                     "progress": 20.0, "total_items": 5, "processed_items": 1},
                    {"task_id": "done", "task_type": "music_download", "status": "failed",
                     "progress": 0.0, "error_message": "no copyright"}
                ]}))
            }),
        );
        let base = spawn_backend(router).await;
        let tracker = tracker(&base, offline_socket());

        assert_eq!(tracker.poll_all().await.unwrap(), 2);
        assert_eq!(tracker.poll_all().await.unwrap(), 2);
        assert_eq!(tracker.tasks().len(), 2);
        assert_eq!(
            tracker.task(&"done".into()).unwrap().error.unwrap().message,
            "no copyright"
        );
        assert_eq!(
            tracker.channel().subscriptions(),
            vec![TaskId::from("found")]
        );
    }

    #[tokio::test]
    async fn test_cancel_acknowledged_and_refused() {
        let acknowledge = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&acknowledge);
        let router = submit_router()
            .route(
                "/api/tasks/:id/cancel",
                post(move || {
                    let cancelled = flag.load(Ordering::SeqCst);
                    async move { ok(json!({"cancelled": cancelled})) }
                }),
            )
            .route(
                "/api/tasks/:id",
                get(|| async {
                    ok(json!({"task_id": "pl-1", "task_type": "playlist_download",
                              "status": "completed", "progress": 100.0,
                              "total_items": 2, "processed_items": 2}))
                }),
            );
        let base = spawn_backend(router).await;
        let tracker = tracker(&base, offline_socket());
        let id = tracker
            .submit_playlist(PlaylistDownloadRequest::new("77"))
            .await
            .unwrap();

        acknowledge.store(false, Ordering::SeqCst);
        let err = tracker.cancel(&id).await.unwrap_err();
        assert!(matches!(err, ApiError::Backend { .. }));
        assert_eq!(tracker.task(&id).unwrap().status, TaskStatus::Pending);

        acknowledge.store(true, Ordering::SeqCst);
        let applied = tracker.cancel(&id).await.unwrap();
        assert_eq!(applied.task().unwrap().status, TaskStatus::Cancelled);
        assert_eq!(
            tracker.task(&id).unwrap().origin,
            UpdateSource::LocalCancel
        );

        // The job had already finished; the authoritative report wins.
        let refreshed = tracker.refresh_task(&id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_clear_cancelled() {
        let router = submit_router()
            .route(
                "/api/tasks/:id/cancel",
                post(|| async { ok(json!({"cancelled": true})) }),
            )
            .route(
                "/api/tasks/clear-cancelled",
                post(|| async {
                    ok(json!({"cleared_count": 1, "total_before": 1, "total_after": 0,
                              "cleared_tasks": [{"task_id": "pl-1", "task_type": "playlist_download"}]}))
                }),
            );
        let base = spawn_backend(router).await;
        let tracker = tracker(&base, offline_socket());
        let id = tracker
            .submit_playlist(PlaylistDownloadRequest::new("77"))
            .await
            .unwrap();
        tracker.cancel(&id).await.unwrap();

        let report = tracker.clear_cancelled().await.unwrap();
        assert_eq!(report.cleared_count, 1);
        assert!(tracker.task(&id).is_none());
        assert!(tracker.channel().subscriptions().is_empty());
    }
}
