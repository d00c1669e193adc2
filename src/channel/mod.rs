//! Push channel to the backend's Socket.IO endpoint.
//!
//! One [`EventChannel`] owns at most one live connection. A spawned worker
//! connects, answers engine pings, re-sends every task subscription on each
//! (re)connect and turns incoming frames into [`ChannelEvent`]s that are
//! dispatched to listeners on the worker task. When the connection drops the
//! worker reconnects with capped exponential backoff, forever, until
//! [`EventChannel::disconnect`] is called.

mod events;
pub mod frame;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

use crate::config::{ClientConfig, ConfigError, ReconnectPolicy};
use crate::task::{TaskErrorNotice, TaskId, TaskSnapshot};

pub use events::{ChannelEvent, EventBus, EventKind, Listener, ListenerId};
pub use frame::{EnginePacket, FrameError, OpenHandshake, SocketPacket};

/// Budget for the engine `open` packet and the namespace connect reply.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const SUBSCRIBE_EVENT: &str = "subscribe_task";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Invalid channel configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("No frame received for {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,
}

impl From<tungstenite::Error> for ChannelError {
    fn from(e: tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

struct Inner {
    endpoint: Url,
    policy: ReconnectPolicy,
    state: watch::Sender<ChannelState>,
    bus: EventBus,
    subscriptions: Mutex<BTreeSet<TaskId>>,
    /// Frame sender of the live session, if any.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by `disconnect`. A worker only writes state and outbound while
    /// the generation it was started with is still current.
    generation: Mutex<u64>,
}

/// Handle to the push channel. Clones share the same connection.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<Inner>,
}

impl EventChannel {
    pub fn new(endpoint: Url, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                endpoint,
                policy,
                state,
                bus: EventBus::new(),
                subscriptions: Mutex::new(BTreeSet::new()),
                outbound: Mutex::new(None),
                worker: Mutex::new(None),
                generation: Mutex::new(0),
            }),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ChannelError> {
        config.reconnect.validate()?;
        Ok(Self::new(config.socket_endpoint()?, config.reconnect.clone()))
    }

    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Start the connection worker unless one is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("Push channel worker already running");
            return;
        }

        tracing::info!(endpoint = %self.inner.endpoint, "Starting push channel");
        let inner = Arc::clone(&self.inner);
        let generation = inner.current_generation();
        *worker = Some(tokio::spawn(run(inner, generation)));
    }

    /// Stop the worker and drop the connection. Subscriptions are kept for
    /// the next [`connect`](Self::connect).
    ///
    /// `Disconnected` is emitted only if a session was actually connected.
    pub fn disconnect(&self) {
        let handle = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // The worker may be between await points on another thread; retiring
        // its generation keeps it from publishing after this point.
        let was = {
            let mut generation = self
                .inner
                .generation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *generation = generation.wrapping_add(1);
            if let Some(handle) = &handle {
                handle.abort();
            }
            self.inner.set_outbound(None);
            self.inner.state.send_replace(ChannelState::Disconnected)
        };
        if handle.is_none() {
            return;
        }

        tracing::info!(previous = %was, "Push channel disconnected by client");
        if was == ChannelState::Connected {
            self.inner.bus.emit(&ChannelEvent::Disconnected {
                reason: "client disconnect".to_string(),
            });
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Ask for push updates about `id`, now if connected and again after
    /// every reconnect.
    pub fn subscribe_task(&self, id: TaskId) {
        let fresh = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
        if fresh {
            tracing::debug!(task_id = %id, "Subscribed to task");
        }
        self.inner.send_subscribe(&id);
    }

    /// Stop re-subscribing `id` on reconnect.
    pub fn forget_task(&self, id: &TaskId) -> bool {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Drop every subscription.
    pub fn clear_subscriptions(&self) {
        let mut subscriptions = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !subscriptions.is_empty() {
            tracing::debug!(count = subscriptions.len(), "Cleared task subscriptions");
        }
        subscriptions.clear();
    }

    pub fn is_subscribed(&self, id: &TaskId) -> bool {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn subscriptions(&self) -> Vec<TaskId> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, listener)
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.inner.bus.off(kind, id)
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Wait until the channel reaches `state`.
    pub async fn wait_for_state(&self, state: ChannelState) -> Result<(), ChannelError> {
        let mut rx = self.inner.state.subscribe();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| ChannelError::Closed)
    }
}

impl Inner {
    fn current_generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` while holding the generation lock, if `generation` is current.
    fn publish<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let current = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        (*current == generation).then(f)
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Push channel state changed");
        }
    }

    fn set_outbound(&self, sender: Option<mpsc::UnboundedSender<String>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }

    /// Queue a frame on the live session. Returns false when offline.
    fn send_frame(&self, frame: String) -> bool {
        match self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn send_subscribe(&self, id: &TaskId) -> bool {
        let packet = SocketPacket::event(SUBSCRIBE_EVENT, json!({ "task_id": id }));
        self.send_frame(EnginePacket::Message(packet).encode())
    }

    fn resubscribe_all(&self) {
        let ids: Vec<TaskId> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        for id in &ids {
            self.send_subscribe(id);
        }
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Re-sent task subscriptions");
        }
    }

    /// Map a server event to a [`ChannelEvent`] and dispatch it.
    fn dispatch_event(&self, name: &str, payload: Value) {
        let event = match name {
            "task_progress" => match serde_json::from_value::<TaskSnapshot>(payload) {
                Ok(snapshot) => ChannelEvent::TaskProgress(snapshot),
                Err(e) => {
                    tracing::warn!("Ignoring malformed task_progress payload: {}", e);
                    return;
                }
            },
            "task_error" => match serde_json::from_value::<TaskErrorNotice>(payload) {
                Ok(notice) => ChannelEvent::TaskError(notice),
                Err(e) => {
                    tracing::warn!("Ignoring malformed task_error payload: {}", e);
                    return;
                }
            },
            "connected" => ChannelEvent::ServerAck(payload),
            other => {
                tracing::debug!(event = other, "Ignoring unhandled server event");
                return;
            }
        };
        self.bus.emit(&event);
    }
}

/// Connection worker: one session at a time, backoff in between.
async fn run(inner: Arc<Inner>, generation: u64) {
    let mut delay = inner.policy.initial_delay();
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        if inner
            .publish(generation, || inner.set_state(ChannelState::Connecting))
            .is_none()
        {
            return;
        }

        let mut connected = false;
        let outcome = session(&inner, generation, &mut connected).await;
        let current = inner
            .publish(generation, || {
                inner.set_outbound(None);
                inner.set_state(ChannelState::Disconnected);
            })
            .is_some();
        if !current {
            tracing::debug!("Retired push channel worker exiting");
            return;
        }

        let reason = match outcome {
            Ok(reason) => reason,
            Err(e) => e.to_string(),
        };
        if connected {
            tracing::warn!(reason = %reason, "Push channel connection lost");
            inner.bus.emit(&ChannelEvent::Disconnected {
                reason: reason.clone(),
            });
            attempt = 1;
            delay = inner.policy.initial_delay();
        }

        let wait = inner.policy.jittered(delay, rand::random::<f64>());
        tracing::warn!(
            attempt = attempt,
            delay = ?wait,
            "Push channel unavailable ({}), reconnecting",
            reason
        );
        tokio::time::sleep(wait).await;
        delay = inner.policy.next_delay(delay);
    }
}

/// Run one connection until it ends. Returns the close reason.
async fn session(
    inner: &Inner,
    generation: u64,
    connected: &mut bool,
) -> Result<String, ChannelError> {
    let (ws, _) = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::connect_async(inner.endpoint.as_str()),
    )
    .await
    .map_err(|_| ChannelError::Timeout(HANDSHAKE_TIMEOUT))??;
    let (mut sink, mut stream) = ws.split();

    let handshake = match next_packet(&mut stream, HANDSHAKE_TIMEOUT).await? {
        EnginePacket::Open(handshake) => handshake,
        other => {
            return Err(ChannelError::Handshake(format!(
                "expected open packet, got {:?}",
                other
            )))
        }
    };
    tracing::debug!(sid = %handshake.sid, "Engine.IO session opened");
    let liveness = handshake.liveness();

    let connect = EnginePacket::Message(SocketPacket::Connect(Value::Null)).encode();
    sink.send(Message::Text(connect)).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut outbound = Some(tx);

    loop {
        // Before the namespace connect is acknowledged, hold to the
        // handshake budget.
        let wait = if *connected { liveness } else { HANDSHAKE_TIMEOUT };

        tokio::select! {
            packet = next_packet(&mut stream, wait) => match packet? {
                EnginePacket::Ping(data) => {
                    sink.send(Message::Text(EnginePacket::Pong(data).encode())).await?;
                }
                EnginePacket::Close => return Ok("server closed the transport".to_string()),
                EnginePacket::Message(packet) => match packet {
                    SocketPacket::Connect(_) => {
                        let live = inner.publish(generation, || {
                            if let Some(tx) = outbound.take() {
                                inner.set_outbound(Some(tx));
                            }
                            inner.resubscribe_all();
                            inner.set_state(ChannelState::Connected);
                        });
                        if live.is_none() {
                            return Err(ChannelError::Closed);
                        }
                        *connected = true;
                        tracing::info!(endpoint = %inner.endpoint, "Push channel connected");
                        inner.bus.emit(&ChannelEvent::Connected);
                    }
                    SocketPacket::Disconnect => {
                        return Ok("server disconnected the socket".to_string())
                    }
                    SocketPacket::ConnectError(data) => {
                        return Err(ChannelError::Handshake(format!("connect refused: {}", data)))
                    }
                    SocketPacket::Event { name, payload, .. } => {
                        inner.dispatch_event(&name, payload);
                    }
                    SocketPacket::Ack { payload, .. } => {
                        inner.bus.emit(&ChannelEvent::ServerAck(payload));
                    }
                },
                EnginePacket::Open(_) | EnginePacket::Pong(_) | EnginePacket::Upgrade | EnginePacket::Noop => {}
            },
            Some(frame) = rx.recv() => {
                sink.send(Message::Text(frame)).await?;
            }
        }
    }
}

/// Next engine packet, skipping frames that do not decode.
async fn next_packet<S>(stream: &mut S, wait: Duration) -> Result<EnginePacket, ChannelError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(wait, stream.next())
            .await
            .map_err(|_| ChannelError::Timeout(wait))?;
        match message {
            Some(Ok(Message::Text(text))) => match EnginePacket::decode(&text) {
                Ok(packet) => return Ok(packet),
                Err(e) => {
                    tracing::debug!(frame = %text, "Skipping undecodable frame: {}", e);
                }
            },
            Some(Ok(Message::Close(_))) | None => return Err(ChannelError::Closed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use tokio::sync::broadcast;

    /// Frames the fake server pushes, and frames it received.
    #[derive(Clone)]
    pub(crate) struct FakeSocketIo {
        pub push: broadcast::Sender<String>,
        pub received: mpsc::UnboundedSender<String>,
    }

    async fn handle(ws: WebSocketUpgrade, server: FakeSocketIo) -> impl IntoResponse {
        ws.on_upgrade(move |socket| serve_socket(socket, server))
    }

    async fn serve_socket(mut socket: WebSocket, server: FakeSocketIo) {
        let open = r#"0{"sid":"fake","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#;
        if socket.send(WsMessage::Text(open.to_string())).await.is_err() {
            return;
        }
        let mut push = server.push.subscribe();
        loop {
            tokio::select! {
                msg = socket.recv() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if text == "40" {
                            let _ = socket.send(WsMessage::Text(r#"40{"sid":"s1"}"#.to_string())).await;
                            let _ = socket
                                .send(WsMessage::Text(r#"42["connected",{"message":"hi"}]"#.to_string()))
                                .await;
                        }
                        let _ = server.received.send(text);
                    }
                    Some(Ok(_)) => {}
                    _ => return,
                },
                frame = push.recv() => match frame {
                    Ok(frame) if frame == "close" => return,
                    Ok(frame) => {
                        if socket.send(WsMessage::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                },
            }
        }
    }

    /// Start a fake Socket.IO server. Returns the ws URL, a push handle and
    /// the stream of frames the client sent.
    pub(crate) async fn spawn_socket_server(
    ) -> (Url, broadcast::Sender<String>, mpsc::UnboundedReceiver<String>) {
        let (push, _) = broadcast::channel(64);
        let (received, received_rx) = mpsc::unbounded_channel();
        let server = FakeSocketIo {
            push: push.clone(),
            received,
        };
        let router = Router::new().route(
            "/socket.io/",
            get(move |ws: WebSocketUpgrade| {
                let server = server.clone();
                async move { handle(ws, server).await }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let url = Url::parse(&format!(
            "ws://{}/socket.io/?EIO=4&transport=websocket",
            addr
        ))
        .unwrap();
        (url, push, received_rx)
    }

    pub(crate) fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay_ms: 20,
            max_delay_ms: 100,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    async fn next_received(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn settle(channel: &EventChannel, state: ChannelState) {
        tokio::time::timeout(Duration::from_secs(5), channel.wait_for_state(state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_subscribe_and_receive_progress() {
        let (url, push, mut received) = spawn_socket_server().await;
        let channel = EventChannel::new(url, fast_policy());

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let tx = events_tx.clone();
        channel.on(EventKind::TaskProgress, move |event| {
            tx.send(event.clone())?;
            Ok(())
        });
        let tx = events_tx.clone();
        channel.on(EventKind::ServerAck, move |event| {
            tx.send(event.clone())?;
            Ok(())
        });

        channel.subscribe_task("pending-before-connect".into());
        channel.connect();
        settle(&channel, ChannelState::Connected).await;

        assert_eq!(next_received(&mut received).await, "40");
        assert_eq!(
            next_received(&mut received).await,
            r#"42["subscribe_task",{"task_id":"pending-before-connect"}]"#
        );

        channel.subscribe_task("t2".into());
        assert_eq!(
            next_received(&mut received).await,
            r#"42["subscribe_task",{"task_id":"t2"}]"#
        );

        let greeting = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(greeting, ChannelEvent::ServerAck(json!({"message": "hi"})));

        push.send(
            r#"42["task_progress",{"task_id":"t2","task_type":"music_download","status":"running","progress":50.0}]"#
                .to_string(),
        )
        .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ChannelEvent::TaskProgress(snapshot) => {
                assert_eq!(snapshot.task_id.as_str(), "t2");
                assert_eq!(snapshot.progress, 50.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        channel.disconnect();
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(!channel.is_running());
    }

    #[tokio::test]
    async fn test_answers_ping() {
        let (url, push, mut received) = spawn_socket_server().await;
        let channel = EventChannel::new(url, fast_policy());
        channel.connect();
        settle(&channel, ChannelState::Connected).await;
        assert_eq!(next_received(&mut received).await, "40");

        push.send("2".to_string()).unwrap();
        assert_eq!(next_received(&mut received).await, "3");
        channel.disconnect();
    }

    #[tokio::test]
    async fn test_reconnects_and_resubscribes() {
        let (url, push, mut received) = spawn_socket_server().await;
        let channel = EventChannel::new(url, fast_policy());
        let (tx, mut disconnects) = mpsc::unbounded_channel();
        channel.on(EventKind::Disconnected, move |event| {
            tx.send(event.clone())?;
            Ok(())
        });

        channel.subscribe_task("job".into());
        channel.connect();
        settle(&channel, ChannelState::Connected).await;
        assert_eq!(next_received(&mut received).await, "40");
        assert!(next_received(&mut received).await.contains("\"job\""));

        push.send("close".to_string()).unwrap();
        let dropped = tokio::time::timeout(Duration::from_secs(5), disconnects.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(dropped, ChannelEvent::Disconnected { .. }));

        assert_eq!(next_received(&mut received).await, "40");
        assert!(next_received(&mut received).await.contains("\"job\""));
        settle(&channel, ChannelState::Connected).await;
        channel.disconnect();
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (url, _push, mut received) = spawn_socket_server().await;
        let channel = EventChannel::new(url, fast_policy());
        channel.connect();
        channel.connect();
        settle(&channel, ChannelState::Connected).await;
        channel.connect();

        assert_eq!(next_received(&mut received).await, "40");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(received.try_recv().is_err());
        channel.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_stays_disconnected() {
        let (url, _push, mut received) = spawn_socket_server().await;
        let channel = EventChannel::new(url, fast_policy());
        let (tx, mut events) = mpsc::unbounded_channel();
        for kind in [EventKind::Connected, EventKind::Disconnected] {
            let tx = tx.clone();
            channel.on(kind, move |event| {
                tx.send(event.clone())?;
                Ok(())
            });
        }

        channel.connect();
        settle(&channel, ChannelState::Connected).await;
        assert_eq!(next_received(&mut received).await, "40");
        assert_eq!(events.recv().await.unwrap(), ChannelEvent::Connected);

        channel.disconnect();
        assert_eq!(channel.state(), ChannelState::Disconnected);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(!channel.is_running());
        settle(&channel, ChannelState::Disconnected).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Disconnected { .. }
        ));
        assert!(events.try_recv().is_err());
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retired_worker_cannot_publish() {
        let (url, _push, mut received) = spawn_socket_server().await;
        let channel = EventChannel::new(url, fast_policy());
        let stale = channel.inner.current_generation();
        channel.disconnect();

        assert!(channel
            .inner
            .publish(stale, || channel.inner.set_state(ChannelState::Connected))
            .is_none());
        assert_eq!(channel.state(), ChannelState::Disconnected);

        let worker = tokio::spawn(run(Arc::clone(&channel.inner), stale));
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_before_connected_emits_nothing() {
        let channel = EventChannel::new(
            Url::parse("ws://127.0.0.1:9/socket.io/").unwrap(),
            fast_policy(),
        );
        let (tx, mut disconnects) = mpsc::unbounded_channel();
        channel.on(EventKind::Disconnected, move |event| {
            tx.send(event.clone())?;
            Ok(())
        });

        channel.connect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_ne!(channel.state(), ChannelState::Connected);
        channel.disconnect();

        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(!channel.is_running());
        assert!(disconnects.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forget_task() {
        let channel = EventChannel::new(
            Url::parse("ws://127.0.0.1:9/socket.io/").unwrap(),
            fast_policy(),
        );
        channel.subscribe_task("a".into());
        channel.subscribe_task("b".into());
        assert!(channel.forget_task(&"a".into()));
        assert!(!channel.forget_task(&"a".into()));
        assert_eq!(channel.subscriptions(), vec![TaskId::from("b")]);
        assert_eq!(channel.state(), ChannelState::Disconnected);

        channel.clear_subscriptions();
        assert!(channel.subscriptions().is_empty());
        assert!(!channel.is_subscribed(&"b".into()));
    }
}
