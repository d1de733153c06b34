use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{allowed_before_ready, failure};
use crate::state::StateAggregate;

// --- Dashboard control channel -------------------------------------------
//
// One long-lived supervisor keeps an outbound WebSocket to the dashboard up.
// Each successful connection gets four loops (reader, sender, heartbeat and
// a command worker) that live and die together; when any of them ends the
// whole connection is torn down and the supervisor reconnects after a fixed
// delay. Commands run one at a time in arrival order.
//
// Everything else in the process talks to the dashboard through `Outbox`,
// a bounded queue that survives reconnects (its contents do not).

pub const OUTBOX_CAPACITY: usize = 256;
/// Command frames waiting for the per-connection worker.
const COMMAND_BACKLOG: usize = 64;

/// Seconds since the epoch, as the dashboard expects in `ts`.
pub fn now_ts() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

/// Strip the shared secret out of anything headed for the log.
pub fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, "****")
}

#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Value>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Outbox {
    pub fn new(capacity: usize, shutdown: CancellationToken) -> (Self, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(capacity);
        let outbox = Self { tx, connected: Arc::new(AtomicBool::new(false)), shutdown };
        (outbox, rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::Release);
    }

    /// Queue a frame for the current connection.
    ///
    /// Returns false when nothing is connected, when `drop_if_full` is set and
    /// the queue is full, or when the process is shutting down.
    pub async fn send(&self, payload: Value, drop_if_full: bool) -> bool {
        if !self.is_connected() {
            debug!("send skipped: not connected");
            return false;
        }
        if drop_if_full {
            return match self.tx.try_send(payload) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("outbound queue full, frame dropped");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            };
        }
        tokio::select! {
            r = self.tx.send(payload) => r.is_ok(),
            _ = self.shutdown.cancelled() => false,
        }
    }

    pub async fn publish_state(&self, state: &StateAggregate) -> bool {
        self.send(state_frame(state), true).await
    }
}

pub fn state_frame(state: &StateAggregate) -> Value {
    json!({ "type": "state_update", "payload": state, "ts": now_ts() })
}

/// What the reader loop needs from the rest of the process.
pub trait CommandRouter: Send + Sync {
    fn is_ready(&self) -> bool;
    fn state(&self) -> StateAggregate;
    /// Run one command frame and produce its reply envelope. Never fails;
    /// errors come back as `{"ok": false, ...}`.
    fn handle(&self, frame: Value) -> BoxFuture<'_, Value>;
}

// --- Transport ------------------------------------------------------------

pub type FrameSink = Pin<Box<dyn Sink<String, Error = anyhow::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// An open, text-framed, bidirectional connection.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, anyhow::Result<Transport>>;
}

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'_, anyhow::Result<Transport>> {
        Box::pin(async move {
            let (ws, _resp) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
            let (write, read) = ws.split();

            let sink = write
                .sink_map_err(anyhow::Error::from)
                .with(|text: String| async move { Ok::<_, anyhow::Error>(Message::text(text)) });

            // Only text frames carry protocol messages; pings are answered by
            // tungstenite itself and binary frames are ignored.
            let stream = read.filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(t)) => Some(Ok(t.as_str().to_owned())),
                    Ok(Message::Close(_)) => Some(Err(anyhow::anyhow!("dashboard closed the socket"))),
                    Ok(_) => None,
                    Err(e) => Some(Err(e.into())),
                }
            });

            Ok(Transport { sink: Box::pin(sink), stream: Box::pin(stream) })
        })
    }
}

// --- Supervisor -------------------------------------------------------------

pub struct ControlChannel {
    connector: Arc<dyn Connector>,
    router: Arc<dyn CommandRouter>,
    outbox: Outbox,
    auth_key: String,
    heartbeat: Duration,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
}

impl ControlChannel {
    pub fn new(
        connector: Arc<dyn Connector>,
        router: Arc<dyn CommandRouter>,
        outbox: Outbox,
        auth_key: impl Into<String>,
        heartbeat: Duration,
        reconnect_delay: Duration,
    ) -> Self {
        let shutdown = outbox.shutdown.clone();
        Self {
            connector,
            router,
            outbox,
            auth_key: auth_key.into(),
            heartbeat,
            reconnect_delay,
            shutdown,
        }
    }

    /// Connect, serve, reconnect. Returns only once the shutdown token fires.
    pub async fn run(self, mut rx: mpsc::Receiver<Value>) {
        let mut attempt: u64 = 0;

        while !self.shutdown.is_cancelled() {
            attempt += 1;
            debug!(attempt, "connecting to dashboard");

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = self.connector.connect() => r,
            };

            match connected {
                Ok(transport) => {
                    attempt = 0;
                    let session = Uuid::new_v4();
                    info!(%session, "control channel connected");
                    match self.serve(transport, &mut rx).await {
                        Ok(()) => info!(%session, "control channel closed"),
                        Err(e) => warn!(%session, "control channel lost: {e}"),
                    }
                }
                Err(e) => warn!(attempt, "dashboard connect failed: {e}"),
            }

            self.outbox.set_connected(false);
            let mut dropped = 0usize;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                debug!(dropped, "discarded queued frames from the old connection");
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        self.outbox.set_connected(false);
        info!("control channel stopped");
    }

    async fn serve(&self, transport: Transport, rx: &mut mpsc::Receiver<Value>) -> anyhow::Result<()> {
        let Transport { mut sink, stream } = transport;

        let hello = json!({ "type": "bot_hello", "auth": self.auth_key, "ts": now_ts() });
        sink.send(hello.to_string()).await?;
        self.outbox.set_connected(true);

        let (commands, backlog) = mpsc::channel(COMMAND_BACKLOG);

        // All loops share this task; whichever finishes first drops the rest,
        // including any reply still being produced for this connection.
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(()),
            r = self.sender_loop(&mut sink, rx) => r,
            r = self.reader_loop(stream, commands) => r,
            r = self.command_loop(backlog) => r,
            r = self.heartbeat_loop() => r,
        }
    }

    async fn sender_loop(&self, sink: &mut FrameSink, rx: &mut mpsc::Receiver<Value>) -> anyhow::Result<()> {
        while let Some(frame) = rx.recv().await {
            let text = serde_json::to_string(&frame)?;
            sink.send(text).await?;
        }
        anyhow::bail!("outbound queue closed")
    }

    async fn reader_loop(&self, mut stream: FrameStream, commands: mpsc::Sender<Value>) -> anyhow::Result<()> {
        while let Some(frame) = stream.next().await {
            let text = frame?;
            if let Some(command) = self.on_frame(&text).await {
                commands
                    .send(command)
                    .await
                    .map_err(|_| anyhow::anyhow!("command worker stopped"))?;
            }
        }
        anyhow::bail!("dashboard closed the connection")
    }

    async fn command_loop(&self, mut backlog: mpsc::Receiver<Value>) -> anyhow::Result<()> {
        while let Some(frame) = backlog.recv().await {
            let reply = self.run_command(frame).await;
            if !self.outbox.send(reply, false).await {
                debug!("reply not delivered");
            }
        }
        Ok(())
    }

    async fn heartbeat_loop(&self) -> anyhow::Result<()> {
        info!(every = ?self.heartbeat, "heartbeat started");
        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            // First tick is immediate: the dashboard gets our state on connect.
            ticker.tick().await;
            if !self.outbox.publish_state(&self.router.state()).await {
                debug!("heartbeat state push dropped");
            }
        }
    }

    /// Answer protocol frames in place. Command frames are handed back for
    /// the worker so a slow handler never delays a heartbeat ack.
    async fn on_frame(&self, text: &str) -> Option<Value> {
        let frame: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("invalid JSON from dashboard ({e}): {}", redact(text, &self.auth_key));
                return None;
            }
        };

        match frame.get("type").and_then(Value::as_str) {
            Some("heartbeat_check") => {
                self.outbox.send(json!({ "type": "heartbeat_ack", "ts": now_ts() }), false).await;
                return None;
            }
            Some("server_ack") => {
                info!("dashboard acknowledged connection");
                return None;
            }
            Some("broadcast") => {
                info!("dashboard broadcast: {}", redact(text, &self.auth_key));
                return None;
            }
            _ => {}
        }

        if frame.get("command").and_then(Value::as_str).is_none() {
            debug!("ignoring unrecognised frame: {}", redact(text, &self.auth_key));
            return None;
        }
        Some(frame)
    }

    async fn run_command(&self, frame: Value) -> Value {
        let command = frame
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if !self.router.is_ready() && !allowed_before_ready(&command) {
            warn!(%command, "command rejected: bot is not ready");
            return failure(&command, "BOT_NOT_READY");
        }

        info!(%command, "command received");
        self.router.handle(frame).await
    }
}
