use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

// Ambience engine
//
// Plays a music queue and a looping ambience bed through one mixed output,
// driven remotely by the dashboard over an outbound WebSocket:
//   - control.rs keeps that connection alive and routes commands
//   - player.rs owns playback state; mixer.rs does the PCM work
//   - this file wires everything up and serves a loopback HTTP API
//     (state, queue, commands, live state feed) for local tooling.

mod config;
mod control;
mod dispatch;
mod display;
mod library;
mod mixer;
mod player;
mod queue;
mod resolver;
mod state;
mod voice;

use crate::config::Config;
use crate::control::{state_frame, CommandRouter, ControlChannel, Outbox, WsConnector, OUTBOX_CAPACITY};
use crate::dispatch::{allowed_before_ready, failure, Dispatcher};
use crate::display::{render_queue, TextDisplay, PER_PAGE};
use crate::library::Library;
use crate::mixer::Mixer;
use crate::player::Player;
use crate::resolver::YtDlp;
use crate::voice::{PipeOutput, VoiceSession};

#[derive(Clone)]
struct AppState {
    version: String,
    player: Arc<Player>,
    dispatcher: Dispatcher,
    display: Arc<TextDisplay>,
}

async fn root() -> &'static str {
    "Ambience engine is running. Try /api/v1/state"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let cfg = Config::from_env()?;
    let shutdown = CancellationToken::new();

    let mixer = Arc::new(Mixer::new(cfg.ffmpeg.clone()));
    let voice: Arc<dyn VoiceSession> = Arc::new(PipeOutput::new(cfg.ffmpeg.clone(), cfg.output_args.clone()));
    let display = Arc::new(TextDisplay::new());
    let (outbox, outbound) = Outbox::new(OUTBOX_CAPACITY, shutdown.clone());

    let player = Player::new(
        mixer,
        voice,
        Arc::new(YtDlp::new(cfg.ytdlp.clone())),
        display.clone(),
        Library::new(cfg.db_path.clone()),
        outbox.clone(),
    );
    let dispatcher = Dispatcher::new(player.clone());

    // --- Dashboard control channel ---
    let channel = ControlChannel::new(
        Arc::new(WsConnector::new(cfg.control_url.clone())),
        Arc::new(dispatcher.clone()),
        outbox,
        cfg.auth_key.clone(),
        cfg.heartbeat,
        cfg.reconnect_delay,
    );
    info!(url = %cfg.control_url, "dashboard control channel");
    let control = tokio::spawn(channel.run(outbound));

    // Commands outside the pre-ready allow-list are refused until this lands.
    {
        let player = player.clone();
        tokio::spawn(async move {
            let _ = player.boot().await;
        });
    }

    let app = build_router(AppState { version: version.clone(), player: player.clone(), dispatcher, display });

    // Loopback by default; the dashboard reaches us through the control channel.
    info!("ambience engine {version} starting on http://{}", cfg.bind);
    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    player.stop_bot().await;
    if let Err(e) = control.await {
        warn!("control channel task ended abnormally: {e}");
    }
    info!("bye");
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/version", get(version))
        .route("/api/v1/state", get(api_state))
        .route("/api/v1/queue", get(api_queue))
        .route("/api/v1/command", post(api_command))
        // Live state feed: one `state_update` frame per change.
        .route("/api/v1/events", get(api_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}

// --- Local API ---------------------------------------------------------------

async fn version(State(st): State<AppState>) -> Json<Value> {
    Json(json!({ "version": st.version }))
}

async fn api_state(State(st): State<AppState>) -> Json<Value> {
    Json(st.player.snapshot().to_json())
}

async fn api_queue(State(st): State<AppState>) -> Json<Value> {
    let queue = st.player.queue_export().await;
    let mut text = st.display.last_render();
    if text.is_empty() {
        text = render_queue(&queue, 1, PER_PAGE);
    }
    Json(json!({ "queue": queue, "text": text }))
}

/// Same envelope and readiness rules as a dashboard command frame.
async fn api_command(State(st): State<AppState>, Json(frame): Json<Value>) -> (StatusCode, Json<Value>) {
    let Some(command) = frame.get("command").and_then(Value::as_str).map(str::to_string) else {
        return (StatusCode::BAD_REQUEST, Json(failure("", "Missing 'command'")));
    };

    if !st.dispatcher.is_ready() && !allowed_before_ready(&command) {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(failure(&command, "BOT_NOT_READY")));
    }

    info!(%command, "local command");
    let reply = st.dispatcher.handle(frame).await;
    let code = if reply["ok"] == true { StatusCode::OK } else { StatusCode::UNPROCESSABLE_ENTITY };
    (code, Json(reply))
}

async fn api_events(ws: WebSocketUpgrade, State(st): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_state(socket, st.player))
}

async fn stream_state(mut socket: WebSocket, player: Arc<Player>) {
    let mut updates = player.subscribe();
    let first = state_frame(&player.snapshot());
    if socket.send(Message::Text(first.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                if socket.send(Message::Text(state_frame(&state).to_string())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // The feed is read-only; anything else from the client is ignored.
                Some(Ok(_)) => {}
            },
        }
    }
}
