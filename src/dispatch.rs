use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tracing::warn;

use crate::control::{now_ts, CommandRouter};
use crate::library::{ambience_from_json, ambience_to_json, tracks_from_json};
use crate::mixer::StreamKind;
use crate::player::Player;
use crate::state::StateAggregate;

// --- Command table -----------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    SetupSave,
    GetPlaybackState,
    GetPlaylists,
    SavePlaylist,
    GetAmbience,
    SaveAmbience,
    PlayPlaylist,
    NextSong,
    PreviousSong,
    SetShuffle,
    SetLoop,
    SetVolumeMusic,
    PlayAmbience,
    SetVolumeAmbience,
    Pause,
    Resume,
    JoinVc,
    LeaveVc,
    GetBotStatus,
    StartBot,
    StopBot,
    RebootBot,
}

impl Command {
    pub const ALL: [Command; 22] = [
        Command::SetupSave,
        Command::GetPlaybackState,
        Command::GetPlaylists,
        Command::SavePlaylist,
        Command::GetAmbience,
        Command::SaveAmbience,
        Command::PlayPlaylist,
        Command::NextSong,
        Command::PreviousSong,
        Command::SetShuffle,
        Command::SetLoop,
        Command::SetVolumeMusic,
        Command::PlayAmbience,
        Command::SetVolumeAmbience,
        Command::Pause,
        Command::Resume,
        Command::JoinVc,
        Command::LeaveVc,
        Command::GetBotStatus,
        Command::StartBot,
        Command::StopBot,
        Command::RebootBot,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::SetupSave => "SETUP_SAVE",
            Command::GetPlaybackState => "GET_PLAYBACK_STATE",
            Command::GetPlaylists => "GET_PLAYLISTS",
            Command::SavePlaylist => "SAVE_PLAYLIST",
            Command::GetAmbience => "GET_AMBIENCE",
            Command::SaveAmbience => "SAVE_AMBIENCE",
            Command::PlayPlaylist => "PLAY_PLAYLIST",
            Command::NextSong => "NEXT_SONG",
            Command::PreviousSong => "PREVIOUS_SONG",
            Command::SetShuffle => "SET_SHUFFLE",
            Command::SetLoop => "SET_LOOP",
            Command::SetVolumeMusic => "SET_VOLUME_MUSIC",
            Command::PlayAmbience => "PLAY_AMBIENCE",
            Command::SetVolumeAmbience => "SET_VOLUME_AMBIENCE",
            Command::Pause => "PAUSE",
            Command::Resume => "RESUME",
            Command::JoinVc => "JOINVC",
            Command::LeaveVc => "LEAVEVC",
            Command::GetBotStatus => "GET_BOT_STATUS",
            Command::StartBot => "START_BOT",
            Command::StopBot => "STOP_BOT",
            Command::RebootBot => "REBOOT_BOT",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Commands the dashboard may send before the bot has finished starting.
    pub fn allowed_before_ready(self) -> bool {
        matches!(
            self,
            Command::SetupSave
                | Command::GetPlaybackState
                | Command::GetPlaylists
                | Command::GetAmbience
                | Command::SaveAmbience
                | Command::GetBotStatus
                | Command::StartBot
        )
    }
}

pub fn allowed_before_ready(name: &str) -> bool {
    Command::parse(name).is_some_and(Command::allowed_before_ready)
}

// --- Reply envelopes -----------------------------------------------------------

pub fn success(command: &str, data: Value) -> Value {
    json!({ "ok": true, "command": command, "data": data, "ts": now_ts() })
}

pub fn failure(command: &str, error: impl Into<String>) -> Value {
    json!({ "ok": false, "command": command, "error": error.into(), "ts": now_ts() })
}

// --- Argument helpers --------------------------------------------------------

/// Arguments live under `args`, or inline on the frame itself.
fn args_of(frame: &Value) -> &Value {
    match frame.get("args") {
        Some(a @ Value::Object(_)) => a,
        _ => frame,
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn required_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    str_arg(args, key).ok_or_else(|| anyhow::anyhow!("Missing '{key}'"))
}

fn bool_arg(args: &Value, key: &str) -> Option<bool> {
    match args.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        _ => None,
    }
}

fn number_arg(args: &Value, key: &str) -> anyhow::Result<f64> {
    let v = args.get(key).ok_or_else(|| anyhow::anyhow!("Missing '{key}'"))?;
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    n.ok_or_else(|| anyhow::anyhow!("'{key}' must be a number, got {v}"))
}

fn stream_arg(args: &Value) -> anyhow::Result<StreamKind> {
    required_str(args, "type")?.parse()
}

// --- Dispatcher ----------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    player: Arc<Player>,
}

impl Dispatcher {
    pub fn new(player: Arc<Player>) -> Self {
        Self { player }
    }

    /// Route one frame to its handler. Always produces a reply envelope.
    pub async fn dispatch(&self, frame: &Value) -> Value {
        let name = frame.get("command").and_then(Value::as_str).unwrap_or_default();
        let Some(command) = Command::parse(name) else {
            warn!(command = name, "unknown command");
            return failure(name, "Unknown command");
        };

        match self.run(command, args_of(frame)).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(command = name, "command failed: {e:#}");
                failure(name, format!("{e:#}"))
            }
        }
    }

    fn state_reply(&self, command: Command) -> Value {
        success(command.name(), json!({ "state": self.player.snapshot() }))
    }

    async fn run(&self, command: Command, args: &Value) -> anyhow::Result<Value> {
        let player = &self.player;
        let library = player.library();

        let reply = match command {
            Command::SetupSave => {
                let settings = library.save_settings(args).await?;
                success(command.name(), json!({ "settings": settings }))
            }
            Command::GetPlaybackState => success("PLAYBACK_STATE", json!({ "state": player.snapshot() })),
            Command::GetPlaylists => {
                let playlists = library.get_playlists().await?;
                success("PLAYLISTS_DATA", json!({ "playlists": playlists }))
            }
            Command::SavePlaylist => {
                let name = required_str(args, "name")?;
                let tracks = tracks_from_json(args.get("data").unwrap_or(&Value::Null))?;
                library.save_playlist(name, tracks).await?;
                success(command.name(), json!({ "name": name }))
            }
            Command::GetAmbience => {
                let entries = library.get_ambience().await?;
                success("AMBIENCE_DATA", json!({ "ambience": ambience_to_json(&entries) }))
            }
            Command::SaveAmbience => {
                let entries = ambience_from_json(args.get("data").unwrap_or(&Value::Null))?;
                let count = entries.len();
                library.save_ambience(entries).await?;
                success(command.name(), json!({ "name": "Ambience", "count": count }))
            }
            Command::PlayPlaylist => {
                let name = required_str(args, "name")?;
                player.play_playlist(name, bool_arg(args, "shuffle").unwrap_or(false)).await?;
                self.state_reply(command)
            }
            Command::NextSong => {
                player.skip().await?;
                self.state_reply(command)
            }
            Command::PreviousSong => {
                player.previous().await?;
                self.state_reply(command)
            }
            Command::SetShuffle => {
                player.set_shuffle(bool_arg(args, "enabled")).await;
                self.state_reply(command)
            }
            Command::SetLoop => {
                player.set_loop(bool_arg(args, "enabled")).await;
                self.state_reply(command)
            }
            Command::SetVolumeMusic => {
                player.set_volume(StreamKind::Music, number_arg(args, "volume")?).await;
                self.state_reply(command)
            }
            Command::PlayAmbience => {
                let (url, title) = self.ambience_target(args).await?;
                player.play_ambience(&url, &title).await?;
                self.state_reply(command)
            }
            Command::SetVolumeAmbience => {
                player.set_volume(StreamKind::Ambience, number_arg(args, "volume")?).await;
                self.state_reply(command)
            }
            Command::Pause => {
                player.pause(stream_arg(args)?).await;
                self.state_reply(command)
            }
            Command::Resume => {
                player.resume(stream_arg(args)?).await;
                self.state_reply(command)
            }
            Command::JoinVc => {
                let channel = match str_arg(args, "channel_id") {
                    Some(c) => c.to_string(),
                    None => library
                        .settings()
                        .await?
                        .voice_channel_id
                        .ok_or_else(|| anyhow::anyhow!("Voice channel ID missing"))?,
                };
                player.join(&channel).await?;
                success("JOINEDVC", json!({ "channel_id": channel, "state": player.snapshot() }))
            }
            Command::LeaveVc => {
                player.leave().await;
                success("LEFTVC", json!({ "state": player.snapshot() }))
            }
            Command::GetBotStatus => success("BOT_STATUS", json!({ "online": player.bot_status().await })),
            Command::StartBot => success("BOT_STATUS", json!({ "online": player.start_bot().await })),
            Command::StopBot => success("BOT_STATUS", json!({ "online": player.stop_bot().await })),
            Command::RebootBot => success("BOT_STATUS", json!({ "online": player.reboot_bot().await })),
        };
        Ok(reply)
    }

    /// `url` + `title`, or a `name` looked up in the ambience library.
    async fn ambience_target(&self, args: &Value) -> anyhow::Result<(String, String)> {
        if let Some(url) = str_arg(args, "url") {
            let title = str_arg(args, "title").or_else(|| str_arg(args, "name")).unwrap_or(url);
            return Ok((url.to_string(), title.to_string()));
        }
        let name = str_arg(args, "name")
            .or_else(|| str_arg(args, "title"))
            .ok_or_else(|| anyhow::anyhow!("Missing 'url'"))?;
        let entry = self
            .player
            .library()
            .get_ambience()
            .await?
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| anyhow::anyhow!("Ambience '{name}' not found"))?;
        Ok((entry.url, entry.name))
    }
}

impl CommandRouter for Dispatcher {
    fn is_ready(&self) -> bool {
        self.player.is_ready()
    }

    fn state(&self) -> StateAggregate {
        self.player.snapshot()
    }

    fn handle(&self, frame: Value) -> BoxFuture<'_, Value> {
        Box::pin(async move {
            let name = frame
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            // A panicking handler must not take the caller down with it.
            let this = self.clone();
            match tokio::spawn(async move { this.dispatch(&frame).await }).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(command = %name, "handler aborted: {e}");
                    failure(&name, format!("handler aborted: {e}"))
                }
            }
        })
    }
}
