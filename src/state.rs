use serde::Serialize;

use crate::mixer::StreamKind;
use crate::queue::MusicQueue;

// --- Observable state -----------------------------------------------------
//
// `StateAggregate` is what the dashboard sees (heartbeats, command replies,
// `/api/v1/state`). It is always rebuilt from the live pieces via
// `StateAggregate::project` rather than edited field by field.

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BotOnline {
    #[default]
    Offline,
    Booting,
    Online,
    Rebooting,
}

impl BotOnline {
    pub fn as_str(self) -> &'static str {
        match self {
            BotOnline::Offline => "offline",
            BotOnline::Booting => "booting",
            BotOnline::Online => "online",
            BotOnline::Rebooting => "rebooting",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MusicState {
    pub playlist_name: String,
    pub track_name: String,
    pub playing: bool,
    pub volume: u8,
    pub shuffle: bool,
    #[serde(rename = "loop")]
    pub loop_: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AmbienceState {
    pub name: String,
    pub playing: bool,
    pub volume: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StateAggregate {
    pub music: MusicState,
    pub ambience: AmbienceState,
    pub in_vc: bool,
    pub bot_online: BotOnline,
}

impl Default for StateAggregate {
    fn default() -> Self {
        Self::project(&MusicQueue::new(), &PlaybackFlags::default(), [1.0, 0.25], false)
    }
}

/// Lifecycle of one logical stream as the player drives it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamPhase {
    #[default]
    Idle,
    Resolving,
    Playing,
    Paused,
}

/// Player-owned facts that are not derivable from the queue or the mixer.
#[derive(Clone, Debug)]
pub struct PlaybackFlags {
    pub music: StreamPhase,
    pub ambience: StreamPhase,
    pub ambience_name: String,
    pub bot_online: BotOnline,
}

impl Default for PlaybackFlags {
    fn default() -> Self {
        Self {
            music: StreamPhase::Idle,
            ambience: StreamPhase::Idle,
            ambience_name: "None".into(),
            bot_online: BotOnline::Offline,
        }
    }
}

impl PlaybackFlags {
    pub fn phase(&self, stream: StreamKind) -> StreamPhase {
        match stream {
            StreamKind::Music => self.music,
            StreamKind::Ambience => self.ambience,
        }
    }

    pub fn set_phase(&mut self, stream: StreamKind, phase: StreamPhase) {
        match stream {
            StreamKind::Music => self.music = phase,
            StreamKind::Ambience => self.ambience = phase,
        }
    }

    pub fn playing(&self, stream: StreamKind) -> bool {
        self.phase(stream) == StreamPhase::Playing
    }
}

/// Map a mixer gain in [0,1] to the dashboard's 0-100 scale.
pub fn volume_percent(gain: f32) -> u8 {
    (gain.clamp(0.0, 1.0) * 100.0).round() as u8
}

impl StateAggregate {
    /// `volumes` is `[music, ambience]` as mixer gains.
    pub fn project(
        queue: &MusicQueue,
        flags: &PlaybackFlags,
        volumes: [f32; 2],
        in_vc: bool,
    ) -> Self {
        let track_name = queue
            .tracks()
            .get(queue.current_index())
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "None".into());

        Self {
            music: MusicState {
                playlist_name: queue.playlist_name().to_string(),
                track_name,
                playing: flags.playing(StreamKind::Music),
                volume: volume_percent(volumes[0]),
                shuffle: queue.is_shuffled(),
                loop_: queue.loop_current(),
            },
            ambience: AmbienceState {
                name: flags.ambience_name.clone(),
                playing: flags.playing(StreamKind::Ambience),
                volume: volume_percent(volumes[1]),
            },
            in_vc,
            bot_online: flags.bot_online,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
