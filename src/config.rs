use std::net::SocketAddr;
use std::time::Duration;

// Process configuration.
//
// Everything comes from environment variables with sensible defaults so a bare
// `ambience-engine` starts (it will just keep retrying the dashboard until the
// URL is reachable). Runtime settings edited from the dashboard (channel IDs)
// live in SQLite instead; see `library.rs`.

#[derive(Clone, Debug)]
pub struct Config {
    /// Dashboard control-channel endpoint (`ws://` / `wss://`).
    pub control_url: String,
    /// Shared secret sent in the `bot_hello` frame. Never logged.
    pub auth_key: String,
    pub bind: SocketAddr,
    pub db_path: String,
    pub ffmpeg: String,
    pub ytdlp: String,
    /// ffmpeg output arguments for the mixed stream (e.g. `-f pulse default`).
    pub output_args: Vec<String>,
    pub heartbeat: Duration,
    pub reconnect_delay: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs(key: &str, default: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

/// `https://dash.example` -> `wss://dash.example/ipc`.
///
/// URLs that already use a WebSocket scheme are taken as-is.
pub fn control_url_from_web_url(web_url: &str) -> String {
    let trimmed = web_url.trim().trim_end_matches('/');
    if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        return trimmed.to_string();
    }
    let ws = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{trimmed}")
    };
    format!("{ws}/ipc")
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let web_url = env_or("AMBIENCE_WEB_URL", "http://127.0.0.1:8080");
        let bind: SocketAddr = env_or("AMBIENCE_BIND", "127.0.0.1:3100").parse()?;

        let output_args = env_or("AMBIENCE_OUTPUT", "-f null -")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let auth_key = std::env::var("AMBIENCE_AUTH_KEY").unwrap_or_default();
        if auth_key.is_empty() {
            tracing::warn!("AMBIENCE_AUTH_KEY is empty; the dashboard will likely reject us");
        }

        Ok(Self {
            control_url: control_url_from_web_url(&web_url),
            auth_key,
            bind,
            db_path: env_or("AMBIENCE_DB_PATH", "ambience.db"),
            ffmpeg: env_or("AMBIENCE_FFMPEG", "ffmpeg"),
            ytdlp: env_or("AMBIENCE_YTDLP", "yt-dlp"),
            output_args,
            heartbeat: env_secs("AMBIENCE_HEARTBEAT_SECS", 60),
            reconnect_delay: env_secs("AMBIENCE_RECONNECT_SECS", 5),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_url_maps_to_ipc_socket() {
        assert_eq!(control_url_from_web_url("https://dash.example"), "wss://dash.example/ipc");
        assert_eq!(control_url_from_web_url("http://localhost:8080/"), "ws://localhost:8080/ipc");
        assert_eq!(control_url_from_web_url("wss://x/custom"), "wss://x/custom");
    }
}
