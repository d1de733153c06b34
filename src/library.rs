use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::queue::Track;

// --- Content library (SQLite) ---------------------------------------------
//
// Saved playlists, the ambience library and the dashboard-editable bot
// settings. Nothing here touches the live queue: loading a playlist copies its
// tracks into the player's `MusicQueue`.
//
// rusqlite is synchronous, so every public method hops onto the blocking pool
// and opens its own connection. Schema creation is idempotent and runs on
// every open.

pub const SETTING_KEYS: [&str; 3] = ["voice_channel_id", "text_channel_id", "queue_message_id"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbienceEntry {
    pub name: String,
    pub url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BotSettings {
    pub voice_channel_id: Option<String>,
    pub text_channel_id: Option<String>,
    pub queue_message_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Library {
    path: String,
}

fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        -- One row per saved playlist, so an empty one still exists.
        CREATE TABLE IF NOT EXISTS playlists (
            name TEXT PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS playlist_tracks (
            playlist TEXT NOT NULL,
            position INTEGER NOT NULL,
            url      TEXT NOT NULL,
            title    TEXT NOT NULL,
            PRIMARY KEY (playlist, position)
        );

        CREATE TABLE IF NOT EXISTS ambience (
            position INTEGER PRIMARY KEY,
            name     TEXT NOT NULL,
            url      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS bot_settings (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        INSERT OR IGNORE INTO playlists (name)
            SELECT playlist FROM playlist_tracks GROUP BY playlist ORDER BY MIN(rowid);
        "#,
    )
}

fn open(path: &str) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)?;
    db_init(&conn)?;
    Ok(conn)
}

fn db_load_playlists(conn: &Connection) -> anyhow::Result<Map<String, Value>> {
    let mut out = Map::new();
    let mut names = conn.prepare("SELECT name FROM playlists ORDER BY rowid ASC")?;
    for name in names.query_map([], |row| row.get::<_, String>(0))? {
        out.insert(name?, Value::Object(Map::new()));
    }

    let mut stmt = conn.prepare(
        "SELECT playlist, url, title FROM playlist_tracks ORDER BY playlist ASC, position ASC",
    )?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let playlist: String = row.get(0)?;
        let url: String = row.get(1)?;
        let title: String = row.get(2)?;
        let entry = out
            .entry(playlist)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(tracks) = entry {
            tracks.insert(url, Value::String(title));
        }
    }
    Ok(out)
}

fn db_load_playlist(conn: &Connection, name: &str) -> anyhow::Result<Option<Vec<Track>>> {
    let mut stmt = conn.prepare(
        "SELECT url, title FROM playlist_tracks WHERE playlist = ?1 ORDER BY position ASC",
    )?;
    let tracks = stmt
        .query_map([name], |row| Ok(Track { url: row.get(0)?, name: row.get(1)? }))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if tracks.is_empty() {
        let known: Option<i64> = conn
            .query_row("SELECT 1 FROM playlists WHERE name = ?1", [name], |row| row.get(0))
            .optional()?;
        return Ok(known.map(|_| tracks));
    }
    Ok(Some(tracks))
}

fn db_save_playlist(conn: &mut Connection, name: &str, tracks: &[Track]) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    tx.execute("INSERT OR IGNORE INTO playlists (name) VALUES (?1)", [name])?;
    tx.execute("DELETE FROM playlist_tracks WHERE playlist = ?1", [name])?;
    for (position, t) in tracks.iter().enumerate() {
        tx.execute(
            "INSERT INTO playlist_tracks (playlist, position, url, title) VALUES (?1, ?2, ?3, ?4)",
            params![name, position as i64, t.url, t.name],
        )?;
    }
    tx.commit()?;
    Ok(())
}

fn db_load_ambience(conn: &Connection) -> anyhow::Result<Vec<AmbienceEntry>> {
    let mut stmt = conn.prepare("SELECT name, url FROM ambience ORDER BY position ASC")?;
    let out = stmt
        .query_map([], |row| Ok(AmbienceEntry { name: row.get(0)?, url: row.get(1)? }))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(out)
}

fn db_save_ambience(conn: &mut Connection, entries: &[AmbienceEntry]) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM ambience", [])?;
    for (position, e) in entries.iter().enumerate() {
        tx.execute(
            "INSERT INTO ambience (position, name, url) VALUES (?1, ?2, ?3)",
            params![position as i64, e.name, e.url],
        )?;
    }
    tx.commit()?;
    Ok(())
}

fn db_load_settings(conn: &Connection) -> anyhow::Result<BotSettings> {
    let get = |key: &str| -> anyhow::Result<Option<String>> {
        Ok(conn
            .query_row("SELECT value FROM bot_settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()?)
    };
    Ok(BotSettings {
        voice_channel_id: get("voice_channel_id")?,
        text_channel_id: get("text_channel_id")?,
        queue_message_id: get("queue_message_id")?,
    })
}

fn db_merge_settings(conn: &mut Connection, updates: &[(String, String)]) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    for (key, value) in updates {
        tx.execute(
            "INSERT INTO bot_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// `{url: title, ...}` from the dashboard, in the order it was sent.
pub fn tracks_from_json(v: &Value) -> anyhow::Result<Vec<Track>> {
    let Value::Object(map) = v else {
        anyhow::bail!("playlist data must be an object of url -> title");
    };
    map.iter()
        .map(|(url, title)| match title {
            Value::String(t) => Ok(Track::new(url.clone(), t.clone())),
            other => anyhow::bail!("invalid title for {url}: {other}"),
        })
        .collect()
}

/// `{name: url, ...}` from the dashboard, in the order it was sent.
pub fn ambience_from_json(v: &Value) -> anyhow::Result<Vec<AmbienceEntry>> {
    let Value::Object(map) = v else {
        anyhow::bail!("ambience data must be an object of name -> url");
    };
    map.iter()
        .map(|(name, url)| match url {
            Value::String(u) => Ok(AmbienceEntry { name: name.clone(), url: u.clone() }),
            other => anyhow::bail!("invalid url for {name}: {other}"),
        })
        .collect()
}

pub fn ambience_to_json(entries: &[AmbienceEntry]) -> Value {
    let mut map = Map::new();
    for e in entries {
        map.insert(e.name.clone(), Value::String(e.url.clone()));
    }
    Value::Object(map)
}

/// Setting values arrive as strings or numbers; empty/null means "leave as is".
fn setting_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() && s != "None" => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Library {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| anyhow::anyhow!("sqlite task failed: {e}"))?
    }

    /// All playlists as `{name: {url: title}}`.
    pub async fn get_playlists(&self) -> anyhow::Result<Map<String, Value>> {
        self.with_conn(|conn| db_load_playlists(conn)).await
    }

    pub async fn get_playlist(&self, name: &str) -> anyhow::Result<Option<Vec<Track>>> {
        let name = name.to_string();
        self.with_conn(move |conn| db_load_playlist(conn, &name)).await
    }

    pub async fn save_playlist(&self, name: &str, tracks: Vec<Track>) -> anyhow::Result<()> {
        let name = name.trim().to_string();
        if name.is_empty() {
            anyhow::bail!("playlist name is empty");
        }
        let count = tracks.len();
        self.with_conn({
            let name = name.clone();
            move |conn| db_save_playlist(conn, &name, &tracks)
        })
        .await?;
        tracing::info!("saved playlist '{name}' ({count} tracks)");
        Ok(())
    }

    pub async fn get_ambience(&self) -> anyhow::Result<Vec<AmbienceEntry>> {
        self.with_conn(|conn| db_load_ambience(conn)).await
    }

    pub async fn save_ambience(&self, entries: Vec<AmbienceEntry>) -> anyhow::Result<()> {
        let count = entries.len();
        self.with_conn(move |conn| db_save_ambience(conn, &entries)).await?;
        tracing::info!("saved ambience library ({count} entries)");
        Ok(())
    }

    pub async fn settings(&self) -> anyhow::Result<BotSettings> {
        self.with_conn(|conn| db_load_settings(conn)).await
    }

    /// Merge known keys from a `SETUP_SAVE` payload. Unknown keys and empty
    /// values are ignored. Returns the stored settings afterwards.
    pub async fn save_settings(&self, args: &Value) -> anyhow::Result<BotSettings> {
        let updates: Vec<(String, String)> = SETTING_KEYS
            .iter()
            .filter_map(|k| args.get(*k).and_then(setting_value).map(|v| (k.to_string(), v)))
            .collect();

        self.with_conn(move |conn| {
            db_merge_settings(conn, &updates)?;
            db_load_settings(conn)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_library() -> (tempfile::TempDir, Library) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.db");
        let lib = Library::new(path.to_string_lossy().to_string());
        (dir, lib)
    }

    #[tokio::test]
    async fn playlists_round_trip_in_order() {
        let (_dir, lib) = temp_library();
        let data = json!({"https://z": "Zed", "https://a": "Ay", "https://m": "Em"});
        let tracks = tracks_from_json(&data).unwrap();
        lib.save_playlist("focus", tracks.clone()).await.unwrap();

        let loaded = lib.get_playlist("focus").await.unwrap().unwrap();
        assert_eq!(loaded, tracks);
        assert_eq!(loaded[0].name, "Zed");

        let all = lib.get_playlists().await.unwrap();
        let keys: Vec<_> = all["focus"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["https://z", "https://a", "https://m"]);
    }

    #[tokio::test]
    async fn saving_replaces_existing_playlist() {
        let (_dir, lib) = temp_library();
        lib.save_playlist("p", vec![Track::new("1", "one"), Track::new("2", "two")]).await.unwrap();
        lib.save_playlist("p", vec![Track::new("3", "three")]).await.unwrap();
        let loaded = lib.get_playlist("p").await.unwrap().unwrap();
        assert_eq!(loaded, vec![Track::new("3", "three")]);
    }

    #[tokio::test]
    async fn missing_playlist_is_none() {
        let (_dir, lib) = temp_library();
        assert!(lib.get_playlist("nope").await.unwrap().is_none());
        assert!(lib.save_playlist("  ", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn empty_playlist_is_kept() {
        let (_dir, lib) = temp_library();
        lib.save_playlist("first", vec![Track::new("1", "one")]).await.unwrap();
        lib.save_playlist("later", tracks_from_json(&json!({})).unwrap()).await.unwrap();

        assert_eq!(lib.get_playlist("later").await.unwrap(), Some(vec![]));
        let all = lib.get_playlists().await.unwrap();
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec!["first", "later"]);
        assert_eq!(all["later"], json!({}));

        // Emptying an existing playlist keeps its place.
        lib.save_playlist("first", vec![]).await.unwrap();
        assert_eq!(lib.get_playlist("first").await.unwrap(), Some(vec![]));
        assert_eq!(lib.get_playlists().await.unwrap().keys().next().map(String::as_str), Some("first"));
    }

    #[tokio::test]
    async fn ambience_round_trip() {
        let (_dir, lib) = temp_library();
        let entries = ambience_from_json(&json!({"Rain": "https://rain", "Fire": "https://fire"})).unwrap();
        lib.save_ambience(entries.clone()).await.unwrap();
        let loaded = lib.get_ambience().await.unwrap();
        assert_eq!(loaded, entries);
        assert_eq!(ambience_to_json(&loaded), json!({"Rain": "https://rain", "Fire": "https://fire"}));
    }

    #[tokio::test]
    async fn settings_merge_ignores_empty_values() {
        let (_dir, lib) = temp_library();
        lib.save_settings(&json!({"voice_channel_id": 123, "text_channel_id": "456"})).await.unwrap();
        let s = lib
            .save_settings(&json!({"voice_channel_id": "", "text_channel_id": "789", "bogus": "x"}))
            .await
            .unwrap();
        assert_eq!(s.voice_channel_id.as_deref(), Some("123"));
        assert_eq!(s.text_channel_id.as_deref(), Some("789"));
        assert_eq!(s.queue_message_id, None);
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(tracks_from_json(&json!(["a", "b"])).is_err());
        assert!(tracks_from_json(&json!({"u": 5})).is_err());
        assert!(ambience_from_json(&json!("rain")).is_err());
    }
}
