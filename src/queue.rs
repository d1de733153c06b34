use serde::{Deserialize, Serialize};

// --- Track queue ---------------------------------------------------------
//
// Pure playlist/navigation state for the music stream. Nothing in here
// touches processes, sockets or the filesystem; the player owns one
// `MusicQueue` and mutates it under its own lock.

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub url: String,
    pub name: String,
}

impl Track {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self { url: url.into(), name: name.into() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    CurrentTrack,
    Playlist,
}

impl LoopMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopMode::CurrentTrack => "current track",
            LoopMode::Playlist => "playlist",
        }
    }
}

/// Read-only view of the queue for the dashboard and the queue display.
#[derive(Clone, Debug, Serialize)]
pub struct QueueExport {
    pub playlist_name: String,
    pub tracks: Vec<Track>,
    pub current_index: usize,
    pub previous_stack: Vec<usize>,
    pub loop_current: bool,
    pub shuffle_mode: bool,
}

#[derive(Clone, Debug)]
pub struct MusicQueue {
    playlist_name: String,
    tracks: Vec<Track>,
    original_order: Vec<Track>,
    current_index: usize,
    history: Vec<usize>,
    loop_current: bool,
    loop_playlist: bool,
    shuffled: bool,
}

impl Default for MusicQueue {
    fn default() -> Self {
        Self {
            playlist_name: "None".into(),
            tracks: Vec::new(),
            original_order: Vec::new(),
            current_index: 0,
            history: Vec::new(),
            loop_current: false,
            loop_playlist: true,
            shuffled: false,
        }
    }
}

impl MusicQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole queue. Loop flags survive a reload; position and
    /// history do not.
    pub fn load(&mut self, tracks: Vec<Track>, playlist_name: &str, shuffle_on_load: bool) {
        self.playlist_name = playlist_name.to_string();
        self.original_order = tracks.clone();
        self.tracks = tracks;
        self.current_index = 0;
        self.history.clear();
        self.shuffled = false;

        if shuffle_on_load {
            self.shuffle();
        }
    }

    /// Current track, clamping a drifted index back onto the last entry.
    pub fn get_current(&mut self) -> Option<&Track> {
        if self.tracks.is_empty() {
            self.current_index = 0;
            return None;
        }
        if self.current_index >= self.tracks.len() {
            self.current_index = self.tracks.len() - 1;
        }
        self.tracks.get(self.current_index)
    }

    /// Randomise everything except the current track, which moves to the front.
    /// Turns shuffle mode on even when there is nothing to permute.
    pub fn shuffle(&mut self) {
        self.shuffled = true;
        if self.tracks.len() <= 1 {
            return;
        }
        if self.current_index >= self.tracks.len() {
            self.current_index = self.tracks.len() - 1;
        }

        let current = self.tracks.remove(self.current_index);
        fastrand::shuffle(&mut self.tracks);
        self.tracks.insert(0, current);
        self.current_index = 0;
    }

    /// Restore the load order and keep pointing at the same track (matched by URL).
    pub fn unshuffle(&mut self) {
        self.shuffled = false;
        if self.original_order.is_empty() {
            return;
        }
        let current_url = self.get_current().map(|t| t.url.clone());
        self.tracks = self.original_order.clone();

        if let Some(url) = current_url {
            if let Some(pos) = self.tracks.iter().position(|t| t.url == url) {
                self.current_index = pos;
            }
        }
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffled
    }

    pub fn next(&mut self) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }
        if self.loop_current {
            return self.get_current();
        }

        self.history.push(self.current_index);
        self.current_index += 1;

        if self.current_index >= self.tracks.len() {
            self.current_index = if self.loop_playlist { 0 } else { self.tracks.len() - 1 };
        }

        self.get_current()
    }

    pub fn previous(&mut self) -> Option<&Track> {
        let idx = self.history.pop()?;
        self.current_index = idx;
        self.get_current()
    }

    pub fn toggle_loop_current(&mut self) -> LoopMode {
        self.loop_current = !self.loop_current;
        self.loop_playlist = !self.loop_current;
        self.loop_mode()
    }

    pub fn loop_mode(&self) -> LoopMode {
        if self.loop_current {
            LoopMode::CurrentTrack
        } else {
            LoopMode::Playlist
        }
    }

    pub fn loop_current(&self) -> bool {
        self.loop_current
    }

    pub fn playlist_name(&self) -> &str {
        &self.playlist_name
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn export(&self) -> QueueExport {
        QueueExport {
            playlist_name: self.playlist_name.clone(),
            tracks: self.tracks.clone(),
            current_index: self.current_index,
            previous_stack: self.history.clone(),
            loop_current: self.loop_current,
            shuffle_mode: self.is_shuffled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc() -> Vec<Track> {
        vec![
            Track::new("https://a", "A"),
            Track::new("https://b", "B"),
            Track::new("https://c", "C"),
        ]
    }

    fn many(n: usize) -> Vec<Track> {
        (0..n).map(|i| Track::new(format!("https://t/{i}"), format!("T{i}"))).collect()
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let mut q = MusicQueue::new();
        assert!(q.get_current().is_none());
        assert!(q.next().is_none());
        assert!(q.previous().is_none());
        assert_eq!(q.current_index(), 0);
    }

    #[test]
    fn next_and_previous_walk_history() {
        let mut q = MusicQueue::new();
        q.load(abc(), "abc", false);
        assert_eq!(q.get_current().unwrap().name, "A");

        assert_eq!(q.next().unwrap().name, "B");
        assert_eq!(q.history, [0]);
        assert_eq!(q.next().unwrap().name, "C");
        assert_eq!(q.history, [0, 1]);

        assert_eq!(q.previous().unwrap().name, "B");
        assert_eq!(q.history, [0]);
        assert_eq!(q.previous().unwrap().name, "A");
        assert!(q.history.is_empty());

        assert!(q.previous().is_none());
        assert_eq!(q.get_current().unwrap().name, "A");
    }

    #[test]
    fn next_cycles_back_when_looping_playlist() {
        for n in 1..6 {
            let mut q = MusicQueue::new();
            q.load(many(n), "cycle", false);
            q.next();
            let start = q.get_current().unwrap().clone();
            for _ in 0..n {
                q.next();
            }
            assert_eq!(q.get_current().unwrap(), &start, "len {n}");
        }
    }

    #[test]
    fn next_stops_at_end_without_playlist_loop() {
        let mut q = MusicQueue::new();
        q.load(abc(), "abc", false);
        q.toggle_loop_current();
        q.toggle_loop_current();
        // Back to playlist looping; force it off to test the clamp path.
        q.loop_playlist = false;

        q.next();
        q.next();
        assert_eq!(q.next().unwrap().name, "C");
        assert_eq!(q.current_index(), 2);
    }

    #[test]
    fn loop_current_repeats_without_touching_history() {
        let mut q = MusicQueue::new();
        q.load(abc(), "abc", false);
        assert_eq!(q.toggle_loop_current(), LoopMode::CurrentTrack);
        assert_eq!(q.next().unwrap().name, "A");
        assert_eq!(q.next().unwrap().name, "A");
        assert!(q.history.is_empty());
    }

    #[test]
    fn toggle_loop_is_self_inverse() {
        let mut q = MusicQueue::new();
        let before = (q.loop_current(), q.loop_playlist);
        assert_eq!(q.toggle_loop_current().as_str(), "current track");
        assert_ne!(q.loop_current(), q.loop_playlist);
        assert_eq!(q.toggle_loop_current().as_str(), "playlist");
        assert_ne!(q.loop_current(), q.loop_playlist);
        assert_eq!((q.loop_current(), q.loop_playlist), before);
    }

    #[test]
    fn shuffle_keeps_current_first_and_unshuffle_restores() {
        let mut q = MusicQueue::new();
        q.load(many(20), "big", false);
        q.next();
        q.next();
        let current = q.get_current().unwrap().url.clone();

        q.shuffle();
        assert_eq!(q.current_index(), 0);
        assert_eq!(q.get_current().unwrap().url, current);
        assert_eq!(q.len(), 20);

        q.unshuffle();
        assert_eq!(q.tracks(), many(20).as_slice());
        assert_eq!(q.get_current().unwrap().url, current);
        assert!(!q.is_shuffled());
    }

    #[test]
    fn shuffle_is_noop_for_single_track() {
        let mut q = MusicQueue::new();
        q.load(many(1), "one", true);
        assert_eq!(q.tracks(), many(1).as_slice());
        assert!(q.is_shuffled());
        q.unshuffle();
        assert!(!q.is_shuffled());
    }

    #[test]
    fn load_resets_position_and_history() {
        let mut q = MusicQueue::new();
        q.load(abc(), "abc", false);
        q.next();
        q.load(many(4), "four", false);
        assert_eq!(q.current_index(), 0);
        assert!(q.history.is_empty());
        assert_eq!(q.playlist_name(), "four");
    }

    #[test]
    fn get_current_heals_out_of_range_index() {
        let mut q = MusicQueue::new();
        q.load(abc(), "abc", false);
        q.current_index = 9;
        assert_eq!(q.get_current().unwrap().name, "C");
        assert_eq!(q.current_index(), 2);
    }

    #[test]
    fn export_reports_shuffle_mode() {
        let mut q = MusicQueue::new();
        q.load(abc(), "abc", false);
        let e = q.export();
        assert_eq!(e.playlist_name, "abc");
        assert!(!e.shuffle_mode);
        assert_eq!(e.tracks.len(), 3);
    }
}
