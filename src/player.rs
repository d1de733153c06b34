use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::Outbox;
use crate::display::QueueDisplay;
use crate::library::Library;
use crate::mixer::{Mixer, StreamKind, StreamStatus};
use crate::queue::{MusicQueue, QueueExport, Track};
use crate::resolver::StreamResolver;
use crate::state::{BotOnline, PlaybackFlags, StateAggregate, StreamPhase};
use crate::voice::VoiceSession;

// --- Playback orchestration -------------------------------------------------
//
// `Player` turns dashboard intent into mixer/voice operations. All mutable
// playback state sits behind one async mutex which is held for the whole of
// an operation (including stream resolution), so commands apply one at a
// time. Readers that only need the current picture use `snapshot()`, served
// from a watch channel that is refreshed on every change.

/// Fallback liveness poll for the end-of-track monitor.
const MONITOR_POLL: Duration = Duration::from_secs(1);
/// Pause between teardown and start during a reboot.
const REBOOT_PAUSE: Duration = Duration::from_secs(2);

struct Inner {
    queue: MusicQueue,
    flags: PlaybackFlags,
    in_vc: bool,
    monitor: Option<JoinHandle<()>>,
    /// Mixer generation of the music decoder the monitor is watching.
    music_generation: Option<u64>,
}

pub struct Player {
    mixer: Arc<Mixer>,
    voice: Arc<dyn VoiceSession>,
    resolver: Arc<dyn StreamResolver>,
    display: Arc<dyn QueueDisplay>,
    library: Library,
    outbox: Outbox,
    inner: Mutex<Inner>,
    state: watch::Sender<StateAggregate>,
    ready: AtomicBool,
    track_end: mpsc::UnboundedSender<u64>,
}

impl Player {
    /// Must be called from within a tokio runtime: it spawns the worker
    /// that advances the queue when a track ends.
    pub fn new(
        mixer: Arc<Mixer>,
        voice: Arc<dyn VoiceSession>,
        resolver: Arc<dyn StreamResolver>,
        display: Arc<dyn QueueDisplay>,
        library: Library,
        outbox: Outbox,
    ) -> Arc<Self> {
        let (track_end, ended) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(StateAggregate::default());

        let player = Arc::new(Self {
            mixer,
            voice,
            resolver,
            display,
            library,
            outbox,
            inner: Mutex::new(Inner {
                queue: MusicQueue::new(),
                flags: PlaybackFlags::default(),
                in_vc: false,
                monitor: None,
                music_generation: None,
            }),
            state,
            ready: AtomicBool::new(false),
            track_end,
        });

        tokio::spawn(advance_on_track_end(Arc::downgrade(&player), ended));
        player
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StateAggregate {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateAggregate> {
        self.state.subscribe()
    }

    pub async fn queue_export(&self) -> QueueExport {
        self.inner.lock().await.queue.export()
    }

    fn project(&self, inner: &Inner) -> StateAggregate {
        StateAggregate::project(
            &inner.queue,
            &inner.flags,
            [self.mixer.volume(StreamKind::Music), self.mixer.volume(StreamKind::Ambience)],
            inner.in_vc && self.voice.is_connected(),
        )
    }

    /// Refresh the snapshot and push it to the dashboard (best-effort).
    async fn publish(&self, inner: &Inner) {
        let state = self.project(inner);
        self.state.send_replace(state.clone());
        if !self.outbox.publish_state(&state).await {
            debug!("state push skipped");
        }
    }

    async fn refresh_display(&self, inner: &Inner) {
        if let Err(e) = self.display.update_queue_display(inner.queue.export()).await {
            warn!("queue display refresh failed: {e}");
        }
    }

    /// Make sure the voice session is pulling from the mixer.
    fn attach_output(&self) {
        if self.voice.is_connected() && !self.voice.is_playing() {
            if let Err(e) = self.voice.play(self.mixer.clone()) {
                warn!("could not attach output: {e}");
            }
        }
    }

    // --- Music ------------------------------------------------------------

    /// Replace the queue with a saved playlist. Current music stops; the new
    /// queue is not started.
    pub async fn load_playlist(&self, name: &str, shuffle: bool) -> anyhow::Result<()> {
        let tracks = self.saved_playlist(name).await?;
        let mut inner = self.inner.lock().await;
        self.replace_queue(&mut inner, tracks, name, shuffle);
        self.publish(&inner).await;
        self.refresh_display(&inner).await;
        Ok(())
    }

    /// Load a saved playlist and start its first track in one step.
    pub async fn play_playlist(&self, name: &str, shuffle: bool) -> anyhow::Result<()> {
        let tracks = self.saved_playlist(name).await?;
        let mut inner = self.inner.lock().await;
        self.replace_queue(&mut inner, tracks, name, shuffle);
        let res = self.start_current_track(&mut inner).await;
        self.publish(&inner).await;
        self.refresh_display(&inner).await;
        res
    }

    async fn saved_playlist(&self, name: &str) -> anyhow::Result<Vec<Track>> {
        self.library
            .get_playlist(name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Playlist '{name}' not found"))
    }

    fn replace_queue(&self, inner: &mut Inner, tracks: Vec<Track>, name: &str, shuffle: bool) {
        self.stop_music(inner);
        inner.queue.load(tracks, name, shuffle);
        info!(playlist = name, tracks = inner.queue.len(), shuffle, "playlist loaded");
    }

    /// Start (or restart) the queue's current track.
    pub async fn play_music(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let res = self.start_current_track(&mut inner).await;
        self.publish(&inner).await;
        self.refresh_display(&inner).await;
        res
    }

    async fn start_current_track(&self, inner: &mut Inner) -> anyhow::Result<()> {
        if !self.voice.is_connected() {
            anyhow::bail!("Not connected to a voice channel");
        }
        let track = inner
            .queue
            .get_current()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No track loaded"))?;

        let prior = inner.flags.music;
        inner.flags.music = StreamPhase::Resolving;
        let source = match self.resolver.resolve(track.url.clone()).await {
            Ok(s) => s,
            Err(e) => {
                warn!(track = %track.name, "stream resolution failed: {e}");
                inner.flags.music = prior;
                return Err(e.context(format!("could not resolve '{}'", track.name)));
            }
        };

        let Some(generation) = self.mixer.start(StreamKind::Music, &source, false) else {
            self.stop_monitor(inner);
            inner.flags.music = StreamPhase::Idle;
            anyhow::bail!("Decoder failed to start for '{}'", track.name);
        };

        inner.flags.music = StreamPhase::Playing;
        self.attach_output();
        self.watch_track(inner, generation);
        info!(track = %track.name, generation, "now playing");
        Ok(())
    }

    fn stop_monitor(&self, inner: &mut Inner) {
        if let Some(h) = inner.monitor.take() {
            h.abort();
        }
        inner.music_generation = None;
    }

    fn watch_track(&self, inner: &mut Inner, generation: u64) {
        self.stop_monitor(inner);
        inner.music_generation = Some(generation);
        inner.monitor = Some(tokio::spawn(watch_track_end(
            self.mixer.clone(),
            generation,
            self.track_end.clone(),
        )));
    }

    fn stop_music(&self, inner: &mut Inner) {
        self.stop_monitor(inner);
        self.mixer.stop(StreamKind::Music);
        inner.flags.music = StreamPhase::Idle;
    }

    async fn on_track_finished(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.music_generation != Some(generation) {
            debug!(generation, "stale track-end signal ignored");
            return;
        }
        inner.monitor = None;
        inner.music_generation = None;

        if inner.queue.next().is_some() {
            if let Err(e) = self.start_current_track(&mut inner).await {
                warn!("auto-advance failed: {e:#}");
                self.stop_music(&mut inner);
            }
        } else {
            info!("queue finished");
            self.stop_music(&mut inner);
        }

        self.publish(&inner).await;
        self.refresh_display(&inner).await;
    }

    pub async fn skip(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let res = if inner.queue.next().is_some() {
            self.start_current_track(&mut inner).await
        } else {
            self.stop_music(&mut inner);
            Ok(())
        };
        self.publish(&inner).await;
        self.refresh_display(&inner).await;
        res
    }

    /// Go back one step in history. With no history the music stops and the
    /// queue stays where it is.
    pub async fn previous(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let res = if inner.queue.previous().is_some() {
            self.start_current_track(&mut inner).await
        } else {
            debug!("no previous track");
            self.stop_music(&mut inner);
            Ok(())
        };
        self.publish(&inner).await;
        self.refresh_display(&inner).await;
        res
    }

    /// `None` toggles. Returns the resulting mode.
    pub async fn set_shuffle(&self, enabled: Option<bool>) -> bool {
        let mut inner = self.inner.lock().await;
        let target = enabled.unwrap_or(!inner.queue.is_shuffled());
        if target {
            inner.queue.shuffle();
        } else {
            inner.queue.unshuffle();
        }
        info!(shuffle = target, "shuffle mode changed");
        self.publish(&inner).await;
        self.refresh_display(&inner).await;
        target
    }

    /// `None` toggles loop-current. Returns whether the current track loops.
    pub async fn set_loop(&self, enabled: Option<bool>) -> bool {
        let mut inner = self.inner.lock().await;
        if enabled != Some(inner.queue.loop_current()) {
            let mode = inner.queue.toggle_loop_current();
            info!("loop mode: {}", mode.as_str());
        }
        let looping = inner.queue.loop_current();
        self.publish(&inner).await;
        self.refresh_display(&inner).await;
        looping
    }

    // --- Ambience ---------------------------------------------------------

    pub async fn play_ambience(&self, url: &str, title: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let res = self.start_ambience(&mut inner, url, title).await;
        self.publish(&inner).await;
        res
    }

    async fn start_ambience(&self, inner: &mut Inner, url: &str, title: &str) -> anyhow::Result<()> {
        if !self.voice.is_connected() {
            anyhow::bail!("Not connected to a voice channel");
        }

        let prior = inner.flags.ambience;
        inner.flags.ambience = StreamPhase::Resolving;
        let source = match self.resolver.resolve(url.to_string()).await {
            Ok(s) => s,
            Err(e) => {
                warn!(ambience = title, "stream resolution failed: {e}");
                inner.flags.ambience = prior;
                return Err(e.context(format!("could not resolve '{title}'")));
            }
        };

        if self.mixer.start(StreamKind::Ambience, &source, true).is_none() {
            inner.flags.ambience = StreamPhase::Idle;
            anyhow::bail!("Decoder failed to start for '{title}'");
        }

        inner.flags.ambience = StreamPhase::Playing;
        inner.flags.ambience_name = title.to_string();
        self.attach_output();
        info!(ambience = title, "ambience playing");
        Ok(())
    }

    // --- Both streams -----------------------------------------------------

    pub async fn pause(&self, stream: StreamKind) {
        let mut inner = self.inner.lock().await;
        self.mixer.pause(stream);
        if inner.flags.phase(stream) == StreamPhase::Playing {
            inner.flags.set_phase(stream, StreamPhase::Paused);
        }
        info!(stream = stream.as_str(), "paused");
        self.publish(&inner).await;
    }

    pub async fn resume(&self, stream: StreamKind) {
        let mut inner = self.inner.lock().await;
        self.mixer.resume(stream);
        if inner.flags.phase(stream) == StreamPhase::Paused {
            inner.flags.set_phase(stream, StreamPhase::Playing);
        }
        // The output pump may have died while nothing was audible.
        self.attach_output();
        info!(stream = stream.as_str(), "resumed");
        self.publish(&inner).await;
    }

    /// `percent` is on the dashboard's 0-100 scale; out-of-range values clamp.
    pub async fn set_volume(&self, stream: StreamKind, percent: f64) {
        let inner = self.inner.lock().await;
        let percent = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { 0.0 };
        self.mixer.set_volume(stream, (percent / 100.0) as f32);
        info!(stream = stream.as_str(), percent, "volume set");
        self.publish(&inner).await;
    }

    // --- Voice ------------------------------------------------------------

    pub async fn join(&self, channel_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let res = self.voice.connect(channel_id.to_string()).await;
        inner.in_vc = res.is_ok();

        match &res {
            Ok(()) => {
                info!(channel = channel_id, "joined voice channel");
                if inner.flags.playing(StreamKind::Music) || inner.flags.playing(StreamKind::Ambience) {
                    self.attach_output();
                }
            }
            Err(e) => warn!(channel = channel_id, "voice connect failed: {e}"),
        }

        self.publish(&inner).await;
        self.refresh_display(&inner).await;
        res
    }

    pub async fn leave(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown_playback(&mut inner).await;
        info!("left voice channel");
        self.publish(&inner).await;
        self.refresh_display(&inner).await;
    }

    async fn teardown_playback(&self, inner: &mut Inner) {
        self.stop_music(inner);
        self.mixer.stop(StreamKind::Ambience);
        inner.flags.ambience = StreamPhase::Idle;
        if let Err(e) = self.voice.disconnect().await {
            warn!("voice disconnect failed: {e}");
        }
        inner.in_vc = false;
    }

    // --- Bot lifecycle ----------------------------------------------------

    pub async fn bot_status(&self) -> BotOnline {
        self.inner.lock().await.flags.bot_online
    }

    async fn set_status(&self, inner: &mut Inner, status: BotOnline) {
        debug!(status = status.as_str(), "bot status");
        inner.flags.bot_online = status;
        self.ready.store(status == BotOnline::Online, Ordering::Release);
        self.publish(inner).await;
    }

    /// Bring the voice platform up and wait for the outcome.
    pub async fn boot(&self) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock().await;
            self.set_status(&mut inner, BotOnline::Booting).await;
        }
        self.bring_up().await
    }

    async fn bring_up(&self) -> anyhow::Result<()> {
        let res = self.voice.start().await;
        let mut inner = self.inner.lock().await;
        match &res {
            Ok(()) => {
                info!("bot online");
                self.set_status(&mut inner, BotOnline::Online).await;
            }
            Err(e) => {
                warn!("bot failed to start: {e}");
                self.set_status(&mut inner, BotOnline::Offline).await;
            }
        }
        res
    }

    /// Start in the background; returns the status right after the request.
    pub async fn start_bot(self: &Arc<Self>) -> BotOnline {
        let mut inner = self.inner.lock().await;
        if inner.flags.bot_online != BotOnline::Offline {
            return inner.flags.bot_online;
        }
        self.set_status(&mut inner, BotOnline::Booting).await;
        drop(inner);

        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.bring_up().await;
        });
        BotOnline::Booting
    }

    pub async fn stop_bot(&self) -> BotOnline {
        let mut inner = self.inner.lock().await;
        self.shut_down(&mut inner, BotOnline::Offline).await;
        info!("bot stopped");
        BotOnline::Offline
    }

    async fn shut_down(&self, inner: &mut Inner, status: BotOnline) {
        self.ready.store(false, Ordering::Release);
        self.teardown_playback(inner).await;
        if let Err(e) = self.voice.shutdown().await {
            warn!("voice shutdown failed: {e}");
        }
        self.set_status(inner, status).await;
        self.refresh_display(inner).await;
    }

    pub async fn reboot_bot(self: &Arc<Self>) -> BotOnline {
        let mut inner = self.inner.lock().await;
        if matches!(inner.flags.bot_online, BotOnline::Booting | BotOnline::Rebooting) {
            return inner.flags.bot_online;
        }
        self.set_status(&mut inner, BotOnline::Rebooting).await;
        drop(inner);

        let this = self.clone();
        tokio::spawn(async move {
            {
                let mut inner = this.inner.lock().await;
                this.shut_down(&mut inner, BotOnline::Rebooting).await;
            }
            tokio::time::sleep(REBOOT_PAUSE).await;
            info!("rebooting bot");
            let _ = this.bring_up().await;
        });
        BotOnline::Rebooting
    }
}

/// Waits for the decoder identified by `generation` to finish, then reports
/// it. Exits silently if the track is replaced or stopped first.
async fn watch_track_end(mixer: Arc<Mixer>, generation: u64, done: mpsc::UnboundedSender<u64>) {
    let mut exited_polls = 0u32;
    loop {
        tokio::select! {
            _ = mixer.finished(StreamKind::Music) => {}
            _ = tokio::time::sleep(MONITOR_POLL) => {}
        }

        match mixer.poll(StreamKind::Music, generation) {
            Ok(StreamStatus::Drained) => break,
            Ok(StreamStatus::Exited) => {
                // Buffered PCM may still be in the pipe; give the pump a
                // poll interval to drain it. A paused stream never drains.
                if mixer.is_paused(StreamKind::Music) {
                    continue;
                }
                exited_polls += 1;
                if exited_polls >= 2 {
                    break;
                }
            }
            Ok(StreamStatus::Running) => exited_polls = 0,
            Ok(StreamStatus::Stopped | StreamStatus::Replaced) => return,
            Err(e) => {
                warn!("music decoder poll failed, monitor exiting: {e}");
                return;
            }
        }
    }

    debug!(generation, "music track ended");
    let _ = done.send(generation);
}

async fn advance_on_track_end(player: Weak<Player>, mut ended: mpsc::UnboundedReceiver<u64>) {
    while let Some(generation) = ended.recv().await {
        let Some(player) = player.upgrade() else {
            break;
        };
        player.on_track_finished(generation).await;
    }
}

/// Fakes for the player's collaborators, shared with the dispatcher tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use futures_util::future::BoxFuture;
    use tokio_util::sync::CancellationToken;


    #[derive(Default)]
    pub(crate) struct FakeVoice {
        pub(crate) connected: AtomicBool,
        pub(crate) playing: AtomicBool,
        pub(crate) plays: AtomicUsize,
        pub(crate) refuse_start: AtomicBool,
    }

    impl VoiceSession for FakeVoice {
        fn start(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                if self.refuse_start.load(Ordering::Acquire) {
                    anyhow::bail!("login refused");
                }
                Ok(())
            })
        }

        fn shutdown(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                self.connected.store(false, Ordering::Release);
                self.playing.store(false, Ordering::Release);
                Ok(())
            })
        }

        fn connect(&self, channel_id: String) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                if channel_id == "missing" {
                    anyhow::bail!("unknown channel {channel_id}");
                }
                self.connected.store(true, Ordering::Release);
                self.playing.store(false, Ordering::Release);
                Ok(())
            })
        }

        fn disconnect(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                self.connected.store(false, Ordering::Release);
                self.playing.store(false, Ordering::Release);
                Ok(())
            })
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Acquire)
        }

        fn play(&self, _source: Arc<Mixer>) -> anyhow::Result<()> {
            self.plays.fetch_add(1, Ordering::AcqRel);
            self.playing.store(true, Ordering::Release);
            Ok(())
        }

        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::Acquire)
        }
    }

    pub(crate) struct EchoResolver;

    impl StreamResolver for EchoResolver {
        fn resolve(&self, url: String) -> BoxFuture<'_, anyhow::Result<String>> {
            Box::pin(async move {
                if url.contains("broken") {
                    anyhow::bail!("video unavailable");
                }
                Ok(url)
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingDisplay {
        pub(crate) updates: AtomicUsize,
    }

    impl QueueDisplay for CountingDisplay {
        fn update_queue_display(&self, _queue: QueueExport) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                self.updates.fetch_add(1, Ordering::AcqRel);
                Ok(())
            })
        }
    }

    pub(crate) struct Harness {
        pub(crate) _dir: tempfile::TempDir,
        pub(crate) player: Arc<Player>,
        pub(crate) voice: Arc<FakeVoice>,
        pub(crate) display: Arc<CountingDisplay>,
    }

    /// `decoder` stands in for ffmpeg: `yes` streams forever, `true` ends at once.
    pub(crate) async fn harness(decoder: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::new(dir.path().join("lib.db").to_string_lossy().to_string());
        library
            .save_playlist(
                "evening",
                vec![
                    Track::new("https://a", "A"),
                    Track::new("https://b", "B"),
                    Track::new("https://c", "C"),
                ],
            )
            .await
            .unwrap();
        library
            .save_playlist("dead", vec![Track::new("https://broken", "Gone")])
            .await
            .unwrap();
        // Auto-advance halts on the unresolvable second track.
        library
            .save_playlist(
                "stumble",
                vec![
                    Track::new("https://a", "A"),
                    Track::new("https://broken", "Gone"),
                    Track::new("https://c", "C"),
                ],
            )
            .await
            .unwrap();

        let voice = Arc::new(FakeVoice::default());
        let display = Arc::new(CountingDisplay::default());
        let (outbox, _rx) = Outbox::new(8, CancellationToken::new());
        let player = Player::new(
            Arc::new(Mixer::new(decoder)),
            voice.clone(),
            Arc::new(EchoResolver),
            display.clone(),
            library,
            outbox,
        );
        Harness { _dir: dir, player, voice, display }
    }
}
