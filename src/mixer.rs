use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

// --- Dual-stream PCM mixer -----------------------------------------------
//
// Two ffmpeg decoders (music + ambience) write s16le stereo @ 48 kHz into
// pipes. The output sink pulls one 20 ms frame at a time via `read_into`,
// from its own thread, while the player mutates volume/pause/process state
// from tokio tasks.
//
// Locking discipline per stream:
//   - `child`  guards the process handle (spawn/kill/poll). Never held while
//     reading PCM.
//   - `reader` guards the pipe. `read_into` holds it for exactly one frame;
//     `start`/`stop` kill the process first (which unblocks a pending read
//     with EOF) and only then take `reader` to swap/drop the pipe.
//   - `volume`/`paused` are lone atomics, so every frame sees a fresh value.

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;
/// 20 ms @ 48 kHz.
pub const FRAME_SAMPLES: usize = 960;
pub const FRAME_BYTES: usize = FRAME_SAMPLES * CHANNELS * 2;

pub const DEFAULT_MUSIC_VOLUME: f32 = 1.0;
pub const DEFAULT_AMBIENCE_VOLUME: f32 = 0.25;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Music,
    Ambience,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Music => "music",
            StreamKind::Ambience => "ambience",
        }
    }
}

impl std::str::FromStr for StreamKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "music" => Ok(StreamKind::Music),
            "ambience" => Ok(StreamKind::Ambience),
            other => anyhow::bail!("unknown track type: {other}"),
        }
    }
}

/// What the end-of-track monitor sees when it polls a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    /// No decoder for this stream.
    Stopped,
    /// A newer `start` replaced the decoder the caller is watching.
    Replaced,
    Running,
    /// The process exited; its pipe may still hold buffered PCM.
    Exited,
    /// The pipe hit EOF: every byte the decoder produced has been mixed.
    Drained,
}

struct PipeSlot {
    generation: u64,
    pipe: Box<dyn Read + Send>,
}

struct Channel {
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<PipeSlot>>,
    volume: AtomicU32,
    paused: AtomicBool,
    generation: AtomicU64,
    drained_generation: AtomicU64,
    finished: Notify,
}

impl Channel {
    fn new(volume: f32) -> Self {
        Self {
            child: Mutex::new(None),
            reader: Mutex::new(None),
            volume: AtomicU32::new(volume.to_bits()),
            paused: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            drained_generation: AtomicU64::new(0),
            finished: Notify::new(),
        }
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }

    /// Fill `buf` with one frame of this stream (silence when idle/paused).
    /// Returns the number of real bytes read before zero padding.
    fn pull(&self, buf: &mut [u8]) -> usize {
        buf.fill(0);
        if self.paused.load(Ordering::Acquire) {
            return 0;
        }

        let mut slot = lock(&self.reader);
        let Some(s) = slot.as_mut() else {
            return 0;
        };

        let n = read_full(&mut s.pipe, buf);
        if n == 0 {
            // EOF (or a broken pipe). Drop the pipe so later frames are cheap
            // silence, and tell whoever is waiting for this generation.
            let generation = s.generation;
            *slot = None;
            drop(slot);
            self.drained_generation.store(generation, Ordering::Release);
            self.finished.notify_one();
        }
        n
    }
}

pub struct Mixer {
    ffmpeg: String,
    music: Channel,
    ambience: Channel,
}

impl Mixer {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            music: Channel::new(DEFAULT_MUSIC_VOLUME),
            ambience: Channel::new(DEFAULT_AMBIENCE_VOLUME),
        }
    }

    fn channel(&self, stream: StreamKind) -> &Channel {
        match stream {
            StreamKind::Music => &self.music,
            StreamKind::Ambience => &self.ambience,
        }
    }

    /// Replace the decoder for `stream`. Returns the generation that identifies
    /// this particular decoder, or `None` if ffmpeg could not be launched (the
    /// stream is then left stopped).
    pub fn start(&self, stream: StreamKind, source_url: &str, looped: bool) -> Option<u64> {
        self.stop(stream);

        match spawn_ffmpeg_decoder(&self.ffmpeg, source_url, looped) {
            Ok((child, stdout)) => {
                let generation = self.install(stream, Some(child), Box::new(stdout));
                info!(stream = stream.as_str(), generation, looped, "decoder started");
                Some(generation)
            }
            Err(e) => {
                warn!(stream = stream.as_str(), "decoder spawn failed: {e}");
                None
            }
        }
    }

    /// Attach a PCM pipe (and optionally the process behind it) to a stream.
    pub(crate) fn install(
        &self,
        stream: StreamKind,
        child: Option<Child>,
        pipe: Box<dyn Read + Send>,
    ) -> u64 {
        let ch = self.channel(stream);
        let generation = ch.generation.fetch_add(1, Ordering::AcqRel) + 1;

        *lock(&ch.child) = child;
        *lock(&ch.reader) = Some(PipeSlot { generation, pipe });
        ch.paused.store(false, Ordering::Release);
        generation
    }

    pub fn stop(&self, stream: StreamKind) {
        let ch = self.channel(stream);

        // Kill first so a frame read blocked on this pipe returns promptly.
        let child = lock(&ch.child).take();
        if let Some(mut child) = child {
            let _ = child.kill();
            let _ = child.wait();
            debug!(stream = stream.as_str(), "decoder killed");
        }

        lock(&ch.reader).take();
    }

    pub fn stop_all(&self) {
        self.stop(StreamKind::Music);
        self.stop(StreamKind::Ambience);
    }

    pub fn set_volume(&self, stream: StreamKind, volume: f32) {
        let v = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 0.0 };
        self.channel(stream).volume.store(v.to_bits(), Ordering::Release);
    }

    pub fn volume(&self, stream: StreamKind) -> f32 {
        self.channel(stream).volume()
    }

    pub fn pause(&self, stream: StreamKind) {
        self.channel(stream).paused.store(true, Ordering::Release);
    }

    pub fn resume(&self, stream: StreamKind) {
        self.channel(stream).paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self, stream: StreamKind) -> bool {
        self.channel(stream).paused.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn has_source(&self, stream: StreamKind) -> bool {
        lock(&self.channel(stream).reader).is_some()
    }

    /// Liveness of the decoder identified by `generation`.
    ///
    /// Errors only when the OS refuses to report on the child process.
    pub fn poll(&self, stream: StreamKind, generation: u64) -> anyhow::Result<StreamStatus> {
        let ch = self.channel(stream);
        if ch.generation.load(Ordering::Acquire) != generation {
            return Ok(StreamStatus::Replaced);
        }
        if ch.drained_generation.load(Ordering::Acquire) == generation {
            return Ok(StreamStatus::Drained);
        }

        let mut child = lock(&ch.child);
        match child.as_mut() {
            None => {
                // Pipe-only sources (no process) are alive as long as the pipe is.
                if lock(&ch.reader).is_some() {
                    Ok(StreamStatus::Running)
                } else {
                    Ok(StreamStatus::Stopped)
                }
            }
            Some(c) => match c.try_wait()? {
                Some(_) => Ok(StreamStatus::Exited),
                None => Ok(StreamStatus::Running),
            },
        }
    }

    /// Resolves when a stream's pipe reaches EOF. Callers re-check `poll`
    /// afterwards since the wakeup may belong to an older generation.
    pub async fn finished(&self, stream: StreamKind) {
        self.channel(stream).finished.notified().await;
    }

    /// Mix one frame into `out` (must be `FRAME_BYTES` long).
    pub fn read_into(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), FRAME_BYTES);

        let mut music = [0u8; FRAME_BYTES];
        let mut ambience = [0u8; FRAME_BYTES];
        self.music.pull(&mut music);
        self.ambience.pull(&mut ambience);

        mix_frames(
            &music,
            self.music.volume(),
            &ambience,
            self.ambience.volume(),
            out,
        );
    }

    pub fn read(&self) -> Vec<u8> {
        let mut out = vec![0u8; FRAME_BYTES];
        self.read_into(&mut out);
        out
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Sum two s16le frames with independent gain, clipping to the i16 range.
pub fn mix_frames(a: &[u8], gain_a: f32, b: &[u8], gain_b: f32, out: &mut [u8]) {
    let n = out.len().min(a.len()).min(b.len()) & !1;
    for i in (0..n).step_by(2) {
        let sa = i16::from_le_bytes([a[i], a[i + 1]]) as f32 * gain_a;
        let sb = i16::from_le_bytes([b[i], b[i + 1]]) as f32 * gain_b;
        let mixed = (sa + sb).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out[i..i + 2].copy_from_slice(&mixed.to_le_bytes());
    }
    out[n..].fill(0);
}

/// Read until `buf` is full or the pipe ends. Errors count as end of stream.
fn read_full(r: &mut dyn Read, buf: &mut [u8]) -> usize {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    filled
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding a mixer guard leaves plain data behind; keep going.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_ffmpeg_decoder(
    ffmpeg: &str,
    input: &str,
    looped: bool,
) -> anyhow::Result<(Child, std::process::ChildStdout)> {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-hide_banner")
        .arg("-loglevel").arg("quiet")
        .arg("-reconnect").arg("1")
        .arg("-reconnect_streamed").arg("1")
        .arg("-reconnect_delay_max").arg("5");
    if looped {
        cmd.arg("-stream_loop").arg("-1");
    }
    cmd.arg("-i").arg(input)
        .arg("-f").arg("s16le")
        .arg("-ar").arg(SAMPLE_RATE.to_string())
        .arg("-ac").arg(CHANNELS.to_string())
        .arg("pipe:1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("decoder stdout unavailable"))?;
    Ok((child, stdout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn samples(frame: &[u8]) -> Vec<i16> {
        frame.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect()
    }

    fn full_scale(value: i16) -> Vec<u8> {
        pcm(&vec![value; FRAME_BYTES / 2])
    }

    #[test]
    fn frame_size_matches_20ms_stereo() {
        assert_eq!(FRAME_BYTES, 3840);
    }

    #[test]
    fn idle_mixer_emits_silent_full_frames() {
        let m = Mixer::new("ffmpeg");
        let f = m.read();
        assert_eq!(f.len(), FRAME_BYTES);
        assert!(f.iter().all(|b| *b == 0));
    }

    #[test]
    fn short_and_empty_pipes_are_padded() {
        for len in [0usize, 1, 7, 100, FRAME_BYTES - 1, FRAME_BYTES, FRAME_BYTES * 2 + 3] {
            let m = Mixer::new("ffmpeg");
            m.set_volume(StreamKind::Music, 1.0);
            m.install(StreamKind::Music, None, Box::new(Cursor::new(vec![1u8; len])));
            for _ in 0..4 {
                assert_eq!(m.read().len(), FRAME_BYTES, "pipe len {len}");
            }
        }
    }

    #[test]
    fn partial_frame_keeps_data_then_pads_with_silence() {
        let m = Mixer::new("ffmpeg");
        m.set_volume(StreamKind::Music, 1.0);
        m.install(StreamKind::Music, None, Box::new(Cursor::new(pcm(&[1000, -1000, 5]))));

        let s = samples(&m.read());
        assert_eq!(&s[..3], &[1000, -1000, 5]);
        assert!(s[3..].iter().all(|v| *v == 0));
    }

    #[test]
    fn same_phase_full_scale_clips_without_wrapping() {
        let m = Mixer::new("ffmpeg");
        m.set_volume(StreamKind::Music, 1.0);
        m.set_volume(StreamKind::Ambience, 1.0);
        m.install(StreamKind::Music, None, Box::new(Cursor::new(full_scale(i16::MAX))));
        m.install(StreamKind::Ambience, None, Box::new(Cursor::new(full_scale(i16::MAX))));
        assert!(samples(&m.read()).iter().all(|v| *v == i16::MAX));

        m.install(StreamKind::Music, None, Box::new(Cursor::new(full_scale(i16::MIN))));
        m.install(StreamKind::Ambience, None, Box::new(Cursor::new(full_scale(i16::MIN))));
        assert!(samples(&m.read()).iter().all(|v| *v == i16::MIN));
    }

    #[test]
    fn opposite_phase_full_scale_stays_in_range() {
        let a: Vec<i16> = (0..FRAME_BYTES / 2)
            .map(|i| if i % 2 == 0 { i16::MAX } else { i16::MIN })
            .collect();
        let b: Vec<i16> = a.iter().map(|v| if *v == i16::MAX { i16::MIN } else { i16::MAX }).collect();

        let mut out = vec![0u8; FRAME_BYTES];
        mix_frames(&pcm(&a), 1.0, &pcm(&b), 1.0, &mut out);
        assert!(samples(&out).iter().all(|v| *v == -1));

        // Same signal twice: both rails must saturate.
        mix_frames(&pcm(&a), 1.0, &pcm(&a), 1.0, &mut out);
        for (got, src) in samples(&out).iter().zip(&a) {
            assert_eq!(got, src);
        }
    }

    #[test]
    fn volume_scales_and_clamps() {
        let m = Mixer::new("ffmpeg");
        m.set_volume(StreamKind::Music, 0.5);
        m.set_volume(StreamKind::Ambience, 7.0);
        assert_eq!(m.volume(StreamKind::Ambience), 1.0);
        m.set_volume(StreamKind::Ambience, -1.0);
        assert_eq!(m.volume(StreamKind::Ambience), 0.0);

        m.install(StreamKind::Music, None, Box::new(Cursor::new(full_scale(1000))));
        assert!(samples(&m.read()).iter().all(|v| *v == 500));
    }

    #[test]
    fn paused_stream_is_silent_and_keeps_its_pipe() {
        let m = Mixer::new("ffmpeg");
        m.set_volume(StreamKind::Music, 1.0);
        let mut data = full_scale(300);
        data.extend(full_scale(300));
        m.install(StreamKind::Music, None, Box::new(Cursor::new(data)));

        m.pause(StreamKind::Music);
        assert!(m.read().iter().all(|b| *b == 0));
        assert!(m.has_source(StreamKind::Music));

        m.resume(StreamKind::Music);
        assert!(samples(&m.read()).iter().all(|v| *v == 300));
    }

    #[test]
    fn eof_marks_generation_drained() {
        let m = Mixer::new("ffmpeg");
        let g = m.install(StreamKind::Music, None, Box::new(Cursor::new(full_scale(1))));
        assert_eq!(m.poll(StreamKind::Music, g).unwrap(), StreamStatus::Running);

        m.read();
        m.read();
        assert_eq!(m.poll(StreamKind::Music, g).unwrap(), StreamStatus::Drained);
        assert!(!m.has_source(StreamKind::Music));

        let g2 = m.install(StreamKind::Music, None, Box::new(Cursor::new(full_scale(1))));
        assert_eq!(m.poll(StreamKind::Music, g).unwrap(), StreamStatus::Replaced);
        assert_eq!(m.poll(StreamKind::Music, g2).unwrap(), StreamStatus::Running);
    }

    #[test]
    fn stop_is_idempotent() {
        let m = Mixer::new("ffmpeg");
        let g = m.install(StreamKind::Ambience, None, Box::new(Cursor::new(full_scale(1))));
        m.stop(StreamKind::Ambience);
        m.stop(StreamKind::Ambience);
        assert!(!m.has_source(StreamKind::Ambience));
        assert_eq!(m.poll(StreamKind::Ambience, g).unwrap(), StreamStatus::Stopped);
    }

    #[test]
    fn missing_ffmpeg_leaves_stream_stopped() {
        let m = Mixer::new("/nonexistent/ffmpeg-binary");
        assert!(m.start(StreamKind::Music, "https://example.invalid/a", false).is_none());
        assert!(!m.has_source(StreamKind::Music));
    }

    #[test]
    fn stream_kind_parses_case_insensitively() {
        assert_eq!("Music".parse::<StreamKind>().unwrap(), StreamKind::Music);
        assert_eq!("ambience".parse::<StreamKind>().unwrap(), StreamKind::Ambience);
        assert!("video".parse::<StreamKind>().is_err());
    }
}
