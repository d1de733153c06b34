use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tracing::{info, warn};

use crate::mixer::{Mixer, CHANNELS, FRAME_BYTES, SAMPLE_RATE};

// --- Voice session --------------------------------------------------------
//
// The player only needs a handful of operations from "the thing that carries
// audio to listeners". `VoiceSession` is that seam; the chat-platform client
// is one implementation, `PipeOutput` (mixed PCM into an ffmpeg encoder) is
// the one this binary ships with.

pub const TICK: Duration = Duration::from_millis(20);

pub trait VoiceSession: Send + Sync {
    /// Bring the platform client up (login / availability check).
    fn start(&self) -> BoxFuture<'_, anyhow::Result<()>>;
    /// Tear the platform client down, leaving any voice channel first.
    fn shutdown(&self) -> BoxFuture<'_, anyhow::Result<()>>;
    fn connect(&self, channel_id: String) -> BoxFuture<'_, anyhow::Result<()>>;
    fn disconnect(&self) -> BoxFuture<'_, anyhow::Result<()>>;
    fn is_connected(&self) -> bool;
    /// Start pulling frames from `source` at the 20 ms cadence.
    fn play(&self, source: Arc<Mixer>) -> anyhow::Result<()>;
    fn is_playing(&self) -> bool;
}

struct Output {
    channel_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    pump: Option<Pump>,
}

struct Pump {
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl Pump {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Voice session that encodes the mix with ffmpeg (`-f s16le` on stdin,
/// user-supplied output arguments).
pub struct PipeOutput {
    ffmpeg: String,
    output_args: Vec<String>,
    out: Mutex<Option<Output>>,
}

impl PipeOutput {
    pub fn new(ffmpeg: impl Into<String>, output_args: Vec<String>) -> Self {
        Self { ffmpeg: ffmpeg.into(), output_args, out: Mutex::new(None) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Output>> {
        self.out.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn spawn_encoder(&self) -> anyhow::Result<(Child, ChildStdin)> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner")
            .arg("-loglevel").arg("error")
            .arg("-f").arg("s16le")
            .arg("-ar").arg(SAMPLE_RATE.to_string())
            .arg("-ac").arg(CHANNELS.to_string())
            .arg("-i").arg("pipe:0")
            .args(&self.output_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("encoder stdin unavailable"))?;
        Ok((child, stdin))
    }

    fn teardown(&self) {
        let taken = self.lock().take();
        if let Some(mut out) = taken {
            if let Some(p) = out.pump.take() {
                p.stop.store(true, Ordering::Release);
            }
            let _ = out.child.kill();
            let _ = out.child.wait();
            info!(channel = %out.channel_id, "output disconnected");
        }
    }
}

impl VoiceSession for PipeOutput {
    fn start(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let ffmpeg = self.ffmpeg.clone();
            let status = tokio::process::Command::new(ffmpeg)
                .arg("-version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(|e| anyhow::anyhow!("ffmpeg not available: {e}"))?;
            if !status.success() {
                anyhow::bail!("ffmpeg -version exited with {status}");
            }
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.teardown();
            Ok(())
        })
    }

    fn connect(&self, channel_id: String) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.teardown();
            let (child, stdin) = self.spawn_encoder()?;
            info!(channel = %channel_id, "output connected");
            *self.lock() = Some(Output { channel_id, child, stdin: Some(stdin), pump: None });
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.teardown();
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        match self.lock().as_mut() {
            Some(out) => matches!(out.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn play(&self, source: Arc<Mixer>) -> anyhow::Result<()> {
        let mut guard = self.lock();
        let out = guard.as_mut().ok_or_else(|| anyhow::anyhow!("output not connected"))?;

        if out.pump.as_ref().is_some_and(Pump::is_running) {
            return Ok(());
        }
        let stdin = out
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("encoder input already closed; reconnect"))?;

        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let (stop_t, running_t) = (stop.clone(), running.clone());

        std::thread::Builder::new()
            .name("pcm-pump".into())
            .spawn(move || {
                if let Err(e) = pump_frames(stdin, source, &stop_t) {
                    warn!("output pump stopped: {e}");
                }
                running_t.store(false, Ordering::Release);
            })?;

        out.pump = Some(Pump { stop, running });
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.lock()
            .as_ref()
            .and_then(|o| o.pump.as_ref())
            .is_some_and(Pump::is_running)
    }
}

/// Real-time pull loop: one mixed frame every 20 ms into the encoder.
fn pump_frames(mut sink: impl Write, source: Arc<Mixer>, stop: &AtomicBool) -> anyhow::Result<()> {
    let mut frame = [0u8; FRAME_BYTES];
    let mut next = Instant::now();

    while !stop.load(Ordering::Acquire) {
        source.read_into(&mut frame);
        sink.write_all(&frame)?;

        next += TICK;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else if now - next > TICK * 5 {
            // Fell far behind (stalled encoder); resync instead of bursting.
            next = now;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSink {
        frames: Arc<std::sync::atomic::AtomicUsize>,
        fail_after: usize,
    }

    impl Write for CountingSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            assert_eq!(buf.len(), FRAME_BYTES);
            let n = self.frames.fetch_add(1, Ordering::AcqRel) + 1;
            if n >= self.fail_after {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"));
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn pump_writes_whole_frames_until_sink_fails() {
        let frames = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let sink = CountingSink { frames: frames.clone(), fail_after: 3 };
        let stop = AtomicBool::new(false);

        let res = pump_frames(sink, Arc::new(Mixer::new("ffmpeg")), &stop);
        assert!(res.is_err());
        assert_eq!(frames.load(Ordering::Acquire), 3);
    }

    #[test]
    fn pump_honours_stop_flag() {
        let frames = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let sink = CountingSink { frames: frames.clone(), fail_after: usize::MAX };
        let stop = AtomicBool::new(true);

        pump_frames(sink, Arc::new(Mixer::new("ffmpeg")), &stop).unwrap();
        assert_eq!(frames.load(Ordering::Acquire), 0);
    }

    #[test]
    fn play_requires_connection() {
        let out = PipeOutput::new("ffmpeg", vec!["-f".into(), "null".into(), "-".into()]);
        assert!(!out.is_connected());
        assert!(out.play(Arc::new(Mixer::new("ffmpeg"))).is_err());
        assert!(!out.is_playing());
    }
}
