use std::process::Stdio;

use futures_util::future::BoxFuture;
use tokio::process::Command;

/// Turns a page/source URL into something ffmpeg can open directly.
pub trait StreamResolver: Send + Sync {
    fn resolve(&self, url: String) -> BoxFuture<'_, anyhow::Result<String>>;
}

/// Resolver backed by the `yt-dlp` CLI (`-g` prints the media URL).
pub struct YtDlp {
    program: String,
}

impl YtDlp {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

impl StreamResolver for YtDlp {
    fn resolve(&self, url: String) -> BoxFuture<'_, anyhow::Result<String>> {
        Box::pin(async move {
            let out = Command::new(&self.program)
                .arg("-g")
                .arg("-f").arg("bestaudio[ext=webm][acodec=opus]/bestaudio/best")
                .arg("--no-playlist")
                .arg("--quiet")
                .arg("--default-search").arg("auto")
                .arg(&url)
                .stdin(Stdio::null())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| anyhow::anyhow!("failed to run {}: {e}", self.program))?;

            if !out.status.success() {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
                anyhow::bail!("could not resolve {url}: {}", last.trim());
            }

            first_url_line(&String::from_utf8_lossy(&out.stdout))
                .ok_or_else(|| anyhow::anyhow!("resolver returned no stream for {url}"))
        })
    }
}

fn first_url_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| l.contains("://"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_first_url_line() {
        let out = "\nWARNING: something\nhttps://cdn/a.webm\nhttps://cdn/b.webm\n";
        assert_eq!(first_url_line(out).as_deref(), Some("https://cdn/a.webm"));
        assert_eq!(first_url_line("nothing here\n"), None);
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let r = YtDlp::new("/nonexistent/yt-dlp");
        assert!(r.resolve("https://example.invalid".into()).await.is_err());
    }
}
