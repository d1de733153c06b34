use std::sync::Mutex;

use futures_util::future::BoxFuture;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::queue::QueueExport;

// --- Queue display --------------------------------------------------------
//
// After every queue change the player asks the display to refresh. On a chat
// platform this edits the pinned queue message; `TextDisplay` renders the same
// panel as monospace text and keeps the latest copy for `/api/v1/queue`.

const BOX_WIDTH: usize = 46;
const RECENT: usize = 3;
pub const PER_PAGE: usize = 10;

pub trait QueueDisplay: Send + Sync {
    fn update_queue_display(&self, queue: QueueExport) -> BoxFuture<'_, anyhow::Result<()>>;
}

#[derive(Default)]
pub struct TextDisplay {
    page: usize,
    last: Mutex<String>,
}

impl TextDisplay {
    pub fn new() -> Self {
        Self { page: 1, last: Mutex::new(String::new()) }
    }

    pub fn last_render(&self) -> String {
        self.last.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl QueueDisplay for TextDisplay {
    fn update_queue_display(&self, queue: QueueExport) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let mut text = render_queue(&queue, self.page.max(1), PER_PAGE);
            if let Ok(ts) = OffsetDateTime::now_utc().format(&Rfc3339) {
                text.push_str(&format!("\nUpdated {ts}"));
            }
            tracing::debug!("queue display:\n{text}");
            if let Ok(mut last) = self.last.lock() {
                *last = text;
            }
            Ok(())
        })
    }
}

fn center(s: &str, width: usize) -> String {
    let len = s.chars().count();
    if len >= width {
        return s.chars().take(width).collect();
    }
    let left = (width - len) / 2;
    let right = width - len - left;
    format!("{}{}{}", " ".repeat(left), s, " ".repeat(right))
}

fn boxed(lines: &[String]) -> String {
    let mut out = format!("┏{}┓\n", "━".repeat(BOX_WIDTH));
    for l in lines {
        out.push_str(&format!("┃{}┃\n", center(l, BOX_WIDTH)));
    }
    out.push_str(&format!("┗{}┛", "━".repeat(BOX_WIDTH)));
    out
}

/// Now-playing box, up to three recently played tracks, one page of upcoming
/// tracks and a footer with loop/shuffle/count.
pub fn render_queue(queue: &QueueExport, page: usize, per_page: usize) -> String {
    let total = queue.tracks.len();
    let cur = if total == 0 { 0 } else { queue.current_index.min(total - 1) };
    let page = page.max(1);

    let mut out = format!("Current Playlist: {}\n\nNow Playing\n", queue.playlist_name);

    if total > 0 {
        out.push_str(&boxed(&[
            queue.tracks[cur].name.clone(),
            format!("(index {}/{})", cur + 1, total),
        ]));
    } else {
        out.push_str(&boxed(&["(No song playing)".to_string()]));
    }
    out.push('\n');

    if cur > 0 {
        out.push_str("\nRecently Played\n");
        for i in cur.saturating_sub(RECENT)..cur {
            out.push_str(&format!("{:>3}  {}\n", format!("{}.", i + 1), queue.tracks[i].name));
        }
    }

    let page_start = cur + 1 + (page - 1) * per_page;
    let page_end = total.min(page_start + per_page);
    if total == 0 {
        out.push_str("\nUp Next\n(queue is empty)\n");
    } else if page_start < total {
        out.push_str(&format!("\nUp Next - Page {page}\n"));
        for i in page_start..page_end {
            out.push_str(&format!("{:>3}  {}\n", format!("{}.", i + 1), queue.tracks[i].name));
        }
        let remaining = total.saturating_sub(cur + 1).saturating_sub(page * per_page);
        if remaining > 0 {
            out.push_str(&format!("... +{remaining} more\n"));
        }
    }

    let on_off = |b: bool| if b { "On" } else { "Off" };
    out.push_str(&format!(
        "\nLoop: {}  •  Shuffle: {}  •  Tracks: {}",
        on_off(queue.loop_current),
        on_off(queue.shuffle_mode),
        total
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MusicQueue, Track};

    fn queue_of(n: usize, advance: usize) -> QueueExport {
        let mut q = MusicQueue::new();
        q.load(
            (0..n).map(|i| Track::new(format!("u{i}"), format!("Song {i}"))).collect(),
            "Evening",
            false,
        );
        for _ in 0..advance {
            q.next();
        }
        q.export()
    }

    #[test]
    fn renders_empty_queue() {
        let text = render_queue(&MusicQueue::new().export(), 1, PER_PAGE);
        assert!(text.contains("(No song playing)"));
        assert!(text.contains("(queue is empty)"));
        assert!(text.contains("Tracks: 0"));
    }

    #[test]
    fn renders_recent_and_paged_upcoming() {
        let text = render_queue(&queue_of(30, 5), 1, PER_PAGE);
        assert!(text.contains("Song 5"));
        assert!(text.contains("(index 6/30)"));
        assert!(text.contains("Recently Played"));
        assert!(text.contains(" 3.  Song 2"));
        assert!(!text.contains(" 2.  Song 1"));
        assert!(text.contains("Up Next - Page 1"));
        assert!(text.contains("16.  Song 15"));
        assert!(!text.contains("Song 16\n"));
        assert!(text.contains("+14 more"));
    }

    #[test]
    fn box_lines_have_fixed_width() {
        let text = render_queue(&queue_of(2, 0), 1, PER_PAGE);
        let boxed: Vec<_> = text.lines().filter(|l| l.starts_with('┃')).collect();
        assert_eq!(boxed.len(), 2);
        for l in boxed {
            assert_eq!(l.chars().count(), BOX_WIDTH + 2);
        }
    }

    #[tokio::test]
    async fn text_display_keeps_last_render() {
        let d = TextDisplay::new();
        d.update_queue_display(queue_of(3, 1)).await.unwrap();
        assert!(d.last_render().contains("Current Playlist: Evening"));
    }
}
