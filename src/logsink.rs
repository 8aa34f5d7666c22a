//! Request log sink for an SSH session channel.
//!
//! The log is an observability side channel: it must never block the data
//! plane and never accumulate unbounded memory during a burst. Lines are
//! posted onto a bounded channel and dropped when it is full; a single drain
//! task writes them to the session channel, swallowing write errors (the
//! channel may be closing).

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const MAX_PATH_DISPLAY: usize = 50;

#[derive(Debug)]
pub struct RequestLogger {
    tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl RequestLogger {
    /// Creates a logger writing to `writer` with the given channel capacity
    /// and spawns the drain task.
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static, buf_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buf_size);
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(drain(writer, rx, shutdown.clone()));
        Self {
            tx,
            shutdown,
            tasks,
        }
    }

    /// Posts a raw line without blocking; the line is dropped when the
    /// channel is full or the logger is closed.
    pub fn post(&self, line: String) {
        let _ = self.tx.try_send(line);
    }

    /// Logs an HTTP request with method, path, status, and latency.
    pub fn log_request(&self, method: &str, path: &str, status: u16, latency: Duration) {
        self.post(format!(
            "  {:<4} {:<53} {}  {}\r\n",
            method,
            truncate_path(path),
            status,
            format_latency(latency),
        ));
    }

    /// Logs a WebSocket connection opening.
    pub fn log_ws_open(&self, path: &str) {
        self.post(format!("  {:<4} {:<53} -    OPEN\r\n", "WS", truncate_path(path)));
    }

    /// Logs a WebSocket connection closing with duration and byte totals.
    pub fn log_ws_close(&self, path: &str, duration: Duration, bytes: u64) {
        self.post(format!(
            "  {:<4} {:<53} -    CLOSED ({}, {})\r\n",
            "WS",
            truncate_path(path),
            format_duration(duration),
            format_bytes(bytes),
        ));
    }

    /// Signals the drain task to finish and waits for it. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn drain(
    mut writer: impl AsyncWrite + Send + Unpin,
    mut rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    let _ = writer.write_all(line.as_bytes()).await;
                }
                None => break,
            },
            _ = shutdown.cancelled() => {
                // flush whatever is already buffered, then stop
                while let Ok(line) = rx.try_recv() {
                    let _ = writer.write_all(line.as_bytes()).await;
                }
                break;
            }
        }
    }
}

fn truncate_path(path: &str) -> String {
    if path.len() > MAX_PATH_DISPLAY {
        let mut end = MAX_PATH_DISPLAY - 3;
        while !path.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &path[..end])
    } else {
        path.to_string()
    }
}

fn format_latency(latency: Duration) -> String {
    if latency < Duration::from_millis(1) {
        match latency.as_micros() {
            0 => "<1us".to_string(),
            us => format!("{us}us"),
        }
    } else {
        format!("{}ms", latency.as_millis())
    }
}

/// Formats a duration as a short human string, e.g. "2h", "45m", "1m30s".
pub(crate) fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let (m, s) = (secs / 60, secs % 60);
        if s == 0 {
            format!("{m}m")
        } else {
            format!("{m}m{s}s")
        }
    } else {
        let (h, m) = (secs / 3600, (secs % 3600) / 60);
        if m == 0 {
            format!("{h}h")
        } else {
            format!("{h}h{m}m")
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{bytes}B")
    } else if b < MB {
        format!("{:.1}KB", b / KB)
    } else if b < GB {
        format!("{:.1}MB", b / MB)
    } else {
        format!("{:.1}GB", b / GB)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn drains_posted_lines_to_writer() {
        let (writer, mut reader) = tokio::io::duplex(4096);
        let logger = RequestLogger::new(writer, 16);
        logger.log_request("GET", "/index.html", 200, Duration::from_millis(12));
        logger.log_ws_open("/socket");
        logger.close().await;

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert!(out.contains("GET"), "missing request line: {out:?}");
        assert!(out.contains("/index.html"));
        assert!(out.contains("200"));
        assert!(out.contains("12ms"));
        assert!(out.contains("OPEN"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (writer, _reader) = tokio::io::duplex(4096);
        let logger = RequestLogger::new(writer, 4);
        logger.close().await;
        logger.close().await;
        // posts after close are silently dropped
        logger.post("late line\r\n".into());
    }

    #[tokio::test]
    async fn posting_never_blocks_on_a_stuck_writer() {
        // a tiny duplex buffer with no reader wedges the drain task mid-write
        let (writer, reader) = tokio::io::duplex(8);
        let logger = RequestLogger::new(writer, 2);
        for i in 0..64 {
            logger.post(format!("line {i} with enough text to exceed the buffer\r\n"));
        }
        // dropping the reader fails the pending write; errors are swallowed
        drop(reader);
        tokio::time::timeout(Duration::from_secs(5), logger.close())
            .await
            .expect("close did not finish");
    }

    #[test]
    fn truncates_long_paths() {
        let long = "/".repeat(80);
        let shown = truncate_path(&long);
        assert_eq!(shown.len(), MAX_PATH_DISPLAY);
        assert!(shown.ends_with("..."));
        assert_eq!(truncate_path("/short"), "/short");
    }

    #[test]
    fn formats_durations_and_bytes() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(2 * 60 * 60)), "2h");
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.0KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0MB");
    }
}
