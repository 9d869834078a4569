//! Append-only JSONL log of every envelope crossing the bridge.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct WireLog {
    tx: mpsc::UnboundedSender<WireLogCommand>,
}

enum WireLogCommand {
    SetPath(PathBuf),
    Entry(WireEntry),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireDirection {
    /// Guest to host.
    Inbound,
    /// Host to guest.
    Outbound,
}

impl WireDirection {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Inbound => "in",
            Self::Outbound => "out",
        }
    }
}

#[derive(Serialize)]
struct WireEntry {
    timestamp_ms: i64,
    session: String,
    direction: &'static str,
    raw: String,
}

/// Where entries go: held in memory until a file is open.
enum WireSink {
    Pending(Vec<String>),
    Open { file: File, path: PathBuf },
}

impl WireSink {
    /// Opens `path` for appending and writes out anything held so far. On
    /// failure the sink keeps its current state.
    async fn open(&mut self, path: PathBuf) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
        if let Self::Pending(held) = self {
            for line in held.iter() {
                write_line(&mut file, line).await?;
            }
        }
        file.flush().await?;
        *self = Self::Open { file, path };
        Ok(())
    }

    async fn append(&mut self, line: String) {
        match self {
            Self::Pending(held) => held.push(line),
            Self::Open { file, path } => {
                let written = match write_line(file, &line).await {
                    Ok(()) => file.flush().await,
                    Err(err) => Err(err),
                };
                if let Err(err) = written {
                    tracing::warn!(error = %err, path = %path.display(), "Failed to append to bridge wire log");
                }
            }
        }
    }
}

async fn write_line(file: &mut File, line: &str) -> io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await
}

async fn run_writer(mut rx: mpsc::UnboundedReceiver<WireLogCommand>) {
    let mut sink = WireSink::Pending(Vec::new());
    while let Some(command) = rx.recv().await {
        match command {
            WireLogCommand::SetPath(path) => {
                let path_display = path.display().to_string();
                if let Err(err) = sink.open(path).await {
                    tracing::warn!(error = %err, path = %path_display, "Failed to open bridge wire log");
                }
            }
            WireLogCommand::Entry(entry) => match serde_json::to_string(&entry) {
                Ok(line) => sink.append(line).await,
                Err(err) => tracing::warn!(error = %err, "Failed to encode wire log entry"),
            },
        }
    }
}

impl WireLog {
    /// Starts the writer task. Entries recorded before a path is set are
    /// held and written once the file opens.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(rx));
        Self { tx }
    }

    pub fn set_path(&self, path: impl AsRef<Path>) {
        let _ = self.tx.send(WireLogCommand::SetPath(path.as_ref().to_path_buf()));
    }

    pub fn record(&self, session: &str, direction: WireDirection, raw: &str) {
        let _ = self.tx.send(WireLogCommand::Entry(WireEntry {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            session: session.to_string(),
            direction: direction.label(),
            raw: raw.to_string(),
        }));
    }
}

impl Default for WireLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;

    async fn read_entries(path: &std::path::Path, expected: usize) -> anyhow::Result<Vec<Value>> {
        for _ in 0..50 {
            if let Ok(contents) = tokio::fs::read_to_string(path).await {
                let entries = contents
                    .lines()
                    .map(serde_json::from_str)
                    .collect::<Result<Vec<Value>, _>>()?;
                if entries.len() >= expected {
                    return Ok(entries);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Err(anyhow::anyhow!("wire log never reached {expected} entries"))
    }

    #[tokio::test]
    async fn buffered_entries_flush_when_path_is_set() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("logs/wire.jsonl");
        let log = WireLog::new();

        log.record("ui://app", WireDirection::Inbound, r#"{"jsonrpc":"2.0"}"#);
        log.set_path(path.clone());
        log.record("ui://app", WireDirection::Outbound, r#"{"jsonrpc":"2.0","id":1}"#);

        let entries = read_entries(&path, 2).await?;
        assert_eq!(entries[0]["direction"], "in");
        assert_eq!(entries[0]["session"], "ui://app");
        assert_eq!(entries[1]["direction"], "out");
        assert_eq!(entries[1]["raw"], r#"{"jsonrpc":"2.0","id":1}"#);
        Ok(())
    }

    #[tokio::test]
    async fn failed_open_keeps_entries_for_the_next_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("not-a-dir");
        tokio::fs::write(&blocker, b"").await?;
        let path = dir.path().join("wire.jsonl");
        let log = WireLog::new();

        log.record("ui://app", WireDirection::Inbound, "first");
        log.set_path(blocker.join("wire.jsonl"));
        log.record("ui://app", WireDirection::Outbound, "second");
        log.set_path(&path);

        let entries = read_entries(&path, 2).await?;
        assert_eq!(entries[0]["raw"], "first");
        assert_eq!(entries[1]["raw"], "second");
        assert!(entries[0]["timestamp_ms"].is_i64());
        Ok(())
    }
}
