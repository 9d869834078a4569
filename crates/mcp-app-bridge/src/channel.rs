//! Guest channel handle and newline-delimited transport.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::envelope::MessageEnvelope;
use crate::error::{BridgeError, Result};
use crate::session::SessionHandle;
use crate::wire_log::{WireDirection, WireLog};

pub type GuestWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type GuestReader = Box<dyn AsyncRead + Send + Unpin>;

/// Outbound half of the host/guest channel. Cloning shares the same queue.
#[derive(Clone)]
pub struct GuestChannel {
    tx: mpsc::UnboundedSender<String>,
    label: Arc<str>,
    wire_log: Option<WireLog>,
}

impl GuestChannel {
    /// Creates a channel; the receiver yields encoded envelopes in send order.
    pub fn new(label: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                label: Arc::from(label.into()),
                wire_log: None,
            },
            rx,
        )
    }

    pub fn with_wire_log(mut self, wire_log: WireLog) -> Self {
        self.wire_log = Some(wire_log);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn post(&self, envelope: &MessageEnvelope) -> Result<()> {
        let payload = envelope.encode()?;
        if let Some(log) = &self.wire_log {
            log.record(&self.label, WireDirection::Outbound, &payload);
        }
        self.tx
            .send(payload)
            .map_err(|_| BridgeError::ChannelClosed)
    }

    pub fn log_inbound(&self, raw: &str) {
        if let Some(log) = &self.wire_log {
            log.record(&self.label, WireDirection::Inbound, raw);
        }
    }
}

/// Pumps newline-delimited JSON between a byte stream and a running session.
pub struct LineTransport {
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl LineTransport {
    pub fn connect_with_io(
        reader: GuestReader,
        writer: GuestWriter,
        handle: SessionHandle,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        if handle.deliver(trimmed).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = handle.detach(Some("guest channel closed".to_string()));
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Guest stream read failed");
                        let _ = handle.detach(Some("guest channel closed".to_string()));
                        break;
                    }
                }
            }
        });

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(payload) = outbound.recv().await {
                let written = async {
                    writer.write_all(payload.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                }
                .await;
                if let Err(err) = written {
                    tracing::warn!(error = %err, "Guest stream write failed");
                    break;
                }
            }
        });

        Self {
            reader_task: Some(reader_task),
            writer_task: Some(writer_task),
        }
    }

    /// Waits for the outbound queue to drain (the session dropped its channel),
    /// then stops reading.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(task) = self.writer_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for LineTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}
