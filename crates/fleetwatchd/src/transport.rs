//! Newline-delimited JSON bridge between the agent and its server channel.
//!
//! The daemon does not own the network transport. A supervisor process
//! (or the WebSocket client, when embedded) feeds server envelopes on one
//! stream and reads progress envelopes from the other, one JSON document
//! per line.

use crate::dispatcher::CommandDispatcher;
use crate::error::SinkError;
use crate::progress::RemoteProgressSink;
use async_trait::async_trait;
use chrono::Utc;
use fleetwatch_common::{ProgressEvent, ProtocolError, WireMessage};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Writes each progress event as one `update_progress` envelope line.
pub struct LineSink<W> {
    writer: Mutex<W>,
}

impl<W> LineSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl LineSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> RemoteProgressSink for LineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_progress(&self, event: &ProgressEvent) -> Result<(), SinkError> {
        let envelope = WireMessage::progress(event, Utc::now())?;
        let mut line = serde_json::to_vec(&envelope).map_err(ProtocolError::from)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Feed every line of `reader` to `dispatcher` until EOF or shutdown.
pub async fn serve_lines<R>(
    reader: R,
    dispatcher: CommandDispatcher,
    shutdown: CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("Server channel closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!("Inbound message: {}", line);
        dispatcher.handle_raw(line);
    }
    Ok(())
}
