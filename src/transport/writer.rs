//! Transport write half.
//!
//! Serialised requests are written as NDJSON lines to the daemon's request
//! FIFO through a [`FramedWrite`] backed by [`DroidCodec`]. Concurrent
//! callers are serialised by an async mutex so lines never interleave.
//!
//! Every write races the transport's [`CancellationToken`]. A daemon that
//! stops draining its FIFO can stall a write indefinitely; cancellation
//! drops the stalled write and releases the mutex so `shutdown` can run.
//! Bytes already encoded stay in the sink's buffer, so a write abandoned
//! mid-line is completed by the next one and framing is preserved.

use futures_util::SinkExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::codec::DroidCodec;
use crate::{AppError, Result};

/// Boxed outbound byte stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Line-at-a-time writer shared by every request issuer of one transport.
pub struct LineWriter {
    label: String,
    sink: Mutex<Option<FramedWrite<BoxedWriter, DroidCodec>>>,
    cancel: CancellationToken,
}

impl LineWriter {
    /// Wrap an outbound stream. Pending and later writes fail once
    /// `cancel` fires.
    #[must_use]
    pub fn new(label: String, stream: BoxedWriter, cancel: CancellationToken) -> Self {
        Self {
            label,
            sink: Mutex::new(Some(FramedWrite::new(stream, DroidCodec::new()))),
            cancel,
        }
    }

    /// Write one line and flush it.
    ///
    /// # Errors
    ///
    /// [`AppError::DaemonDisconnected`] if the writer was shut down or the
    /// write fails (the daemon closed its end of the FIFO), or if the
    /// transport is cancelled before the line is flushed.
    pub async fn write_line(&self, line: String) -> Result<()> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AppError::DaemonDisconnected(format!(
                "{}: transport closed before the write completed",
                self.label
            ))),
            written = self.send(line) => written,
        }
    }

    async fn send(&self, line: String) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(AppError::DaemonDisconnected(format!(
                "{}: writer already shut down",
                self.label
            )));
        };

        sink.send(line).await.map_err(|e| {
            debug!(transport = %self.label, error = %e, "writer: write failed");
            AppError::DaemonDisconnected(format!("{}: write failed: {e}", self.label))
        })
    }

    /// Close the outbound stream, discarding anything still buffered.
    /// Idempotent.
    ///
    /// Only waits for the mutex, so cancel the token first if a write may be
    /// stalled.
    pub async fn shutdown(&self) {
        let Some(sink) = self.sink.lock().await.take() else {
            return;
        };
        let mut stream = sink.into_inner();
        if let Err(e) = stream.shutdown().await {
            debug!(transport = %self.label, error = %e, "writer: shutdown failed");
        }
    }
}

impl std::fmt::Debug for LineWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineWriter")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
