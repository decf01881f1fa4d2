//! Duplex JSON-RPC transport over a FIFO pair.
//!
//! One [`Transport`] owns the request stream (client → daemon) and the
//! response stream (daemon → client) of a single daemon. Requests are
//! correlated with their responses through a [`PendingRequests`] table;
//! notifications are delivered on a separate channel returned by
//! [`Transport::open`]. The two only meet inside the read task.
//!
//! Submodules:
//! - `codec`: line framing with a 1 MiB limit.
//! - `pending`: the correlation table.
//! - `reader`: the read task.
//! - `writer`: serialised line writes.

pub mod codec;
pub mod pending;
pub mod reader;
pub mod writer;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::protocol::{Notification, Request, Response};
use crate::transport::pending::PendingRequests;
use crate::transport::reader::{run_reader, ReaderExit};
use crate::transport::writer::LineWriter;
use crate::{AppError, Result};

/// Duplex transport to one daemon.
pub struct Transport {
    label: String,
    writer: LineWriter,
    pending: Arc<PendingRequests>,
    cancel: CancellationToken,
    reader_task: Mutex<Option<JoinHandle<ReaderExit>>>,
}

impl Transport {
    /// Start the read task over `reader` and wrap `writer` for requests.
    ///
    /// Returns the transport and the receiver on which notifications arrive
    /// in emission order. The receiver yields `None` once the read task has
    /// stopped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<R, W>(
        label: impl Into<String>,
        reader: R,
        writer: W,
        config: &TransportConfig,
    ) -> (Self, mpsc::Receiver<Notification>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let pending = Arc::new(PendingRequests::new());
        let cancel = CancellationToken::new();
        let (notify_tx, notify_rx) = mpsc::channel(config.notification_buffer.max(1));

        let reader_task = tokio::spawn(run_reader(
            label.clone(),
            reader,
            Arc::clone(&pending),
            notify_tx,
            cancel.clone(),
            config.max_consecutive_violations,
        ));

        debug!(transport = %label, "transport opened");

        let transport = Self {
            writer: LineWriter::new(label.clone(), Box::new(writer), cancel.clone()),
            label,
            pending,
            cancel,
            reader_task: Mutex::new(Some(reader_task)),
        };
        (transport, notify_rx)
    }

    /// Send `request` and wait for its correlated response.
    ///
    /// With `timeout` set, the limit covers both writing the request and
    /// waiting for the answer. An overdue request is removed from the
    /// correlation table and fails with [`AppError::RequestTimeout`] unless
    /// its response was delivered in the meantime; a response arriving
    /// afterwards is discarded.
    ///
    /// # Errors
    ///
    /// - [`AppError::DaemonDisconnected`] if the transport is closed, the
    ///   write fails, or the daemon disconnects before answering.
    /// - [`AppError::RequestTimeout`] on expiry.
    /// - [`AppError::MalformedRequest`] if the id is already outstanding.
    pub async fn request(&self, request: Request, timeout: Option<Duration>) -> Result<Response> {
        let id = request.id.clone();
        let method = request.method;
        let line = request.encode()?;

        let mut waiter = self.pending.register(id.clone())?;
        let exchange = async {
            if let Err(e) = self.writer.write_line(line).await {
                self.pending.forget(&id);
                return Err(e);
            }
            debug!(transport = %self.label, request_id = %id, %method, "request sent");
            Ok((&mut waiter).await.ok())
        };

        let delivered = match timeout {
            None => exchange.await?,
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, exchange).await;
                match outcome {
                    Ok(delivered) => delivered?,
                    Err(_) => {
                        self.pending.expire(&id);
                        // The response may have been resolved between the
                        // deadline firing and the entry being removed.
                        let Ok(received) = waiter.try_recv() else {
                            return Err(AppError::RequestTimeout(format!(
                                "{method} ({id}) got no response within {limit:?}"
                            )));
                        };
                        Some(received)
                    }
                }
            }
        };

        delivered.unwrap_or_else(|| {
            Err(AppError::DaemonDisconnected(format!(
                "{}: {method} ({id}) abandoned",
                self.label
            )))
        })
    }

    /// [`request`](Self::request), returning the result payload and
    /// surfacing daemon errors as [`AppError::Rpc`].
    ///
    /// # Errors
    ///
    /// As [`request`](Self::request), plus [`AppError::Rpc`].
    pub async fn call(&self, request: Request, timeout: Option<Duration>) -> Result<Value> {
        self.request(request, timeout).await?.into_result()
    }

    /// Whether the transport can no longer carry requests.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    /// Why the transport closed, if it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<String> {
        self.pending.close_reason()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Label used in log fields.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stop the read task, fail pending requests, and close the write half.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.pending.fail_all("transport closed");
        self.writer.shutdown().await;

        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            match task.await {
                Ok(exit) => info!(transport = %self.label, reason = %exit.reason(), "transport closed"),
                Err(e) => debug!(transport = %self.label, error = %e, "reader task join failed"),
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("label", &self.label)
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
