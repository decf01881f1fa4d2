//! Transport read task.
//!
//! Reads newline-delimited JSON from the daemon's response FIFO, resolves
//! correlated responses through the [`PendingRequests`] table and forwards
//! notifications, in arrival order, through a tokio [`mpsc`] channel.
//!
//! | Inbound line                              | Outcome                        |
//! |-------------------------------------------|--------------------------------|
//! | response with an outstanding id           | delivered to the caller        |
//! | response for a timed-out id               | dropped; logged at `DEBUG`     |
//! | `droid.session_notification`              | forwarded to `notify_tx`       |
//! | blank line                                | skipped                        |
//! | anything else                             | protocol violation, dropped    |
//!
//! A run of more than `max_consecutive_violations` bad lines is treated as a
//! daemon crash. EOF, an I/O error, or a crash fails every pending request
//! with [`AppError::DaemonDisconnected`](crate::AppError::DaemonDisconnected).

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{decode_line, Inbound, Notification};
use crate::transport::codec::{DroidCodec, Frame};
use crate::transport::pending::{PendingRequests, Resolution};
use crate::AppError;

/// Why the read task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The transport was closed locally.
    Cancelled,
    /// The daemon closed its end of the stream.
    Eof,
    /// Reading failed.
    IoError(String),
    /// Too many consecutive protocol violations.
    TooManyViolations(u32),
}

impl ReaderExit {
    /// Human-readable reason recorded on the pending table.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Cancelled => "transport closed".to_owned(),
            Self::Eof => "stream closed".to_owned(),
            Self::IoError(e) => format!("stream error: {e}"),
            Self::TooManyViolations(n) => {
                format!("daemon treated as crashed after {n} consecutive protocol violations")
            }
        }
    }
}

/// Read task. Drives a [`FramedRead`] over `stream` until it ends.
///
/// Notifications are sent with `notify_tx.send(..).await` so ordering is
/// preserved and a slow consumer applies back-pressure. If the consumer has
/// gone away, notifications are dropped but responses keep flowing.
pub async fn run_reader<R>(
    label: String,
    stream: R,
    pending: Arc<PendingRequests>,
    notify_tx: mpsc::Sender<Notification>,
    cancel: CancellationToken,
    max_consecutive_violations: u32,
) -> ReaderExit
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stream, DroidCodec::new());
    let mut violations: u32 = 0;
    let mut subscriber_gone = false;

    let exit = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(transport = %label, "reader: cancellation received, stopping");
                break ReaderExit::Cancelled;
            }

            item = framed.next() => {
                let outcome = match item {
                    None => {
                        debug!(transport = %label, "reader: EOF detected");
                        break ReaderExit::Eof;
                    }
                    Some(Err(e)) => {
                        warn!(transport = %label, error = %e, "reader: IO error, stopping");
                        break ReaderExit::IoError(e.to_string());
                    }
                    Some(Ok(Frame::Oversized)) => Err(AppError::ProtocolViolation(
                        "line exceeded the maximum length".into(),
                    )),
                    Some(Ok(Frame::Line(line))) => {
                        dispatch(&label, &line, &pending, &notify_tx, &mut subscriber_gone).await
                    }
                };

                match outcome {
                    Ok(()) => violations = 0,
                    Err(e) => {
                        violations += 1;
                        warn!(
                            transport = %label,
                            error = %e,
                            consecutive = violations,
                            "reader: protocol violation, dropping line"
                        );
                        if violations > max_consecutive_violations {
                            break ReaderExit::TooManyViolations(violations);
                        }
                    }
                }
            }
        }
    };

    let failed = pending.fail_all(&exit.reason());
    if failed > 0 {
        warn!(
            transport = %label,
            failed,
            reason = %exit.reason(),
            "reader: failed outstanding requests"
        );
    }
    exit
}

/// Classify one line and route it. `Err` marks a protocol violation.
async fn dispatch(
    label: &str,
    line: &str,
    pending: &PendingRequests,
    notify_tx: &mpsc::Sender<Notification>,
    subscriber_gone: &mut bool,
) -> crate::Result<()> {
    match decode_line(line)? {
        None => Ok(()),
        Some(Inbound::Response(response)) => {
            let id = response.id.clone();
            match pending.resolve(response) {
                Resolution::Delivered => {
                    debug!(transport = %label, request_id = %id, "reader: response delivered");
                    Ok(())
                }
                Resolution::Late => {
                    debug!(
                        transport = %label,
                        request_id = %id,
                        "reader: discarding late response for timed-out request"
                    );
                    Ok(())
                }
                Resolution::Unknown => Err(AppError::ProtocolViolation(format!(
                    "response for unknown request id {id}"
                ))),
            }
        }
        Some(Inbound::Notification(notification)) => {
            if !*subscriber_gone && notify_tx.send(notification).await.is_err() {
                debug!(transport = %label, "reader: notification receiver closed");
                *subscriber_gone = true;
            }
            Ok(())
        }
    }
}
