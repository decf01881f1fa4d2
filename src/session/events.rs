//! Subscriber side of a session's notification fan-out.

use tokio::sync::mpsc;

use crate::protocol::Notification;

/// Notifications of one session, in emission order.
///
/// Each stream has its own unbounded queue and sees every notification
/// published after it was created; a slow reader never loses any. Dropping
/// the stream unsubscribes it on the next notification.
#[derive(Debug)]
pub struct EventStream {
    session: String,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl EventStream {
    pub(crate) fn new(session: String, rx: mpsc::UnboundedReceiver<Notification>) -> Self {
        Self { session, rx }
    }

    /// Name of the session this stream follows.
    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Next notification, or `None` once the session has closed or its
    /// daemon disconnected.
    pub async fn next(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}
