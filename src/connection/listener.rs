//! Listener interface for connection flow outcomes

use super::slot::LinkHandle;
use tokio::sync::mpsc;

/// Receives progress and terminal outcomes of a connection flow
///
/// Terminal callbacks are `on_connected`, `on_exhausted`,
/// `on_peer_not_found`, `on_permission_denied` and `on_adapter_unavailable`;
/// nothing follows them.
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_attempt_started(&self);
    fn on_attempt_failed(&self, attempt: u32, max_attempts: u32, detail: &str);
    fn on_connected(&self, handle: LinkHandle);
    fn on_exhausted(&self);
    fn on_peer_not_found(&self);
    fn on_permission_denied(&self);

    /// The adapter is missing or did not answer the directory lookup
    fn on_adapter_unavailable(&self, _detail: &str) {}
}

/// Events emitted by an [`EventForwarder`]
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    AttemptStarted,
    AttemptFailed {
        attempt: u32,
        max_attempts: u32,
        detail: String,
    },
    Connected(LinkHandle),
    Exhausted,
    PeerNotFound,
    PermissionDenied,
    AdapterUnavailable { detail: String },
}

/// Listener that turns callbacks into a stream of [`ConnectionEvent`]s
#[derive(Clone)]
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl EventForwarder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }
}

impl ConnectionListener for EventForwarder {
    fn on_attempt_started(&self) {
        self.forward(ConnectionEvent::AttemptStarted);
    }

    fn on_attempt_failed(&self, attempt: u32, max_attempts: u32, detail: &str) {
        self.forward(ConnectionEvent::AttemptFailed {
            attempt,
            max_attempts,
            detail: detail.to_string(),
        });
    }

    fn on_connected(&self, handle: LinkHandle) {
        self.forward(ConnectionEvent::Connected(handle));
    }

    fn on_exhausted(&self) {
        self.forward(ConnectionEvent::Exhausted);
    }

    fn on_peer_not_found(&self) {
        self.forward(ConnectionEvent::PeerNotFound);
    }

    fn on_permission_denied(&self) {
        self.forward(ConnectionEvent::PermissionDenied);
    }

    fn on_adapter_unavailable(&self, detail: &str) {
        self.forward(ConnectionEvent::AdapterUnavailable {
            detail: detail.to_string(),
        });
    }
}
