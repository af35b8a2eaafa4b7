//! Collaborator notifications.
//!
//! A session reports three things to whoever renders it: the message list
//! changed, the session state changed, or something went wrong. Observers
//! are called synchronously from the session's own methods.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sage_stream_core::Message;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};

use crate::error::ErrorKind;
use crate::lifecycle::SessionState;

/// Receives session notifications.
///
/// All methods default to doing nothing.
pub trait SessionObserver: Send {
    /// The message list changed; `snapshot` is the full current list.
    fn on_messages_changed(&mut self, snapshot: &[Message]) {
        let _ = snapshot;
    }

    /// The session moved to `state`.
    fn on_session_state_changed(&mut self, state: SessionState) {
        let _ = state;
    }

    /// A recoverable or transport failure occurred.
    fn on_error(&mut self, kind: ErrorKind, detail: &str) {
        let _ = (kind, detail);
    }
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// One notification, as an owned value.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The message list changed.
    MessagesChanged(Vec<Message>),
    /// The session state changed.
    StateChanged(SessionState),
    /// A failure occurred.
    Error {
        /// Failure category.
        kind: ErrorKind,
        /// Human-readable detail.
        detail: String,
    },
}

/// Observer that forwards notifications into a channel.
///
/// State changes and errors are queued without bound and never dropped.
/// Snapshots are coalesced: while one is waiting to be received, newer ones
/// replace it in place, so a slow consumer sees the latest list and no
/// backlog of stale copies.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Signal>,
    latest: Arc<watch::Sender<Vec<Message>>>,
    snapshot_queued: Arc<AtomicBool>,
}

/// Queue entry; snapshots travel through the `watch` slot.
#[derive(Debug)]
enum Signal {
    Event(SessionEvent),
    Snapshot,
}

impl ChannelObserver {
    /// Create an observer and the receiver for its events.
    #[must_use]
    pub fn channel() -> (Self, SessionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (latest, snapshot) = watch::channel(Vec::new());
        let snapshot_queued = Arc::new(AtomicBool::new(false));
        let observer = Self {
            tx,
            latest: Arc::new(latest),
            snapshot_queued: Arc::clone(&snapshot_queued),
        };
        let events = SessionEvents {
            rx,
            snapshot,
            snapshot_queued,
        };
        (observer, events)
    }

    fn forward(&self, signal: Signal) {
        if self.tx.send(signal).is_err() {
            tracing::debug!("Session event receiver dropped");
        }
    }
}

impl SessionObserver for ChannelObserver {
    fn on_messages_changed(&mut self, snapshot: &[Message]) {
        self.latest.send_replace(snapshot.to_vec());
        if !self.snapshot_queued.swap(true, Ordering::SeqCst) {
            self.forward(Signal::Snapshot);
        }
    }

    fn on_session_state_changed(&mut self, state: SessionState) {
        self.forward(Signal::Event(SessionEvent::StateChanged(state)));
    }

    fn on_error(&mut self, kind: ErrorKind, detail: &str) {
        self.forward(Signal::Event(SessionEvent::Error {
            kind,
            detail: detail.to_string(),
        }));
    }
}

/// Receiving end of a [`ChannelObserver`].
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<Signal>,
    snapshot: watch::Receiver<Vec<Message>>,
    snapshot_queued: Arc<AtomicBool>,
}

impl SessionEvents {
    /// Wait for the next event. Returns `None` once the observer is dropped
    /// and every queued event has been received.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        let signal = self.rx.recv().await?;
        Some(self.resolve(signal))
    }

    /// Take the next event if one is queued.
    ///
    /// # Errors
    ///
    /// Returns `Empty` when nothing is queued and `Disconnected` once the
    /// observer is gone.
    pub fn try_recv(&mut self) -> Result<SessionEvent, TryRecvError> {
        let signal = self.rx.try_recv()?;
        Ok(self.resolve(signal))
    }

    fn resolve(&mut self, signal: Signal) -> SessionEvent {
        match signal {
            Signal::Event(event) => event,
            Signal::Snapshot => {
                // Clear before reading so a snapshot published meanwhile queues a new marker
                self.snapshot_queued.store(false, Ordering::SeqCst);
                SessionEvent::MessagesChanged(self.snapshot.borrow_and_update().clone())
            }
        }
    }
}
