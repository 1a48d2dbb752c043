//! Typed event port between the engine and its UI collaborator.

use lockstep_vault::FileId;
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// An event emitted by the engine.
///
/// Events are fire-and-forget; no acknowledgment flows back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// File content changed (a merge landed); views should re-render.
    Refresh {
        /// The affected file.
        file_id: FileId,
    },
    /// A remote copy was re-encrypted under a different key; the current
    /// sync aborted and the user must supply the new key.
    RemoteKeyChanged {
        /// The affected file.
        file_id: FileId,
    },
}

/// Distributes engine events to subscribers.
///
/// Subscribers that drop their receiver are cleaned up on the next emit.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Sender<EngineEvent>>>,
}

impl EventBus {
    /// Creates an event bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits an event to all live subscribers.
    pub fn emit(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
