//! Provider lifecycle events for monitoring.
//!
//! `MeshEvent` describes what the provider did; `EventBus` fans events out to
//! callbacks registered by the host application (status bars, debug panes,
//! tests). Callbacks run on the provider's control loop and must not block.

use crate::registry::ConnectionDirection;
use crate::PeerId;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by a running provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MeshEvent {
    /// The transport endpoint opened and our identifier is known.
    Ready {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// A channel opened and cold-start sync was sent.
    PeerConnected {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        direction: ConnectionDirection,
    },
    /// A channel closed or was dropped.
    PeerDisconnected {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// An outbound dial failed.
    DialFailed {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        attempt: u32,
        error: String,
        /// Whether another attempt is scheduled.
        #[serde(rename = "willRetry")]
        will_retry: bool,
    },
    /// A remote document delta changed our replica.
    DocumentMerged {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        size: usize,
    },
    /// A frame could not be used and was discarded.
    FrameDiscarded {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        reason: String,
    },
    /// The provider shut down.
    Destroyed,
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(&MeshEvent) + Send + Sync>;

/// Event bus for publishing provider events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&MeshEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: MeshEvent) {
        // Snapshot first so a callback may subscribe without deadlocking.
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
