//! Core notification channel
//!
//! The reconciler core emits state-change notifications here instead of
//! driving any presentation layer directly. Subscribers (a GUI, a status
//! line, tests) attach through [`EventBus::subscribe`]; emitting never
//! blocks and tolerates having no subscribers at all.

use tokio::sync::broadcast;

/// State changes the core announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// The live host device list changed (attach or detach).
    DeviceListChanged,
    /// The VM crossed a reachability edge.
    ReachabilityChanged { reachable: bool },
    /// The persisted passthrough list changed.
    PassthroughTableChanged,
}

/// Broadcast fan-out for [`CoreEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Lagging or absent subscribers are not an error.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
