//! Domain events and the listener bus
//!
//! The controller raises events; subscribers (terminal frontend, serial
//! head, tests) register per event kind. Dispatch is synchronous on the
//! thread that raised the event, so listeners must not block.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Reason carried by a `StatusChanged` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusReason {
    /// Natural end of the whole disc (or shuffle playlist).
    DiscEnd,
    /// Fatal playback error; awaiting explicit user recovery.
    Error,
    /// No disc present / load failed before a disc was bound.
    NoDisc,
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusReason::DiscEnd => write!(f, "disc_end"),
            StatusReason::Error => write!(f, "error"),
            StatusReason::NoDisc => write!(f, "no_disc"),
        }
    }
}

/// Events raised by the controller.
///
/// Track numbers in events are 1-based (display convention); the
/// sequencer and transports are 0-based internally.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    TrackChanged { number: usize, total: usize },
    CdLoaded { track_count: usize },
    StatusChanged { reason: StatusReason },
    LoadingProgress { current: usize, total: usize, stage: String },
}

/// Event kind, used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TrackChanged,
    CdLoaded,
    StatusChanged,
    LoadingProgress,
}

impl PlayerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PlayerEvent::TrackChanged { .. } => EventKind::TrackChanged,
            PlayerEvent::CdLoaded { .. } => EventKind::CdLoaded,
            PlayerEvent::StatusChanged { .. } => EventKind::StatusChanged,
            PlayerEvent::LoadingProgress { .. } => EventKind::LoadingProgress,
        }
    }
}

type Listener = Box<dyn Fn(&PlayerEvent) + Send + Sync>;

/// Opaque handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Small multi-subscriber event registry.
///
/// Subscribers register by event kind. `emit` dispatches synchronously to
/// every listener registered for the event's kind, in subscription order.
#[derive(Default)]
pub struct ListenerBus {
    listeners: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Listener)>>>,
    next_id: AtomicU64,
}

impl ListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut listeners = self.listeners.lock().unwrap();
        for entries in listeners.values_mut() {
            entries.retain(|(entry_id, _)| *entry_id != id);
        }
    }

    pub fn emit(&self, event: &PlayerEvent) {
        let listeners = self.listeners.lock().unwrap();
        if let Some(entries) = listeners.get(&event.kind()) {
            for (_, listener) in entries {
                listener(event);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().unwrap().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_subscribe_and_emit() {
        let bus = ListenerBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        bus.subscribe(EventKind::TrackChanged, move |event| {
            if let PlayerEvent::TrackChanged { number, total } = event {
                assert_eq!(*number, 2);
                assert_eq!(*total, 5);
            }
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&PlayerEvent::TrackChanged { number: 2, total: 5 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kind_filtering() {
        let bus = ListenerBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        bus.subscribe(EventKind::StatusChanged, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&PlayerEvent::TrackChanged { number: 1, total: 1 });
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.emit(&PlayerEvent::StatusChanged {
            reason: StatusReason::DiscEnd,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = ListenerBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let id = bus.subscribe(EventKind::CdLoaded, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count(), 1);

        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);

        bus.emit(&PlayerEvent::CdLoaded { track_count: 12 });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_status_reason_strings() {
        assert_eq!(StatusReason::DiscEnd.to_string(), "disc_end");
        assert_eq!(StatusReason::Error.to_string(), "error");
        assert_eq!(StatusReason::NoDisc.to_string(), "no_disc");
    }
}
