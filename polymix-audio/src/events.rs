//! Engine notifications
//!
//! State, position and meter changes are published on an [`EventBus`]: an
//! observer list of bounded channels. A subscriber that falls behind loses
//! events instead of stalling the audio threads; a dropped receiver is pruned
//! on the next emit.

use crate::meter::LevelSnapshot;
use crate::state::PlaybackState;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Per-subscriber channel capacity
const EVENT_CAPACITY: usize = 1024;

/// Identifier of a source inside one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events sent from the engine and its sources
///
/// `source: None` means the event concerns the engine as a whole.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged {
        source: Option<SourceId>,
        state: PlaybackState,
    },
    PositionChanged {
        source: Option<SourceId>,
        position: Duration,
    },
    /// Master output levels, plus live input levels while recording
    Levels {
        output: LevelSnapshot,
        input: Option<LevelSnapshot>,
    },
    SourceAdded(SourceId),
    SourceRemoved(SourceId),
    /// The source emitted its last block
    EndOfStream(SourceId),
    /// The decoder was recreated after a failure and resumed at `position`
    DecoderRecovered {
        source: SourceId,
        position: Duration,
    },
    Error {
        source: Option<SourceId>,
        message: String,
    },
}

/// Fan-out list of event subscribers
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = bounded(EVENT_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber without blocking
    pub fn emit(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.emit(EngineEvent::SourceAdded(SourceId(7)));

        assert!(matches!(a.try_recv(), Ok(EngineEvent::SourceAdded(SourceId(7)))));
        assert!(matches!(b.try_recv(), Ok(EngineEvent::SourceAdded(SourceId(7)))));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(EngineEvent::SourceRemoved(SourceId(1)));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }

    #[test]
    fn test_full_subscriber_does_not_block() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        for i in 0..(EVENT_CAPACITY + 10) {
            bus.emit(EngineEvent::SourceAdded(SourceId(i as u64)));
        }
        assert_eq!(rx.len(), EVENT_CAPACITY);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
