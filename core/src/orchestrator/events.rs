use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use serde::Serialize;

use crate::models::Device;

use super::progress::{SyncPhase, SyncProgress};

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Progress(SyncProgress),
    Phase { phase: SyncPhase },
    DeviceConnected { device: Device },
    DeviceDisconnected { device: Device },
    PasswordRequired { device_id: String },
    WaitingForPasscode { device_id: String },
    Error { message: String },
    Complete {
        contacts: usize,
        conversations: usize,
        messages: usize,
    },
}

/// Fan-out of sync events to any number of channel subscribers. Subscribers
/// whose receiver was dropped are pruned on the next emit.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Sender<SyncEvent>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (SubscriptionId, Receiver<SyncEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel();
        if let Ok(mut guard) = self.subscribers.lock() {
            guard.push((id, tx));
        }
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        if let Ok(mut guard) = self.subscribers.lock() {
            let before = guard.len();
            guard.retain(|(sub_id, _)| *sub_id != id);
            return guard.len() != before;
        }
        false
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Ok(mut guard) = self.subscribers.lock() {
            guard.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsubscribed_receivers_get_nothing() {
        let bus = EventBus::new();
        let (first, rx_first) = bus.subscribe();
        let (_second, rx_second) = bus.subscribe();
        bus.emit(SyncEvent::Error { message: "one".to_string() });
        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        bus.emit(SyncEvent::Error { message: "two".to_string() });

        let first_seen: Vec<_> = rx_first.try_iter().collect();
        let second_seen: Vec<_> = rx_second.try_iter().collect();
        assert_eq!(first_seen.len(), 1);
        assert_eq!(second_seen.len(), 2);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let (id, rx) = bus.subscribe();
        drop(rx);
        bus.emit(SyncEvent::Phase { phase: SyncPhase::Backup });
        assert!(!bus.unsubscribe(id));
    }
}
