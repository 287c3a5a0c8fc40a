use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::BookingEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Fire-and-forget fan-out of booking events.
///
/// Subscribers listen to one court or to everything. Sending never blocks
/// and never fails the booking; lagging receivers drop the oldest events.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<BookingEvent>>,
    all: broadcast::Sender<BookingEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to events for one resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: &str) -> broadcast::Receiver<BookingEvent> {
        self.channels
            .entry(resource_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingEvent> {
        self.all.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, event: &BookingEvent) {
        let resource_id = &event.reservation().resource_id;
        if let Some(sender) = self.channels.get(resource_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
    }
}
