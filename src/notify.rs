use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of committed events, per channel and as one firehose.
///
/// A channel is a facility id (facility and space events) or a space id
/// (stay events); see [`Event::channel`]. Slow receivers lag and skip
/// rather than holding back writers.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
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

    /// Subscribe to one channel. Creates the channel if needed.
    pub fn subscribe(&self, channel: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Every committed event, in commit order.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// Publish on `channel` and the firehose. Channels whose last receiver
    /// went away are dropped.
    pub fn send(&self, channel: Ulid, event: &Event) {
        let _ = self.all.send(event.clone());
        let orphaned = match self.channels.get(&channel) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => false,
        };
        if orphaned {
            self.channels
                .remove_if(&channel, |_, sender| sender.receiver_count() == 0);
        }
    }

    /// Number of live per-channel senders.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
