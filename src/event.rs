//! In-process notifications between services.
//!
//! The coordinator listens for [`Event::ShutdownRequested`]; the status LED
//! wakes on connection and strip changes. Everything else is informational.

use anyhow::{Result, anyhow};
use log::debug;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Stop the daemon, e.g. after the setup button was held.
    ShutdownRequested,
    /// A fade finished and the pixel buffer holds new values.
    LedStatusChanged,
    /// Broker link went up (`true`) or down (`false`).
    MqttConnected(bool),
}

/// Broadcast channel shared by every service. Cloning shares the channel.
///
/// ```no_run
/// use neopixeld::event::{Event, EventBus};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
/// bus.notify(Event::LedStatusChanged);
/// # let _ = rx.try_recv();
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Sends `event`; fails when nobody is subscribed.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|e| anyhow!("No listener for {:?}", e.0))
    }

    /// Like [`publish`](Self::publish) for events nobody has to hear.
    pub fn notify(&self, event: Event) {
        if let Err(e) = self.publish(event) {
            debug!("{e}");
        }
    }

    /// Receiver for every event sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
