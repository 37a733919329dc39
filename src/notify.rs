use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Booking;

const CHANNEL_CAPACITY: usize = 256;

/// Change notice for one booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingNotice {
    Created(Booking),
    StatusChanged(Booking),
}

impl BookingNotice {
    pub fn booking(&self) -> &Booking {
        match self {
            BookingNotice::Created(b) | BookingNotice::StatusChanged(b) => b,
        }
    }
}

/// Broadcast hub for booking changes, one channel per facility.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<BookingNotice>>,
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
        }
    }

    /// Subscribe to a facility's notices. Creates the channel if needed.
    pub fn subscribe(&self, facility: &str) -> broadcast::Receiver<BookingNotice> {
        let sender = self
            .channels
            .entry(facility.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, notice: BookingNotice) {
        if let Some(sender) = self.channels.get(&notice.booking().facility) {
            let _ = sender.send(notice);
        }
    }
}
