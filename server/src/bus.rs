//! Message bus shared by all coordinator instances.
//!
//! The bus carries raw JSON frames on two channels. Publishing is
//! fire-and-forget and reports how many subscribers the frame reached; the
//! consensus engine uses that count as the expected voter count of an
//! election. Receivers decode and validate frames themselves, so a malformed
//! publish from any peer is simply dropped on the receiving side.

use log::{debug, warn};
use shared::{Channel, ControlMessage, RelayMessage};
use tokio::sync::broadcast;

/// Default per-channel buffer before slow subscribers start lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Publish/subscribe access to the control and relay channels.
pub trait MessageBus: Send + Sync {
    /// Publishes a frame, returning the number of subscribers it reached.
    fn publish(&self, channel: Channel, frame: String) -> usize;

    /// Opens a new subscription. Only frames published afterwards are seen.
    fn subscribe(&self, channel: Channel) -> BusSubscription;

    fn publish_control(&self, message: &ControlMessage) -> usize {
        self.publish(Channel::Control, message.to_frame())
    }

    fn publish_relay(&self, message: &RelayMessage) -> usize {
        self.publish(Channel::Relay, message.to_frame())
    }
}

/// Receiving end of one bus channel.
pub struct BusSubscription {
    channel: Channel,
    receiver: broadcast::Receiver<String>,
}

impl BusSubscription {
    pub fn new(channel: Channel, receiver: broadcast::Receiver<String>) -> Self {
        Self { channel, receiver }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Waits for the next frame. Returns `None` once the bus is gone.
    ///
    /// A lagging subscriber skips the frames it missed; the protocol
    /// tolerates loss.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(
                        "{:?} subscriber lagged, {} frames dropped",
                        self.channel, count
                    );
                }
            }
        }
    }

    /// Returns the next buffered frame without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        loop {
            match self.receiver.try_recv() {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// In-process bus for instances sharing one runtime.
#[derive(Clone)]
pub struct InMemoryBus {
    control: broadcast::Sender<String>,
    relay: broadcast::Sender<String>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (control, _) = broadcast::channel(capacity);
        let (relay, _) = broadcast::channel(capacity);
        Self { control, relay }
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<String> {
        match channel {
            Channel::Control => &self.control,
            Channel::Relay => &self.relay,
        }
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.sender(channel).receiver_count()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, channel: Channel, frame: String) -> usize {
        match self.sender(channel).send(frame) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("{:?} frame dropped, no subscribers", channel);
                0
            }
        }
    }

    fn subscribe(&self, channel: Channel) -> BusSubscription {
        BusSubscription::new(channel, self.sender(channel).subscribe())
    }
}
