// Live broadcast hub: fan-out of committed state changes to observers.
//
// One process-wide registry mapping channel ids to subscribed observers.
// Delivery is fire-and-forget: `publish` never blocks the business
// transaction that triggered it, and an observer whose receiver is gone
// is silently dropped from the channel instead of failing the publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::events::AuctionEvent;

/// Handle identifying one subscribed observer within a channel.
pub type ObserverId = u64;

/// Channel id for an auction's update stream.
pub fn auction_channel(auction_id: &str) -> String {
    format!("auction:{auction_id}")
}

type ChannelMap = HashMap<String, HashMap<ObserverId, mpsc::UnboundedSender<AuctionEvent>>>;

/// Process-wide observer registry. Created at startup, torn down at
/// shutdown by closing every channel.
pub struct BroadcastHub {
    channels: Mutex<ChannelMap>,
    next_observer_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        BroadcastHub {
            channels: Mutex::new(HashMap::new()),
            next_observer_id: AtomicU64::new(1),
        }
    }

    /// Register a new observer on `channel`. Returns the observer handle
    /// and the receiving end of its event stream.
    pub fn subscribe(&self, channel: &str) -> (ObserverId, mpsc::UnboundedReceiver<AuctionEvent>) {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.lock();
        channels.entry(channel.to_string()).or_default().insert(id, tx);
        debug!("observer {id} subscribed to {channel}");
        (id, rx)
    }

    /// Remove an observer and garbage-collect the channel if it is now
    /// empty. Unknown observers are ignored.
    pub fn unsubscribe(&self, channel: &str, observer: ObserverId) {
        let mut channels = self.lock();
        if let Some(observers) = channels.get_mut(channel) {
            observers.remove(&observer);
            if observers.is_empty() {
                channels.remove(channel);
            }
        }
        debug!("observer {observer} unsubscribed from {channel}");
    }

    /// Deliver `event` to a single observer (used for the subscribe-time
    /// snapshot). A failed send drops the observer like `publish` does.
    pub fn send_to(&self, channel: &str, observer: ObserverId, event: AuctionEvent) {
        let mut channels = self.lock();
        let Some(observers) = channels.get_mut(channel) else {
            return;
        };
        let delivered = observers
            .get(&observer)
            .is_some_and(|tx| tx.send(event).is_ok());
        if !delivered {
            observers.remove(&observer);
            if observers.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Deliver `event` to every current subscriber of `channel`.
    /// Best-effort, at-most-once: observers whose receiver has been
    /// dropped are removed rather than failing the publish.
    pub fn publish(&self, channel: &str, event: &AuctionEvent) {
        let mut channels = self.lock();
        let Some(observers) = channels.get_mut(channel) else {
            return;
        };

        let mut disconnected = Vec::new();
        for (&id, tx) in observers.iter() {
            if tx.send(event.clone()).is_err() {
                disconnected.push(id);
            }
        }
        for id in disconnected {
            debug!("dropping disconnected observer {id} from {channel}");
            observers.remove(&id);
        }
        if observers.is_empty() {
            channels.remove(channel);
        }
    }

    /// Number of observers currently subscribed to `channel`.
    pub fn observer_count(&self, channel: &str) -> usize {
        self.lock().get(channel).map_or(0, HashMap::len)
    }

    /// Close every channel. Subscribers see their stream end.
    pub fn shutdown(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelMap> {
        self.channels.lock().expect("broadcast hub mutex poisoned")
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}
