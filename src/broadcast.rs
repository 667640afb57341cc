//! State deduplication and multicast delivery
//!
//! Every detection result passes through [`StateDeduplicator`]; only changes
//! reach subscribers. The cached last state and the channel sender sit behind
//! one lock so a new subscriber's snapshot and its live receiver are taken
//! atomically with respect to publishing.

use crate::state::ConnectionState;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Suppresses repeated identical states
///
/// Starts unset, so the first observation is always a change.
#[derive(Debug, Default, Clone)]
pub struct StateDeduplicator {
    last: Option<ConnectionState>,
}

impl StateDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a detection result; returns the state if it differs from the last
    pub fn observe(&mut self, active: bool) -> Option<ConnectionState> {
        let state = ConnectionState::from_active(active);
        if self.last == Some(state) {
            return None;
        }
        self.last = Some(state);
        Some(state)
    }

    pub fn last(&self) -> Option<ConnectionState> {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[derive(Debug)]
struct Channel {
    dedup: StateDeduplicator,
    sender: Option<broadcast::Sender<ConnectionState>>,
}

/// Multicast of state transitions with a synchronously readable current value
#[derive(Debug)]
pub struct Broadcaster {
    channel: Mutex<Channel>,
}

impl Broadcaster {
    /// `capacity` bounds how far a slow subscriber may fall behind
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            channel: Mutex::new(Channel {
                dedup: StateDeduplicator::new(),
                sender: Some(sender),
            }),
        }
    }

    /// Feed one detection result; emits and returns the state if it changed
    pub fn publish(&self, active: bool) -> Option<ConnectionState> {
        let mut channel = self.lock();
        let Some(sender) = channel.sender.clone() else {
            return None;
        };
        let state = channel.dedup.observe(active)?;
        // No receivers is fine; the cached value still updates
        let _ = sender.send(state);
        Some(state)
    }

    /// Last emitted state, `None` before the first emission
    pub fn current(&self) -> Option<ConnectionState> {
        self.lock().dedup.last()
    }

    /// Stream of the current state (if any) followed by every later transition
    ///
    /// Returns `None` once the broadcaster is closed.
    pub fn subscribe(&self) -> Option<BoxStream<'static, ConnectionState>> {
        let channel = self.lock();
        let receiver = channel.sender.as_ref()?.subscribe();
        let current = channel.dedup.last();
        drop(channel);

        let live = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(state) => return Some((state, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Subscriber fell behind, skipped {skipped} transitions");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Some(stream::iter(current).chain(live).boxed())
    }

    /// Close the channel; open streams end, later publishes are dropped
    pub fn close(&self) {
        let mut channel = self.lock();
        channel.sender = None;
        channel.dedup.reset();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().sender.is_none()
    }

    pub fn receiver_count(&self) -> usize {
        self.lock()
            .sender
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_first_observation_always_emits() {
        let mut dedup = StateDeduplicator::new();
        assert_eq!(dedup.observe(false), Some(ConnectionState::Disconnected));
    }

    #[test]
    fn test_identical_results_emit_once() {
        let mut dedup = StateDeduplicator::new();
        assert_eq!(dedup.observe(true), Some(ConnectionState::Connected));
        assert_eq!(dedup.observe(true), None);
        assert_eq!(dedup.observe(false), Some(ConnectionState::Disconnected));
        assert_eq!(dedup.observe(false), None);
        assert_eq!(dedup.last(), Some(ConnectionState::Disconnected));

        dedup.reset();
        assert_eq!(dedup.observe(false), Some(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_transition_in_order() {
        let broadcaster = Broadcaster::new(8);
        let mut first = broadcaster.subscribe().unwrap();
        let mut second = broadcaster.subscribe().unwrap();

        broadcaster.publish(true);
        broadcaster.publish(true);
        broadcaster.publish(false);

        for stream in [&mut first, &mut second] {
            assert_eq!(stream.next().await, Some(ConnectionState::Connected));
            assert_eq!(stream.next().await, Some(ConnectionState::Disconnected));
            assert!(stream.next().now_or_never().is_none());
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_current_value_only() {
        let broadcaster = Broadcaster::new(8);
        broadcaster.publish(true);
        broadcaster.publish(false);
        assert_eq!(broadcaster.current(), Some(ConnectionState::Disconnected));

        let mut late = broadcaster.subscribe().unwrap();
        assert_eq!(late.next().await, Some(ConnectionState::Disconnected));
        assert!(late.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let broadcaster = Broadcaster::new(8);
        let mut stream = broadcaster.subscribe().unwrap();
        broadcaster.close();

        assert_eq!(stream.next().await, None);
        assert!(broadcaster.is_closed());
        assert!(broadcaster.subscribe().is_none());
        assert_eq!(broadcaster.publish(true), None);
        assert_eq!(broadcaster.current(), None);
    }
}
