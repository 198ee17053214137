//! Watch event types and the subscriber list.
//!
//! Consumers (the CLI, tests, anything embedding the session) receive events
//! over `std::sync::mpsc` channels handed out by
//! [`WatchpointSession::subscribe`](crate::session::WatchpointSession::subscribe).
//! Events arrive in poll order. Subscribers whose receiver was dropped are
//! pruned on the next publish.

use std::sync::{mpsc, Arc, Mutex};

use crate::types::HitRecord;

/// Event emitted by a watchpoint session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent
{
    /// The watched location was accessed.
    Hit(HitRecord),
    /// Monitoring stopped and the target was restored.
    Stopped,
}

impl WatchEvent
{
    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::Hit(hit) => format!("#{} access at {} by thread {}", hit.sequence, hit.address, hit.thread_id),
            Self::Stopped => "Monitoring stopped".to_string(),
        }
    }
}

/// Sender side of a watch event channel.
pub type WatchEventSender = mpsc::Sender<WatchEvent>;
/// Receiver side of a watch event channel.
pub type WatchEventReceiver = mpsc::Receiver<WatchEvent>;

/// Create a new watch event channel.
#[must_use]
pub fn event_channel() -> (WatchEventSender, WatchEventReceiver)
{
    mpsc::channel()
}

/// Subscriber list shared between the session and its poller thread
#[derive(Debug, Clone, Default)]
pub struct EventHub
{
    subscribers: Arc<Mutex<Vec<WatchEventSender>>>,
}

impl EventHub
{
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Register a new subscriber and return its receiver.
    pub fn subscribe(&self) -> WatchEventReceiver
    {
        let (sender, receiver) = event_channel();
        self.subscribers.lock().unwrap().push(sender);
        receiver
    }

    /// Deliver `event` to every live subscriber.
    pub fn publish(&self, event: &WatchEvent)
    {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Number of live subscribers (as of the last publish)
    #[must_use]
    pub fn subscriber_count(&self) -> usize
    {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests
{
    use std::time::SystemTime;

    use super::*;
    use crate::types::{Address, ThreadId};

    #[test]
    fn test_publish_reaches_all_subscribers()
    {
        let hub = EventHub::new();
        let first = hub.subscribe();
        let second = hub.subscribe();
        hub.publish(&WatchEvent::Stopped);

        assert_eq!(first.try_recv().unwrap(), WatchEvent::Stopped);
        assert_eq!(second.try_recv().unwrap(), WatchEvent::Stopped);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned()
    {
        let hub = EventHub::new();
        let kept = hub.subscribe();
        drop(hub.subscribe());

        let hit = HitRecord {
            address: Address::new(0x10),
            thread_id: ThreadId(4),
            sequence: 0,
            received_at: SystemTime::now(),
        };
        hub.publish(&WatchEvent::Hit(hit));

        assert_eq!(hub.subscriber_count(), 1);
        assert!(matches!(kept.try_recv().unwrap(), WatchEvent::Hit(h) if h.thread_id == ThreadId(4)));
    }
}
