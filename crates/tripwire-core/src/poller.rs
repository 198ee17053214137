//! # Hit poller
//!
//! Drains the shared channel's hit ring on a fixed interval and publishes a
//! [`WatchEvent::Hit`] for every entry, in ring order.
//!
//! ## Buffer math
//!
//! Indices are free-running `u32` counters; the ring slot is `index % 1024`.
//! Each tick computes `pending = write - read` (wrapping, read as signed):
//!
//! - `0..=1024`: drain exactly `pending` entries
//! - `> 1024`: the agent lapped the poller; the oldest entries were
//!   overwritten, so reading restarts at `write - 1024`
//! - negative: the indices are inconsistent (agent restarted); reading
//!   restarts at `write - 1024`, clamped at zero
//!
//! Afterwards `read = write`. The poller never blocks waiting for hits and
//! never lets an error escape its thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, warn};

use crate::channel::{SharedChannel, RING_CAPACITY};
use crate::error::Result;
use crate::events::{EventHub, WatchEvent};
use crate::types::HitRecord;

/// Result of one drain
#[derive(Debug, Default)]
pub struct DrainOutcome
{
    /// Records in ring order
    pub hits: Vec<HitRecord>,
    /// Entries overwritten before they could be read (0 if unknown)
    pub dropped: u64,
    /// Whether the read index had to be repositioned
    pub resynchronised: bool,
}

/// Drain state: the sequence counter carried across ticks
#[derive(Debug, Default)]
pub struct HitPoller
{
    next_sequence: u64,
}

impl HitPoller
{
    /// Create a poller whose first record gets sequence 0
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Drain every pending entry of `channel`.
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub fn drain(&mut self, channel: &SharedChannel) -> DrainOutcome
    {
        let write = channel.write_index();
        let read = channel.read_index();
        let pending = write.wrapping_sub(read) as i32;
        let mut outcome = DrainOutcome::default();

        let start = if pending < 0 {
            warn!("Hit ring indices inconsistent (read {read}, write {write}); resynchronising");
            outcome.resynchronised = true;
            write.saturating_sub(RING_CAPACITY)
        } else if pending as u32 > RING_CAPACITY {
            outcome.dropped = u64::from(pending as u32 - RING_CAPACITY);
            outcome.resynchronised = true;
            warn!("Hit ring overflowed; {} hit(s) lost", outcome.dropped);
            self.next_sequence += outcome.dropped;
            write.wrapping_sub(RING_CAPACITY)
        } else {
            read
        };

        let received_at = SystemTime::now();
        let mut index = start;
        while index != write {
            let (address, thread_id) = channel.entry(index);
            outcome.hits.push(HitRecord {
                address,
                thread_id,
                sequence: self.next_sequence,
                received_at,
            });
            self.next_sequence += 1;
            index = index.wrapping_add(1);
        }

        channel.set_read_index(write);
        outcome
    }
}

/// Background thread running a [`HitPoller`]
pub struct PollerHandle
{
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

fn poll_once(poller: &mut HitPoller, channel: &SharedChannel, events: &EventHub)
{
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let outcome = poller.drain(channel);
        for hit in outcome.hits {
            events.publish(&WatchEvent::Hit(hit));
        }
    }));
    if result.is_err() {
        error!("Hit poll iteration panicked; continuing");
    }
}

impl PollerHandle
{
    /// Start polling `channel` every `interval`
    ///
    /// ## Errors
    ///
    /// - `Io`: the thread could not be spawned
    pub fn spawn(channel: Arc<SharedChannel>, events: EventHub, interval: Duration) -> Result<Self>
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("tripwire-poller".to_string())
            .spawn(move || {
                let mut poller = HitPoller::new();
                debug!("Poller started on {}", channel.name());
                while !stop_flag.load(Ordering::Acquire) {
                    poll_once(&mut poller, &channel, &events);
                    thread::park_timeout(interval);
                }
                // Pick up anything recorded between the last tick and the stop
                poll_once(&mut poller, &channel, &events);
                debug!("Poller stopped on {}", channel.name());
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop the thread after a final drain and wait for it.
    pub fn stop(mut self)
    {
        self.shutdown();
    }

    fn shutdown(&mut self)
    {
        if let Some(thread) = self.thread.take() {
            self.stop.store(true, Ordering::Release);
            thread.thread().unpark();
            if thread.join().is_err() {
                error!("Poller thread panicked");
            }
        }
    }
}

impl Drop for PollerHandle
{
    fn drop(&mut self)
    {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::channel::{AgentChannel, ChannelHeader, HeapRegion, CHANNEL_SIZE};
    use crate::types::{Address, ThreadId};

    fn pair() -> (SharedChannel, AgentChannel)
    {
        let region = HeapRegion::new(CHANNEL_SIZE);
        let controller = SharedChannel::from_region(Box::new(region.clone()), "Local\\poller").unwrap();
        controller.initialize(&ChannelHeader::default());
        (controller, AgentChannel::open(Box::new(region)).unwrap())
    }

    #[test]
    fn test_drains_in_order_exactly_once()
    {
        let (controller, agent) = pair();
        for i in 0..5u32 {
            agent.record_hit(Address::new(0x1000 + u64::from(i)), ThreadId(i));
        }

        let mut poller = HitPoller::new();
        let outcome = poller.drain(&controller);
        assert_eq!(outcome.hits.len(), 5);
        for (i, hit) in outcome.hits.iter().enumerate() {
            assert_eq!(hit.address, Address::new(0x1000 + i as u64));
            assert_eq!(hit.sequence, i as u64);
        }
        assert_eq!(controller.read_index(), 5);
        assert!(poller.drain(&controller).hits.is_empty());
    }

    #[test]
    fn test_overflow_returns_at_most_capacity()
    {
        let (controller, agent) = pair();
        for i in 0..(RING_CAPACITY + 10) {
            agent.record_hit(Address::new(u64::from(i)), ThreadId(1));
        }

        let mut poller = HitPoller::new();
        let outcome = poller.drain(&controller);
        assert_eq!(outcome.hits.len(), RING_CAPACITY as usize);
        assert_eq!(outcome.dropped, 10);
        assert!(outcome.resynchronised);
        // Oldest surviving entry is the 11th write
        assert_eq!(outcome.hits[0].address, Address::new(10));
        assert_eq!(outcome.hits[0].sequence, 10);
        assert_eq!(controller.read_index(), RING_CAPACITY + 10);
    }

    #[test]
    fn test_simulated_wrap_never_exceeds_capacity()
    {
        let (controller, agent) = pair();
        controller.set_read_index(10);
        agent.force_write_index(5_000);

        let outcome = HitPoller::new().drain(&controller);
        assert!(outcome.hits.len() <= RING_CAPACITY as usize);
        assert_eq!(controller.read_index(), 5_000);
    }

    #[test]
    fn test_negative_pending_resynchronises()
    {
        let (controller, agent) = pair();
        controller.set_read_index(500);
        agent.force_write_index(3);

        let outcome = HitPoller::new().drain(&controller);
        assert!(outcome.resynchronised);
        assert_eq!(outcome.hits.len(), 3);
        assert_eq!(controller.read_index(), 3);
    }

    #[test]
    fn test_index_wraps_around_u32()
    {
        let (controller, agent) = pair();
        controller.set_read_index(u32::MAX - 1);
        agent.force_write_index(u32::MAX - 1);
        for i in 0..4u32 {
            agent.record_hit(Address::new(u64::from(i)), ThreadId(2));
        }

        let outcome = HitPoller::new().drain(&controller);
        assert_eq!(outcome.hits.len(), 4);
        assert!(!outcome.resynchronised);
        assert_eq!(controller.read_index(), 2);
    }

    #[test]
    fn test_thread_publishes_and_final_drain_on_stop()
    {
        let region = HeapRegion::new(CHANNEL_SIZE);
        let controller = Arc::new(SharedChannel::from_region(Box::new(region.clone()), "Local\\thread").unwrap());
        controller.initialize(&ChannelHeader::default());
        let agent = AgentChannel::open(Box::new(region)).unwrap();

        let events = EventHub::new();
        let receiver = events.subscribe();
        let handle = PollerHandle::spawn(Arc::clone(&controller), events, Duration::from_secs(60)).unwrap();
        agent.record_hit(Address::new(0x42), ThreadId(9));
        handle.stop();

        let received: Vec<_> = receiver.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert!(matches!(received[0], WatchEvent::Hit(hit) if hit.address == Address::new(0x42)));
    }
}
