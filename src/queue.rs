//! Bounded hand-off queue between frame delivery and the encoding workers.
//!
//! Multi-producer (driver callback threads), multi-consumer (encoder pool).
//! The queue is bounded with an explicit overflow policy; the default drops
//! the oldest queued frame so consumers always see the freshest data when
//! encoding falls behind the arrival rate.
//!
//! Shutdown contract: `halt()` flips the enabled flag, **discards** anything
//! still queued, and wakes every blocked producer and consumer. Frames queued
//! at halt time are intentionally not drained: a halting session is being
//! torn down, and publishing stale frames after the restarted session has
//! begun would interleave two capture runs on the bus. The restarted session
//! simply recaptures.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

/// What to do with an incoming item when the queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Block the producer until space frees up or the queue is halted.
    Block,
    /// Evict the head (oldest item) and enqueue the new one.
    DropOldest,
    /// Reject the incoming item, keep what is queued.
    DropNewest,
}

impl OverflowPolicy {
    /// Parse the configuration spelling ("block", "drop-oldest", "drop-newest").
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            "drop-newest" => Ok(OverflowPolicy::DropNewest),
            other => bail!("unknown overflow policy \"{}\"", other),
        }
    }
}

/// Outcome of a `push`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushResult {
    /// Item enqueued; nothing was lost.
    Queued,
    /// Item enqueued after evicting the oldest queued item.
    DroppedOldest,
    /// Item rejected because the queue was full.
    DroppedNewest,
    /// Item rejected because the queue has been halted.
    Halted,
}

struct QueueState<T> {
    items: VecDeque<T>,
    enabled: bool,
}

/// FIFO hand-off queue with a capacity bound and cooperative shutdown.
pub struct FrameQueue<T> {
    state: Mutex<QueueState<T>>,
    item_ready: Condvar,
    space_ready: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                enabled: true,
            }),
            item_ready: Condvar::new(),
            space_ready: Condvar::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().expect("frame queue mutex poisoned")
    }

    /// Append an item at the tail. Never blocks except under
    /// `OverflowPolicy::Block` when the queue is full.
    pub fn push(&self, item: T) -> PushResult {
        let mut state = self.lock();
        if !state.enabled {
            return PushResult::Halted;
        }
        if state.items.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Block => {
                    while state.enabled && state.items.len() >= self.capacity {
                        state = self
                            .space_ready
                            .wait(state)
                            .expect("frame queue mutex poisoned");
                    }
                    if !state.enabled {
                        return PushResult::Halted;
                    }
                }
                OverflowPolicy::DropOldest => {
                    state.items.pop_front();
                    state.items.push_back(item);
                    drop(state);
                    self.item_ready.notify_one();
                    return PushResult::DroppedOldest;
                }
                OverflowPolicy::DropNewest => return PushResult::DroppedNewest,
            }
        }
        state.items.push_back(item);
        drop(state);
        self.item_ready.notify_one();
        PushResult::Queued
    }

    /// Take the head item, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout or once the queue has been halted.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if !state.enabled {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.space_ready.notify_one();
                return Some(item);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _timed_out) = self
                .item_ready
                .wait_timeout(state, remaining)
                .expect("frame queue mutex poisoned");
            state = guard;
        }
    }

    /// Disable the queue, discard queued items, wake every waiter. Idempotent.
    pub fn halt(&self) {
        let discarded;
        {
            let mut state = self.lock();
            state.enabled = false;
            discarded = state.items.len();
            state.items.clear();
        }
        self.item_ready.notify_all();
        self.space_ready.notify_all();
        if discarded > 0 {
            log::debug!("frame queue halted, discarded {} queued item(s)", discarded);
        }
    }

    /// Observed by workers as their outer loop condition.
    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pop_returns_items_in_fifo_order() {
        let queue = FrameQueue::new(16, OverflowPolicy::DropOldest);
        for n in 0..5 {
            assert_eq!(queue.push(n), PushResult::Queued);
        }
        for n in 0..5 {
            assert_eq!(queue.pop(Duration::from_millis(10)), Some(n));
        }
        assert_eq!(queue.pop(Duration::from_millis(10)), None);
    }

    #[test]
    fn per_producer_order_is_preserved_under_concurrency() {
        let queue = Arc::new(FrameQueue::new(4096, OverflowPolicy::Block));
        let mut producers = Vec::new();
        for producer in 0u64..4 {
            let queue = queue.clone();
            producers.push(thread::spawn(move || {
                for n in 0u64..250 {
                    queue.push((producer, n));
                }
            }));
        }
        for handle in producers {
            handle.join().unwrap();
        }

        let mut last_seen = [None::<u64>; 4];
        let mut total = 0;
        while let Some((producer, n)) = queue.pop(Duration::from_millis(10)) {
            if let Some(prev) = last_seen[producer as usize] {
                assert!(n > prev, "producer {} reordered: {} after {}", producer, n, prev);
            }
            last_seen[producer as usize] = Some(n);
            total += 1;
        }
        assert_eq!(total, 1000);
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue: FrameQueue<u32> = FrameQueue::new(4, OverflowPolicy::DropOldest);
        let started = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(50)), None);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn halt_discards_queued_items_and_disables() {
        let queue = FrameQueue::new(16, OverflowPolicy::DropOldest);
        queue.push(1);
        queue.push(2);
        queue.halt();
        assert!(!queue.is_enabled());
        // Discard policy: items queued before halt are not delivered.
        assert_eq!(queue.pop(Duration::from_millis(10)), None);
        assert!(queue.is_empty());
        // Idempotent.
        queue.halt();
        assert!(!queue.is_enabled());
    }

    #[test]
    fn halt_wakes_blocked_consumers_promptly() {
        let queue: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::new(4, OverflowPolicy::DropOldest));
        let popper = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        queue.halt();
        assert_eq!(popper.join().unwrap(), None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn push_after_halt_is_rejected() {
        let queue = FrameQueue::new(4, OverflowPolicy::DropOldest);
        queue.halt();
        assert_eq!(queue.push(1), PushResult::Halted);
        assert!(queue.is_empty());
    }

    #[test]
    fn drop_oldest_evicts_the_head() {
        let queue = FrameQueue::new(2, OverflowPolicy::DropOldest);
        assert_eq!(queue.push(1), PushResult::Queued);
        assert_eq!(queue.push(2), PushResult::Queued);
        assert_eq!(queue.push(3), PushResult::DroppedOldest);
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(2));
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(3));
    }

    #[test]
    fn drop_newest_rejects_the_incoming_item() {
        let queue = FrameQueue::new(2, OverflowPolicy::DropNewest);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.push(3), PushResult::DroppedNewest);
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(1));
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(2));
    }

    #[test]
    fn block_policy_waits_for_space() {
        let queue = Arc::new(FrameQueue::new(1, OverflowPolicy::Block));
        queue.push(1);
        let pusher = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.pop(Duration::from_millis(10)), Some(1));
        assert_eq!(pusher.join().unwrap(), PushResult::Queued);
        assert_eq!(queue.pop(Duration::from_millis(100)), Some(2));
    }

    #[test]
    fn halt_releases_blocked_producers() {
        let queue = Arc::new(FrameQueue::new(1, OverflowPolicy::Block));
        queue.push(1);
        let pusher = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(50));
        queue.halt();
        assert_eq!(pusher.join().unwrap(), PushResult::Halted);
    }

    #[test]
    fn overflow_policy_parse() {
        assert_eq!(OverflowPolicy::parse("block").unwrap(), OverflowPolicy::Block);
        assert_eq!(
            OverflowPolicy::parse("Drop-Oldest").unwrap(),
            OverflowPolicy::DropOldest
        );
        assert_eq!(
            OverflowPolicy::parse("drop-newest").unwrap(),
            OverflowPolicy::DropNewest
        );
        assert!(OverflowPolicy::parse("drop-random").is_err());
    }
}
