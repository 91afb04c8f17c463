//! Fixed-capacity in-process FIFO ring buffer with a single background
//! consumer and a choice of overflow policy.
//!
//! Every publish attempt consumes one logical index, whether or not the
//! entry is actually stored: under [`OverflowPolicy::Drop`] a full queue
//! still advances the counter so the next delivered entry's index shows
//! the gap left by the drops, letting a consumer compute
//! `current.index - expected_next_index` to learn how many were lost.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::clock::Clock;
use crate::entry::IndexTimestamp;

/// What `publish` does when the ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the entry, bump the drop counter, keep the index counter
    /// advancing so the gap is visible on the next delivered entry.
    Drop,
    /// Block the publishing thread until the consumer frees a slot. No
    /// fairness is guaranteed between concurrent publishers, but any one
    /// publisher's own entries stay in the order it issued them.
    Block,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Free,
    Importing,
    Ready,
    Exporting,
}

struct Slot<E> {
    status: SlotStatus,
    idxts: IndexTimestamp,
    payload: Option<E>,
}

struct State<E> {
    slots: Vec<Slot<E>>,
    head: usize,
    tail: usize,
    next_index: u64,
    last_idxts: IndexTimestamp,
    total_dropped: u64,
    destroying: bool,
}

struct Inner<E> {
    state: Mutex<State<E>>,
    cv: Condvar,
    clock: Arc<dyn Clock>,
    capacity: usize,
    policy: OverflowPolicy,
}

/// A fixed-capacity FIFO with one dedicated consumer thread, spawned at
/// construction. Dropping the queue signals the consumer to exit and
/// blocks until it does; entries still in the ring are discarded.
pub struct RingQueue<E> {
    inner: Arc<Inner<E>>,
    handle: Option<JoinHandle<()>>,
}

impl<E> RingQueue<E>
where
    E: Send + 'static,
{
    pub fn new(
        capacity: usize,
        policy: OverflowPolicy,
        clock: Arc<dyn Clock>,
        consumer: impl FnMut(E, IndexTimestamp, IndexTimestamp) + Send + 'static,
    ) -> Self {
        assert!(capacity > 0, "ring queue capacity must be positive");
        let slots = (0..capacity)
            .map(|_| Slot {
                status: SlotStatus::Free,
                idxts: IndexTimestamp::UNINITIALIZED,
                payload: None,
            })
            .collect();
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                slots,
                head: 0,
                tail: 0,
                next_index: 0,
                last_idxts: IndexTimestamp::UNINITIALIZED,
                total_dropped: 0,
                destroying: false,
            }),
            cv: Condvar::new(),
            clock,
            capacity,
            policy,
        });
        let thread_inner = Arc::clone(&inner);
        let handle = std::thread::spawn(move || consume(thread_inner, consumer));
        Self {
            inner,
            handle: Some(handle),
        }
    }

    /// Returns `(true, idxts)` if accepted. Under `Drop`, a full ring
    /// returns `(false, IndexTimestamp::UNINITIALIZED)` without blocking.
    /// Under `Block`, always returns `(true, idxts)` unless the queue is
    /// being destroyed concurrently.
    pub fn publish(&self, payload: E) -> (bool, IndexTimestamp) {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.destroying {
                return (false, IndexTimestamp::UNINITIALIZED);
            }
            let pos = state.head % self.inner.capacity;
            if state.slots[pos].status == SlotStatus::Free {
                break;
            }
            match self.inner.policy {
                OverflowPolicy::Drop => {
                    let us = self.inner.clock.now_us();
                    let index = state.next_index;
                    state.next_index += 1;
                    state.total_dropped += 1;
                    state.last_idxts = IndexTimestamp::new(index, us);
                    return (false, IndexTimestamp::UNINITIALIZED);
                }
                OverflowPolicy::Block => {
                    state = self.inner.cv.wait(state).unwrap();
                }
            }
        }

        let us = self.inner.clock.now_us();
        let index = state.next_index;
        state.next_index += 1;
        let idxts = IndexTimestamp::new(index, us);
        state.last_idxts = idxts;

        let pos = state.head % self.inner.capacity;
        state.head += 1;
        state.slots[pos].status = SlotStatus::Importing;
        state.slots[pos].idxts = idxts;
        state.slots[pos].payload = Some(payload);
        state.slots[pos].status = SlotStatus::Ready;
        drop(state);
        self.inner.cv.notify_all();
        (true, idxts)
    }

    /// Total number of publishes refused since construction (`Drop`
    /// policy only; always `0` under `Block`).
    pub fn total_dropped(&self) -> u64 {
        self.inner.state.lock().unwrap().total_dropped
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

fn consume<E>(inner: Arc<Inner<E>>, mut consumer: impl FnMut(E, IndexTimestamp, IndexTimestamp)) {
    let mut tail = 0usize;
    loop {
        let mut state = inner.state.lock().unwrap();
        loop {
            if state.destroying {
                return;
            }
            if state.slots[tail].status == SlotStatus::Ready {
                break;
            }
            state = inner.cv.wait(state).unwrap();
        }
        state.slots[tail].status = SlotStatus::Exporting;
        let idxts = state.slots[tail].idxts;
        let last_idxts = state.last_idxts;
        let payload = state.slots[tail].payload.take().unwrap();
        drop(state);

        consumer(payload, idxts, last_idxts);

        let mut state = inner.state.lock().unwrap();
        state.slots[tail].status = SlotStatus::Free;
        drop(state);
        inner.cv.notify_all();
        tail = (tail + 1) % inner.capacity;
    }
}

impl<E> Drop for RingQueue<E> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.destroying = true;
        }
        self.inner.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(MockClock::new(0))
    }

    #[test]
    fn drop_policy_reports_gap_s6() {
        let (tx, rx) = mpsc::channel();
        let suspended = Arc::new(AtomicBool::new(true));
        let suspended_for_consumer = Arc::clone(&suspended);
        let q: RingQueue<String> = RingQueue::new(10, OverflowPolicy::Drop, clock(), move |payload, idxts, last| {
            while suspended_for_consumer.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            tx.send((payload, idxts, last)).unwrap();
        });

        let mut accepted = 0u32;
        let mut dropped = 0u32;
        for i in 0..25 {
            let (ok, _) = q.publish(format!("M{i:02}"));
            if ok {
                accepted += 1;
            } else {
                dropped += 1;
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(dropped, 15);
        assert_eq!(q.total_dropped(), 15);
        suspended.store(false, Ordering::SeqCst);

        let mut expected_next_index = 0u64;
        let mut last_accepted_index = None;
        for _ in 0..10 {
            let (_, idxts, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(idxts.index, expected_next_index);
            expected_next_index += 1;
            last_accepted_index = Some(idxts.index);
        }

        let (ok, _) = q.publish("Plus one".into());
        assert!(ok);
        let (payload, idxts, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(payload, "Plus one");
        let gap = idxts.index - (last_accepted_index.unwrap() + 1);
        assert_eq!(gap, 15);
    }

    #[test]
    fn block_policy_delivers_every_publish_in_order() {
        let (tx, rx) = mpsc::channel();
        let q: RingQueue<u32> = RingQueue::new(4, OverflowPolicy::Block, clock(), move |payload, idxts, _last| {
            tx.send((payload, idxts)).unwrap();
        });

        for i in 0..20u32 {
            let (ok, _) = q.publish(i);
            assert!(ok);
        }

        for expected in 0..20u32 {
            let (payload, idxts) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(payload, expected);
            assert_eq!(idxts.index, expected as u64);
        }
        assert_eq!(q.total_dropped(), 0);
    }

    #[test]
    fn dropping_queue_stops_consumer_thread() {
        let q: RingQueue<u32> = RingQueue::new(2, OverflowPolicy::Drop, clock(), |_, _, _| {});
        q.publish(1);
        drop(q);
    }
}
