//! In-process priority queue delivering entries in timestamp order, with
//! a watermark that allows "publishing into the future": an entry can be
//! inserted before the queue's head has reached its timestamp, and stays
//! withheld from the consumer until a later `publish`/`update_head` call
//! advances the head past it.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::entry::IndexTimestamp;
use crate::error::{Error, Result};

struct State<E> {
    last_index: u64,
    last_us: i64,
    entries: BTreeMap<(i64, u64), E>,
    destroying: bool,
}

struct Inner<E> {
    state: Mutex<State<E>>,
    cv: Condvar,
}

/// Thread-safe priority queue with one dedicated consumer thread, spawned
/// at construction. Dropping the queue signals the consumer to exit and
/// blocks until it does; any entries still withheld for the future are
/// dropped rather than delivered.
pub struct PriorityQueue<E> {
    inner: Arc<Inner<E>>,
    handle: Option<JoinHandle<()>>,
}

impl<E> PriorityQueue<E>
where
    E: Send + 'static,
{
    pub fn new(consumer: impl FnMut(E, IndexTimestamp, IndexTimestamp) + Send + 'static) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                last_index: 0,
                last_us: i64::MIN,
                entries: BTreeMap::new(),
                destroying: false,
            }),
            cv: Condvar::new(),
        });
        let thread_inner = Arc::clone(&inner);
        let handle = std::thread::spawn(move || consume(thread_inner, consumer));
        Self {
            inner,
            handle: Some(handle),
        }
    }

    /// Requires `us` to be strictly greater than the current watermark.
    /// Advances the watermark to `us`.
    pub fn publish(&self, payload: E, us: i64) -> Result<IndexTimestamp> {
        self.insert(payload, us, true)
    }

    /// Like [`PriorityQueue::publish`] but leaves the watermark untouched:
    /// the entry is visible to ordering but withheld from delivery until
    /// a later call advances the watermark past `us`.
    pub fn publish_into_future(&self, payload: E, us: i64) -> Result<IndexTimestamp> {
        self.insert(payload, us, false)
    }

    fn insert(&self, payload: E, us: i64, advance_watermark: bool) -> Result<IndexTimestamp> {
        let mut state = self.inner.state.lock().unwrap();
        if us <= state.last_us {
            return Err(Error::InconsistentTimestamp);
        }
        state.last_index += 1;
        let index = state.last_index;
        if advance_watermark {
            state.last_us = us;
        }
        state.entries.insert((us, index), payload);
        drop(state);
        self.inner.cv.notify_all();
        Ok(IndexTimestamp::new(index, us))
    }

    /// Advances the watermark without inserting an entry. The deliverable
    /// set may grow as a result.
    pub fn update_head(&self, us: i64) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if us <= state.last_us {
            return Err(Error::InconsistentTimestamp);
        }
        state.last_us = us;
        drop(state);
        self.inner.cv.notify_all();
        Ok(())
    }

    pub fn last_idxts(&self) -> IndexTimestamp {
        let state = self.inner.state.lock().unwrap();
        last_idxts_locked(&state)
    }

    /// Number of entries currently held (delivered or withheld).
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn last_idxts_locked<E>(state: &State<E>) -> IndexTimestamp {
    if state.last_index == 0 {
        IndexTimestamp::UNINITIALIZED
    } else {
        IndexTimestamp::new(state.last_index, state.last_us)
    }
}

fn consume<E>(inner: Arc<Inner<E>>, mut consumer: impl FnMut(E, IndexTimestamp, IndexTimestamp)) {
    loop {
        let mut state = inner.state.lock().unwrap();
        loop {
            if state.destroying {
                return;
            }
            let ready = state
                .entries
                .keys()
                .next()
                .is_some_and(|&(us, _)| us <= state.last_us);
            if ready {
                break;
            }
            state = inner.cv.wait(state).unwrap();
        }
        let key = *state.entries.keys().next().unwrap();
        let payload = state.entries.remove(&key).unwrap();
        let last_idxts = last_idxts_locked(&state);
        drop(state);
        consumer(payload, IndexTimestamp::new(key.1, key.0), last_idxts);
    }
}

impl<E> Drop for PriorityQueue<E> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.destroying = true;
            state.entries.clear();
        }
        self.inner.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
