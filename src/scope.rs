//! Primary/follower ownership with blocking teardown.
//!
//! Expresses "one primary owner, N follower borrowers, primary's
//! destruction blocks until all followers have released." A stream uses
//! this to let its subscriber threads keep running for as long as callers
//! hold them, while still giving the stream's destructor a way to ask
//! every subscriber to stop and wait for them to actually do so.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Error, Result};

type TeardownFn = Box<dyn Fn() + Send + 'static>;

struct Inner<T> {
    value: T,
    state: Mutex<State>,
    idle: Condvar,
}

struct State {
    destructing: bool,
    next_id: u64,
    followers: HashMap<u64, TeardownFn>,
}

/// The owning handle. Dropping it blocks until every follower has
/// released, after invoking each follower's teardown callback once.
pub struct Primary<T> {
    inner: Arc<Inner<T>>,
}

/// A borrowed handle. Dropping it unregisters the follower and wakes the
/// primary if it is waiting in teardown.
pub struct Follower<T> {
    inner: Arc<Inner<T>>,
    id: u64,
}

impl<T> Primary<T> {
    /// Constructs the owned value in place.
    pub fn new(value: T) -> Self {
        Primary {
            inner: Arc::new(Inner {
                value,
                state: Mutex::new(State {
                    destructing: false,
                    next_id: 0,
                    followers: HashMap::new(),
                }),
                idle: Condvar::new(),
            }),
        }
    }

    /// Registers a follower and its teardown callback. Fails with
    /// `InDestructing` once teardown has begun.
    pub fn borrow<F>(&self, on_teardown: F) -> Result<Follower<T>>
    where
        F: Fn() + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        if state.destructing {
            return Err(Error::InDestructing);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.followers.insert(id, Box::new(on_teardown));
        Ok(Follower {
            inner: Arc::clone(&self.inner),
            id,
        })
    }

    /// Number of followers currently registered.
    pub fn follower_count(&self) -> usize {
        self.inner.state.lock().unwrap().followers.len()
    }

    /// Accesses the owned value. Fails with `InDestructing` once teardown
    /// has begun.
    pub fn access(&self) -> Result<&T> {
        if self.inner.state.lock().unwrap().destructing {
            return Err(Error::InDestructing);
        }
        Ok(&self.inner.value)
    }

    /// Accesses the owned value unconditionally, for cleanup paths that
    /// must run even mid-teardown.
    pub fn access_even_if_destructing(&self) -> &T {
        &self.inner.value
    }
}

impl<T> Drop for Primary<T> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.destructing = true;
            for cb in state.followers.values() {
                cb();
            }
        }
        let mut state = self.inner.state.lock().unwrap();
        while !state.followers.is_empty() {
            state = self.inner.idle.wait(state).unwrap();
        }
    }
}

impl<T> Follower<T> {
    pub fn access(&self) -> Result<&T> {
        if self.inner.state.lock().unwrap().destructing {
            return Err(Error::InDestructing);
        }
        Ok(&self.inner.value)
    }

    pub fn access_even_if_destructing(&self) -> &T {
        &self.inner.value
    }

    pub fn is_destructing(&self) -> bool {
        self.inner.state.lock().unwrap().destructing
    }
}

impl<T> Drop for Follower<T> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        state.followers.remove(&self.id);
        if state.followers.is_empty() {
            self.inner.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn borrow_and_release() {
        let primary = Primary::new(42);
        assert_eq!(*primary.access().unwrap(), 42);
        let follower = primary.borrow(|| {}).unwrap();
        assert_eq!(primary.follower_count(), 1);
        assert_eq!(*follower.access().unwrap(), 42);
        drop(follower);
        assert_eq!(primary.follower_count(), 0);
    }

    #[test]
    fn teardown_invokes_callback_and_blocks_until_release() {
        let primary = Primary::new(());
        let called = Arc::new(AtomicBool::new(false));
        let called2 = Arc::clone(&called);
        let follower = primary
            .borrow(move || called2.store(true, Ordering::SeqCst))
            .unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let released2 = Arc::clone(&released);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            released2.store(true, Ordering::SeqCst);
            drop(follower);
        });

        drop(primary);
        assert!(called.load(Ordering::SeqCst));
        assert!(released.load(Ordering::SeqCst));
        handle.join().unwrap();
    }

    #[test]
    fn access_fails_while_teardown_in_progress() {
        let primary = Primary::new(());
        let follower = primary.borrow(|| {}).unwrap();

        let handle = std::thread::spawn(move || {
            // Primary::drop sets `destructing` before it blocks on the
            // still-live follower, so this thread observes InDestructing
            // while the main thread is asleep below.
            drop(primary);
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(follower.is_destructing());
        assert!(matches!(follower.access(), Err(Error::InDestructing)));
        assert_eq!(*follower.access_even_if_destructing(), ());
        drop(follower);
        handle.join().unwrap();
    }
}
