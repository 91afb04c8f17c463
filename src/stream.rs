//! `Stream<E>`: a persister plus a publisher-token gate plus a pool of
//! subscriber threads, all woken off one shared notifier.
//!
//! Publishing goes through a three-stage lock that strictly advances
//! 1 -> 2 -> 3, releasing whichever stage it currently holds before
//! taking the next: stage 1 reserves and appends to the persister
//! (the durable write), stage 2 is the point at which any in-memory
//! mirror of the persister's state would be reconciled, and stage 3
//! wakes every waiting subscriber. Keeping these as separate scoped
//! locks (rather than one held across the whole call) is what lets a
//! subscriber woken at stage 3 already see the stage-1 write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::entry::{Entry, IndexTimestamp};
use crate::error::{Error, Result};
use crate::persister::{Persister, PersisterIter};
use crate::scope::Primary;
use crate::subscriber::{self, CallbackResponse, Notifier, SubscriberOptions, SubscriberScope};

/// Which side currently holds the right to call `publish`/`update_head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Authority {
    Own,
    External,
}

/// Proof that the publisher right was released by this stream. Holding
/// one is the only way to call [`Stream::acquire_publisher`]; it cannot
/// be constructed except by [`Stream::release_publisher`].
pub struct PublisherToken(());

/// A persisted, ordered, fan-out stream of `E`.
///
/// Wraps one [`Persister`] implementation and never special-cases which
/// variant it holds. Dropping the stream blocks until every subscriber
/// thread has stopped, the same way [`crate::scope::Primary`] blocks on
/// its followers (it *is* a `Primary<()>` under the hood).
pub struct Stream<E> {
    persister: Arc<dyn Persister<E>>,
    clock: Arc<dyn Clock>,
    authority: Mutex<Authority>,
    stage1: Mutex<()>,
    stage2: Mutex<()>,
    stage3: Mutex<()>,
    notifier: Arc<Notifier>,
    scope: Primary<()>,
}

impl<E> Stream<E>
where
    E: Clone + Send + Sync + 'static,
{
    pub fn new(persister: Arc<dyn Persister<E>>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            persister,
            clock,
            authority: Mutex::new(Authority::Own),
            stage1: Mutex::new(()),
            stage2: Mutex::new(()),
            stage3: Mutex::new(()),
            notifier: Arc::new(Notifier::new()),
            scope: Primary::new(()),
        })
    }

    /// Publishes at the clock's current time. See [`Stream::publish_at`].
    pub fn publish(&self, payload: E) -> Result<IndexTimestamp> {
        let us = self.clock.now_us();
        self.publish_at(payload, us)
    }

    /// Appends `payload` at `us`, failing if the publisher token is
    /// currently held externally or if `us` violates the persister's
    /// monotonicity rule.
    pub fn publish_at(&self, payload: E, us: i64) -> Result<IndexTimestamp> {
        self.require_own()?;
        let idxts = {
            let _stage1 = self.stage1.lock().unwrap();
            self.persister.publish(payload, us)?
        };
        {
            let _stage2 = self.stage2.lock().unwrap();
        }
        {
            let _stage3 = self.stage3.lock().unwrap();
            self.notifier.notify_all();
        }
        Ok(idxts)
    }

    /// Advances the watermark without publishing an entry.
    pub fn update_head(&self, us: i64) -> Result<()> {
        self.require_own()?;
        {
            let _stage1 = self.stage1.lock().unwrap();
            self.persister.update_head(us)?;
        }
        {
            let _stage2 = self.stage2.lock().unwrap();
        }
        {
            let _stage3 = self.stage3.lock().unwrap();
            self.notifier.notify_all();
        }
        Ok(())
    }

    fn require_own(&self) -> Result<()> {
        match *self.authority.lock().unwrap() {
            Authority::Own => Ok(()),
            Authority::External => Err(Error::PublisherReleased),
        }
    }

    /// Hands the publish right to an external owner. Only one token can
    /// be outstanding at a time.
    pub fn release_publisher(&self) -> Result<PublisherToken> {
        let mut authority = self.authority.lock().unwrap();
        match *authority {
            Authority::Own => {
                *authority = Authority::External;
                Ok(PublisherToken(()))
            }
            Authority::External => Err(Error::PublisherAlreadyReleased),
        }
    }

    /// Returns the publish right, consuming the token that proves it was
    /// released by this stream.
    pub fn acquire_publisher(&self, token: PublisherToken) -> Result<()> {
        let PublisherToken(()) = token;
        let mut authority = self.authority.lock().unwrap();
        match *authority {
            Authority::External => {
                *authority = Authority::Own;
                Ok(())
            }
            Authority::Own => Err(Error::PublisherAlreadyOwned),
        }
    }

    pub fn size(&self) -> u64 {
        self.persister.size()
    }

    pub fn head(&self) -> i64 {
        self.persister.head()
    }

    pub fn now_us(&self) -> i64 {
        self.clock.now_us()
    }

    pub fn last_idxts(&self) -> IndexTimestamp {
        self.persister.last_idxts()
    }

    pub fn iterate(&self, begin: u64, end: u64) -> Result<PersisterIter<E>> {
        self.persister.iterate(begin, end)
    }

    /// Subscribes from index 0 with default hooks: terminate immediately,
    /// never stop early on watermark-only wakeups, no filter.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl FnMut(&Entry<E>, IndexTimestamp, IndexTimestamp) -> CallbackResponse + Send + 'static,
    ) -> Result<SubscriberScope> {
        self.subscribe_with_options(SubscriberOptions::new(callback))
    }

    /// Subscribes with full control over start cursor, hooks, and filter.
    pub fn subscribe_with_options(
        self: &Arc<Self>,
        options: SubscriberOptions<E>,
    ) -> Result<SubscriberScope> {
        let terminate_requested = Arc::new(AtomicBool::new(false));
        let terminate_for_teardown = Arc::clone(&terminate_requested);
        let notifier_for_teardown = Arc::clone(&self.notifier);

        let follower = self.scope.borrow(move || {
            terminate_for_teardown.store(true, Ordering::SeqCst);
            notifier_for_teardown.notify_all();
        })?;

        let persister = Arc::clone(&self.persister);
        let notifier = Arc::clone(&self.notifier);
        let terminate_for_thread = Arc::clone(&terminate_requested);
        let running = Arc::new(AtomicBool::new(true));
        let running_for_thread = Arc::clone(&running);

        let handle = std::thread::spawn(move || {
            subscriber::run(persister, notifier, terminate_for_thread, options);
            running_for_thread.store(false, Ordering::SeqCst);
        });

        Ok(SubscriberScope::new(
            follower,
            handle,
            running,
            terminate_requested,
            Arc::clone(&self.notifier),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::persister::MemoryPersister;
    use crate::subscriber::TerminateResponse;
    use std::sync::mpsc;

    fn stream_with_clock(start_us: i64) -> (Arc<Stream<String>>, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new(start_us));
        let persister = Arc::new(MemoryPersister::new());
        (Stream::new(persister, Arc::clone(&clock) as Arc<dyn Clock>), clock)
    }

    #[test]
    fn publish_wakes_a_waiting_subscriber() {
        let (stream, _clock) = stream_with_clock(100);
        let (tx, rx) = mpsc::channel();
        let _scope = stream
            .subscribe(move |entry, _idxts, _last| {
                tx.send(entry.payload.clone()).unwrap();
                CallbackResponse::More
            })
            .unwrap();

        stream.publish_at("hello".into(), 100).unwrap();
        let got = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(got, "hello");
    }

    #[test]
    fn publish_replays_backlog_before_tailing() {
        let (stream, _clock) = stream_with_clock(100);
        stream.publish_at("a".into(), 100).unwrap();
        stream.publish_at("b".into(), 200).unwrap();

        let (tx, rx) = mpsc::channel();
        let _scope = stream
            .subscribe(move |entry, _idxts, _last| {
                tx.send(entry.payload.clone()).unwrap();
                CallbackResponse::More
            })
            .unwrap();

        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap(), "a");
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap(), "b");
    }

    #[test]
    fn release_and_reacquire_publisher_gate_publish() {
        let (stream, _clock) = stream_with_clock(100);
        let token = stream.release_publisher().unwrap();
        assert!(matches!(
            stream.publish_at("x".into(), 100),
            Err(Error::PublisherReleased)
        ));
        assert!(matches!(
            stream.release_publisher(),
            Err(Error::PublisherAlreadyReleased)
        ));
        stream.acquire_publisher(token).unwrap();
        stream.publish_at("x".into(), 100).unwrap();
    }

    #[test]
    fn dropping_stream_blocks_until_subscribers_stop() {
        let (stream, _clock) = stream_with_clock(100);
        let scope = stream
            .subscribe_with_options(
                SubscriberOptions::new(|_entry, _idxts, _last| CallbackResponse::More)
                    .with_terminate_hook(|| TerminateResponse::Terminate),
            )
            .unwrap();
        assert!(scope.is_running());
        drop(scope);
        drop(stream);
    }
}
