//! Dedicated thread per subscriber: scans persisted entries then tails
//! live ones, calling a user callback. Spawned and supervised by
//! [`crate::stream::Stream::subscribe_with_options`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::entry::{Entry, IndexTimestamp};
use crate::persister::Persister;
use crate::scope::Follower;

/// What a per-entry or per-watermark callback tells the runtime to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResponse {
    More,
    Done,
}

/// What the terminate hook tells the runtime to do once it has been asked
/// to stop (either by the stream's own teardown or by an external
/// `request_terminate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateResponse {
    Terminate,
    Wait,
}

/// What to do once a filtered subscription has caught up and the caller
/// has declared the payload type set closed (no further entry can ever
/// pass the filter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterExhaustion {
    KeepWaiting,
    Done,
}

type EntryCallback<E> =
    Box<dyn FnMut(&Entry<E>, IndexTimestamp, IndexTimestamp) -> CallbackResponse + Send>;
type TerminateHook = Box<dyn FnMut() -> TerminateResponse + Send>;
type HeadHook = Box<dyn FnMut(i64) -> CallbackResponse + Send>;
type FilterPredicate<E> = Box<dyn FnMut(&E) -> bool + Send>;

/// Everything a `SubscriberRuntime` needs besides the stream it reads
/// from: the entry callback, the cooperative-cancellation hook, the
/// watermark-only hook, and an optional type filter.
pub struct SubscriberOptions<E> {
    pub start_cursor: u64,
    pub callback: EntryCallback<E>,
    pub on_terminate: TerminateHook,
    pub on_head: HeadHook,
    pub filter: Option<FilterPredicate<E>>,
    /// When set, a filtered subscription that has caught up with nothing
    /// left to deliver treats its payload set as closed and exhausted,
    /// consulting `on_filter_exhausted` instead of waiting forever.
    pub filter_closed: bool,
    pub on_filter_exhausted: FilterExhaustion,
    /// When set, the runtime exits as soon as it catches up with the
    /// persister's current size instead of blocking for more. Used by
    /// the HTTP endpoint's `nowait` query parameter.
    pub stop_when_caught_up: bool,
}

impl<E> SubscriberOptions<E> {
    pub fn new(callback: impl FnMut(&Entry<E>, IndexTimestamp, IndexTimestamp) -> CallbackResponse + Send + 'static) -> Self {
        Self {
            start_cursor: 0,
            callback: Box::new(callback),
            on_terminate: Box::new(|| TerminateResponse::Terminate),
            on_head: Box::new(|_us| CallbackResponse::More),
            filter: None,
            filter_closed: false,
            on_filter_exhausted: FilterExhaustion::KeepWaiting,
            stop_when_caught_up: false,
        }
    }

    pub fn with_stop_when_caught_up(mut self, stop: bool) -> Self {
        self.stop_when_caught_up = stop;
        self
    }

    pub fn with_start_cursor(mut self, cursor: u64) -> Self {
        self.start_cursor = cursor;
        self
    }

    pub fn with_terminate_hook(mut self, hook: impl FnMut() -> TerminateResponse + Send + 'static) -> Self {
        self.on_terminate = Box::new(hook);
        self
    }

    pub fn with_head_hook(mut self, hook: impl FnMut(i64) -> CallbackResponse + Send + 'static) -> Self {
        self.on_head = Box::new(hook);
        self
    }

    pub fn with_filter(
        mut self,
        predicate: impl FnMut(&E) -> bool + Send + 'static,
        closed: bool,
        on_exhausted: FilterExhaustion,
    ) -> Self {
        self.filter = Some(Box::new(predicate));
        self.filter_closed = closed;
        self.on_filter_exhausted = on_exhausted;
        self
    }
}

/// The bulk-wait group a stream's subscribers block on when caught up.
/// Shared by every subscriber of one stream; publish/update_head/terminate
/// all wake it via `notify_all`.
pub(crate) struct Notifier {
    lock: Mutex<()>,
    cv: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn notify_all(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cv.notify_all();
    }

    /// Blocks until `predicate()` is true, re-checking on every wake-up.
    pub fn wait_while(&self, predicate: impl Fn() -> bool) {
        let guard = self.lock.lock().unwrap();
        let _guard = self.cv.wait_while(guard, |_| !predicate()).unwrap();
    }
}

/// A handle to a running subscriber. Convertible to `bool`: `true` while
/// the subscriber thread is still running, `false` once it has exited.
/// Dropping it requests termination and joins the thread, so no detached
/// subscriber threads outlive the handles callers hold.
pub struct SubscriberScope {
    _follower: Option<Follower<()>>,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    terminate_requested: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
}

impl SubscriberScope {
    pub(crate) fn new(
        follower: Follower<()>,
        handle: JoinHandle<()>,
        running: Arc<AtomicBool>,
        terminate_requested: Arc<AtomicBool>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            _follower: Some(follower),
            handle: Some(handle),
            running,
            terminate_requested,
            notifier,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Asks the subscriber to stop without waiting for it to actually do
    /// so; siblings are unaffected.
    pub fn request_terminate(&self) {
        self.terminate_requested.store(true, Ordering::SeqCst);
        self.notifier.notify_all();
    }

    /// Requests termination and blocks until the thread has exited.
    pub fn join(mut self) {
        self.request_terminate();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A cloneable, detached handle that can request termination without
/// keeping the subscriber thread joined. Used by the HTTP endpoint's
/// subscription registry so `?terminate=<id>` can resolve an id to a
/// running subscriber without holding onto its `SubscriberScope`.
#[derive(Clone)]
pub struct TerminationHandle {
    terminate_requested: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
}

impl TerminationHandle {
    pub fn request_terminate(&self) {
        self.terminate_requested.store(true, Ordering::SeqCst);
        self.notifier.notify_all();
    }
}

impl SubscriberScope {
    pub fn termination_handle(&self) -> TerminationHandle {
        TerminationHandle {
            terminate_requested: Arc::clone(&self.terminate_requested),
            notifier: Arc::clone(&self.notifier),
        }
    }
}

impl From<&SubscriberScope> for bool {
    fn from(scope: &SubscriberScope) -> bool {
        scope.is_running()
    }
}

impl Drop for SubscriberScope {
    fn drop(&mut self) {
        self.terminate_requested.store(true, Ordering::SeqCst);
        self.notifier.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub(crate) fn run<E>(
    persister: Arc<dyn Persister<E>>,
    notifier: Arc<Notifier>,
    terminate_requested: Arc<AtomicBool>,
    mut options: SubscriberOptions<E>,
) where
    E: Clone + Send + Sync + 'static,
{
    let mut cursor = options.start_cursor;
    let mut last_head_seen = persister.head();

    loop {
        let size = persister.size();
        if cursor < size {
            let iter = match persister.iterate(cursor, size) {
                Ok(iter) => iter,
                Err(err) => {
                    log::error!("subscriber iterate failed: {err}");
                    return;
                }
            };
            let mut stop = false;
            for item in iter {
                let entry = match item {
                    Ok(entry) => entry,
                    Err(err) => {
                        log::error!("subscriber replay failed: {err}");
                        stop = true;
                        break;
                    }
                };
                cursor = entry.idxts.index + 1;
                if let Some(filter) = options.filter.as_mut() {
                    if !filter(&entry.payload) {
                        continue;
                    }
                }
                let last_idxts = persister.last_idxts();
                let response = (options.callback)(&entry, entry.idxts, last_idxts);
                if response == CallbackResponse::Done {
                    stop = true;
                    break;
                }
            }
            if stop {
                return;
            }
            continue;
        }

        if terminate_requested.load(Ordering::SeqCst) {
            match (options.on_terminate)() {
                TerminateResponse::Terminate => return,
                TerminateResponse::Wait => terminate_requested.store(false, Ordering::SeqCst),
            }
        }

        let head_now = persister.head();
        if head_now > last_head_seen {
            last_head_seen = head_now;
            if (options.on_head)(head_now) == CallbackResponse::Done {
                return;
            }
            continue;
        }

        if options.filter.is_some() && options.filter_closed {
            if options.on_filter_exhausted == FilterExhaustion::Done {
                return;
            }
        }

        if options.stop_when_caught_up {
            return;
        }

        let persister_for_wait = Arc::clone(&persister);
        let term_for_wait = Arc::clone(&terminate_requested);
        let observed_head = last_head_seen;
        notifier.wait_while(move || {
            persister_for_wait.size() > cursor
                || persister_for_wait.head() > observed_head
                || term_for_wait.load(Ordering::SeqCst)
        });
    }
}
