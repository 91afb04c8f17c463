use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of "now", expressed in microseconds since the Unix epoch.
///
/// Injectable so tests can drive publish/update_head sequences without
/// depending on wall-clock scheduling.
pub trait Clock: Send + Sync + 'static {
    fn now_us(&self) -> i64;
}

/// The default clock, backed by `std::time::SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch");
        d.as_micros() as i64
    }
}

/// A clock tests can set to an arbitrary value, advancing it explicitly.
#[derive(Debug)]
pub struct MockClock {
    us: AtomicI64,
}

impl MockClock {
    pub fn new(start_us: i64) -> Self {
        Self {
            us: AtomicI64::new(start_us),
        }
    }

    pub fn set(&self, us: i64) {
        self.us.store(us, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_us: i64) {
        self.us.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_us(&self) -> i64 {
        self.us.load(Ordering::SeqCst)
    }
}
