//! Persisted append-only event stream with priority/ring in-process
//! queues and an HTTP pub/sub tail.

pub mod clock;
pub mod entry;
pub mod error;
pub mod http;
pub mod mmpq;
pub mod mmq;
pub mod persister;
pub mod registry;
pub mod scope;
pub mod stream;
pub mod subscriber;

pub use clock::{Clock, MockClock, SystemClock};
pub use entry::{Entry, IndexTimestamp};
pub use error::{Error, Result};
pub use mmpq::PriorityQueue;
pub use mmq::{OverflowPolicy, RingQueue};
pub use persister::{FilePersister, FilePersisterConfig, MemoryPersister, Persister};
pub use stream::{PublisherToken, Stream};
pub use subscriber::{
    CallbackResponse, FilterExhaustion, SubscriberOptions, SubscriberScope, TerminateResponse,
};
