use serde::{Deserialize, Serialize};

/// A position in a stream: a contiguous index paired with a timestamp.
///
/// `index` is 0-based and strictly contiguous per stream. `us` is
/// microseconds since the Unix epoch. The default value `(0, 0)` means
/// "uninitialized" and is never itself a published entry's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexTimestamp {
    pub index: u64,
    pub us: i64,
}

impl IndexTimestamp {
    pub const UNINITIALIZED: IndexTimestamp = IndexTimestamp { index: 0, us: 0 };

    pub fn new(index: u64, us: i64) -> Self {
        Self { index, us }
    }
}

impl Default for IndexTimestamp {
    fn default() -> Self {
        Self::UNINITIALIZED
    }
}

/// A payload paired with its position, immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry<E> {
    pub idxts: IndexTimestamp,
    pub payload: E,
}

impl<E> Entry<E> {
    pub fn new(idxts: IndexTimestamp, payload: E) -> Self {
        Self { idxts, payload }
    }
}
