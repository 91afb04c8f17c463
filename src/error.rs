use std::fmt;

/// Every failure mode the crate surfaces to callers.
///
/// Variants map onto the error kinds catalogued in the design notes: each
/// is raised at exactly one boundary (persister open, publish, iterate,
/// subscribe/borrow, HTTP response) and never swallowed silently.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// Two persisted entries claim the same index, or a gap was found on replay.
    InconsistentIndex,
    /// A `publish`/`update_head` call would violate the stream's timestamp order.
    InconsistentTimestamp,
    /// A persisted line could not be parsed back into an entry.
    MalformedEntry(String),
    /// `iterate(begin, end)` was called with `begin > end` or `end > size`.
    InvalidRange,
    /// `publish` was called while the publisher token is held externally.
    PublisherReleased,
    /// `release_publisher` was called while the token was already released.
    PublisherAlreadyReleased,
    /// `acquire_publisher` was called while the stream already owns the token.
    PublisherAlreadyOwned,
    /// A follower tried to borrow from a primary that has entered teardown.
    InDestructing,
    /// An HTTP subscription tried to write a second response to one connection.
    MoreThanOneResponse,
    /// The HTTP connection failed mid-write; the subscriber should stop.
    NetworkError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::InconsistentIndex => write!(f, "inconsistent index"),
            Error::InconsistentTimestamp => write!(f, "inconsistent timestamp"),
            Error::MalformedEntry(msg) => write!(f, "malformed entry: {msg}"),
            Error::InvalidRange => write!(f, "invalid range"),
            Error::PublisherReleased => write!(f, "publisher token is released"),
            Error::PublisherAlreadyReleased => write!(f, "publisher token already released"),
            Error::PublisherAlreadyOwned => write!(f, "publisher token already owned"),
            Error::InDestructing => write!(f, "primary is tearing down"),
            Error::MoreThanOneResponse => write!(f, "more than one response written"),
            Error::NetworkError(msg) => write!(f, "network error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
