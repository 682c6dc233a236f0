use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid data, typically decoding errors, checksum mismatches, or
    /// on-disk corruption (impossible footer, malformed meta or bloom).
    InvalidData(String),
    /// Invalid user input, typically a reserved key, a bad config value, or
    /// an unknown log level.
    InvalidInput(String),
    /// A misuse of a component API, e.g. out-of-order entries fed to a
    /// builder or reuse of a finished transaction context.
    InvalidOperation(String),
    /// An IO error.
    Io(String),
    /// A transactional commit lost a conflict check against a newer
    /// committed transaction. The context is aborted; retrying is up to
    /// the caller.
    Conflict,
    /// The WAL record buffer is full and the append was not allowed to
    /// flush. The caller must flush and retry.
    WalBufferFull,
    /// The data directory is locked by another process.
    LockHeld(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Conflict => write!(f, "transaction conflict, retry transaction"),
            Error::WalBufferFull => write!(f, "wal buffer full, flush and retry"),
            Error::LockHeld(path) => write!(f, "data directory already locked: {path}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)) };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
