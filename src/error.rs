use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Streamlog errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// An append to an address that was already written or already trimmed.
    /// The caller decides the retry or hole-fill policy.
    Overwrite(u64),
    /// A read of an address with a recorded trim intent.
    Trimmed(u64),
    /// Checksum mismatch, malformed framed record, or a bad segment header.
    /// Fatal for the affected segment; other segments keep serving.
    Corruption(String),
    /// A segment header carries a version this build does not understand.
    VersionMismatch { found: u32, expected: u32 },
    /// A segment written without checksums was opened in verifying mode.
    NoChecksum(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Overwrite(address) => write!(f, "address {address} already written"),
            Error::Trimmed(address) => write!(f, "address {address} has been trimmed"),
            Error::Corruption(msg) => write!(f, "data corruption: {msg}"),
            Error::VersionMismatch { found, expected } => {
                write!(f, "log version {found} does not match expected version {expected}")
            }
            Error::NoChecksum(path) => {
                write!(f, "log file {path} not generated with checksums, can't verify")
            }
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// A streamlog Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corruption(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
