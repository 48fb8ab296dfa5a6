use std::fmt;
use std::io;

/// Errors returned by loop construction.
#[derive(Debug)]
pub enum Error {
    /// io_uring setup or operation failed.
    Io(io::Error),
    /// Ring creation failed (e.g., kernel too old or RLIMIT_MEMLOCK too low).
    RingSetup(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::RingSetup(msg) => write!(f, "ring setup: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
