use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Affinity(String),
    Worker(String),
    Hostname(String),
    Unsupported(String),
    InvalidArgs(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Affinity(msg) => write!(f, "affinity error: {}", msg),
            Error::Worker(msg) => write!(f, "worker error: {}", msg),
            Error::Hostname(msg) => write!(f, "hostname error: {}", msg),
            Error::Unsupported(msg) => write!(f, "unsupported: {}", msg),
            Error::InvalidArgs(msg) => write!(f, "invalid arguments: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
