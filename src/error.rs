use std::fmt::Display;

/// StoredMap errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The store could not be created from the given configuration, typically
    /// an unknown driver name or a failure to open the back-end connection.
    Config(String),
    /// The back-end driver reported an I/O or protocol failure.
    Driver(String),
    /// Invalid data, typically decoding errors or corrupt stored payloads.
    InvalidData(String),
    /// An operation was attempted on a store that has already been closed.
    Closed,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::Driver(msg) => write!(f, "driver error: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Closed => write!(f, "store is closed"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// Constructs an Error::Driver for the given format string.
#[macro_export]
macro_rules! errdriver {
    ($($args:tt)*) => { $crate::error::Error::Driver(format!($($args)*)) };
}

/// A StoredMap Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Driver(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}
