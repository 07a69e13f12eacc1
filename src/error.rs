use std::{fmt, io, time::Duration};

use quinn::{ConnectError, ConnectionError, ReadExactError, WriteError};

use crate::broker::aggregate::Inconsistency;

#[derive(Debug)]
pub enum Error {
    Connect(ConnectError),
    Connection(ConnectionError),
    Io(io::Error),
    Write(WriteError),
    ReadExact(ReadExactError),
    Tls(rustls::Error),
    Certificate(rcgen::RcgenError),
    Encode(String),
    Decode(String),
    FrameTooLarge(usize),
    Timeout(Duration),
    /// The peer handled the request and reported a failure.
    Remote(String),
    UnexpectedResponse,
    InvalidInput(String),
    NotLoaded,
    SessionBusy,
    ShuttingDown,
    InconsistentAggregation(Vec<Inconsistency>),
}

impl Error {
    /// Returns true for failures of the link itself rather than of the work
    /// carried over it. These are the failures a broadcast tolerates by
    /// leaving a hole.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::Connect(_)
                | Error::Connection(_)
                | Error::Io(_)
                | Error::Write(_)
                | Error::ReadExact(_)
                | Error::Tls(_)
                | Error::Timeout(_)
        )
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidInput(reason.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connect(e) => write!(f, "could not dial peer: {}", e),
            Error::Connection(e) => write!(f, "connection failed: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Write(e) => write!(f, "stream write failed: {}", e),
            Error::ReadExact(e) => write!(f, "stream read failed: {}", e),
            Error::Tls(e) => write!(f, "tls configuration error: {}", e),
            Error::Certificate(e) => {
                write!(f, "could not generate certificate: {}", e)
            }
            Error::Encode(e) => write!(f, "could not encode message: {}", e),
            Error::Decode(e) => write!(f, "could not decode message: {}", e),
            Error::FrameTooLarge(len) => {
                write!(f, "frame of {} bytes exceeds the frame limit", len)
            }
            Error::Timeout(after) => {
                write!(f, "call timed out after {:?}", after)
            }
            Error::Remote(reason) => write!(f, "peer reported: {}", reason),
            Error::UnexpectedResponse => {
                write!(f, "peer answered with the wrong response kind")
            }
            Error::InvalidInput(reason) => write!(f, "invalid input: {}", reason),
            Error::NotLoaded => write!(f, "no band has been loaded"),
            Error::SessionBusy => {
                write!(f, "a generation loop is already in flight")
            }
            Error::ShuttingDown => write!(f, "session is shutting down"),
            Error::InconsistentAggregation(issues) => {
                write!(f, "aggregation is inconsistent:")?;
                for issue in issues {
                    write!(f, " {};", issue)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<ConnectError> for Error {
    fn from(error: ConnectError) -> Self {
        Self::Connect(error)
    }
}

impl From<ConnectionError> for Error {
    fn from(error: ConnectionError) -> Self {
        Self::Connection(error)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        Self::Write(e)
    }
}

impl From<ReadExactError> for Error {
    fn from(e: ReadExactError) -> Self {
        Self::ReadExact(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

impl From<rcgen::RcgenError> for Error {
    fn from(e: rcgen::RcgenError) -> Self {
        Self::Certificate(e)
    }
}
