use std::io;

/// Errors surfaced by [`Socket`](crate::Socket) and [`ServerSocket`](crate::ServerSocket).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),

    #[error("accept failed: {0}")]
    AcceptFailed(#[source] io::Error),

    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),

    /// No byte arrived before the read timeout.
    #[error("read timed out")]
    ReadTimedOut,

    /// `bytes_written` bytes reached the transport before `source`.
    #[error("write failed after {bytes_written} bytes: {source}")]
    WriteFailed {
        bytes_written: usize,
        #[source]
        source: io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True for read timeouts and for transport errors of kind `TimedOut`
    /// (connect and send timeouts).
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::ReadTimedOut => true,
            Error::ConnectFailed(err)
            | Error::AcceptFailed(err)
            | Error::ReadFailed(err)
            | Error::WriteFailed { source: err, .. } => err.kind() == io::ErrorKind::TimedOut,
            Error::Cancelled => false,
        }
    }

    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Error::ReadTimedOut => io::ErrorKind::TimedOut,
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::ConnectFailed(err)
            | Error::AcceptFailed(err)
            | Error::ReadFailed(err)
            | Error::WriteFailed { source: err, .. } => err.kind(),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        io::Error::new(err.kind(), err)
    }
}
