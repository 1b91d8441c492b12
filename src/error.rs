use std::{fmt, io};

use crate::{digest::DigestError, reference::ParseError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors from the registry explorer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid reference: {0}")]
    Parse(#[from] ParseError),

    #[error("Invalid digest: {0}")]
    Digest(#[from] DigestError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response from the registry: {0}")]
    Protocol(String),

    #[error("HTTP request failed: {0}")]
    Transport(#[from] Box<ureq::Error>),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("Unable to build TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Deadline exceeded.")]
    Deadline,

    #[error("Operation cancelled.")]
    Cancelled,

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Invalid tar stream: {0}")]
    Tar(String),

    #[error("Blob is not a valid archive: {0}")]
    InvalidBlob(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),
}

/// Category of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    AuthFailure,
    NotFound,
    Protocol,
    Transport,
    Deadline,
    Decompression,
    Tar,
    InvalidBlob,
    Cancelled,
    Unsupported,
    NotAFile,
    NotADirectory,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Parse(_) | Error::Digest(_) | Error::BadRequest(_) => ErrorKind::Parse,
            Error::AuthFailure(_) => ErrorKind::AuthFailure,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Transport(_) | Error::Io(_) | Error::Tls(_) => ErrorKind::Transport,
            Error::Deadline => ErrorKind::Deadline,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Decompression(_) => ErrorKind::Decompression,
            Error::Tar(_) => ErrorKind::Tar,
            Error::InvalidBlob(_) => ErrorKind::InvalidBlob,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::NotAFile(_) => ErrorKind::NotAFile,
            Error::NotADirectory(_) => ErrorKind::NotADirectory,
        }
    }

    /// Convert an I/O error from a blob reader.
    ///
    /// Timeouts are reported as [`Error::Deadline`], and errors
    /// wrapping an [`Error`] (like the ones created by
    /// [`Error::into_io`]) are unwrapped.
    pub(crate) fn from_io(error: io::Error) -> Error {
        if is_timeout(&error) {
            return Error::Deadline;
        }

        if error.get_ref().is_some_and(|e| e.is::<Error>()) {
            if let Some(inner) = error.into_inner() {
                if let Ok(inner) = inner.downcast::<Error>() {
                    return *inner;
                }
            }

            return Error::Protocol("Invalid I/O error".into());
        }

        Error::Io(error)
    }

    /// Wrap this error in an [`io::Error`], so it can be returned from
    /// a `Read` implementation.
    pub(crate) fn into_io(self) -> io::Error {
        let kind = match self.kind() {
            ErrorKind::Deadline => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        };

        io::Error::new(kind, self)
    }
}

impl From<ureq::Error> for Error {
    fn from(value: ureq::Error) -> Self {
        let timeout = match &value {
            ureq::Error::Transport(t) => {
                let mut source = std::error::Error::source(t);
                let mut found = false;
                while let Some(e) = source {
                    if let Some(io) = e.downcast_ref::<io::Error>() {
                        found |= is_timeout(io);
                    }
                    source = e.source();
                }
                found
            }
            ureq::Error::Status(..) => false,
        };

        if timeout {
            Error::Deadline
        } else {
            Error::Transport(Box::new(value))
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Protocol(format!("Invalid JSON: {value}"))
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

impl ErrorKind {
    /// HTTP status code used to report this error.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Parse | ErrorKind::NotAFile | ErrorKind::NotADirectory => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidBlob | ErrorKind::Unsupported => 415,
            ErrorKind::Transport
            | ErrorKind::Protocol
            | ErrorKind::AuthFailure
            | ErrorKind::Decompression
            | ErrorKind::Tar => 502,
            ErrorKind::Deadline => 504,
            ErrorKind::Cancelled => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Parse => "ParseError",
            ErrorKind::AuthFailure => "AuthFailure",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::Transport => "Transport",
            ErrorKind::Deadline => "Deadline",
            ErrorKind::Decompression => "Decompression",
            ErrorKind::Tar => "TarError",
            ErrorKind::InvalidBlob => "InvalidBlob",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::NotAFile => "NotAFile",
            ErrorKind::NotADirectory => "NotADirectory",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[test]
fn status_codes() {
    assert_eq!(Error::NotFound("x".into()).kind().status_code(), 404);
    assert_eq!(Error::Deadline.kind().status_code(), 504);
    assert_eq!(Error::InvalidBlob("x".into()).kind().status_code(), 415);
    assert_eq!(Error::Tar("x".into()).kind().status_code(), 502);
    assert_eq!(Error::Cancelled.kind().status_code(), 500);
    assert_eq!(Error::Parse(ParseError::Empty).kind().status_code(), 400);
}

#[test]
fn io_round_trip() {
    let io = Error::NotFound("blob".into()).into_io();
    assert!(matches!(Error::from_io(io), Error::NotFound(m) if m == "blob"));

    let io = Error::Deadline.into_io();
    assert!(matches!(Error::from_io(io), Error::Deadline));

    let io = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
    assert!(matches!(Error::from_io(io), Error::Io(_)));
}
