//! Error types for naive-tunnel.

use std::io;

use thiserror::Error;

use crate::net_error::NetError;
use crate::tls::TlsError;

/// Exit codes for the CLI subcommands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Generic failure
    Failure = 1,
    /// Invalid configuration or arguments
    ConfigInvalid = 2,
    /// Engine or client start failed
    StartFailed = 10,
    /// Tunnel could not be established
    DialFailed = 11,
    /// Trusted roots or public key pins rejected
    TlsConfigInvalid = 12,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for naive-tunnel.
#[derive(Debug, Error)]
pub enum Error {
    #[error("use of closed network connection")]
    Closed,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("operation canceled")]
    Canceled,

    #[error("end of stream")]
    Eof,

    #[error(transparent)]
    Network(#[from] NetError),

    /// Terminal stream condition surfaced through a tunneled connection.
    #[error("bad h2 stream: {0}")]
    BadStream(Box<Error>),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("start in progress")]
    StartInProgress,

    #[error("already started")]
    AlreadyStarted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::Config(_) | Error::Invalid(_) => ExitCode::ConfigInvalid,
            Error::Tls(_) => ExitCode::TlsConfigInvalid,
            Error::StartInProgress | Error::AlreadyStarted => ExitCode::StartFailed,
            Error::Network(_) | Error::Handshake(_) | Error::BadStream(_) => ExitCode::DialFailed,
            Error::Eof => ExitCode::Success,
            _ => ExitCode::Failure,
        }
    }

    /// Wraps a stream-level failure the way tunneled connections report it.
    ///
    /// End of stream is passed through untouched so readers can observe it.
    pub fn bad_stream(self) -> Self {
        match self {
            Error::Eof | Error::BadStream(_) => self,
            other => Error::BadStream(Box::new(other)),
        }
    }

    /// Returns true if the error is, or wraps, `Closed`.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Closed => true,
            Error::BadStream(inner) => inner.is_closed(),
            Error::Network(e) => e.is_closed(),
            _ => false,
        }
    }

    /// Returns the native network error carried by this error, if any.
    pub fn net_error(&self) -> Option<NetError> {
        match self {
            Error::Network(e) => Some(*e),
            Error::BadStream(inner) => inner.net_error(),
            _ => None,
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::Closed => io::ErrorKind::NotConnected,
            Error::Invalid(_) | Error::Config(_) => io::ErrorKind::InvalidInput,
            Error::Canceled => io::ErrorKind::ConnectionAborted,
            Error::Eof => io::ErrorKind::UnexpectedEof,
            Error::Network(e) => e.io_kind(),
            Error::BadStream(inner) => inner.io_kind(),
            Error::Handshake(_) => io::ErrorKind::ConnectionRefused,
            Error::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

/// Result type alias for naive-tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;
