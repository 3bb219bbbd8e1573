//! Native network error codes.
//!
//! Codes are the negative integers of the engine's `net_error_list`. Errors
//! produced by dialer callbacks travel the other way, from `std::io::Error`
//! into this code space, so the engine can report them through its normal
//! failure callback.

use std::fmt;
use std::io;

/// A signed network error code reported by, or returned to, the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetError(i32);

struct CodeInfo {
    code: i32,
    name: &'static str,
    message: &'static str,
}

const KNOWN_CODES: &[CodeInfo] = &[
    CodeInfo { code: -3, name: "ERR_ABORTED", message: "operation aborted" },
    CodeInfo { code: -7, name: "ERR_TIMED_OUT", message: "operation timed out" },
    CodeInfo { code: -100, name: "ERR_CONNECTION_CLOSED", message: "connection closed" },
    CodeInfo { code: -101, name: "ERR_CONNECTION_RESET", message: "connection reset" },
    CodeInfo { code: -102, name: "ERR_CONNECTION_REFUSED", message: "connection refused" },
    CodeInfo { code: -103, name: "ERR_CONNECTION_ABORTED", message: "connection aborted" },
    CodeInfo { code: -104, name: "ERR_CONNECTION_FAILED", message: "connection failed" },
    CodeInfo { code: -105, name: "ERR_NAME_NOT_RESOLVED", message: "name not resolved" },
    CodeInfo { code: -106, name: "ERR_INTERNET_DISCONNECTED", message: "internet disconnected" },
    CodeInfo { code: -109, name: "ERR_ADDRESS_UNREACHABLE", message: "address unreachable" },
    CodeInfo { code: -112, name: "ERR_SOCKET_NOT_CONNECTED", message: "socket is not connected" },
    CodeInfo { code: -118, name: "ERR_CONNECTION_TIMED_OUT", message: "connection timed out" },
];

impl NetError {
    pub const ABORTED: NetError = NetError(-3);
    pub const TIMED_OUT: NetError = NetError(-7);
    pub const CONNECTION_CLOSED: NetError = NetError(-100);
    pub const CONNECTION_RESET: NetError = NetError(-101);
    pub const CONNECTION_REFUSED: NetError = NetError(-102);
    pub const CONNECTION_ABORTED: NetError = NetError(-103);
    pub const CONNECTION_FAILED: NetError = NetError(-104);
    pub const NAME_NOT_RESOLVED: NetError = NetError(-105);
    pub const INTERNET_DISCONNECTED: NetError = NetError(-106);
    pub const ADDRESS_UNREACHABLE: NetError = NetError(-109);
    pub const SOCKET_NOT_CONNECTED: NetError = NetError(-112);
    pub const CONNECTION_TIMED_OUT: NetError = NetError(-118);

    /// Wraps a raw code as reported by the engine.
    pub const fn from_code(code: i32) -> Self {
        NetError(code)
    }

    /// Raw code.
    pub const fn code(self) -> i32 {
        self.0
    }

    fn info(self) -> Option<&'static CodeInfo> {
        KNOWN_CODES.iter().find(|info| info.code == self.0)
    }

    /// Engine-style name, e.g. `ERR_CONNECTION_REFUSED`.
    pub fn name(self) -> String {
        match self.info() {
            Some(info) => info.name.to_string(),
            None => format!("ERR_UNKNOWN_{}", -(self.0 as i64)),
        }
    }

    pub fn is_timeout(self) -> bool {
        self == Self::TIMED_OUT || self == Self::CONNECTION_TIMED_OUT
    }

    /// Engine errors are never considered safely retryable at this layer.
    pub fn is_temporary(self) -> bool {
        false
    }

    /// Codes that mean the connection is gone.
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            Self::CONNECTION_CLOSED
                | Self::SOCKET_NOT_CONNECTED
                | Self::CONNECTION_RESET
                | Self::CONNECTION_ABORTED
        )
    }

    /// Reports whether this code corresponds to the given OS errno.
    pub fn matches_errno(self, errno: i32) -> bool {
        match errno {
            libc::ECONNREFUSED => self == Self::CONNECTION_REFUSED,
            libc::ECONNRESET => self == Self::CONNECTION_RESET,
            libc::ECONNABORTED => self == Self::CONNECTION_ABORTED,
            libc::ETIMEDOUT => self == Self::CONNECTION_TIMED_OUT,
            libc::ENETUNREACH | libc::EHOSTUNREACH => self == Self::ADDRESS_UNREACHABLE,
            libc::ENOTCONN => self == Self::SOCKET_NOT_CONNECTED,
            _ => false,
        }
    }

    /// Closest `io::ErrorKind` for this code.
    pub fn io_kind(self) -> io::ErrorKind {
        match self {
            Self::CONNECTION_REFUSED => io::ErrorKind::ConnectionRefused,
            Self::CONNECTION_RESET => io::ErrorKind::ConnectionReset,
            Self::CONNECTION_ABORTED | Self::ABORTED => io::ErrorKind::ConnectionAborted,
            Self::SOCKET_NOT_CONNECTED | Self::CONNECTION_CLOSED => io::ErrorKind::NotConnected,
            Self::TIMED_OUT | Self::CONNECTION_TIMED_OUT => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        }
    }

    /// Maps a dial failure to the code handed back to the engine.
    ///
    /// Checks the error kind first, then the raw errno, then well-known
    /// message fragments. Anything unrecognized is `ERR_CONNECTION_FAILED`.
    pub fn from_io_error(err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            return Self::CONNECTION_TIMED_OUT;
        }

        if let Some(errno) = err.raw_os_error() {
            match errno {
                libc::ECONNREFUSED => return Self::CONNECTION_REFUSED,
                libc::ETIMEDOUT => return Self::CONNECTION_TIMED_OUT,
                libc::ENETUNREACH | libc::EHOSTUNREACH => return Self::ADDRESS_UNREACHABLE,
                libc::ECONNRESET => return Self::CONNECTION_RESET,
                libc::ECONNABORTED => return Self::CONNECTION_ABORTED,
                _ => {}
            }
        }

        match err.kind() {
            io::ErrorKind::ConnectionRefused => return Self::CONNECTION_REFUSED,
            io::ErrorKind::ConnectionReset => return Self::CONNECTION_RESET,
            io::ErrorKind::ConnectionAborted => return Self::CONNECTION_ABORTED,
            _ => {}
        }

        let message = err.to_string().to_lowercase();
        if message.contains("connection refused") {
            Self::CONNECTION_REFUSED
        } else if message.contains("connection timed out") || message.contains("i/o timeout") {
            Self::CONNECTION_TIMED_OUT
        } else if message.contains("network is unreachable") || message.contains("no route to host") {
            Self::ADDRESS_UNREACHABLE
        } else if message.contains("connection reset") {
            Self::CONNECTION_RESET
        } else if message.contains("connection aborted") {
            Self::CONNECTION_ABORTED
        } else {
            Self::CONNECTION_FAILED
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.info() {
            Some(info) => f.write_str(info.message),
            None => write!(f, "network error {}", self.0),
        }
    }
}

impl fmt::Debug for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetError({}, {})", self.0, self.name())
    }
}

impl std::error::Error for NetError {}

impl From<NetError> for io::Error {
    fn from(err: NetError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names() {
        assert_eq!(NetError::CONNECTION_REFUSED.name(), "ERR_CONNECTION_REFUSED");
        assert_eq!(NetError::from_code(-118).name(), "ERR_CONNECTION_TIMED_OUT");
        assert_eq!(NetError::from_code(-999).name(), "ERR_UNKNOWN_999");
    }

    #[test]
    fn test_display() {
        assert_eq!(NetError::CONNECTION_RESET.to_string(), "connection reset");
        assert_eq!(NetError::from_code(-999).to_string(), "network error -999");
    }

    #[test]
    fn test_timeout_classification() {
        assert!(NetError::TIMED_OUT.is_timeout());
        assert!(NetError::CONNECTION_TIMED_OUT.is_timeout());
        assert!(!NetError::CONNECTION_FAILED.is_timeout());
        assert!(!NetError::CONNECTION_TIMED_OUT.is_temporary());
    }

    #[test]
    fn test_closed_classification() {
        assert!(NetError::CONNECTION_CLOSED.is_closed());
        assert!(NetError::CONNECTION_RESET.is_closed());
        assert!(!NetError::CONNECTION_REFUSED.is_closed());
    }

    #[test]
    fn test_matches_errno() {
        assert!(NetError::CONNECTION_REFUSED.matches_errno(libc::ECONNREFUSED));
        assert!(NetError::ADDRESS_UNREACHABLE.matches_errno(libc::EHOSTUNREACH));
        assert!(NetError::ADDRESS_UNREACHABLE.matches_errno(libc::ENETUNREACH));
        assert!(!NetError::CONNECTION_RESET.matches_errno(libc::ECONNREFUSED));
    }

    #[test]
    fn test_from_io_error_errno() {
        let cases = [
            (libc::ECONNREFUSED, NetError::CONNECTION_REFUSED),
            (libc::ETIMEDOUT, NetError::CONNECTION_TIMED_OUT),
            (libc::ENETUNREACH, NetError::ADDRESS_UNREACHABLE),
            (libc::EHOSTUNREACH, NetError::ADDRESS_UNREACHABLE),
            (libc::ECONNRESET, NetError::CONNECTION_RESET),
            (libc::ECONNABORTED, NetError::CONNECTION_ABORTED),
        ];
        for (errno, expected) in cases {
            let err = io::Error::from_raw_os_error(errno);
            assert_eq!(NetError::from_io_error(&err), expected, "errno {}", errno);
        }
    }

    #[test]
    fn test_from_io_error_message_and_default() {
        let err = io::Error::new(io::ErrorKind::Other, "dial: No route to host");
        assert_eq!(NetError::from_io_error(&err), NetError::ADDRESS_UNREACHABLE);

        let err = io::Error::new(io::ErrorKind::Other, "i/o timeout");
        assert_eq!(NetError::from_io_error(&err), NetError::CONNECTION_TIMED_OUT);

        let err = io::Error::new(io::ErrorKind::Other, "something odd");
        assert_eq!(NetError::from_io_error(&err), NetError::CONNECTION_FAILED);

        let err = io::Error::new(io::ErrorKind::TimedOut, "deadline");
        assert_eq!(NetError::from_io_error(&err), NetError::CONNECTION_TIMED_OUT);
    }
}
