use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to the BiDi client. Every variant maps onto one of the
/// protocol error codes returned in the `error` field of a command response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    MoveTargetOutOfBounds(String),
    #[error("{0}")]
    NoSuchAlert(String),
    #[error("{0}")]
    NoSuchElement(String),
    #[error("{0}")]
    NoSuchFrame(String),
    #[error("{0}")]
    NoSuchHistoryEntry(String),
    #[error("{0}")]
    NoSuchIntercept(String),
    #[error("{0}")]
    NoSuchNode(String),
    #[error("{0}")]
    NoSuchRequest(String),
    #[error("{0}")]
    NoSuchScript(String),
    #[error("{0}")]
    UnableToCaptureScreen(String),
    #[error("{0}")]
    UnknownCommand(String),
    #[error("{0}")]
    UnsupportedOperation(String),
    #[error("{0}")]
    UnknownError(String),
}

impl Error {
    /// The wire-level error code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid argument",
            Error::MoveTargetOutOfBounds(_) => "move target out of bounds",
            Error::NoSuchAlert(_) => "no such alert",
            Error::NoSuchElement(_) => "no such element",
            Error::NoSuchFrame(_) => "no such frame",
            Error::NoSuchHistoryEntry(_) => "no such history entry",
            Error::NoSuchIntercept(_) => "no such intercept",
            Error::NoSuchNode(_) => "no such node",
            Error::NoSuchRequest(_) => "no such request",
            Error::NoSuchScript(_) => "no such script",
            Error::UnableToCaptureScreen(_) => "unable to capture screen",
            Error::UnknownCommand(_) => "unknown command",
            Error::UnsupportedOperation(_) => "unsupported operation",
            Error::UnknownError(_) => "unknown error",
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::UnknownError(msg.into())
    }

    /// The reason navigation latches are rejected with when a newer
    /// navigation supersedes a pending one.
    pub fn navigation_canceled() -> Self {
        Error::UnknownError("navigation canceled".into())
    }

    pub fn navigation_aborted() -> Self {
        Error::UnknownError("navigation aborted".into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

impl From<CdpError> for Error {
    fn from(err: CdpError) -> Self {
        Error::UnknownError(err.to_string())
    }
}

/// CDP error code reported when a command referenced a session that no
/// longer exists.
pub const CDP_SESSION_NOT_FOUND: i64 = -32001;

/// Errors produced by the CDP connection the core consumes. The three
/// conditions the core must tell apart are a closed session, a missing
/// session, and everything else.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CdpError {
    #[error("session closed")]
    SessionClosed,
    #[error("session with given id not found")]
    SessionNotFound,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("cdp error {code}: {message}")]
    Protocol { code: i64, message: String },
    #[error("{0}")]
    Serde(String),
}

impl CdpError {
    /// Build from an error object in a CDP response.
    pub fn from_response(code: i64, message: impl Into<String>) -> Self {
        if code == CDP_SESSION_NOT_FOUND {
            CdpError::SessionNotFound
        } else {
            CdpError::Protocol {
                code,
                message: message.into(),
            }
        }
    }

    /// Whether this error means the target went away rather than the
    /// command being wrong. Such errors are swallowed during target
    /// unblocking.
    pub fn is_session_gone(&self) -> bool {
        matches!(
            self,
            CdpError::SessionClosed | CdpError::SessionNotFound | CdpError::ConnectionClosed
        )
    }

    /// The raw CDP error message, when one exists.
    pub fn protocol_message(&self) -> Option<&str> {
        match self {
            CdpError::Protocol { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CdpError {
    fn from(err: serde_json::Error) -> Self {
        CdpError::Serde(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(
            Error::invalid_argument("bad pattern").code(),
            "invalid argument"
        );
        assert_eq!(Error::navigation_canceled().code(), "unknown error");
        assert_eq!(
            Error::MoveTargetOutOfBounds("x".into()).code(),
            "move target out of bounds"
        );
    }

    #[test]
    fn session_not_found_code() {
        assert_eq!(
            CdpError::from_response(-32001, "whatever"),
            CdpError::SessionNotFound
        );
        assert!(CdpError::SessionNotFound.is_session_gone());
        assert!(!CdpError::from_response(-32000, "boom").is_session_gone());
    }
}
