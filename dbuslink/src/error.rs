use std::io;
use std::panic::Location;

use chainerror::*;
use dbuslink_signature::ParseError;

use crate::message::Message;

pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const ERROR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),
    #[error("{0}")]
    Signature(ParseError),
    #[error("Framing error: {0}")]
    Framing(String),
    #[error("Type mismatch: signature expects '{expected}', got '{found}'")]
    TypeMismatch { expected: String, found: String },
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Invalid name: '{0}'")]
    InvalidName(String),
    #[error("Already registered: {0}")]
    DuplicateRegistration(String),
    #[error("Unknown object: {0}")]
    UnknownObject(String),
    #[error("Unknown interface: {0}")]
    UnknownInterface(String),
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("Error reply {name}: {message}")]
    ErrorReply { name: String, message: String },
    #[error("Call replied already")]
    AlreadyReplied,
    #[error("Timeout Error")]
    Timeout,
    #[error("Connection Closed")]
    ConnectionClosed,
    #[error("Dispatcher stopped")]
    DispatcherStopped,
    #[error("Invalid bus address: {0}")]
    InvalidAddress(String),
    #[error("{0}")]
    Failed(String),
}

impl ErrorKind {
    /// The protocol error name used when this kind is sent as an error reply.
    pub fn error_name(&self) -> &str {
        match self {
            ErrorKind::UnknownObject(_) => ERROR_UNKNOWN_OBJECT,
            ErrorKind::UnknownInterface(_) => ERROR_UNKNOWN_INTERFACE,
            ErrorKind::UnknownMethod(_) => ERROR_UNKNOWN_METHOD,
            ErrorKind::InvalidArgs(_) | ErrorKind::TypeMismatch { .. } => ERROR_INVALID_ARGS,
            ErrorKind::Timeout => ERROR_NO_REPLY,
            ErrorKind::ErrorReply { name, .. } => name.as_str(),
            _ => ERROR_FAILED,
        }
    }

    /// The human readable text sent along with an error reply.
    pub fn error_text(&self) -> String {
        match self {
            ErrorKind::UnknownObject(v)
            | ErrorKind::UnknownInterface(v)
            | ErrorKind::UnknownMethod(v)
            | ErrorKind::InvalidArgs(v)
            | ErrorKind::Failed(v) => v.clone(),
            ErrorKind::ErrorReply { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// The kind of an I/O error; a peer going away is `ConnectionClosed`.
    pub fn from_io(e: &io::Error) -> ErrorKind {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => ErrorKind::ConnectionClosed,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ErrorKind::Timeout,
            kind => ErrorKind::Io(kind),
        }
    }

    pub fn from_parse(e: &ParseError) -> ErrorKind {
        ErrorKind::Signature(e.clone())
    }

    /// The kind a caller sees for a received error reply.
    pub fn from_reply(message: &Message) -> ErrorKind {
        let name = message.error_name().unwrap_or(ERROR_FAILED);
        ErrorKind::from_error_name(name, message.error_text())
    }

    /// An [`Error`] of this kind without a cause, located at the caller.
    #[track_caller]
    pub fn into_error(self) -> Error {
        ChainError::new(self, None, Some(Location::caller().to_string()))
    }

    /// Map a received error name and text back to a kind.
    pub fn from_error_name(name: &str, text: String) -> ErrorKind {
        match name {
            ERROR_UNKNOWN_OBJECT => ErrorKind::UnknownObject(text),
            ERROR_UNKNOWN_INTERFACE => ErrorKind::UnknownInterface(text),
            ERROR_UNKNOWN_METHOD => ErrorKind::UnknownMethod(text),
            ERROR_INVALID_ARGS => ErrorKind::InvalidArgs(text),
            _ => ErrorKind::ErrorReply {
                name: name.to_string(),
                message: text,
            },
        }
    }
}

impl ChainErrorFrom<io::Error> for ErrorKind {
    fn chain_error_from(e: io::Error, line_filename: Option<String>) -> ChainError<Self> {
        ChainError::<_>::new(ErrorKind::from_io(&e), Some(Box::from(e)), line_filename)
    }
}

pub type Result<T> = ChainResult<T, ErrorKind>;
pub type Error = ChainError<ErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_context_keeps_cause() {
        let r: std::result::Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"));
        let e = r.context(ErrorKind::Failed("write".into())).unwrap_err();
        assert_eq!(*e.kind(), ErrorKind::Failed("write".into()));
        let cause = e.source().unwrap();
        assert_eq!(cause.to_string(), "disk on fire");
    }

    #[test]
    fn test_io_kinds() {
        let r: std::result::Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        let e = r.map_context(ErrorKind::from_io).unwrap_err();
        assert_eq!(*e.kind(), ErrorKind::ConnectionClosed);
        assert!(e.source().is_some());

        let e = ErrorKind::chain_error_from(io::Error::from(io::ErrorKind::TimedOut), None);
        assert_eq!(*e.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_into_error_has_no_cause() {
        let e = ErrorKind::Timeout.into_error();
        assert_eq!(*e.kind(), ErrorKind::Timeout);
        assert!(e.source().is_none());
        assert_eq!(e.kind().error_name(), ERROR_NO_REPLY);
    }
}
