/// Category of a store error. Lets the engine decide between
/// skipping a record and aborting the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Store unreachable: IO, timeout, dropped connection. Fatal to a run.
    Connection,
    /// Malformed or unexpected reply.
    Protocol,
    /// Authentication rejected (NOAUTH, WRONGPASS).
    Auth,
    /// Key holds a value that is not a hash.
    WrongType,
    /// Anything else the store reported.
    Logic,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Connection => f.write_str("connection"),
            ErrorKind::Protocol => f.write_str("protocol"),
            ErrorKind::Auth => f.write_str("auth"),
            ErrorKind::WrongType => f.write_str("wrong_type"),
            ErrorKind::Logic => f.write_str("logic"),
        }
    }
}

/// Unified error type for all `HashStore` methods.
///
/// Carries an `ErrorKind` for categorization and a human-readable message.
/// `From` impls assign the kind automatically so backends can use `?`.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreError {
    kind: ErrorKind,
    message: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, msg)
    }

    pub fn wrong_type(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::WrongType, msg)
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Logic, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Store unreachable — the caller should stop issuing commands.
    pub fn is_connection(&self) -> bool {
        self.kind == ErrorKind::Connection
    }

    /// Prepend context, keeping the kind: `"context: original message"`.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl std::fmt::Debug for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::connection(e.to_string())
    }
}

impl From<std::str::Utf8Error> for StoreError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::protocol(e.to_string())
    }
}

impl From<std::num::ParseIntError> for StoreError {
    fn from(e: std::num::ParseIntError) -> Self {
        Self::protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_connection_errors() {
        let err: StoreError = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_connection());
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn context_keeps_kind() {
        let err = StoreError::wrong_type("WRONGTYPE").with_context("HGETALL selection:abc");
        assert_eq!(err.kind(), ErrorKind::WrongType);
        assert_eq!(err.message(), "HGETALL selection:abc: WRONGTYPE");
        assert_eq!(format!("{err:?}"), "[wrong_type] HGETALL selection:abc: WRONGTYPE");
    }
}
