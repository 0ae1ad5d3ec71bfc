//! Error types for pgwire-client.

use std::collections::HashMap;
use thiserror::Error;

/// Result type for pgwire-client operations.
pub type Result<T> = core::result::Result<T, Error>;

/// PostgreSQL error field type codes.
pub mod field_type {
    pub const SEVERITY: u8 = b'S';
    pub const SEVERITY_V: u8 = b'V';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
    pub const INTERNAL_POSITION: u8 = b'p';
    pub const INTERNAL_QUERY: u8 = b'q';
    pub const WHERE: u8 = b'W';
    pub const SCHEMA: u8 = b's';
    pub const TABLE: u8 = b't';
    pub const COLUMN: u8 = b'c';
    pub const DATA_TYPE: u8 = b'd';
    pub const CONSTRAINT: u8 = b'n';
    pub const FILE: u8 = b'F';
    pub const LINE: u8 = b'L';
    pub const ROUTINE: u8 = b'R';
}

/// PostgreSQL server error/notice message.
#[derive(Debug, Clone)]
pub struct ServerError(pub(crate) HashMap<u8, String>);

impl ServerError {
    /// Create from a HashMap of field codes to values.
    pub fn new(fields: HashMap<u8, String>) -> Self {
        Self(fields)
    }

    // Always present (PostgreSQL 9.6+)

    /// Severity (localized): ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub fn severity(&self) -> &str {
        self.0
            .get(&field_type::SEVERITY)
            .map(|s| s.as_str())
            .unwrap_or_default()
    }

    /// Severity (non-localized, never translated)
    pub fn severity_v(&self) -> &str {
        self.0
            .get(&field_type::SEVERITY_V)
            .map(|s| s.as_str())
            .unwrap_or_default()
    }

    /// SQLSTATE error code (5 characters)
    pub fn code(&self) -> &str {
        self.0
            .get(&field_type::CODE)
            .map(|s| s.as_str())
            .unwrap_or_default()
    }

    /// Primary error message
    pub fn message(&self) -> &str {
        self.0
            .get(&field_type::MESSAGE)
            .map(|s| s.as_str())
            .unwrap_or_default()
    }

    // Optional fields

    /// Detailed error explanation
    pub fn detail(&self) -> Option<&str> {
        self.0.get(&field_type::DETAIL).map(|s| s.as_str())
    }

    /// Suggestion for fixing the error
    pub fn hint(&self) -> Option<&str> {
        self.0.get(&field_type::HINT).map(|s| s.as_str())
    }

    /// Cursor position in query string (1-based)
    pub fn position(&self) -> Option<u32> {
        self.0
            .get(&field_type::POSITION)
            .and_then(|s| s.parse().ok())
    }

    /// Position in internal query
    pub fn internal_position(&self) -> Option<u32> {
        self.0
            .get(&field_type::INTERNAL_POSITION)
            .and_then(|s| s.parse().ok())
    }

    /// Failed internal command text
    pub fn internal_query(&self) -> Option<&str> {
        self.0.get(&field_type::INTERNAL_QUERY).map(|s| s.as_str())
    }

    /// Context/stack trace
    pub fn where_(&self) -> Option<&str> {
        self.0.get(&field_type::WHERE).map(|s| s.as_str())
    }

    /// Schema name
    pub fn schema(&self) -> Option<&str> {
        self.0.get(&field_type::SCHEMA).map(|s| s.as_str())
    }

    /// Table name
    pub fn table(&self) -> Option<&str> {
        self.0.get(&field_type::TABLE).map(|s| s.as_str())
    }

    /// Column name
    pub fn column(&self) -> Option<&str> {
        self.0.get(&field_type::COLUMN).map(|s| s.as_str())
    }

    /// Data type name
    pub fn data_type(&self) -> Option<&str> {
        self.0.get(&field_type::DATA_TYPE).map(|s| s.as_str())
    }

    /// Constraint name
    pub fn constraint(&self) -> Option<&str> {
        self.0.get(&field_type::CONSTRAINT).map(|s| s.as_str())
    }

    /// Source file name
    pub fn file(&self) -> Option<&str> {
        self.0.get(&field_type::FILE).map(|s| s.as_str())
    }

    /// Source line number
    pub fn line(&self) -> Option<u32> {
        self.0.get(&field_type::LINE).and_then(|s| s.parse().ok())
    }

    /// Source routine name
    pub fn routine(&self) -> Option<&str> {
        self.0.get(&field_type::ROUTINE).map(|s| s.as_str())
    }

    /// Get a field by its type code.
    pub fn get(&self, field_type: u8) -> Option<&str> {
        self.0.get(&field_type).map(|s| s.as_str())
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (SQLSTATE {})",
            self.severity(),
            self.message(),
            self.code()
        )?;
        if let Some(detail) = self.detail() {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = self.hint() {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for pgwire-client.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying transport failed (connect, read, or write).
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// `sslmode=require` was requested but the server replied that it does not
    /// support TLS ('N' in response to `SSLRequest`).
    #[error("server does not support SSL, but sslmode requires it")]
    SslNotSupported,

    /// TLS handshake or configuration failure.
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// The server asked for cleartext password auth but no password was configured.
    #[error("server requires a cleartext password, but none was configured")]
    CleartextPasswordCredentialRequired,

    /// The server asked for MD5 password auth but no password was configured.
    #[error("server requires an MD5 password, but none was configured")]
    Md5PasswordCredentialRequired,

    /// The server offered SASL but not the SCRAM-SHA-256 mechanism (or no password was configured).
    #[error("server requires SCRAM-SHA-256 authentication, but it is unavailable")]
    ScramSHA256CredentialRequired,

    /// The server accepted the connection without any credential, but none was expected.
    #[error("server requires trust authentication, which this client does not support requesting")]
    TrustCredentialRequired,

    /// The server requested an authentication method this client does not implement
    /// (Kerberos, GSSAPI, SSPI, ...).
    #[error("unsupported authentication type: {0}")]
    UnsupportedAuthenticationType(String),

    /// The SCRAM-SHA-256 exchange violated the expected message grammar (RFC 5802/7677).
    #[error("SCRAM-SHA-256 mechanism violated: {0}")]
    ScramSHA256MechanismViolated(String),

    /// The server's final SCRAM signature did not match the expected value.
    #[error("SCRAM-SHA-256 server verification failed")]
    ScramSHA256ServerVerificationFailed,

    /// The server returned an `ErrorResponse` for a query.
    #[error("SQL error: {0}")]
    SqlError(ServerError),

    /// An operation was attempted on a connection that has already been closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// `commitTransaction`/`rollbackTransaction` was called while not inside a transaction.
    #[error("not in a transaction")]
    NotInTransaction,

    /// An operation was attempted on a pool that has shut down.
    #[error("connection pool is closed")]
    ConnectionPoolClosed,

    /// The pool's pending-request queue is already at `maximumPendingRequests`.
    #[error("too many requests are already waiting for a connection")]
    TooManyRequestsForConnections,

    /// A pending request waited longer than `pendingRequestTimeout` (or
    /// `allocatedConnectionTimeout`) for a connection.
    #[error("timed out acquiring a connection from the pool")]
    TimedOutAcquiringConnection,

    /// A value could not be converted to or from its text wire representation.
    #[error("value conversion error: {0}")]
    ValueConversionError(String),

    /// Malformed message, unexpected response, or a protocol invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A feature or message type this client does not implement.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Invalid usage of the API (e.g. a cursor used after the connection moved on).
    #[error("invalid usage: {0}")]
    InvalidUsage(String),
}

impl Error {
    /// Returns true if the error leaves the connection in a state where it must be
    /// closed rather than reused.
    ///
    /// This covers transport failures, protocol violations, authentication failures,
    /// and server errors of severity FATAL or PANIC. A `SqlError` of severity ERROR
    /// inside a transaction still leaves the *connection* usable -- only the
    /// transaction is aborted -- so it is not fatal to the connection by itself.
    pub fn is_fatal_to_connection(&self) -> bool {
        match self {
            Error::Socket(_)
            | Error::SslNotSupported
            | Error::CleartextPasswordCredentialRequired
            | Error::Md5PasswordCredentialRequired
            | Error::ScramSHA256CredentialRequired
            | Error::TrustCredentialRequired
            | Error::UnsupportedAuthenticationType(_)
            | Error::ScramSHA256MechanismViolated(_)
            | Error::ScramSHA256ServerVerificationFailed
            | Error::ConnectionClosed
            | Error::Protocol(_) => true,
            #[cfg(feature = "tls")]
            Error::Tls(_) => true,
            Error::SqlError(err) => matches!(err.severity_v(), "FATAL" | "PANIC"),
            _ => false,
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::SqlError(err) => Some(err.code()),
            _ => None,
        }
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized> From<zerocopy::error::CastError<Src, Dst>>
    for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}
