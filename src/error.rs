//! Contains the `Error` and `Result` types that `mongodb-core` uses.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

use crate::options::ServerAddress;

/// The result type for all methods that can return an error in `mongodb-core`.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
pub(crate) const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// An error that can occur in the driver.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Arc<ErrorKind>,

    labels: HashSet<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            kind: Arc::new(kind),
            labels: labels.into_iter().collect(),
        }
    }

    /// Whether this error contains the specified label.
    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// The set of labels attached to this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    pub(crate) fn add_label(&mut self, label: impl Into<String>) {
        self.labels.insert(label.into());
    }

    pub(crate) fn authentication_error(mechanism_name: &str, reason: &str) -> Self {
        ErrorKind::Authentication {
            reason: AuthenticationFailureReason::ScramFailure,
            message: format!("{} failure: {}", mechanism_name, reason),
        }
        .into()
    }

    pub(crate) fn invalid_authentication_response(mechanism_name: &str) -> Self {
        ErrorKind::Authentication {
            reason: AuthenticationFailureReason::MalformedDetails,
            message: format!("{} failure: invalid server response", mechanism_name),
        }
        .into()
    }

    pub(crate) fn unsupported_auth_mechanism(name: &str) -> Self {
        ErrorKind::Authentication {
            reason: AuthenticationFailureReason::UnsupportedMechanism,
            message: format!("authentication mechanism {} is not supported", name),
        }
        .into()
    }

    pub(crate) fn invalid_uri(reason: InvalidUriReason, message: impl Into<String>) -> Self {
        ErrorKind::InvalidUri {
            reason,
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        ErrorKind::Protocol {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    /// Whether this error was caused by the transport rather than by the server rejecting a
    /// well-formed command. Network errors poison the connection they occurred on.
    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::Io(..)
                | ErrorKind::ConnectionClosed
                | ErrorKind::Protocol { .. }
                | ErrorKind::Timeout {
                    scope: TimeoutScope::Socket
                }
        )
    }

    /// The server-provided error code, if this wraps a command failure.
    pub fn code(&self) -> Option<i32> {
        match *self.kind {
            ErrorKind::Command(ref err) => Some(err.code),
            _ => None,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self {
            kind: Arc::new(err.into()),
            labels: Default::default(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(err))
    }
}

impl std::ops::Deref for Error {
    type Target = ErrorKind;

    fn deref(&self) -> &Self::Target {
        self.kind.as_ref()
    }
}

/// The types of errors that can occur.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An error occurred while the client attempted to authenticate a connection.
    #[error("{message}")]
    Authentication {
        reason: AuthenticationFailureReason,
        message: String,
    },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(#[from] bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(#[from] bson::ser::Error),

    /// A command could not be assembled from the values provided.
    #[error("cannot form a command: {reason}")]
    CannotFormCommand { reason: CannotFormCommandReason },

    /// The server returned an error in response to an otherwise well-formed command.
    #[error("command failed {0}")]
    Command(CommandError),

    /// The operation was attempted on a connection that has been poisoned by a previous
    /// failure or closed by the pool.
    #[error("the connection is closed and cannot serve commands")]
    ConnectionClosed,

    /// The driver reached an inconsistent internal state.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// An invalid argument was provided to a driver method.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The server's reply parsed as BSON but did not have the expected shape.
    #[error("invalid server response: {message}")]
    InvalidResponse { message: String },

    /// A connection string could not be parsed.
    #[error("invalid connection string ({reason}): {message}")]
    InvalidUri {
        reason: InvalidUriReason,
        message: String,
    },

    /// Wrapper around `std::io::Error`.
    #[error("{0}")]
    Io(Arc<std::io::Error>),

    /// A connection was requested from a pool that has been shut down.
    #[error("attempted to check out a connection from the closed pool for {address}")]
    PoolClosed { address: ServerAddress },

    /// The wait for a pooled connection outlasted the configured connect timeout.
    #[error("timed out waiting for a connection from the pool for {address}")]
    PoolExhausted { address: ServerAddress },

    /// A wire protocol frame could not be produced or understood.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// An operation did not complete before its deadline.
    #[error("the {scope} deadline elapsed before the operation completed")]
    Timeout { scope: TimeoutScope },
}

/// The reasons a connection string can be rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum InvalidUriReason {
    /// The string does not begin with `mongodb://`.
    MissingMongoDbScheme,

    /// The string has the right scheme but cannot be split into its components.
    Malformed,

    /// The user-info section is present but unusable.
    MalformedAuthenticationDetails,

    /// The `authMechanism` option names a mechanism the driver does not implement.
    UnsupportedAuthenticationMechanism,

    /// A port was present but outside `1..=65535`.
    InvalidPort,
}

impl fmt::Display for InvalidUriReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            InvalidUriReason::MissingMongoDbScheme => "missing mongodb scheme",
            InvalidUriReason::Malformed => "malformed",
            InvalidUriReason::MalformedAuthenticationDetails => "malformed authentication details",
            InvalidUriReason::UnsupportedAuthenticationMechanism => {
                "unsupported authentication mechanism"
            }
            InvalidUriReason::InvalidPort => "invalid port",
        };
        f.write_str(s)
    }
}

/// The reasons authentication can fail.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AuthenticationFailureReason {
    /// The SCRAM conversation itself failed: bad credentials, a bad server proof, or a
    /// server-side error during the exchange.
    ScramFailure,

    /// The server's contribution to the conversation could not be parsed.
    MalformedDetails,

    /// The requested mechanism is not implemented by this driver.
    UnsupportedMechanism,
}

/// The reasons a command cannot be assembled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CannotFormCommandReason {
    /// The inputs describe no work, e.g. an empty batch.
    NothingToDo,
}

impl fmt::Display for CannotFormCommandReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CannotFormCommandReason::NothingToDo => f.write_str("nothing to do"),
        }
    }
}

/// The operation whose deadline elapsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TimeoutScope {
    /// Establishing the TCP (and optionally TLS) stream.
    Connect,

    /// Writing a request or awaiting its reply on an established connection.
    Socket,

    /// Waiting for a connection checked out with an explicit deadline.
    Checkout,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TimeoutScope::Connect => "connect",
            TimeoutScope::Socket => "socket",
            TimeoutScope::Checkout => "checkout",
        };
        f.write_str(s)
    }
}

/// An error returned by the server in response to a command, i.e. an `ok: 0` reply.
#[derive(Clone, Debug, Deserialize)]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "default_errmsg")]
    pub message: String,
}

fn default_errmsg() -> String {
    "command failure".to_string()
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "({}): {}", self.code_name, self.message)
    }
}
