/// Crate result type, using Error for all errors.
pub type CResult<T> = std::result::Result<T, Error>;

/// Errors raised by the off-chain protocol stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A payload could not be decoded as the expected JSON object.
    Parse(String),

    /// The storage backend failed.
    Storage(String),

    /// A key was not found in the storage backend.
    NotFound,

    /// A write was attempted outside an open storage transaction.
    WriteOutsideTransaction,

    /// A command depends on object versions that do not exist, or that do
    /// not meet the required liveness bar.
    MissingDependency(String),

    /// The command processor rejected a command.
    CommandValidation(String),

    /// The business layer cannot answer yet; the question must be asked
    /// again later. Deferred commands are never sequenced.
    Deferred,

    /// The peer violated the channel protocol (bad sequence index, role
    /// violation, or a channel opened to oneself).
    Channel(String),

    /// A message is ahead of the current cursor and the caller asked for a
    /// synchronous answer (nowait).
    OutOfOrder(String),

    /// Signature verification of a wire payload failed. Fatal for the
    /// channel.
    Signature(String),

    /// An unexpected internal state.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Storage(msg) => write!(f, "storage error: {}", msg),
            Error::NotFound => write!(f, "key not found"),
            Error::WriteOutsideTransaction => {
                write!(f, "store cannot be used for writing outside a transaction")
            }
            Error::MissingDependency(msg) => write!(f, "missing dependency: {}", msg),
            Error::CommandValidation(msg) => write!(f, "command validation: {}", msg),
            Error::Deferred => write!(f, "business answer deferred"),
            Error::Channel(msg) => write!(f, "channel error: {}", msg),
            Error::OutOfOrder(msg) => write!(f, "out of order: {}", msg),
            Error::Signature(msg) => write!(f, "signature error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}
