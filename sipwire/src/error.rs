use thiserror::Error;

use crate::message::SipMethod;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("Missing required '{0}' header")]
    MissingRequiredHeader(&'static str),

    #[error("Invalid '{0}' header")]
    InvalidHeader(&'static str),

    #[error("Method {0} cannot start this kind of transaction")]
    InvalidMethod(SipMethod),

    #[error("A transaction with the same key is already registered")]
    DuplicateKey,

    #[error("Transaction already received a final response")]
    AlreadyCompleted,

    #[error("Operation is not valid in the current transaction state")]
    InvalidOperation,

    #[error("Resource is busy")]
    Busy,

    #[error("Transaction limit reached")]
    TooManyTransactions,

    #[error("Transaction has been destroyed")]
    TransactionDestroyed,

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("Transport not found for {0}")]
    TransportNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Fmt Error")]
    Fmt(#[from] std::fmt::Error),
}
