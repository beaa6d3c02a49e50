//! # sipwire-stun
//!
//! The STUN (RFC 5389) client engine of the `sipwire` workspace: a header
//! and attribute codec, the retransmitting client transaction, and the
//! session that owns credentials and pending transactions.

pub mod message;
pub mod session;
pub mod transaction;

pub use message::{Message, MessageClass, Method, TransactionId, MAGIC_COOKIE};
pub use session::{Credentials, Session, SessionConfig, SessionHandler};
pub use transaction::{ClientTransaction, RetransmitConfig, TransactionHandler, TransactionOutcome};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Packet is not a STUN message")]
    NotStun,

    #[error("Malformed STUN message: {0}")]
    Malformed(&'static str),

    #[error("Session has been closed")]
    SessionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
