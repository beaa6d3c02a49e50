//! # sipwire
//!
//! The transaction core of a SIP stack: RFC 3261 client and server
//! transactions over pluggable transports, with the endpoint and message
//! plumbing they need.

pub mod endpoint;
pub mod headers;
pub mod message;
pub mod service;
pub mod transaction;
pub mod transport;

pub(crate) mod error;

pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use service::SipService;
pub use transaction::{TransactionUser, TsxStateEvent};

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

use std::net::SocketAddr;

pub(crate) fn get_local_name(addr: &SocketAddr) -> String {
    let ip = local_ip_address::local_ip().unwrap_or(addr.ip());
    let local_name = format!("{}:{}", ip, addr.port());

    local_name
}
