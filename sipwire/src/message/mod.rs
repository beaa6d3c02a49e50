#![deny(missing_docs)]
//! SIP message model.
//!
//! Messages here are built programmatically by the TU and printed to the
//! wire with [`crate::transport::ToBytes`]; parsing raw bytes is the job of
//! whatever feeds the endpoint.

/// SIP status codes.
pub mod code;
/// SIP methods.
pub mod method;

pub use code::StatusCode;
pub use method::SipMethod;

use std::fmt;

use bytes::Bytes;
use util::ArcStr;

use crate::headers::Headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The transport protocol a message travels over.
pub enum TransportType {
    /// Plain datagrams.
    Udp,
    /// Stream-oriented, reliable.
    Tcp,
    /// TLS over TCP.
    Tls,
}

impl TransportType {
    /// Returns `true` if this protocol retransmits on its own.
    pub const fn is_reliable(&self) -> bool {
        matches!(self, TransportType::Tcp | TransportType::Tls)
    }

    /// Returns `true` if this protocol is encrypted.
    pub const fn is_secure(&self) -> bool {
        matches!(self, TransportType::Tls)
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Udp => f.write_str("UDP"),
            TransportType::Tcp => f.write_str("TCP"),
            TransportType::Tls => f.write_str("TLS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// A SIP URI, kept as the string the TU supplied.
pub struct Uri(ArcStr);

impl Uri {
    /// Creates a new `Uri`.
    pub fn new(uri: impl Into<ArcStr>) -> Self {
        Uri(uri.into())
    }

    /// Returns the URI text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for Uri {
    fn from(s: &str) -> Self {
        Uri(s.into())
    }
}

#[derive(Debug, Clone)]
/// The first line of a request.
pub struct RequestLine {
    /// The request method.
    pub method: SipMethod,
    /// The request target.
    pub uri: Uri,
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0\r\n", self.method, self.uri)
    }
}

#[derive(Debug, Clone)]
/// The first line of a response.
pub struct StatusLine {
    /// The status code.
    pub code: StatusCode,
    /// The reason phrase.
    pub reason: ArcStr,
}

impl StatusLine {
    /// Creates a new `StatusLine` with the default reason for `code`.
    pub fn new(code: StatusCode) -> Self {
        StatusLine {
            code,
            reason: code.reason().into(),
        }
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}\r\n", self.code, self.reason)
    }
}

#[derive(Debug, Clone)]
/// A SIP request.
pub struct Request {
    /// The request line.
    pub req_line: RequestLine,
    /// The header list.
    pub headers: Headers,
    /// The message body, if any.
    pub body: Option<Bytes>,
}

impl Request {
    /// Returns the request method.
    pub fn method(&self) -> &SipMethod {
        &self.req_line.method
    }
}

#[derive(Debug, Clone)]
/// A SIP response.
pub struct Response {
    /// The status line.
    pub status_line: StatusLine,
    /// The header list.
    pub headers: Headers,
    /// The message body, if any.
    pub body: Option<Bytes>,
}

impl Response {
    /// Creates a response with an empty header list.
    pub fn new(status_line: StatusLine) -> Self {
        Response {
            status_line,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Returns the status code.
    pub fn code(&self) -> StatusCode {
        self.status_line.code
    }

    /// Returns the reason phrase.
    pub fn reason(&self) -> &str {
        &self.status_line.reason
    }

    /// Append headers to the message.
    pub fn append_headers(&mut self, other: &mut Headers) {
        self.headers.append(other);
    }
}
