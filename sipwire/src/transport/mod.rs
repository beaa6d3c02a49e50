#![warn(missing_docs)]
//! SIP Transport Layer.
//!
//! The transaction core treats transports as collaborators: anything that
//! can push bytes towards a peer and report whether it is reliable. The
//! layer itself is a registry of live transports plus the outgoing message
//! envelope types the transactions exchange with it.

use std::{
    borrow::Cow,
    collections::HashMap,
    io::Write,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    error::Result,
    headers::{CSeq, CallId, From as FromHdr, Headers, HostPort, To, Via},
    message::{Request, Response, SipMethod, StatusCode, TransportType},
    transaction::{key::TsxKey, ServerTsx},
};

pub mod udp;

#[cfg(test)]
pub(crate) mod mock;

/// This trait represents a abstraction over a SIP transport implementation.
#[async_trait::async_trait]
pub trait Transport: Sync + Send + 'static {
    /// Sends a buffer to the specified remote socket address.
    ///
    /// Returns the number of bytes sent or an I/O error.
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize>;

    /// Returns the transport kind (e.g., UDP, TCP, TLS).
    fn protocol(&self) -> TransportType;

    /// Returns the local socket address bound to this transport.
    fn addr(&self) -> SocketAddr;

    /// Checks if the provided address belongs to the same IP address family
    /// (IPv4 vs IPv6) as the local socket address.
    fn is_same_af(&self, addr: &SocketAddr) -> bool {
        let our_addr = self.addr();

        (addr.is_ipv4() && our_addr.is_ipv4()) || (addr.is_ipv6() && our_addr.is_ipv6())
    }

    /// Returns the local transport name.
    fn local_name(&self) -> Cow<'_, str>;

    /// Returns `true` if the transport is reliable (e.g., TCP or TLS).
    fn reliable(&self) -> bool {
        self.protocol().is_reliable()
    }

    /// Returns `true` if the transport is secure (e.g., TLS).
    fn secure(&self) -> bool {
        self.protocol().is_secure()
    }

    /// Returns the key that uniquely identifies this transport connection.
    fn key(&self) -> TransportKey {
        TransportKey::new(self.addr(), self.protocol())
    }
}

/// This type represents a key used to identify a transport connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransportKey {
    /// The socket address of the transport.
    addr: SocketAddr,
    /// The transport kind (e.g., UDP, TCP, TLS).
    kind: TransportType,
}

impl TransportKey {
    /// Creates a new `TransportKey`.
    pub fn new(addr: SocketAddr, kind: TransportType) -> Self {
        TransportKey { addr, kind }
    }
}

/// This type represents a received SIP packet.
#[derive(Clone)]
pub struct Packet {
    /// The raw payload.
    pub buf: Bytes,
    /// The address of the sender.
    pub addr: SocketAddr,
    /// The time the packet was received.
    pub time: SystemTime,
}

/// Represents the address of an outbound message.
#[derive(Clone)]
pub enum OutgoingAddr {
    /// A host that still needs resolution and transport selection.
    HostPort {
        /// The host and port of the address.
        host: HostPort,
        /// The transport protocol to use.
        protocol: TransportType,
    },
    /// A resolved address with a chosen transport.
    Addr {
        /// The socket address.
        addr: SocketAddr,
        /// The transport to use.
        transport: Arc<dyn Transport>,
    },
}

impl OutgoingAddr {
    /// Returns `true` when the destination rides a reliable transport.
    ///
    /// Known even before a transport is bound, from the protocol selector.
    pub fn is_reliable(&self) -> bool {
        match self {
            OutgoingAddr::HostPort { protocol, .. } => protocol.is_reliable(),
            OutgoingAddr::Addr { transport, .. } => transport.reliable(),
        }
    }
}

/// This trait is used to convert a type into a byte buffer.
pub trait ToBytes: Sized {
    /// Converts the type into a byte buffer.
    fn to_bytes(&self) -> Result<Bytes>;
}

fn write_message(
    buf_writer: &mut bytes::buf::Writer<BytesMut>,
    headers: &Headers,
    body: Option<&Bytes>,
) -> Result<()> {
    for header in headers.iter() {
        write!(buf_writer, "{header}\r\n")?;
    }

    match body {
        Some(body) => {
            write!(buf_writer, "Content-Length: {}\r\n", body.len())?;
            write!(buf_writer, "\r\n")?;
            buf_writer.write_all(body)?;
        }
        None => {
            write!(buf_writer, "Content-Length: 0\r\n")?;
            write!(buf_writer, "\r\n")?;
        }
    }

    Ok(())
}

/// This type represents an outbound SIP request.
pub struct OutgoingRequest {
    /// The SIP request message.
    pub msg: Request,
    /// The addr to send the request to.
    pub addr: SocketAddr,
    /// The message raw buffer.
    pub buf: Option<Bytes>,
    /// The transport to use for sending the request.
    pub transport: Arc<dyn Transport>,
}

impl OutgoingRequest {
    /// Returns the message method.
    pub fn method(&self) -> &SipMethod {
        self.msg.method()
    }
}

impl ToBytes for OutgoingRequest {
    fn to_bytes(&self) -> Result<Bytes> {
        let estimated_message_size = if self.msg.body.is_none() { 800 } else { 1500 };
        let buf = BytesMut::with_capacity(estimated_message_size);

        let mut buf_writer = buf.writer();

        write!(buf_writer, "{}", &self.msg.req_line)?;
        write_message(&mut buf_writer, &self.msg.headers, self.msg.body.as_ref())?;

        Ok(buf_writer.into_inner().freeze())
    }
}

/// This type represents an outgoing SIP response.
pub struct OutgoingResponse {
    /// The SIP response message.
    pub msg: Response,
    /// The address to send the response to.
    pub addr: OutgoingAddr,
    /// The message raw buffer.
    pub buf: Option<Bytes>,
}

impl OutgoingResponse {
    /// Returns the message status code.
    pub fn status_code(&self) -> StatusCode {
        self.msg.code()
    }

    /// Returns the message reason text.
    pub fn reason(&self) -> &str {
        self.msg.reason()
    }

    /// Returns `true` if this is a provisional response.
    pub fn is_provisional(&self) -> bool {
        self.msg.code().is_provisional()
    }

    /// Set the message body.
    pub fn set_body(&mut self, body: Bytes) {
        self.msg.body = Some(body);
    }
}

impl ToBytes for OutgoingResponse {
    fn to_bytes(&self) -> Result<Bytes> {
        let estimated_message_size = if self.msg.body.is_none() { 800 } else { 1500 };
        let buf = BytesMut::with_capacity(estimated_message_size);

        let mut buf_writer = buf.writer();

        write!(buf_writer, "{}", &self.msg.status_line)?;
        write_message(&mut buf_writer, &self.msg.headers, self.msg.body.as_ref())?;

        Ok(buf_writer.into_inner().freeze())
    }
}

/// The transaction-relevant headers, extracted once per message.
#[derive(Clone)]
pub struct RequestHeaders {
    /// The topmost Via header as found in the message.
    pub via: Via,
    /// The From header found in the message.
    pub from: FromHdr,
    /// The To header found in the message.
    pub to: To,
    /// The CSeq header as found in the message.
    pub cseq: CSeq,
    /// The Call-ID header found in the message.
    pub call_id: CallId,
}

/// This type represents an received SIP request.
pub struct IncomingRequest {
    /// The SIP request message.
    pub msg: Request,
    /// The transport used to receive the request.
    pub transport: Arc<dyn Transport>,
    /// The packet that contains the request.
    pub packet: Packet,
    /// The server transaction associated with this request, if any.
    pub(crate) tsx: Option<ServerTsx>,
    /// The request headers extracted from the request.
    pub req_headers: RequestHeaders,
}

impl IncomingRequest {
    /// Returns `true` if the message method matches the given `SipMethod`.
    #[inline(always)]
    pub fn is_method(&self, method: &SipMethod) -> bool {
        self.msg.method() == method
    }

    /// Returns the message method.
    pub fn method(&self) -> &SipMethod {
        self.msg.method()
    }

    /// Gets the source socket address of the packet.
    pub fn addr(&self) -> &SocketAddr {
        &self.packet.addr
    }

    /// Returns the transaction key for this request (if any).
    pub fn tsx_key(&self) -> Option<&TsxKey> {
        self.tsx.as_ref().map(|tsx| tsx.key())
    }

    #[inline]
    pub(crate) fn set_tsx(&mut self, tsx: ServerTsx) {
        self.tsx = Some(tsx);
    }
}

/// Represents an received SIP response.
pub struct IncomingResponse {
    /// The SIP response message.
    pub msg: Response,
    /// The transport used to receive the response.
    pub transport: Arc<dyn Transport>,
    /// The packet that contains the response.
    pub packet: Packet,
    /// The request headers extracted from the response.
    pub req_headers: RequestHeaders,
}

impl IncomingResponse {
    /// Returns the response status code.
    pub fn code(&self) -> StatusCode {
        self.msg.code()
    }
}

/// Transport Layer for SIP messages.
///
/// Holds every live transport, keyed by local address and protocol.
#[derive(Default)]
pub struct TransportLayer {
    transports: Mutex<HashMap<TransportKey, Arc<dyn Transport>>>,
}

impl TransportLayer {
    pub(crate) fn new() -> Self {
        Self {
            transports: Default::default(),
        }
    }

    /// Registers a transport.
    pub fn add(&self, transport: Arc<dyn Transport>) {
        let key = transport.key();
        let mut map = self.transports.lock().expect("Lock failed");

        log::trace!("Transport registered [{}]", transport.local_name());
        map.insert(key, transport);
    }

    /// Finds a transport able to reach `addr` over `protocol`.
    pub fn find(&self, addr: SocketAddr, protocol: TransportType) -> Option<Arc<dyn Transport>> {
        let map = self.transports.lock().expect("Lock failed");

        map.values()
            .find(|tp| tp.protocol() == protocol && tp.is_same_af(&addr))
            .cloned()
    }

    /// Removes a transport, returning it when it was registered.
    pub fn remove(&self, key: &TransportKey) -> Option<Arc<dyn Transport>> {
        let mut map = self.transports.lock().expect("Lock failed");
        map.remove(key)
    }

    /// Returns the number of registered transports.
    pub fn count(&self) -> usize {
        self.transports.lock().expect("Lock failed").len()
    }

    /// Drops every registered transport.
    pub fn clear(&self) {
        self.transports.lock().expect("Lock failed").clear();
    }
}
