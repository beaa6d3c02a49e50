#![deny(missing_docs)]
//! SIP Endpoint
//!

pub mod builder;

pub use builder::Builder;

use crate::headers::{Header, HostPort, Via};
use crate::message::{Response, StatusCode, StatusLine};
use crate::transaction::{
    ClientTransaction, InvClientTransaction, InvServerTransaction, ServerTransaction,
    TransactionLayer, TransactionUser,
};
use crate::transport::{
    IncomingRequest, IncomingResponse, OutgoingAddr, OutgoingRequest, OutgoingResponse, Transport,
    TransportKey, TransportLayer,
};
use crate::SipService;
use crate::{
    error::{Error, Result},
    headers::Headers,
};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use util::Resolver;

/// The transaction timer settings of an endpoint.
///
/// Every SIP timer derives from these values. They are captured by each
/// transaction at creation, so changing them on a running endpoint only
/// affects transactions created afterwards.
#[derive(Debug, Clone, Copy)]
pub struct TimerSettings {
    /// Estimated round-trip time (RTT) for message exchanges.
    ///
    /// This value is used as the baseline when computing retransmission
    /// intervals. The overall transaction timeout is 64 times this value.
    pub t1: Duration,
    /// Maximum retransmission interval for non-INVITE requests and INVITE
    /// responses.
    ///
    /// Retransmissions back off exponentially, but will not exceed this
    /// value.
    pub t2: Duration,
    /// Maximum duration that a message may remain in the network before
    /// being discarded.
    pub t4: Duration,
    /// How long a completed INVITE client transaction lingers to absorb
    /// response retransmissions (timer D).
    pub td: Duration,
}

impl TimerSettings {
    /// Default T1 value.
    pub const T1: Duration = Duration::from_millis(500);
    /// Default T2 value.
    pub const T2: Duration = Duration::from_secs(4);
    /// Default T4 value.
    pub const T4: Duration = Duration::from_secs(5);
    /// Default timer D value.
    pub const TD: Duration = Duration::from_secs(32);

    /// The overall transaction deadline (timers B and F).
    pub fn timeout(&self) -> Duration {
        self.t1 * 64
    }
}

impl Default for TimerSettings {
    fn default() -> Self {
        TimerSettings {
            t1: Self::T1,
            t2: Self::T2,
            t4: Self::T4,
            td: Self::TD,
        }
    }
}

pub(crate) struct Inner {
    /// The transport layer for the endpoint.
    pub(crate) transport: TransportLayer,
    /// The transaction layer for the endpoint.
    pub(crate) transaction: TransactionLayer,
    /// The name of the endpoint.
    pub(crate) name: String,
    /// The resolver for DNS lookups.
    pub(crate) resolver: Resolver,
    /// The list of services registered.
    pub(crate) services: Box<[Box<dyn SipService>]>,
    /// Timer settings handed to every transaction.
    pub(crate) timers: TimerSettings,
}

#[derive(Clone)]
/// The SIP endpoint.
///
/// An endpoint is a logical entity that can send and receive SIP messages,
/// manage transactions, and interact with various SIP services. The endpoint is
/// responsible for handling incoming requests and responses, as well as sending
/// outgoing messages.
pub struct Endpoint(pub(crate) Arc<Inner>);

impl Endpoint {
    /// Returns a builder to create an `Endpoint`.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Get the endpoint name.
    pub fn get_name(&self) -> &str {
        &self.0.name
    }

    /// The endpoint's transaction timer settings.
    pub fn timers(&self) -> TimerSettings {
        self.0.timers
    }

    /// The transaction registry of this endpoint.
    pub fn transactions(&self) -> &TransactionLayer {
        &self.0.transaction
    }

    /// The transport registry of this endpoint.
    pub fn transports(&self) -> &TransportLayer {
        &self.0.transport
    }

    /// Registers a transport with the endpoint.
    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.0.transport.add(transport);
    }

    /// Removes a transport and terminates every transaction bound to it.
    ///
    /// Each affected transaction reports `503 Service Unavailable` to its
    /// TU from a fresh task, never from this call frame.
    pub fn close_transport(&self, key: &TransportKey) {
        if self.0.transport.remove(key).is_some() {
            log::debug!("Transport closed, failing its transactions");
        }
        self.0.transaction.on_transport_closed(key);
    }

    /// Tears the endpoint down.
    ///
    /// Refuses while transactions are still live so that pending transport
    /// completions never run against a dismantled endpoint.
    pub fn shutdown(&self) -> Result<()> {
        let live = self.0.transaction.count();
        if live > 0 {
            log::warn!("Refusing shutdown with {live} live transactions");
            return Err(Error::Busy);
        }

        self.0.transport.clear();

        Ok(())
    }

    /// Creates a new User Agent Client (UAC) transaction and sends the
    /// request through it.
    pub async fn new_uac_tsx(
        &self,
        request: OutgoingRequest,
        tu: Option<Arc<dyn TransactionUser>>,
    ) -> Result<ClientTransaction> {
        ClientTransaction::send(request, self, tu).await
    }

    /// Creates a new User Agent Client (UAC) INVITE transaction and sends
    /// the INVITE through it.
    pub async fn new_uac_inv_tsx(
        &self,
        request: OutgoingRequest,
        tu: Option<Arc<dyn TransactionUser>>,
    ) -> Result<InvClientTransaction> {
        InvClientTransaction::send(request, self, tu).await
    }

    /// Creates a new User Agent Server (UAS) transaction.
    ///
    /// This method initializes an [`ServerTransaction`] instance, which represents
    /// the server transaction for handling incoming SIP requests that
    /// are not `INVITE` requests.
    pub fn new_uas_tsx(
        &self,
        request: &mut IncomingRequest,
        tu: Option<Arc<dyn TransactionUser>>,
    ) -> Result<ServerTransaction> {
        ServerTransaction::new(self, request, tu)
    }

    /// Creates a new User Agent Server (UAS) Invite transaction.
    ///
    /// This method initializes an [`InvServerTransaction`] instance, which represents
    /// the server transaction for handling an incoming `INVITE` request.
    pub fn new_uas_inv_tsx(
        &self,
        request: &mut IncomingRequest,
        tu: Option<Arc<dyn TransactionUser>>,
    ) -> Result<InvServerTransaction> {
        InvServerTransaction::new(self, request, tu)
    }

    /// Respond statelessly an request.
    ///
    /// This method create an response from the incoming request and
    /// sent statelessly, meaning that no `UAS` transaction must be
    /// created for this request.
    pub async fn respond(&self, request: &IncomingRequest, code: StatusCode) -> Result<()> {
        // No `UAS` transaction must be created for this request.
        if request.tsx_key().is_some() {
            return Err(Error::InvalidOperation);
        }

        let mut msg = self.new_response(request, code);

        self.send_response(&mut msg).await
    }

    /// Creates a new SIP response based on an incoming request.
    ///
    /// This method generates a response message with the default reason
    /// phrase for `code`. It also copies the necessary headers from the
    /// request: `Via`, `Call-ID`, `From`, `To` and `CSeq`.
    pub fn new_response(&self, req: &IncomingRequest, code: StatusCode) -> OutgoingResponse {
        let mut headers = Headers::with_capacity(req.msg.headers.len());
        let msg_headers = &req.msg.headers;

        // `Via` headers, topmost first.
        let topmost_via = req.req_headers.via.clone();
        let via = msg_headers.iter().filter(|h| matches!(h, Header::Via(_))).skip(1);
        headers.push(Header::Via(topmost_via));
        headers.extend(via.cloned());

        // `Call-ID` header.
        headers.push(Header::CallId(req.req_headers.call_id.clone()));

        // `From` header.
        headers.push(Header::From(req.req_headers.from.clone()));

        // `To` header.
        let mut to = req.req_headers.to.clone();
        // 8.2.6.2 Headers and Tags
        // The UAS MUST add a tag to the To header field in
        // the response (with the exception of the 100 (Trying)
        // response, in which a tag MAY be present).
        if to.tag().is_none() && code.as_u16() > 100 {
            match req.req_headers.via.branch() {
                Some(branch) => to.set_tag(branch.clone()),
                // Pre-cookie peers get a random tag.
                None => to.set_tag(format!("{:08x}", rand::random::<u32>())),
            }
        }
        headers.push(Header::To(to));

        // `CSeq` header.
        headers.push(Header::CSeq(req.req_headers.cseq));

        let addr = self.get_outbound_addr(&req.req_headers.via, &req.transport, req.packet.addr);

        // Done.
        OutgoingResponse {
            msg: Response {
                status_line: StatusLine::new(code),
                headers,
                body: None,
            },
            addr,
            buf: None,
        }
    }

    /// Sends a SIP response to the specified address.
    ///
    /// This method encodes the response message and sends it to the
    /// specified address using the appropriate transport layer.
    pub async fn send_response(&self, response: &mut OutgoingResponse) -> Result<()> {
        log::debug!("=> Response {} {}", response.status_code(), response.reason());

        let encoded_buf = match response.buf.take() {
            Some(buf) => buf,
            None => {
                use crate::transport::ToBytes;
                response.to_bytes()?
            }
        };

        let (transport, addr) = self.resolve_outgoing_addr(&response.addr).await?;
        transport.send(&encoded_buf, &addr).await?;

        Ok(())
    }

    /// Resolves an outgoing address to a concrete transport and peer.
    pub(crate) async fn resolve_outgoing_addr(
        &self,
        addr: &OutgoingAddr,
    ) -> Result<(Arc<dyn Transport>, SocketAddr)> {
        match addr {
            OutgoingAddr::Addr { addr, transport } => Ok((transport.clone(), *addr)),
            OutgoingAddr::HostPort { host, protocol } => {
                let ip = match host.ip() {
                    Some(ip) => ip,
                    None => self
                        .0
                        .resolver
                        .resolve(&host.host)
                        .await
                        .map_err(|err| Error::Dns(err.to_string()))?,
                };
                let addr = SocketAddr::new(ip, host.port_or_default());

                // Find the transport for the given address and protocol.
                let transport = self.0.transport.find(addr, *protocol).ok_or_else(|| {
                    Error::TransportNotFound(format!("{} {}", addr, protocol))
                })?;

                Ok((transport, addr))
            }
        }
    }

    // https://datatracker.ietf.org/doc/html/rfc3261#section-18.2.2
    // https://datatracker.ietf.org/doc/html/rfc3581
    fn get_outbound_addr(
        &self,
        via: &Via,
        transport: &Arc<dyn Transport>,
        source: SocketAddr,
    ) -> OutgoingAddr {
        if transport.reliable() {
            // Tcp, TLS, etc.: the response rides the same connection back.
            return OutgoingAddr::Addr {
                addr: source,
                transport: transport.clone(),
            };
        }

        if let Some(maddr) = &via.maddr {
            let port = via.sent_by().port_or_default();

            OutgoingAddr::HostPort {
                host: HostPort::new(maddr.clone(), Some(port)),
                protocol: via.protocol,
            }
        } else if let (Some(received), Some(rport)) = (via.received, via.rport) {
            OutgoingAddr::Addr {
                addr: SocketAddr::new(received, rport),
                transport: transport.clone(),
            }
        } else if let Some(received) = via.received {
            OutgoingAddr::Addr {
                addr: SocketAddr::new(received, via.sent_by().port_or_default()),
                transport: transport.clone(),
            }
        } else if let Some(ip) = via.sent_by().ip() {
            OutgoingAddr::Addr {
                addr: SocketAddr::new(ip, via.sent_by().port_or_default()),
                transport: transport.clone(),
            }
        } else {
            // A domain in sent-by needs resolution before the response can
            // leave.
            OutgoingAddr::HostPort {
                host: via.sent_by().clone(),
                protocol: via.protocol,
            }
        }
    }

    /// Feeds a parsed inbound response into the endpoint.
    ///
    /// The transaction layer gets the first chance; services see whatever
    /// no transaction claimed.
    pub async fn process_response(&self, msg: &mut Option<IncomingResponse>) -> Result<()> {
        {
            let Some(msg) = msg.as_ref() else { return Ok(()) };
            log::debug!("<= Response ({} {})", msg.code(), msg.msg.reason());
        }

        let handled_by_transaction_layer = {
            let response = msg.as_ref().expect("checked above");
            self.0.transaction.handle_response(response).await?
        };

        if handled_by_transaction_layer {
            msg.take();
            return Ok(());
        }

        for service in self.0.services.iter() {
            service.on_incoming_response(self, msg).await?;

            if msg.is_none() {
                break;
            }
        }

        if let Some(msg) = msg {
            log::debug!(
                "Response ({} {}) from /{} was unhandled by any sevice",
                msg.code(),
                msg.msg.reason(),
                msg.packet.addr
            );
        }

        Ok(())
    }

    /// Feeds a parsed inbound request into the endpoint.
    pub async fn process_request(&self, msg: &mut Option<IncomingRequest>) -> Result<()> {
        {
            let Some(msg) = msg.as_ref() else { return Ok(()) };
            log::debug!("<= Request {} from /{}", msg.method(), msg.addr());
        }

        let handled_by_transaction_layer = {
            let request = msg.as_ref().expect("checked above");
            self.0.transaction.handle_request(request).await?
        };

        if handled_by_transaction_layer {
            msg.take();
            return Ok(());
        }

        // If the request was not handled by the transaction layer, we
        // pass it to the services.
        for service in self.0.services.iter() {
            service.on_incoming_request(self, msg).await?;
            if msg.is_none() {
                break;
            }
        }

        if let Some(msg) = msg {
            log::debug!(
                "Request ({}) from /{} was unhandled by any sevice",
                msg.method(),
                msg.addr()
            );
        }

        Ok(())
    }
}

/// Where responses for this request should go before any send resolved a
/// better destination: `received`/`rport` when present, the packet source
/// otherwise.
pub(crate) fn response_addr_hint(via: &Via, source: SocketAddr) -> SocketAddr {
    match (via.received, via.rport) {
        (Some(ip), Some(port)) => SocketAddr::new(ip, port),
        (Some(ip), None) => SocketAddr::new(ip, via.sent_by().port_or_default()),
        _ => source,
    }
}
