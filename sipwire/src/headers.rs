#![deny(missing_docs)]
//! The SIP headers the transaction layer works with.
//!
//! Only the headers that matter for transaction matching and response
//! construction are modeled as types; anything else travels as
//! [`Header::Other`].

use std::fmt;
use std::net::IpAddr;

use util::ArcStr;

use crate::message::{SipMethod, TransportType, Uri};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// A host with an optional port, as found in a `Via` sent-by.
pub struct HostPort {
    /// Host name or address.
    pub host: ArcStr,
    /// Port, when explicit.
    pub port: Option<u16>,
}

impl HostPort {
    /// Creates a new `HostPort`.
    pub fn new(host: impl Into<ArcStr>, port: Option<u16>) -> Self {
        HostPort {
            host: host.into(),
            port,
        }
    }

    /// Returns the port, falling back to the default SIP port.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(5060)
    }

    /// Returns the host parsed as an IP address, when it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

#[derive(Debug, Clone)]
/// The `Via` header.
pub struct Via {
    /// Transport protocol of this hop.
    pub protocol: TransportType,
    /// Where the sender will listen for responses.
    pub sent_by: HostPort,
    /// The branch parameter identifying the transaction.
    pub branch: Option<ArcStr>,
    /// Source address the receiver observed (RFC 3261 §18.2.1).
    pub received: Option<IpAddr>,
    /// Source port the receiver observed (RFC 3581).
    pub rport: Option<u16>,
    /// Multicast address parameter.
    pub maddr: Option<ArcStr>,
}

impl Via {
    /// Creates a `Via` for the given hop without parameters.
    pub fn new(protocol: TransportType, sent_by: HostPort) -> Self {
        Via {
            protocol,
            sent_by,
            branch: None,
            received: None,
            rport: None,
            maddr: None,
        }
    }

    /// Sets the branch parameter.
    pub fn with_branch(mut self, branch: impl Into<ArcStr>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Returns the branch parameter.
    pub fn branch(&self) -> Option<&ArcStr> {
        self.branch.as_ref()
    }

    /// Returns the sent-by host and port.
    pub fn sent_by(&self) -> &HostPort {
        &self.sent_by
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.protocol, self.sent_by)?;
        if let Some(rport) = self.rport {
            write!(f, ";rport={}", rport)?;
        }
        if let Some(received) = self.received {
            write!(f, ";received={}", received)?;
        }
        if let Some(maddr) = &self.maddr {
            write!(f, ";maddr={}", maddr)?;
        }
        if let Some(branch) = &self.branch {
            write!(f, ";branch={}", branch)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// The `From` header.
pub struct From {
    /// The originator URI.
    pub uri: Uri,
    /// The tag parameter.
    pub tag: Option<ArcStr>,
}

impl From {
    /// Creates a `From` header.
    pub fn new(uri: impl Into<Uri>) -> Self {
        From {
            uri: uri.into(),
            tag: None,
        }
    }

    /// Sets the tag parameter.
    pub fn with_tag(mut self, tag: impl Into<ArcStr>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Returns the tag parameter.
    pub fn tag(&self) -> Option<&ArcStr> {
        self.tag.as_ref()
    }
}

impl fmt::Display for From {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.uri)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={}", tag)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// The `To` header.
pub struct To {
    /// The recipient URI.
    pub uri: Uri,
    /// The tag parameter.
    pub tag: Option<ArcStr>,
}

impl To {
    /// Creates a `To` header.
    pub fn new(uri: impl Into<Uri>) -> Self {
        To {
            uri: uri.into(),
            tag: None,
        }
    }

    /// Returns the tag parameter.
    pub fn tag(&self) -> Option<&ArcStr> {
        self.tag.as_ref()
    }

    /// Sets the tag parameter.
    pub fn set_tag(&mut self, tag: impl Into<ArcStr>) {
        self.tag = Some(tag.into());
    }
}

impl fmt::Display for To {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.uri)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={}", tag)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// The `Call-ID` header.
pub struct CallId(ArcStr);

impl CallId {
    /// Creates a new `Call-ID`.
    pub fn new(id: impl Into<ArcStr>) -> Self {
        CallId(id.into())
    }

    /// Returns the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The `CSeq` header.
pub struct CSeq {
    /// Sequence number.
    pub cseq: u32,
    /// Method the sequence number refers to.
    pub method: SipMethod,
}

impl CSeq {
    /// Creates a new `CSeq`.
    pub fn new(cseq: u32, method: SipMethod) -> Self {
        CSeq { cseq, method }
    }

    /// Returns the method.
    pub fn method(&self) -> &SipMethod {
        &self.method
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.cseq, self.method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The `Max-Forwards` header.
pub struct MaxForwards(u8);

impl MaxForwards {
    /// Creates a `Max-Forwards` header.
    pub fn new(hops: u8) -> Self {
        MaxForwards(hops)
    }
}

impl fmt::Display for MaxForwards {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
/// A single SIP header.
pub enum Header {
    /// `Via` header.
    Via(Via),
    /// `From` header.
    From(From),
    /// `To` header.
    To(To),
    /// `Call-ID` header.
    CallId(CallId),
    /// `CSeq` header.
    CSeq(CSeq),
    /// `Max-Forwards` header.
    MaxForwards(MaxForwards),
    /// Any header the stack has no type for.
    Other {
        /// Header name.
        name: ArcStr,
        /// Raw header value.
        value: ArcStr,
    },
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Header::Via(via) => write!(f, "Via: {}", via),
            Header::From(from) => write!(f, "From: {}", from),
            Header::To(to) => write!(f, "To: {}", to),
            Header::CallId(call_id) => write!(f, "Call-ID: {}", call_id),
            Header::CSeq(cseq) => write!(f, "CSeq: {}", cseq),
            Header::MaxForwards(mf) => write!(f, "Max-Forwards: {}", mf),
            Header::Other { name, value } => write!(f, "{}: {}", name, value),
        }
    }
}

#[derive(Debug, Clone, Default)]
/// An ordered list of SIP headers.
pub struct Headers(Vec<Header>);

impl Headers {
    /// Creates an empty header list.
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    /// Creates an empty header list with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Headers(Vec::with_capacity(capacity))
    }

    /// Appends a header.
    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    /// Moves every header of `other` to the end of this list.
    pub fn append(&mut self, other: &mut Headers) {
        self.0.append(&mut other.0);
    }

    /// Iterates over the headers in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    /// Returns the number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when the list holds no header.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the topmost `Via` header.
    pub fn via(&self) -> Option<&Via> {
        self.0.iter().find_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }

    /// Returns the `CSeq` header.
    pub fn cseq(&self) -> Option<&CSeq> {
        self.0.iter().find_map(|h| match h {
            Header::CSeq(cseq) => Some(cseq),
            _ => None,
        })
    }

    /// Returns the `From` header.
    pub fn from(&self) -> Option<&From> {
        self.0.iter().find_map(|h| match h {
            Header::From(from) => Some(from),
            _ => None,
        })
    }

    /// Returns the `To` header.
    pub fn to(&self) -> Option<&To> {
        self.0.iter().find_map(|h| match h {
            Header::To(to) => Some(to),
            _ => None,
        })
    }

    /// Returns the `Call-ID` header.
    pub fn call_id(&self) -> Option<&CallId> {
        self.0.iter().find_map(|h| match h {
            Header::CallId(call_id) => Some(call_id),
            _ => None,
        })
    }

    /// Returns the topmost `Via` header mutably.
    pub fn via_mut(&mut self) -> Option<&mut Via> {
        self.0.iter_mut().find_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }
}

impl Extend<Header> for Headers {
    fn extend<T: IntoIterator<Item = Header>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
