//! STUN message codec per RFC 5389 §6 and §15.
//!
//! Messages are 20-byte headers followed by TLV attributes padded to four
//! bytes. Only the attributes the client engine needs are typed; everything
//! else survives a decode as [`Attribute::Other`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::{Error, Result};

/// The fixed STUN magic cookie (RFC 5389 §6).
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// Size of the STUN message header.
pub const HEADER_LEN: usize = 20;

const FINGERPRINT_XOR: u32 = 0x5354554e;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_REALM: u16 = 0x0014;
const ATTR_NONCE: u16 = 0x0015;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_SOFTWARE: u16 = 0x8022;
const ATTR_FINGERPRINT: u16 = 0x8028;

/// The 96-bit transaction ID carried in bytes 8..20 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// A fresh random identifier.
    pub fn random() -> Self {
        TransactionId(rand::random())
    }

    /// Wraps raw identifier bytes.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        TransactionId(bytes)
    }

    /// Reads the identifier out of an encoded request.
    pub fn from_packet(pkt: &[u8]) -> Result<Self> {
        if pkt.len() < HEADER_LEN {
            return Err(Error::NotStun);
        }

        let mut bytes = [0u8; 12];
        bytes.copy_from_slice(&pkt[8..20]);

        Ok(TransactionId(bytes))
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The class bits of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn as_bits(&self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }

    /// Returns `true` for success and error responses.
    pub fn is_response(&self) -> bool {
        matches!(self, MessageClass::SuccessResponse | MessageClass::ErrorResponse)
    }
}

/// The STUN method of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Binding (RFC 5389 §7).
    Binding,
    /// A method this engine has no name for.
    Unknown(u16),
}

impl Method {
    fn as_u16(&self) -> u16 {
        match self {
            Method::Binding => 0x0001,
            Method::Unknown(m) => *m,
        }
    }

    fn from_u16(m: u16) -> Self {
        match m {
            0x0001 => Method::Binding,
            other => Method::Unknown(other),
        }
    }
}

// RFC 5389 §6: the class bits are interleaved into the method at positions
// 4 and 8.
fn message_type(class: MessageClass, method: Method) -> u16 {
    let m = method.as_u16();
    let c = class.as_bits();

    ((m & 0x0f80) << 2) | ((m & 0x0070) << 1) | (m & 0x000f) | ((c & 0x2) << 7) | ((c & 0x1) << 4)
}

fn split_message_type(mtype: u16) -> (MessageClass, Method) {
    let class = MessageClass::from_bits(((mtype >> 7) & 0x2) | ((mtype >> 4) & 0x1));
    let method = Method::from_u16(((mtype & 0x3e00) >> 2) | ((mtype & 0x00e0) >> 1) | (mtype & 0x000f));

    (class, method)
}

/// A single STUN attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Username(String),
    Realm(String),
    Nonce(String),
    Software(String),
    XorMappedAddress(SocketAddr),
    ErrorCode { code: u16, reason: String },
    MessageIntegrity([u8; 20]),
    Fingerprint(u32),
    Other { attr_type: u16, value: Vec<u8> },
}

/// A decoded or under-construction STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub class: MessageClass,
    pub method: Method,
    pub tsx_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl Message {
    /// Creates a message with a fresh random transaction ID.
    pub fn new(class: MessageClass, method: Method) -> Self {
        Message {
            class,
            method,
            tsx_id: TransactionId::random(),
            attributes: Vec::new(),
        }
    }

    /// A Binding request.
    pub fn binding_request() -> Self {
        Self::new(MessageClass::Request, Method::Binding)
    }

    /// A response to this message, keeping its transaction ID.
    pub fn response(&self, class: MessageClass) -> Self {
        Message {
            class,
            method: self.method,
            tsx_id: self.tsx_id,
            attributes: Vec::new(),
        }
    }

    /// The XOR-MAPPED-ADDRESS attribute, when present.
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// The ERROR-CODE attribute, when present.
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    /// Encodes the message without credentials.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with(None, false)
    }

    /// Encodes the message, optionally appending MESSAGE-INTEGRITY (over
    /// the given key) and FINGERPRINT.
    ///
    /// Both attributes cover the message with the header length already
    /// counting themselves, per RFC 5389 §15.4 and §15.5.
    pub fn encode_with(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);

        buf.extend_from_slice(&message_type(self.class, self.method).to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(self.tsx_id.as_bytes());

        for attr in &self.attributes {
            encode_attribute(&mut buf, attr, &self.tsx_id);
        }

        if let Some(key) = integrity_key {
            let new_len = buf.len() - HEADER_LEN + 24;
            set_message_len(&mut buf, new_len);

            let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC takes any key length");
            mac.update(&buf);
            let tag: [u8; 20] = mac.finalize().into_bytes().into();

            encode_attribute(&mut buf, &Attribute::MessageIntegrity(tag), &self.tsx_id);
        }

        if fingerprint {
            let new_len = buf.len() - HEADER_LEN + 8;
            set_message_len(&mut buf, new_len);

            let crc = crc::crc32::checksum_ieee(&buf) ^ FINGERPRINT_XOR;
            encode_attribute(&mut buf, &Attribute::Fingerprint(crc), &self.tsx_id);
        }

        let new_len = buf.len() - HEADER_LEN;
        set_message_len(&mut buf, new_len);

        buf
    }

    /// Decodes a packet.
    ///
    /// Returns [`Error::NotStun`] when the packet cannot be a STUN message
    /// at all, and [`Error::Malformed`] when it claims to be one but lies.
    pub fn decode(pkt: &[u8]) -> Result<Message> {
        if pkt.len() < HEADER_LEN || pkt[0] & 0xc0 != 0 {
            return Err(Error::NotStun);
        }

        let cookie = u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(Error::NotStun);
        }

        let mtype = u16::from_be_bytes([pkt[0], pkt[1]]);
        let length = u16::from_be_bytes([pkt[2], pkt[3]]) as usize;

        if length % 4 != 0 || HEADER_LEN + length > pkt.len() {
            return Err(Error::Malformed("length"));
        }

        let (class, method) = split_message_type(mtype);
        let tsx_id = TransactionId::from_packet(pkt)?;

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        let end = HEADER_LEN + length;

        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([pkt[offset], pkt[offset + 1]]);
            let attr_len = u16::from_be_bytes([pkt[offset + 2], pkt[offset + 3]]) as usize;
            offset += 4;

            if offset + attr_len > end {
                return Err(Error::Malformed("attribute length"));
            }

            let value = &pkt[offset..offset + attr_len];
            attributes.push(decode_attribute(attr_type, value, &tsx_id)?);

            // Values are padded to a four byte boundary.
            offset += (attr_len + 3) & !3;
        }

        Ok(Message {
            class,
            method,
            tsx_id,
            attributes,
        })
    }
}

fn set_message_len(buf: &mut [u8], len: usize) {
    let len = len as u16;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
}

fn push_attribute_header(buf: &mut Vec<u8>, attr_type: u16, len: usize) {
    buf.extend_from_slice(&attr_type.to_be_bytes());
    buf.extend_from_slice(&(len as u16).to_be_bytes());
}

fn push_padded(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(value);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn encode_attribute(buf: &mut Vec<u8>, attr: &Attribute, tsx_id: &TransactionId) {
    match attr {
        Attribute::Username(s) => {
            push_attribute_header(buf, ATTR_USERNAME, s.len());
            push_padded(buf, s.as_bytes());
        }
        Attribute::Realm(s) => {
            push_attribute_header(buf, ATTR_REALM, s.len());
            push_padded(buf, s.as_bytes());
        }
        Attribute::Nonce(s) => {
            push_attribute_header(buf, ATTR_NONCE, s.len());
            push_padded(buf, s.as_bytes());
        }
        Attribute::Software(s) => {
            push_attribute_header(buf, ATTR_SOFTWARE, s.len());
            push_padded(buf, s.as_bytes());
        }
        Attribute::XorMappedAddress(addr) => {
            let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
            match addr.ip() {
                IpAddr::V4(ip) => {
                    push_attribute_header(buf, ATTR_XOR_MAPPED_ADDRESS, 8);
                    buf.push(0);
                    buf.push(0x01);
                    buf.extend_from_slice(&xport.to_be_bytes());
                    let xip = u32::from(ip) ^ MAGIC_COOKIE;
                    buf.extend_from_slice(&xip.to_be_bytes());
                }
                IpAddr::V6(ip) => {
                    push_attribute_header(buf, ATTR_XOR_MAPPED_ADDRESS, 20);
                    buf.push(0);
                    buf.push(0x02);
                    buf.extend_from_slice(&xport.to_be_bytes());
                    buf.extend_from_slice(&xor_v6(ip, tsx_id));
                }
            }
        }
        Attribute::ErrorCode { code, reason } => {
            push_attribute_header(buf, ATTR_ERROR_CODE, 4 + reason.len());
            buf.extend_from_slice(&[0, 0, (code / 100) as u8, (code % 100) as u8]);
            push_padded(buf, reason.as_bytes());
        }
        Attribute::MessageIntegrity(tag) => {
            push_attribute_header(buf, ATTR_MESSAGE_INTEGRITY, 20);
            buf.extend_from_slice(tag);
        }
        Attribute::Fingerprint(crc) => {
            push_attribute_header(buf, ATTR_FINGERPRINT, 4);
            buf.extend_from_slice(&crc.to_be_bytes());
        }
        Attribute::Other { attr_type, value } => {
            push_attribute_header(buf, *attr_type, value.len());
            push_padded(buf, value);
        }
    }
}

fn xor_v6(ip: Ipv6Addr, tsx_id: &TransactionId) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(tsx_id.as_bytes());

    let mut out = ip.octets();
    for (byte, mask) in out.iter_mut().zip(mask) {
        *byte ^= mask;
    }
    out
}

fn decode_utf8(value: &[u8], what: &'static str) -> Result<String> {
    String::from_utf8(value.to_vec()).map_err(|_| Error::Malformed(what))
}

fn decode_attribute(attr_type: u16, value: &[u8], tsx_id: &TransactionId) -> Result<Attribute> {
    let attr = match attr_type {
        ATTR_USERNAME => Attribute::Username(decode_utf8(value, "USERNAME")?),
        ATTR_REALM => Attribute::Realm(decode_utf8(value, "REALM")?),
        ATTR_NONCE => Attribute::Nonce(decode_utf8(value, "NONCE")?),
        ATTR_SOFTWARE => Attribute::Software(decode_utf8(value, "SOFTWARE")?),
        ATTR_ERROR_CODE => {
            if value.len() < 4 {
                return Err(Error::Malformed("ERROR-CODE"));
            }
            let code = (value[2] & 0x07) as u16 * 100 + value[3] as u16;
            Attribute::ErrorCode {
                code,
                reason: decode_utf8(&value[4..], "ERROR-CODE")?,
            }
        }
        ATTR_XOR_MAPPED_ADDRESS => {
            if value.len() < 8 {
                return Err(Error::Malformed("XOR-MAPPED-ADDRESS"));
            }
            let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
            let ip = match value[1] {
                0x01 => {
                    let xip = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
                    IpAddr::V4(Ipv4Addr::from(xip ^ MAGIC_COOKIE))
                }
                0x02 => {
                    if value.len() < 20 {
                        return Err(Error::Malformed("XOR-MAPPED-ADDRESS"));
                    }
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&value[4..20]);
                    let ip = Ipv6Addr::from(octets);
                    IpAddr::V6(Ipv6Addr::from(xor_v6(ip, tsx_id)))
                }
                _ => return Err(Error::Malformed("XOR-MAPPED-ADDRESS family")),
            };
            Attribute::XorMappedAddress(SocketAddr::new(ip, port))
        }
        ATTR_MESSAGE_INTEGRITY => {
            let tag: [u8; 20] = value.try_into().map_err(|_| Error::Malformed("MESSAGE-INTEGRITY"))?;
            Attribute::MessageIntegrity(tag)
        }
        ATTR_FINGERPRINT => {
            let crc: [u8; 4] = value.try_into().map_err(|_| Error::Malformed("FINGERPRINT"))?;
            Attribute::Fingerprint(u32::from_be_bytes(crc))
        }
        _ => Attribute::Other {
            attr_type,
            value: value.to_vec(),
        },
    };

    Ok(attr)
}

/// Checks the trailing FINGERPRINT of an encoded packet, when one exists.
///
/// Returns `true` for packets without a FINGERPRINT attribute.
pub fn has_valid_fingerprint(pkt: &[u8]) -> bool {
    if pkt.len() < HEADER_LEN + 8 {
        return true;
    }

    let fp_offset = pkt.len() - 8;
    let attr_type = u16::from_be_bytes([pkt[fp_offset], pkt[fp_offset + 1]]);
    if attr_type != ATTR_FINGERPRINT {
        return true;
    }

    let stored = u32::from_be_bytes([
        pkt[fp_offset + 4],
        pkt[fp_offset + 5],
        pkt[fp_offset + 6],
        pkt[fp_offset + 7],
    ]);

    crc::crc32::checksum_ieee(&pkt[..fp_offset]) ^ FINGERPRINT_XOR == stored
}

/// Derives the long-term credential key: MD5 of `username:realm:password`
/// (RFC 5389 §15.4).
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    md5::compute(format!("{username}:{realm}:{password}")).0.to_vec()
}
