//! SIP UDP Transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::net::ToSocketAddrs;
use tokio::net::UdpSocket;

use super::Packet;
use super::Transport;
use crate::error::Result;
use crate::message::TransportType;

#[derive(Debug)]
struct Inner {
    sock: UdpSocket,
    addr: SocketAddr,
    local_name: String,
}

#[derive(Debug, Clone)]
/// UDP transport implementation.
pub struct UdpTransport(Arc<Inner>);

impl UdpTransport {
    /// Binds a UDP transport to the specified address.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let sock = UdpSocket::bind(addr).await?;

        let addr = sock.local_addr()?;
        let local_name = crate::get_local_name(&addr);

        Ok(Self(Arc::new(Inner {
            sock,
            addr,
            local_name,
        })))
    }

    /// Waits for the next datagram on this transport.
    ///
    /// The caller owns framing and parsing; this only hands the raw packet
    /// over.
    pub async fn recv(&self) -> Result<Packet> {
        let mut buf = vec![0u8; 4000];

        let (len, addr) = self.0.sock.recv_from(&mut buf).await?;
        buf.truncate(len);

        Ok(Packet {
            buf: bytes::Bytes::from(buf),
            addr,
            time: SystemTime::now(),
        })
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize> {
        Ok(self.0.sock.send_to(buf, addr).await?)
    }

    fn protocol(&self) -> TransportType {
        TransportType::Udp
    }

    fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    fn local_name(&self) -> std::borrow::Cow<'_, str> {
        std::borrow::Cow::Borrowed(&self.0.local_name)
    }
}
