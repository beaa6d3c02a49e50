//! Recording transports for transaction tests.

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::Bytes;

use super::Transport;
use crate::error::Result;
use crate::message::TransportType;

/// A transport that records every send instead of touching the network.
pub struct MockTransport {
    protocol: TransportType,
    /// Sends fail once this many buffers went through.
    fail_after: Option<usize>,
    sent: Mutex<Vec<(Bytes, SocketAddr)>>,
}

impl MockTransport {
    pub fn udp() -> Self {
        Self::new(TransportType::Udp, None)
    }

    pub fn tcp() -> Self {
        Self::new(TransportType::Tcp, None)
    }

    /// A transport whose sends always fail with an I/O error.
    pub fn failing() -> Self {
        Self::new(TransportType::Udp, Some(0))
    }

    /// A transport that accepts `n` sends and fails afterwards.
    pub fn failing_after(n: usize) -> Self {
        Self::new(TransportType::Udp, Some(n))
    }

    fn new(protocol: TransportType, fail_after: Option<usize>) -> Self {
        MockTransport {
            protocol,
            fail_after,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Number of buffers handed to this transport so far.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("Lock failed").len()
    }

    /// The most recently sent buffer.
    pub fn last_sent(&self) -> Option<Bytes> {
        self.sent.lock().expect("Lock failed").last().map(|(buf, _)| buf.clone())
    }

    /// The destination of the most recent send.
    pub fn last_addr(&self) -> Option<SocketAddr> {
        self.sent.lock().expect("Lock failed").last().map(|(_, addr)| *addr)
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize> {
        let mut sent = self.sent.lock().expect("Lock failed");

        if self.fail_after.is_some_and(|n| sent.len() >= n) {
            return Err(io::Error::from(io::ErrorKind::ConnectionReset).into());
        }

        sent.push((Bytes::copy_from_slice(buf), *addr));

        Ok(buf.len())
    }

    fn protocol(&self) -> TransportType {
        self.protocol
    }

    fn addr(&self) -> SocketAddr {
        "127.0.0.1:5060".parse().unwrap()
    }

    fn local_name(&self) -> Cow<'_, str> {
        Cow::Borrowed("127.0.0.1:5060")
    }
}
