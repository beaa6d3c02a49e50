//! The STUN session: credentials plus the set of pending client
//! transactions, keyed by transaction ID.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use crate::message::{self, Attribute, Message, MessageClass, Method, TransactionId};
use crate::transaction::{ClientTransaction, RetransmitConfig, TransactionHandler, TransactionOutcome};
use crate::{Error, Result};

/// The credential mode of a session.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// No authentication attributes.
    None,
    /// Short-term credentials: the key is the password itself.
    ShortTerm {
        username: String,
        password: String,
    },
    /// Long-term credentials: the key is MD5 of `username:realm:password`.
    LongTerm {
        realm: String,
        username: String,
        password: String,
    },
}

impl Credentials {
    fn key(&self) -> Option<Vec<u8>> {
        match self {
            Credentials::None => None,
            Credentials::ShortTerm { password, .. } => Some(password.as_bytes().to_vec()),
            Credentials::LongTerm {
                realm,
                username,
                password,
            } => Some(message::long_term_key(username, realm, password)),
        }
    }

    fn apply(&self, msg: &mut Message) {
        match self {
            Credentials::None => {}
            Credentials::ShortTerm { username, .. } => {
                msg.attributes.push(Attribute::Username(username.clone()));
            }
            Credentials::LongTerm {
                realm, username, ..
            } => {
                msg.attributes.push(Attribute::Username(username.clone()));
                msg.attributes.push(Attribute::Realm(realm.clone()));
            }
        }
    }
}

/// Session-wide settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Credentials applied to every outgoing request.
    pub credentials: Credentials,
    /// Whether outgoing requests carry a FINGERPRINT attribute.
    pub use_fingerprint: bool,
    /// Value of the SOFTWARE attribute, when any.
    pub software: Option<String>,
    /// Retransmission schedule for client transactions.
    pub retransmit: RetransmitConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            credentials: Credentials::None,
            use_fingerprint: false,
            software: None,
            retransmit: RetransmitConfig::default(),
        }
    }
}

/// The callbacks a session drives.
#[async_trait::async_trait]
#[allow(unused_variables)]
pub trait SessionHandler: Sync + Send + 'static {
    /// Pushes an encoded message towards the peer.
    async fn on_send_msg(&self, raw: &[u8], dst: SocketAddr) -> Result<()>;

    /// Delivers the terminal outcome of a request sent through
    /// [`Session::send_request`].
    async fn on_request_complete(&self, tsx_id: TransactionId, outcome: TransactionOutcome);

    /// Called for an incoming request.
    async fn on_rx_request(&self, msg: Message, src: SocketAddr) {}

    /// Called for an incoming indication.
    async fn on_rx_indication(&self, msg: Message, src: SocketAddr) {}
}

struct SessionInner {
    config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
    pending: Mutex<HashMap<TransactionId, ClientTransaction>>,
}

/// A STUN session.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

// Bridges a client transaction back to its session: sends go to the
// session handler, completions drop the pending entry first.
struct TsxBridge {
    session: Weak<SessionInner>,
}

#[async_trait::async_trait]
impl TransactionHandler for TsxBridge {
    async fn on_send_msg(&self, raw: &[u8], dst: SocketAddr) -> Result<()> {
        let Some(session) = self.session.upgrade() else {
            return Err(Error::SessionClosed);
        };

        session.handler.on_send_msg(raw, dst).await
    }

    async fn on_complete(&self, tsx_id: TransactionId, outcome: TransactionOutcome) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        session.pending.lock().expect("Lock failed").remove(&tsx_id);
        session.handler.on_request_complete(tsx_id, outcome).await;
    }
}

impl Session {
    /// Creates a session.
    pub fn new(config: SessionConfig, handler: Arc<dyn SessionHandler>) -> Self {
        Session(Arc::new(SessionInner {
            config,
            handler,
            pending: Mutex::new(HashMap::new()),
        }))
    }

    /// Number of requests still waiting for an outcome.
    pub fn pending_count(&self) -> usize {
        self.0.pending.lock().expect("Lock failed").len()
    }

    /// Builds, signs and sends a request, and tracks its transaction until
    /// completion.
    ///
    /// Returns the transaction ID the outcome will be reported under.
    pub async fn send_request(&self, method: Method, dst: SocketAddr) -> Result<TransactionId> {
        let mut msg = Message::new(MessageClass::Request, method);

        if let Some(software) = &self.0.config.software {
            msg.attributes.push(Attribute::Software(software.clone()));
        }

        self.0.config.credentials.apply(&mut msg);

        let key = self.0.config.credentials.key();
        let raw = msg.encode_with(key.as_deref(), self.0.config.use_fingerprint);

        let bridge = Arc::new(TsxBridge {
            session: Arc::downgrade(&self.0),
        });

        let tsx =
            ClientTransaction::send(Bytes::from(raw), dst, bridge, self.0.config.retransmit).await?;

        self.0
            .pending
            .lock()
            .expect("Lock failed")
            .insert(tsx.tsx_id(), tsx.clone());

        Ok(tsx.tsx_id())
    }

    /// Ingests a packet received on whatever socket the session rides.
    ///
    /// Responses are dispatched to the pending transaction they belong to;
    /// requests and indications go to the session handler.
    pub async fn on_rx_packet(&self, pkt: &[u8], src: SocketAddr) -> Result<()> {
        if self.0.config.use_fingerprint && !message::has_valid_fingerprint(pkt) {
            return Err(Error::Malformed("FINGERPRINT"));
        }

        let msg = Message::decode(pkt)?;

        match msg.class {
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {
                let tsx = self.0.pending.lock().expect("Lock failed").get(&msg.tsx_id).cloned();

                match tsx {
                    Some(tsx) => tsx.ingest(msg).await,
                    None => {
                        // Either a very late retransmission or someone
                        // else's transaction.
                        log::trace!("No pending transaction for response {}", msg.tsx_id);
                    }
                }
            }
            MessageClass::Request => self.0.handler.on_rx_request(msg, src).await,
            MessageClass::Indication => self.0.handler.on_rx_indication(msg, src).await,
        }

        Ok(())
    }

    /// Cancels every pending transaction.
    ///
    /// Each one reports `Cancelled` unless it already completed.
    pub async fn close(&self) {
        let pending: Vec<ClientTransaction> = {
            let mut map = self.0.pending.lock().expect("Lock failed");
            map.drain().map(|(_, tsx)| tsx).collect()
        };

        for tsx in pending {
            tsx.destroy().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time;

    #[derive(Default)]
    struct RecordingHandler {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
        outcomes: Mutex<Vec<(TransactionId, TransactionOutcome)>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn first_sent(&self) -> Vec<u8> {
            self.sent.lock().unwrap().first().unwrap().0.clone()
        }

        fn outcomes(&self) -> Vec<(TransactionId, TransactionOutcome)> {
            self.outcomes.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl SessionHandler for RecordingHandler {
        async fn on_send_msg(&self, raw: &[u8], dst: SocketAddr) -> Result<()> {
            self.sent.lock().unwrap().push((raw.to_vec(), dst));
            Ok(())
        }

        async fn on_request_complete(&self, tsx_id: TransactionId, outcome: TransactionOutcome) {
            self.outcomes.lock().unwrap().push((tsx_id, outcome));
        }
    }

    fn dst() -> SocketAddr {
        "198.51.100.7:3478".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_request_applies_credentials() {
        let handler = RecordingHandler::new();
        let config = SessionConfig {
            credentials: Credentials::LongTerm {
                realm: "realm.example".into(),
                username: "alice".into(),
                password: "secret".into(),
            },
            use_fingerprint: true,
            software: Some("sipwire-stun".into()),
            ..Default::default()
        };

        let session = Session::new(config, handler.clone());
        let tsx_id = session.send_request(Method::Binding, dst()).await.unwrap();

        assert_eq!(session.pending_count(), 1);

        let raw = handler.first_sent();
        assert!(message::has_valid_fingerprint(&raw));

        let decoded = Message::decode(&raw).unwrap();
        assert_eq!(decoded.tsx_id, tsx_id);
        assert_eq!(decoded.class, MessageClass::Request);

        let has = |pred: fn(&Attribute) -> bool| decoded.attributes.iter().any(pred);
        assert!(has(|a| matches!(a, Attribute::Username(u) if u == "alice")));
        assert!(has(|a| matches!(a, Attribute::Realm(r) if r == "realm.example")));
        assert!(has(|a| matches!(a, Attribute::Software(_))));
        assert!(has(|a| matches!(a, Attribute::MessageIntegrity(_))));
        assert!(has(|a| matches!(a, Attribute::Fingerprint(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_dispatches_to_pending_transaction() {
        let handler = RecordingHandler::new();
        let session = Session::new(SessionConfig::default(), handler.clone());

        let tsx_id = session.send_request(Method::Binding, dst()).await.unwrap();

        let request = Message::decode(&handler.first_sent()).unwrap();
        let mut response = request.response(MessageClass::SuccessResponse);
        response
            .attributes
            .push(Attribute::XorMappedAddress("203.0.113.9:41000".parse().unwrap()));

        session.on_rx_packet(&response.encode(), dst()).await.unwrap();

        assert_eq!(session.pending_count(), 0);

        let outcomes = handler.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, tsx_id);
        assert_matches!(&outcomes[0].1, TransactionOutcome::Success(msg)
            if msg.xor_mapped_address() == Some("203.0.113.9:41000".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_stray_response_is_dropped() {
        let handler = RecordingHandler::new();
        let session = Session::new(SessionConfig::default(), handler.clone());

        let stray = Message::binding_request().response(MessageClass::SuccessResponse);
        session.on_rx_packet(&stray.encode(), dst()).await.unwrap();

        assert!(handler.outcomes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reported_and_removed() {
        let handler = RecordingHandler::new();
        let session = Session::new(SessionConfig::default(), handler.clone());

        let tsx_id = session.send_request(Method::Binding, dst()).await.unwrap();

        // Past the whole schedule plus the final wait.
        time::sleep(Duration::from_secs(12)).await;

        assert_eq!(session.pending_count(), 0);

        let outcomes = handler.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], (tsx_id, TransactionOutcome::Timeout));
    }

    #[test_log::test(tokio::test)]
    async fn test_close_cancels_pending() {
        let handler = RecordingHandler::new();
        let session = Session::new(SessionConfig::default(), handler.clone());

        session.send_request(Method::Binding, dst()).await.unwrap();
        session.send_request(Method::Binding, dst()).await.unwrap();
        assert_eq!(session.pending_count(), 2);

        session.close().await;

        assert_eq!(session.pending_count(), 0);
        let outcomes = handler.outcomes();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, outcome)| *outcome == TransactionOutcome::Cancelled));
    }
}
