//! The STUN client transaction (RFC 5389 §7.2.1).
//!
//! One request, one terminal outcome. The single timer slot first drives
//! retransmissions with a geometric-then-capped schedule, then is
//! repurposed as the final wait before giving up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::pin;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};

use crate::message::{Message, TransactionId};
use crate::Result;

/// The retransmission knobs of a client transaction.
///
/// Defaults follow RFC 5389 §7.2.1 with the interval cap and final wait
/// both at 1.6 s.
#[derive(Debug, Clone, Copy)]
pub struct RetransmitConfig {
    /// Initial retransmission timeout (RTO).
    pub rto: Duration,
    /// Total number of transmissions before the final wait.
    pub max_retransmits: u32,
    /// Upper bound on the interval between transmissions.
    pub max_interval: Duration,
    /// How long to keep listening after the last transmission.
    pub final_wait: Duration,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        RetransmitConfig {
            rto: Duration::from_millis(500),
            max_retransmits: 7,
            max_interval: Duration::from_millis(1600),
            final_wait: Duration::from_millis(1600),
        }
    }
}

/// The single terminal outcome of a client transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// A response with a matching transaction ID arrived.
    Success(Message),
    /// Every transmission went unanswered.
    Timeout,
    /// The transaction was destroyed before completing.
    Cancelled,
}

/// The callbacks a client transaction drives.
#[async_trait::async_trait]
pub trait TransactionHandler: Sync + Send + 'static {
    /// Pushes an encoded request towards the peer.
    async fn on_send_msg(&self, raw: &[u8], dst: SocketAddr) -> Result<()>;

    /// Delivers the transaction's terminal outcome. Called exactly once.
    async fn on_complete(&self, tsx_id: TransactionId, outcome: TransactionOutcome);
}

struct Inner {
    /// The 96-bit ID from bytes 8..20 of the request header.
    tsx_id: TransactionId,
    /// The encoded request, reused verbatim for every retransmission.
    raw: Bytes,
    /// Peer address for datagram sends.
    dst: SocketAddr,
    retransmit_count: AtomicU32,
    /// Latched once a terminal outcome was delivered.
    complete: AtomicBool,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
    handler: Arc<dyn TransactionHandler>,
    config: RetransmitConfig,
}

/// A single STUN request/response exchange.
#[derive(Clone)]
pub struct ClientTransaction(Arc<Inner>);

impl ClientTransaction {
    /// Sends the encoded request and starts the retransmission schedule.
    pub async fn send(
        raw: Bytes,
        dst: SocketAddr,
        handler: Arc<dyn TransactionHandler>,
        config: RetransmitConfig,
    ) -> Result<Self> {
        let tsx_id = TransactionId::from_packet(&raw)?;
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let tsx = ClientTransaction(Arc::new(Inner {
            tsx_id,
            raw,
            dst,
            retransmit_count: AtomicU32::new(0),
            complete: AtomicBool::new(false),
            cancel_tx: Mutex::new(Some(cancel_tx)),
            handler,
            config,
        }));

        log::trace!("STUN transaction {} created", tsx_id);

        tsx.0.handler.on_send_msg(&tsx.0.raw, tsx.0.dst).await?;

        tokio::spawn(tsx.clone().retransmit_task(cancel_rx));

        Ok(tsx)
    }

    /// The transaction ID of the pending request.
    pub fn tsx_id(&self) -> TransactionId {
        self.0.tsx_id
    }

    /// The number of retransmissions performed so far.
    pub fn retransmit_count(&self) -> u32 {
        self.0.retransmit_count.load(Ordering::SeqCst)
    }

    /// Whether a terminal outcome has been delivered.
    pub fn is_complete(&self) -> bool {
        self.0.complete.load(Ordering::SeqCst)
    }

    async fn retransmit_task(self, mut cancelled: oneshot::Receiver<()>) {
        let config = self.0.config;
        let mut in_final_wait = false;

        pin! {
            let timer = time::sleep(config.rto);
        }

        loop {
            tokio::select! {
                _ = &mut timer => {
                    if in_final_wait {
                        self.complete(TransactionOutcome::Timeout).await;
                        return;
                    }

                    let n = self.0.retransmit_count.fetch_add(1, Ordering::SeqCst) + 1;

                    if n < config.max_retransmits {
                        // A failed send counts like a lost datagram; the
                        // schedule keeps running until the final wait.
                        if let Err(err) = self.0.handler.on_send_msg(&self.0.raw, self.0.dst).await {
                            log::debug!("Retransmission of {} failed: {}", self.0.tsx_id, err);
                        }

                        let interval = config.rto * (1u32 << n.min(12));
                        let interval = interval.min(config.max_interval);
                        timer.as_mut().reset(Instant::now() + interval);
                    } else {
                        in_final_wait = true;
                        timer.as_mut().reset(Instant::now() + config.final_wait);
                    }
                }
                _ = &mut cancelled => return,
            }
        }
    }

    /// Offers a decoded response to the transaction.
    ///
    /// Responses whose transaction ID does not match, or that arrive after
    /// completion, are ignored.
    pub async fn ingest(&self, response: Message) {
        if response.tsx_id != self.0.tsx_id {
            log::trace!(
                "Response {} does not match transaction {}",
                response.tsx_id,
                self.0.tsx_id
            );
            return;
        }

        self.complete(TransactionOutcome::Success(response)).await;
    }

    /// Cancels the transaction.
    ///
    /// Delivers `Cancelled` unless a terminal outcome already went out.
    pub async fn destroy(&self) {
        self.complete(TransactionOutcome::Cancelled).await;
    }

    async fn complete(&self, outcome: TransactionOutcome) {
        if self.0.complete.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancel = self.0.cancel_tx.lock().expect("Lock failed").take();
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }

        self.0.handler.on_complete(self.0.tsx_id, outcome).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageClass;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        sent_at: Mutex<Vec<Duration>>,
        outcomes: Mutex<Vec<TransactionOutcome>>,
        started: Mutex<Option<Instant>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn sends(&self) -> usize {
            self.sent_at.lock().unwrap().len()
        }

        fn outcomes(&self) -> Vec<TransactionOutcome> {
            self.outcomes.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl TransactionHandler for RecordingHandler {
        async fn on_send_msg(&self, _raw: &[u8], _dst: SocketAddr) -> Result<()> {
            let mut started = self.started.lock().unwrap();
            let base = *started.get_or_insert_with(Instant::now);

            self.sent_at.lock().unwrap().push(base.elapsed());
            Ok(())
        }

        async fn on_complete(&self, _tsx_id: TransactionId, outcome: TransactionOutcome) {
            self.outcomes.lock().unwrap().push(outcome);
        }
    }

    fn request() -> (Bytes, Message) {
        let msg = Message::binding_request();
        (Bytes::from(msg.encode()), msg)
    }

    fn dst() -> SocketAddr {
        "198.51.100.7:3478".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_schedule_and_timeout() {
        let handler = RecordingHandler::new();
        let (raw, _) = request();

        let tsx = ClientTransaction::send(raw, dst(), handler.clone(), RetransmitConfig::default())
            .await
            .unwrap();

        assert_eq!(handler.sends(), 1);

        // With rto=500ms and the 1.6s cap the transmissions land at
        // 0, 500, 1500, 3100, 4700, 6300 and 7900 ms.
        let expected = [0u64, 500, 1500, 3100, 4700, 6300, 7900];

        time::sleep(Duration::from_millis(7901)).await;
        assert_eq!(handler.sends(), expected.len());

        let sent_at = handler.sent_at.lock().unwrap().clone();
        for (at, expected_ms) in sent_at.iter().zip(expected) {
            let diff = at.as_millis().abs_diff(expected_ms as u128);
            assert!(diff <= 5, "offset {at:?}, expected ~{expected_ms} ms");
        }

        // One more fire arms the final wait, the one after that gives up.
        time::sleep(Duration::from_millis(1600 + 1600 + 10)).await;

        assert!(tsx.is_complete());
        assert_eq!(handler.outcomes(), vec![TransactionOutcome::Timeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matched_response_completes_once() {
        let handler = RecordingHandler::new();
        let (raw, msg) = request();

        let tsx = ClientTransaction::send(raw, dst(), handler.clone(), RetransmitConfig::default())
            .await
            .unwrap();

        time::sleep(Duration::from_millis(120)).await;

        let response = msg.response(MessageClass::SuccessResponse);
        tsx.ingest(response.clone()).await;
        tsx.ingest(response.clone()).await;

        assert!(tsx.is_complete());
        assert_eq!(handler.outcomes(), vec![TransactionOutcome::Success(response)]);

        // Retransmissions stopped with the completion.
        let sends = handler.sends();
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handler.sends(), sends);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_response_is_ignored() {
        let handler = RecordingHandler::new();
        let (raw, _) = request();

        let tsx = ClientTransaction::send(raw, dst(), handler.clone(), RetransmitConfig::default())
            .await
            .unwrap();

        let stranger = Message::binding_request().response(MessageClass::SuccessResponse);
        tsx.ingest(stranger).await;

        assert!(!tsx.is_complete());
        assert!(handler.outcomes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_delivers_cancelled_once() {
        let handler = RecordingHandler::new();
        let (raw, _) = request();

        let tsx = ClientTransaction::send(raw, dst(), handler.clone(), RetransmitConfig::default())
            .await
            .unwrap();

        tsx.destroy().await;
        tsx.destroy().await;

        assert_eq!(handler.outcomes(), vec![TransactionOutcome::Cancelled]);

        // Cancellation disarmed the timer.
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(handler.sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_after_success_is_silent() {
        let handler = RecordingHandler::new();
        let (raw, msg) = request();

        let tsx = ClientTransaction::send(raw, dst(), handler.clone(), RetransmitConfig::default())
            .await
            .unwrap();

        tsx.ingest(msg.response(MessageClass::SuccessResponse)).await;
        tsx.destroy().await;

        let outcomes = handler.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_matches!(outcomes[0], TransactionOutcome::Success(_));
    }
}
