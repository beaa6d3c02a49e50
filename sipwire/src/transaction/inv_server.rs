use std::{
    cmp,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::future::{self, Either};
use tokio::{
    pin,
    sync::oneshot,
    time::{self},
};

use crate::{
    endpoint::Endpoint,
    error::Error,
    message::{SipMethod, StatusCode},
    transaction::{ServerTsx, State, Transaction, TransactionUser, TsxEventKind},
    transport::{IncomingRequest, OutgoingResponse},
    Result,
};

type TxSignal = Arc<Mutex<Option<oneshot::Sender<()>>>>;
type RxSignal = oneshot::Receiver<()>;

/// How often a non-100 provisional response is replayed while the final
/// response is pending.
const PROVISIONAL_RETRANS_INTERVAL: Duration = Duration::from_secs(60);

/// Represents a Server INVITE transaction.
#[derive(Clone)]
pub struct InvServerTransaction {
    transaction: Transaction,
    /// Fired when the ACK arrives; stops the final-response loop.
    tx_confirmed: TxSignal,
    /// Fired on the final response; stops the provisional replays.
    tx_provisional: TxSignal,
    /// When set, 2xx responses run the Completed/Confirmed machinery
    /// instead of terminating at once.
    handle_2xx: Arc<AtomicBool>,
}

impl InvServerTransaction {
    pub(crate) fn new(
        endpoint: &Endpoint,
        request: &mut IncomingRequest,
        tu: Option<Arc<dyn TransactionUser>>,
    ) -> Result<Self> {
        let method = *request.method();

        if !matches!(method, SipMethod::Invite) {
            return Err(Error::InvalidMethod(method));
        }

        let transaction = Transaction::new_uas(request, endpoint, State::Initial, tu)?;

        let uas_inv = InvServerTransaction {
            transaction,
            tx_confirmed: Default::default(),
            tx_provisional: Default::default(),
            handle_2xx: Default::default(),
        };

        endpoint
            .transactions()
            .register_server(ServerTsx::Invite(uas_inv.clone()))?;

        request.set_tsx(ServerTsx::Invite(uas_inv.clone()));

        Ok(uas_inv)
    }

    pub(crate) async fn receive(&self, request: &IncomingRequest) -> Result<()> {
        match self.get_state() {
            State::Completed if request.is_method(&SipMethod::Ack) => {
                self.change_state_to(State::Confirmed, TsxEventKind::RxMsg);

                let tx = self.tx_confirmed.lock().expect("Lock failed").take();
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }

                self.schedule_timer_i();
            }
            State::Proceeding | State::Completed if request.is_method(&SipMethod::Invite) => {
                // INVITE retransmission: replay the latest response without
                // telling the TU (RFC 3261 §17.2.1).
                if let Err(err) = self.retransmit().await {
                    self.on_transport_error(err);
                }
            }
            _ => (),
        }

        Ok(())
    }

    /// Sends a response through this transaction.
    ///
    /// The TU passes any number of provisional responses before the final
    /// one.
    pub async fn respond(&self, response: &mut OutgoingResponse) -> Result<()> {
        if self.get_state() >= State::Terminated {
            return Err(Error::TransactionDestroyed);
        }
        if self.get_state() >= State::Completed {
            return Err(Error::InvalidOperation);
        }

        self.tsx_send_response(response).await?;

        let code = response.status_code();

        match code.as_u16() {
            100..=199 => {
                self.change_state_to(State::Proceeding, TsxEventKind::TxMsg);

                // 100 Trying is hop-local; anything above it is replayed
                // periodically so stateful proxies keep the transaction
                // alive.
                if code.as_u16() > 100 {
                    self.arm_provisional_retransmit();
                }
            }
            200..=299 if !self.handle_2xx.load(Ordering::SeqCst) => {
                // 2xx retransmissions and the matching ACK belong to the
                // TU/dialog layer.
                self.signal(&self.tx_provisional);
                self.on_terminated(TsxEventKind::TxMsg);
            }
            _ => {
                self.signal(&self.tx_provisional);
                self.change_state_to(State::Completed, TsxEventKind::TxMsg);

                let (tx, rx) = oneshot::channel();
                self.tx_confirmed.lock().expect("Lock failed").replace(tx);
                self.initiate_retransmission(rx);
            }
        };

        Ok(())
    }

    /// Makes this transaction run its 2xx through the Completed and
    /// Confirmed states, retransmitting it until the ACK arrives.
    ///
    /// By default the TU/dialog layer owns 2xx retransmissions and the
    /// transaction terminates as soon as one is sent.
    pub fn set_handle_2xx(&self, enabled: bool) {
        self.handle_2xx.store(enabled, Ordering::SeqCst);
    }

    fn signal(&self, slot: &TxSignal) {
        let tx = slot.lock().expect("Lock failed").take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    fn arm_provisional_retransmit(&self) {
        let mut guard = self.tx_provisional.lock().expect("Lock failed");
        if guard.is_some() {
            return;
        }

        let (tx, mut rx) = oneshot::channel::<()>();
        *guard = Some(tx);
        drop(guard);

        let uas = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = time::sleep(PROVISIONAL_RETRANS_INTERVAL) => {
                        if uas.get_state() != State::Proceeding {
                            break;
                        }
                        if let Err(err) = uas.retransmit().await {
                            uas.on_transport_error(err);
                            break;
                        }
                    }
                    _ = &mut rx => break,
                }
            }
        });
    }

    fn initiate_retransmission(&self, mut rx_confirmed: RxSignal) {
        let unreliable = !self.reliable();
        let uas = self.clone();

        tokio::spawn(async move {
            let timers = uas.timers();

            let timer_h = time::sleep(timers.t1 * 64);
            let timer_g = if unreliable {
                Either::Left(time::sleep(timers.t1))
            } else {
                Either::Right(future::pending::<()>())
            };

            pin!(timer_h);
            pin!(timer_g);

            'retrans: loop {
                tokio::select! {
                    _ = &mut timer_g => {
                        match uas.retransmit().await {
                            Ok(retrans) =>  {
                                let backoff = timers.t1 * (1u32 << retrans.min(12));
                                let interval = cmp::min(backoff, timers.t2);
                                timer_g.set(Either::Left(time::sleep(interval)));
                            },
                            Err(err) =>  {
                                uas.on_transport_error(err);
                                break 'retrans;
                            },
                        }
                     },
                    _ = &mut timer_h => {
                        // Timer H Expired: the ACK never arrived. An ACK
                        // racing this fire moved the state past Completed
                        // already.
                        if uas.get_state() == State::Completed {
                            uas.terminate_kind(StatusCode::REQUEST_TIMEOUT, TsxEventKind::Timer);
                        }
                        break 'retrans;
                    }
                    _ = &mut rx_confirmed => {
                        // Got confirmed state!;
                        break 'retrans;
                    }
                }
            }
        });
    }

    fn schedule_timer_i(&self) {
        if self.reliable() {
            self.on_terminated(TsxEventKind::Timer);
        } else {
            // Start timer I
            self.schedule_termination(self.timers().t4, TsxEventKind::Timer);
        }
    }

    pub(crate) fn terminate_kind(&self, code: StatusCode, kind: TsxEventKind) {
        if self.get_state() >= State::Terminated {
            return;
        }

        self.signal(&self.tx_provisional);
        self.signal(&self.tx_confirmed);
        self.terminate_with(code, kind);
    }

    /// Forces the transaction to `Terminated` with the given code.
    pub fn terminate(&self, code: StatusCode) {
        self.terminate_kind(code, TsxEventKind::User);
    }
}

impl Deref for InvServerTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{endpoint::TimerSettings, transaction::mock, transport::mock::MockTransport};
    use tokio::time::Duration;

    async fn tsx_uas_params() -> (Endpoint, IncomingRequest) {
        let endpoint = mock::default_endpoint().await;
        let request = mock::request(SipMethod::Invite);

        (endpoint, request)
    }

    #[tokio::test]
    async fn test_receives_100_trying() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request, None).unwrap();
        let response = &mut mock::response(StatusCode::TRYING);

        tsx.respond(response).await.unwrap();

        assert!(tsx.last_status_code().unwrap().as_u16() == 100);
        assert!(tsx.get_state() == State::Proceeding);
    }

    #[tokio::test]
    async fn test_receives_180_ringing() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request, None).unwrap();
        let response = &mut mock::response(StatusCode::TRYING);

        tsx.respond(response).await.unwrap();

        assert!(tsx.last_status_code().unwrap().as_u16() == 100);

        let response = &mut mock::response(StatusCode::RINGING);
        tsx.respond(response).await.unwrap();

        assert!(tsx.last_status_code().unwrap().as_u16() == 180);
        assert!(tsx.get_state() == State::Proceeding);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisional_periodic_retransmission() {
        let endpoint = mock::default_endpoint().await;
        let transport = Arc::new(MockTransport::udp());
        let mut request = mock::request_on(SipMethod::Invite, transport.clone());
        let tsx = InvServerTransaction::new(&endpoint, &mut request, None).unwrap();

        let response = &mut mock::response_on(StatusCode::RINGING, transport.clone());
        tsx.respond(response).await.unwrap();
        assert_eq!(transport.sent_count(), 1);

        // The 180 goes out again every 60 s while no final response
        // exists.
        time::sleep(PROVISIONAL_RETRANS_INTERVAL + Duration::from_millis(1)).await;
        assert_eq!(transport.sent_count(), 2);

        time::sleep(PROVISIONAL_RETRANS_INTERVAL + Duration::from_millis(1)).await;
        assert_eq!(transport.sent_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invite_timer_g_retransmission() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request, None).unwrap();

        let response = &mut mock::response(StatusCode::BUSY_HERE);
        tsx.respond(response).await.unwrap();

        time::sleep(TimerSettings::T1 + Duration::from_millis(1)).await;
        assert!(tsx.retrans_count() == 1);

        time::sleep(TimerSettings::T1 * 2 + Duration::from_millis(1)).await;
        assert!(tsx.retrans_count() == 2);

        // Backoff caps at T2.
        time::sleep(TimerSettings::T1 * 4 + Duration::from_millis(1)).await;
        assert!(tsx.retrans_count() == 3);

        time::sleep(TimerSettings::T2 + Duration::from_millis(1)).await;
        assert!(tsx.retrans_count() == 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_h_expiration() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request, None).unwrap();

        let response = &mut mock::response(StatusCode::BUSY_HERE);

        tsx.respond(response).await.unwrap();

        time::sleep(TimerSettings::T1 * 64 + Duration::from_millis(1)).await;
        assert!(tsx.get_state() == State::Destroyed);
        assert_eq!(tsx.last_status_code(), Some(StatusCode::REQUEST_TIMEOUT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_confirms_and_timer_i_terminates() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tu = mock::RecordingTu::new();
        let tsx = InvServerTransaction::new(&endpoint, &mut request, Some(tu.clone())).unwrap();
        tsx.set_handle_2xx(true);

        tsx.respond(&mut mock::response(StatusCode::TRYING)).await.unwrap();

        time::sleep(Duration::from_millis(200)).await;
        tsx.respond(&mut mock::response(StatusCode::RINGING)).await.unwrap();

        time::sleep(Duration::from_millis(1800)).await;
        tsx.respond(&mut mock::response(StatusCode::ACCEPTED)).await.unwrap();
        assert_eq!(tsx.get_state(), State::Completed);

        time::sleep(Duration::from_millis(100)).await;
        let ack = mock::request(SipMethod::Ack);
        tsx.receive(&ack).await.unwrap();
        assert_eq!(tsx.get_state(), State::Confirmed);

        // Timer I
        time::sleep(TimerSettings::T4 + Duration::from_millis(1)).await;
        assert_eq!(tsx.get_state(), State::Destroyed);

        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(tu.terminated_count(), 1);
        assert!(tu.states_are_monotonic());
    }

    #[tokio::test(start_paused = true)]
    async fn test_2xx_terminates_immediately() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request, None).unwrap();

        tsx.respond(&mut mock::response(StatusCode::OK)).await.unwrap();

        assert_eq!(tsx.get_state(), State::Destroyed);
        assert!(endpoint.transactions().find_server_tsx(tsx.key()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_replays_response_on_invite_retransmission() {
        let endpoint = mock::default_endpoint().await;
        let transport = Arc::new(MockTransport::udp());
        let mut request = mock::request_on(SipMethod::Invite, transport.clone());
        let tsx = InvServerTransaction::new(&endpoint, &mut request, None).unwrap();

        let response = &mut mock::response_on(StatusCode::BUSY_HERE, transport.clone());
        tsx.respond(response).await.unwrap();
        assert_eq!(transport.sent_count(), 1);

        tsx.receive(&mock::request(SipMethod::Invite)).await.unwrap();
        assert_eq!(transport.sent_count(), 2);
    }
}
