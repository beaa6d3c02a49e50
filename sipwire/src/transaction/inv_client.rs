use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

use futures_util::future::{self, Either};
use tokio::{
    pin,
    sync::oneshot,
    time::{self, Instant},
};

use crate::{
    error::Error,
    headers::{CSeq, CallId, Header, Headers, To, Via},
    message::{Request, RequestLine, SipMethod, StatusCode, Uri},
    transaction::{key, ClientTsx, State, Transaction, TransactionUser, TsxEventKind},
    transport::{IncomingResponse, OutgoingRequest},
    Endpoint, Result,
};

type TxCompleted = Arc<Mutex<Option<oneshot::Sender<()>>>>;
type RxCompleted = oneshot::Receiver<()>;

// The headers needed later to build the ACK for a non-2xx final response
// (RFC 3261 §17.1.1.3).
struct OriginalRequest {
    uri: Uri,
    via: Via,
    from: crate::headers::From,
    cseq: CSeq,
    call_id: CallId,
}

/// Represents a Client INVITE transaction.
#[derive(Clone)]
pub struct InvClientTransaction {
    transaction: Transaction,
    request: Arc<OriginalRequest>,
    tx_completed: TxCompleted,
}

impl InvClientTransaction {
    /// Creates the transaction, registers it and sends the INVITE.
    pub async fn send(
        mut request: OutgoingRequest,
        endpoint: &Endpoint,
        tu: Option<Arc<dyn TransactionUser>>,
    ) -> Result<InvClientTransaction> {
        let method = *request.method();

        if !matches!(method, SipMethod::Invite) {
            return Err(Error::InvalidMethod(method));
        }

        key::ensure_branch(&mut request)?;

        let transaction = Transaction::new_uac(&request, endpoint, tu)?;

        let via = request.msg.headers.via().cloned();
        let cseq = request.msg.headers.cseq().copied();
        let call_id = request.msg.headers.call_id().cloned();
        let from = request.msg.headers.from().cloned();

        let (via, cseq, call_id, from) = match (via, cseq, call_id, from) {
            (Some(via), Some(cseq), Some(call_id), Some(from)) => (via, cseq, call_id, from),
            _ => return Err(Error::MissingRequiredHeader("Via, CSeq, Call-ID or From")),
        };

        let original = Arc::new(OriginalRequest {
            uri: request.msg.req_line.uri.clone(),
            via,
            cseq,
            call_id,
            from,
        });

        let (tx, rx) = oneshot::channel();
        let uac_inv = InvClientTransaction {
            transaction,
            request: original,
            tx_completed: Arc::new(Mutex::new(Some(tx))),
        };

        endpoint
            .transactions()
            .register_client(ClientTsx::Invite(uac_inv.clone()))?;

        if let Err(err) = uac_inv.tsx_send_request(&mut request).await {
            endpoint.transactions().unregister(uac_inv.key());
            return Err(err);
        }

        uac_inv.change_state_to(State::Calling, TsxEventKind::TxMsg);

        tokio::spawn(uac_inv.clone().tsx_retrans_task(rx));

        Ok(uac_inv)
    }

    async fn tsx_retrans_task(self, mut rx_completed: RxCompleted) {
        let timers = self.timers();
        let started = Instant::now();

        pin! {
            let timer_b = time::sleep(self.timeout_value());
            let timer_a = if !self.reliable() {
                Either::Left(time::sleep(timers.t1))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        'retrans: loop {
            tokio::select! {
                _ = &mut timer_a, if self.is_calling() && !self.retransmit_stopped() => {
                    match self.retransmit().await {
                        Ok(retrans) =>  {
                            // Timer A doubles without the T2 cap
                            // (RFC 3261 §17.1.1.2).
                            let interval = timers.t1 * (1u32 << retrans.min(12));
                            timer_a.set(Either::Left(time::sleep(interval)));
                        },
                        Err(err) =>  {
                            self.on_transport_error(err);
                            break 'retrans;
                        },
                    }
                }
                _ = &mut timer_b => {
                    // Timeout. A transaction that already completed belongs
                    // to timer D now.
                    if self.get_state() < State::Completed {
                        self.terminate_kind(StatusCode::REQUEST_TIMEOUT, TsxEventKind::Timer);
                    }
                    break 'retrans;
                }
                _ = self.timeout_changed() => {
                    timer_b.as_mut().reset(started + self.timeout_value());
                }
                _ = &mut rx_completed => {
                    break 'retrans;
                }
            }
        }
    }

    pub(crate) async fn receive(&self, response: &IncomingResponse) -> Result<()> {
        let code = response.code();

        match self.get_state() {
            State::Calling | State::Proceeding if code.is_provisional() => {
                self.set_last_status_code(code);
                self.notify_rx_response(&response.msg).await;
                self.change_state_to(State::Proceeding, TsxEventKind::RxMsg);
            }
            State::Calling | State::Proceeding if code.is_successful() => {
                // The dialog layer owns the ACK for a 2xx; this transaction
                // is done.
                self.set_last_status_code(code);
                self.notify_rx_response(&response.msg).await;
                self.complete();
                self.on_terminated(TsxEventKind::RxMsg);
            }
            State::Calling | State::Proceeding => {
                self.set_last_status_code(code);
                self.notify_rx_response(&response.msg).await;
                self.change_state_to(State::Completed, TsxEventKind::RxMsg);
                self.complete();

                let mut ack = self.create_ack(response);
                self.tsx_send_request(&mut ack).await?;

                self.schedule_timer_d();
            }
            State::Completed => {
                // 17.1.1.2 INVITE Client Transaction
                // Any retransmissions of the final response that are received while in
                // the "Completed" state MUST cause the ACK to be re-passed to the
                // transport layer for retransmission, but the newly received response
                // MUST NOT be passed up to the TU.
                if let Err(err) = self.retransmit().await {
                    self.on_transport_error(err);
                }
            }
            _ => (),
        }

        Ok(())
    }

    /// Stops request retransmissions while the final response is awaited.
    ///
    /// The overall timeout keeps running; only timer A is disarmed.
    pub fn stop_retransmit(&self) {
        self.transaction.stop_retransmit();
    }

    fn create_ack(&self, response: &IncomingResponse) -> OutgoingRequest {
        let to = response
            .msg
            .headers
            .to()
            .cloned()
            .unwrap_or_else(|| To::new(self.request.uri.clone()));

        let cseq = CSeq {
            method: SipMethod::Ack,
            ..self.request.cseq
        };

        let headers = &self.request;
        let mut ack_hdrs = Headers::with_capacity(5);

        ack_hdrs.push(Header::Via(headers.via.clone()));
        ack_hdrs.push(Header::From(headers.from.clone()));
        ack_hdrs.push(Header::To(to));
        ack_hdrs.push(Header::CallId(headers.call_id.clone()));
        ack_hdrs.push(Header::CSeq(cseq));

        OutgoingRequest {
            msg: Request {
                req_line: RequestLine {
                    method: SipMethod::Ack,
                    uri: self.request.uri.clone(),
                },
                headers: ack_hdrs,
                body: None,
            },
            addr: self.addr(),
            buf: None,
            transport: self.transport(),
        }
    }

    fn schedule_timer_d(&self) {
        if self.reliable() {
            self.on_terminated(TsxEventKind::Timer);
        } else {
            // Start timer D
            self.schedule_termination(self.timers().td, TsxEventKind::Timer);
        }
    }

    fn complete(&self) {
        let tx = self.tx_completed.lock().expect("Lock failed").take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    pub(crate) fn terminate_kind(&self, code: StatusCode, kind: TsxEventKind) {
        if self.get_state() >= State::Terminated {
            return;
        }

        self.complete();
        self.terminate_with(code, kind);
    }

    /// Forces the transaction to `Terminated` with the given code.
    pub fn terminate(&self, code: StatusCode) {
        self.terminate_kind(code, TsxEventKind::User);
    }
}

impl DerefMut for InvClientTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transaction
    }
}

impl Deref for InvClientTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        endpoint::TimerSettings,
        message::{SipMethod, StatusCode},
        transaction::mock,
        transport::mock::MockTransport,
    };
    use std::time::Duration;
    use tokio::time::{self};

    #[tokio::test]
    async fn test_state_calling() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint, None).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Calling);
    }

    #[tokio::test]
    async fn test_state_proceeding() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Invite);
        let response = mock::incoming_response_with(StatusCode::TRYING, SipMethod::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint, None).await.unwrap();

        uac_inv.receive(&response).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Proceeding);
    }

    #[tokio::test]
    async fn test_state_completed_sends_ack() {
        let endpoint = mock::default_endpoint().await;
        let transport = Arc::new(MockTransport::udp());
        let request = mock::outgoing_request_on(SipMethod::Invite, transport.clone());
        let response = mock::incoming_response_with(StatusCode::BUSY_HERE, SipMethod::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint, None).await.unwrap();

        uac_inv.receive(&response).await.unwrap();

        assert_eq!(uac_inv.last_status_code(), Some(StatusCode::BUSY_HERE));
        assert_eq!(uac_inv.get_state(), State::Completed);

        // INVITE plus the generated ACK.
        assert_eq!(transport.sent_count(), 2);
        let ack = transport.last_sent().unwrap();
        assert!(ack.starts_with(b"ACK "), "not an ACK: {:?}", ack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_replayed_on_response_retransmission() {
        let endpoint = mock::default_endpoint().await;
        let tu = mock::RecordingTu::new();
        let transport = Arc::new(MockTransport::udp());
        let request = mock::outgoing_request_on(SipMethod::Invite, transport.clone());

        let uac_inv = InvClientTransaction::send(request, &endpoint, Some(tu.clone()))
            .await
            .unwrap();

        let response = mock::incoming_response_with(StatusCode::MOVED_PERMANENTLY, SipMethod::Invite);
        uac_inv.receive(&response).await.unwrap();
        assert_eq!(transport.sent_count(), 2);

        // Two more copies of the 301: the ACK goes out again, the TU hears
        // nothing new.
        uac_inv.receive(&response).await.unwrap();
        uac_inv.receive(&response).await.unwrap();

        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.sent_count(), 4);
        assert_eq!(tu.rx_responses(), 1);

        let ack = transport.last_sent().unwrap();
        assert!(ack.starts_with(b"ACK "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_a() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint, None).await.unwrap();

        assert!(uac_inv.retrans_count() == 0);
        assert_eq!(uac_inv.get_state(), State::Calling);

        // Timer A doubles without a cap: 500 ms, 1 s, 2 s, 4 s, 8 s.
        time::sleep(Duration::from_millis(500 + 1)).await;
        assert!(uac_inv.retrans_count() == 1);

        time::sleep(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 2);

        time::sleep(Duration::from_secs(2) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 3);

        time::sleep(Duration::from_secs(4) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 4);

        time::sleep(Duration::from_secs(8) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_b() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint, None).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Calling);

        time::sleep(TimerSettings::T1 * 64 + Duration::from_millis(1)).await;

        assert!(uac_inv.get_state() == State::Destroyed);
        assert_eq!(uac_inv.last_status_code(), Some(StatusCode::REQUEST_TIMEOUT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_d() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Invite);
        let response = mock::incoming_response_with(StatusCode::BUSY_HERE, SipMethod::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint, None).await.unwrap();

        uac_inv.receive(&response).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Completed);

        time::sleep(TimerSettings::TD + Duration::from_millis(1)).await;

        assert!(uac_inv.get_state() == State::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_2xx_terminates_without_ack() {
        let endpoint = mock::default_endpoint().await;
        let transport = Arc::new(MockTransport::udp());
        let request = mock::outgoing_request_on(SipMethod::Invite, transport.clone());

        let uac_inv = InvClientTransaction::send(request, &endpoint, None).await.unwrap();

        time::sleep(Duration::from_millis(120)).await;
        let response = mock::incoming_response_with(StatusCode::OK, SipMethod::Invite);
        uac_inv.receive(&response).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Destroyed);

        // No ACK was generated; the last transmitted message is still the
        // INVITE.
        assert_eq!(transport.sent_count(), 1);
        let last = uac_inv.last_msg().await.unwrap();
        assert!(last.starts_with(b"INVITE "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_retransmit() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint, None).await.unwrap();

        uac_inv.stop_retransmit();

        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(uac_inv.retrans_count(), 0);
        assert_eq!(uac_inv.get_state(), State::Calling);

        // The overall deadline still applies.
        time::sleep(TimerSettings::T1 * 64).await;
        assert_eq!(uac_inv.get_state(), State::Destroyed);
        assert_eq!(uac_inv.last_status_code(), Some(StatusCode::REQUEST_TIMEOUT));
    }
}
