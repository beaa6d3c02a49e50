use std::cmp;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Mutex;

use futures_util::future::Either;
use futures_util::future::{self};
use tokio::pin;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};

use crate::error::Error;
use crate::message::SipMethod;
use crate::message::StatusCode;
use crate::transaction::key;
use crate::transaction::ClientTsx;
use crate::transaction::State;
use crate::transaction::Transaction;
use crate::transaction::TsxEventKind;
use crate::transaction::TransactionUser;
use crate::transport::IncomingResponse;
use crate::transport::OutgoingRequest;
use crate::Endpoint;
use crate::Result;

type TxCompleted = Arc<Mutex<Option<oneshot::Sender<()>>>>;
type RxCompleted = oneshot::Receiver<()>;

/// Represents a Client Non INVITE transaction.
#[derive(Clone)]
pub struct ClientTransaction {
    transaction: Transaction,
    tx_completed: TxCompleted,
}

impl std::fmt::Debug for ClientTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransaction").finish()
    }
}

impl ClientTransaction {
    /// Creates the transaction, registers it and sends the request.
    ///
    /// On a send failure nothing stays registered and the error is
    /// returned to the caller.
    pub async fn send(
        mut request: OutgoingRequest,
        endpoint: &Endpoint,
        tu: Option<Arc<dyn TransactionUser>>,
    ) -> Result<ClientTransaction> {
        let method = *request.method();

        if matches!(method, SipMethod::Invite | SipMethod::Ack) {
            return Err(Error::InvalidMethod(method));
        }

        key::ensure_branch(&mut request)?;

        let transaction = Transaction::new_uac(&request, endpoint, tu)?;
        let (tx, rx) = oneshot::channel();

        let uac = Self {
            transaction,
            tx_completed: Arc::new(Mutex::new(Some(tx))),
        };

        endpoint.transactions().register_client(ClientTsx::NonInvite(uac.clone()))?;

        if let Err(err) = uac.tsx_send_request(&mut request).await {
            endpoint.transactions().unregister(uac.key());
            return Err(err);
        }

        uac.change_state_to(State::Trying, TsxEventKind::TxMsg);
        uac.retrans_loop(rx);

        Ok(uac)
    }

    fn retrans_loop(&self, mut rx_completed: RxCompleted) {
        let unreliable = !self.reliable();
        let uac = self.clone();

        tokio::spawn(async move {
            let timers = uac.timers();
            let started = Instant::now();

            pin! {
                let timer_f = time::sleep(uac.timeout_value());
                let timer_e = if unreliable {
                    Either::Left(time::sleep(timers.t1))
                } else {
                    Either::Right(future::pending::<()>())
                };
            }

            'retrans: loop {
                tokio::select! {
                    _ = &mut timer_e, if matches!(uac.get_state(), State::Trying | State::Proceeding) => {
                        let state = uac.get_state();
                        match uac.retransmit().await {
                            Ok(retrans) =>  {
                                let interval = if state == State::Trying {
                                    let retrans = timers.t1 * (1u32 << retrans.min(12));
                                    cmp::min(retrans, timers.t2)
                                } else {
                                    // After a provisional, retransmissions
                                    // stay at T2 (RFC 3261 §17.1.2.2).
                                    timers.t2
                                };
                                timer_e.set(Either::Left(time::sleep(interval)));
                            },
                            Err(err) =>  {
                                uac.on_transport_error(err);
                                break 'retrans;
                            },
                        }
                    }
                    _ = &mut timer_f => {
                        // Timer F Expired! A transaction that already
                        // completed belongs to timer K now.
                        if uac.get_state() < State::Completed {
                            uac.terminate_kind(StatusCode::REQUEST_TIMEOUT, TsxEventKind::Timer);
                        }
                        break 'retrans;
                    }
                    _ = uac.timeout_changed() => {
                        timer_f.as_mut().reset(started + uac.timeout_value());
                    }
                    _ = &mut rx_completed => {
                        // Got completed state!;
                        break 'retrans;
                    }
                }
            }
        });
    }

    pub(crate) async fn receive(&self, response: &IncomingResponse) -> Result<()> {
        let code = response.code();

        match self.get_state() {
            State::Trying if code.is_provisional() => {
                self.set_last_status_code(code);
                self.notify_rx_response(&response.msg).await;
                self.change_state_to(State::Proceeding, TsxEventKind::RxMsg);
            }
            State::Proceeding if code.is_provisional() => {
                self.set_last_status_code(code);
                self.notify_rx_response(&response.msg).await;
            }
            State::Trying | State::Proceeding if code.is_final() => {
                self.set_last_status_code(code);
                self.notify_rx_response(&response.msg).await;
                self.change_state_to(State::Completed, TsxEventKind::RxMsg);
                self.complete();
                self.schedule_timer_k();
            }
            State::Completed => {
                // 17.1.2.2: late retransmissions of the final response are
                // absorbed without notifying the TU again.
            }
            _ => (),
        }

        Ok(())
    }

    fn schedule_timer_k(&self) {
        if self.reliable() {
            self.on_terminated(TsxEventKind::Timer);
        } else {
            // Start timer K
            self.schedule_termination(self.timers().t4, TsxEventKind::Timer);
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

impl DerefMut for ClientTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transaction
    }
}

impl Deref for ClientTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}
