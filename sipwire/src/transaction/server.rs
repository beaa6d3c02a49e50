use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::{
    endpoint::Endpoint,
    error::Error,
    message::{SipMethod, StatusCode},
    transaction::{ServerTsx, State, Transaction, TransactionUser, TsxEventKind},
    transport::{IncomingRequest, OutgoingResponse},
    Result,
};

/// Represents a Server Non INVITE transaction.
#[derive(Clone)]
pub struct ServerTransaction {
    transaction: Transaction,
}

impl std::fmt::Debug for ServerTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransaction").finish()
    }
}

impl ServerTransaction {
    pub(crate) fn new(
        endpoint: &Endpoint,
        request: &mut IncomingRequest,
        tu: Option<Arc<dyn TransactionUser>>,
    ) -> Result<Self> {
        let method = *request.method();

        if matches!(method, SipMethod::Ack | SipMethod::Cancel | SipMethod::Invite) {
            return Err(Error::InvalidMethod(method));
        }

        let transaction = Transaction::new_uas(request, endpoint, State::Trying, tu)?;
        let server_tsx = ServerTransaction { transaction };

        endpoint
            .transactions()
            .register_server(ServerTsx::NonInvite(server_tsx.clone()))?;

        request.set_tsx(ServerTsx::NonInvite(server_tsx.clone()));

        Ok(server_tsx)
    }

    pub(crate) async fn receive(&self, _request: &IncomingRequest) -> Result<()> {
        // A retransmission of the original request. While the TU has not
        // produced a response there is nothing to replay; afterwards the
        // latest response goes out again without notifying the TU
        // (RFC 3261 §17.2.2).
        if matches!(self.get_state(), State::Proceeding | State::Completed) {
            if let Err(err) = self.retransmit().await {
                self.on_transport_error(err);
            }
        }

        Ok(())
    }

    /// Sends a response through this transaction.
    pub async fn respond(&self, response: &mut OutgoingResponse) -> Result<()> {
        if self.get_state() >= State::Terminated {
            return Err(Error::TransactionDestroyed);
        }
        if self.get_state() > State::Proceeding {
            return Err(Error::InvalidOperation);
        }

        self.tsx_send_response(response).await?;

        match self.get_state() {
            State::Trying if response.is_provisional() => {
                self.change_state_to(State::Proceeding, TsxEventKind::TxMsg);
            }
            State::Trying | State::Proceeding if !response.is_provisional() => {
                self.change_state_to(State::Completed, TsxEventKind::TxMsg);
                self.schedule_timer_j();
            }
            _ => (),
        }

        Ok(())
    }

    fn schedule_timer_j(&self) {
        if self.reliable() {
            self.on_terminated(TsxEventKind::Timer);
        } else {
            // Start timer J
            self.schedule_termination(self.timers().t1 * 64, TsxEventKind::Timer);
        }
    }

    pub(crate) fn terminate_kind(&self, code: StatusCode, kind: TsxEventKind) {
        if self.get_state() >= State::Terminated {
            return;
        }

        self.terminate_with(code, kind);
    }

    /// Forces the transaction to `Terminated` with the given code.
    pub fn terminate(&self, code: StatusCode) {
        self.terminate_kind(code, TsxEventKind::User);
    }
}

impl DerefMut for ServerTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transaction
    }
}

impl Deref for ServerTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{self};

    use super::*;
    use crate::{
        endpoint::TimerSettings,
        message::{SipMethod, StatusCode},
        transaction::mock,
        transport::mock::MockTransport,
    };

    #[tokio::test]
    async fn test_rejects_invite_ack_and_cancel() {
        let endpoint = mock::default_endpoint().await;

        for method in [SipMethod::Invite, SipMethod::Ack, SipMethod::Cancel] {
            let mut request = mock::request(method);
            let err = ServerTransaction::new(&endpoint, &mut request, None).unwrap_err();
            assert_matches!(err, Error::InvalidMethod(_));
        }
    }

    #[tokio::test]
    async fn test_receives_100_trying() {
        let endpoint = mock::default_endpoint().await;
        let mut request = mock::request(SipMethod::Options);
        let tsx = ServerTransaction::new(&endpoint, &mut request, None).unwrap();
        let response = &mut mock::response(StatusCode::TRYING);

        tsx.respond(response).await.unwrap();

        assert!(tsx.last_status_code().unwrap().as_u16() == 100);
        assert!(tsx.get_state() == State::Proceeding);
    }

    #[tokio::test]
    async fn test_receives_200_ok() {
        let endpoint = mock::default_endpoint().await;
        let mut request = mock::request(SipMethod::Options);
        let tsx = ServerTransaction::new(&endpoint, &mut request, None).unwrap();
        let response = &mut mock::response(StatusCode::OK);

        tsx.respond(response).await.unwrap();

        assert!(tsx.last_status_code().unwrap().as_u16() == 200);
        assert!(tsx.get_state() == State::Completed);
    }

    #[tokio::test]
    async fn test_retransmit_proceeding() {
        let endpoint = mock::default_endpoint().await;
        let mut request = mock::request(SipMethod::Options);
        let tsx = ServerTransaction::new(&endpoint, &mut request, None).unwrap();
        let response = &mut mock::response(StatusCode::TRYING);
        let request = &mock::request(SipMethod::Options);

        tsx.respond(response).await.unwrap();
        tsx.receive(request).await.unwrap();

        assert!(tsx.retrans_count() == 1);
        assert!(tsx.last_status_code().unwrap().as_u16() == 100);
        assert!(tsx.get_state() == State::Proceeding);
    }

    #[tokio::test]
    async fn test_trying_ignores_retransmission() {
        let endpoint = mock::default_endpoint().await;
        let mut request = mock::request(SipMethod::Options);
        let tsx = ServerTransaction::new(&endpoint, &mut request, None).unwrap();

        tsx.receive(&mock::request(SipMethod::Options)).await.unwrap();

        assert_eq!(tsx.retrans_count(), 0);
        assert_eq!(tsx.get_state(), State::Trying);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absorption_without_tu_callbacks() {
        let endpoint = mock::default_endpoint().await;
        let tu = mock::RecordingTu::new();
        let transport = Arc::new(MockTransport::udp());
        let mut request = mock::request_on(SipMethod::Options, transport.clone());

        let tsx = ServerTransaction::new(&endpoint, &mut request, Some(tu.clone())).unwrap();

        let response = &mut mock::response_on(StatusCode::OK, transport.clone());
        tsx.respond(response).await.unwrap();
        time::sleep(Duration::from_millis(1)).await;

        let events_after_final = tu.event_count();
        let sent_after_final = transport.sent_count();

        // Three copies of the original request: three replays of the 200,
        // zero new TU callbacks.
        for _ in 0..3 {
            tsx.receive(&mock::request(SipMethod::Options)).await.unwrap();
        }
        time::sleep(Duration::from_millis(1)).await;

        assert_eq!(transport.sent_count(), sent_after_final + 3);
        assert_eq!(tu.event_count(), events_after_final);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_timer_j() {
        let endpoint = mock::default_endpoint().await;
        let mut request = mock::request(SipMethod::Options);
        let tsx = ServerTransaction::new(&endpoint, &mut request, None).unwrap();
        let response = &mut mock::response(StatusCode::OK);

        tsx.respond(response).await.unwrap();

        time::sleep(TimerSettings::T1 * 64 + Duration::from_millis(1)).await;

        assert!(tsx.last_status_code().unwrap().as_u16() == 200);
        assert!(tsx.get_state() == State::Destroyed);
    }

    #[tokio::test]
    async fn test_respond_after_final_fails() {
        let endpoint = mock::default_endpoint().await;
        let mut request = mock::request(SipMethod::Options);
        let tsx = ServerTransaction::new(&endpoint, &mut request, None).unwrap();

        tsx.respond(&mut mock::response(StatusCode::OK)).await.unwrap();

        let err = tsx.respond(&mut mock::response(StatusCode::OK)).await.unwrap_err();
        assert_matches!(err, Error::InvalidOperation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_failure_terminates_with_503() {
        let endpoint = mock::default_endpoint().await;
        let transport = Arc::new(MockTransport::failing_after(1));
        let mut request = mock::request_on(SipMethod::Options, transport.clone());

        let tsx = ServerTransaction::new(&endpoint, &mut request, None).unwrap();

        let response = &mut mock::response_on(StatusCode::OK, transport.clone());
        tsx.respond(response).await.unwrap();
        assert_eq!(tsx.get_state(), State::Completed);

        // The replay of the 200 hits the broken transport; the failure is
        // posted, not propagated to the caller feeding the packet.
        tsx.receive(&mock::request(SipMethod::Options)).await.unwrap();

        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(tsx.get_state(), State::Destroyed);
        assert_eq!(tsx.last_status_code(), Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let endpoint = mock::default_endpoint().await;
        let mut request = mock::request(SipMethod::Options);
        let _tsx = ServerTransaction::new(&endpoint, &mut request, None).unwrap();

        let mut retransmission = mock::request(SipMethod::Options);
        let err = ServerTransaction::new(&endpoint, &mut retransmission, None).unwrap_err();

        assert_matches!(err, Error::DuplicateKey);
    }
}
