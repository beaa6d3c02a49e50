#![deny(missing_docs)]
//! SIP Transaction Layer.
//!
//! Implements the RFC 3261 §17 state machines. A transaction owns the last
//! transmitted buffer, drives retransmissions and timeouts over its
//! transport, and reports every state change to its transaction user.

use bytes::Bytes;

use crate::{
    endpoint::{Endpoint, TimerSettings},
    error::{Error, Result},
    message::{Response, SipMethod, StatusCode},
    transport::{
        IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse, ToBytes, Transport,
        TransportKey,
    },
};

use std::{
    collections::{hash_map::Entry, HashMap},
    mem,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use tokio::sync::{mpsc, Notify};

pub(crate) mod client;
pub(crate) mod inv_client;
pub(crate) mod inv_server;
/// Transaction key derivation.
pub mod key;
pub(crate) mod server;

pub use client::ClientTransaction;
pub use inv_client::InvClientTransaction;
pub use inv_server::InvServerTransaction;
pub use key::TsxKey;
pub use server::ServerTransaction;

type LastMsg = tokio::sync::RwLock<Option<Bytes>>;
type LastStatusCode = RwLock<Option<StatusCode>>;
type TuSlot = RwLock<Option<Arc<dyn TransactionUser>>>;
type EventTx = mpsc::UnboundedSender<(Option<Arc<dyn TransactionUser>>, TsxStateEvent)>;

/// The possible roles of a SIP Transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// (User Agent Client): The entity that initiates the
    /// request.
    UAC,
    /// (User Agent Server): The entity that responds to the
    /// request.
    UAS,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
/// Defines the possible states of a SIP Transaction.
///
/// The declaration order is the state machine's total order: a transaction
/// only ever moves towards `Destroyed`.
pub enum State {
    #[default]
    /// Initial state
    Initial,
    /// Calling state
    Calling,
    /// Trying state
    Trying,
    /// Proceeding state
    Proceeding,
    /// Completed state
    Completed,
    /// Confirmed state
    Confirmed,
    /// Terminated state
    Terminated,
    /// Destroyed state
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What caused a state change.
pub enum TsxEventKind {
    /// A message was transmitted.
    TxMsg,
    /// A message was received.
    RxMsg,
    /// A timer fired.
    Timer,
    /// The transport reported a failure.
    TransportError,
    /// The TU forced the change.
    User,
    /// Internal housekeeping.
    Unknown,
}

#[derive(Debug, Clone)]
/// A state change notification delivered to the transaction user.
pub struct TsxStateEvent {
    /// Key of the transaction that changed.
    pub key: TsxKey,
    /// Role of the transaction.
    pub role: Role,
    /// Method of the transaction.
    pub method: SipMethod,
    /// The state before the change.
    pub prev: State,
    /// The state after the change.
    pub state: State,
    /// What caused the change.
    pub kind: TsxEventKind,
    /// The last status code seen by the transaction, if any.
    pub status_code: Option<StatusCode>,
}

/// The Transaction User: whatever sits above the transaction layer.
///
/// All notifications for one transaction are delivered in order, and the
/// `Terminated` state is reported exactly once.
#[async_trait::async_trait]
#[allow(unused_variables)]
pub trait TransactionUser: Sync + Send + 'static {
    /// Called for every transaction state change.
    async fn on_tsx_state(&self, event: TsxStateEvent) {}

    /// Called when a response reaches a client transaction, just before the
    /// state change it causes is reported.
    async fn on_rx_response(&self, key: &TsxKey, response: &Response) {}
}

struct Inner {
    /// The role of the transaction (UAC or UAS).
    role: Role,
    /// The method of the transaction.
    method: SipMethod,
    /// The request CSeq number.
    cseq: u32,
    /// The endpoint associated with the transaction.
    endpoint: Endpoint,
    /// The key used to identify the transaction.
    key: TsxKey,
    /// The transport bound to the transaction. Replaced when a response
    /// send resolves to a different transport.
    transport: Mutex<Arc<dyn Transport>>,
    /// The resolved peer address, reused for retransmissions.
    addr: Mutex<SocketAddr>,
    /// The current state of the transaction.
    state: Mutex<State>,
    /// The last status code sent or received in the transaction.
    status_code: LastStatusCode,
    /// The retransmission count for the transaction.
    retransmit_count: AtomicUsize,
    /// Set once the TU asked to stop request retransmissions.
    retransmit_stopped: AtomicBool,
    /// The last message sent in the transaction.
    last_msg: LastMsg,
    /// Timer settings captured at creation.
    timers: TimerSettings,
    /// The overall deadline (timer B/F), overridable by the TU.
    timeout: Mutex<Duration>,
    /// Wakes the timeout timer after a `set_timeout`.
    timeout_changed: Notify,
    /// The transaction user receiving notifications.
    tu: TuSlot,
    /// Ordered state-change delivery to the TU.
    events_tx: EventTx,
}

#[derive(Clone)]
/// Represents a SIP Transaction.
///
/// A SIP Transaction consists of a set of messages exchanged
/// between a client (`UAC`) and a server (`UAS`) to complete
/// a certain action, such as establishing or terminating a call.
pub struct Transaction(Arc<Inner>);

impl Transaction {
    fn builder() -> Builder {
        Default::default()
    }

    pub(crate) fn new_uac(
        request: &OutgoingRequest,
        endpoint: &Endpoint,
        tu: Option<Arc<dyn TransactionUser>>,
    ) -> Result<Self> {
        let via = request.msg.headers.via().ok_or(Error::MissingRequiredHeader("Via"))?;
        let branch = via.branch().ok_or(Error::InvalidHeader("Via"))?;
        let cseq = request.msg.headers.cseq().ok_or(Error::MissingRequiredHeader("CSeq"))?;

        if cseq.method() != request.method() {
            return Err(Error::InvalidHeader("CSeq"));
        }

        let mut builder = Self::builder();

        builder.key(TsxKey::client(*cseq.method(), branch));
        builder.role(Role::UAC);
        builder.method(*cseq.method());
        builder.cseq(cseq.cseq);
        builder.endpoint(endpoint.clone());
        builder.transport(request.transport.clone());
        builder.addr(request.addr);
        builder.state(State::Initial);
        builder.tu(tu);

        let tsx = builder.build();

        log::trace!("Transaction Created [{:?}] ({})", tsx.0.role, tsx.0.key);

        Ok(tsx)
    }

    pub(crate) fn new_uas(
        request: &IncomingRequest,
        endpoint: &Endpoint,
        state: State,
        tu: Option<Arc<dyn TransactionUser>>,
    ) -> Result<Self> {
        let cseq = request.req_headers.cseq;

        if cseq.method() != request.method() {
            return Err(Error::InvalidHeader("CSeq"));
        }

        let mut builder = Self::builder();

        builder.key(TsxKey::server(request)?);
        builder.role(Role::UAS);
        builder.method(*cseq.method());
        builder.cseq(cseq.cseq);
        builder.endpoint(endpoint.clone());
        builder.transport(request.transport.clone());
        builder.addr(crate::endpoint::response_addr_hint(
            &request.req_headers.via,
            request.packet.addr,
        ));
        builder.state(state);
        builder.tu(tu);

        let tsx = builder.build();

        log::trace!("Transaction Created [{:?}] ({})", tsx.0.role, tsx.0.key);

        Ok(tsx)
    }

    pub(crate) fn key(&self) -> &TsxKey {
        &self.0.key
    }

    /// The role of this transaction.
    pub fn role(&self) -> Role {
        self.0.role
    }

    /// The method of this transaction.
    pub fn method(&self) -> SipMethod {
        self.0.method
    }

    /// The CSeq number of the transaction's request.
    pub fn cseq(&self) -> u32 {
        self.0.cseq
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.0.transport.lock().expect("Lock failed").clone()
    }

    pub(crate) fn transport_key(&self) -> TransportKey {
        self.transport().key()
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        *self.0.addr.lock().expect("Lock failed")
    }

    pub(crate) fn timers(&self) -> TimerSettings {
        self.0.timers
    }

    /// Attaches the transaction user receiving this transaction's events.
    pub fn set_tu(&self, tu: Arc<dyn TransactionUser>) {
        let mut guard = self.0.tu.write().expect("Lock failed");
        *guard = Some(tu);
    }

    #[inline]
    /// Checks if the bound transport is reliable.
    pub fn reliable(&self) -> bool {
        self.transport().reliable()
    }

    #[inline]
    /// Retrieves the current state of the Transaction.
    pub fn get_state(&self) -> State {
        *self.0.state.lock().expect("Lock failed")
    }

    #[inline]
    /// Gets the count of retransmissions.
    pub fn retrans_count(&self) -> u32 {
        self.0.retransmit_count.load(Ordering::SeqCst) as u32
    }

    #[inline]
    pub(crate) fn add_retrans_count(&self) -> u32 {
        self.0.retransmit_count.fetch_add(1, Ordering::SeqCst) as u32 + 1
    }

    #[inline]
    /// Retrieves the last status code sent or received.
    pub fn last_status_code(&self) -> Option<StatusCode> {
        *self.0.status_code.read().expect("Lock failed")
    }

    #[inline]
    pub(crate) fn set_last_status_code(&self, code: StatusCode) {
        let mut guard = self.0.status_code.write().expect("Lock failed");
        *guard = Some(code);
    }

    #[inline]
    /// Retrieves the last msg sent if any.
    pub(crate) async fn last_msg(&self) -> Option<Bytes> {
        self.0.last_msg.read().await.clone()
    }

    pub(crate) async fn set_last_msg(&self, msg: Bytes) {
        let mut guard = self.0.last_msg.write().await;
        *guard = Some(msg);
    }

    pub(crate) fn is_calling(&self) -> bool {
        self.get_state() == State::Calling
    }

    /// Overrides the transaction timeout (timer B/F).
    ///
    /// Fails once a final response has been seen; the timeout no longer
    /// governs anything at that point.
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        if self.last_status_code().is_some_and(|code| code.is_final()) {
            return Err(Error::AlreadyCompleted);
        }

        *self.0.timeout.lock().expect("Lock failed") = timeout;
        self.0.timeout_changed.notify_one();

        Ok(())
    }

    pub(crate) fn timeout_value(&self) -> Duration {
        *self.0.timeout.lock().expect("Lock failed")
    }

    pub(crate) async fn timeout_changed(&self) {
        self.0.timeout_changed.notified().await
    }

    pub(crate) fn stop_retransmit(&self) {
        self.0.retransmit_stopped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn retransmit_stopped(&self) -> bool {
        self.0.retransmit_stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn change_state_to(&self, state: State, kind: TsxEventKind) {
        let prev = {
            let mut guard = self.0.state.lock().expect("Lock failed");
            if *guard >= state {
                // The state machine only moves forward; stale timer fires
                // and duplicate messages land here.
                log::trace!("Stale state change [{:?} -> {state:?}] ({})", *guard, self.0.key);
                return;
            }
            mem::replace(&mut *guard, state)
        };

        log::trace!("State Changed [{prev:?} -> {state:?}] ({:p})", self.0);

        let tu = self.0.tu.read().expect("Lock failed").clone();
        let event = TsxStateEvent {
            key: self.0.key.clone(),
            role: self.0.role,
            method: self.0.method,
            prev,
            state,
            kind,
            status_code: self.last_status_code(),
        };

        // Delivery happens on the transaction's dispatch task, preserving
        // the order of state changes.
        let _ = self.0.events_tx.send((tu, event));
    }

    pub(crate) fn on_terminated(&self, kind: TsxEventKind) {
        self.change_state_to(State::Terminated, kind);

        self.0.endpoint.transactions().unregister(&self.0.key);
        self.change_state_to(State::Destroyed, TsxEventKind::Unknown);
    }

    pub(crate) fn terminate_with(&self, code: StatusCode, kind: TsxEventKind) {
        if self.get_state() >= State::Terminated {
            return;
        }

        self.set_last_status_code(code);
        self.on_terminated(kind);
    }

    pub(crate) fn schedule_termination(&self, time: Duration, kind: TsxEventKind) {
        let tsx = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(time).await;
            tsx.on_terminated(kind);
        });
    }

    /// Posts a transport failure without terminating from the failing call
    /// frame.
    pub(crate) fn on_transport_error(&self, err: Error) {
        log::warn!("Transport failure on {}: {}", self.0.key, err);

        let code = match err {
            Error::Dns(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };

        let tsx = self.clone();
        tokio::spawn(async move {
            tsx.terminate_with(code, TsxEventKind::TransportError);
        });
    }

    pub(crate) async fn notify_rx_response(&self, response: &Response) {
        let tu = self.0.tu.read().expect("Lock failed").clone();
        if let Some(tu) = tu {
            tu.on_rx_response(&self.0.key, response).await;
        }
    }

    pub(crate) async fn retransmit(&self) -> Result<u32> {
        let lock = self.0.last_msg.read().await;
        let Some(msg) = lock.as_ref() else {
            return Err(Error::InvalidOperation);
        };

        self.transport().send(msg, &self.addr()).await?;
        drop(lock);

        Ok(self.add_retrans_count())
    }

    pub(crate) async fn tsx_send_request(&self, msg: &mut OutgoingRequest) -> Result<()> {
        log::debug!("<= Request {} to /{}", msg.method(), msg.addr);

        let buf = match msg.buf.take() {
            Some(buf) => buf,
            None => msg.to_bytes()?,
        };

        self.transport().send(&buf, &msg.addr).await?;
        self.set_last_msg(buf).await;

        Ok(())
    }

    pub(crate) async fn tsx_send_response(&self, msg: &mut OutgoingResponse) -> Result<()> {
        let code = msg.status_code();
        log::debug!("=> Response {} {}", code, msg.reason());

        let buf = match msg.buf.take() {
            Some(buf) => buf,
            None => msg.to_bytes()?,
        };

        let (transport, addr) = self.0.endpoint.resolve_outgoing_addr(&msg.addr).await?;
        transport.send(&buf, &addr).await?;

        // Keep the resolved pair for retransmissions.
        *self.0.transport.lock().expect("Lock failed") = transport;
        *self.0.addr.lock().expect("Lock failed") = addr;

        self.set_last_status_code(code);
        self.set_last_msg(buf).await;

        Ok(())
    }
}

#[derive(Default)]
/// Builder for creating a new SIP `Transaction`.
pub struct Builder {
    role: Option<Role>,
    method: Option<SipMethod>,
    cseq: Option<u32>,
    endpoint: Option<Endpoint>,
    key: Option<TsxKey>,
    transport: Option<Arc<dyn Transport>>,
    addr: Option<SocketAddr>,
    state: Option<Mutex<State>>,
    tu: Option<Arc<dyn TransactionUser>>,
}

impl Builder {
    /// Sets the role of the transaction.
    pub fn role(&mut self, role: Role) -> &mut Self {
        self.role = Some(role);
        self
    }

    /// Sets the method of the transaction.
    pub fn method(&mut self, method: SipMethod) -> &mut Self {
        self.method = Some(method);
        self
    }

    /// Sets the CSeq number of the transaction.
    pub fn cseq(&mut self, cseq: u32) -> &mut Self {
        self.cseq = Some(cseq);
        self
    }

    /// Sets the endpoint associated with the transaction.
    pub fn endpoint(&mut self, endpoint: Endpoint) -> &mut Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the key used to identify the transaction.
    pub fn key(&mut self, key: TsxKey) -> &mut Self {
        self.key = Some(key);
        self
    }

    /// Sets the transport associated with the transaction.
    pub fn transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the address associated with the transaction.
    pub fn addr(&mut self, addr: SocketAddr) -> &mut Self {
        self.addr = Some(addr);
        self
    }

    /// Sets the transaction state.
    pub fn state(&mut self, state: State) -> &mut Self {
        self.state = Some(Mutex::new(state));
        self
    }

    /// Sets the transaction user.
    pub fn tu(&mut self, tu: Option<Arc<dyn TransactionUser>>) -> &mut Self {
        self.tu = tu;
        self
    }

    /// Finalize the builder into a `Transaction`.
    pub fn build(self) -> Transaction {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<(
            Option<Arc<dyn TransactionUser>>,
            TsxStateEvent,
        )>();

        tokio::spawn(async move {
            while let Some((tu, event)) = events_rx.recv().await {
                if let Some(tu) = tu {
                    tu.on_tsx_state(event).await;
                }
            }
        });

        let endpoint = self.endpoint.expect("Endpoint is required");
        let timers = endpoint.timers();

        let inner = Inner {
            role: self.role.expect("Role is required"),
            method: self.method.expect("Method is required"),
            cseq: self.cseq.unwrap_or_default(),
            endpoint,
            key: self.key.expect("Key is required"),
            transport: Mutex::new(self.transport.expect("Transport is required")),
            addr: Mutex::new(self.addr.expect("Address is required")),
            state: self.state.expect("State is required"),
            status_code: Default::default(),
            retransmit_count: Default::default(),
            retransmit_stopped: Default::default(),
            last_msg: Default::default(),
            timeout: Mutex::new(timers.timeout()),
            timers,
            timeout_changed: Notify::new(),
            tu: RwLock::new(self.tu),
            events_tx,
        };

        Transaction(Arc::new(inner))
    }
}

#[derive(Clone)]
/// An Server Transaction, either Invite or NonInvite.
pub enum ServerTsx {
    /// An NonInvite Server Transaction.
    NonInvite(ServerTransaction),
    /// An Invite Server Transaction.
    Invite(InvServerTransaction),
}

impl ServerTsx {
    /// Retrieves the last status code sent by transaction.
    pub fn last_status_code(&self) -> Option<StatusCode> {
        match self {
            ServerTsx::NonInvite(uas) => uas.last_status_code(),
            ServerTsx::Invite(uas_inv) => uas_inv.last_status_code(),
        }
    }

    /// Retrieves the current transaction state.
    pub fn get_state(&self) -> State {
        match self {
            ServerTsx::NonInvite(uas) => uas.get_state(),
            ServerTsx::Invite(uas_inv) => uas_inv.get_state(),
        }
    }

    /// Attaches the transaction user.
    pub fn set_tu(&self, tu: Arc<dyn TransactionUser>) {
        match self {
            ServerTsx::NonInvite(uas) => uas.set_tu(tu),
            ServerTsx::Invite(uas_inv) => uas_inv.set_tu(tu),
        }
    }

    pub(crate) fn key(&self) -> &TsxKey {
        match self {
            ServerTsx::NonInvite(uas) => uas.key(),
            ServerTsx::Invite(uas_inv) => uas_inv.key(),
        }
    }

    pub(crate) fn transport_key(&self) -> TransportKey {
        match self {
            ServerTsx::NonInvite(uas) => uas.transport_key(),
            ServerTsx::Invite(uas_inv) => uas_inv.transport_key(),
        }
    }

    pub(crate) fn terminate(&self, code: StatusCode, kind: TsxEventKind) {
        match self {
            ServerTsx::NonInvite(uas) => uas.terminate_kind(code, kind),
            ServerTsx::Invite(uas_inv) => uas_inv.terminate_kind(code, kind),
        }
    }

    pub(crate) async fn receive_request(&self, request: &IncomingRequest) -> Result<()> {
        match self {
            ServerTsx::NonInvite(uas) => uas.receive(request).await,
            ServerTsx::Invite(uas_inv) => uas_inv.receive(request).await,
        }
    }
}

impl From<ServerTransaction> for ServerTsx {
    fn from(tsx: ServerTransaction) -> Self {
        ServerTsx::NonInvite(tsx)
    }
}

impl From<InvServerTransaction> for ServerTsx {
    fn from(tsx: InvServerTransaction) -> Self {
        ServerTsx::Invite(tsx)
    }
}

#[derive(Clone)]
/// An Client Transaction, either Invite or NonInvite.
pub enum ClientTsx {
    /// An NonInvite Client Transaction.
    NonInvite(ClientTransaction),
    /// An Invite Client Transaction.
    Invite(InvClientTransaction),
}

impl ClientTsx {
    /// Retrieves the last status code received by the transaction.
    pub fn last_status_code(&self) -> Option<StatusCode> {
        match self {
            ClientTsx::NonInvite(uac) => uac.last_status_code(),
            ClientTsx::Invite(uac_inv) => uac_inv.last_status_code(),
        }
    }

    /// Retrieves the current transaction state.
    pub fn get_state(&self) -> State {
        match self {
            ClientTsx::NonInvite(uac) => uac.get_state(),
            ClientTsx::Invite(uac_inv) => uac_inv.get_state(),
        }
    }

    pub(crate) fn key(&self) -> &TsxKey {
        match self {
            ClientTsx::NonInvite(uac) => uac.key(),
            ClientTsx::Invite(uac_inv) => uac_inv.key(),
        }
    }

    pub(crate) fn transport_key(&self) -> TransportKey {
        match self {
            ClientTsx::NonInvite(uac) => uac.transport_key(),
            ClientTsx::Invite(uac_inv) => uac_inv.transport_key(),
        }
    }

    pub(crate) fn terminate(&self, code: StatusCode, kind: TsxEventKind) {
        match self {
            ClientTsx::NonInvite(uac) => uac.terminate_kind(code, kind),
            ClientTsx::Invite(uac_inv) => uac_inv.terminate_kind(code, kind),
        }
    }

    pub(crate) async fn receive(&self, response: &IncomingResponse) -> Result<()> {
        match self {
            ClientTsx::NonInvite(uac) => uac.receive(response).await,
            ClientTsx::Invite(uac_inv) => uac_inv.receive(response).await,
        }
    }
}

/// Represents the transaction layer of the SIP protocol.
///
/// This type holds all server and client transactions created
/// by the TU (Transaction User).
pub struct TransactionLayer {
    client_transactions: Mutex<HashMap<TsxKey, ClientTsx>>,
    server_transactions: Mutex<HashMap<TsxKey, ServerTsx>>,
    max_transactions: usize,
}

/// Registry capacity when the endpoint does not override it.
pub const DEFAULT_MAX_TRANSACTIONS: usize = 1024;

impl Default for TransactionLayer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRANSACTIONS)
    }
}

impl TransactionLayer {
    pub(crate) fn new(max_transactions: usize) -> Self {
        Self {
            client_transactions: Default::default(),
            server_transactions: Default::default(),
            max_transactions,
        }
    }

    /// The number of registered transactions, both roles.
    pub fn count(&self) -> usize {
        let clients = self.client_transactions.lock().expect("Lock failed").len();
        let servers = self.server_transactions.lock().expect("Lock failed").len();

        clients + servers
    }

    /// Removes a transaction from the registry.
    ///
    /// Unregistering a key that is not present is a no-op, so teardown
    /// paths may call this unconditionally.
    pub fn unregister(&self, key: &TsxKey) {
        match key.role() {
            Role::UAC => {
                self.client_transactions.lock().expect("Lock failed").remove(key);
            }
            Role::UAS => {
                self.server_transactions.lock().expect("Lock failed").remove(key);
            }
        }
    }

    pub(crate) fn register_client(&self, tsx: ClientTsx) -> Result<()> {
        if self.count() >= self.max_transactions {
            return Err(Error::TooManyTransactions);
        }

        let key = tsx.key().clone();
        let mut map = self.client_transactions.lock().expect("Lock failed");

        match map.entry(key) {
            Entry::Occupied(_) => Err(Error::DuplicateKey),
            Entry::Vacant(entry) => {
                entry.insert(tsx);
                Ok(())
            }
        }
    }

    pub(crate) fn register_server(&self, tsx: ServerTsx) -> Result<()> {
        if self.count() >= self.max_transactions {
            return Err(Error::TooManyTransactions);
        }

        let key = tsx.key().clone();
        let mut map = self.server_transactions.lock().expect("Lock failed");

        match map.entry(key) {
            Entry::Occupied(_) => Err(Error::DuplicateKey),
            Entry::Vacant(entry) => {
                entry.insert(tsx);
                Ok(())
            }
        }
    }

    /// Looks up a live server transaction. The returned clone keeps the
    /// transaction alive for the caller.
    pub fn find_server_tsx(&self, key: &TsxKey) -> Option<ServerTsx> {
        self.server_transactions.lock().expect("Lock failed").get(key).cloned()
    }

    /// Looks up a live client transaction.
    pub fn find_client_tsx(&self, key: &TsxKey) -> Option<ClientTsx> {
        self.client_transactions.lock().expect("Lock failed").get(key).cloned()
    }

    pub(crate) async fn handle_response(&self, response: &IncomingResponse) -> Result<bool> {
        let Some(branch) = response.req_headers.via.branch() else {
            return Ok(false);
        };

        let key = TsxKey::client(*response.req_headers.cseq.method(), branch);
        let client_tsx = match self.find_client_tsx(&key) {
            Some(tsx) if tsx.get_state() < State::Terminated => tsx,
            _ => return Ok(false),
        };

        client_tsx.receive(response).await?;

        Ok(true)
    }

    pub(crate) async fn handle_request(&self, request: &IncomingRequest) -> Result<bool> {
        let key = TsxKey::server(request)?;
        let server_tsx = match self.find_server_tsx(&key) {
            Some(tsx) if tsx.get_state() < State::Terminated => tsx,
            _ => return Ok(false),
        };

        server_tsx.receive_request(request).await?;

        Ok(true)
    }

    /// Terminates every transaction bound to a transport that went away.
    ///
    /// Termination is posted to fresh tasks so the notifying thread never
    /// holds a transport lock while TU callbacks run.
    pub(crate) fn on_transport_closed(&self, key: &TransportKey) {
        let clients: Vec<ClientTsx> = {
            let map = self.client_transactions.lock().expect("Lock failed");
            map.values().filter(|tsx| tsx.transport_key() == *key).cloned().collect()
        };
        let servers: Vec<ServerTsx> = {
            let map = self.server_transactions.lock().expect("Lock failed");
            map.values().filter(|tsx| tsx.transport_key() == *key).cloned().collect()
        };

        for tsx in clients {
            tokio::spawn(async move {
                tsx.terminate(StatusCode::SERVICE_UNAVAILABLE, TsxEventKind::TransportError);
            });
        }
        for tsx in servers {
            tokio::spawn(async move {
                tsx.terminate(StatusCode::SERVICE_UNAVAILABLE, TsxEventKind::TransportError);
            });
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::*;
    use crate::{endpoint, transport::mock::MockTransport};

    #[tokio::test]
    async fn test_non_invite_server_tsx() {
        let mut req = mock::request(SipMethod::Register);

        let endpoint = endpoint::Builder::new().build().await;

        endpoint.new_uas_tsx(&mut req, None).unwrap();

        let transactions = endpoint.transactions();
        let key = req.tsx_key().unwrap().clone();
        let tsx = transactions.find_server_tsx(&key);

        assert!(matches!(tsx.as_ref(), Some(ServerTsx::NonInvite(_))));
        let tsx = match tsx.unwrap() {
            ServerTsx::NonInvite(tsx) => tsx,
            _ => unreachable!(),
        };

        tsx.terminate(StatusCode::SERVICE_UNAVAILABLE);
        let tsx = transactions.find_server_tsx(&key);

        assert!(tsx.is_none());
    }

    #[tokio::test]
    async fn test_invite_server_tsx() {
        let mut req = mock::request(SipMethod::Invite);

        let endpoint = endpoint::Builder::new().build().await;

        endpoint.new_uas_inv_tsx(&mut req, None).unwrap();

        let transactions = endpoint.transactions();
        let key = req.tsx_key().unwrap().clone();

        let tsx = transactions.find_server_tsx(&key);

        assert!(matches!(tsx.as_ref(), Some(ServerTsx::Invite(_))));

        let tsx = match tsx.unwrap() {
            ServerTsx::Invite(tsx) => tsx,
            _ => unreachable!(),
        };

        tsx.terminate(StatusCode::SERVICE_UNAVAILABLE);

        let tsx = transactions.find_server_tsx(&key);

        assert!(tsx.is_none());
    }

    #[tokio::test]
    async fn test_handle_request_dispatches_to_transaction() {
        let endpoint = mock::default_endpoint().await;
        let mut req = mock::request(SipMethod::Options);

        let tsx = endpoint.new_uas_tsx(&mut req, None).unwrap();
        tsx.respond(&mut mock::response(StatusCode::TRYING)).await.unwrap();

        let retransmission = mock::request(SipMethod::Options);
        let handled = endpoint.transactions().handle_request(&retransmission).await.unwrap();

        assert!(handled);
        assert_eq!(tsx.retrans_count(), 1);

        // A different branch does not match.
        let other = mock::request_with_branch(SipMethod::Options, "z9hG4bKother");
        let handled = endpoint.transactions().handle_request(&other).await.unwrap();

        assert!(!handled);
    }

    #[tokio::test]
    async fn test_handle_response_dispatches_to_transaction() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Options);

        let uac = ClientTransaction::send(request, &endpoint, None).await.unwrap();

        let response = mock::incoming_response(StatusCode::OK);
        let handled = endpoint.transactions().handle_response(&response).await.unwrap();

        assert!(handled);
        assert_eq!(uac.get_state(), State::Completed);
    }

    #[tokio::test]
    async fn test_handle_response_without_match() {
        let endpoint = mock::default_endpoint().await;

        let response = mock::incoming_response(StatusCode::OK);
        let handled = endpoint.transactions().handle_response(&response).await.unwrap();

        assert!(!handled);
    }

    #[tokio::test]
    async fn test_registry_capacity() {
        let endpoint = endpoint::Builder::new().with_max_transactions(1).build().await;

        let mut first = mock::request(SipMethod::Options);
        endpoint.new_uas_tsx(&mut first, None).unwrap();

        let mut second = mock::request_with_branch(SipMethod::Options, "z9hG4bKsecond");
        let err = endpoint.new_uas_tsx(&mut second, None).unwrap_err();

        assert_matches!(err, Error::TooManyTransactions);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let endpoint = mock::default_endpoint().await;
        let mut req = mock::request(SipMethod::Options);

        let tsx = endpoint.new_uas_tsx(&mut req, None).unwrap();
        let key = tsx.key().clone();

        endpoint.transactions().unregister(&key);
        endpoint.transactions().unregister(&key);

        assert_eq!(endpoint.transactions().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_closed_fails_bound_transactions() {
        let endpoint = mock::default_endpoint().await;
        let tu = mock::RecordingTu::new();
        let transport = std::sync::Arc::new(MockTransport::udp());
        let request = mock::outgoing_request_on(SipMethod::Options, transport.clone());

        let uac = ClientTransaction::send(request, &endpoint, Some(tu.clone()))
            .await
            .unwrap();

        endpoint.close_transport(&transport.key());
        time::sleep(Duration::from_millis(1)).await;

        assert_eq!(uac.get_state(), State::Destroyed);
        assert_eq!(uac.last_status_code(), Some(StatusCode::SERVICE_UNAVAILABLE));

        let terminated = tu
            .last_event()
            .filter(|event| event.state == State::Destroyed)
            .is_some();
        assert!(terminated);
        assert_eq!(tu.terminated_count(), 1);
    }
}
