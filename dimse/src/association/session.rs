//! The association session.
//!
//! An [`Association`] owns one TCP connection
//! and tracks its upper layer state.
//! Once established,
//! a dedicated thread reads PDUs from the peer,
//! delivers responses to the handlers of outstanding requests
//! and dispatches incoming requests to the service registry.
//! Any number of threads may invoke requests or write responses concurrently,
//! every outgoing message going through a single PDU encoder.
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use dicom_core::VR;
use dicom_dictionary_std::tags;
use snafu::{ensure, IntoError, OptionExt, ResultExt};
use tracing::{debug, error, info, trace, warn};

use super::pdata::{Fragment, PDataAssembler};
use super::pending::{ChannelRspHandler, DimseResponse, DimseRsp, PendingTable};
use super::state::{transition, Action, Event, Role, State};
use super::uid::trim_uid;
use super::{
    AbortedLocallySnafu, AbortedSnafu, CancelRqHandler, ClosedSnafu, ConnectionClosedSnafu,
    DimseRspHandler, DuplicateMessageIdSnafu, Error, InvalidStateSnafu, NotAResponseSnafu,
    PresentationContextNotAcceptedSnafu, ProtocolVersionMismatchSnafu, ProtocolViolationSnafu,
    ReceivePduSnafu, RejectedSnafu, ResponseTimeoutSnafu, Result, RoleNotNegotiatedSnafu,
    SendPduSnafu, SetupSocketSnafu, SpawnThreadSnafu, TimeoutSnafu, UnexpectedPduSnafu,
    WirePDataSnafu, WriteMessageSnafu,
};
use crate::dimse::{status, Command, DataWriter, Dimse, IncomingData, Priority};
use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ, AssociationRQ,
    AsyncOperationsWindow, PDataValueType, Pdu, PduDecoder, PduEncoder,
    PresentationContextResultReason, RoleSelection, UserVariableItem, DEFAULT_MAX_PDU,
    MAXIMUM_PDU_SIZE,
};
use crate::service::{ServiceError, ServiceRegistry};

/// Tuning of an association session,
/// shared by requestors and acceptors.
///
/// Timeouts set to `None` wait forever.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub(crate) max_pdu_length: u32,
    pub(crate) strict: bool,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) accept_timeout: Option<Duration>,
    pub(crate) release_timeout: Option<Duration>,
    pub(crate) response_timeout: Option<Duration>,
    pub(crate) retrieve_timeout: Option<Duration>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) idle_check_period: Duration,
    pub(crate) socket_close_delay: Duration,
    pub(crate) max_ops_invoked: u16,
    pub(crate) max_ops_performed: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            request_timeout: Some(Duration::from_secs(30)),
            accept_timeout: Some(Duration::from_secs(30)),
            release_timeout: Some(Duration::from_secs(30)),
            response_timeout: None,
            retrieve_timeout: None,
            idle_timeout: None,
            idle_check_period: Duration::from_secs(1),
            socket_close_delay: Duration::from_millis(50),
            max_ops_invoked: 1,
            max_ops_performed: 1,
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the maximum PDU length
    /// that this node admits to receive.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether received P-DATA-TF PDUs longer than
    /// the announced maximum PDU length are rejected.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set how long a requestor waits for the association response.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set how long an acceptor waits for the association request
    /// after accepting the connection.
    pub fn accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Set how long a release waits for the release response,
    /// or for operations in progress to finish.
    pub fn release_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// Set the default deadline for each response to a request.
    pub fn response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the deadline for each response to a C-GET or C-MOVE request.
    pub fn retrieve_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.retrieve_timeout = timeout;
        self
    }

    /// Release the association after this long without any activity.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set how often the association checks
    /// for expired responses and idleness.
    pub fn idle_check_period(mut self, period: Duration) -> Self {
        self.idle_check_period = period;
        self
    }

    /// Set how long to wait for the peer to close the connection
    /// after an abort or release response
    /// before closing it from this end.
    pub fn socket_close_delay(mut self, delay: Duration) -> Self {
        self.socket_close_delay = delay;
        self
    }

    /// Set the maximum number of outstanding requests
    /// which this node may invoke (0 for unlimited).
    pub fn max_ops_invoked(mut self, value: u16) -> Self {
        self.max_ops_invoked = value;
        self
    }

    /// Set the maximum number of requests
    /// which this node may perform at once (0 for unlimited).
    pub fn max_ops_performed(mut self, value: u16) -> Self {
        self.max_ops_performed = value;
        self
    }

    /// The asynchronous operations window to propose as a requestor.
    pub(crate) fn proposed_window(&self) -> Option<AsyncOperationsWindow> {
        if self.max_ops_invoked == 1 && self.max_ops_performed == 1 {
            None
        } else {
            Some(AsyncOperationsWindow {
                max_operations_invoked: self.max_ops_invoked,
                max_operations_performed: self.max_ops_performed,
            })
        }
    }

    /// The asynchronous operations window to grant as an acceptor.
    ///
    /// The window is always expressed from the requestor's side:
    /// what the requestor invokes, this node performs.
    pub(crate) fn granted_window(&self, proposed: AsyncOperationsWindow) -> AsyncOperationsWindow {
        AsyncOperationsWindow {
            max_operations_invoked: min_ops(proposed.max_operations_invoked, self.max_ops_performed),
            max_operations_performed: min_ops(
                proposed.max_operations_performed,
                self.max_ops_invoked,
            ),
        }
    }
}

/// Minimum of two operation limits where 0 stands for unlimited.
fn min_ops(a: u16, b: u16) -> u16 {
    match (a, b) {
        (0, x) | (x, 0) => x,
        (a, b) => a.min(b),
    }
}

/// A presentation context as negotiated on association setup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresentationContextNegotiated {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
    pub reason: PresentationContextResultReason,
}

impl PresentationContextNegotiated {
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

/// Outcome of [`Association::check_idle`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IdleCheck {
    /// The association is not in data transfer.
    NotReady,
    /// Work is in progress, or the idle timeout has not passed yet.
    Active,
    /// A response did not arrive in time, so the association was aborted.
    Aborted { message_id: u16 },
    /// The association was idle for too long and was released.
    Released,
}

/// Everything agreed upon on association setup.
#[derive(Debug, Clone)]
struct Negotiated {
    peer_ae_title: String,
    presentation_contexts: Vec<PresentationContextNegotiated>,
    peer_max_pdu_length: u32,
    max_ops_invoked: u16,
    max_ops_performed: u16,
    role_selections: Vec<RoleSelection>,
    peer_user_variables: Vec<UserVariableItem>,
}

impl Default for Negotiated {
    fn default() -> Self {
        Negotiated {
            peer_ae_title: String::new(),
            presentation_contexts: Vec::new(),
            peer_max_pdu_length: DEFAULT_MAX_PDU,
            max_ops_invoked: 1,
            max_ops_performed: 1,
            role_selections: Vec::new(),
            peer_user_variables: Vec::new(),
        }
    }
}

impl Negotiated {
    fn new(role: Role, rq: &AssociationRQ, ac: &AssociationAC) -> Self {
        let presentation_contexts = ac
            .presentation_contexts
            .iter()
            .filter_map(|pc| {
                let proposed = rq.presentation_contexts.iter().find(|p| p.id == pc.id)?;
                Some(PresentationContextNegotiated {
                    id: pc.id,
                    abstract_syntax: trim_uid(Cow::from(proposed.abstract_syntax.as_str()))
                        .into_owned(),
                    transfer_syntax: trim_uid(Cow::from(pc.transfer_syntax.as_str()))
                        .into_owned(),
                    reason: pc.reason,
                })
            })
            .collect();

        let (peer_ae_title, peer_max_pdu_length, peer_user_variables) = match role {
            Role::Requestor => (
                rq.called_ae_title.clone(),
                ac.max_pdu_length(),
                ac.user_variables.clone(),
            ),
            Role::Acceptor => (
                rq.calling_ae_title.clone(),
                rq.max_pdu_length(),
                rq.user_variables.clone(),
            ),
        };
        let peer_max_pdu_length = match peer_max_pdu_length {
            None => DEFAULT_MAX_PDU,
            Some(0) => MAXIMUM_PDU_SIZE,
            Some(len) => len,
        };

        let window = ac
            .async_operations_window()
            .unwrap_or(AsyncOperationsWindow {
                max_operations_invoked: 1,
                max_operations_performed: 1,
            });
        let (max_ops_invoked, max_ops_performed) = match role {
            Role::Requestor => (
                window.max_operations_invoked,
                window.max_operations_performed,
            ),
            Role::Acceptor => (
                window.max_operations_performed,
                window.max_operations_invoked,
            ),
        };

        let role_selections = ac
            .user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::RoleSelection(role) => Some(RoleSelection {
                    sop_class_uid: trim_uid(Cow::from(role.sop_class_uid.as_str()))
                        .into_owned(),
                    ..role.clone()
                }),
                _ => None,
            })
            .collect();

        Negotiated {
            peer_ae_title,
            presentation_contexts,
            peer_max_pdu_length,
            max_ops_invoked,
            max_ops_performed,
            role_selections,
            peer_user_variables,
        }
    }

    fn accepted(&self, id: u8) -> Option<&PresentationContextNegotiated> {
        self.presentation_contexts
            .iter()
            .find(|pc| pc.id == id && pc.is_accepted())
    }

    /// The roles of this node for the given SOP class, as `(scu, scp)`.
    ///
    /// Without a role selection for it,
    /// the requestor is the SCU and the acceptor is the SCP.
    fn local_roles(&self, role: Role, sop_class_uid: &str) -> (bool, bool) {
        let (requestor_scu, requestor_scp) = self
            .role_selections
            .iter()
            .find(|selection| selection.sop_class_uid == sop_class_uid)
            .map_or((true, false), |selection| {
                (selection.scu_role, selection.scp_role)
            });
        match role {
            Role::Requestor => (requestor_scu, requestor_scp),
            Role::Acceptor => (requestor_scp, requestor_scu),
        }
    }

    /// Whether this node may issue requests of the given service.
    ///
    /// Event reports go from the SCP to the SCU,
    /// every other request from the SCU to the SCP.
    fn may_invoke(&self, role: Role, sop_class_uid: &str, dimse: Dimse) -> bool {
        let (scu, scp) = self.local_roles(role, sop_class_uid);
        if dimse == Dimse::NEventReport {
            scp
        } else {
            scu
        }
    }

    /// Whether this node may perform requests of the given service.
    fn may_perform(&self, role: Role, sop_class_uid: &str, dimse: Dimse) -> bool {
        let (scu, scp) = self.local_roles(role, sop_class_uid);
        if dimse == Dimse::NEventReport {
            scu
        } else {
            scp
        }
    }
}

/// Session state shared between the reader thread and the callers.
struct Shared {
    state: State,
    error: Option<Arc<Error>>,
    negotiated: Negotiated,
    next_message_id: u16,
    pending: PendingTable,
    cancel_handlers: HashMap<u16, Box<dyn CancelRqHandler>>,
    performing: usize,
    last_activity: Instant,
}

impl Shared {
    fn is_closing(&self) -> bool {
        matches!(self.state, State::Sta1 | State::Sta13)
    }

    fn allocate_message_id(&mut self) -> u16 {
        loop {
            let id = self.next_message_id;
            self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
            if !self.pending.contains(id) {
                return id;
            }
        }
    }

    /// The error to report for an operation not allowed in the current state.
    fn state_error(&self) -> Error {
        match &self.error {
            Some(e) => ClosedSnafu.into_error(Arc::clone(e)),
            None => InvalidStateSnafu { state: self.state }.build(),
        }
    }
}

struct Inner {
    role: Role,
    options: SessionOptions,
    registry: Arc<ServiceRegistry>,
    shared: Mutex<Shared>,
    changed: Condvar,
    encoder: Mutex<PduEncoder<TcpStream>>,
    socket: TcpStream,
    closed: AtomicBool,
}

/// What the reader thread does after handling a PDU.
enum Flow {
    Continue,
    Stop,
}

/// A protocol violation by the peer, answered with an abort.
struct Violation {
    reason: AbortRQServiceProviderReason,
    detail: String,
}

impl Violation {
    fn new(reason: AbortRQServiceProviderReason, detail: impl Into<String>) -> Self {
        Violation {
            reason,
            detail: detail.into(),
        }
    }
}

/// Messages partially received by the reader thread.
#[derive(Default)]
struct Reception {
    assembler: PDataAssembler,
    command: Option<Command>,
}

/// An association between this node and a peer.
///
/// This is a handle which can be cloned cheaply,
/// all clones referring to the same association.
/// Requests are invoked with [`invoke`](Association::invoke)
/// or one of the helpers named after the DIMSE services
/// (such as [`cecho`](Association::cecho) or [`cstore`](Association::cstore)),
/// whereas service handlers answer requests
/// with [`write_response`](Association::write_response).
///
/// Dropping the handles does not close the association:
/// release it with [`release`](Association::release)
/// or tear it down with [`abort`](Association::abort).
#[derive(Clone)]
pub struct Association {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.lock();
        f.debug_struct("Association")
            .field("role", &self.inner.role)
            .field("state", &shared.state)
            .field("peer_ae_title", &shared.negotiated.peer_ae_title)
            .finish()
    }
}

impl Association {
    fn new(
        role: Role,
        socket: TcpStream,
        options: SessionOptions,
        registry: Arc<ServiceRegistry>,
    ) -> Result<(Self, PduDecoder<TcpStream>)> {
        let reader = socket.try_clone().context(SetupSocketSnafu)?;
        let writer = socket.try_clone().context(SetupSocketSnafu)?;
        let decoder = PduDecoder::new(reader, options.max_pdu_length, options.strict);

        let association = Association {
            inner: Arc::new(Inner {
                role,
                registry,
                shared: Mutex::new(Shared {
                    state: State::Sta1,
                    error: None,
                    negotiated: Negotiated::default(),
                    next_message_id: 1,
                    pending: PendingTable::default(),
                    cancel_handlers: HashMap::new(),
                    performing: 0,
                    last_activity: Instant::now(),
                }),
                changed: Condvar::new(),
                encoder: Mutex::new(PduEncoder::new(writer)),
                socket,
                closed: AtomicBool::new(false),
                options,
            }),
        };
        Ok((association, decoder))
    }

    /// Negotiate a new association over a connected socket,
    /// as the requestor.
    pub(crate) fn request(
        socket: TcpStream,
        rq: AssociationRQ,
        options: SessionOptions,
        registry: Arc<ServiceRegistry>,
    ) -> Result<(Self, AssociationAC)> {
        let (association, mut decoder) = Association::new(Role::Requestor, socket, options, registry)?;
        let ac = association.negotiate(rq, &mut decoder)?;
        association.start(decoder)?;
        Ok((association, ac))
    }

    /// Wait for an association request on a freshly accepted socket
    /// and answer it with the outcome of `decide`.
    pub(crate) fn accept<F>(
        socket: TcpStream,
        options: SessionOptions,
        registry: Arc<ServiceRegistry>,
        decide: F,
    ) -> Result<Self>
    where
        F: FnOnce(&AssociationRQ) -> std::result::Result<AssociationAC, AssociationRJ>,
    {
        let (association, mut decoder) = Association::new(Role::Acceptor, socket, options, registry)?;
        association.await_request(&mut decoder, decide)?;
        association.start(decoder)?;
        Ok(association)
    }

    // ---- state bookkeeping ----

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Shared>) -> MutexGuard<'a, Shared> {
        self.inner
            .changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a change until the deadline.
    /// Returns `true` alongside the guard if the deadline has passed.
    fn wait_until<'a>(
        &self,
        guard: MutexGuard<'a, Shared>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, Shared>, bool) {
        match deadline {
            None => (self.wait(guard), false),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return (guard, true);
                }
                let (guard, _) = self
                    .inner
                    .changed
                    .wait_timeout(guard, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, false)
            }
        }
    }

    fn set_state(&self, shared: &mut Shared, state: State) {
        if shared.state == state {
            return;
        }
        debug!("{:?} association: {} -> {}", self.inner.role, shared.state, state);
        shared.state = state;
        if shared.is_closing() {
            // handlers are dropped so that their waiters see the association closing
            shared.pending.clear();
            shared.cancel_handlers.clear();
        }
        self.inner.changed.notify_all();
    }

    /// Run an event through the state machine.
    fn fire(&self, shared: &mut Shared, event: Event) -> Option<Action> {
        let (action, next) = transition(shared.state, event, self.inner.role)?;
        trace!("{:?} in {}: {:?}", event, shared.state, action);
        self.set_state(shared, next);
        Some(action)
    }

    /// Run an event through the state machine,
    /// recording the terminal error for the action taken
    /// in the same critical section.
    fn fire_with<F>(&self, event: Event, error_for: F) -> (Option<Action>, State)
    where
        F: FnOnce(Action) -> Option<Error>,
    {
        let mut shared = self.lock();
        let open = !shared.is_closing();
        let action = self.fire(&mut shared, event);
        if let Some(action) = action {
            if open && shared.error.is_none() {
                if let Some(e) = error_for(action) {
                    shared.error = Some(Arc::new(e));
                }
            }
        }
        (action, shared.state)
    }

    fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    // ---- transport ----

    fn send_pdu(&self, pdu: &Pdu) -> Result<()> {
        let mut encoder = self
            .inner
            .encoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        encoder.write_pdu(pdu).context(SendPduSnafu)?;
        debug!("Sent {}", pdu.short_description());
        Ok(())
    }

    fn send_abort(&self, source: AbortRQSource) {
        if let Err(e) = self.send_pdu(&Pdu::AbortRQ { source }) {
            debug!("Could not send A-ABORT: {}", e);
        }
    }

    /// Close the connection, if not closed yet,
    /// and bring the association to `Sta1`.
    fn close_transport(&self) {
        {
            let mut shared = self.lock();
            if shared.state != State::Sta1 && self.fire(&mut shared, Event::ArtimExpired).is_none()
            {
                self.set_state(&mut shared, State::Sta1);
            }
        }
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.inner.socket.shutdown(Shutdown::Both) {
                trace!("Socket shutdown: {}", e);
            }
            debug!("Association connection closed");
        }
    }

    /// Close the connection once the peer had the time to close it first.
    fn close_after_delay(&self) {
        let delay = self.inner.options.socket_close_delay;
        if delay == Duration::from_secs(0) {
            self.close_transport();
            return;
        }
        let association = self.clone();
        let spawned = thread::Builder::new()
            .name("dicom-association-close".to_string())
            .spawn(move || {
                let shared = association.lock();
                let (shared, _) = association
                    .inner
                    .changed
                    .wait_timeout_while(shared, delay, |s| s.state != State::Sta1)
                    .unwrap_or_else(PoisonError::into_inner);
                drop(shared);
                association.close_transport();
            });
        if spawned.is_err() {
            self.close_transport();
        }
    }

    /// Record an I/O failure and close the connection.
    fn io_failure(&self, e: Error) -> Error {
        error!("Association I/O failure: {}", e);
        let e = Arc::new(e);
        {
            let mut shared = self.lock();
            if shared.error.is_none() {
                shared.error = Some(Arc::clone(&e));
            }
        }
        self.close_transport();
        ClosedSnafu.into_error(e)
    }

    /// Abort as the service provider after a protocol violation by the peer.
    fn protocol_abort(&self, violation: Violation) {
        let Violation { reason, detail } = violation;
        warn!("Protocol violation by the peer ({}): {}", reason, detail);
        let (action, _) = self.fire_with(Event::InvalidPduReceived, |_| {
            Some(
                ProtocolViolationSnafu {
                    reason,
                    detail: detail.clone(),
                }
                .build(),
            )
        });
        match action {
            // before the association request, the abort comes from the service user
            Some(Action::Aa1) => {
                self.send_abort(AbortRQSource::ServiceUser);
                self.close_after_delay();
            }
            Some(Action::Aa8) => {
                self.send_abort(AbortRQSource::ServiceProvider(reason));
                self.close_after_delay();
            }
            Some(Action::Aa7) => self.send_abort(AbortRQSource::ServiceProvider(reason)),
            _ => {}
        }
    }

    /// Abort on behalf of the local user.
    fn user_abort(&self, error: Error) -> Result<()> {
        let (action, _) = self.fire_with(Event::AbortRequest, |_| Some(error));
        match action {
            Some(Action::Aa1) => {
                let sent = self.send_pdu(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceUser,
                });
                self.close_after_delay();
                sent
            }
            Some(action) if action.closes_transport() => {
                self.close_transport();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ---- establishment ----

    /// Send the association request and wait for the response.
    ///
    /// Blocks until the association is established (`Sta6`)
    /// or has failed (`Sta1`).
    fn negotiate(
        &self,
        rq: AssociationRQ,
        decoder: &mut PduDecoder<TcpStream>,
    ) -> Result<AssociationAC> {
        {
            let mut shared = self.lock();
            // the socket is already connected
            if self.fire(&mut shared, Event::AssociateRequest).is_none() {
                return Err(shared.state_error());
            }
            self.fire(&mut shared, Event::TransportConfirm);
        }

        if let Err(e) = self.send_pdu(&Pdu::AssociationRQ(rq.clone())) {
            return Err(self.io_failure(e));
        }

        let options = &self.inner.options;
        self.inner
            .socket
            .set_read_timeout(options.request_timeout)
            .context(SetupSocketSnafu)?;
        let pdu = match decoder.read_pdu() {
            Ok(pdu) => pdu,
            Err(e) if e.is_timeout() => {
                warn!("No association response from {} in time", rq.called_ae_title);
                self.user_abort(
                    TimeoutSnafu {
                        what: "the association response",
                    }
                    .build(),
                )?;
                return TimeoutSnafu {
                    what: "the association response",
                }
                .fail();
            }
            Err(e) => return Err(self.on_negotiation_read_error(e)),
        };
        self.inner
            .socket
            .set_read_timeout(None)
            .context(SetupSocketSnafu)?;
        debug!("Received {}", pdu.short_description());

        match pdu {
            Pdu::AssociationAC(ac) => {
                if ac.protocol_version != rq.protocol_version {
                    warn!(
                        "Protocol version mismatch: expected {}, got {}",
                        rq.protocol_version, ac.protocol_version
                    );
                    let mismatch = || ProtocolVersionMismatchSnafu {
                        expected: rq.protocol_version,
                        got: ac.protocol_version,
                    };
                    self.user_abort(mismatch().build())?;
                    return mismatch().fail();
                }

                let negotiated = Negotiated::new(Role::Requestor, &rq, &ac);
                if !negotiated.presentation_contexts.iter().any(|pc| pc.is_accepted()) {
                    warn!("No presentation context accepted by {}", rq.called_ae_title);
                    self.user_abort(super::NoAcceptedPresentationContextsSnafu.build())?;
                    return super::NoAcceptedPresentationContextsSnafu.fail();
                }

                {
                    let mut shared = self.lock();
                    shared.negotiated = negotiated;
                    shared.last_activity = Instant::now();
                    self.fire(&mut shared, Event::AssociateAcReceived);
                }
                info!(
                    "Association with {} established ({} -> {})",
                    rq.called_ae_title, rq.calling_ae_title, rq.called_ae_title
                );
                Ok(ac)
            }
            Pdu::AssociationRJ(association_rj) => {
                info!(
                    "Association request to {} rejected: {}",
                    rq.called_ae_title, association_rj.source
                );
                let rejected = || RejectedSnafu {
                    association_rj: association_rj.clone(),
                };
                self.fire_with(Event::AssociateRjReceived, |_| Some(rejected().build()));
                self.close_transport();
                rejected().fail()
            }
            Pdu::AbortRQ { source } => {
                warn!("Association request aborted by the peer ({})", source);
                self.fire_with(Event::AbortReceived, |_| {
                    Some(AbortedSnafu { abort_source: source }.build())
                });
                self.close_transport();
                AbortedSnafu { abort_source: source }.fail()
            }
            pdu => {
                let reason = unexpected_pdu_reason(&pdu);
                self.protocol_abort(Violation::new(
                    reason,
                    format!("{} while awaiting the association response", pdu.short_description()),
                ));
                UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail()
            }
        }
    }

    fn on_negotiation_read_error(&self, e: crate::pdu::reader::Error) -> Error {
        match e.abort_reason() {
            Some(reason) => {
                self.protocol_abort(Violation::new(reason, e.to_string()));
                ReceivePduSnafu.into_error(e)
            }
            None => {
                self.fire_with(Event::TransportClosed, |_| {
                    Some(ConnectionClosedSnafu.build())
                });
                self.close_transport();
                ReceivePduSnafu.into_error(e)
            }
        }
    }

    /// Wait for the association request and answer it.
    fn await_request<F>(&self, decoder: &mut PduDecoder<TcpStream>, decide: F) -> Result<()>
    where
        F: FnOnce(&AssociationRQ) -> std::result::Result<AssociationAC, AssociationRJ>,
    {
        {
            let mut shared = self.lock();
            if self.fire(&mut shared, Event::TransportIndication).is_none() {
                return Err(shared.state_error());
            }
        }

        // ARTIM
        self.inner
            .socket
            .set_read_timeout(self.inner.options.accept_timeout)
            .context(SetupSocketSnafu)?;
        let pdu = match decoder.read_pdu() {
            Ok(pdu) => pdu,
            Err(e) if e.is_timeout() => {
                warn!("No association request in time");
                self.fire_with(Event::ArtimExpired, |_| {
                    Some(
                        TimeoutSnafu {
                            what: "the association request",
                        }
                        .build(),
                    )
                });
                self.close_transport();
                return TimeoutSnafu {
                    what: "the association request",
                }
                .fail();
            }
            Err(e) => return Err(self.on_negotiation_read_error(e)),
        };
        self.inner
            .socket
            .set_read_timeout(None)
            .context(SetupSocketSnafu)?;
        debug!("Received {}", pdu.short_description());

        let rq = match pdu {
            Pdu::AssociationRQ(rq) => {
                let mut shared = self.lock();
                self.fire(&mut shared, Event::AssociateRqReceived);
                rq
            }
            Pdu::AbortRQ { source } => {
                self.fire_with(Event::AbortReceived, |_| {
                    Some(AbortedSnafu { abort_source: source }.build())
                });
                self.close_transport();
                return AbortedSnafu { abort_source: source }.fail();
            }
            pdu => {
                let reason = unexpected_pdu_reason(&pdu);
                self.protocol_abort(Violation::new(
                    reason,
                    format!("{} while awaiting the association request", pdu.short_description()),
                ));
                return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
            }
        };

        match decide(&rq) {
            Ok(ac) => {
                {
                    let mut shared = self.lock();
                    shared.negotiated = Negotiated::new(Role::Acceptor, &rq, &ac);
                    shared.last_activity = Instant::now();
                    self.fire(&mut shared, Event::AssociateAccept);
                }
                if let Err(e) = self.send_pdu(&Pdu::AssociationAC(ac)) {
                    return Err(self.io_failure(e));
                }
                info!(
                    "Association with {} established ({} -> {})",
                    rq.calling_ae_title, rq.calling_ae_title, rq.called_ae_title
                );
                Ok(())
            }
            Err(association_rj) => {
                info!(
                    "Association request from {} rejected: {}",
                    rq.calling_ae_title, association_rj.source
                );
                let rejected = || RejectedSnafu {
                    association_rj: association_rj.clone(),
                };
                self.fire_with(Event::AssociateReject, |_| Some(rejected().build()));
                if let Err(e) = self.send_pdu(&Pdu::AssociationRJ(association_rj.clone())) {
                    debug!("Could not send A-ASSOCIATE-RJ: {}", e);
                }
                self.await_peer_close(decoder);
                rejected().fail()
            }
        }
    }

    /// Give the peer some time to close the connection, then close it.
    fn await_peer_close(&self, decoder: &mut PduDecoder<TcpStream>) {
        let delay = self.inner.options.socket_close_delay;
        if delay > Duration::from_secs(0) && self.inner.socket.set_read_timeout(Some(delay)).is_ok() {
            // anything but the connection closing is ignored here
            let _ = decoder.read_pdu();
        }
        self.close_transport();
    }

    /// Start the reader thread and the idle reaper.
    fn start(&self, decoder: PduDecoder<TcpStream>) -> Result<()> {
        let association = self.clone();
        let spawned = thread::Builder::new()
            .name("dicom-association".to_string())
            .spawn(move || association.read_loop(decoder));
        if let Err(e) = spawned {
            let e = SpawnThreadSnafu.into_error(e);
            return Err(self.io_failure(e));
        }

        let association = self.clone();
        let period = self.inner.options.idle_check_period;
        let spawned = thread::Builder::new()
            .name("dicom-association-reaper".to_string())
            .spawn(move || association.reap_idle(period));
        if let Err(e) = spawned {
            let e = SpawnThreadSnafu.into_error(e);
            return Err(self.io_failure(e));
        }
        Ok(())
    }

    fn reap_idle(&self, period: Duration) {
        loop {
            let shared = self.lock();
            let (shared, _) = self
                .inner
                .changed
                .wait_timeout_while(shared, period, |s| !s.is_closing())
                .unwrap_or_else(PoisonError::into_inner);
            if shared.is_closing() {
                break;
            }
            drop(shared);
            if let Err(e) = self.check_idle(Instant::now()) {
                debug!("Idle check failed: {}", e);
            }
        }
    }

    // ---- reader thread ----

    fn read_loop(&self, mut decoder: PduDecoder<TcpStream>) {
        let mut reception = Reception::default();
        loop {
            let header = match decoder.next_header() {
                Ok(header) => header,
                Err(e) => {
                    self.on_read_error(e);
                    return;
                }
            };

            let outcome = if header.pdu_type == 0x04 {
                self.on_pdata(&mut decoder, &mut reception)
            } else {
                match decoder.finish_pdu() {
                    Ok(pdu) => self.on_pdu(pdu),
                    Err(e) => {
                        self.on_read_error(e);
                        return;
                    }
                }
            };

            match outcome {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return,
                Err(violation) => {
                    self.protocol_abort(violation);
                    return;
                }
            }
        }
    }

    fn on_read_error(&self, e: crate::pdu::reader::Error) {
        if let Some(reason) = e.abort_reason() {
            self.protocol_abort(Violation::new(reason, e.to_string()));
            return;
        }
        if !self.inner.closed.load(Ordering::SeqCst)
            && !matches!(e, crate::pdu::reader::Error::NoPduAvailable { .. })
        {
            error!("Failed to read from the peer: {}", e);
            let mut shared = self.lock();
            if !shared.is_closing() && shared.error.is_none() {
                shared.error = Some(Arc::new(ReceivePduSnafu.into_error(e)));
            }
        }
        self.on_transport_closed();
    }

    fn on_transport_closed(&self) {
        let (action, _) = self.fire_with(Event::TransportClosed, |action| match action {
            Action::Aa4 | Action::Aa5 => Some(ConnectionClosedSnafu.build()),
            _ => None,
        });
        if matches!(action, Some(Action::Aa4)) {
            warn!("Connection closed by the peer");
        }
        self.close_transport();
    }

    fn on_pdu(&self, pdu: Pdu) -> Result<Flow, Violation> {
        debug!("Received {}", pdu.short_description());
        let event = match &pdu {
            Pdu::AssociationRQ(_) => Event::AssociateRqReceived,
            Pdu::AssociationAC(_) => Event::AssociateAcReceived,
            Pdu::AssociationRJ(_) => Event::AssociateRjReceived,
            Pdu::PData { .. } => Event::PDataReceived,
            Pdu::ReleaseRQ => Event::ReleaseRqReceived,
            Pdu::ReleaseRP => Event::ReleaseRpReceived,
            Pdu::AbortRQ { .. } => Event::AbortReceived,
            Pdu::Unknown { .. } => Event::InvalidPduReceived,
        };

        let (action, state) = self.fire_with(event, |action| match (action, &pdu) {
            (Action::Aa3, Pdu::AbortRQ { source }) => Some(
                AbortedSnafu {
                    abort_source: *source,
                }
                .build(),
            ),
            (Action::Aa8, pdu) => Some(
                UnexpectedPduSnafu {
                    pdu: Box::new(pdu.clone()),
                }
                .build(),
            ),
            _ => None,
        });

        match action {
            Some(Action::Aa8) => {
                warn!("Unexpected {}, aborting association", pdu.short_description());
                self.send_abort(AbortRQSource::ServiceProvider(unexpected_pdu_reason(&pdu)));
                self.close_after_delay();
                Ok(Flow::Stop)
            }
            Some(Action::Aa7) => {
                self.send_abort(AbortRQSource::ServiceProvider(unexpected_pdu_reason(&pdu)));
                Ok(Flow::Continue)
            }
            Some(Action::Aa3) => {
                if let Pdu::AbortRQ { source } = &pdu {
                    warn!("Association aborted by the peer ({})", source);
                }
                self.close_transport();
                Ok(Flow::Stop)
            }
            Some(Action::Aa2) => {
                self.close_transport();
                Ok(Flow::Stop)
            }
            Some(Action::Ar2) => Ok(self.on_release_requested()),
            Some(Action::Ar8) => {
                debug!("Release collision");
                if state == State::Sta9 {
                    self.send_release_response();
                }
                Ok(Flow::Continue)
            }
            Some(Action::Ar10) => {
                self.send_release_response();
                Ok(Flow::Continue)
            }
            Some(Action::Ar3) => {
                info!("Association released");
                self.close_transport();
                Ok(Flow::Stop)
            }
            _ => Ok(Flow::Continue),
        }
    }

    /// The peer asked for release (`Sta8`):
    /// answer once all operations being performed are done.
    fn on_release_requested(&self) -> Flow {
        info!("Association release requested by the peer");
        let deadline = self
            .inner
            .options
            .release_timeout
            .map(|t| Instant::now() + t);
        let mut shared = self.lock();
        while shared.state == State::Sta8 && shared.performing > 0 {
            let (guard, timed_out) = self.wait_until(shared, deadline);
            shared = guard;
            if timed_out {
                drop(shared);
                warn!("Operations still in progress on release, aborting association");
                if let Err(e) = self.user_abort(
                    TimeoutSnafu {
                        what: "operations in progress to finish",
                    }
                    .build(),
                ) {
                    debug!("{}", e);
                }
                return Flow::Stop;
            }
        }
        let releasing = shared.state == State::Sta8;
        drop(shared);
        if releasing {
            self.send_release_response();
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    fn send_release_response(&self) {
        let action = {
            let mut shared = self.lock();
            self.fire(&mut shared, Event::ReleaseResponse)
        };
        match action {
            Some(Action::Ar4) => {
                if let Err(e) = self.send_pdu(&Pdu::ReleaseRP) {
                    debug!("Could not send A-RELEASE-RP: {}", e);
                }
                info!("Association released");
                self.close_after_delay();
            }
            Some(Action::Ar9) => {
                if let Err(e) = self.send_pdu(&Pdu::ReleaseRP) {
                    self.io_failure(e);
                }
            }
            _ => {}
        }
    }

    fn on_pdata(
        &self,
        decoder: &mut PduDecoder<TcpStream>,
        reception: &mut Reception,
    ) -> Result<Flow, Violation> {
        let (action, _) = self.fire_with(Event::PDataReceived, |action| match action {
            Action::Aa8 => Some(
                ProtocolViolationSnafu {
                    reason: AbortRQServiceProviderReason::UnexpectedPdu,
                    detail: "P-DATA-TF outside of data transfer",
                }
                .build(),
            ),
            _ => None,
        });
        match action {
            Some(Action::Dt2) | Some(Action::Ar6) => {}
            Some(Action::Aa8) => {
                warn!("Unexpected P-DATA-TF, aborting association");
                self.send_abort(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPdu,
                ));
                self.close_after_delay();
                return Ok(Flow::Stop);
            }
            _ => return Ok(Flow::Continue),
        }
        self.touch();

        loop {
            let pdv = match decoder.next_pdv() {
                Ok(Some(pdv)) => pdv,
                Ok(None) => return Ok(Flow::Continue),
                Err(e) => {
                    let reason = e
                        .abort_reason()
                        .unwrap_or(AbortRQServiceProviderReason::InvalidPduParameter);
                    return Err(Violation::new(reason, e.to_string()));
                }
            };
            trace!(
                "PDV on context {}: {:?}, {} bytes, last: {}",
                pdv.presentation_context_id,
                pdv.value_type,
                pdv.data.len(),
                pdv.is_last
            );

            let fragment = reception.assembler.push(pdv).map_err(|e| {
                Violation::new(AbortRQServiceProviderReason::UnexpectedPduParameter, e.to_string())
            })?;
            match fragment {
                None => {}
                Some(Fragment::Command {
                    presentation_context_id,
                    data,
                }) => {
                    let command = Command::decode(&data).map_err(|e| {
                        Violation::new(
                            AbortRQServiceProviderReason::InvalidPduParameter,
                            format!("invalid command set: {}", e),
                        )
                    })?;
                    if command.has_data_set() {
                        reception.assembler.expect_data_set(presentation_context_id);
                        reception.command = Some(command);
                    } else {
                        self.on_message(presentation_context_id, command, None)?;
                    }
                }
                Some(Fragment::DataSet {
                    presentation_context_id,
                    data,
                }) => {
                    let command = reception.command.take().ok_or_else(|| {
                        Violation::new(
                            AbortRQServiceProviderReason::UnexpectedPduParameter,
                            "data set without a command",
                        )
                    })?;
                    self.on_message(presentation_context_id, command, Some(data))?;
                }
            }
        }
    }

    /// Handle one whole DIMSE message.
    fn on_message(
        &self,
        presentation_context_id: u8,
        command: Command,
        data: Option<Vec<u8>>,
    ) -> Result<(), Violation> {
        let pc = self
            .lock()
            .negotiated
            .accepted(presentation_context_id)
            .cloned()
            .ok_or_else(|| {
                Violation::new(
                    AbortRQServiceProviderReason::UnexpectedPduParameter,
                    format!(
                        "message on presentation context {} which is not accepted",
                        presentation_context_id
                    ),
                )
            })?;
        let data = data.map(|bytes| IncomingData::new(bytes, pc.transfer_syntax));

        match command.dimse() {
            Some((_, true)) => self.on_response(command, data),
            Some((Dimse::CCancel, false)) => {
                self.on_cancel(&command);
                Ok(())
            }
            _ => {
                self.on_request(presentation_context_id, command, data);
                Ok(())
            }
        }
    }

    fn on_response(&self, command: Command, data: Option<IncomingData>) -> Result<(), Violation> {
        let message_id = command.message_id_being_responded_to().map_err(|e| {
            Violation::new(AbortRQServiceProviderReason::InvalidPduParameter, e.to_string())
        })?;
        let pending = command.status().map(status::is_pending).unwrap_or(false);
        let now = Instant::now();

        let handler = {
            let mut shared = self.lock();
            shared.last_activity = now;
            shared.pending.take_handler(message_id, pending, now)
        };
        let mut handler = handler.ok_or_else(|| {
            Violation::new(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
                format!("response to unknown message ID {}", message_id),
            )
        })?;
        debug!(
            "Response to message {} (status {:#06x})",
            message_id,
            command.status().unwrap_or(0)
        );
        handler.on_response(DimseResponse { command, data });

        let mut shared = self.lock();
        if pending {
            shared.pending.restore_handler(message_id, handler);
        } else {
            shared.pending.remove(message_id);
            self.inner.changed.notify_all();
            drop(shared);
            drop(handler);
        }
        Ok(())
    }

    fn on_cancel(&self, command: &Command) {
        let message_id = match command.message_id_being_responded_to() {
            Ok(id) => id,
            Err(e) => {
                warn!("Ignoring C-CANCEL-RQ: {}", e);
                return;
            }
        };
        let handler = self.lock().cancel_handlers.remove(&message_id);
        match handler {
            Some(mut handler) => {
                debug!("Cancelling operation {}", message_id);
                handler.on_cancel(message_id);
            }
            None => debug!("C-CANCEL-RQ for message {} which cannot be cancelled", message_id),
        }
    }

    fn on_request(&self, presentation_context_id: u8, command: Command, data: Option<IncomingData>) {
        let permitted = {
            let mut shared = self.lock();
            shared.performing += 1;
            let limit = shared.negotiated.max_ops_performed as usize;
            if limit != 0 && shared.performing > limit {
                warn!(
                    "Peer exceeded the number of operations to perform at once ({})",
                    limit
                );
            }
            let negotiated = &shared.negotiated;
            let permitted = match (command.dimse(), negotiated.accepted(presentation_context_id)) {
                (Some((dimse, false)), Some(pc)) => {
                    negotiated.may_perform(self.inner.role, &pc.abstract_syntax, dimse)
                }
                _ => true,
            };
            permitted
        };
        let registry = Arc::clone(&self.inner.registry);
        if permitted {
            registry.dispatch(self, presentation_context_id, command, data);
        } else {
            warn!(
                "Peer is not the SCU of presentation context {}, refusing request",
                presentation_context_id
            );
            registry.refuse(
                self,
                presentation_context_id,
                &command,
                ServiceError::new(status::NOT_AUTHORIZED).with_comment("SCU role not negotiated"),
            );
        }
    }

    // ---- public operations ----

    /// The current state of the association.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Whether this node requested or accepted the association.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// The application entity title of the peer.
    pub fn peer_ae_title(&self) -> String {
        self.lock().negotiated.peer_ae_title.clone()
    }

    /// All presentation contexts answered on negotiation,
    /// including those which were rejected.
    pub fn presentation_contexts(&self) -> Vec<PresentationContextNegotiated> {
        self.lock().negotiated.presentation_contexts.clone()
    }

    /// The accepted presentation context with the given ID.
    pub fn presentation_context(&self, id: u8) -> Option<PresentationContextNegotiated> {
        self.lock().negotiated.accepted(id).cloned()
    }

    /// Find an accepted presentation context for the given abstract syntax,
    /// optionally requiring a specific transfer syntax.
    pub fn presentation_context_for(
        &self,
        abstract_syntax: &str,
        transfer_syntax: Option<&str>,
    ) -> Option<PresentationContextNegotiated> {
        let abstract_syntax = trim_uid(Cow::from(abstract_syntax));
        let transfer_syntax = transfer_syntax.map(|ts| trim_uid(Cow::from(ts)));
        self.lock()
            .negotiated
            .presentation_contexts
            .iter()
            .find(|pc| {
                pc.is_accepted()
                    && pc.abstract_syntax == abstract_syntax
                    && transfer_syntax
                        .as_ref()
                        .map_or(true, |ts| pc.transfer_syntax == *ts)
            })
            .cloned()
    }

    /// The SCU/SCP role selections in effect.
    pub fn role_selections(&self) -> Vec<RoleSelection> {
        self.lock().negotiated.role_selections.clone()
    }

    /// The user information sub-items which the peer sent on negotiation.
    pub fn peer_user_variables(&self) -> Vec<UserVariableItem> {
        self.lock().negotiated.peer_user_variables.clone()
    }

    /// The maximum PDU length which the peer admits.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.lock().negotiated.peer_max_pdu_length
    }

    /// The maximum number of outstanding requests
    /// which this node may invoke (0 for unlimited).
    pub fn max_ops_invoked(&self) -> u16 {
        self.lock().negotiated.max_ops_invoked
    }

    /// The maximum number of requests
    /// which this node may be asked to perform at once (0 for unlimited).
    pub fn max_ops_performed(&self) -> u16 {
        self.lock().negotiated.max_ops_performed
    }

    /// Reserve a message ID for a new request.
    pub fn next_message_id(&self) -> u16 {
        self.lock().allocate_message_id()
    }

    /// The number of requests still waiting for a final response.
    pub fn outstanding_requests(&self) -> usize {
        self.lock().pending.len()
    }

    /// The number of requests from the peer still being performed.
    pub fn operations_performing(&self) -> usize {
        self.lock().performing
    }

    /// The reason why the association ended, if it did not end gracefully.
    pub fn terminal_error(&self) -> Option<Arc<Error>> {
        self.lock().error.clone()
    }

    pub fn session_options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.socket.peer_addr()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Check that a message can be sent now
    /// and resolve its presentation context.
    fn prepare_send(&self, presentation_context_id: u8) -> Result<(PresentationContextNegotiated, u32)> {
        let mut shared = self.lock();
        if self.fire(&mut shared, Event::PDataRequest).is_none() {
            return Err(shared.state_error());
        }
        let pc = shared
            .negotiated
            .accepted(presentation_context_id)
            .cloned()
            .context(PresentationContextNotAcceptedSnafu {
                id: presentation_context_id,
            })?;
        shared.last_activity = Instant::now();
        Ok((pc, shared.negotiated.peer_max_pdu_length))
    }

    /// Write a command set and its data set in as many P-DATA-TF PDUs as needed.
    ///
    /// The encoder stays locked for the whole message,
    /// so that fragments of different messages are never interleaved.
    fn send_message(
        &self,
        pc: &PresentationContextNegotiated,
        command: &Command,
        data: Option<&dyn DataWriter>,
        max_pdu_length: u32,
    ) -> Result<()> {
        let command_bytes = command.encode().context(WriteMessageSnafu)?;
        let mut encoder = self
            .inner
            .encoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut writer = encoder.pdata_writer(pc.id, PDataValueType::Command, max_pdu_length);
        writer.write_all(&command_bytes).context(WirePDataSnafu)?;
        writer.finish().context(WirePDataSnafu)?;

        if let Some(data) = data {
            let mut writer = encoder.pdata_writer(pc.id, PDataValueType::Data, max_pdu_length);
            if let Err(e) = data.write_data(&mut writer, &pc.transfer_syntax) {
                writer.abandon();
                return Err(e).context(WriteMessageSnafu);
            }
            writer.finish().context(WirePDataSnafu)?;
        }
        Ok(())
    }

    /// Tear down the association after a message could not be sent whole.
    ///
    /// A message cut short by its data set source
    /// is followed by an A-ABORT,
    /// so that the peer never takes it for a complete one.
    fn message_failure(&self, e: Error) -> Error {
        if !matches!(e, Error::WriteMessage { .. }) {
            return self.io_failure(e);
        }
        warn!("Aborting the association: {}", e);
        let e = Arc::new(e);
        {
            let mut shared = self.lock();
            if shared.error.is_none() {
                shared.error = Some(Arc::clone(&e));
            }
        }
        if let Err(abort) = self.user_abort(AbortedLocallySnafu.build()) {
            debug!("Could not send A-ABORT: {}", abort);
        }
        ClosedSnafu.into_error(e)
    }

    /// Send a DIMSE request over an accepted presentation context.
    ///
    /// The request takes the message ID in its command set,
    /// or a newly reserved one if it is 0.
    /// Every response to it is passed to `handler`.
    /// If a response does not arrive within `timeout`
    /// (counting anew after each pending response),
    /// the whole association is aborted.
    ///
    /// When the maximum number of outstanding requests is reached,
    /// this blocks until one of them is answered with a final response.
    ///
    /// Returns the message ID of the request.
    pub fn invoke(
        &self,
        presentation_context_id: u8,
        mut command: Command,
        data: Option<&dyn DataWriter>,
        handler: Box<dyn DimseRspHandler>,
        timeout: Option<Duration>,
    ) -> Result<u16> {
        let (pc, max_pdu_length, message_id) = {
            let mut shared = self.lock();
            loop {
                if shared.state != State::Sta6 {
                    return Err(shared.state_error());
                }
                let limit = shared.negotiated.max_ops_invoked as usize;
                if limit == 0 || shared.pending.len() < limit {
                    break;
                }
                trace!("Waiting for a free slot to invoke a request");
                shared = self.wait(shared);
            }

            let pc = shared
                .negotiated
                .accepted(presentation_context_id)
                .cloned()
                .context(PresentationContextNotAcceptedSnafu {
                    id: presentation_context_id,
                })?;
            if let Some((dimse, false)) = command.dimse() {
                ensure!(
                    shared
                        .negotiated
                        .may_invoke(self.inner.role, &pc.abstract_syntax, dimse),
                    RoleNotNegotiatedSnafu {
                        dimse,
                        sop_class_uid: pc.abstract_syntax.clone(),
                    }
                );
            }
            let message_id = match command.message_id() {
                Ok(id) if id != 0 => id,
                _ => {
                    let id = shared.allocate_message_id();
                    command.set_message_id(id);
                    id
                }
            };
            ensure!(
                !shared.pending.contains(message_id),
                DuplicateMessageIdSnafu { message_id }
            );
            let now = Instant::now();
            shared.pending.insert(message_id, handler, timeout, now);
            shared.last_activity = now;
            self.fire(&mut shared, Event::PDataRequest);
            (pc, shared.negotiated.peer_max_pdu_length, message_id)
        };

        debug!(
            "Invoking message {} on presentation context {}",
            message_id, pc.id
        );
        if let Err(e) = self.send_message(&pc, &command, data, max_pdu_length) {
            return Err(self.message_failure(e));
        }
        Ok(message_id)
    }

    fn send_request(
        &self,
        presentation_context_id: u8,
        command: Command,
        data: Option<&dyn DataWriter>,
        timeout: Option<Duration>,
    ) -> Result<DimseRsp> {
        let (sender, receiver) = mpsc::channel();
        let message_id = self.invoke(
            presentation_context_id,
            command,
            data,
            Box::new(ChannelRspHandler::new(sender)),
            timeout,
        )?;
        Ok(DimseRsp::new(message_id, receiver, self.clone()))
    }

    fn accepted_abstract_syntax(&self, presentation_context_id: u8) -> Result<String> {
        self.presentation_context(presentation_context_id)
            .map(|pc| pc.abstract_syntax)
            .context(PresentationContextNotAcceptedSnafu {
                id: presentation_context_id,
            })
    }

    /// Send a C-ECHO request.
    pub fn cecho(&self, presentation_context_id: u8) -> Result<DimseRsp> {
        let sop_class_uid = self.accepted_abstract_syntax(presentation_context_id)?;
        let command = Command::request(Dimse::CEcho, &sop_class_uid, None, false);
        let timeout = self.inner.options.response_timeout;
        self.send_request(presentation_context_id, command, None, timeout)
    }

    /// Send a C-STORE request for one SOP instance.
    ///
    /// The SOP class is the abstract syntax of the presentation context.
    pub fn cstore(
        &self,
        presentation_context_id: u8,
        sop_instance_uid: &str,
        data: &dyn DataWriter,
        priority: Priority,
    ) -> Result<DimseRsp> {
        let sop_class_uid = self.accepted_abstract_syntax(presentation_context_id)?;
        let command = Command::request(Dimse::CStore, &sop_class_uid, Some(sop_instance_uid), true)
            .with_priority(priority);
        let timeout = self.inner.options.response_timeout;
        self.send_request(presentation_context_id, command, Some(data), timeout)
    }

    /// Send a C-FIND request with the given identifier.
    pub fn cfind(
        &self,
        presentation_context_id: u8,
        identifier: &dyn DataWriter,
        priority: Priority,
    ) -> Result<DimseRsp> {
        let sop_class_uid = self.accepted_abstract_syntax(presentation_context_id)?;
        let command =
            Command::request(Dimse::CFind, &sop_class_uid, None, true).with_priority(priority);
        let timeout = self.inner.options.response_timeout;
        self.send_request(presentation_context_id, command, Some(identifier), timeout)
    }

    /// Send a C-GET request with the given identifier.
    ///
    /// The instances retrieved arrive as C-STORE requests on this association,
    /// dispatched to the service registry.
    pub fn cget(
        &self,
        presentation_context_id: u8,
        identifier: &dyn DataWriter,
        priority: Priority,
    ) -> Result<DimseRsp> {
        let sop_class_uid = self.accepted_abstract_syntax(presentation_context_id)?;
        let command =
            Command::request(Dimse::CGet, &sop_class_uid, None, true).with_priority(priority);
        let timeout = self.inner.options.retrieve_timeout;
        self.send_request(presentation_context_id, command, Some(identifier), timeout)
    }

    /// Send a C-MOVE request with the given identifier.
    pub fn cmove(
        &self,
        presentation_context_id: u8,
        move_destination: &str,
        identifier: &dyn DataWriter,
        priority: Priority,
    ) -> Result<DimseRsp> {
        let sop_class_uid = self.accepted_abstract_syntax(presentation_context_id)?;
        let command = Command::request(Dimse::CMove, &sop_class_uid, None, true)
            .with_priority(priority)
            .with_text(tags::MOVE_DESTINATION, VR::AE, move_destination);
        let timeout = self.inner.options.retrieve_timeout;
        self.send_request(presentation_context_id, command, Some(identifier), timeout)
    }

    /// Send a C-CANCEL request for an outstanding C-FIND, C-GET or C-MOVE.
    ///
    /// The operation ends when its final response arrives,
    /// usually with the _Cancel_ status.
    pub fn ccancel(&self, presentation_context_id: u8, message_id: u16) -> Result<()> {
        let (pc, max_pdu_length) = self.prepare_send(presentation_context_id)?;
        debug!("Cancelling message {}", message_id);
        if let Err(e) = self.send_message(&pc, &Command::cancel(message_id), None, max_pdu_length) {
            return Err(self.message_failure(e));
        }
        Ok(())
    }

    /// Send an N-CREATE request.
    pub fn ncreate(
        &self,
        presentation_context_id: u8,
        sop_class_uid: &str,
        sop_instance_uid: Option<&str>,
        attributes: Option<&dyn DataWriter>,
    ) -> Result<DimseRsp> {
        let command = Command::request(
            Dimse::NCreate,
            sop_class_uid,
            sop_instance_uid,
            attributes.is_some(),
        );
        let timeout = self.inner.options.response_timeout;
        self.send_request(presentation_context_id, command, attributes, timeout)
    }

    /// Send an N-SET request.
    pub fn nset(
        &self,
        presentation_context_id: u8,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        modifications: &dyn DataWriter,
    ) -> Result<DimseRsp> {
        let command = Command::request(Dimse::NSet, sop_class_uid, Some(sop_instance_uid), true);
        let timeout = self.inner.options.response_timeout;
        self.send_request(presentation_context_id, command, Some(modifications), timeout)
    }

    /// Send an N-GET request for all attributes of a SOP instance.
    pub fn nget(
        &self,
        presentation_context_id: u8,
        sop_class_uid: &str,
        sop_instance_uid: &str,
    ) -> Result<DimseRsp> {
        let command = Command::request(Dimse::NGet, sop_class_uid, Some(sop_instance_uid), false);
        let timeout = self.inner.options.response_timeout;
        self.send_request(presentation_context_id, command, None, timeout)
    }

    /// Send an N-ACTION request.
    pub fn naction(
        &self,
        presentation_context_id: u8,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        action_type_id: u16,
        information: Option<&dyn DataWriter>,
    ) -> Result<DimseRsp> {
        let command = Command::request(
            Dimse::NAction,
            sop_class_uid,
            Some(sop_instance_uid),
            information.is_some(),
        )
        .with_u16(tags::ACTION_TYPE_ID, action_type_id);
        let timeout = self.inner.options.response_timeout;
        self.send_request(presentation_context_id, command, information, timeout)
    }

    /// Send an N-DELETE request.
    pub fn ndelete(
        &self,
        presentation_context_id: u8,
        sop_class_uid: &str,
        sop_instance_uid: &str,
    ) -> Result<DimseRsp> {
        let command =
            Command::request(Dimse::NDelete, sop_class_uid, Some(sop_instance_uid), false);
        let timeout = self.inner.options.response_timeout;
        self.send_request(presentation_context_id, command, None, timeout)
    }

    /// Send an N-EVENT-REPORT request.
    pub fn nevent_report(
        &self,
        presentation_context_id: u8,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        event_type_id: u16,
        information: Option<&dyn DataWriter>,
    ) -> Result<DimseRsp> {
        let command = Command::request(
            Dimse::NEventReport,
            sop_class_uid,
            Some(sop_instance_uid),
            information.is_some(),
        )
        .with_u16(tags::EVENT_TYPE_ID, event_type_id);
        let timeout = self.inner.options.response_timeout;
        self.send_request(presentation_context_id, command, information, timeout)
    }

    /// Send a DIMSE response to a request from the peer.
    ///
    /// A final response (one without a pending status)
    /// concludes the operation being performed.
    pub fn write_response(
        &self,
        presentation_context_id: u8,
        command: &Command,
        data: Option<&dyn DataWriter>,
    ) -> Result<()> {
        ensure!(command.is_response(), NotAResponseSnafu);
        let is_final = !command.status().map(status::is_pending).unwrap_or(false);

        let sent = self
            .prepare_send(presentation_context_id)
            .and_then(|(pc, max_pdu_length)| {
                self.send_message(&pc, command, data, max_pdu_length)
                    .map_err(|e| self.message_failure(e))
            });

        if is_final {
            self.operation_done();
        }
        sent
    }

    /// Conclude an operation being performed by this node.
    pub(crate) fn operation_done(&self) {
        let mut shared = self.lock();
        shared.performing = shared.performing.saturating_sub(1);
        self.inner.changed.notify_all();
    }

    /// Register a handler for C-CANCEL requests
    /// concerning the operation with the given message ID.
    pub fn add_cancel_handler<H>(&self, message_id: u16, handler: H)
    where
        H: CancelRqHandler + 'static,
    {
        self.lock()
            .cancel_handlers
            .insert(message_id, Box::new(handler));
    }

    /// Remove the handler for C-CANCEL requests, if still registered.
    pub fn remove_cancel_handler(&self, message_id: u16) -> bool {
        self.lock().cancel_handlers.remove(&message_id).is_some()
    }

    /// Block until every outstanding request has its final response.
    pub fn wait_for_outstanding_responses(&self) -> Result<()> {
        let mut shared = self.lock();
        loop {
            if shared.is_closing() {
                return match &shared.error {
                    Some(e) => Err(ClosedSnafu.into_error(Arc::clone(e))),
                    None => Ok(()),
                };
            }
            if shared.pending.is_empty() {
                return Ok(());
            }
            shared = self.wait(shared);
        }
    }

    /// Block until the connection is closed.
    ///
    /// Returns the reason why the association ended,
    /// if it did not end gracefully.
    pub fn wait_for_socket_close(&self) -> Result<()> {
        let mut shared = self.lock();
        while shared.state != State::Sta1 {
            shared = self.wait(shared);
        }
        match &shared.error {
            Some(e) => Err(ClosedSnafu.into_error(Arc::clone(e))),
            None => Ok(()),
        }
    }

    /// Release the association gracefully.
    ///
    /// If `wait_for_pending_responses` is set,
    /// outstanding requests are given their final responses first.
    /// Blocks until the release is confirmed
    /// or the release timeout passes,
    /// in which case the association is aborted.
    pub fn release(&self, wait_for_pending_responses: bool) -> Result<()> {
        if wait_for_pending_responses {
            self.wait_for_outstanding_responses()?;
        }

        {
            let mut shared = self.lock();
            if self.fire(&mut shared, Event::ReleaseRequest).is_none() {
                return Err(shared.state_error());
            }
        }
        info!("Releasing association");
        if let Err(e) = self.send_pdu(&Pdu::ReleaseRQ) {
            return Err(self.io_failure(e));
        }

        let deadline = self
            .inner
            .options
            .release_timeout
            .map(|t| Instant::now() + t);
        let mut shared = self.lock();
        while !shared.is_closing() {
            let (guard, timed_out) = self.wait_until(shared, deadline);
            shared = guard;
            if timed_out {
                drop(shared);
                warn!("No release response in time, aborting association");
                self.user_abort(
                    TimeoutSnafu {
                        what: "the release response",
                    }
                    .build(),
                )?;
                return TimeoutSnafu {
                    what: "the release response",
                }
                .fail();
            }
        }
        match &shared.error {
            Some(e) => Err(ClosedSnafu.into_error(Arc::clone(e))),
            None => Ok(()),
        }
    }

    /// Abort the association immediately.
    ///
    /// Outstanding requests end with an error.
    /// Aborting an association which is already closing does nothing.
    pub fn abort(&self) -> Result<()> {
        warn!("Aborting association");
        self.user_abort(AbortedLocallySnafu.build())
    }

    /// Abort the association if a response is overdue,
    /// or release it if it has been idle for longer than the idle timeout.
    ///
    /// Called periodically by the association itself.
    pub fn check_idle(&self, now: Instant) -> Result<IdleCheck> {
        let overdue = {
            let shared = self.lock();
            if shared.state != State::Sta6 {
                return Ok(IdleCheck::NotReady);
            }
            match shared.pending.expired(now) {
                Some(message_id) => Some(message_id),
                None => {
                    let idle = shared.pending.is_empty()
                        && shared.performing == 0
                        && self
                            .inner
                            .options
                            .idle_timeout
                            .map_or(false, |t| now >= shared.last_activity + t);
                    if !idle {
                        return Ok(IdleCheck::Active);
                    }
                    None
                }
            }
        };

        match overdue {
            Some(message_id) => {
                warn!("No response to message {} in time, aborting association", message_id);
                self.user_abort(ResponseTimeoutSnafu { message_id }.build())?;
                Ok(IdleCheck::Aborted { message_id })
            }
            None => {
                info!("Association idle for too long");
                self.release(false)?;
                Ok(IdleCheck::Released)
            }
        }
    }
}

/// The abort reason for a PDU that cannot be received in the current state.
fn unexpected_pdu_reason(pdu: &Pdu) -> AbortRQServiceProviderReason {
    match pdu {
        Pdu::Unknown { .. } => AbortRQServiceProviderReason::UnrecognizedPdu,
        _ => AbortRQServiceProviderReason::UnexpectedPdu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{PresentationContextProposed, PresentationContextResult};

    #[test]
    fn operation_limits_treat_zero_as_unlimited() {
        assert_eq!(min_ops(0, 0), 0);
        assert_eq!(min_ops(0, 5), 5);
        assert_eq!(min_ops(3, 0), 3);
        assert_eq!(min_ops(3, 5), 3);
    }

    #[test]
    fn window_only_proposed_when_not_default() {
        assert_eq!(SessionOptions::default().proposed_window(), None);
        let options = SessionOptions::default().max_ops_invoked(4);
        assert_eq!(
            options.proposed_window(),
            Some(AsyncOperationsWindow {
                max_operations_invoked: 4,
                max_operations_performed: 1,
            })
        );
    }

    #[test]
    fn granted_window_is_mirrored() {
        // this acceptor invokes up to 2 and performs up to 8
        let options = SessionOptions::default()
            .max_ops_invoked(2)
            .max_ops_performed(8);
        let granted = options.granted_window(AsyncOperationsWindow {
            max_operations_invoked: 0,
            max_operations_performed: 5,
        });
        assert_eq!(
            granted,
            AsyncOperationsWindow {
                max_operations_invoked: 8,
                max_operations_performed: 2,
            }
        );
    }

    #[test]
    fn roles_follow_role_selection() {
        let negotiated = Negotiated {
            role_selections: vec![RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                scu_role: false,
                scp_role: true,
            }],
            ..Negotiated::default()
        };
        let ct = "1.2.840.10008.5.1.4.1.1.2";
        let printer = "1.2.840.10008.5.1.1.16";

        // the requestor of a C-GET takes the storage SCP role only
        assert!(!negotiated.may_invoke(Role::Requestor, ct, Dimse::CStore));
        assert!(negotiated.may_perform(Role::Requestor, ct, Dimse::CStore));
        assert!(negotiated.may_invoke(Role::Acceptor, ct, Dimse::CStore));
        assert!(!negotiated.may_perform(Role::Acceptor, ct, Dimse::CStore));

        // default roles without a selection
        assert!(negotiated.may_invoke(Role::Requestor, printer, Dimse::NGet));
        assert!(!negotiated.may_invoke(Role::Acceptor, printer, Dimse::NGet));
        assert!(negotiated.may_invoke(Role::Acceptor, printer, Dimse::NEventReport));
        assert!(negotiated.may_perform(Role::Requestor, printer, Dimse::NEventReport));
    }

    fn exchange(window: Option<AsyncOperationsWindow>) -> (AssociationRQ, AssociationAC) {
        let rq = AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: "STORE-SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![
                PresentationContextProposed {
                    id: 1,
                    abstract_syntax: "1.2.840.10008.1.1\0".to_string(),
                    transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
                },
                PresentationContextProposed {
                    id: 3,
                    abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                    transfer_syntaxes: vec!["1.2.840.10008.1.2.1".to_string()],
                },
            ],
            user_variables: vec![UserVariableItem::MaxLength(32768)],
        };
        let mut user_variables = vec![UserVariableItem::MaxLength(0)];
        if let Some(window) = window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow(window));
        }
        let ac = AssociationAC {
            protocol_version: 1,
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: "STORE-SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![
                PresentationContextResult {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: "1.2.840.10008.1.2\0".to_string(),
                },
                PresentationContextResult {
                    id: 3,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
                },
            ],
            user_variables,
        };
        (rq, ac)
    }

    #[test]
    fn negotiated_from_both_sides() {
        let (rq, ac) = exchange(Some(AsyncOperationsWindow {
            max_operations_invoked: 4,
            max_operations_performed: 2,
        }));

        let requestor = Negotiated::new(Role::Requestor, &rq, &ac);
        assert_eq!(requestor.peer_ae_title, "STORE-SCP");
        assert_eq!(requestor.peer_max_pdu_length, MAXIMUM_PDU_SIZE);
        assert_eq!(requestor.max_ops_invoked, 4);
        assert_eq!(requestor.max_ops_performed, 2);
        let pc = requestor.accepted(1).unwrap();
        assert_eq!(pc.abstract_syntax, "1.2.840.10008.1.1");
        assert_eq!(pc.transfer_syntax, "1.2.840.10008.1.2");
        assert!(requestor.accepted(3).is_none());
        assert_eq!(requestor.presentation_contexts.len(), 2);

        let acceptor = Negotiated::new(Role::Acceptor, &rq, &ac);
        assert_eq!(acceptor.peer_ae_title, "STORE-SCU");
        assert_eq!(acceptor.peer_max_pdu_length, 32768);
        assert_eq!(acceptor.max_ops_invoked, 2);
        assert_eq!(acceptor.max_ops_performed, 4);
    }

    #[test]
    fn no_window_means_one_operation_each_way() {
        let (rq, ac) = exchange(None);
        let negotiated = Negotiated::new(Role::Requestor, &rq, &ac);
        assert_eq!(negotiated.max_ops_invoked, 1);
        assert_eq!(negotiated.max_ops_performed, 1);
    }
}
