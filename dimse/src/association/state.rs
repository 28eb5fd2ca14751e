//! The upper layer state machine.
//!
//! [`transition`] implements the state transition table of the
//! DICOM upper layer protocol (PS3.8, section 9.2)
//! as a pure function of the current state, the event and the role
//! this node took when the association was set up.
//! The session object drives it with every PDU sent or received
//! and carries out the resulting [`Action`].
use std::fmt;

/// The states of an association.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    /// Idle
    Sta1,
    /// Transport connection open, awaiting A-ASSOCIATE-RQ PDU
    Sta2,
    /// Awaiting local A-ASSOCIATE response primitive
    Sta3,
    /// Awaiting transport connection opening to complete
    Sta4,
    /// Awaiting A-ASSOCIATE-AC or A-ASSOCIATE-RJ PDU
    Sta5,
    /// Association established and ready for data transfer
    Sta6,
    /// Awaiting A-RELEASE-RP PDU
    Sta7,
    /// Awaiting local A-RELEASE response primitive
    Sta8,
    /// Release collision requestor side: awaiting A-RELEASE response primitive
    Sta9,
    /// Release collision acceptor side: awaiting A-RELEASE-RP PDU
    Sta10,
    /// Release collision requestor side: awaiting A-RELEASE-RP PDU
    Sta11,
    /// Release collision acceptor side: awaiting A-RELEASE response primitive
    Sta12,
    /// Awaiting transport connection close indication
    Sta13,
}

impl State {
    pub const ALL: [State; 13] = [
        State::Sta1,
        State::Sta2,
        State::Sta3,
        State::Sta4,
        State::Sta5,
        State::Sta6,
        State::Sta7,
        State::Sta8,
        State::Sta9,
        State::Sta10,
        State::Sta11,
        State::Sta12,
        State::Sta13,
    ];

    /// Whether DIMSE messages may be received in this state.
    pub fn is_ready_for_data_transfer(self) -> bool {
        self == State::Sta6
    }

    /// Whether the association is being released
    /// but the node may still be sending P-DATA-TF PDUs.
    pub fn is_releasing(self) -> bool {
        matches!(
            self,
            State::Sta7 | State::Sta8 | State::Sta9 | State::Sta10 | State::Sta11 | State::Sta12
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = State::ALL.iter().position(|s| s == self).unwrap_or(0) + 1;
        write!(f, "Sta{}", n)
    }
}

/// The role this node took on association setup.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// the node requested the association
    Requestor,
    /// the node accepted an association request
    Acceptor,
}

/// Events of the upper layer state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    /// Evt1: A-ASSOCIATE request (local user)
    AssociateRequest,
    /// Evt2: transport connection confirm
    TransportConfirm,
    /// Evt3: A-ASSOCIATE-AC PDU received
    AssociateAcReceived,
    /// Evt4: A-ASSOCIATE-RJ PDU received
    AssociateRjReceived,
    /// Evt5: transport connection indication
    TransportIndication,
    /// Evt6: A-ASSOCIATE-RQ PDU received
    AssociateRqReceived,
    /// Evt7: A-ASSOCIATE response primitive (accept)
    AssociateAccept,
    /// Evt8: A-ASSOCIATE response primitive (reject)
    AssociateReject,
    /// Evt9: P-DATA request primitive
    PDataRequest,
    /// Evt10: P-DATA-TF PDU received
    PDataReceived,
    /// Evt11: A-RELEASE request primitive
    ReleaseRequest,
    /// Evt12: A-RELEASE-RQ PDU received
    ReleaseRqReceived,
    /// Evt13: A-RELEASE-RP PDU received
    ReleaseRpReceived,
    /// Evt14: A-RELEASE response primitive
    ReleaseResponse,
    /// Evt15: A-ABORT request primitive
    AbortRequest,
    /// Evt16: A-ABORT PDU received
    AbortReceived,
    /// Evt17: transport connection closed indication
    TransportClosed,
    /// Evt18: ARTIM timer expired
    ArtimExpired,
    /// Evt19: unrecognized or invalid PDU received
    InvalidPduReceived,
}

impl Event {
    /// Whether the event is the reception of a PDU.
    pub fn is_pdu_received(self) -> bool {
        matches!(
            self,
            Event::AssociateAcReceived
                | Event::AssociateRjReceived
                | Event::AssociateRqReceived
                | Event::PDataReceived
                | Event::ReleaseRqReceived
                | Event::ReleaseRpReceived
                | Event::AbortReceived
                | Event::InvalidPduReceived
        )
    }
}

/// Actions of the upper layer state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    /// Issue transport connect request
    Ae1,
    /// Send A-ASSOCIATE-RQ PDU
    Ae2,
    /// Issue A-ASSOCIATE confirmation (accept)
    Ae3,
    /// Issue A-ASSOCIATE confirmation (reject) and close transport
    Ae4,
    /// Issue transport connection response, start ARTIM
    Ae5,
    /// Stop ARTIM and decide on the association request
    Ae6,
    /// Send A-ASSOCIATE-AC PDU
    Ae7,
    /// Send A-ASSOCIATE-RJ PDU and start ARTIM
    Ae8,
    /// Send P-DATA-TF PDU
    Dt1,
    /// Issue P-DATA indication
    Dt2,
    /// Send A-RELEASE-RQ PDU
    Ar1,
    /// Issue A-RELEASE indication
    Ar2,
    /// Issue A-RELEASE confirmation and close transport
    Ar3,
    /// Send A-RELEASE-RP PDU and start ARTIM
    Ar4,
    /// Stop ARTIM
    Ar5,
    /// Issue P-DATA indication while awaiting the release reply
    Ar6,
    /// Send P-DATA-TF PDU while the peer awaits the release reply
    Ar7,
    /// Issue A-RELEASE indication (release collision)
    Ar8,
    /// Send A-RELEASE-RP PDU (release collision, requestor)
    Ar9,
    /// Issue A-RELEASE confirmation (release collision, acceptor)
    Ar10,
    /// Send A-ABORT PDU and start ARTIM
    Aa1,
    /// Stop ARTIM if running and close transport
    Aa2,
    /// Issue A-ABORT or A-P-ABORT indication and close transport
    Aa3,
    /// Issue A-P-ABORT indication
    Aa4,
    /// Stop ARTIM
    Aa5,
    /// Ignore PDU
    Aa6,
    /// Send A-ABORT PDU
    Aa7,
    /// Send A-ABORT PDU (service provider source), issue A-P-ABORT indication
    /// and start ARTIM
    Aa8,
}

impl Action {
    /// Whether carrying out this action sends an A-ABORT PDU.
    pub fn sends_abort(self) -> bool {
        matches!(self, Action::Aa1 | Action::Aa7 | Action::Aa8)
    }

    /// Whether carrying out this action closes the transport connection.
    pub fn closes_transport(self) -> bool {
        matches!(
            self,
            Action::Ae4 | Action::Ar3 | Action::Aa2 | Action::Aa3 | Action::Aa4 | Action::Aa5
        )
    }
}

/// Determine the action to carry out and the next state
/// for an event occurring in the given state.
///
/// Returns `None` if the event cannot occur in that state,
/// which only happens for local primitives and transport events.
/// Received PDUs always lead to an action,
/// unexpected ones being answered with an abort.
///
/// The event [`Event::AssociateRqReceived`] in `Sta2`
/// leads to `Sta3`, where the local decision is awaited
/// ([`Event::AssociateAccept`] or [`Event::AssociateReject`]).
pub fn transition(state: State, event: Event, role: Role) -> Option<(Action, State)> {
    use Action::*;
    use Event::*;
    use State::*;

    let out = match (event, state) {
        // association establishment
        (AssociateRequest, Sta1) => (Ae1, Sta4),
        (TransportConfirm, Sta4) => (Ae2, Sta5),
        (AssociateAcReceived, Sta5) => (Ae3, Sta6),
        (AssociateRjReceived, Sta5) => (Ae4, Sta1),
        (TransportIndication, Sta1) => (Ae5, Sta2),
        (AssociateRqReceived, Sta2) => (Ae6, Sta3),
        (AssociateAccept, Sta3) => (Ae7, Sta6),
        (AssociateReject, Sta3) => (Ae8, Sta13),

        // data transfer
        (PDataRequest, Sta6) => (Dt1, Sta6),
        (PDataRequest, Sta8) => (Ar7, Sta8),
        (PDataReceived, Sta6) => (Dt2, Sta6),
        (PDataReceived, Sta7) => (Ar6, Sta7),

        // release
        (ReleaseRequest, Sta6) => (Ar1, Sta7),
        (ReleaseRqReceived, Sta6) => (Ar2, Sta8),
        (ReleaseRqReceived, Sta7) => match role {
            Role::Requestor => (Ar8, Sta9),
            Role::Acceptor => (Ar8, Sta10),
        },
        (ReleaseRpReceived, Sta7) | (ReleaseRpReceived, Sta11) => (Ar3, Sta1),
        (ReleaseRpReceived, Sta10) => (Ar10, Sta12),
        (ReleaseResponse, Sta8) | (ReleaseResponse, Sta12) => (Ar4, Sta13),
        (ReleaseResponse, Sta9) => (Ar9, Sta11),

        // abort requested by the local user
        (AbortRequest, Sta4) => (Aa2, Sta1),
        (AbortRequest, Sta3)
        | (AbortRequest, Sta5)
        | (AbortRequest, Sta6)
        | (AbortRequest, Sta7)
        | (AbortRequest, Sta8)
        | (AbortRequest, Sta9)
        | (AbortRequest, Sta10)
        | (AbortRequest, Sta11)
        | (AbortRequest, Sta12) => (Aa1, Sta13),

        // abort received
        (AbortReceived, Sta2) | (AbortReceived, Sta13) => (Aa2, Sta1),
        (AbortReceived, _) => (Aa3, Sta1),

        // transport events
        (TransportClosed, Sta2) => (Aa5, Sta1),
        (TransportClosed, Sta13) => (Ar5, Sta1),
        (TransportClosed, Sta1) => return None,
        (TransportClosed, _) => (Aa4, Sta1),
        (ArtimExpired, Sta2) | (ArtimExpired, Sta13) => (Aa2, Sta1),

        // unexpected PDUs, awaiting the association request
        (AssociateAcReceived, Sta2)
        | (AssociateRjReceived, Sta2)
        | (PDataReceived, Sta2)
        | (ReleaseRqReceived, Sta2)
        | (ReleaseRpReceived, Sta2)
        | (InvalidPduReceived, Sta2) => (Aa1, Sta13),

        // unexpected PDUs, awaiting transport close
        (AssociateRqReceived, Sta13) | (InvalidPduReceived, Sta13) => (Aa7, Sta13),
        (AssociateAcReceived, Sta13)
        | (AssociateRjReceived, Sta13)
        | (PDataReceived, Sta13)
        | (ReleaseRqReceived, Sta13)
        | (ReleaseRpReceived, Sta13) => (Aa6, Sta13),

        // any other PDU is unexpected
        (event, _) if event.is_pdu_received() => (Aa8, Sta13),

        _ => return None,
    };
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::VecDeque;

    const PDU_EVENTS: [Event; 8] = [
        Event::AssociateAcReceived,
        Event::AssociateRjReceived,
        Event::AssociateRqReceived,
        Event::PDataReceived,
        Event::ReleaseRqReceived,
        Event::ReleaseRpReceived,
        Event::AbortReceived,
        Event::InvalidPduReceived,
    ];

    #[test]
    fn received_pdus_are_handled_in_every_state() {
        for role in [Role::Requestor, Role::Acceptor] {
            for state in State::ALL {
                for event in PDU_EVENTS {
                    let (action, next) = transition(state, event, role).unwrap_or_else(|| {
                        panic!("no transition for {:?} in {}", event, state)
                    });
                    // either a documented transition or an abort
                    if action == Action::Aa8 {
                        assert_eq!(next, State::Sta13);
                    }
                }
            }
        }
    }

    #[rstest]
    #[case(State::Sta3, Event::PDataReceived)]
    #[case(State::Sta5, Event::ReleaseRqReceived)]
    #[case(State::Sta6, Event::AssociateRqReceived)]
    #[case(State::Sta6, Event::AssociateAcReceived)]
    #[case(State::Sta6, Event::ReleaseRpReceived)]
    #[case(State::Sta6, Event::InvalidPduReceived)]
    #[case(State::Sta8, Event::PDataReceived)]
    #[case(State::Sta12, Event::ReleaseRqReceived)]
    fn unexpected_pdus_are_aborted(#[case] state: State, #[case] event: Event) {
        assert_eq!(
            transition(state, event, Role::Acceptor),
            Some((Action::Aa8, State::Sta13))
        );
    }

    #[rstest]
    #[case(State::Sta1, Event::PDataRequest)]
    #[case(State::Sta2, Event::ReleaseRequest)]
    #[case(State::Sta7, Event::ReleaseRequest)]
    #[case(State::Sta13, Event::AbortRequest)]
    #[case(State::Sta6, Event::AssociateRequest)]
    #[case(State::Sta6, Event::ReleaseResponse)]
    fn local_primitives_in_wrong_state(#[case] state: State, #[case] event: Event) {
        assert_eq!(transition(state, event, Role::Requestor), None);
    }

    #[test]
    fn establishment_and_release() {
        // requestor
        let mut state = State::Sta1;
        for (event, action) in [
            (Event::AssociateRequest, Action::Ae1),
            (Event::TransportConfirm, Action::Ae2),
            (Event::AssociateAcReceived, Action::Ae3),
            (Event::PDataRequest, Action::Dt1),
            (Event::ReleaseRequest, Action::Ar1),
            (Event::PDataReceived, Action::Ar6),
            (Event::ReleaseRpReceived, Action::Ar3),
        ] {
            let (a, next) = transition(state, event, Role::Requestor).unwrap();
            assert_eq!(a, action);
            state = next;
        }
        assert_eq!(state, State::Sta1);

        // acceptor
        let mut state = State::Sta1;
        for (event, action) in [
            (Event::TransportIndication, Action::Ae5),
            (Event::AssociateRqReceived, Action::Ae6),
            (Event::AssociateAccept, Action::Ae7),
            (Event::PDataReceived, Action::Dt2),
            (Event::ReleaseRqReceived, Action::Ar2),
            (Event::PDataRequest, Action::Ar7),
            (Event::ReleaseResponse, Action::Ar4),
            (Event::TransportClosed, Action::Ar5),
        ] {
            let (a, next) = transition(state, event, Role::Acceptor).unwrap();
            assert_eq!(a, action);
            state = next;
        }
        assert_eq!(state, State::Sta1);
    }

    #[test]
    fn rejection() {
        let (action, state) =
            transition(State::Sta3, Event::AssociateReject, Role::Acceptor).unwrap();
        assert_eq!((action, state), (Action::Ae8, State::Sta13));
        let (action, state) =
            transition(State::Sta5, Event::AssociateRjReceived, Role::Requestor).unwrap();
        assert_eq!((action, state), (Action::Ae4, State::Sta1));
        assert!(action.closes_transport());
    }

    /// A simulated peer which answers primitives automatically,
    /// as the session does.
    struct Peer {
        role: Role,
        state: State,
        outbox: VecDeque<Event>,
    }

    impl Peer {
        fn new(role: Role) -> Self {
            Peer {
                role,
                state: State::Sta6,
                outbox: VecDeque::new(),
            }
        }

        fn apply(&mut self, event: Event) {
            let (action, next) = transition(self.state, event, self.role)
                .unwrap_or_else(|| panic!("{:?}: no transition for {:?} in {}", self.role, event, self.state));
            assert_ne!(action, Action::Aa8, "{:?} aborted in {}", self.role, self.state);
            self.state = next;
            match action {
                Action::Ar1 => self.outbox.push_back(Event::ReleaseRqReceived),
                Action::Ar4 | Action::Ar9 => self.outbox.push_back(Event::ReleaseRpReceived),
                _ => {}
            }
            // release responses are issued right away
            if matches!(self.state, State::Sta8 | State::Sta9 | State::Sta12) {
                self.apply(Event::ReleaseResponse);
            }
        }
    }

    fn run_collision(requestor_first: bool) -> (State, State) {
        let mut requestor = Peer::new(Role::Requestor);
        let mut acceptor = Peer::new(Role::Acceptor);
        requestor.apply(Event::ReleaseRequest);
        acceptor.apply(Event::ReleaseRequest);

        // deliver pending PDUs, one side first, until both outboxes drain
        let mut turn_requestor = requestor_first;
        for _ in 0..16 {
            if turn_requestor {
                if let Some(event) = acceptor.outbox.pop_front() {
                    requestor.apply(event);
                }
            } else if let Some(event) = requestor.outbox.pop_front() {
                acceptor.apply(event);
            }
            turn_requestor = !turn_requestor;
        }
        assert!(requestor.outbox.is_empty());
        assert!(acceptor.outbox.is_empty());
        (requestor.state, acceptor.state)
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn simultaneous_release_terminates(#[case] requestor_first: bool) {
        let (requestor, acceptor) = run_collision(requestor_first);
        assert!(matches!(requestor, State::Sta1 | State::Sta13));
        assert!(matches!(acceptor, State::Sta1 | State::Sta13));
        // the requestor gets the last release reply
        assert_eq!(requestor, State::Sta1);
        assert_eq!(acceptor, State::Sta13);
    }

    #[test]
    fn state_display() {
        assert_eq!(State::Sta1.to_string(), "Sta1");
        assert_eq!(State::Sta13.to_string(), "Sta13");
    }
}
