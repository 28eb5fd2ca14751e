//! DICOM association module
//!
//! This module contains the session layer of the upper layer protocol:
//! establishing associations between DICOM nodes via TCP/IP,
//! exchanging DIMSE messages over them,
//! and tearing them down.
//!
//! As an association requester, often as a service class user (SCU),
//! a new association can be started
//! via the [`ClientAssociationOptions`][1] type.
//! The minimum required properties are the accepted abstract syntaxes
//! and the TCP socket address to the target node.
//!
//! As an association acceptor,
//! usually taking the role of a service class provider (SCP),
//! a newly accepted [TCP stream][2] can be passed to
//! a previously prepared [`ServerAssociationOptions`][3],
//! or a [`Listener`](crate::listener::Listener) can do it for you.
//!
//! Either way, the outcome is an [`Association`],
//! a handle which can be cloned and shared between threads.
//! Each association runs its own thread reading PDUs from the peer,
//! so that requests can be invoked from any thread
//! while responses are correlated to them by message ID.
//!
//! [1]: crate::association::client::ClientAssociationOptions
//! [2]: std::net::TcpStream
//! [3]: crate::association::server::ServerAssociationOptions
use std::sync::Arc;

use snafu::{Backtrace, Snafu};

use crate::pdu::{AbortRQServiceProviderReason, AbortRQSource, AssociationRJ, Pdu};

pub mod client;
pub mod pdata;
pub mod pending;
pub mod server;
pub mod session;
pub mod state;

mod uid;

pub use client::ClientAssociationOptions;
pub use pdata::PDataWriter;
pub use pending::{CancelRqHandler, DimseResponse, DimseRsp, DimseRspHandler};
pub use server::{AcceptAny, AcceptCalledAeTitle, AccessControl, ServerAssociationOptions};
pub use session::{Association, IdleCheck, PresentationContextNegotiated, SessionOptions};
pub use state::{Role, State};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    /// could not connect to peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not set up the TCP socket
    SetupSocket {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to send PDU message
    SendPdu {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to send P-Data fragments on wire
    WirePData {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to write the DIMSE message
    WriteMessage {
        #[snafu(backtrace)]
        source: crate::dimse::Error,
    },

    /// failed to receive PDU message
    ReceivePdu {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// invalid DIMSE command received
    ReadCommand {
        #[snafu(backtrace)]
        source: crate::dimse::Error,
    },

    #[snafu(display("unexpected PDU from the peer: {}", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedPdu {
        /// the PDU obtained from the peer
        pdu: Box<Pdu>,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("association rejected: {}", association_rj.source))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display("association aborted by the peer ({})", abort_source))]
    Aborted {
        abort_source: AbortRQSource,
        backtrace: Backtrace,
    },

    /// association aborted by this node
    AbortedLocally { backtrace: Backtrace },

    #[snafu(display("protocol violation ({}): {}", reason, detail))]
    ProtocolViolation {
        reason: AbortRQServiceProviderReason,
        detail: String,
        backtrace: Backtrace,
    },

    /// connection closed by the peer
    ConnectionClosed { backtrace: Backtrace },

    #[snafu(display("timed out waiting for {}", what))]
    Timeout {
        what: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("no response to message {} within its deadline", message_id))]
    ResponseTimeout { message_id: u16, backtrace: Backtrace },

    #[snafu(display("operation not allowed in state {}", state))]
    InvalidState {
        state: State,
        backtrace: Backtrace,
    },

    #[snafu(display("presentation context {} is not accepted", id))]
    PresentationContextNotAccepted { id: u8, backtrace: Backtrace },

    #[snafu(display("{} requests for {} not allowed by the negotiated roles", dimse, sop_class_uid))]
    RoleNotNegotiated {
        dimse: crate::dimse::Dimse,
        sop_class_uid: String,
        backtrace: Backtrace,
    },

    /// the command set to write is not a response
    NotAResponse { backtrace: Backtrace },

    #[snafu(display("message ID {} is already in use", message_id))]
    DuplicateMessageId { message_id: u16, backtrace: Backtrace },

    /// could not spawn association thread
    SpawnThread {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("association closed: {}", source))]
    Closed { source: Arc<Error> },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether this error is the association's own abort,
    /// either by the peer or by this node.
    pub fn is_abort(&self) -> bool {
        match self {
            Error::Aborted { .. } | Error::AbortedLocally { .. } => true,
            Error::Closed { source } => source.is_abort(),
            _ => false,
        }
    }

    /// The association rejection this error reports, if any.
    pub fn rejection(&self) -> Option<&AssociationRJ> {
        match self {
            Error::Rejected { association_rj, .. } => Some(association_rj),
            Error::Closed { source } => source.rejection(),
            _ => None,
        }
    }
}
