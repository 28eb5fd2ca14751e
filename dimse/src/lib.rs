//! This crate contains the types and methods needed to interact
//! with DICOM nodes through the upper layer protocol
//! and the DICOM message service element (DIMSE).
//!
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_,
//!   along with their wire encoding and decoding.
//! - The [`association`] module
//!   comprises the association state machine,
//!   the negotiation of associations from both sides,
//!   and the [`Association`] session through which messages are exchanged.
//! - The [`dimse`] module
//!   describes DIMSE commands and their status codes.
//! - The [`service`] module
//!   routes incoming requests to service handlers.
//! - The [`listener`] module
//!   accepts associations on a TCP port.
//!
//! # Example
//!
//! Verifying that a peer is reachable:
//!
//! ```no_run
//! # use dicom_dimse::ClientAssociationOptions;
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let association = ClientAssociationOptions::new()
//!     .with_abstract_syntax("1.2.840.10008.1.1")
//!     .called_ae_title("STORE-SCP")
//!     .establish("127.0.0.1:104")?;
//! let rsp = association.cecho(1)?.wait_final()?;
//! assert_eq!(rsp.status(), Some(0x0000));
//! association.release(true)?;
//! # Ok(())
//! # }
//! ```

pub mod association;
pub mod dimse;
pub mod listener;
pub mod pdu;
pub mod service;

/// The current implementation class UID generically referring to DICOM-rs.
///
/// Automatically generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.156227610253341005307660858504280353500";

/// The current implementation version name generically referring to DICOM-rs.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-rs 0.9.0";

// re-exports

pub use association::{
    Association, ClientAssociationOptions, ServerAssociationOptions, SessionOptions,
};
pub use listener::{Listener, ListenerOptions};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
pub use service::{DimseRqHandler, ServiceRegistry};
