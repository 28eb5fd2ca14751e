//! Protocol Data Unit module
//!
//! This module comprises the data structures representing
//! the seven protocol data units (PDUs) of the DICOM upper layer protocol
//! and their nested items,
//! as well as the codec turning them into bytes and back:
//!
//! - [`read_pdu`] and [`write_pdu`] work on whole PDUs;
//! - [`PduDecoder`] reads PDUs incrementally from a byte stream,
//!   giving out P-DATA values one at a time;
//! - [`PduEncoder`] writes PDUs to a byte stream through a reusable buffer.
pub mod decoder;
pub mod reader;
pub mod writer;

use std::fmt::Display;

pub use decoder::{PduDecoder, PduEncoder};
pub use reader::{read_pdu, PduHeader};
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size which this implementation negotiates
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The absolute ceiling for the length of any incoming PDU.
///
/// A PDU declaring a larger length is a protocol violation,
/// answered with an A-ABORT (invalid PDU parameter value).
pub const LARGE_PDU_SIZE: u32 = 16 * 1024 * 1024;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// Message component for a proposed presentation context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier
    pub id: u8,
    /// the expected abstract syntax UID
    /// (commonly referring to the expected SOP class)
    pub abstract_syntax: String,
    /// a list of transfer syntax UIDs to support in this interaction
    pub transfer_syntaxes: Vec<String>,
}

/// Message component for the outcome of a proposed presentation context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub transfer_syntax: String,
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub(crate) fn from(reason: u8) -> Option<PresentationContextResultReason> {
        let result = match reason {
            0 => PresentationContextResultReason::Acceptance,
            1 => PresentationContextResultReason::UserRejection,
            2 => PresentationContextResultReason::NoReason,
            3 => PresentationContextResultReason::AbstractSyntaxNotSupported,
            4 => PresentationContextResultReason::TransferSyntaxesNotSupported,
            _ => {
                return None;
            }
        };

        Some(result)
    }
}

impl Display for PresentationContextResultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            PresentationContextResultReason::Acceptance => "acceptance",
            PresentationContextResultReason::UserRejection => "user rejection",
            PresentationContextResultReason::NoReason => "no reason",
            PresentationContextResultReason::AbstractSyntaxNotSupported => {
                "abstract syntax not supported"
            }
            PresentationContextResultReason::TransferSyntaxesNotSupported => {
                "transfer syntaxes not supported"
            }
        };
        f.write_str(msg)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent = 1,
    Transient = 2,
}

impl AssociationRJResult {
    pub(crate) fn from(value: u8) -> Option<AssociationRJResult> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source of an association rejection, along with its reason.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderASCE(AssociationRJServiceProviderASCEReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub(crate) fn from(source: u8, reason: u8) -> Option<AssociationRJSource> {
        use AssociationRJServiceProviderPresentationReason as Presentation;
        use AssociationRJServiceUserReason as User;

        let result = match (source, reason) {
            (1, 1) => AssociationRJSource::ServiceUser(User::NoReasonGiven),
            (1, 2) => AssociationRJSource::ServiceUser(User::ApplicationContextNameNotSupported),
            (1, 3) => AssociationRJSource::ServiceUser(User::CallingAETitleNotRecognized),
            (1, 7) => AssociationRJSource::ServiceUser(User::CalledAETitleNotRecognized),
            (1, x @ 4..=6) | (1, x @ 8..=10) => AssociationRJSource::ServiceUser(User::Reserved(x)),
            (2, 1) => AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::NoReasonGiven,
            ),
            (2, 2) => AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
            ),
            (3, 1) => AssociationRJSource::ServiceProviderPresentation(
                Presentation::TemporaryCongestion,
            ),
            (3, 2) => {
                AssociationRJSource::ServiceProviderPresentation(Presentation::LocalLimitExceeded)
            }
            (3, x @ 0) | (3, x @ 3..=7) => {
                AssociationRJSource::ServiceProviderPresentation(Presentation::Reserved(x))
            }
            _ => {
                return None;
            }
        };
        Some(result)
    }

    /// The source and reason codes as they go on the wire.
    pub(crate) fn to_codes(self) -> (u8, u8) {
        match self {
            AssociationRJSource::ServiceUser(reason) => (
                1,
                match reason {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(code) => code,
                },
            ),
            AssociationRJSource::ServiceProviderASCE(reason) => (
                2,
                match reason {
                    AssociationRJServiceProviderASCEReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported => 2,
                },
            ),
            AssociationRJSource::ServiceProviderPresentation(reason) => (
                3,
                match reason {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(code) => code,
                },
            ),
        }
    }
}

impl Display for AssociationRJSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJSource::ServiceUser(r) => Display::fmt(r, f),
            AssociationRJSource::ServiceProviderASCE(r) => Display::fmt(r, f),
            AssociationRJSource::ServiceProviderPresentation(r) => Display::fmt(r, f),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

impl Display for AssociationRJServiceUserReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceUserReason::NoReasonGiven => f.write_str("no reason given"),
            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => {
                f.write_str("application context name not supported")
            }
            AssociationRJServiceUserReason::CallingAETitleNotRecognized => {
                f.write_str("calling AE title not recognized")
            }
            AssociationRJServiceUserReason::CalledAETitleNotRecognized => {
                f.write_str("called AE title not recognized")
            }
            AssociationRJServiceUserReason::Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderASCEReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

impl Display for AssociationRJServiceProviderASCEReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceProviderASCEReason::NoReasonGiven => f.write_str("no reason given"),
            AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported => {
                f.write_str("protocol version not supported")
            }
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

impl Display for AssociationRJServiceProviderPresentationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                f.write_str("temporary congestion")
            }
            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => {
                f.write_str("local limit exceeded")
            }
            AssociationRJServiceProviderPresentationReason::Reserved(code) => {
                write!(f, "reserved code {}", code)
            }
        }
    }
}

/// A presentation data value (PDV),
/// a fragment of a DIMSE command or data set.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

impl PDataValue {
    /// The message control header of this value:
    /// bit 0 is set for command fragments,
    /// bit 1 is set for the last fragment.
    pub fn control_header(&self) -> u8 {
        let mut header = 0x00;
        if self.value_type == PDataValueType::Command {
            header |= 0x01;
        }
        if self.is_last {
            header |= 0x02;
        }
        header
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    pub(crate) fn from(source: u8, reason: u8) -> Option<AbortRQSource> {
        use AbortRQServiceProviderReason::*;
        let result = match (source, reason) {
            (0, _) => AbortRQSource::ServiceUser,
            (1, _) => AbortRQSource::Reserved,
            (2, 0) => AbortRQSource::ServiceProvider(ReasonNotSpecified),
            (2, 1) => AbortRQSource::ServiceProvider(UnrecognizedPdu),
            (2, 2) => AbortRQSource::ServiceProvider(UnexpectedPdu),
            (2, 3) => AbortRQSource::ServiceProvider(Reserved),
            (2, 4) => AbortRQSource::ServiceProvider(UnrecognizedPduParameter),
            (2, 5) => AbortRQSource::ServiceProvider(UnexpectedPduParameter),
            (2, 6) => AbortRQSource::ServiceProvider(InvalidPduParameter),
            (_, _) => {
                return None;
            }
        };

        Some(result)
    }

    /// The source and reason codes as they go on the wire.
    pub(crate) fn to_codes(self) -> (u8, u8) {
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(reason) => (2, reason as u8),
        }
    }
}

impl Display for AbortRQSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortRQSource::ServiceUser => f.write_str("service user"),
            AbortRQSource::Reserved => f.write_str("reserved source"),
            AbortRQSource::ServiceProvider(reason) => write!(f, "service provider ({})", reason),
        }
    }
}

/// An enumeration of supported A-ABORT PDU provider reasons.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    /// Reason Not Specified
    ReasonNotSpecified = 0,
    /// Unrecognized PDU
    UnrecognizedPdu = 1,
    /// Unexpected PDU
    UnexpectedPdu = 2,
    /// Reserved
    Reserved = 3,
    /// Unrecognized PDU parameter
    UnrecognizedPduParameter = 4,
    /// Unexpected PDU parameter
    UnexpectedPduParameter = 5,
    /// Invalid PDU parameter value
    InvalidPduParameter = 6,
}

impl Display for AbortRQServiceProviderReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            AbortRQServiceProviderReason::ReasonNotSpecified => "reason not specified",
            AbortRQServiceProviderReason::UnrecognizedPdu => "unrecognized PDU",
            AbortRQServiceProviderReason::UnexpectedPdu => "unexpected PDU",
            AbortRQServiceProviderReason::Reserved => "reserved code",
            AbortRQServiceProviderReason::UnrecognizedPduParameter => "unrecognized PDU parameter",
            AbortRQServiceProviderReason::UnexpectedPduParameter => "unexpected PDU parameter",
            AbortRQServiceProviderReason::InvalidPduParameter => "invalid PDU parameter value",
        };
        f.write_str(msg)
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item
/// of an association request or acknowledgement.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariableItem {
    /// A sub-item of an unrecognized type, kept as is
    Unknown(u8, Vec<u8>),
    /// Maximum length received (0x51)
    MaxLength(u32),
    /// Implementation class UID (0x52)
    ImplementationClassUID(String),
    /// Asynchronous operations window (0x53)
    AsyncOperationsWindow(AsyncOperationsWindow),
    /// SCP/SCU role selection (0x54)
    RoleSelection(RoleSelection),
    /// Implementation version name (0x55)
    ImplementationVersionName(String),
    /// SOP class extended negotiation (0x56)
    SopClassExtendedNegotiationSubItem(String, Vec<u8>),
    /// User identity negotiation request (0x58)
    UserIdentityItem(UserIdentity),
    /// User identity negotiation server response (0x59)
    UserIdentityResponse(Vec<u8>),
}

/// Maximum number of outstanding operations
/// which a node may invoke and perform asynchronously.
///
/// A value of 0 means unlimited.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct AsyncOperationsWindow {
    pub max_operations_invoked: u16,
    pub max_operations_performed: u16,
}

/// SCP/SCU role selection for one SOP class.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct RoleSelection {
    pub sop_class_uid: String,
    pub scu_role: bool,
    pub scp_role: bool,
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
#[non_exhaustive]
pub enum UserIdentityType {
    Username,
    UsernamePassword,
    KerberosServiceTicket,
    SamlAssertion,
    Jwt,
}

impl UserIdentityType {
    pub(crate) fn from(user_identity_type: u8) -> Option<Self> {
        match user_identity_type {
            1 => Some(Self::Username),
            2 => Some(Self::UsernamePassword),
            3 => Some(Self::KerberosServiceTicket),
            4 => Some(Self::SamlAssertion),
            5 => Some(Self::Jwt),
            _ => None,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Username => 1,
            Self::UsernamePassword => 2,
            Self::KerberosServiceTicket => 3,
            Self::SamlAssertion => 4,
            Self::Jwt => 5,
        }
    }
}

/// An in-memory representation of a full Protocol Data Unit (PDU).
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub enum Pdu {
    /// Unrecognized PDU type
    Unknown { pdu_type: u8, data: Vec<u8> },
    /// Association request (A-ASSOCIATE-RQ)
    AssociationRQ(AssociationRQ),
    /// Association acknowledgement (A-ASSOCIATE-AC)
    AssociationAC(AssociationAC),
    /// Association rejection (A-ASSOCIATE-RJ)
    AssociationRJ(AssociationRJ),
    /// P-Data (P-DATA-TF)
    PData { data: Vec<PDataValue> },
    /// Association release request (A-RELEASE-RQ)
    ReleaseRQ,
    /// Association release reply (A-RELEASE-RP)
    ReleaseRP,
    /// Association abort request (A-ABORT)
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// The PDU type code of this PDU.
    pub fn pdu_type(&self) -> u8 {
        match self {
            Pdu::Unknown { pdu_type, .. } => *pdu_type,
            Pdu::AssociationRQ(_) => 0x01,
            Pdu::AssociationAC(_) => 0x02,
            Pdu::AssociationRJ(_) => 0x03,
            Pdu::PData { .. } => 0x04,
            Pdu::ReleaseRQ => 0x05,
            Pdu::ReleaseRP => 0x06,
            Pdu::AbortRQ { .. } => 0x07,
        }
    }

    /// Provide a short description of the PDU.
    pub fn short_description(&self) -> impl std::fmt::Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl std::fmt::Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Pdu::Unknown { pdu_type, data } => {
                write!(
                    f,
                    "Unknown {{pdu_type: {}, data: {} bytes }}",
                    pdu_type,
                    data.len()
                )
            }
            Pdu::AssociationRQ(rq) => write!(
                f,
                "AssociationRQ {{ {} -> {}, {} presentation contexts }}",
                rq.calling_ae_title,
                rq.called_ae_title,
                rq.presentation_contexts.len()
            ),
            Pdu::AssociationAC(ac) => write!(
                f,
                "AssociationAC {{ {} presentation contexts }}",
                ac.presentation_contexts.len()
            ),
            Pdu::AssociationRJ { .. }
            | Pdu::ReleaseRQ
            | Pdu::ReleaseRP
            | Pdu::AbortRQ { .. } => std::fmt::Debug::fmt(self.0, f),
            Pdu::PData { data } => match data.as_slice() {
                [pdv] => write!(f, "PData [({:?}, {} bytes)]", pdv.value_type, pdv.data.len()),
                [a, b] => write!(
                    f,
                    "PData [({:?}, {} bytes), ({:?}, {} bytes)]",
                    a.value_type,
                    a.data.len(),
                    b.value_type,
                    b.data.len(),
                ),
                _ => write!(f, "PData [{} p-data values]", data.len()),
            },
        }
    }
}

/// An in-memory representation of an association request
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

impl AssociationRQ {
    /// The maximum PDU length which the requestor admits, if announced.
    pub fn max_pdu_length(&self) -> Option<u32> {
        find_max_length(&self.user_variables)
    }

    /// The asynchronous operations window proposed, if any.
    pub fn async_operations_window(&self) -> Option<AsyncOperationsWindow> {
        find_async_operations_window(&self.user_variables)
    }

    /// The user identity proposed, if any.
    pub fn user_identity(&self) -> Option<&UserIdentity> {
        self.user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentityItem(identity) => Some(identity),
            _ => None,
        })
    }

    /// Iterate over the role selection sub-items proposed.
    pub fn role_selections(&self) -> impl Iterator<Item = &RoleSelection> {
        self.user_variables.iter().filter_map(|item| match item {
            UserVariableItem::RoleSelection(role) => Some(role),
            _ => None,
        })
    }
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// An in-memory representation of an association acknowledgement
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

impl AssociationAC {
    /// The maximum PDU length which the acceptor admits, if announced.
    pub fn max_pdu_length(&self) -> Option<u32> {
        find_max_length(&self.user_variables)
    }

    /// The asynchronous operations window granted, if any.
    pub fn async_operations_window(&self) -> Option<AsyncOperationsWindow> {
        find_async_operations_window(&self.user_variables)
    }
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// An in-memory representation of an association rejection.
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

fn find_max_length(user_variables: &[UserVariableItem]) -> Option<u32> {
    user_variables.iter().find_map(|item| match item {
        UserVariableItem::MaxLength(len) => Some(*len),
        _ => None,
    })
}

fn find_async_operations_window(
    user_variables: &[UserVariableItem],
) -> Option<AsyncOperationsWindow> {
    user_variables.iter().find_map(|item| match item {
        UserVariableItem::AsyncOperationsWindow(window) => Some(*window),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu_short_description() {
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        assert_eq!(
            &pdu.short_description().to_string(),
            "AbortRQ { source: ServiceUser }",
        );

        let pdu = Pdu::PData {
            data: vec![PDataValue {
                is_last: true,
                presentation_context_id: 3,
                value_type: PDataValueType::Data,
                data: vec![0x55; 384],
            }],
        };
        assert_eq!(
            &pdu.short_description().to_string(),
            "PData [(Data, 384 bytes)]",
        );
    }

    #[test]
    fn reject_source_codes_are_symmetric() {
        for source in 1..=3_u8 {
            for reason in 0..=10_u8 {
                if let Some(rj) = AssociationRJSource::from(source, reason) {
                    assert_eq!(rj.to_codes(), (source, reason));
                }
            }
        }
    }

    #[test]
    fn abort_source_codes() {
        let source = AbortRQSource::from(2, 6).unwrap();
        assert_eq!(
            source,
            AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::InvalidPduParameter)
        );
        assert_eq!(source.to_codes(), (2, 6));
        assert_eq!(AbortRQSource::from(3, 0), None);
    }

    #[test]
    fn pdv_control_header() {
        let mut pdv = PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![],
        };
        assert_eq!(pdv.control_header(), 0x03);
        pdv.is_last = false;
        assert_eq!(pdv.control_header(), 0x01);
        pdv.value_type = PDataValueType::Data;
        assert_eq!(pdv.control_header(), 0x00);
    }
}
