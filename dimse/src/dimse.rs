//! DIMSE message building blocks.
//!
//! A DIMSE message is a command set,
//! always encoded in _Implicit VR Little Endian_,
//! optionally followed by a data set
//! encoded in the transfer syntax of the presentation context.
//! The command set is kept as an [`InMemDicomObject`]
//! behind the [`Command`] type,
//! which knows about the few command fields
//! that the association needs to inspect.
use std::borrow::Cow;
use std::fmt;
use std::io::Write;

use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{Backtrace, IntoError, OptionExt, ResultExt, Snafu};

/// Value of _Command Data Set Type_ meaning that no data set follows.
pub const NO_DATA_SET: u16 = 0x0101;

/// Value of _Command Data Set Type_ used when a data set follows.
pub const DATA_SET_PRESENT: u16 = 0x0000;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not decode command set"))]
    DecodeCommand {
        #[snafu(backtrace)]
        source: dicom_object::ReadError,
    },

    #[snafu(display("Could not encode command set"))]
    EncodeCommand {
        #[snafu(backtrace)]
        source: dicom_object::WriteError,
    },

    #[snafu(display("Missing command field {}", name))]
    MissingField {
        name: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Command field {} is not an integer", name))]
    ConvertField {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write data set"))]
    WriteDataSet {
        #[snafu(backtrace)]
        source: dicom_object::WriteError,
    },

    #[snafu(display("Could not read data set"))]
    ReadDataSet {
        #[snafu(backtrace)]
        source: dicom_object::ReadError,
    },

    #[snafu(display("Could not write data set bytes"))]
    WriteBytes {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Unsupported transfer syntax {}", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// I/O failures of a data set source,
/// for [`DataWriter`] implementations reading from elsewhere.
impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        WriteBytesSnafu.into_error(source)
    }
}

/// The DIMSE services.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimse {
    CStore,
    CGet,
    CFind,
    CMove,
    CEcho,
    NEventReport,
    NGet,
    NSet,
    NAction,
    NCreate,
    NDelete,
    CCancel,
}

impl Dimse {
    /// The services which can be requested from a service provider,
    /// C-CANCEL excluded.
    pub const SERVICES: [Dimse; 11] = [
        Dimse::CStore,
        Dimse::CGet,
        Dimse::CFind,
        Dimse::CMove,
        Dimse::CEcho,
        Dimse::NEventReport,
        Dimse::NGet,
        Dimse::NSet,
        Dimse::NAction,
        Dimse::NCreate,
        Dimse::NDelete,
    ];

    /// The _Command Field_ value of the request.
    pub fn command_field(self) -> u16 {
        match self {
            Dimse::CStore => 0x0001,
            Dimse::CGet => 0x0010,
            Dimse::CFind => 0x0020,
            Dimse::CMove => 0x0021,
            Dimse::CEcho => 0x0030,
            Dimse::NEventReport => 0x0100,
            Dimse::NGet => 0x0110,
            Dimse::NSet => 0x0120,
            Dimse::NAction => 0x0130,
            Dimse::NCreate => 0x0140,
            Dimse::NDelete => 0x0150,
            Dimse::CCancel => 0x0FFF,
        }
    }

    /// The _Command Field_ value of the response.
    pub fn response_command_field(self) -> u16 {
        self.command_field() | 0x8000
    }

    /// Identify the service of a command field,
    /// along with whether it is a response.
    pub fn from_command_field(command_field: u16) -> Option<(Dimse, bool)> {
        let is_response = command_field & 0x8000 != 0;
        let dimse = match command_field & 0x7FFF {
            0x0001 => Dimse::CStore,
            0x0010 => Dimse::CGet,
            0x0020 => Dimse::CFind,
            0x0021 => Dimse::CMove,
            0x0030 => Dimse::CEcho,
            0x0100 => Dimse::NEventReport,
            0x0110 => Dimse::NGet,
            0x0120 => Dimse::NSet,
            0x0130 => Dimse::NAction,
            0x0140 => Dimse::NCreate,
            0x0150 => Dimse::NDelete,
            0x0FFF if !is_response => Dimse::CCancel,
            _ => return None,
        };
        Some((dimse, is_response))
    }

    /// Whether this is a composite (C-) service.
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            Dimse::CStore
                | Dimse::CGet
                | Dimse::CFind
                | Dimse::CMove
                | Dimse::CEcho
                | Dimse::CCancel
        )
    }

    /// Whether the service retrieves instances,
    /// which warrants a longer response timeout.
    pub fn is_retrieve(self) -> bool {
        matches!(self, Dimse::CGet | Dimse::CMove)
    }

    /// Whether the service addresses the SOP instance
    /// through the _Requested_ SOP class and instance UIDs
    /// rather than the _Affected_ ones.
    fn uses_requested_uids(self) -> bool {
        matches!(
            self,
            Dimse::NGet | Dimse::NSet | Dimse::NAction | Dimse::NDelete
        )
    }
}

impl fmt::Display for Dimse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dimse::CStore => "C-STORE",
            Dimse::CGet => "C-GET",
            Dimse::CFind => "C-FIND",
            Dimse::CMove => "C-MOVE",
            Dimse::CEcho => "C-ECHO",
            Dimse::NEventReport => "N-EVENT-REPORT",
            Dimse::NGet => "N-GET",
            Dimse::NSet => "N-SET",
            Dimse::NAction => "N-ACTION",
            Dimse::NCreate => "N-CREATE",
            Dimse::NDelete => "N-DELETE",
            Dimse::CCancel => "C-CANCEL",
        };
        f.write_str(name)
    }
}

/// Priority of a composite service request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn code(self) -> u16 {
        match self {
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
            Priority::Low => 0x0002,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            0x0002 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// Status codes used by the association and the service registry.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const CANCEL: u16 = 0xFE00;
    pub const PENDING: u16 = 0xFF00;
    /// Pending, with one or more optional keys not supported
    pub const PENDING_WARNING: u16 = 0xFF01;
    /// No such SOP class (N-services)
    pub const NO_SUCH_SOP_CLASS: u16 = 0x0118;
    /// SOP class not supported (C-services)
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    /// Refused: not authorized
    pub const NOT_AUTHORIZED: u16 = 0x0124;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;

    /// Whether more responses will follow one with this status.
    pub fn is_pending(status: u16) -> bool {
        status == PENDING || status == PENDING_WARNING
    }
}

/// A DIMSE command set.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    obj: InMemDicomObject,
}

impl From<InMemDicomObject> for Command {
    fn from(obj: InMemDicomObject) -> Self {
        Command { obj }
    }
}

impl Command {
    /// Build a request command.
    ///
    /// The message ID is assigned by the association when invoked.
    /// `sop_instance_uid` goes to the affected or requested
    /// SOP instance UID field, depending on the service.
    pub fn request(
        dimse: Dimse,
        sop_class_uid: &str,
        sop_instance_uid: Option<&str>,
        has_data_set: bool,
    ) -> Self {
        let (class_tag, instance_tag) = if dimse.uses_requested_uids() {
            (tags::REQUESTED_SOP_CLASS_UID, tags::REQUESTED_SOP_INSTANCE_UID)
        } else {
            (tags::AFFECTED_SOP_CLASS_UID, tags::AFFECTED_SOP_INSTANCE_UID)
        };

        let mut obj = InMemDicomObject::command_from_element_iter([
            DataElement::new(class_tag, VR::UI, dicom_value!(Str, pad_uid(sop_class_uid))),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [dimse.command_field()]),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [0])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [data_set_type(has_data_set)]),
            ),
        ]);
        if dimse.is_composite() && dimse != Dimse::CEcho {
            obj.put(DataElement::new(
                tags::PRIORITY,
                VR::US,
                dicom_value!(U16, [Priority::Medium.code()]),
            ));
        }
        let mut command = Command { obj };
        if let Some(uid) = sop_instance_uid {
            command.put_uid(instance_tag, uid);
        }
        command
    }

    /// Build a C-CANCEL-RQ for the given request message ID.
    pub fn cancel(message_id: u16) -> Self {
        Command {
            obj: InMemDicomObject::command_from_element_iter([
                DataElement::new(
                    tags::COMMAND_FIELD,
                    VR::US,
                    dicom_value!(U16, [Dimse::CCancel.command_field()]),
                ),
                DataElement::new(
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    VR::US,
                    dicom_value!(U16, [message_id]),
                ),
                DataElement::new(
                    tags::COMMAND_DATA_SET_TYPE,
                    VR::US,
                    dicom_value!(U16, [NO_DATA_SET]),
                ),
            ]),
        }
    }

    /// Build the response to the given request command.
    pub fn response_to(rq: &Command, status: u16, has_data_set: bool) -> Result<Self> {
        let command_field = rq.command_field()? | 0x8000;
        let message_id = rq.message_id()?;

        let mut obj = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [message_id]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [data_set_type(has_data_set)]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        ]);
        if let Some(uid) = rq.sop_class_uid() {
            obj.put(DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, pad_uid(&uid)),
            ));
        }
        if let Some(uid) = rq.sop_instance_uid() {
            obj.put(DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, pad_uid(&uid)),
            ));
        }
        Ok(Command { obj })
    }

    /// Set the priority of a composite service request.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.obj.put(DataElement::new(
            tags::PRIORITY,
            VR::US,
            dicom_value!(U16, [priority.code()]),
        ));
        self
    }

    /// Add an unsigned short command field,
    /// such as _Event Type ID_ or _Action Type ID_.
    pub fn with_u16(mut self, tag: Tag, value: u16) -> Self {
        self.obj
            .put(DataElement::new(tag, VR::US, dicom_value!(U16, [value])));
        self
    }

    /// Add a text command field,
    /// such as _Move Destination_ or _Error Comment_.
    pub fn with_text(mut self, tag: Tag, vr: VR, value: &str) -> Self {
        self.obj
            .put(DataElement::new(tag, vr, dicom_value!(Str, value.to_string())));
        self
    }

    fn put_uid(&mut self, tag: Tag, uid: &str) {
        self.obj
            .put(DataElement::new(tag, VR::UI, dicom_value!(Str, pad_uid(uid))));
    }

    pub(crate) fn set_message_id(&mut self, message_id: u16) {
        self.obj.put(DataElement::new(
            tags::MESSAGE_ID,
            VR::US,
            dicom_value!(U16, [message_id]),
        ));
    }

    fn u16_field(&self, tag: Tag, name: &'static str) -> Result<u16> {
        self.obj
            .get(tag)
            .context(MissingFieldSnafu { name })?
            .to_int::<u16>()
            .context(ConvertFieldSnafu { name })
    }

    fn uid_field(&self, tag: Tag) -> Option<String> {
        let value = self.obj.get(tag)?.to_str().ok()?;
        Some(
            value
                .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string(),
        )
    }

    pub fn command_field(&self) -> Result<u16> {
        self.u16_field(tags::COMMAND_FIELD, "Command Field")
    }

    /// The service and whether this is a response.
    pub fn dimse(&self) -> Option<(Dimse, bool)> {
        Dimse::from_command_field(self.command_field().ok()?)
    }

    pub fn is_response(&self) -> bool {
        self.command_field()
            .map(|field| field & 0x8000 != 0)
            .unwrap_or(false)
    }

    pub fn message_id(&self) -> Result<u16> {
        self.u16_field(tags::MESSAGE_ID, "Message ID")
    }

    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.u16_field(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            "Message ID Being Responded To",
        )
    }

    pub fn status(&self) -> Result<u16> {
        self.u16_field(tags::STATUS, "Status")
    }

    pub fn priority(&self) -> Option<Priority> {
        Priority::from_code(self.u16_field(tags::PRIORITY, "Priority").ok()?)
    }

    /// Whether a data set follows this command set.
    pub fn has_data_set(&self) -> bool {
        self.u16_field(tags::COMMAND_DATA_SET_TYPE, "Command Data Set Type")
            .map(|v| v != NO_DATA_SET)
            .unwrap_or(false)
    }

    pub fn affected_sop_class_uid(&self) -> Option<String> {
        self.uid_field(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn requested_sop_class_uid(&self) -> Option<String> {
        self.uid_field(tags::REQUESTED_SOP_CLASS_UID)
    }

    /// The affected SOP class UID, or else the requested one.
    pub fn sop_class_uid(&self) -> Option<String> {
        self.affected_sop_class_uid()
            .or_else(|| self.requested_sop_class_uid())
    }

    /// The affected SOP instance UID, or else the requested one.
    pub fn sop_instance_uid(&self) -> Option<String> {
        self.uid_field(tags::AFFECTED_SOP_INSTANCE_UID)
            .or_else(|| self.uid_field(tags::REQUESTED_SOP_INSTANCE_UID))
    }

    pub fn as_object(&self) -> &InMemDicomObject {
        &self.obj
    }

    pub fn into_object(self) -> InMemDicomObject {
        self.obj
    }

    /// Encode the command set in _Implicit VR Little Endian_.
    ///
    /// _Command Group Length_ is recalculated
    /// from the fields present at this point.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let obj = InMemDicomObject::command_from_element_iter(
            self.obj
                .clone()
                .into_iter()
                .filter(|e| e.header().tag != tags::COMMAND_GROUP_LENGTH),
        );
        let mut data = Vec::new();
        obj.write_dataset_with_ts(&mut data, &ts)
            .context(EncodeCommandSnafu)?;
        Ok(data)
    }

    /// Decode a command set from its _Implicit VR Little Endian_ encoding.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let obj = InMemDicomObject::read_dataset_with_ts(data, &ts).context(DecodeCommandSnafu)?;
        Ok(Command { obj })
    }
}

fn data_set_type(has_data_set: bool) -> u16 {
    if has_data_set {
        DATA_SET_PRESENT
    } else {
        NO_DATA_SET
    }
}

/// UIDs of odd length are padded with a trailing NUL.
fn pad_uid(uid: &str) -> String {
    let mut uid = uid.to_string();
    if uid.len() % 2 == 1 {
        uid.push('\0');
    }
    uid
}

/// Look up a transfer syntax in the main registry and work with it.
fn with_transfer_syntax<T, F>(uid: &str, f: F) -> Result<T>
where
    F: FnOnce(&TransferSyntax) -> Result<T>,
{
    let uid = uid.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());
    let registry = TransferSyntaxRegistry;
    let ts = registry
        .get(uid)
        .context(UnsupportedTransferSyntaxSnafu { uid })?;
    f(ts)
}

/// A data set source for an outgoing DIMSE message.
///
/// The data set is written in the transfer syntax
/// of the presentation context it is sent through.
pub trait DataWriter {
    fn write_data(&self, to: &mut dyn Write, transfer_syntax_uid: &str) -> Result<()>;
}

/// Raw bytes, already encoded in the negotiated transfer syntax.
impl DataWriter for [u8] {
    fn write_data(&self, to: &mut dyn Write, _transfer_syntax_uid: &str) -> Result<()> {
        to.write_all(self).context(WriteBytesSnafu)
    }
}

impl DataWriter for Vec<u8> {
    fn write_data(&self, to: &mut dyn Write, transfer_syntax_uid: &str) -> Result<()> {
        self.as_slice().write_data(to, transfer_syntax_uid)
    }
}

impl DataWriter for InMemDicomObject {
    fn write_data(&self, to: &mut dyn Write, transfer_syntax_uid: &str) -> Result<()> {
        with_transfer_syntax(transfer_syntax_uid, |ts| {
            self.write_dataset_with_ts(to, ts)
                .context(WriteDataSetSnafu)
        })
    }
}

/// The data set of an incoming DIMSE message,
/// as received over the presentation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingData {
    bytes: Vec<u8>,
    transfer_syntax_uid: Cow<'static, str>,
}

impl IncomingData {
    pub fn new(bytes: Vec<u8>, transfer_syntax_uid: impl Into<Cow<'static, str>>) -> Self {
        IncomingData {
            bytes,
            transfer_syntax_uid: transfer_syntax_uid.into(),
        }
    }

    /// The encoded data set.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// The UID of the transfer syntax the data set is encoded in.
    pub fn transfer_syntax_uid(&self) -> &str {
        &self.transfer_syntax_uid
    }

    /// Decode the data set.
    pub fn read_object(&self) -> Result<InMemDicomObject> {
        with_transfer_syntax(&self.transfer_syntax_uid, |ts| {
            InMemDicomObject::read_dataset_with_ts(&self.bytes[..], ts).context(ReadDataSetSnafu)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

    #[rstest]
    #[case(0x0001, Dimse::CStore, false)]
    #[case(0x8001, Dimse::CStore, true)]
    #[case(0x0030, Dimse::CEcho, false)]
    #[case(0x8030, Dimse::CEcho, true)]
    #[case(0x0150, Dimse::NDelete, false)]
    #[case(0x8100, Dimse::NEventReport, true)]
    #[case(0x0FFF, Dimse::CCancel, false)]
    fn command_fields(#[case] field: u16, #[case] dimse: Dimse, #[case] is_response: bool) {
        assert_eq!(Dimse::from_command_field(field), Some((dimse, is_response)));
    }

    #[test]
    fn unknown_command_fields() {
        assert_eq!(Dimse::from_command_field(0x0002), None);
        assert_eq!(Dimse::from_command_field(0x8FFF), None);
    }

    #[test]
    fn echo_request_round_trip() {
        let mut rq = Command::request(Dimse::CEcho, VERIFICATION, None, false);
        rq.set_message_id(7);

        let bytes = rq.encode().unwrap();
        let decoded = Command::decode(&bytes).unwrap();
        assert_eq!(decoded.dimse(), Some((Dimse::CEcho, false)));
        assert_eq!(decoded.message_id().unwrap(), 7);
        assert_eq!(decoded.affected_sop_class_uid().as_deref(), Some(VERIFICATION));
        assert!(!decoded.has_data_set());
        assert_eq!(decoded.priority(), None);
    }

    #[test]
    fn response_mirrors_the_request() {
        let mut rq = Command::request(Dimse::CStore, CT_IMAGE_STORAGE, Some("1.2.3.4.5"), true)
            .with_priority(Priority::High);
        rq.set_message_id(12);
        assert!(rq.has_data_set());
        assert_eq!(rq.priority(), Some(Priority::High));

        let rsp = Command::response_to(&rq, status::SUCCESS, false).unwrap();
        assert_eq!(rsp.command_field().unwrap(), 0x8001);
        assert!(rsp.is_response());
        assert_eq!(rsp.message_id_being_responded_to().unwrap(), 12);
        assert_eq!(rsp.status().unwrap(), status::SUCCESS);
        assert_eq!(rsp.affected_sop_class_uid().as_deref(), Some(CT_IMAGE_STORAGE));
        assert_eq!(rsp.sop_instance_uid().as_deref(), Some("1.2.3.4.5"));
        assert!(!rsp.has_data_set());
    }

    #[test]
    fn normalized_services_use_requested_uids() {
        let rq = Command::request(Dimse::NGet, "1.2.3", Some("4.5.6"), false);
        assert_eq!(rq.requested_sop_class_uid().as_deref(), Some("1.2.3"));
        assert_eq!(rq.affected_sop_class_uid(), None);
        assert_eq!(rq.sop_class_uid().as_deref(), Some("1.2.3"));
        assert_eq!(rq.sop_instance_uid().as_deref(), Some("4.5.6"));
    }

    #[test]
    fn cancel_request() {
        let rq = Command::cancel(3);
        assert_eq!(rq.dimse(), Some((Dimse::CCancel, false)));
        assert_eq!(rq.message_id_being_responded_to().unwrap(), 3);
        assert!(rq.message_id().is_err());
    }

    #[test]
    fn pending_statuses() {
        assert!(status::is_pending(0xFF00));
        assert!(status::is_pending(0xFF01));
        assert!(!status::is_pending(status::SUCCESS));
        assert!(!status::is_pending(status::CANCEL));
    }

    #[test]
    fn incoming_data_set_is_decoded_in_its_transfer_syntax() {
        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            dicom_value!(Str, "Doe^John"),
        )]);
        let mut bytes = Vec::new();
        obj.write_data(&mut bytes, "1.2.840.10008.1.2.1\0").unwrap();

        let incoming = IncomingData::new(bytes, "1.2.840.10008.1.2.1");
        let decoded = incoming.read_object().unwrap();
        assert_eq!(
            decoded.element(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
            "Doe^John"
        );

        let unknown = IncomingData::new(vec![], "1.2.3.4");
        assert!(matches!(
            unknown.read_object(),
            Err(Error::UnsupportedTransferSyntax { .. })
        ));
    }
}
