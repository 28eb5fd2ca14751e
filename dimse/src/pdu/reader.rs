//! PDU reader module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};
use tracing::warn;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("No PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("Could not read PDU header"))]
    ReadPduHeader {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32, backtrace: Backtrace },

    #[snafu(display(
        "Item length {} exceeds the {} bytes left in the PDU",
        length,
        remaining
    ))]
    ItemTooLong {
        length: u32,
        remaining: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read {} reserved bytes", bytes))]
    ReadReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Incoming pdu was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU of type {:#04x} must have length 4, got {}", pdu_type, pdu_length))]
    InvalidPduLength {
        pdu_type: u8,
        pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU contained an invalid value {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },
    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },
    #[snafu(display("Invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid abort service provider"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },
    #[snafu(display("invalid transfer syntax sub-item"))]
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },
    #[snafu(display("unknown presentation context sub-item"))]
    UnknownPresentationContextSubItem { backtrace: Backtrace },
    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },
    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },
    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },
    #[snafu(display("Missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

impl Error {
    /// The A-ABORT service provider reason
    /// with which the peer should be told about this error.
    ///
    /// Returns `None` if the error comes from the byte stream itself
    /// (connection closed, read timeout, and so on),
    /// in which case there is no malformed PDU to complain about.
    pub fn abort_reason(&self) -> Option<AbortRQServiceProviderReason> {
        match self {
            Error::NoPduAvailable { .. } | Error::ReadPduHeader { .. } | Error::ReadPdu { .. } => {
                None
            }
            Error::InvalidRejectSourceOrReason { .. }
            | Error::InvalidAbortSourceOrReason { .. }
            | Error::InvalidPresentationContextResultReason { .. }
            | Error::UnknownPresentationContextSubItem { .. }
            | Error::InvalidTransferSyntaxSubItem { .. } => {
                Some(AbortRQServiceProviderReason::UnrecognizedPduParameter)
            }
            Error::InvalidPduVariable { .. } | Error::MultipleTransferSyntaxesAccepted { .. } => {
                Some(AbortRQServiceProviderReason::UnexpectedPduParameter)
            }
            _ => Some(AbortRQServiceProviderReason::InvalidPduParameter),
        }
    }

    /// Whether the error is the outcome of a read timeout on the stream.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::ReadPduHeader { source, .. } | Error::ReadPdu { source, .. } => matches!(
                source.kind(),
                ErrorKind::WouldBlock | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The fixed header of a PDU.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PduHeader {
    /// the PDU type code
    pub pdu_type: u8,
    /// the length of the PDU body which follows the header
    pub length: u32,
}

/// Read one full PDU from the given reader.
///
/// `max_pdu_length` is the maximum length of P-DATA-TF PDUs
/// which this node has announced.
/// In strict mode, longer P-DATA-TF PDUs are rejected,
/// otherwise only the absolute ceiling of [`LARGE_PDU_SIZE`] applies.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    let header = read_pdu_header(reader, max_pdu_length, strict)?;
    let mut body = vec![0; header.length as usize];
    reader.read_exact(&mut body).context(ReadPduSnafu)?;
    decode_pdu_body(header.pdu_type, &body)
}

/// Read and validate the 6-byte header of the next PDU.
pub fn read_pdu_header<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<PduHeader>
where
    R: Read,
{
    // If we can't read 2 bytes here, that means that there is no PDU
    // available. This method can block and wake up when the stream is closed,
    // so tell apart a stream ending between PDUs from one ending mid-PDU.
    let mut bytes = [0; 2];
    if let Err(e) = reader.read_exact(&mut bytes) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadPduHeaderSnafu);
    }

    let pdu_type = bytes[0];
    let length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduHeaderSnafu)?;

    check_pdu_length(pdu_type, length, max_pdu_length, strict)?;

    Ok(PduHeader { pdu_type, length })
}

/// Check the declared length of a PDU before any of its body is read.
pub fn check_pdu_length(pdu_type: u8, length: u32, max_pdu_length: u32, strict: bool) -> Result<()> {
    ensure!(
        length <= LARGE_PDU_SIZE,
        PduTooLargeSnafu {
            pdu_length: length,
            max_pdu_length: LARGE_PDU_SIZE,
        }
    );

    // at least one presentation data value, with its length and control header
    if pdu_type == 0x04 {
        ensure!(
            length >= 6,
            InvalidPduLengthSnafu {
                pdu_type,
                pdu_length: length
            }
        );
    }

    if matches!(pdu_type, 0x03 | 0x05 | 0x06 | 0x07) {
        ensure!(
            length == 4,
            InvalidPduLengthSnafu {
                pdu_type,
                pdu_length: length
            }
        );
    }

    // the negotiated maximum only bounds P-DATA-TF PDUs
    if pdu_type == 0x04 && max_pdu_length > 0 && length > max_pdu_length {
        ensure!(
            !strict,
            PduTooLargeSnafu {
                pdu_length: length,
                max_pdu_length
            }
        );
        warn!(
            "Incoming pdu was too large: length {}, maximum is {}",
            length, max_pdu_length
        );
    }
    Ok(())
}

/// Decode the body of a PDU of the given type.
///
/// The body must contain exactly the bytes declared in the PDU header.
pub fn decode_pdu_body(pdu_type: u8, body: &[u8]) -> Result<Pdu> {
    let mut cursor = Cursor::new(body);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 => {
            // A-ASSOCIATE-RQ PDU Structure
            let (protocol_version, called_ae_title, calling_ae_title) =
                read_associate_fixed_fields(&mut cursor, &codec)?;

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            // 75-xxx - Variable items: one Application Context Item,
            // one or more Presentation Context Items and one User Information Item.
            while has_remaining(&cursor) {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    PduVariableItem::Unknown(item_type) => {
                        warn!("Ignoring unknown item of type {:#04x}", item_type);
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationRQ(AssociationRQ {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            }))
        }
        0x02 => {
            // A-ASSOCIATE-AC PDU Structure
            //
            // The AE title fields are reserved here,
            // sent with the values received in the A-ASSOCIATE-RQ
            // but not tested.
            let (protocol_version, called_ae_title, calling_ae_title) =
                read_associate_fixed_fields(&mut cursor, &codec)?;

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            while has_remaining(&cursor) {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextResult(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    PduVariableItem::Unknown(item_type) => {
                        warn!("Ignoring unknown item of type {:#04x}", item_type);
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationAC(AssociationAC {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            }))
        }
        0x03 => {
            // A-ASSOCIATE-RJ PDU Structure

            // 7 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 8 - Result: 1 - rejected-permanent, 2 - rejected-transient
            let result = AssociationRJResult::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            // 9 - Source, 10 - Reason/Diag.
            let source = AssociationRJSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF PDU Structure

            // 7-xxx - Presentation-data-value Item(s)
            let mut values = vec![];
            while has_remaining(&cursor) {
                values.push(read_pdv(&mut cursor)?);
            }

            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            // A-RELEASE-RQ PDU Structure

            // 7-10 - Reserved
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;

            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP PDU Structure

            // 7-10 - Reserved
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;

            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT PDU Structure

            // 7-8 - Reserved
            let mut buf = [0u8; 2];
            cursor
                .read_exact(&mut buf)
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 9 - Source: 0 - service-user, 1 - reserved, 2 - service-provider
            // 10 - Reason/Diag, only significant for the service-provider
            let source = AbortRQSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag",
                })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Pdu::AbortRQ { source })
        }
        _ => Ok(Pdu::Unknown {
            pdu_type,
            data: body.to_vec(),
        }),
    }
}

/// Read one presentation data value item
/// from the body of a P-DATA-TF PDU.
pub(crate) fn read_pdv(cursor: &mut Cursor<&[u8]>) -> Result<PDataValue> {
    // 1-4 - Item-length, from the presentation context ID
    // to the end of the presentation data value
    let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-Length",
    })?;

    ensure!(
        item_length >= 2,
        InvalidItemLengthSnafu {
            length: item_length
        }
    );
    let remaining = remaining(cursor);
    ensure!(
        u64::from(item_length) <= remaining,
        ItemTooLongSnafu {
            length: item_length,
            remaining
        }
    );

    // 5 - Presentation-context-ID
    let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
        field: "Presentation-context-ID",
    })?;

    // 6 - Message Control Header:
    // bit 0 set for command information, unset for data set information;
    // bit 1 set for the last fragment of the message.
    let header = cursor.read_u8().context(ReadPduFieldSnafu {
        field: "Message Control Header",
    })?;

    let value_type = if header & 0x01 > 0 {
        PDataValueType::Command
    } else {
        PDataValueType::Data
    };
    let is_last = (header & 0x02) > 0;

    let data = read_n(cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
        field: "Presentation-data-value",
    })?;

    Ok(PDataValue {
        presentation_context_id,
        value_type,
        is_last,
        data,
    })
}

fn has_remaining(cursor: &Cursor<&[u8]>) -> bool {
    remaining(cursor) > 0
}

fn remaining(cursor: &Cursor<&[u8]>) -> u64 {
    (cursor.get_ref().len() as u64).saturating_sub(cursor.position())
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = vec![0; bytes_to_read];
    reader.read_exact(&mut result)?;
    Ok(result)
}

/// Read the fixed fields shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC,
/// returning the protocol version and the called and calling AE titles.
fn read_associate_fixed_fields(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
) -> Result<(u16, String, String)> {
    // 7-8 - Protocol-version, version 1 identified with bit 0 set
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;

    // 9-10 - Reserved
    cursor
        .read_u16::<BigEndian>()
        .context(ReadReservedSnafu { bytes: 2_u32 })?;

    // 11-26 - Called-AE-title, 16 characters with leading and trailing
    // spaces being non-significant
    let called_ae_title = read_ae_title(cursor, codec, "Called-AE-title")?;

    // 27-42 - Calling-AE-title
    let calling_ae_title = read_ae_title(cursor, codec, "Calling-AE-title")?;

    // 43-74 - Reserved
    let mut reserved = [0; 32];
    cursor
        .read_exact(&mut reserved)
        .context(ReadReservedSnafu { bytes: 32_u32 })?;

    Ok((protocol_version, called_ae_title, calling_ae_title))
}

fn read_ae_title(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String> {
    let mut ae_bytes = [0; 16];
    cursor
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&ae_bytes)
        .context(DecodeTextSnafu { field })?
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string())
}

fn read_text<R>(
    reader: &mut R,
    length: usize,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String>
where
    R: Read,
{
    let bytes = read_n(reader, length).context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&bytes)
        .context(DecodeTextSnafu { field })?
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}

fn read_pdu_variable(cursor: &mut Cursor<&[u8]>, codec: &dyn TextCodec) -> Result<PduVariableItem> {
    // 1 - Item-type - XXH
    let item_type = cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    cursor
        .read_u8()
        .context(ReadReservedSnafu { bytes: 1_u32 })?;

    // 3-4 - Item-length
    let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let remaining = remaining(cursor);
    ensure!(
        u64::from(item_length) <= remaining,
        ItemTooLongSnafu {
            length: u32::from(item_length),
            remaining
        }
    );
    let bytes = read_n(cursor, item_length as usize).context(ReadPduFieldSnafu {
        field: "Item-value",
    })?;
    let mut cursor = Cursor::new(&bytes[..]);

    match item_type {
        0x10 => {
            // Application Context Item Structure

            // 5-xxx - Application-context-name, structured as a UID
            let val = read_text(&mut cursor, bytes.len(), codec, "Application-context-name")?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context Item Structure (proposed)

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            // 5 - Presentation-context-ID, an odd integer between 1 and 255
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6-8 - Reserved
            let mut reserved = [0; 3];
            cursor
                .read_exact(&mut reserved)
                .context(ReadReservedSnafu { bytes: 3_u32 })?;

            // 9-xxx - one Abstract Syntax and one or more Transfer Syntax sub-items
            while has_remaining(&cursor) {
                let (item_type, item_length) = read_sub_item_header(&mut cursor)?;

                match item_type {
                    0x30 => {
                        // Abstract Syntax Sub-Item Structure
                        abstract_syntax = Some(read_text(
                            &mut cursor,
                            item_length as usize,
                            codec,
                            "Abstract-syntax-name",
                        )?);
                    }
                    0x40 => {
                        // Transfer Syntax Sub-Item Structure
                        transfer_syntaxes.push(read_text(
                            &mut cursor,
                            item_length as usize,
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item Structure (result)

            let mut transfer_syntax: Option<String> = None;

            // 5 - Presentation-context-ID
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 7 - Result/Reason:
            //   0 - acceptance
            //   1 - user-rejection
            //   2 - no-reason (provider rejection)
            //   3 - abstract-syntax-not-supported (provider rejection)
            //   4 - transfer-syntaxes-not-supported (provider rejection)
            let reason = PresentationContextResultReason::from(cursor.read_u8().context(
                ReadPduFieldSnafu {
                    field: "Result/Reason",
                },
            )?)
            .context(InvalidPresentationContextResultReasonSnafu)?;

            // 8 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 9-xxx - one Transfer Syntax sub-item,
            // not significant unless the context was accepted
            while has_remaining(&cursor) {
                let (item_type, item_length) = read_sub_item_header(&mut cursor)?;

                match item_type {
                    0x40 => {
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu
                        );
                        transfer_syntax = Some(read_text(
                            &mut cursor,
                            item_length as usize,
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            // User Information Item Structure

            // 5-xxx - User-data sub-items
            let mut user_variables = vec![];
            while has_remaining(&cursor) {
                let (item_type, item_length) = read_sub_item_header(&mut cursor)?;
                let sub_item = read_n(&mut cursor, item_length as usize).context(
                    ReadPduFieldSnafu {
                        field: "User-data sub-item",
                    },
                )?;
                let mut sub_cursor = Cursor::new(&sub_item[..]);
                if let Some(item) =
                    read_user_variable(&mut sub_cursor, item_type, item_length, codec)?
                {
                    user_variables.push(item);
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}

fn read_sub_item_header(cursor: &mut Cursor<&[u8]>) -> Result<(u8, u16)> {
    // 1 - Item-type - XXH
    let item_type = cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    cursor
        .read_u8()
        .context(ReadReservedSnafu { bytes: 1_u32 })?;

    // 3-4 - Item-length
    let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let remaining = remaining(cursor);
    ensure!(
        u64::from(item_length) <= remaining,
        ItemTooLongSnafu {
            length: u32::from(item_length),
            remaining
        }
    );
    Ok((item_type, item_length))
}

fn read_user_variable(
    cursor: &mut Cursor<&[u8]>,
    item_type: u8,
    item_length: u16,
    codec: &dyn TextCodec,
) -> Result<Option<UserVariableItem>> {
    let item = match item_type {
        0x51 => {
            // 5-8 - Maximum-length-received,
            // where 0 means that no maximum length is specified
            UserVariableItem::MaxLength(cursor.read_u32::<BigEndian>().context(
                ReadPduFieldSnafu {
                    field: "Maximum-length-received",
                },
            )?)
        }
        0x52 => UserVariableItem::ImplementationClassUID(read_text(
            cursor,
            item_length as usize,
            codec,
            "Implementation-class-uid",
        )?),
        0x53 => {
            // 5-6 - Maximum-number-operations-invoked
            let max_operations_invoked =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Maximum-number-operations-invoked",
                })?;
            // 7-8 - Maximum-number-operations-performed
            let max_operations_performed =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Maximum-number-operations-performed",
                })?;
            UserVariableItem::AsyncOperationsWindow(AsyncOperationsWindow {
                max_operations_invoked,
                max_operations_performed,
            })
        }
        0x54 => {
            // 5-6 - UID-length
            let uid_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "UID-length",
            })?;
            // 7-xxx - SOP-class-uid
            let sop_class_uid = read_text(cursor, uid_length as usize, codec, "SOP-class-uid")?;
            // xxx+1 - SCU-role, xxx+2 - SCP-role
            let scu_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCU-role" })?;
            let scp_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCP-role" })?;
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid,
                scu_role: scu_role == 1,
                scp_role: scp_role == 1,
            })
        }
        0x55 => UserVariableItem::ImplementationVersionName(read_text(
            cursor,
            item_length as usize,
            codec,
            "Implementation-version-name",
        )?),
        0x56 => {
            // 5-6 - SOP-class-uid-length
            let sop_class_uid_length =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "SOP-class-uid-length",
                })?;
            ensure!(
                sop_class_uid_length <= item_length.saturating_sub(2),
                ItemTooLongSnafu {
                    length: u32::from(sop_class_uid_length),
                    remaining: u64::from(item_length.saturating_sub(2)),
                }
            );

            // 7-xxx - SOP-class-uid
            let sop_class_uid =
                read_text(cursor, sop_class_uid_length as usize, codec, "SOP-class-uid")?;

            // xxx-xxx - Service-class-application-information,
            // which spans the rest of the sub-item
            let data_length = item_length
                .saturating_sub(2)
                .saturating_sub(sop_class_uid_length);
            let data = read_n(cursor, data_length as usize).context(ReadPduFieldSnafu {
                field: "Service-class-application-information",
            })?;

            UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data)
        }
        0x58 => {
            // 5 - User-Identity-Type
            let user_identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-type",
            })?;

            // 6 - Positive-response-requested
            let positive_response_requested = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-positive-response-requested",
            })?;

            // 7-8 - Primary-field-length, 9-n - Primary-field
            let primary_field_length =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "User-Identity-primary-field-length",
                })?;
            let primary_field =
                read_n(cursor, primary_field_length as usize).context(ReadPduFieldSnafu {
                    field: "User-Identity-primary-field",
                })?;

            // n+1-n+2 - Secondary-field-length, n+3-m - Secondary-field
            // (only non-empty for username and passcode)
            let secondary_field_length =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "User-Identity-secondary-field-length",
                })?;
            let secondary_field =
                read_n(cursor, secondary_field_length as usize).context(ReadPduFieldSnafu {
                    field: "User-Identity-secondary-field",
                })?;

            match UserIdentityType::from(user_identity_type) {
                Some(user_identity_type) => UserVariableItem::UserIdentityItem(UserIdentity::new(
                    positive_response_requested == 1,
                    user_identity_type,
                    primary_field,
                    secondary_field,
                )),
                None => {
                    warn!("Unknown User Identity Type code {}", user_identity_type);
                    return Ok(None);
                }
            }
        }
        0x59 => {
            // 5-6 - Server-response-length, 7-xxx - Server-response
            let response_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Server-response-length",
            })?;
            let response = read_n(cursor, response_length as usize).context(ReadPduFieldSnafu {
                field: "Server-response",
            })?;
            UserVariableItem::UserIdentityResponse(response)
        }
        _ => UserVariableItem::Unknown(
            item_type,
            read_n(cursor, item_length as usize)
                .context(ReadPduFieldSnafu { field: "Unknown" })?,
        ),
    };
    Ok(Some(item))
}
