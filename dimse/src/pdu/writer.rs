//! PDU writer module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write chunk of {} PDU structure", name))]
    WriteChunk {
        /// the name of the PDU structure
        name: &'static str,
        source: WriteChunkError,
    },

    #[snafu(display("Could not write field `{}`", field))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not encode field `{}`", field))]
    EncodeField {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("Could not send PDU"))]
    SendPdu {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("Failed to build chunk"))]
    BuildChunk {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Chunk of {} bytes does not fit in its length field", length))]
    ChunkTooLong { length: usize, backtrace: Backtrace },
    #[snafu(display("Failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

/// Build a chunk in memory with the given function,
/// then write its length as a 32-bit big endian integer
/// followed by the chunk itself.
fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).context(BuildChunkSnafu)?;

    ensure!(
        data.len() <= u32::MAX as usize,
        ChunkTooLongSnafu { length: data.len() }
    );
    let length = data.len() as u32;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Build a chunk in memory with the given function,
/// then write its length as a 16-bit big endian integer
/// followed by the chunk itself.
fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).context(BuildChunkSnafu)?;

    ensure!(
        data.len() <= u16::MAX as usize,
        ChunkTooLongSnafu { length: data.len() }
    );
    let length = data.len() as u16;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Write the item type and reserved byte which precede every item.
fn write_item_type(writer: &mut dyn Write, item_type: u8) -> Result<()> {
    writer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })
}

/// Encode the whole PDU into the given writer.
///
/// Lengths of the PDU and of each of its items
/// are known before their headers are written,
/// as each chunk is fully built in memory first.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;

    // 1 - PDU-type
    writer
        .write_u8(pdu.pdu_type())
        .context(WriteFieldSnafu { field: "PDU-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    // 3-6 - PDU-length, followed by the body
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => write_chunk_u32(writer, |writer| {
            write_associate_fixed_fields(
                writer,
                *protocol_version,
                called_ae_title,
                calling_ae_title,
                &codec,
            )?;

            write_pdu_variable_application_context_name(writer, application_context_name, &codec)?;

            for presentation_context in presentation_contexts {
                write_pdu_variable_presentation_context_proposed(
                    writer,
                    presentation_context,
                    &codec,
                )?;
            }

            write_pdu_variable_user_variables(writer, user_variables, &codec)
        })
        .context(WriteChunkSnafu {
            name: "A-ASSOCIATE-RQ",
        }),
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => write_chunk_u32(writer, |writer| {
            // AE title fields are reserved here,
            // sent with the values of the A-ASSOCIATE-RQ
            write_associate_fixed_fields(
                writer,
                *protocol_version,
                called_ae_title,
                calling_ae_title,
                &codec,
            )?;

            write_pdu_variable_application_context_name(writer, application_context_name, &codec)?;

            for presentation_context in presentation_contexts {
                write_pdu_variable_presentation_context_result(
                    writer,
                    presentation_context,
                    &codec,
                )?;
            }

            write_pdu_variable_user_variables(writer, user_variables, &codec)
        })
        .context(WriteChunkSnafu {
            name: "A-ASSOCIATE-AC",
        }),
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            write_chunk_u32(writer, |writer| {
                // 7 - Reserved
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;

                // 8 - Result
                writer
                    .write_u8(*result as u8)
                    .context(WriteFieldSnafu { field: "Result" })?;

                // 9 - Source, 10 - Reason/Diag.
                let (source, reason) = source.to_codes();
                writer
                    .write_all(&[source, reason])
                    .context(WriteFieldSnafu {
                        field: "Source and Reason/Diag.",
                    })
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })
        }
        Pdu::PData { data } => write_chunk_u32(writer, |writer| {
            for presentation_data_value in data {
                write_chunk_u32(writer, |writer| {
                    writer
                        .write_u8(presentation_data_value.presentation_context_id)
                        .context(WriteFieldSnafu {
                            field: "Presentation-context-ID",
                        })?;

                    writer
                        .write_u8(presentation_data_value.control_header())
                        .context(WriteFieldSnafu {
                            field: "Message Control Header",
                        })?;

                    writer
                        .write_all(&presentation_data_value.data)
                        .context(WriteFieldSnafu {
                            field: "Presentation-data-value",
                        })
                })
                .context(WriteChunkSnafu {
                    name: "Presentation-data-value item",
                })?;
            }

            Ok(())
        })
        .context(WriteChunkSnafu { name: "P-DATA-TF" }),
        Pdu::ReleaseRQ | Pdu::ReleaseRP => write_chunk_u32(writer, |writer| {
            // 7-10 - Reserved
            writer
                .write_all(&[0u8; 4])
                .context(WriteReservedSnafu { bytes: 4_u32 })
        })
        .context(WriteChunkSnafu { name: "A-RELEASE" }),
        Pdu::AbortRQ { source } => write_chunk_u32(writer, |writer| {
            // 7-8 - Reserved
            writer
                .write_all(&[0u8; 2])
                .context(WriteReservedSnafu { bytes: 2_u32 })?;

            // 9 - Source, 10 - Reason/Diag
            let (source, reason) = source.to_codes();
            writer
                .write_all(&[source, reason])
                .context(WriteFieldSnafu {
                    field: "Source and Reason/Diag",
                })
        })
        .context(WriteChunkSnafu { name: "A-ABORT" }),
        Pdu::Unknown { data, .. } => write_chunk_u32(writer, |writer| {
            writer.write_all(data).context(WriteFieldSnafu {
                field: "Unknown data",
            })
        })
        .context(WriteChunkSnafu { name: "Unknown" }),
    }
}

fn write_associate_fixed_fields(
    writer: &mut dyn Write,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 7-8 - Protocol-version
    writer
        .write_u16::<BigEndian>(protocol_version)
        .context(WriteFieldSnafu {
            field: "Protocol-version",
        })?;

    // 9-10 - Reserved
    writer
        .write_u16::<BigEndian>(0x00)
        .context(WriteReservedSnafu { bytes: 2_u32 })?;

    // 11-26 - Called-AE-title, space padded to 16 characters
    write_ae_title(writer, called_ae_title, codec, "Called-AE-title")?;

    // 27-42 - Calling-AE-title
    write_ae_title(writer, calling_ae_title, codec, "Calling-AE-title")?;

    // 43-74 - Reserved
    writer
        .write_all(&[0; 32])
        .context(WriteReservedSnafu { bytes: 32_u32 })
}

fn write_ae_title(
    writer: &mut dyn Write,
    ae_title: &str,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<()> {
    let mut ae_title_bytes = codec.encode(ae_title).context(EncodeFieldSnafu { field })?;
    ae_title_bytes.resize(16, b' ');
    writer
        .write_all(&ae_title_bytes)
        .context(WriteFieldSnafu { field })
}

fn write_text(
    writer: &mut dyn Write,
    text: &str,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<()> {
    writer
        .write_all(&codec.encode(text).context(EncodeFieldSnafu { field })?)
        .context(WriteFieldSnafu { field })
}

fn write_pdu_variable_application_context_name(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item_type(writer, 0x10)?;

    write_chunk_u16(writer, |writer| {
        write_text(
            writer,
            application_context_name,
            codec,
            "Application-context-name",
        )
    })
    .context(WriteChunkSnafu {
        name: "Application Context Item",
    })
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item_type(writer, 0x20)?;

    write_chunk_u16(writer, |writer| {
        // 5 - Presentation-context-ID
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 6-8 - Reserved
        writer
            .write_all(&[0; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        // 9-xxx - Abstract Syntax Sub-Item
        write_item_type(writer, 0x30)?;
        write_chunk_u16(writer, |writer| {
            write_text(
                writer,
                &presentation_context.abstract_syntax,
                codec,
                "Abstract-syntax-name",
            )
        })
        .context(WriteChunkSnafu {
            name: "Abstract Syntax Sub-Item",
        })?;

        // followed by one or more Transfer Syntax Sub-Items
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_item_type(writer, 0x40)?;
            write_chunk_u16(writer, |writer| {
                write_text(writer, transfer_syntax, codec, "Transfer-syntax-name")
            })
            .context(WriteChunkSnafu {
                name: "Transfer Syntax Sub-Item",
            })?;
        }

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item_type(writer, 0x21)?;

    write_chunk_u16(writer, |writer| {
        // 5 - Presentation-context-ID, 6 - Reserved
        writer
            .write_all(&[presentation_context.id, 0x00])
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 7 - Result/Reason, 8 - Reserved
        writer
            .write_all(&[presentation_context.reason as u8, 0x00])
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;

        // 9-xxx - Transfer Syntax Sub-Item
        write_item_type(writer, 0x40)?;
        write_chunk_u16(writer, |writer| {
            write_text(
                writer,
                &presentation_context.transfer_syntax,
                codec,
                "Transfer-syntax-name",
            )
        })
        .context(WriteChunkSnafu {
            name: "Transfer Syntax Sub-Item",
        })
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })
}

fn write_pdu_variable_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    write_item_type(writer, 0x50)?;

    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            write_user_variable(writer, user_variable, codec)?;
        }
        Ok(())
    })
    .context(WriteChunkSnafu { name: "User-data" })
}

fn write_user_variable(
    writer: &mut dyn Write,
    user_variable: &UserVariableItem,
    codec: &dyn TextCodec,
) -> Result<()> {
    match user_variable {
        UserVariableItem::MaxLength(max_length) => {
            write_item_type(writer, 0x51)?;
            write_chunk_u16(writer, |writer| {
                writer
                    .write_u32::<BigEndian>(*max_length)
                    .context(WriteFieldSnafu {
                        field: "Maximum-length-received",
                    })
            })
            .context(WriteChunkSnafu {
                name: "Maximum Length Sub-Item",
            })
        }
        UserVariableItem::ImplementationClassUID(implementation_class_uid) => {
            write_item_type(writer, 0x52)?;
            write_chunk_u16(writer, |writer| {
                write_text(
                    writer,
                    implementation_class_uid,
                    codec,
                    "Implementation-class-uid",
                )
            })
            .context(WriteChunkSnafu {
                name: "Implementation Class UID Sub-Item",
            })
        }
        UserVariableItem::AsyncOperationsWindow(window) => {
            write_item_type(writer, 0x53)?;
            write_chunk_u16(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(window.max_operations_invoked)
                    .context(WriteFieldSnafu {
                        field: "Maximum-number-operations-invoked",
                    })?;
                writer
                    .write_u16::<BigEndian>(window.max_operations_performed)
                    .context(WriteFieldSnafu {
                        field: "Maximum-number-operations-performed",
                    })
            })
            .context(WriteChunkSnafu {
                name: "Asynchronous Operations Window Sub-Item",
            })
        }
        UserVariableItem::RoleSelection(role) => {
            write_item_type(writer, 0x54)?;
            write_chunk_u16(writer, |writer| {
                write_chunk_u16(writer, |writer| {
                    write_text(writer, &role.sop_class_uid, codec, "SOP-class-uid")
                })
                .context(WriteChunkSnafu {
                    name: "SOP-class-uid",
                })?;
                writer
                    .write_all(&[role.scu_role as u8, role.scp_role as u8])
                    .context(WriteFieldSnafu {
                        field: "SCU-role and SCP-role",
                    })
            })
            .context(WriteChunkSnafu {
                name: "SCP/SCU Role Selection Sub-Item",
            })
        }
        UserVariableItem::ImplementationVersionName(implementation_version_name) => {
            write_item_type(writer, 0x55)?;
            write_chunk_u16(writer, |writer| {
                write_text(
                    writer,
                    implementation_version_name,
                    codec,
                    "Implementation-version-name",
                )
            })
            .context(WriteChunkSnafu {
                name: "Implementation Version Name Sub-Item",
            })
        }
        UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
            write_item_type(writer, 0x56)?;
            write_chunk_u16(writer, |writer| {
                write_chunk_u16(writer, |writer| {
                    write_text(writer, sop_class_uid, codec, "SOP-class-uid")
                })
                .context(WriteChunkSnafu {
                    name: "SOP-class-uid",
                })?;
                writer.write_all(data).context(WriteFieldSnafu {
                    field: "Service-class-application-information",
                })
            })
            .context(WriteChunkSnafu {
                name: "SOP Class Extended Negotiation Sub-Item",
            })
        }
        UserVariableItem::UserIdentityItem(user_identity) => {
            write_item_type(writer, 0x58)?;
            write_chunk_u16(writer, |writer| {
                writer
                    .write_all(&[
                        user_identity.identity_type().to_u8(),
                        user_identity.positive_response_requested() as u8,
                    ])
                    .context(WriteFieldSnafu {
                        field: "User-Identity-type",
                    })?;
                write_chunk_u16(writer, |writer| {
                    writer
                        .write_all(user_identity.primary_field())
                        .context(WriteFieldSnafu {
                            field: "Primary-field",
                        })
                })
                .context(WriteChunkSnafu {
                    name: "Primary-field",
                })?;
                write_chunk_u16(writer, |writer| {
                    writer
                        .write_all(user_identity.secondary_field())
                        .context(WriteFieldSnafu {
                            field: "Secondary-field",
                        })
                })
                .context(WriteChunkSnafu {
                    name: "Secondary-field",
                })
            })
            .context(WriteChunkSnafu {
                name: "User Identity Sub-Item",
            })
        }
        UserVariableItem::UserIdentityResponse(response) => {
            write_item_type(writer, 0x59)?;
            write_chunk_u16(writer, |writer| {
                write_chunk_u16(writer, |writer| {
                    writer.write_all(response).context(WriteFieldSnafu {
                        field: "Server-response",
                    })
                })
                .context(WriteChunkSnafu {
                    name: "Server-response",
                })
            })
            .context(WriteChunkSnafu {
                name: "User Identity Server Response Sub-Item",
            })
        }
        UserVariableItem::Unknown(item_type, data) => {
            write_item_type(writer, *item_type)?;
            write_chunk_u16(writer, |writer| {
                writer.write_all(data).context(WriteFieldSnafu {
                    field: "Unknown Data",
                })
            })
            .context(WriteChunkSnafu { name: "Unknown" })
        }
    }
}
