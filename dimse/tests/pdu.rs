use dicom_dimse::pdu::reader::{read_pdu, Error as ReadError};
use dicom_dimse::pdu::writer::write_pdu;
use dicom_dimse::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ,
    AsyncOperationsWindow, PDataValue, PDataValueType, Pdu, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, RoleSelection, UserIdentity,
    UserIdentityType, UserVariableItem, DEFAULT_MAX_PDU, LARGE_PDU_SIZE,
};
use matches::assert_matches;
use rstest::rstest;
use std::io::Cursor;

type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error>>;

fn association_rq() -> AssociationRQ {
    AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "STORE-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(32_768),
            UserVariableItem::ImplementationClassUID("1.2.3.4".to_string()),
            UserVariableItem::AsyncOperationsWindow(AsyncOperationsWindow {
                max_operations_invoked: 5,
                max_operations_performed: 0,
            }),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                scu_role: true,
                scp_role: true,
            }),
            UserVariableItem::ImplementationVersionName("TEST 1.0".to_string()),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                true,
                UserIdentityType::UsernamePassword,
                b"operator".to_vec(),
                b"secret".to_vec(),
            )),
        ],
    }
}

#[test]
fn associate_rq_survives_the_wire() -> Result {
    let rq = association_rq();
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &rq.clone().into())?;

    assert_eq!(bytes[0], 0x01);
    // the length field counts every byte after the header
    let length = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    assert_eq!(length as usize, bytes.len() - 6);

    let pdu = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)?;
    assert_eq!(pdu, Pdu::AssociationRQ(rq));
    Ok(())
}

#[test]
fn associate_ac_survives_the_wire() -> Result {
    let ac = AssociationAC {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "STORE-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("1.2.3.4".to_string()),
            UserVariableItem::UserIdentityResponse(Vec::new()),
        ],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &ac.clone().into())?;
    assert_eq!(bytes[0], 0x02);

    let pdu = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)?;
    assert_eq!(pdu, Pdu::AssociationAC(ac));
    Ok(())
}

#[rstest]
#[case(Pdu::ReleaseRQ, [0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00])]
#[case(Pdu::ReleaseRP, [0x06, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00])]
#[case(
    Pdu::AbortRQ { source: AbortRQSource::ServiceUser },
    [0x07, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]
)]
#[case(
    Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::InvalidPduParameter),
    },
    [0x07, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x02, 0x06]
)]
#[case(
    Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ),
    }),
    [0x03, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x01, 0x01, 0x07]
)]
fn fixed_length_pdus(#[case] pdu: Pdu, #[case] expected: [u8; 10]) -> Result {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu)?;
    assert_eq!(bytes, expected);

    let decoded = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)?;
    assert_eq!(decoded, pdu);
    Ok(())
}

#[test]
fn pdata_lengths() -> Result {
    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0xAA; 10],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0xBB; 20],
            },
        ],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu)?;

    // header, then two items of 4-byte length, pcid, control header and value
    assert_eq!(bytes.len(), 6 + (4 + 2 + 10) + (4 + 2 + 20));
    assert_eq!(&bytes[..6], &[0x04, 0x00, 0x00, 0x00, 0x00, 42]);
    assert_eq!(&bytes[6..12], &[0x00, 0x00, 0x00, 12, 0x01, 0x03]);
    assert_eq!(&bytes[22..28], &[0x00, 0x00, 0x00, 22, 0x01, 0x00]);

    let decoded = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)?;
    assert_eq!(decoded, pdu);
    Ok(())
}

#[test]
fn oversized_pdu_header_is_refused() {
    let length = LARGE_PDU_SIZE + 1;
    let mut bytes = vec![0x04, 0x00];
    bytes.extend_from_slice(&length.to_be_bytes());

    let err = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, false).unwrap_err();
    assert_matches!(err, ReadError::PduTooLarge { .. });
    assert_eq!(
        err.abort_reason(),
        Some(AbortRQServiceProviderReason::InvalidPduParameter)
    );
}

#[test]
fn unknown_pdu_type_is_read_whole() -> Result {
    let bytes = [0x09, 0x00, 0x00, 0x00, 0x00, 0x02, 0xCA, 0xFE];
    let pdu = read_pdu(&mut Cursor::new(&bytes[..]), DEFAULT_MAX_PDU, true)?;
    assert_eq!(
        pdu,
        Pdu::Unknown {
            pdu_type: 0x09,
            data: vec![0xCA, 0xFE],
        }
    );
    Ok(())
}
