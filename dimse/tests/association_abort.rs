//! Protocol violations committed by a hand-driven peer.
use dicom_dictionary_std::uids;
use dicom_dimse::pdu::reader::read_pdu;
use dicom_dimse::pdu::writer::write_pdu;
use dicom_dimse::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, Pdu, LARGE_PDU_SIZE, MAXIMUM_PDU_SIZE,
};
use dicom_dimse::listener::{Listener, ListenerHandle, ListenerOptions};
use dicom_dimse::service::{ServiceRegistry, VerificationScp};
use dicom_dimse::{ClientAssociationOptions, ServerAssociationOptions};
use matches::assert_matches;
use rstest::rstest;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error>>;

fn spawn_echo_scp() -> Result<ListenerHandle> {
    let mut registry = ServiceRegistry::new();
    registry.register(VerificationScp);
    let options = ListenerOptions::new().association_options(
        ServerAssociationOptions::new().with_abstract_syntax(uids::VERIFICATION),
    );
    let listener = Listener::bind("127.0.0.1:0", options, Arc::new(registry))?;
    Ok(listener.spawn()?)
}

/// Open an association by hand, returning the raw socket.
fn associate(scp: &ListenerHandle) -> Result<TcpStream> {
    let rq = ClientAssociationOptions::new()
        .with_abstract_syntax(uids::VERIFICATION)
        .association_rq()?;
    let mut socket = TcpStream::connect(scp.local_addr())?;
    socket.set_read_timeout(Some(Duration::from_secs(5)))?;
    write_pdu(&mut socket, &rq.into())?;
    let pdu = read_pdu(&mut socket, MAXIMUM_PDU_SIZE, false)?;
    assert_matches!(pdu, Pdu::AssociationAC(_));
    Ok(socket)
}

#[rstest]
#[case::oversized_pdata(
    vec![0x04, 0x00],
    LARGE_PDU_SIZE + 1,
    AbortRQServiceProviderReason::InvalidPduParameter
)]
#[case::unknown_pdu_type(vec![0x0A, 0x00], 0, AbortRQServiceProviderReason::UnrecognizedPdu)]
#[case::bad_release_length(vec![0x05, 0x00], 0, AbortRQServiceProviderReason::InvalidPduParameter)]
#[case::empty_pdata(vec![0x04, 0x00], 0, AbortRQServiceProviderReason::InvalidPduParameter)]
fn violation_is_answered_with_abort(
    #[case] mut header: Vec<u8>,
    #[case] length: u32,
    #[case] reason: AbortRQServiceProviderReason,
) -> Result {
    let scp = spawn_echo_scp()?;
    let mut socket = associate(&scp)?;

    header.extend_from_slice(&length.to_be_bytes());
    socket.write_all(&header)?;

    let pdu = read_pdu(&mut socket, MAXIMUM_PDU_SIZE, false)?;
    assert_eq!(
        pdu,
        Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(reason),
        }
    );

    scp.shutdown()?;
    Ok(())
}

#[test]
fn second_association_request_is_unexpected() -> Result {
    let scp = spawn_echo_scp()?;
    let mut socket = associate(&scp)?;

    let rq = ClientAssociationOptions::new()
        .with_abstract_syntax(uids::VERIFICATION)
        .association_rq()?;
    write_pdu(&mut socket, &rq.into())?;

    let pdu = read_pdu(&mut socket, MAXIMUM_PDU_SIZE, false)?;
    assert_eq!(
        pdu,
        Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
        }
    );

    scp.shutdown()?;
    Ok(())
}

#[test]
fn pdu_before_association_request_is_aborted_by_the_service_user() -> Result {
    let scp = spawn_echo_scp()?;
    let mut socket = TcpStream::connect(scp.local_addr())?;
    socket.set_read_timeout(Some(Duration::from_secs(5)))?;

    write_pdu(&mut socket, &Pdu::ReleaseRQ)?;

    let pdu = read_pdu(&mut socket, MAXIMUM_PDU_SIZE, false)?;
    assert_eq!(
        pdu,
        Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        }
    );

    scp.shutdown()?;
    Ok(())
}
