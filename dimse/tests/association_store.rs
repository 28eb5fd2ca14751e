use dicom_dictionary_std::uids;
use dicom_dimse::association::{Association, Error};
use dicom_dimse::dimse::{status, Command, DataWriter, Dimse, IncomingData, Priority};
use dicom_dimse::listener::{Listener, ListenerHandle, ListenerOptions};
use dicom_dimse::pdu::MINIMUM_PDU_SIZE;
use dicom_dimse::service::{DimseRqHandler, ServiceError, ServiceRegistry, ANY_SOP_CLASS};
use dicom_dimse::{ClientAssociationOptions, ServerAssociationOptions, SessionOptions};
use matches::assert_matches;
use std::io::{ErrorKind, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error>>;

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// Stores nothing, but passes every data set received to a channel.
struct CaptureStore {
    sender: Mutex<Sender<(String, IncomingData)>>,
}

impl DimseRqHandler for CaptureStore {
    fn sop_classes(&self) -> Vec<String> {
        vec![ANY_SOP_CLASS.to_string()]
    }

    fn verbs(&self) -> Vec<Dimse> {
        vec![Dimse::CStore]
    }

    fn handle(
        &self,
        association: &Association,
        presentation_context_id: u8,
        command: &Command,
        data: Option<IncomingData>,
    ) -> std::result::Result<(), ServiceError> {
        let data = data.ok_or_else(|| ServiceError::processing_failure("no data set"))?;
        let sop_instance_uid = command.sop_instance_uid().unwrap_or_default();
        self.sender
            .lock()
            .map_err(|_| ServiceError::processing_failure("poisoned"))?
            .send((sop_instance_uid, data))
            .map_err(|_| ServiceError::processing_failure("nobody listening"))?;
        let rsp = Command::response_to(command, status::SUCCESS, false)?;
        association.write_response(presentation_context_id, &rsp, None)?;
        Ok(())
    }
}

/// A data set source which breaks down after some bytes.
struct TruncatedSource {
    len: usize,
}

impl DataWriter for TruncatedSource {
    fn write_data(
        &self,
        to: &mut dyn Write,
        _transfer_syntax_uid: &str,
    ) -> dicom_dimse::dimse::Result<()> {
        to.write_all(&vec![0x42; self.len])?;
        Err(std::io::Error::new(ErrorKind::UnexpectedEof, "source file truncated").into())
    }
}

fn spawn_store_scp(
    max_pdu_length: u32,
) -> Result<(ListenerHandle, Receiver<(String, IncomingData)>)> {
    let (sender, receiver) = mpsc::channel();
    let mut registry = ServiceRegistry::new();
    registry.register(CaptureStore {
        sender: Mutex::new(sender),
    });
    let options = ListenerOptions::new().association_options(
        ServerAssociationOptions::new()
            .ae_title("STORE-SCP")
            .with_abstract_syntax(uids::CT_IMAGE_STORAGE)
            .with_transfer_syntax(IMPLICIT_VR_LE)
            .max_pdu_length(max_pdu_length),
    );
    let listener = Listener::bind("127.0.0.1:0", options, Arc::new(registry))?;
    Ok((listener.spawn()?, receiver))
}

#[test]
fn large_data_set_is_fragmented_and_reassembled() -> Result {
    let (scp, received) = spawn_store_scp(MINIMUM_PDU_SIZE)?;

    let association = ClientAssociationOptions::new()
        .with_presentation_context(uids::CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .session_options(SessionOptions::new().response_timeout(Some(Duration::from_secs(10))))
        .establish(scp.local_addr())?;
    assert_eq!(association.peer_max_pdu_length(), MINIMUM_PDU_SIZE);

    // several times the peer's maximum PDU length
    let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    let rsp = association
        .cstore(1, "1.2.826.0.1.3680043.2.1125.1", &payload, Priority::Medium)?
        .wait_final()?;
    assert_eq!(rsp.status(), Some(status::SUCCESS));

    let (sop_instance_uid, data) = received.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(sop_instance_uid, "1.2.826.0.1.3680043.2.1125.1");
    assert_eq!(data.transfer_syntax_uid(), IMPLICIT_VR_LE);
    assert_eq!(data.bytes().len(), payload.len());
    assert!(data.bytes() == &payload[..]);

    association.release(true)?;
    scp.shutdown()?;
    Ok(())
}

#[test]
fn several_instances_over_one_association() -> Result {
    let (scp, received) = spawn_store_scp(16_384)?;

    let association = ClientAssociationOptions::new()
        .with_presentation_context(uids::CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(scp.local_addr())?;

    for i in 0..3u8 {
        let uid = format!("1.2.3.{}", i);
        let payload = vec![i; 1000 + i as usize];
        let rsp = association
            .cstore(1, &uid, &payload, Priority::Low)?
            .wait_final()?;
        assert_eq!(rsp.status(), Some(status::SUCCESS));

        let (sop_instance_uid, data) = received.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(sop_instance_uid, uid);
        assert_eq!(data.into_bytes(), payload);
    }

    association.release(true)?;
    scp.shutdown()?;
    Ok(())
}

#[test]
fn broken_data_set_source_aborts_instead_of_storing() -> Result {
    let (scp, received) = spawn_store_scp(MINIMUM_PDU_SIZE)?;

    let association = ClientAssociationOptions::new()
        .with_presentation_context(uids::CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(scp.local_addr())?;

    // some fragments make it to the wire before the source fails
    let source = TruncatedSource { len: 10_000 };
    let err = association
        .cstore(1, "1.2.3.4.5", &source, Priority::Medium)
        .unwrap_err();
    assert_matches!(err, Error::Closed { .. });
    let terminal = association
        .terminal_error()
        .expect("association should have failed");
    assert_matches!(*terminal, Error::WriteMessage { .. });

    // the store provider never sees the partial data set
    assert!(received.recv_timeout(Duration::from_millis(500)).is_err());
    association.wait_for_socket_close().unwrap_err();

    scp.shutdown()?;
    Ok(())
}
