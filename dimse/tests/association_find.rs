//! Long running C-FIND operations: cancellation,
//! and operations left outstanding when the association ends.
use dicom_dictionary_std::uids;
use dicom_dimse::association::{Association, Error};
use dicom_dimse::dimse::{status, Command, Dimse, IncomingData, Priority};
use dicom_dimse::listener::{Listener, ListenerHandle, ListenerOptions};
use dicom_dimse::service::{DimseRqHandler, ServiceError, ServiceRegistry};
use dicom_dimse::{ClientAssociationOptions, ServerAssociationOptions};
use matches::assert_matches;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error>>;

static FIND_SOP_CLASS: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;

/// A C-FIND operation handed over to the test,
/// which decides how it ends.
struct Operation {
    association: Association,
    presentation_context_id: u8,
    command: Command,
}

/// Answers each C-FIND with one pending response,
/// reporting C-CANCEL requests for it to a channel.
struct HandOverFind {
    operations: Mutex<Sender<Operation>>,
    cancelled: Mutex<Sender<u16>>,
}

impl DimseRqHandler for HandOverFind {
    fn sop_classes(&self) -> Vec<String> {
        vec![FIND_SOP_CLASS.to_string()]
    }

    fn verbs(&self) -> Vec<Dimse> {
        vec![Dimse::CFind]
    }

    fn handle(
        &self,
        association: &Association,
        presentation_context_id: u8,
        command: &Command,
        _data: Option<IncomingData>,
    ) -> std::result::Result<(), ServiceError> {
        let message_id = command.message_id()?;
        let cancelled = self
            .cancelled
            .lock()
            .map_err(|_| ServiceError::processing_failure("poisoned"))?
            .clone();
        association.add_cancel_handler(message_id, move |id| {
            let _ = cancelled.send(id);
        });

        let pending = Command::response_to(command, status::PENDING, false)?;
        association.write_response(presentation_context_id, &pending, None)?;

        self.operations
            .lock()
            .map_err(|_| ServiceError::processing_failure("poisoned"))?
            .send(Operation {
                association: association.clone(),
                presentation_context_id,
                command: command.clone(),
            })
            .map_err(|_| ServiceError::processing_failure("nobody listening"))?;
        Ok(())
    }
}

fn spawn_find_scp() -> Result<(ListenerHandle, Receiver<Operation>, Receiver<u16>)> {
    let (operations, operations_rx) = mpsc::channel();
    let (cancelled, cancelled_rx) = mpsc::channel();
    let mut registry = ServiceRegistry::new();
    registry.register(HandOverFind {
        operations: Mutex::new(operations),
        cancelled: Mutex::new(cancelled),
    });
    let options = ListenerOptions::new().association_options(
        ServerAssociationOptions::new().with_abstract_syntax(FIND_SOP_CLASS),
    );
    let listener = Listener::bind("127.0.0.1:0", options, Arc::new(registry))?;
    Ok((listener.spawn()?, operations_rx, cancelled_rx))
}

/// Query/Retrieve Level (0008,0052) of "STUDY",
/// in implicit VR little endian.
fn identifier() -> Vec<u8> {
    let mut identifier = vec![0x08, 0x00, 0x52, 0x00, 0x06, 0x00, 0x00, 0x00];
    identifier.extend_from_slice(b"STUDY ");
    identifier
}

impl Operation {
    fn conclude(&self, status: u16) -> Result {
        let rsp = Command::response_to(&self.command, status, false)?;
        self.association
            .write_response(self.presentation_context_id, &rsp, None)?;
        Ok(())
    }
}

#[test]
fn cancel_reaches_the_operation() -> Result {
    let (scp, operations, cancelled) = spawn_find_scp()?;

    let association = ClientAssociationOptions::new()
        .with_abstract_syntax(FIND_SOP_CLASS)
        .establish(scp.local_addr())?;

    let mut rsp = association.cfind(1, &identifier(), Priority::Medium)?;
    let first = rsp.next_response()?.expect("a pending response");
    assert_eq!(first.status(), Some(status::PENDING));
    let operation = operations.recv_timeout(Duration::from_secs(5))?;

    association.ccancel(1, rsp.message_id())?;
    assert_eq!(
        cancelled.recv_timeout(Duration::from_secs(5))?,
        rsp.message_id()
    );

    operation.conclude(status::CANCEL)?;
    let last = rsp.next_response()?.expect("the final response");
    assert_eq!(last.status(), Some(status::CANCEL));
    assert!(rsp.next_response()?.is_none());
    assert_eq!(association.outstanding_requests(), 0);

    association.release(true)?;
    scp.shutdown()?;
    Ok(())
}

#[test]
fn removed_cancel_handler_is_not_called() -> Result {
    let (scp, operations, cancelled) = spawn_find_scp()?;

    let association = ClientAssociationOptions::new()
        .with_abstract_syntax(FIND_SOP_CLASS)
        .establish(scp.local_addr())?;

    let mut rsp = association.cfind(1, &identifier(), Priority::Medium)?;
    rsp.next_response()?;
    let operation = operations.recv_timeout(Duration::from_secs(5))?;
    assert!(operation
        .association
        .remove_cancel_handler(rsp.message_id()));

    association.ccancel(1, rsp.message_id())?;
    assert!(cancelled.recv_timeout(Duration::from_millis(300)).is_err());

    operation.conclude(status::SUCCESS)?;
    assert_eq!(rsp.wait_final()?.status(), Some(status::SUCCESS));

    association.release(true)?;
    scp.shutdown()?;
    Ok(())
}

#[test]
fn release_waits_for_the_outstanding_find() -> Result {
    let (scp, operations, _cancelled) = spawn_find_scp()?;

    let association = ClientAssociationOptions::new()
        .with_abstract_syntax(FIND_SOP_CLASS)
        .establish(scp.local_addr())?;

    let mut rsp = association.cfind(1, &identifier(), Priority::Medium)?;
    rsp.next_response()?;
    let operation = operations.recv_timeout(Duration::from_secs(5))?;

    let releasing = {
        let association = association.clone();
        thread::spawn(move || association.release(false))
    };
    // the acceptor holds the release back until the operation concludes
    thread::sleep(Duration::from_millis(200));
    assert!(!releasing.is_finished());

    operation.conclude(status::SUCCESS)?;
    assert_eq!(rsp.wait_final()?.status(), Some(status::SUCCESS));
    releasing.join().expect("release thread panicked")?;
    assert_eq!(association.outstanding_requests(), 0);

    scp.shutdown()?;
    Ok(())
}

#[test]
fn outstanding_find_fails_on_local_abort() -> Result {
    let (scp, operations, _cancelled) = spawn_find_scp()?;

    let association = ClientAssociationOptions::new()
        .with_abstract_syntax(FIND_SOP_CLASS)
        .establish(scp.local_addr())?;

    let mut rsp = association.cfind(1, &identifier(), Priority::Medium)?;
    rsp.next_response()?;
    let _operation = operations.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(association.outstanding_requests(), 1);

    association.abort()?;
    let err = rsp.wait_final().unwrap_err();
    match err {
        Error::Closed { source } => assert_matches!(*source, Error::AbortedLocally { .. }),
        e => panic!("Expected the association to be closed, got {}", e),
    }
    assert_eq!(association.outstanding_requests(), 0);

    scp.shutdown()?;
    Ok(())
}

#[test]
fn outstanding_find_fails_on_peer_abort() -> Result {
    let (scp, operations, _cancelled) = spawn_find_scp()?;

    let association = ClientAssociationOptions::new()
        .with_abstract_syntax(FIND_SOP_CLASS)
        .establish(scp.local_addr())?;

    let mut rsp = association.cfind(1, &identifier(), Priority::Medium)?;
    rsp.next_response()?;
    let operation = operations.recv_timeout(Duration::from_secs(5))?;

    operation.association.abort()?;
    let err = rsp.wait_final().unwrap_err();
    assert!(err.is_abort());
    match err {
        Error::Closed { source } => assert_matches!(*source, Error::Aborted { .. }),
        e => panic!("Expected the association to be closed, got {}", e),
    }
    association.wait_for_socket_close().unwrap_err();

    scp.shutdown()?;
    Ok(())
}
