use dicom_dictionary_std::uids;
use dicom_dimse::association::pending::DimseResponse;
use dicom_dimse::association::{Association, IdleCheck};
use dicom_dimse::dimse::{status, Command, Dimse, IncomingData};
use dicom_dimse::listener::{Listener, ListenerHandle, ListenerOptions};
use dicom_dimse::service::{DimseRqHandler, ServiceError, ServiceRegistry};
use dicom_dimse::{ClientAssociationOptions, ServerAssociationOptions, SessionOptions};
use matches::assert_matches;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Answers each C-ECHO only once it is let through.
struct GatedEcho {
    gate: Mutex<Receiver<()>>,
}

impl DimseRqHandler for GatedEcho {
    fn sop_classes(&self) -> Vec<String> {
        vec![uids::VERIFICATION.to_string()]
    }

    fn verbs(&self) -> Vec<Dimse> {
        vec![Dimse::CEcho]
    }

    fn handle(
        &self,
        association: &Association,
        presentation_context_id: u8,
        command: &Command,
        _data: Option<IncomingData>,
    ) -> std::result::Result<(), ServiceError> {
        let opened = self
            .gate
            .lock()
            .map_err(|_| ServiceError::processing_failure("poisoned"))?
            .recv_timeout(Duration::from_secs(10));
        if opened.is_err() {
            // leave the request unanswered
            return Ok(());
        }
        let rsp = Command::response_to(command, status::SUCCESS, false)?;
        association.write_response(presentation_context_id, &rsp, None)?;
        Ok(())
    }
}

fn spawn_gated_scp() -> Result<(ListenerHandle, Sender<()>)> {
    let (gate, receiver) = mpsc::channel();
    let mut registry = ServiceRegistry::new();
    registry.register(GatedEcho {
        gate: Mutex::new(receiver),
    });
    let options = ListenerOptions::new().association_options(
        ServerAssociationOptions::new().with_abstract_syntax(uids::VERIFICATION),
    );
    let listener = Listener::bind("127.0.0.1:0", options, Arc::new(registry))?;
    Ok((listener.spawn()?, gate))
}

#[test]
fn invoking_beyond_the_window_blocks() -> Result {
    let (scp, gate) = spawn_gated_scp()?;

    let association = ClientAssociationOptions::new()
        .with_abstract_syntax(uids::VERIFICATION)
        .establish(scp.local_addr())?;
    assert_eq!(association.max_ops_invoked(), 1);

    let first = association.cecho(1)?;
    assert_eq!(association.outstanding_requests(), 1);

    let (done, second_sent) = mpsc::channel();
    let other = association.clone();
    thread::spawn(move || {
        let outcome = other.cecho(1).map(|rsp| rsp.message_id());
        let _ = done.send(outcome.is_ok());
    });

    thread::sleep(Duration::from_millis(300));
    assert_eq!(second_sent.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(association.outstanding_requests(), 1);

    // let the first request be answered, freeing its slot
    gate.send(())?;
    assert_eq!(first.wait_final()?.status(), Some(status::SUCCESS));
    assert_eq!(second_sent.recv_timeout(Duration::from_secs(5))?, true);

    gate.send(())?;
    association.wait_for_outstanding_responses()?;
    assert_eq!(association.outstanding_requests(), 0);

    association.release(false)?;
    scp.shutdown()?;
    Ok(())
}

#[test]
fn overdue_response_aborts_the_association() -> Result {
    let (scp, gate) = spawn_gated_scp()?;

    let association = ClientAssociationOptions::new()
        .with_abstract_syntax(uids::VERIFICATION)
        .session_options(
            SessionOptions::new()
                .response_timeout(Some(Duration::from_millis(100)))
                // checked by hand below
                .idle_check_period(Duration::from_secs(3600)),
        )
        .establish(scp.local_addr())?;

    let (sender, responses) = mpsc::channel();
    let message_id = association.invoke(
        1,
        Command::request(Dimse::CEcho, uids::VERIFICATION, None, false),
        None,
        Box::new(move |rsp: DimseResponse| {
            let _ = sender.send(rsp);
        }),
        Some(Duration::from_millis(100)),
    )?;

    assert_eq!(association.check_idle(Instant::now())?, IdleCheck::Active);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(
        association.check_idle(Instant::now())?,
        IdleCheck::Aborted { message_id }
    );

    // the handler is dropped without any response
    assert!(responses.recv_timeout(Duration::from_secs(5)).is_err());
    association.wait_for_socket_close().unwrap_err();
    let error = association
        .terminal_error()
        .expect("association should have failed");
    assert_matches!(*error, dicom_dimse::association::Error::ResponseTimeout { .. });

    drop(gate);
    scp.shutdown()?;
    Ok(())
}

#[test]
fn idle_association_is_released() -> Result {
    let (scp, _gate) = spawn_gated_scp()?;

    let association = ClientAssociationOptions::new()
        .with_abstract_syntax(uids::VERIFICATION)
        .session_options(
            SessionOptions::new()
                .idle_timeout(Some(Duration::from_millis(100)))
                .idle_check_period(Duration::from_secs(3600)),
        )
        .establish(scp.local_addr())?;

    assert_eq!(association.check_idle(Instant::now())?, IdleCheck::Active);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(association.check_idle(Instant::now())?, IdleCheck::Released);

    association.wait_for_socket_close()?;
    assert!(association.terminal_error().is_none());
    assert_eq!(association.check_idle(Instant::now())?, IdleCheck::NotReady);

    scp.shutdown()?;
    Ok(())
}

#[test]
fn idle_association_is_reaped_in_the_background() -> Result {
    let (scp, _gate) = spawn_gated_scp()?;

    let association = ClientAssociationOptions::new()
        .with_abstract_syntax(uids::VERIFICATION)
        .session_options(
            SessionOptions::new()
                .idle_timeout(Some(Duration::from_millis(100)))
                .idle_check_period(Duration::from_millis(20)),
        )
        .establish(scp.local_addr())?;

    association.wait_for_socket_close()?;
    assert!(association.terminal_error().is_none());

    scp.shutdown()?;
    Ok(())
}
