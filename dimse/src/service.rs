//! Dispatch of incoming DIMSE requests to service handlers.
//!
//! A [`ServiceRegistry`] is built once,
//! filled with [`DimseRqHandler`]s,
//! and shared by every association which should serve requests.
//! Each request which an association receives
//! is passed to the handler registered for its service and SOP class.
//! When there is none,
//! the registry answers with a failure status on its own.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dicom_core::VR;
use dicom_dictionary_std::{tags, uids};
use tracing::{debug, warn};

use crate::association::Association;
use crate::dimse::{status, Command, Dimse, IncomingData};

/// SOP class key matching any SOP class.
pub const ANY_SOP_CLASS: &str = "*";

/// A failure to perform a DIMSE request,
/// answered to the requestor with a failure status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    status: u16,
    error_comment: Option<String>,
}

impl ServiceError {
    pub fn new(status: u16) -> Self {
        ServiceError {
            status,
            error_comment: None,
        }
    }

    /// A processing failure (0110H) with the given explanation.
    pub fn processing_failure(comment: impl Into<String>) -> Self {
        ServiceError::new(status::PROCESSING_FAILURE).with_comment(comment)
    }

    /// Attach a free text explanation,
    /// sent in the _Error Comment_ field (at most 64 characters).
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        let mut comment = comment.into();
        if let Some((i, _)) = comment.char_indices().nth(64) {
            comment.truncate(i);
        }
        self.error_comment = Some(comment);
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn error_comment(&self) -> Option<&str> {
        self.error_comment.as_deref()
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DIMSE service failure (status {:#06x})", self.status)?;
        if let Some(comment) = &self.error_comment {
            write!(f, ": {}", comment)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServiceError {}

impl From<crate::association::Error> for ServiceError {
    fn from(e: crate::association::Error) -> Self {
        ServiceError::processing_failure(e.to_string())
    }
}

impl From<crate::dimse::Error> for ServiceError {
    fn from(e: crate::dimse::Error) -> Self {
        ServiceError::processing_failure(e.to_string())
    }
}

/// A provider of one or more DIMSE services.
///
/// Handlers are called from the reader thread of the association,
/// so no further messages from the peer are processed until `handle` returns.
/// Handlers which need to wait for responses over the same association
/// (such as a C-GET provider issuing C-STORE sub-operations)
/// must do that work on another thread.
pub trait DimseRqHandler: Send + Sync {
    /// The SOP class UIDs served, or [`ANY_SOP_CLASS`].
    fn sop_classes(&self) -> Vec<String>;

    /// The services served.
    fn verbs(&self) -> Vec<Dimse>;

    /// Perform a request.
    ///
    /// The handler writes the responses through
    /// [`Association::write_response`],
    /// the last of them being final (not pending).
    /// Returning an error instead of the final response
    /// makes the registry send a failure response with its status.
    fn handle(
        &self,
        association: &Association,
        presentation_context_id: u8,
        command: &Command,
        data: Option<IncomingData>,
    ) -> Result<(), ServiceError>;
}

/// The Verification service provider,
/// answering C-ECHO requests with success.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct VerificationScp;

impl DimseRqHandler for VerificationScp {
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
    ) -> Result<(), ServiceError> {
        let rsp = Command::response_to(command, status::SUCCESS, false)?;
        association.write_response(presentation_context_id, &rsp, None)?;
        Ok(())
    }
}

/// A set of service handlers indexed by service and SOP class.
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: HashMap<(Dimse, String), Arc<dyn DimseRqHandler>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("ServiceRegistry")
            .field("handlers", &keys)
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under every service and SOP class it declares,
    /// replacing any handler previously registered for the same pair.
    pub fn register<H>(&mut self, handler: H) -> &mut Self
    where
        H: DimseRqHandler + 'static,
    {
        let handler: Arc<dyn DimseRqHandler> = Arc::new(handler);
        for dimse in handler.verbs() {
            if dimse == Dimse::CCancel {
                // cancellation goes through the association's cancel handlers
                continue;
            }
            for sop_class in handler.sop_classes() {
                let sop_class = sop_class
                    .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
                    .to_string();
                self.handlers
                    .insert((dimse, sop_class), Arc::clone(&handler));
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The handler for the given service and SOP class,
    /// falling back to a handler for any SOP class.
    pub fn handler_for(&self, dimse: Dimse, sop_class_uid: &str) -> Option<Arc<dyn DimseRqHandler>> {
        self.handlers
            .get(&(dimse, sop_class_uid.to_string()))
            .or_else(|| self.handlers.get(&(dimse, ANY_SOP_CLASS.to_string())))
            .cloned()
    }

    fn serves(&self, dimse: Dimse) -> bool {
        self.handlers.keys().any(|(d, _)| *d == dimse)
    }

    /// Perform a request received over the given association.
    ///
    /// Failures are answered to the peer with a failure response
    /// rather than reported to the caller.
    pub fn dispatch(
        &self,
        association: &Association,
        presentation_context_id: u8,
        command: Command,
        data: Option<IncomingData>,
    ) {
        let outcome = match command.dimse() {
            Some((dimse, false)) => {
                let sop_class_uid = command.sop_class_uid().unwrap_or_default();
                match self.handler_for(dimse, &sop_class_uid) {
                    Some(handler) => {
                        debug!("{} request for {}", dimse, sop_class_uid);
                        handler.handle(association, presentation_context_id, &command, data)
                    }
                    None if !self.serves(dimse) => {
                        debug!("No provider of {}", dimse);
                        Err(ServiceError::new(status::UNRECOGNIZED_OPERATION))
                    }
                    None => {
                        debug!("No {} provider for SOP class {}", dimse, sop_class_uid);
                        let status = if dimse.is_composite() {
                            status::SOP_CLASS_NOT_SUPPORTED
                        } else {
                            status::NO_SUCH_SOP_CLASS
                        };
                        Err(ServiceError::new(status))
                    }
                }
            }
            _ => {
                debug!("Unrecognized command field {:?}", command.command_field().ok());
                Err(ServiceError::new(status::UNRECOGNIZED_OPERATION))
            }
        };

        if let Err(e) = outcome {
            if let Err(e) = self.write_failure(association, presentation_context_id, &command, &e) {
                warn!("Could not send failure response: {}", e);
            }
        }
    }

    /// Answer a request which may not be performed over the association.
    pub(crate) fn refuse(
        &self,
        association: &Association,
        presentation_context_id: u8,
        command: &Command,
        error: ServiceError,
    ) {
        if let Err(e) = self.write_failure(association, presentation_context_id, command, &error) {
            warn!("Could not send failure response: {}", e);
        }
    }

    fn write_failure(
        &self,
        association: &Association,
        presentation_context_id: u8,
        command: &Command,
        error: &ServiceError,
    ) -> Result<(), ServiceError> {
        debug!("Answering with {}", error);
        let mut rsp = match Command::response_to(command, error.status(), false) {
            Ok(rsp) => rsp,
            Err(e) => {
                // the request cannot be answered, but it is over
                association.operation_done();
                return Err(e.into());
            }
        };
        if let Some(comment) = error.error_comment() {
            rsp = rsp.with_text(tags::ERROR_COMMENT, VR::LO, comment);
        }
        association.write_response(presentation_context_id, &rsp, None)?;
        Ok(())
    }
}
