//! Correlation of DIMSE responses to the requests which caused them.
//!
//! Every request invoked over an association
//! is registered in a table of outstanding operations
//! under its message ID,
//! along with the handler of its responses
//! and the deadline for the next one to arrive.
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use super::session::Association;
use super::{ClosedSnafu, ConnectionClosedSnafu, Result};
use crate::dimse::{status, Command, IncomingData};
use snafu::ResultExt;

/// A response to a DIMSE request,
/// with its data set if one was sent.
#[derive(Debug, Clone)]
pub struct DimseResponse {
    pub command: Command,
    pub data: Option<IncomingData>,
}

impl DimseResponse {
    /// The status of the response,
    /// or `None` if the command set does not carry one.
    pub fn status(&self) -> Option<u16> {
        self.command.status().ok()
    }

    /// Whether more responses to the same request are to follow.
    pub fn is_pending(&self) -> bool {
        self.status().map(status::is_pending).unwrap_or(false)
    }
}

/// Receiver of the responses to one invoked request.
///
/// Called from the association's reader thread
/// once for each pending response
/// and once more for the final response.
/// The handler is dropped after the final response,
/// or when the association closes before that.
pub trait DimseRspHandler: Send {
    fn on_response(&mut self, response: DimseResponse);
}

impl<F> DimseRspHandler for F
where
    F: FnMut(DimseResponse) + Send,
{
    fn on_response(&mut self, response: DimseResponse) {
        self(response)
    }
}

/// Receiver of C-CANCEL requests
/// for an operation being performed by this node.
pub trait CancelRqHandler: Send {
    /// Called with the message ID of the operation to cancel.
    fn on_cancel(&mut self, message_id: u16);
}

impl<F> CancelRqHandler for F
where
    F: FnMut(u16) + Send,
{
    fn on_cancel(&mut self, message_id: u16) {
        self(message_id)
    }
}

/// An outstanding operation.
struct Outstanding {
    /// `None` while the handler is being called
    handler: Option<Box<dyn DimseRspHandler>>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

/// The table of outstanding operations of an association,
/// keyed by message ID.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: BTreeMap<u16, Outstanding>,
}

impl PendingTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, message_id: u16) -> bool {
        self.entries.contains_key(&message_id)
    }

    pub fn insert(
        &mut self,
        message_id: u16,
        handler: Box<dyn DimseRspHandler>,
        timeout: Option<Duration>,
        now: Instant,
    ) {
        self.entries.insert(
            message_id,
            Outstanding {
                handler: Some(handler),
                timeout,
                deadline: timeout.map(|t| now + t),
            },
        );
    }

    /// Take the handler of an outstanding operation out for a response.
    ///
    /// The operation stays in the table,
    /// and a pending response re-arms its deadline.
    /// Returns `None` if there is no such operation.
    pub fn take_handler(
        &mut self,
        message_id: u16,
        pending: bool,
        now: Instant,
    ) -> Option<Box<dyn DimseRspHandler>> {
        let entry = self.entries.get_mut(&message_id)?;
        if pending {
            entry.deadline = entry.timeout.map(|t| now + t);
        }
        entry.handler.take()
    }

    /// Put a handler back after a pending response was delivered.
    pub fn restore_handler(&mut self, message_id: u16, handler: Box<dyn DimseRspHandler>) {
        if let Some(entry) = self.entries.get_mut(&message_id) {
            entry.handler = Some(handler);
        }
    }

    pub fn remove(&mut self, message_id: u16) -> bool {
        self.entries.remove(&message_id).is_some()
    }

    /// The message ID of an operation whose deadline has passed, if any.
    pub fn expired(&self, now: Instant) -> Option<u16> {
        self.entries
            .iter()
            .find(|(_, entry)| matches!(entry.deadline, Some(deadline) if deadline <= now))
            .map(|(id, _)| *id)
    }

    /// Drop all outstanding operations along with their handlers.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A response handler feeding a [`DimseRsp`].
pub(crate) struct ChannelRspHandler {
    sender: mpsc::Sender<DimseResponse>,
}

impl ChannelRspHandler {
    pub fn new(sender: mpsc::Sender<DimseResponse>) -> Self {
        ChannelRspHandler { sender }
    }
}

impl DimseRspHandler for ChannelRspHandler {
    fn on_response(&mut self, response: DimseResponse) {
        // the receiving end may have lost interest
        let _ = self.sender.send(response);
    }
}

/// The responses to a request invoked over an association,
/// in order of arrival.
///
/// Obtained from the request helpers of [`Association`],
/// such as [`cecho`](Association::cecho) or [`cfind`](Association::cfind).
pub struct DimseRsp {
    message_id: u16,
    receiver: mpsc::Receiver<DimseResponse>,
    association: Association,
    finished: bool,
}

impl std::fmt::Debug for DimseRsp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DimseRsp")
            .field("message_id", &self.message_id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl DimseRsp {
    pub(crate) fn new(
        message_id: u16,
        receiver: mpsc::Receiver<DimseResponse>,
        association: Association,
    ) -> Self {
        DimseRsp {
            message_id,
            receiver,
            association,
            finished: false,
        }
    }

    /// The message ID of the request.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Block until the next response arrives.
    ///
    /// Returns `Ok(None)` once the final response was already retrieved.
    /// If the association closes before the final response,
    /// the reason why it closed is returned as an error.
    pub fn next_response(&mut self) -> Result<Option<DimseResponse>> {
        if self.finished {
            return Ok(None);
        }
        match self.receiver.recv() {
            Ok(response) => {
                if !response.is_pending() {
                    self.finished = true;
                }
                Ok(Some(response))
            }
            Err(_) => {
                self.finished = true;
                match self.association.terminal_error() {
                    Some(e) => Err(e).context(ClosedSnafu),
                    None => ConnectionClosedSnafu.fail(),
                }
            }
        }
    }

    /// Block until the final response arrives,
    /// discarding any pending responses before it.
    pub fn wait_final(mut self) -> Result<DimseResponse> {
        let mut last = None;
        while let Some(response) = self.next_response()? {
            last = Some(response);
        }
        match last {
            Some(response) => Ok(response),
            None => ConnectionClosedSnafu.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::{Command, Dimse};

    fn noop() -> Box<dyn DimseRspHandler> {
        Box::new(|_: DimseResponse| {})
    }

    #[test]
    fn pending_response_rearms_the_deadline() {
        let t0 = Instant::now();
        let mut table = PendingTable::default();
        table.insert(1, noop(), Some(Duration::from_secs(5)), t0);
        table.insert(2, noop(), None, t0);
        assert_eq!(table.len(), 2);

        assert_eq!(table.expired(t0 + Duration::from_secs(4)), None);
        assert_eq!(table.expired(t0 + Duration::from_secs(5)), Some(1));

        let t1 = t0 + Duration::from_secs(3);
        let handler = table.take_handler(1, true, t1).unwrap();
        table.restore_handler(1, handler);
        assert_eq!(table.expired(t0 + Duration::from_secs(7)), None);
        assert_eq!(table.expired(t1 + Duration::from_secs(5)), Some(1));

        // no deadline, never expires
        assert!(table.remove(1));
        assert_eq!(table.expired(t0 + Duration::from_secs(3600)), None);
        assert!(table.contains(2));
        assert!(!table.contains(1));
    }

    #[test]
    fn unknown_message_id_has_no_handler() {
        let mut table = PendingTable::default();
        table.insert(3, noop(), None, Instant::now());
        assert!(table.take_handler(4, false, Instant::now()).is_none());
        assert!(!table.remove(4));
        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn closure_handlers_receive_responses() {
        let (tx, rx) = mpsc::channel();
        let mut handler: Box<dyn DimseRspHandler> =
            Box::new(move |rsp: DimseResponse| tx.send(rsp.status()).unwrap());

        let rq = Command::request(Dimse::CEcho, "1.2.840.10008.1.1", None, false);
        let rsp = Command::response_to(&rq, status::PENDING, false).unwrap();
        handler.on_response(DimseResponse {
            command: rsp,
            data: None,
        });
        assert_eq!(rx.recv().unwrap(), Some(status::PENDING));
    }
}
