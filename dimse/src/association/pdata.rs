//! Fragmentation of DIMSE messages into presentation data values
//! and their reassembly on the receiving side.
use std::io::Write;

use snafu::{ensure, Snafu};

use crate::pdu::{PDataValue, PDataValueType, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE};

/// Set up the P-Data PDU header for sending.
fn setup_pdata_header(buffer: &mut [u8], value_type: PDataValueType, is_last: bool) {
    let data_len = (buffer.len() - 12) as u32;

    // full PDU length (minus PDU type and reserved byte)
    let pdu_len = data_len + 4 + 2;
    buffer[2..6].copy_from_slice(&pdu_len.to_be_bytes());

    // presentation data length (data + 2 properties below)
    let pdv_data_len = data_len + 2;
    buffer[6..10].copy_from_slice(&pdv_data_len.to_be_bytes());

    // message control header
    let mut control = if is_last { 0x02 } else { 0x00 };
    if value_type == PDataValueType::Command {
        control |= 0x01;
    }
    buffer[11] = control;
}

/// A P-Data value writer.
///
/// Using this as a [standard writer](std::io::Write)
/// will automatically split the incoming bytes
/// into separate P-DATA-TF PDUs if they do not fit in a single one,
/// each carrying a single presentation data value
/// of the configured type.
/// All fragments but the last are marked as non-final.
///
/// The last fragment is sent on [`finish`](Self::finish),
/// or when the writer is dropped,
/// unless the message was [abandoned](Self::abandon)
/// or a previous fragment could not be sent.
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    value_type: PDataValueType,
    max_data_len: u32,
    finished: bool,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data value writer.
    ///
    /// `max_pdu_length` is the maximum value of the PDU-length property
    /// admitted by the receiving node.
    pub(crate) fn new(
        stream: W,
        presentation_context_id: u8,
        value_type: PDataValueType,
        max_pdu_length: u32,
    ) -> Self {
        let max_data_length = calculate_max_data_len_single(max_pdu_length);
        let mut buffer =
            Vec::with_capacity((max_data_length.min(MAXIMUM_PDU_SIZE) + PDU_HEADER_SIZE + 6) as usize);
        buffer.extend([
            // PDU-type + reserved byte
            0x04,
            0x00,
            // full PDU length, unknown at this point
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            // presentation data length, unknown at this point
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            // presentation context id
            presentation_context_id,
            // message control header, unknown at this point
            0xFF,
        ]);

        PDataWriter {
            stream,
            value_type,
            max_data_len: max_data_length,
            buffer,
            finished: false,
        }
    }

    /// Declare to have finished sending P-Data fragments,
    /// thus emitting the last P-Data fragment PDU.
    ///
    /// This is also done automatically once the P-Data writer is dropped.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()
    }

    /// Give up on the message being written.
    ///
    /// The bytes still buffered are discarded
    /// and no last fragment is emitted,
    /// so the peer never sees the message as complete.
    pub fn abandon(mut self) {
        self.finished = true;
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        if !self.finished {
            self.finished = true;
            setup_pdata_header(&mut self.buffer, self.value_type, true);
            self.stream.write_all(&self.buffer[..])?;
            self.stream.flush()?;
        }
        Ok(())
    }

    /// Send the full buffer as a non-final fragment.
    fn dispatch_pdu(&mut self) -> std::io::Result<()> {
        debug_assert!(self.buffer.len() > 12);
        setup_pdata_header(&mut self.buffer, self.value_type, false);
        if let Err(e) = self.stream.write_all(&self.buffer) {
            // the message is broken, do not complete it on drop
            self.finished = true;
            return Err(e);
        }

        // back to just the header
        self.buffer.truncate(12);

        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let total_len = self.max_data_len as usize + 12;
        if self.buffer.len() + buf.len() <= total_len {
            self.buffer.extend(buf);
            Ok(buf.len())
        } else {
            // fill in the rest of the buffer, send PDU,
            // and leave out the rest for subsequent writes
            let buf = &buf[..total_len - self.buffer.len()];
            self.buffer.extend(buf);
            debug_assert_eq!(self.buffer.len(), total_len);
            self.dispatch_pdu()?;
            Ok(buf.len())
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// With the P-Data writer dropped,
/// this `Drop` implementation
/// will construct and emit the last P-Data fragment PDU
/// if it was not sent yet.
impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish_impl();
    }
}

/// Determine the maximum length of actual PDV data
/// when encapsulated in a PDU with the given length property.
#[inline]
fn calculate_max_data_len_single(pdu_len: u32) -> u32 {
    // data length: 4 bytes
    // control header: 2 bytes
    pdu_len.saturating_sub(4 + 2).max(1)
}

/// An error in the sequence of received presentation data values.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AssembleError {
    #[snafu(display(
        "Fragment for presentation context {} interleaved with a message on context {}",
        got,
        expected
    ))]
    ContextMismatch { expected: u8, got: u8 },

    #[snafu(display("Data set fragment received without a preceding command"))]
    DataWithoutCommand,

    #[snafu(display("Command fragment received while a data set was expected"))]
    CommandInsideDataSet,
}

/// A fully reassembled command set or data set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Command { presentation_context_id: u8, data: Vec<u8> },
    DataSet { presentation_context_id: u8, data: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Command(u8),
    AwaitData(u8),
    Data(u8),
}

/// Reassembles presentation data values into whole command sets and data sets.
///
/// Once a command set declares that a data set follows,
/// the owner must call [`expect_data_set`](Self::expect_data_set)
/// so that data fragments are admitted.
#[derive(Debug)]
pub struct PDataAssembler {
    stage: Stage,
    buffer: Vec<u8>,
}

impl Default for PDataAssembler {
    fn default() -> Self {
        PDataAssembler {
            stage: Stage::Idle,
            buffer: Vec::new(),
        }
    }
}

impl PDataAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit the data set of the command last assembled.
    pub fn expect_data_set(&mut self, presentation_context_id: u8) {
        self.stage = Stage::AwaitData(presentation_context_id);
    }

    /// Whether no message is partially received.
    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Idle
    }

    /// Take in one presentation data value,
    /// returning the command set or data set it completes, if any.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<Fragment>, AssembleError> {
        let PDataValue {
            presentation_context_id: pcid,
            value_type,
            is_last,
            mut data,
        } = pdv;

        match (self.stage, value_type) {
            (Stage::Idle, PDataValueType::Command) => {
                self.buffer.clear();
                self.stage = Stage::Command(pcid);
            }
            (Stage::Command(expected), PDataValueType::Command)
            | (Stage::Data(expected), PDataValueType::Data) => {
                ensure!(expected == pcid, ContextMismatchSnafu { expected, got: pcid });
            }
            (Stage::AwaitData(expected), PDataValueType::Data) => {
                ensure!(expected == pcid, ContextMismatchSnafu { expected, got: pcid });
                self.buffer.clear();
                self.stage = Stage::Data(pcid);
            }
            (Stage::Idle, PDataValueType::Data) => return DataWithoutCommandSnafu.fail(),
            (Stage::Command(_), PDataValueType::Data) => return DataWithoutCommandSnafu.fail(),
            (Stage::AwaitData(_), PDataValueType::Command)
            | (Stage::Data(_), PDataValueType::Command) => {
                return CommandInsideDataSetSnafu.fail()
            }
        }

        if self.buffer.is_empty() {
            self.buffer = std::mem::take(&mut data);
        } else {
            self.buffer.append(&mut data);
        }

        if !is_last {
            return Ok(None);
        }

        let data = std::mem::take(&mut self.buffer);
        let fragment = match self.stage {
            Stage::Command(presentation_context_id) => Fragment::Command {
                presentation_context_id,
                data,
            },
            _ => Fragment::DataSet {
                presentation_context_id: pcid,
                data,
            },
        };
        self.stage = Stage::Idle;
        Ok(Some(fragment))
    }
}
