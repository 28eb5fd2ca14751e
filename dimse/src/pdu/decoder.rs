//! Incremental PDU decoding and buffered PDU encoding over byte streams.
//!
//! Neither type is meant to be shared between threads:
//! each one is owned by a single reader (or writer)
//! and driven through `&mut self`.
use std::io::{Cursor, Read, Write};

use bytes::{Buf, BytesMut};
use snafu::{OptionExt, ResultExt};
use tracing::trace;

use super::reader::{self, decode_pdu_body, read_pdu_header, read_pdv, PduHeader};
use super::writer::{self, write_pdu};
use super::{PDataValue, PDataValueType, Pdu};
use crate::association::pdata::PDataWriter;

/// A PDU decoder which reads from a byte stream one PDU at a time.
///
/// The body of the current PDU is held in a receive window
/// of at most the declared PDU length.
/// P-DATA-TF bodies can then be consumed
/// one presentation data value at a time via [`next_pdv`](Self::next_pdv),
/// while other PDUs are decoded whole with [`finish_pdu`](Self::finish_pdu).
#[derive(Debug)]
pub struct PduDecoder<R> {
    stream: R,
    window: BytesMut,
    current: Option<PduHeader>,
    max_pdu_length: u32,
    strict: bool,
}

impl<R> PduDecoder<R>
where
    R: Read,
{
    /// Create a decoder reading from the given stream.
    ///
    /// `max_pdu_length` is the maximum P-DATA-TF PDU length
    /// announced by this node,
    /// only enforced in strict mode.
    pub fn new(stream: R, max_pdu_length: u32, strict: bool) -> Self {
        PduDecoder {
            stream,
            window: BytesMut::new(),
            current: None,
            max_pdu_length,
            strict,
        }
    }

    /// Read the header and body of the next PDU into the receive window.
    ///
    /// Any unconsumed bytes of the previous PDU are discarded.
    pub fn next_header(&mut self) -> reader::Result<PduHeader> {
        self.current = None;
        self.window.clear();

        let header = read_pdu_header(&mut self.stream, self.max_pdu_length, self.strict)?;
        self.window.resize(header.length as usize, 0);
        self.stream
            .read_exact(&mut self.window[..])
            .context(reader::ReadPduSnafu)?;
        trace!(
            "PDU type {:#04x} with {} bytes received",
            header.pdu_type,
            header.length
        );
        self.current = Some(header);
        Ok(header)
    }

    /// Take the next presentation data value
    /// from the body of the current P-DATA-TF PDU.
    ///
    /// Returns `None` once the PDU body is exhausted,
    /// or if the current PDU is not a P-DATA-TF.
    pub fn next_pdv(&mut self) -> reader::Result<Option<PDataValue>> {
        match self.current {
            Some(PduHeader { pdu_type: 0x04, .. }) if !self.window.is_empty() => {}
            _ => return Ok(None),
        }

        let mut cursor = Cursor::new(&self.window[..]);
        let pdv = read_pdv(&mut cursor)?;
        let consumed = cursor.position() as usize;
        self.window.advance(consumed);
        Ok(Some(pdv))
    }

    /// Decode whatever remains of the current PDU body as a whole PDU.
    pub fn finish_pdu(&mut self) -> reader::Result<Pdu> {
        let header = self.current.take().context(reader::NoPduAvailableSnafu)?;
        let body = self.window.split();
        decode_pdu_body(header.pdu_type, &body[..])
    }

    /// Read and decode the next full PDU.
    pub fn read_pdu(&mut self) -> reader::Result<Pdu> {
        self.next_header()?;
        self.finish_pdu()
    }

    /// Update the maximum P-DATA-TF length accepted in strict mode.
    pub fn set_max_pdu_length(&mut self, max_pdu_length: u32) {
        self.max_pdu_length = max_pdu_length;
    }

    /// Retrieve a reference to the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.stream
    }
}

/// A PDU encoder writing whole PDUs to a byte stream.
///
/// Each PDU is encoded in full into an internal buffer
/// before it is written,
/// so that a failure to encode never leaves a partial PDU on the wire.
#[derive(Debug)]
pub struct PduEncoder<W> {
    stream: W,
    buffer: Vec<u8>,
}

impl<W> PduEncoder<W>
where
    W: Write,
{
    pub fn new(stream: W) -> Self {
        PduEncoder {
            stream,
            buffer: Vec::with_capacity(super::DEFAULT_MAX_PDU as usize),
        }
    }

    /// Encode and send one PDU.
    pub fn write_pdu(&mut self, pdu: &Pdu) -> writer::Result<()> {
        self.buffer.clear();
        write_pdu(&mut self.buffer, pdu)?;
        self.stream
            .write_all(&self.buffer)
            .context(writer::SendPduSnafu)?;
        self.stream.flush().context(writer::SendPduSnafu)?;
        trace!("Sent {}", pdu.short_description());
        Ok(())
    }

    /// Obtain a writer of presentation data values
    /// which splits its contents into as many P-DATA-TF PDUs as needed,
    /// none of them longer than `max_pdu_length`.
    pub fn pdata_writer(
        &mut self,
        presentation_context_id: u8,
        value_type: PDataValueType,
        max_pdu_length: u32,
    ) -> PDataWriter<&mut W> {
        PDataWriter::new(
            &mut self.stream,
            presentation_context_id,
            value_type,
            max_pdu_length,
        )
    }

    /// Retrieve a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{AbortRQSource, DEFAULT_MAX_PDU};

    fn pdata_pdu_bytes() -> Vec<u8> {
        let pdu = Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: vec![1, 2, 3, 4],
                },
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Data,
                    is_last: false,
                    data: vec![5; 100],
                },
            ],
        };
        let mut bytes = Vec::new();
        write_pdu(&mut bytes, &pdu).unwrap();
        bytes
    }

    #[test]
    fn decode_pdata_one_value_at_a_time() {
        let mut bytes = pdata_pdu_bytes();
        let mut other = Vec::new();
        write_pdu(&mut other, &Pdu::ReleaseRQ).unwrap();
        bytes.extend(other);

        let mut decoder = PduDecoder::new(&bytes[..], DEFAULT_MAX_PDU, true);
        let header = decoder.next_header().unwrap();
        assert_eq!(header.pdu_type, 0x04);
        assert_eq!(header.length, 6 + 4 + 6 + 100);

        let first = decoder.next_pdv().unwrap().unwrap();
        assert_eq!(first.value_type, PDataValueType::Command);
        assert!(first.is_last);
        assert_eq!(first.data, vec![1, 2, 3, 4]);

        let second = decoder.next_pdv().unwrap().unwrap();
        assert_eq!(second.value_type, PDataValueType::Data);
        assert!(!second.is_last);
        assert_eq!(second.data.len(), 100);

        assert_eq!(decoder.next_pdv().unwrap(), None);

        assert_eq!(decoder.read_pdu().unwrap(), Pdu::ReleaseRQ);
    }

    #[test]
    fn unconsumed_values_are_discarded_on_next_header() {
        let mut bytes = pdata_pdu_bytes();
        let mut other = Vec::new();
        write_pdu(
            &mut other,
            &Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser,
            },
        )
        .unwrap();
        bytes.extend(other);

        let mut decoder = PduDecoder::new(&bytes[..], DEFAULT_MAX_PDU, true);
        decoder.next_header().unwrap();
        decoder.next_pdv().unwrap().unwrap();

        assert_eq!(
            decoder.read_pdu().unwrap(),
            Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser
            }
        );
    }

    #[test]
    fn encoder_writes_whole_pdus() {
        let mut encoder = PduEncoder::new(Vec::new());
        encoder.write_pdu(&Pdu::ReleaseRP).unwrap();
        assert_eq!(encoder.get_mut(), &vec![0x06, 0, 0, 0, 0, 4, 0, 0, 0, 0]);
    }
}
