//! Tokio codecs for ADC connections.
//!
//! [`AdcCodec`] frames newline-terminated protocol lines for hub connections.
//! [`TransferCodec`] adds the binary body mode a peer connection needs after
//! `CSND`: a fixed number of raw bytes, or a zlib stream inflated on the fly.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::compression::Inflater;

/// Default upper bound for a single protocol line.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Line codec: one [`Message`] per `\n` terminated line.
#[derive(Debug, Clone)]
pub struct AdcCodec {
    max_line_length: usize,
    // Bytes already scanned for a newline in the current buffer.
    scanned: usize,
}

impl AdcCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            scanned: 0,
        }
    }
}

impl Default for AdcCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_LENGTH)
    }
}

impl Decoder for AdcCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            let newline = src[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                if src.len() > self.max_line_length {
                    return Err(ProtocolError::MalformedMessage(format!(
                        "{} ({} bytes)",
                        constants::ERR_LINE_TOO_LONG,
                        src.len()
                    )));
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let line = src.split_to(self.scanned + offset + 1);
            self.scanned = 0;
            let line = &line[..line.len() - 1];

            // A bare newline is a keep-alive.
            if line.is_empty() {
                trace!("keep-alive");
                continue;
            }
            if line.len() > self.max_line_length {
                return Err(ProtocolError::MalformedMessage(
                    constants::ERR_LINE_TOO_LONG.into(),
                ));
            }

            let text = std::str::from_utf8(line).map_err(|_| {
                ProtocolError::MalformedMessage(constants::ERR_INVALID_UTF8.into())
            })?;
            return Message::parse(text).map(Some);
        }
    }
}

impl Encoder<Message> for AdcCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let line = item.format();
        dst.reserve(line.len() + 1);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

/// A frame read from a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame {
    Command(Message),
    Data(Bytes),
}

#[derive(Debug)]
enum Mode {
    Lines,
    Raw { remaining: u64 },
    Compressed { inflater: Inflater },
}

/// Peer codec: protocol lines, switched into a body mode after `CSND`.
#[derive(Debug)]
pub struct TransferCodec {
    lines: AdcCodec,
    mode: Mode,
}

impl TransferCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            lines: AdcCodec::new(max_line_length),
            mode: Mode::Lines,
        }
    }

    /// The next `len` bytes are body, raw or zlib compressed.
    ///
    /// With compression `len` is the inflated size; the compressed stream ends
    /// where zlib says it does.
    pub fn expect_body(&mut self, len: u64, compressed: bool) {
        self.mode = match (len, compressed) {
            (0, _) => Mode::Lines,
            (len, false) => Mode::Raw { remaining: len },
            (len, true) => Mode::Compressed {
                inflater: Inflater::new(len),
            },
        };
    }

    /// True while a body is still being read.
    pub fn in_body(&self) -> bool {
        !matches!(self.mode, Mode::Lines)
    }
}

impl Default for TransferCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_LENGTH)
    }
}

impl Decoder for TransferCodec {
    type Item = TransferFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<TransferFrame>> {
        match &mut self.mode {
            Mode::Lines => Ok(self.lines.decode(src)?.map(TransferFrame::Command)),
            Mode::Raw { remaining } => {
                if src.is_empty() {
                    return Ok(None);
                }
                let take = src.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                *remaining -= take as u64;
                if *remaining == 0 {
                    self.mode = Mode::Lines;
                }
                Ok(Some(TransferFrame::Data(src.split_to(take).freeze())))
            }
            Mode::Compressed { inflater } => {
                if src.is_empty() {
                    return Ok(None);
                }
                let (consumed, out) = inflater.inflate(src)?;
                src.advance(consumed);
                if inflater.is_finished() {
                    inflater.check_complete()?;
                    self.mode = Mode::Lines;
                }
                if out.is_empty() {
                    // Need more input before anything can be produced.
                    return if self.in_body() {
                        Ok(None)
                    } else {
                        Ok(Some(TransferFrame::Data(Bytes::new())))
                    };
                }
                Ok(Some(TransferFrame::Data(Bytes::from(out))))
            }
        }
    }
}

impl Encoder<Message> for TransferCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        self.lines.encode(item, dst)
    }
}
