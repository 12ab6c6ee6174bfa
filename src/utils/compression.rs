//! Streaming zlib inflation for `ZL1` transfers.
//!
//! The inflated size is announced up front by `CSND`, so the inflater also
//! acts as a decompression-bomb guard: producing more than that is an error.

use flate2::{Decompress, FlushDecompress, Status};

use crate::error::{ProtocolError, Result};

/// Output is produced in pieces of at most this size per reservation.
const INFLATE_CHUNK: usize = 32 * 1024;

/// Incremental zlib decoder bounded by the expected output size.
#[derive(Debug)]
pub struct Inflater {
    stream: Decompress,
    expected: u64,
    finished: bool,
}

impl Inflater {
    pub fn new(expected: u64) -> Self {
        Self {
            stream: Decompress::new(true),
            expected,
            finished: false,
        }
    }

    /// Inflate as much of `input` as possible.
    ///
    /// Returns the number of input bytes consumed and the bytes produced.
    /// Input after the end of the zlib stream is left unconsumed.
    pub fn inflate(&mut self, input: &[u8]) -> Result<(usize, Vec<u8>)> {
        let start_in = self.stream.total_in();
        let mut out = Vec::with_capacity(INFLATE_CHUNK.min(input.len().saturating_mul(4).max(64)));

        while !self.finished {
            let consumed = (self.stream.total_in() - start_in) as usize;
            if out.len() == out.capacity() {
                out.reserve(INFLATE_CHUNK);
            }
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();

            let status = self
                .stream
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::None)
                .map_err(|_| ProtocolError::DecompressionFailure)?;

            if self.stream.total_out() > self.expected {
                return Err(ProtocolError::DecompressionFailure);
            }
            if status == Status::StreamEnd {
                self.finished = true;
                break;
            }

            let progressed =
                self.stream.total_in() != before_in || self.stream.total_out() != before_out;
            let all_consumed = (self.stream.total_in() - start_in) as usize == input.len();
            if !progressed || (all_consumed && out.len() < out.capacity()) {
                break;
            }
        }

        Ok(((self.stream.total_in() - start_in) as usize, out))
    }

    /// True once the zlib stream has ended.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fails unless exactly the expected number of bytes was produced.
    pub fn check_complete(&self) -> Result<()> {
        if self.finished && self.stream.total_out() == self.expected {
            Ok(())
        } else {
            Err(ProtocolError::DecompressionFailure)
        }
    }
}
