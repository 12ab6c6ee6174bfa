//! PID, CID and SID identifiers.
//!
//! All three share one representation: the raw bytes plus their canonical
//! text form, which is standard base32 with the `=` padding stripped.

use std::fmt;
use std::sync::OnceLock;

use data_encoding::{Encoding, Specification, BASE32_NOPAD};
use digest::Digest;

use crate::error::{constants, ProtocolError, Result};

/// Encode bytes as unpadded base32.
pub fn encode_base32(raw: &[u8]) -> String {
    BASE32_NOPAD.encode(raw)
}

/// Decode unpadded base32, rejecting non-canonical trailing bits.
pub fn decode_base32(text: &str) -> Result<Vec<u8>> {
    BASE32_NOPAD
        .decode(text.trim_end_matches('=').as_bytes())
        .map_err(|e| {
            ProtocolError::MalformedIdentifier(format!("{}: {e}", constants::ERR_INVALID_BASE32))
        })
}

/// Hub-assigned SIDs are 4 characters (20 bits) so their last symbol carries
/// bits that do not fill a byte. Those are ignored rather than rejected.
fn lenient_base32() -> &'static Encoding {
    static LENIENT: OnceLock<Encoding> = OnceLock::new();
    LENIENT.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ234567");
        spec.check_trailing_bits = false;
        spec.encoding().unwrap_or_else(|_| BASE32_NOPAD.clone())
    })
}

/// Decode base32 whose last symbol may carry non-zero padding bits, as hub
/// SIDs, password challenges and key prints do.
pub fn decode_base32_lenient(text: &str) -> Result<Vec<u8>> {
    lenient_base32()
        .decode(text.trim_end_matches('=').as_bytes())
        .map_err(|e| {
            ProtocolError::MalformedIdentifier(format!(
                "{}: {text:?}: {e}",
                constants::ERR_INVALID_BASE32
            ))
        })
}

/// An ADC identifier (PID, CID or SID). Immutable after construction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    raw: Vec<u8>,
    encoded: String,
}

impl Identifier {
    /// Wrap arbitrary bytes with their base32 text form.
    pub fn from_raw(raw: impl Into<Vec<u8>>) -> Self {
        let raw = raw.into();
        let encoded = encode_base32(&raw);
        Self { raw, encoded }
    }

    /// Private ID from caller-supplied entropy. Never fails.
    pub fn private(seed: impl Into<Vec<u8>>) -> Self {
        Self::from_raw(seed)
    }

    /// Client ID: the private ID's raw bytes hashed once with `D`.
    pub fn client_id<D: Digest>(pid: &Identifier) -> Self {
        Self::from_raw(D::digest(&pid.raw).to_vec())
    }

    /// Session ID as sent by the hub. The text is kept verbatim.
    pub fn session(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Err(ProtocolError::MalformedIdentifier(
                constants::ERR_INVALID_BASE32.into(),
            ));
        }
        let raw = decode_base32_lenient(text)?;
        Ok(Self {
            raw,
            encoded: text.trim_end_matches('=').to_string(),
        })
    }

    /// Parse a canonical (CID-style) identifier.
    pub fn decode(text: &str) -> Result<Self> {
        decode_base32(text).map(Self::from_raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.encoded)
    }
}
