//! # Error Types
//!
//! Error handling for the ADC client.
//!
//! This module defines every error variant that can occur while talking to a
//! hub or a peer, from local parse failures up to hub-side protocol violations.
//!
//! ## Error Categories
//! - **Parse Errors**: malformed protocol lines and identifiers
//! - **Connection Errors**: hub or peer links that cannot be opened or kept
//! - **Protocol Errors**: hub or peer behaviour inconsistent with the session state
//! - **Transfer Errors**: verification failures, peer status replies, decompression
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use adc_client::core::message::Message;
//! use adc_client::error::{ProtocolError, Result};
//!
//! fn command_of(line: &str) -> Result<String> {
//!     let msg = Message::parse(line)?;
//!     Ok(msg.command().to_string())
//! }
//!
//! assert_eq!(command_of("ISID AAAB").unwrap(), "SID");
//! assert!(matches!(command_of(""), Err(ProtocolError::MalformedMessage(_))));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Message codec errors
    pub const ERR_EMPTY_LINE: &str = "empty protocol line";
    pub const ERR_INVALID_HEADER: &str = "leading token is not <type><command>";
    pub const ERR_INVALID_ESCAPE: &str = "invalid escape sequence";
    pub const ERR_TRAILING_ESCAPE: &str = "line ends with a lone backslash";
    pub const ERR_INVALID_UTF8: &str = "line is not valid UTF-8";
    pub const ERR_LINE_TOO_LONG: &str = "line exceeds maximum length";

    /// Identifier errors
    pub const ERR_INVALID_BASE32: &str = "text is not valid base32";
    pub const ERR_INVALID_TTH: &str = "tiger tree hash must be 39 base32 characters";

    /// Hub session errors
    pub const ERR_HUB_CLOSED: &str = "hub closed the connection";
    pub const ERR_MISSING_FEATURES: &str = "hub does not support BASE and TIGR";
    pub const ERR_PASSWORD_REQUIRED: &str = "hub requires a password";
    pub const ERR_UNEXPECTED_COMMAND: &str = "unexpected command";

    /// Search errors
    pub const ERR_NO_RESULT_CHANNEL: &str = "search has no result channel";

    /// Download errors
    pub const ERR_NO_TARGET: &str = "download needs a target hash or file name";
    pub const ERR_SHORT_TRANSFER: &str = "peer sent fewer bytes than announced";
    pub const ERR_PEER_NO_ADDRESS: &str = "peer has no reachable address";
    pub const ERR_PEER_FEATURES: &str = "peer does not support BASE and TIGR";
    pub const ERR_BAD_LEAVES_LENGTH: &str = "peer announced an impossible leaf data length";
}

/// ProtocolError is the primary error type for all client operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Malformed identifier: {0}")]
    MalformedIdentifier(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Verification failed: {0}")]
    VerificationFailure(String),

    #[error("Peer status {code}: {description}")]
    PeerStatus { code: u16, description: String },

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("TLS error: {0}")]
    TlsError(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
