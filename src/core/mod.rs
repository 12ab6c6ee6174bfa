//! # Core Protocol Components
//!
//! Identifiers, protocol lines, and their framing over byte streams.
//!
//! ## Components
//! - **Identifier**: PID/CID/SID values with their base32 text form
//! - **Message**: one ADC line, its escaping rules, parse and format
//! - **Fields**: keyed (`FieldMap`) and positional (`FieldSlice`) parameter containers
//! - **Codec**: Tokio codecs for hub lines and peer transfers
//!
//! ## Wire Format
//! ```text
//! <type><CMD> <param> <param> ...\n
//! ```
//!
//! ## Limits
//! - Maximum line length: 64 KiB unless configured otherwise
//! - Non-UTF-8 lines are rejected

pub mod codec;
pub mod fields;
pub mod identifier;
pub mod message;
