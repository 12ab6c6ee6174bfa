//! # Protocol Logic
//!
//! Session-level ADC behaviour that does not touch sockets.
//!
//! ## Components
//! - **Handshake**: `SessionState` and the `HubHandshake` login state machine
//! - **Peers**: the table of other users built from `BINF`/`IQUI`
//! - **Search**: search requests, their tokens and result matching
//! - **Peer**: client-to-client connection and transfer commands
//! - **Status**: `STA` replies and their severities

pub mod handshake;
pub mod peer;
pub mod peers;
pub mod search;
pub mod status;
