//! # Utility Modules
//!
//! Supporting utilities for hashing, compression, logging, and timing.
//!
//! ## Components
//! - **TTH**: Tiger Tree Hash roots, streaming hashing and leaf-level verification
//! - **Compression**: bounded streaming zlib inflation for `ZL1` transfers
//! - **Logging**: `tracing-subscriber` setup
//! - **Timeout**: async timeout wrappers and default durations

pub mod compression;
pub mod logging;
pub mod timeout;
pub mod tth;
