//! # Services
//!
//! Long-lived network actors built on the protocol layer.
//!
//! ## Components
//! - **Hub**: `HubSession`, its reader/writer tasks, and the `HubConnector`
//!   that opens peer links through the hub
//! - **Peer**: `PeerConnection`, one client-to-client transfer link
//! - **Download**: `DownloadDispatcher`, which turns search results into one
//!   verified file

pub mod download;
pub mod hub;
pub mod peer;
