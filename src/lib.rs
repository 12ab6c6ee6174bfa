//! # adc-client
//!
//! A client for the ADC (Advanced Direct Connect) peer-to-peer protocol.
//!
//! The crate connects to a hub, announces an identity, publishes searches and
//! downloads the first matching file from a peer, verifying it against its
//! Tiger Tree Hash while the bytes stream in.
//!
//! ## Layout
//! - [`core`]: identifiers, protocol lines, field containers and codecs
//! - [`protocol`]: hub handshake state machine, searches, peer commands
//! - [`transport`]: hub endpoints and plain/TLS connections
//! - [`service`]: the live hub session, peer transfers and the download dispatcher
//! - [`utils`]: Tiger tree hashing, zlib inflation, timeouts and logging
//!
//! ## Example
//! ```ignore
//! let endpoint = HubEndpoint::parse("adcs://hub.example.org:412")?;
//! let session = HubSession::connect(pid, &endpoint, &config.hub, StdRng::from_os_rng()).await?;
//!
//! let download = DownloadConfig::new("out.bin").with_hash(tth).with_settings(&config.download);
//! let mut dispatcher = DownloadDispatcher::new(download, session.connector(&config.download)).await?;
//! let mut search = Search::new(&mut rng);
//! search.add_tth(tth);
//! search.set_result_channel(dispatcher.result_channel());
//! session.search(search).await?;
//!
//! let done = dispatcher.final_channel().expect("taken once");
//! tokio::spawn(dispatcher.run(Duration::from_secs(8)));
//! let size = done.await?;
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::AdcConfig;
pub use crate::core::identifier::Identifier;
pub use crate::core::message::{Message, MessageType};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::search::{Search, SearchResult};
pub use crate::protocol::handshake::SessionState;
pub use crate::service::download::{DownloadConfig, DownloadDispatcher, PeerConnector};
pub use crate::service::hub::{HubConnector, HubSession};
pub use crate::transport::HubEndpoint;
pub use crate::utils::tth::TigerTreeHash;
