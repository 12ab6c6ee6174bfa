//! Timeout helpers and the default durations used across the client.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default bound for connecting to a hub or a peer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound for the whole hub handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest silence tolerated while a peer is sending a file.
pub const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wait for search results.
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(8);

/// Await `fut` for at most `duration`, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}
