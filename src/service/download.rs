//! # Download Dispatcher
//!
//! Turns a stream of search results into one verified file.
//!
//! The dispatcher owns the output file and the receiving end of the result
//! channel. [`DownloadDispatcher::run`] takes results in arrival order, skips
//! those that are not the wanted file, and tries the rest one at a time until
//! a transfer verifies or the deadline passes. The outcome is written exactly
//! once to the final channel: the verified byte count, or 0.
//!
//! ## Attempt
//! 1. Open the peer through the [`PeerConnector`]
//! 2. Fetch tree leaves when the file is larger than the leaf threshold
//! 3. `CGET` the file by hash (or by path), with `ZL1` when both sides agree
//! 4. Stream the body into the file through a [`TreeVerifier`]
//!
//! A failed attempt truncates the file and the run goes on with the next
//! result.
//!
//! ## Timing
//! - The deadline bounds the wait for results, not a transfer in flight
//! - No attempt starts once the deadline has passed
//! - A run without a verified transfer lasts the full timeout
//!
//! ## Safety
//! - The output file is truncated on open and after every failed attempt
//! - Nothing is reported until the root hash (or, without a hash, the
//!   advertised size) checks out

use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::DownloadSettings;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::peer::{TransferKind, TransferRequest};
use crate::protocol::search::SearchResult;
use crate::service::peer::PeerConnection;
use crate::utils::tth::{TigerTreeHash, TreeVerifier};

/// Opens a ready-to-use connection to the peer behind a search result.
pub trait PeerConnector: Send + Sync {
    fn open(
        &self,
        result: &SearchResult,
    ) -> impl Future<Output = Result<PeerConnection>> + Send;
}

/// What to download and where to put it.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub output: PathBuf,
    /// Content hash; results must carry the same one
    pub hash: Option<TigerTreeHash>,
    /// Exact file name to accept when no hash is known
    pub file_name: Option<String>,
    /// Ask peers for `ZL1` when they support it
    pub compress: bool,
    pub idle_timeout: Duration,
    /// Fetch tree leaves for files larger than this
    pub leaves_threshold: u64,
    pub result_backlog: usize,
}

impl DownloadConfig {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        let defaults = DownloadSettings::default();
        Self {
            output: output.into(),
            hash: None,
            file_name: None,
            compress: defaults.compress,
            idle_timeout: defaults.transfer_idle_timeout,
            leaves_threshold: defaults.leaves_threshold,
            result_backlog: defaults.result_backlog,
        }
    }

    pub fn with_hash(mut self, hash: TigerTreeHash) -> Self {
        self.hash = Some(hash);
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Take transfer tuning from the loaded configuration.
    pub fn with_settings(mut self, settings: &DownloadSettings) -> Self {
        self.compress = settings.compress;
        self.idle_timeout = settings.transfer_idle_timeout;
        self.leaves_threshold = settings.leaves_threshold;
        self.result_backlog = settings.result_backlog;
        self
    }

    /// Whether `result` names the file this download is after.
    pub fn accepts(&self, result: &SearchResult) -> bool {
        match (self.hash, self.file_name.as_deref()) {
            (Some(hash), _) => result.tth == Some(hash),
            (None, Some(name)) => result.base_name() == name,
            (None, None) => false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.hash.is_none() && self.file_name.as_deref().map_or(true, str::is_empty) {
            return Err(ProtocolError::ConfigError(constants::ERR_NO_TARGET.into()));
        }
        if self.result_backlog == 0 {
            return Err(ProtocolError::ConfigError(
                "result backlog must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

pub struct DownloadDispatcher<C> {
    config: DownloadConfig,
    connector: C,
    file: File,
    results_tx: mpsc::Sender<SearchResult>,
    results_rx: mpsc::Receiver<SearchResult>,
    final_tx: oneshot::Sender<u64>,
    final_rx: Option<oneshot::Receiver<u64>>,
}

impl<C: PeerConnector> DownloadDispatcher<C> {
    /// Validate `config` and create (or truncate) the output file.
    pub async fn new(config: DownloadConfig, connector: C) -> Result<Self> {
        config.validate()?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.output)
            .await?;
        let (results_tx, results_rx) = mpsc::channel(config.result_backlog);
        let (final_tx, final_rx) = oneshot::channel();
        Ok(Self {
            config,
            connector,
            file,
            results_tx,
            results_rx,
            final_tx,
            final_rx: Some(final_rx),
        })
    }

    /// Sender to bind to a search.
    pub fn result_channel(&self) -> mpsc::Sender<SearchResult> {
        self.results_tx.clone()
    }

    /// Receiver for the outcome. Only the first call gets it.
    pub fn final_channel(&mut self) -> Option<oneshot::Receiver<u64>> {
        self.final_rx.take()
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Try results until one verifies or `timeout` passes. Returns the
    /// outcome that was also sent on the final channel.
    ///
    /// The deadline bounds the wait for results, not a transfer already in
    /// progress. No new attempt starts once it has passed. A run that finds
    /// no verified transfer always lasts the full `timeout`, even if every
    /// sender is gone.
    #[instrument(skip(self), fields(output = %self.config.output.display()))]
    pub async fn run(self, timeout: Duration) -> u64 {
        let Self {
            config,
            connector,
            mut file,
            results_tx,
            mut results_rx,
            final_tx,
            ..
        } = self;
        // Only searches keep the channel open from here on.
        drop(results_tx);

        let deadline = Instant::now() + timeout;
        let mut outcome = 0;
        loop {
            // A queued result is returned even after the deadline, so check
            // the clock before every receive.
            if Instant::now() >= deadline {
                debug!("search deadline reached");
                break;
            }
            let result = match timeout_at(deadline, results_rx.recv()).await {
                Ok(Some(result)) => result,
                Ok(None) => {
                    debug!("result channel closed, waiting out the deadline");
                    sleep_until(deadline).await;
                    break;
                }
                Err(_) => {
                    debug!("search deadline reached");
                    break;
                }
            };
            if !config.accepts(&result) {
                trace!(%result, "skipping result");
                continue;
            }

            info!(%result, "trying peer");
            match attempt(&config, &connector, &mut file, &result).await {
                Ok(size) => {
                    outcome = size;
                    break;
                }
                Err(e) => {
                    warn!(source = %result.source, error = %e, "transfer failed");
                    if let Err(e) = rewind(&mut file).await {
                        warn!(error = %e, "cannot reset output file");
                        break;
                    }
                }
            }
        }

        if outcome == 0 {
            if let Err(e) = rewind(&mut file).await {
                warn!(error = %e, "cannot truncate output file");
            }
        } else if let Err(e) = file.sync_all().await {
            warn!(error = %e, "cannot sync output file");
            outcome = 0;
            let _ = rewind(&mut file).await;
        }

        let _ = final_tx.send(outcome);
        outcome
    }
}

async fn rewind(file: &mut File) -> Result<()> {
    file.set_len(0).await?;
    file.seek(SeekFrom::Start(0)).await?;
    Ok(())
}

async fn verifier_for<S>(
    config: &DownloadConfig,
    peer: &mut PeerConnection<S>,
    root: TigerTreeHash,
    size: u64,
) -> Result<TreeVerifier>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    if size <= config.leaves_threshold {
        return Ok(TreeVerifier::root_only(root));
    }
    let leaves = match peer.fetch_leaves(root, size).await {
        Ok(leaves) => leaves,
        // The link is out of step with the peer after these.
        Err(e @ (ProtocolError::ProtocolViolation(_) | ProtocolError::Timeout)) => return Err(e),
        Err(e) => {
            debug!(error = %e, "no leaves, verifying the root only");
            return Ok(TreeVerifier::root_only(root));
        }
    };
    Ok(TreeVerifier::with_leaves(root, &leaves, size).unwrap_or_else(|e| {
        debug!(error = %e, "unusable leaves, verifying the root only");
        TreeVerifier::root_only(root)
    }))
}

/// One transfer from one peer into `file`.
async fn attempt<C: PeerConnector>(
    config: &DownloadConfig,
    connector: &C,
    file: &mut File,
    result: &SearchResult,
) -> Result<u64> {
    let mut peer = connector.open(result).await?;
    let compressed = config.compress && peer.features().supports("ZLIG");

    let root = config.hash.or(result.tth);
    let (request, mut verifier) = match root {
        Some(root) => (
            TransferRequest::by_hash(TransferKind::File, root, compressed),
            Some(verifier_for(config, &mut peer, root, result.size).await?),
        ),
        None => (TransferRequest::by_path(&result.file_name, compressed), None),
    };

    let header = peer.request(&request).await?;
    let mut written = 0u64;
    while let Some(chunk) = peer.next_chunk().await? {
        if let Some(verifier) = verifier.as_mut() {
            verifier.update(&chunk)?;
        }
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    if written != header.length {
        return Err(ProtocolError::VerificationFailure(format!(
            "{}: {written} of {}",
            constants::ERR_SHORT_TRANSFER,
            header.length
        )));
    }
    match verifier {
        Some(verifier) => {
            let root = verifier.finish()?;
            debug!(%root, bytes = written, "transfer verified");
        }
        None if written != result.size => {
            return Err(ProtocolError::VerificationFailure(format!(
                "got {written} bytes, peer advertised {}",
                result.size
            )))
        }
        None => debug!(bytes = written, "transfer matches advertised size"),
    }
    Ok(written)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::identifier::Identifier;

    struct Unreachable;

    impl PeerConnector for Unreachable {
        async fn open(&self, _result: &SearchResult) -> Result<PeerConnection> {
            Err(ProtocolError::ConnectionError("unreachable".into()))
        }
    }

    fn result(name: &str, tth: Option<TigerTreeHash>) -> SearchResult {
        SearchResult {
            file_name: name.to_string(),
            size: 10,
            source: Identifier::session("AAAB").unwrap(),
            client_id: None,
            tth,
            slots: None,
            token: None,
        }
    }

    #[test]
    fn acceptance_rules() {
        let tth = TigerTreeHash::of(b"x");
        let by_hash = DownloadConfig::new("out").with_hash(tth).with_file_name("f.bin");
        assert!(by_hash.accepts(&result("/other.bin", Some(tth))));
        assert!(!by_hash.accepts(&result("/f.bin", None)));

        let by_name = DownloadConfig::new("out").with_file_name("f.bin");
        assert!(by_name.accepts(&result("/share/f.bin", None)));
        assert!(by_name.accepts(&result("f.bin", Some(tth))));
        assert!(!by_name.accepts(&result("/share/f.bin.part", None)));
    }

    #[tokio::test]
    async fn needs_a_target() {
        let dir = tempfile::tempdir().unwrap();
        let res = DownloadDispatcher::new(DownloadConfig::new(dir.path().join("o")), Unreachable).await;
        assert!(matches!(res, Err(ProtocolError::ConfigError(_))));
    }

    #[tokio::test]
    async fn final_channel_taken_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = DownloadConfig::new(dir.path().join("o")).with_file_name("f");
        let mut dispatcher = DownloadDispatcher::new(config, Unreachable).await.unwrap();
        assert!(dispatcher.final_channel().is_some());
        assert!(dispatcher.final_channel().is_none());
    }

    #[tokio::test]
    async fn failed_peers_leave_an_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("o");
        std::fs::write(&path, b"stale").unwrap();

        let config = DownloadConfig::new(&path).with_file_name("f.bin");
        let mut dispatcher = DownloadDispatcher::new(config, Unreachable).await.unwrap();
        let done = dispatcher.final_channel().unwrap();
        let tx = dispatcher.result_channel();
        tx.send(result("/f.bin", None)).await.unwrap();
        drop(tx);

        assert_eq!(dispatcher.run(Duration::from_millis(200)).await, 0);
        assert_eq!(done.await.unwrap(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
