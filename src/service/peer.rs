//! A direct client-to-client connection used for one download.
//!
//! We are always the connecting side, so we speak first:
//!
//! ```text
//! C: CSUP ADBASE ADTIGR [ADZLIG]
//! P: CSUP ...
//! P: CINF ID<cid> ...
//! C: CINF ID<cid> TO<token>
//! C: CGET file TTH/<root> 0 -1 [ZL1]
//! P: CSND file TTH/<root> 0 <len> [ZL1]
//! P: <len bytes, or a zlib stream inflating to len bytes>
//! ```
//!
//! ## Limits
//! - Every frame waits at most the idle timeout
//! - Compressed bodies may not inflate past the announced length
//! - Leaf data is refused unless it is a whole number of digests and at most
//!   one digest per 1 KiB block of the file

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, instrument, trace};

use crate::core::codec::{TransferCodec, TransferFrame};
use crate::core::fields::FieldMap;
use crate::core::identifier::Identifier;
use crate::core::message::{Message, MessageType};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::peer::{
    client_inf, client_supports, PeerFeatures, TransferHeader, TransferKind, TransferRequest,
};
use crate::protocol::status::Status;
use crate::transport::BoxedStream;
use crate::utils::timeout::{with_timeout_error, HANDSHAKE_TIMEOUT, TRANSFER_IDLE_TIMEOUT};
use crate::utils::tth::{parse_leaves, TigerTreeHash, BLOCK_SIZE, DIGEST_SIZE};

/// Tuning for a peer link
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Advertise `ZLIG` in our `CSUP`
    pub compression: bool,
    pub max_line_length: usize,
    /// Longest wait for any single frame
    pub idle_timeout: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            compression: true,
            max_line_length: crate::core::codec::MAX_LINE_LENGTH,
            idle_timeout: TRANSFER_IDLE_TIMEOUT,
        }
    }
}

pub struct PeerConnection<S = BoxedStream> {
    framed: Framed<S, TransferCodec>,
    features: PeerFeatures,
    peer_cid: Option<Identifier>,
    idle_timeout: Duration,
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the `SUP`/`INF` exchange on a freshly connected stream.
    #[instrument(skip(stream, cid, options), fields(token = %token))]
    pub async fn handshake(
        stream: S,
        cid: &Identifier,
        token: &str,
        options: &PeerOptions,
    ) -> Result<Self> {
        let framed = Framed::new(stream, TransferCodec::new(options.max_line_length));
        let mut conn = Self {
            framed,
            features: PeerFeatures::default(),
            peer_cid: None,
            idle_timeout: options.idle_timeout,
        };

        with_timeout_error(
            async {
                conn.send(client_supports(options.compression)).await?;

                let sup = conn.expect_command("SUP").await?;
                conn.features = PeerFeatures::from_message(&sup)?;

                let inf = conn.expect_command("INF").await?;
                let fields = FieldMap::from_params(inf.params().iter());
                conn.peer_cid = fields.get("ID").and_then(|id| Identifier::decode(id).ok());

                conn.send(client_inf(cid, token)).await
            },
            HANDSHAKE_TIMEOUT.min(options.idle_timeout.saturating_mul(2)),
        )
        .await?;

        debug!(peer = ?conn.peer_cid, "peer handshake complete");
        Ok(conn)
    }

    pub fn features(&self) -> &PeerFeatures {
        &self.features
    }

    pub fn peer_cid(&self) -> Option<&Identifier> {
        self.peer_cid.as_ref()
    }

    async fn send(&mut self, msg: Message) -> Result<()> {
        trace!(%msg, "peer <-");
        self.framed.send(msg).await
    }

    async fn next_frame(&mut self) -> Result<TransferFrame> {
        let frame = tokio::time::timeout(self.idle_timeout, self.framed.next())
            .await
            .map_err(|_| ProtocolError::Timeout)?;
        match frame {
            Some(frame) => frame,
            None => Err(ProtocolError::ConnectionError(
                "peer closed the connection".into(),
            )),
        }
    }

    async fn next_command(&mut self) -> Result<Message> {
        match self.next_frame().await? {
            TransferFrame::Command(msg) => {
                trace!(%msg, "peer ->");
                Ok(msg)
            }
            TransferFrame::Data(_) => Err(ProtocolError::ProtocolViolation(
                "unexpected data outside a transfer".into(),
            )),
        }
    }

    /// Next `C<command>`. A `CSTA` in its place is turned into an error.
    async fn expect_command(&mut self, command: &str) -> Result<Message> {
        let msg = self.next_command().await?;
        if msg.is(MessageType::Client, command) {
            return Ok(msg);
        }
        if msg.is(MessageType::Client, "STA") {
            return Err(Status::from_message(&msg)?.into_error());
        }
        Err(ProtocolError::ProtocolViolation(format!(
            "{} {msg}, expected C{command}",
            constants::ERR_UNEXPECTED_COMMAND
        )))
    }

    /// Send a `CGET` and wait for its `CSND`. The body, if any, is then
    /// read with [`next_chunk`](Self::next_chunk).
    #[instrument(skip(self, request), fields(kind = %request.kind, ident = %request.identifier))]
    pub async fn request(&mut self, request: &TransferRequest) -> Result<TransferHeader> {
        let header = self.announce(request).await?;
        self.start_body(&header);
        Ok(header)
    }

    async fn announce(&mut self, request: &TransferRequest) -> Result<TransferHeader> {
        self.send(request.to_message()).await?;
        let reply = self.next_command().await?;
        let header = TransferHeader::from_message(&reply)?;
        if header.kind != request.kind {
            return Err(ProtocolError::ProtocolViolation(format!(
                "asked for {}, peer sent {}",
                request.kind, header.kind
            )));
        }
        Ok(header)
    }

    fn start_body(&mut self, header: &TransferHeader) {
        debug!(length = header.length, compressed = header.compressed, "transfer starting");
        self.framed
            .codec_mut()
            .expect_body(header.length, header.compressed);
    }

    /// Next piece of the current body, `None` once it is complete.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if !self.framed.codec().in_body() {
                return Ok(None);
            }
            match self.next_frame().await? {
                TransferFrame::Data(chunk) if chunk.is_empty() => continue,
                TransferFrame::Data(chunk) => return Ok(Some(chunk)),
                TransferFrame::Command(msg) => {
                    return Err(ProtocolError::ProtocolViolation(format!(
                        "{msg} in the middle of a transfer"
                    )))
                }
            }
        }
    }

    /// Fetch the leaf level of `root`'s hash tree for a file of `file_size`
    /// bytes.
    ///
    /// A leaf covers at least one block, so a body longer than one digest per
    /// block is refused before any of it is read. The connection cannot be
    /// reused after that error.
    pub async fn fetch_leaves(
        &mut self,
        root: TigerTreeHash,
        file_size: u64,
    ) -> Result<Vec<TigerTreeHash>> {
        let header = self
            .announce(&TransferRequest::by_hash(TransferKind::Leaves, root, false))
            .await?;
        let max_leaves = file_size.div_ceil(BLOCK_SIZE as u64).max(1);
        let digest = DIGEST_SIZE as u64;
        if header.length == 0
            || header.length % digest != 0
            || header.length > max_leaves.saturating_mul(digest)
        {
            return Err(ProtocolError::ProtocolViolation(format!(
                "{}: {} bytes for a {file_size} byte file",
                constants::ERR_BAD_LEAVES_LENGTH,
                header.length
            )));
        }
        self.start_body(&header);

        let mut body = Vec::with_capacity(usize::try_from(header.length).unwrap_or(0));
        while let Some(chunk) = self.next_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        parse_leaves(&body)
    }
}
