//! Client-to-client messages.
//!
//! Connection setup goes through the hub: we send `DRCM`, the peer answers
//! with `DCTM` naming the port it listens on. On the direct link both sides
//! exchange `CSUP` and `CINF`, then we ask for data with `CGET` and the peer
//! answers `CSND` followed by the raw (or `ZL1` compressed) body.

use std::fmt;

use crate::config::PROTOCOL;
use crate::core::fields::{FieldMap, FieldSlice};
use crate::core::identifier::Identifier;
use crate::core::message::{Message, MessageType};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::status::Status;
use crate::utils::tth::TigerTreeHash;

/// `DRCM <ours> <theirs> ADC/1.0 <token>`: ask a peer to open a port for us.
pub fn connect_request(ours: &Identifier, peer: &Identifier, token: &str) -> Message {
    Message::new(
        MessageType::Direct,
        "RCM",
        [ours.as_str(), peer.as_str(), PROTOCOL, token],
    )
}

/// A peer's `DCTM` answer to our `DRCM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub peer: Identifier,
    pub protocol: String,
    pub port: u16,
    pub token: String,
}

impl ConnectReply {
    /// Decode `DCTM <theirs> <ours> <protocol> <port> <token>`.
    pub fn from_message(msg: &Message) -> Result<Self> {
        let (Some(peer), Some(protocol), Some(port), Some(token)) =
            (msg.param(0), msg.param(2), msg.param(3), msg.param(4))
        else {
            return Err(ProtocolError::ProtocolViolation(format!(
                "incomplete CTM: {msg}"
            )));
        };
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ProtocolError::ProtocolViolation(format!("invalid CTM port {port:?}")))?;
        Ok(Self {
            peer: Identifier::session(peer)?,
            protocol: protocol.to_string(),
            port,
            token: token.to_string(),
        })
    }
}

/// `CSUP ADBASE ADTIGR [ADZLIG]`
pub fn client_supports(compression: bool) -> Message {
    let mut features = FieldSlice::new(["ADBASE", "ADTIGR"]);
    if compression {
        features.push("ADZLIG");
    }
    Message::new(MessageType::Client, "SUP", features.into_inner())
}

/// `CINF ID<cid> TO<token>`
pub fn client_inf(cid: &Identifier, token: &str) -> Message {
    let mut fields = FieldMap::new();
    fields.insert("ID", cid.as_str()).insert("TO", token);
    Message::new(MessageType::Client, "INF", fields.to_params())
}

/// Features a peer announced in its `CSUP`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerFeatures {
    features: FieldSlice,
}

impl PeerFeatures {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut features = FieldSlice::default();
        for param in msg.params() {
            if let Some(feature) = param.strip_prefix("AD") {
                features.push(feature);
            }
        }
        let base = features.contains("BASE") || features.contains("BAS0");
        if !base || !features.contains("TIGR") {
            return Err(ProtocolError::ProtocolViolation(
                constants::ERR_PEER_FEATURES.into(),
            ));
        }
        Ok(Self { features })
    }

    pub fn supports(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// File content
    File,
    /// Leaf level of a file's hash tree
    Leaves,
}

impl TransferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Leaves => "tthl",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "file" => Some(Self::File),
            "tthl" => Some(Self::Leaves),
            _ => None,
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `CGET` for a whole file or its leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub kind: TransferKind,
    /// `TTH/<root>` or a shared path
    pub identifier: String,
    pub compressed: bool,
}

impl TransferRequest {
    pub fn by_hash(kind: TransferKind, root: TigerTreeHash, compressed: bool) -> Self {
        Self {
            kind,
            identifier: format!("TTH/{root}"),
            compressed,
        }
    }

    pub fn by_path(path: &str, compressed: bool) -> Self {
        Self {
            kind: TransferKind::File,
            identifier: path.to_string(),
            compressed,
        }
    }

    /// `CGET <kind> <identifier> 0 -1 [ZL1]`
    pub fn to_message(&self) -> Message {
        let mut params = vec![
            self.kind.as_str().to_string(),
            self.identifier.clone(),
            "0".to_string(),
            "-1".to_string(),
        ];
        if self.compressed {
            params.push("ZL1".to_string());
        }
        Message::new(MessageType::Client, "GET", params)
    }
}

/// The peer's `CSND` announcing a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub kind: TransferKind,
    pub identifier: String,
    pub start: u64,
    /// Bytes of content that follow, before any compression
    pub length: u64,
    pub compressed: bool,
}

impl TransferHeader {
    /// Decode a `CSND`. A `CSTA` in its place becomes a
    /// [`ProtocolError::PeerStatus`].
    pub fn from_message(msg: &Message) -> Result<Self> {
        if msg.is(MessageType::Client, "STA") {
            return Err(Status::from_message(msg)?.into_error());
        }
        if !msg.is(MessageType::Client, "SND") {
            return Err(ProtocolError::ProtocolViolation(format!(
                "{} {}, expected CSND",
                constants::ERR_UNEXPECTED_COMMAND,
                msg.command()
            )));
        }

        let invalid = || ProtocolError::ProtocolViolation(format!("invalid SND: {msg}"));
        let kind = msg.param(0).and_then(TransferKind::parse).ok_or_else(invalid)?;
        let identifier = msg.param(1).ok_or_else(invalid)?.to_string();
        let start = msg
            .param(2)
            .and_then(|s| s.parse().ok())
            .ok_or_else(invalid)?;
        let length = msg
            .param(3)
            .and_then(|s| s.parse().ok())
            .ok_or_else(invalid)?;
        let compressed = msg.params().iter().skip(4).any(|p| p == "ZL1");

        Ok(Self {
            kind,
            identifier,
            start,
            length,
            compressed,
        })
    }
}
