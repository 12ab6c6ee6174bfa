//! Table of the other users on a hub, fed by `BINF` and `IQUI`.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::core::fields::FieldMap;
use crate::core::identifier::Identifier;
use crate::core::message::Message;
use crate::error::{ProtocolError, Result};

/// What the hub has told us about one user.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    sid: Identifier,
    fields: FieldMap,
}

impl PeerInfo {
    pub fn sid(&self) -> &Identifier {
        &self.sid
    }

    /// The peer's CID, if announced and well formed.
    pub fn cid(&self) -> Option<Identifier> {
        self.fields.get("ID").and_then(|id| Identifier::decode(id).ok())
    }

    pub fn nick(&self) -> Option<&str> {
        self.fields.get("NI")
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.fields.get("I4").and_then(|ip| ip.parse().ok())
    }

    /// Feature flags from `SU`, e.g. `TCP4`.
    pub fn supports(&self, feature: &str) -> bool {
        self.fields
            .get("SU")
            .is_some_and(|su| su.split(',').any(|f| f == feature))
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, PeerInfo>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `BINF`. The first update creates the entry, later ones merge
    /// over it.
    pub fn apply_inf(&mut self, msg: &Message) -> Result<&PeerInfo> {
        let sid_text = msg.param(0).ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!("INF without a SID: {msg}"))
        })?;
        let sid = Identifier::session(sid_text)?;
        let update = FieldMap::from_params(&msg.params()[1..]);

        let entry = self
            .peers
            .entry(sid.as_str().to_string())
            .or_insert_with(|| PeerInfo {
                sid,
                fields: FieldMap::new(),
            });
        entry.fields.merge(update);
        Ok(entry)
    }

    pub fn remove(&mut self, sid: &str) -> Option<PeerInfo> {
        self.peers.remove(sid)
    }

    pub fn get(&self, sid: &str) -> Option<&PeerInfo> {
        self.peers.get(sid)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
