//! Search requests and the results hubs relay back.
//!
//! A [`Search`] carries its own token so that `DRES` replies can be routed
//! back to it. Results flow through the `mpsc` sender bound with
//! [`Search::set_result_channel`]; the hub session refuses searches that have
//! nowhere to deliver.

use std::fmt;

use rand::Rng;
use tokio::sync::mpsc;

use crate::core::fields::FieldMap;
use crate::core::identifier::Identifier;
use crate::core::message::{Message, MessageType};
use crate::error::{ProtocolError, Result};
use crate::protocol::peers::PeerTable;
use crate::utils::tth::TigerTreeHash;

/// Render `value` in lowercase base 36.
fn base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(7);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

/// Draw a fresh search or connection token.
pub fn new_token<R: Rng + ?Sized>(rng: &mut R) -> String {
    base36(rng.random::<u32>())
}

/// One file offered by a peer in reply to a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    /// Full shared path, `/` separated
    pub file_name: String,
    pub size: u64,
    /// SID of the user holding the file
    pub source: Identifier,
    /// CID of that user, when the hub has announced them
    pub client_id: Option<Identifier>,
    pub tth: Option<TigerTreeHash>,
    pub slots: Option<u32>,
    pub token: Option<String>,
}

impl SearchResult {
    /// Decode `DRES <from> <to> FN.. SI.. [SL..] [TR..] [TO..]`.
    pub fn from_message(msg: &Message, peers: &PeerTable) -> Result<Self> {
        if msg.command() != "RES" {
            return Err(ProtocolError::ProtocolViolation(format!(
                "expected RES, got {}",
                msg.command()
            )));
        }
        let sid = msg.param(0).ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!("RES without a source: {msg}"))
        })?;
        let source = Identifier::session(sid)?;

        // Direct replies name the target SID before the fields.
        let skip = match msg.kind() {
            MessageType::Direct | MessageType::Echo => 2,
            _ => 1,
        };
        let fields = FieldMap::from_params(msg.params().iter().skip(skip));

        let file_name = fields
            .get("FN")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ProtocolError::ProtocolViolation(format!("RES without FN: {msg}")))?
            .to_string();
        let size = fields
            .get("SI")
            .and_then(|si| si.parse().ok())
            .ok_or_else(|| {
                ProtocolError::ProtocolViolation(format!("RES without a valid SI: {msg}"))
            })?;
        let tth = match fields.get("TR") {
            Some(tr) => Some(tr.parse::<TigerTreeHash>()?),
            None => None,
        };

        Ok(Self {
            file_name,
            size,
            client_id: peers.get(source.as_str()).and_then(|p| p.cid()),
            source,
            tth,
            slots: fields.get("SL").and_then(|sl| sl.parse().ok()),
            token: fields.get("TO").map(str::to_string),
        })
    }

    /// Last path component of [`file_name`](Self::file_name).
    pub fn base_name(&self) -> &str {
        self.file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.file_name)
    }
}

impl fmt::Display for SearchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes) from {}", self.file_name, self.size, self.source)
    }
}

/// An outstanding query. Criteria are fixed once it is handed to a session.
#[derive(Debug, Clone)]
pub struct Search {
    token: String,
    tth: Option<TigerTreeHash>,
    includes: Vec<String>,
    results: Option<mpsc::Sender<SearchResult>>,
}

impl Search {
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            token: new_token(rng),
            tth: None,
            includes: Vec::new(),
            results: None,
        }
    }

    pub fn add_tth(&mut self, hash: TigerTreeHash) -> &mut Self {
        self.tth = Some(hash);
        self
    }

    pub fn add_include(&mut self, substring: impl Into<String>) -> &mut Self {
        self.includes.push(substring.into());
        self
    }

    pub fn set_result_channel(&mut self, results: mpsc::Sender<SearchResult>) -> &mut Self {
        self.results = Some(results);
        self
    }

    pub fn result_channel(&self) -> Option<&mpsc::Sender<SearchResult>> {
        self.results.as_ref()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn tth(&self) -> Option<TigerTreeHash> {
        self.tth
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    /// A hash on both sides decides alone. Otherwise every include must be
    /// a case-sensitive substring of the result's file name.
    pub fn matches(&self, result: &SearchResult) -> bool {
        if let (Some(wanted), Some(offered)) = (self.tth, result.tth) {
            return wanted == offered;
        }
        self.includes
            .iter()
            .all(|include| result.file_name.contains(include.as_str()))
    }

    /// `BSCH <sid> TO<token> [TR<tth>] [AN<include>]*`
    pub fn to_message(&self, sid: &Identifier) -> Message {
        let mut params = vec![sid.to_string(), format!("TO{}", self.token)];
        if let Some(tth) = self.tth {
            params.push(format!("TR{tth}"));
        }
        params.extend(self.includes.iter().map(|include| format!("AN{include}")));
        Message::new(MessageType::Broadcast, "SCH", params)
    }
}
