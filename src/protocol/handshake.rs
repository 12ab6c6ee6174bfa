//! Hub login: session states and the handshake state machine.
//!
//! The handshake is pure. [`HubHandshake`] consumes hub messages and hands
//! back the replies to write, so the same logic drives a live socket and the
//! unit tests below.
//!
//! ```text
//! C: HSUP ADBASE ADTIGR
//! H: ISUP ADBASE ADTIGR ...
//! H: ISID <sid>
//! C: BINF <sid> ID<cid> PD<pid> NI<nick> ...
//! H: IINF / BINF (other users) / IGPA / ISTA ...
//! H: BINF <sid> ...           (our own INF echoed: logged in)
//! ```

use std::fmt;

use digest::Digest;
use tiger::Tiger;
use tracing::{debug, info, instrument, warn};

use crate::config::CLIENT_VERSION;
use crate::core::fields::{FieldMap, FieldSlice};
use crate::core::identifier::{decode_base32_lenient, encode_base32, Identifier};
use crate::core::message::{Message, MessageType};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::peers::PeerTable;
use crate::protocol::status::{Severity, Status};

/// Lifecycle of a hub session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

impl SessionState {
    /// Forward steps only; any state may close.
    pub fn can_transition(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Handshaking)
                | (Self::Handshaking, Self::Ready)
                | (_, Self::Closed)
        )
    }

    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.can_transition(next) {
            return Err(ProtocolError::ProtocolViolation(format!(
                "invalid session transition {self} -> {next}"
            )));
        }
        *self = next;
        Ok(())
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Who we claim to be on the hub.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub pid: Identifier,
    pub cid: Identifier,
    pub nick: String,
    pub description: String,
    pub password: Option<String>,
}

impl LocalIdentity {
    /// The CID is the Tiger hash of `pid`.
    pub fn new(pid: Identifier, nick: impl Into<String>) -> Self {
        let cid = Identifier::client_id::<Tiger>(&pid);
        Self {
            pid,
            cid,
            nick: nick.into(),
            description: String::new(),
            password: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// `BINF` fields for the first announcement.
    fn inf_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields
            .insert("ID", self.cid.as_str())
            .insert("PD", self.pid.as_str())
            .insert("NI", self.nick.as_str())
            .insert("VE", CLIENT_VERSION)
            .insert("SL", "0")
            .insert("SS", "0")
            .insert("SF", "0")
            .insert("HN", "1")
            .insert("HR", "0")
            .insert("HO", "0");
        if !self.description.is_empty() {
            fields.insert("DE", self.description.as_str());
        }
        fields
    }
}

/// `HPAS` answer: base32 of Tiger(password ‖ challenge bytes).
pub fn password_response(password: &str, challenge: &str) -> Result<Message> {
    let nonce = decode_base32_lenient(challenge)?;
    let mut hasher = Tiger::new();
    hasher.update(password.as_bytes());
    hasher.update(&nonce);
    let digest = encode_base32(&hasher.finalize());
    Ok(Message::new(MessageType::Hub, "PAS", [digest]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Protocol,
    Identify,
    Verify,
    Complete,
}

/// Everything the handshake learned, handed to the live session.
#[derive(Debug)]
pub struct LoggedIn {
    pub identity: LocalIdentity,
    pub sid: Identifier,
    pub hub_features: FieldSlice,
    pub hub_info: FieldMap,
    pub peers: PeerTable,
}

/// Client side of the hub login.
#[derive(Debug)]
pub struct HubHandshake {
    identity: LocalIdentity,
    phase: Phase,
    sid: Option<Identifier>,
    hub_features: FieldSlice,
    hub_info: FieldMap,
    peers: PeerTable,
}

impl HubHandshake {
    pub fn new(identity: LocalIdentity) -> Self {
        Self {
            identity,
            phase: Phase::Protocol,
            sid: None,
            hub_features: FieldSlice::default(),
            hub_info: FieldMap::new(),
            peers: PeerTable::new(),
        }
    }

    /// The opening `HSUP`.
    pub fn start(&self) -> Message {
        Message::new(MessageType::Hub, "SUP", ["ADBASE", "ADTIGR"])
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    pub fn sid(&self) -> Option<&Identifier> {
        self.sid.as_ref()
    }

    /// Feed one hub message. Returns the reply to write, if any.
    #[instrument(skip(self, msg), fields(phase = ?self.phase, command = msg.command()))]
    pub fn on_message(&mut self, msg: &Message) -> Result<Option<Message>> {
        if msg.is(MessageType::Info, "STA") {
            self.on_status(msg)?;
            return Ok(None);
        }

        match (self.phase, msg.kind(), msg.command()) {
            (Phase::Protocol, MessageType::Info, "SUP") => {
                self.on_supports(msg)?;
                Ok(None)
            }
            (Phase::Identify, MessageType::Info, "SID") => self.on_sid(msg).map(Some),
            (Phase::Verify, MessageType::Info, "INF") => {
                self.hub_info
                    .merge(FieldMap::from_params(msg.params().iter()));
                debug!(hub = ?self.hub_info.get("NI"), "hub info");
                Ok(None)
            }
            (Phase::Verify, MessageType::Info, "GPA") => self.on_password(msg).map(Some),
            (Phase::Verify, MessageType::Broadcast, "INF") => {
                self.on_inf(msg)?;
                Ok(None)
            }
            (Phase::Verify, MessageType::Info, "QUI") => {
                self.on_quit(msg)?;
                Ok(None)
            }
            _ => Err(ProtocolError::ProtocolViolation(format!(
                "{} {} during login",
                constants::ERR_UNEXPECTED_COMMAND,
                msg
            ))),
        }
    }

    fn on_status(&self, msg: &Message) -> Result<()> {
        let status = Status::from_message(msg)?;
        match status.severity() {
            Severity::Success => debug!(%status, "hub status"),
            Severity::Recoverable => warn!(%status, "hub status"),
            Severity::Fatal => {
                return Err(ProtocolError::ProtocolViolation(format!(
                    "hub refused login: {status}"
                )))
            }
        }
        Ok(())
    }

    fn on_supports(&mut self, msg: &Message) -> Result<()> {
        for param in msg.params() {
            if let Some(feature) = param.strip_prefix("AD") {
                self.hub_features.push(feature);
            }
        }
        let base = self.hub_features.contains("BASE") || self.hub_features.contains("BAS0");
        if !base || !self.hub_features.contains("TIGR") {
            return Err(ProtocolError::ProtocolViolation(
                constants::ERR_MISSING_FEATURES.into(),
            ));
        }
        self.phase = Phase::Identify;
        Ok(())
    }

    fn on_sid(&mut self, msg: &Message) -> Result<Message> {
        let text = msg.param(0).ok_or_else(|| {
            ProtocolError::ProtocolViolation("SID without a value".into())
        })?;
        let sid = Identifier::session(text)?;
        debug!(%sid, "assigned session id");

        let mut params = vec![sid.to_string()];
        params.extend(self.identity.inf_fields().to_params());
        self.sid = Some(sid);
        self.phase = Phase::Verify;
        Ok(Message::new(MessageType::Broadcast, "INF", params))
    }

    fn on_password(&self, msg: &Message) -> Result<Message> {
        let challenge = msg.param(0).ok_or_else(|| {
            ProtocolError::ProtocolViolation("GPA without a challenge".into())
        })?;
        let password = self.identity.password.as_deref().ok_or_else(|| {
            ProtocolError::ProtocolViolation(constants::ERR_PASSWORD_REQUIRED.into())
        })?;
        password_response(password, challenge)
    }

    fn on_inf(&mut self, msg: &Message) -> Result<()> {
        let ours = self.sid.as_ref().map(Identifier::as_str);
        if msg.param(0).is_some() && msg.param(0) == ours {
            info!(sid = ?ours, nick = %self.identity.nick, "logged in");
            self.phase = Phase::Complete;
            return Ok(());
        }
        self.peers.apply_inf(msg)?;
        Ok(())
    }

    fn on_quit(&mut self, msg: &Message) -> Result<()> {
        let sid = msg.param(0).unwrap_or_default();
        if Some(sid) == self.sid.as_ref().map(Identifier::as_str) {
            return Err(ProtocolError::ProtocolViolation(format!(
                "hub disconnected us: {msg}"
            )));
        }
        self.peers.remove(sid);
        Ok(())
    }

    /// Hand over the session details once our `BINF` has been echoed.
    pub fn finish(self) -> Result<LoggedIn> {
        match (self.phase, self.sid) {
            (Phase::Complete, Some(sid)) => Ok(LoggedIn {
                identity: self.identity,
                sid,
                hub_features: self.hub_features,
                hub_info: self.hub_info,
                peers: self.peers,
            }),
            _ => Err(ProtocolError::ProtocolViolation(
                "login has not completed".into(),
            )),
        }
    }
}
