//! `STA` status replies.
//!
//! The code is three digits: the first is the severity (0 success,
//! 1 recoverable, 2 fatal), the other two the error kind.

use std::fmt;

use crate::core::message::{Message, MessageType};
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Recoverable,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: u16,
    description: String,
}

impl Status {
    /// Decode `ISTA`, `CSTA`, `DSTA` or `ESTA`. Directed forms carry the two
    /// SIDs first.
    pub fn from_message(msg: &Message) -> Result<Self> {
        let offset = match msg.kind() {
            MessageType::Direct | MessageType::Echo => 2,
            MessageType::Broadcast | MessageType::Feature => 1,
            _ => 0,
        };
        let code_text = msg.param(offset).ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!("status without a code: {msg}"))
        })?;
        let code = match code_text.parse::<u16>() {
            Ok(code) if code_text.len() == 3 => code,
            _ => {
                return Err(ProtocolError::ProtocolViolation(format!(
                    "invalid status code {code_text:?}"
                )))
            }
        };
        Ok(Self {
            code,
            description: msg.param(offset + 1).unwrap_or_default().to_string(),
        })
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn severity(&self) -> Severity {
        match self.code / 100 {
            0 => Severity::Success,
            1 => Severity::Recoverable,
            _ => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Turn a peer's reply into the error a transfer attempt reports.
    pub fn into_error(self) -> ProtocolError {
        ProtocolError::PeerStatus {
            code: self.code,
            description: self.description,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03} {}", self.code, self.description)
    }
}
