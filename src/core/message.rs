//! ADC protocol lines.
//!
//! A line is `<type><command>` followed by zero or more space separated,
//! individually escaped parameters:
//!
//! ```text
//! BINF AAAB IDxxxx NIsome\snick
//! ^^^^ ^^^^ ^^^^^^ ^^^^^^^^^^^^
//! type+cmd  parameters (escaped)
//! ```
//!
//! Escaping is exactly `' '` → `\s`, `'\n'` → `\n` and `'\\'` → `\\`.

use std::borrow::Cow;
use std::fmt;

use crate::error::{constants, ProtocolError, Result};

/// Single-byte message type marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// `B`: broadcast to every client via the hub
    Broadcast,
    /// `C`: client to client
    Client,
    /// `D`: direct, relayed by the hub to one client
    Direct,
    /// `E`: echo, direct and also sent back to the sender
    Echo,
    /// `F`: feature broadcast
    Feature,
    /// `H`: client to hub
    Hub,
    /// `I`: hub to client (info)
    Info,
    /// `U`: UDP
    Udp,
}

impl MessageType {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'B' => Some(Self::Broadcast),
            'C' => Some(Self::Client),
            'D' => Some(Self::Direct),
            'E' => Some(Self::Echo),
            'F' => Some(Self::Feature),
            'H' => Some(Self::Hub),
            'I' => Some(Self::Info),
            'U' => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Broadcast => 'B',
            Self::Client => 'C',
            Self::Direct => 'D',
            Self::Echo => 'E',
            Self::Feature => 'F',
            Self::Hub => 'H',
            Self::Info => 'I',
            Self::Udp => 'U',
        }
    }
}

/// Escape one parameter for the wire.
pub fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains([' ', '\n', '\\']) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Reverse [`escape`]. Any other backslash sequence is malformed.
pub fn unescape(value: &str) -> Result<Cow<'_, str>> {
    if !value.contains('\\') {
        return Ok(Cow::Borrowed(value));
    }
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                return Err(ProtocolError::MalformedMessage(format!(
                    "{}: \\{other}",
                    constants::ERR_INVALID_ESCAPE
                )))
            }
            None => {
                return Err(ProtocolError::MalformedMessage(
                    constants::ERR_TRAILING_ESCAPE.into(),
                ))
            }
        }
    }
    Ok(Cow::Owned(out))
}

/// One parsed (or to-be-sent) ADC line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    command: String,
    params: Vec<String>,
}

fn valid_command(command: &str) -> bool {
    command.len() == 3
        && command
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

impl Message {
    /// Build a message for sending. Parameters are given unescaped.
    pub fn new<I, S>(kind: MessageType, command: &str, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            command: command.to_string(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse one line (without its terminating newline).
    pub fn parse(line: &str) -> Result<Self> {
        if line.is_empty() {
            return Err(ProtocolError::MalformedMessage(
                constants::ERR_EMPTY_LINE.into(),
            ));
        }

        // Escaped spaces are `\s`, so every literal space is a separator.
        let mut tokens = line.split(' ');
        let header = tokens.next().unwrap_or_default();

        let mut header_chars = header.chars();
        let kind = header_chars
            .next()
            .and_then(MessageType::from_char)
            .ok_or_else(|| {
                ProtocolError::MalformedMessage(format!(
                    "{}: {header:?}",
                    constants::ERR_INVALID_HEADER
                ))
            })?;
        let command = header_chars.as_str();
        if !valid_command(command) {
            return Err(ProtocolError::MalformedMessage(format!(
                "{}: {header:?}",
                constants::ERR_INVALID_HEADER
            )));
        }

        let params = tokens
            .map(|token| unescape(token).map(Cow::into_owned))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            kind,
            command: command.to_string(),
            params,
        })
    }

    /// Produce the wire line (without the newline).
    pub fn format(&self) -> String {
        self.to_string()
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Unescaped parameters in wire order.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// True when this is `<kind><command>`.
    pub fn is(&self, kind: MessageType, command: &str) -> bool {
        self.kind == kind && self.command == command
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.as_char(), self.command)?;
        for param in &self.params {
            write!(f, " {}", escape(param))?;
        }
        Ok(())
    }
}
