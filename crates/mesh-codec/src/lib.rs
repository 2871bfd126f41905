//! Mesh Codec
//!
//! Wire framings for protocol messages exchanged between parties. Every frame
//! is a single line; the transport appends the terminating newline.
//!
//! Two framings exist and a deployment must pick one:
//! - [`Framing::Record`]: a JSON record carrying sender, recipient, broadcast
//!   flag, round number, session metadata and payload. Required for protocol
//!   traffic.
//! - [`Framing::Line`]: `from:to:payload` text. Loses round and session
//!   metadata; only meant for the manual chat harness.

use mpc_mesh_core::{Error, Message, PartyId, Result, RoundNumber};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Wire framing selected for a deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Newline-delimited JSON records
    #[default]
    Record,
    /// `from:to:payload` text lines
    Line,
}

impl Framing {
    /// Encode a message as a single line without the trailing newline
    pub fn encode(&self, message: &Message) -> Result<String> {
        match self {
            Framing::Record => encode_record(message),
            Framing::Line => encode_line(message),
        }
    }

    /// Decode one line into a message
    pub fn decode(&self, line: &str) -> Result<Message> {
        match self {
            Framing::Record => decode_record(line),
            Framing::Line => decode_line(line),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Record => f.write_str("record"),
            Framing::Line => f.write_str("line"),
        }
    }
}

impl FromStr for Framing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "record" | "json" => Ok(Framing::Record),
            "line" => Ok(Framing::Line),
            other => Err(Error::InvalidConfig(format!("unknown framing: {}", other))),
        }
    }
}

/// Structured wire record
///
/// Field names and the base64 encoding of byte fields follow the record layout
/// other party implementations emit. Unknown fields are ignored on decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireRecord {
    /// Session identifier (base64)
    #[serde(rename = "SSID", default)]
    ssid: String,
    /// Sender party ID
    from: String,
    /// Receiver party ID, empty for broadcasts
    #[serde(default)]
    to: String,
    /// Protocol name
    #[serde(default)]
    protocol: String,
    /// Round number
    #[serde(default)]
    round_number: RoundNumber,
    /// Payload (base64)
    #[serde(default)]
    data: String,
    /// Broadcast flag
    #[serde(default)]
    broadcast: bool,
}

fn encode_record(message: &Message) -> Result<String> {
    message.validate()?;

    let record = WireRecord {
        ssid: b64::encode(&message.ssid),
        from: message.from.to_string(),
        to: match (&message.to, message.broadcast) {
            (Some(to), false) => to.to_string(),
            _ => String::new(),
        },
        protocol: message.protocol.clone(),
        round_number: message.round,
        data: b64::encode(&message.data),
        broadcast: message.broadcast,
    };

    serde_json::to_string(&record).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode_record(line: &str) -> Result<Message> {
    let record: WireRecord =
        serde_json::from_str(line).map_err(|e| Error::Deserialization(e.to_string()))?;

    let message = Message {
        ssid: b64::decode(&record.ssid)
            .map_err(|e| Error::Deserialization(format!("invalid SSID: {}", e)))?,
        from: PartyId::new(record.from),
        to: if record.broadcast || record.to.is_empty() {
            None
        } else {
            Some(PartyId::new(record.to))
        },
        protocol: record.protocol,
        round: record.round_number,
        data: b64::decode(&record.data)
            .map_err(|e| Error::Deserialization(format!("invalid Data: {}", e)))?,
        broadcast: record.broadcast,
    };

    message.validate()?;
    Ok(message)
}

fn encode_line(message: &Message) -> Result<String> {
    message.validate()?;

    let payload = std::str::from_utf8(&message.data)
        .map_err(|_| Error::Frame("line payload must be UTF-8".into()))?;
    if payload.contains(is_line_unsafe) {
        return Err(Error::Frame(
            "line payload must not contain ':' or line breaks".into(),
        ));
    }
    for id in std::iter::once(&message.from).chain(message.to.iter()) {
        if id.as_str().contains(is_line_unsafe) {
            return Err(Error::Frame(format!("party ID {:?} not line-safe", id.as_str())));
        }
    }

    let to = match (&message.to, message.broadcast) {
        (Some(to), false) => to.as_str(),
        _ => "",
    };
    Ok(format!("{}:{}:{}", message.from, to, payload))
}

fn is_line_unsafe(c: char) -> bool {
    matches!(c, ':' | '\n' | '\r')
}

fn decode_line(line: &str) -> Result<Message> {
    let mut parts = line.splitn(3, ':');
    let (from, to, payload) = match (parts.next(), parts.next(), parts.next()) {
        (Some(from), Some(to), Some(payload)) => (from.trim(), to.trim(), payload),
        _ => return Err(Error::Frame(format!("expected from:to:payload, got {:?}", line))),
    };

    // An empty recipient is the only way a line can say "everyone"
    let message = if to.is_empty() {
        Message::broadcast(PartyId::new(from), 0, payload.as_bytes().to_vec())
    } else {
        Message::unicast(
            PartyId::new(from),
            PartyId::new(to),
            0,
            payload.as_bytes().to_vec(),
        )
    };

    message.validate()?;
    Ok(message)
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};

    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(s)
    }
}
