//! Relay log records
//! One attributed, timestamped line per record. Records are append-only and are
//! ordered by the store-assigned timestamp.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::relay::session::SessionId;

pub const RELAY_TABLE: &str = "relay_messages";

/// Who authored a relay record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// Output of the BLE device.
    Device,
    /// A line the local user sent.
    User,
    /// A command from the remote support operator.
    Support,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::User => "user",
            Self::Support => "support",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-assigned record identity. De-duplication is keyed on this, never on content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub id: RecordId,
    pub session_id: SessionId,
    pub sender: Sender,
    pub command: String,
    #[serde(rename = "created_at")]
    pub timestamp: DateTime<Utc>,
}

/// A record before the store has assigned its id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRelayRecord {
    pub session_id: SessionId,
    pub sender: Sender,
    pub command: String,
}

impl NewRelayRecord {
    pub fn new(session_id: SessionId, sender: Sender, command: impl Into<String>) -> Self {
        Self {
            session_id,
            sender,
            command: command.into(),
        }
    }
}

/// One rendered transcript line. `sender` is `None` for local notices such as
/// execution failures, which never reach the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLine {
    pub sender: Option<Sender>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptLine {
    pub fn notice(text: impl Into<String>) -> Self {
        Self {
            sender: None,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

impl From<&RelayRecord> for TranscriptLine {
    fn from(record: &RelayRecord) -> Self {
        Self {
            sender: Some(record.sender),
            text: record.command.clone(),
            timestamp: record.timestamp,
        }
    }
}

impl fmt::Display for TranscriptLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sender {
            Some(sender) => write!(f, "[{}] {}", sender, self.text),
            None => write!(f, "[system] {}", self.text),
        }
    }
}

/// Full re-render of a session's records, in the order given.
pub fn render_transcript(records: &[RelayRecord]) -> Vec<TranscriptLine> {
    records.iter().map(TranscriptLine::from).collect()
}
