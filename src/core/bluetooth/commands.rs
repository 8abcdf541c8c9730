//! Outgoing serial command encoding
//! A command is one line of text; on the wire it is the UTF-8 bytes of the line
//! followed by CR+LF, split into characteristic-sized writes.

use crate::core::bluetooth::constants::LINE_TERMINATOR;

/// One line to send to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialCommand {
    line: String,
}

impl SerialCommand {
    pub fn new(line: impl Into<String>) -> Self {
        Self { line: line.into() }
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    /// Convert the command to its byte representation
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.line.len() + LINE_TERMINATOR.len());
        bytes.extend_from_slice(self.line.as_bytes());
        bytes.extend_from_slice(LINE_TERMINATOR.as_bytes());
        bytes
    }

    /// The writes needed to transmit this command, each at most `max_write_len` bytes.
    pub fn frames(&self, max_write_len: usize) -> Vec<Vec<u8>> {
        self.to_bytes()
            .chunks(max_write_len.max(1))
            .map(<[u8]>::to_vec)
            .collect()
    }
}
