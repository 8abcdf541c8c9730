//! Line framer
//! Re-segments notification text into display lines. BLE notifications carry no
//! framing, so this is cosmetic and best effort: it splits on line terminators,
//! breaks before command prefixes that arrive glued to a previous response,
//! isolates trailing status tokens, and collapses runs of blank lines.

use regex::Regex;

use crate::config::link_config::FramerConfig;

pub struct LineFramer {
    pending: String,
    after_cr: bool,
    last_was_blank: bool,
    command_prefix: Option<Regex>,
    trailing_status: Option<Regex>,
}

fn alternation(words: &[String]) -> Option<String> {
    let words: Vec<String> = words
        .iter()
        .filter(|w| !w.is_empty())
        .map(|w| regex::escape(w))
        .collect();
    (!words.is_empty()).then(|| words.join("|"))
}

impl LineFramer {
    pub fn new(config: &FramerConfig) -> Self {
        let command_prefix = alternation(&config.command_prefixes).and_then(|alt| Regex::new(&alt).ok());
        let trailing_status = alternation(&config.status_tokens).and_then(|alt| {
            Regex::new(&format!(r"^(?P<head>.*[0-9[:punct:]])(?P<token>{})$", alt)).ok()
        });
        Self {
            pending: String::new(),
            after_cr: false,
            last_was_blank: false,
            command_prefix,
            trailing_status,
        }
    }

    /// Feeds one decoded chunk and returns the lines it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for ch in chunk.chars() {
            match ch {
                '\n' if self.after_cr => self.after_cr = false,
                '\r' | '\n' => {
                    self.after_cr = ch == '\r';
                    let segment = std::mem::take(&mut self.pending);
                    self.emit(&segment, &mut lines);
                }
                _ => {
                    self.after_cr = false;
                    self.pending.push(ch);
                }
            }
        }
        lines
    }

    /// Emits whatever partial line is buffered.
    pub fn flush(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        if !self.pending.is_empty() {
            let segment = std::mem::take(&mut self.pending);
            self.emit(&segment, &mut lines);
        }
        lines
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn emit(&mut self, segment: &str, lines: &mut Vec<String>) {
        for piece in self.split_segment(segment) {
            let piece = piece.trim_end();
            if piece.is_empty() {
                if self.last_was_blank {
                    continue;
                }
                self.last_was_blank = true;
                lines.push(String::new());
            } else {
                self.last_was_blank = false;
                lines.push(piece.to_string());
            }
        }
    }

    fn split_segment<'a>(&self, segment: &'a str) -> Vec<&'a str> {
        let mut pieces = Vec::new();
        let mut start = 0;
        if let Some(prefix) = &self.command_prefix {
            for found in prefix.find_iter(segment) {
                if found.start() > start {
                    pieces.push(&segment[start..found.start()]);
                    start = found.start();
                }
            }
        }
        pieces.push(&segment[start..]);

        let Some(status) = &self.trailing_status else {
            return pieces;
        };
        let mut split = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let trimmed = piece.trim_end();
            match status.captures(trimmed) {
                Some(caps) => {
                    let head = caps.name("head").map_or("", |m| m.as_str());
                    let token = caps.name("token").map_or("", |m| m.as_str());
                    split.push(head);
                    split.push(token);
                }
                None => split.push(piece),
            }
        }
        split
    }
}
