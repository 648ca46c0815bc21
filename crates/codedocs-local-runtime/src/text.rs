//! Terminal output normalization for runtime child processes.
//!
//! The runtime redraws its progress bars in place, so its output is a mix of
//! escape sequences, carriage returns and newlines. These helpers turn that
//! into plain, one-per-line text.

const ESC: char = '\x1b';
const BEL: char = '\x07';

/// Remove terminal control and escape sequences from `input`.
///
/// Handles CSI (`ESC [ … final`), OSC (`ESC ] … BEL` or `ESC ] … ESC \`),
/// two-character `ESC x` escapes and bare C0 control characters. Tabs are
/// kept.
pub fn strip_control_sequences(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == ESC {
            match chars.next() {
                Some('[') => {
                    // Parameter and intermediate bytes, then one final byte in @..=~
                    for c in chars.by_ref() {
                        if ('@'..='~').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    while let Some(c) = chars.next() {
                        if c == BEL {
                            break;
                        }
                        if c == ESC {
                            if chars.peek() == Some(&'\\') {
                                chars.next();
                            }
                            break;
                        }
                    }
                }
                // Two-character escape, or a dangling ESC at the end.
                Some(_) | None => {}
            }
        } else if ch.is_control() && ch != '\t' {
            continue;
        } else {
            out.push(ch);
        }
    }

    out
}

/// Incremental splitter that turns arbitrary byte chunks into lines.
///
/// `\n`, `\r` and `\r\n` all end a line. Invalid UTF-8 is replaced.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
    last_was_cr: bool,
}

impl LineSplitter {
    /// Create an empty splitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            match byte {
                b'\n' if self.last_was_cr => {
                    // Second half of a CRLF; the line was already emitted.
                    self.last_was_cr = false;
                }
                b'\n' | b'\r' => {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                    self.last_was_cr = byte == b'\r';
                }
                _ => {
                    self.pending.push(byte);
                    self.last_was_cr = false;
                }
            }
        }
        lines
    }

    /// Flush the trailing partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        self.last_was_cr = false;
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}
