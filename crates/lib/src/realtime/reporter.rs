//! Once-per-cause logging of frame decode failures.

use std::collections::HashSet;

use super::message::DecodeError;

/// Frames longer than this are truncated in the hex dump.
const MAX_DUMP_BYTES: usize = 256;

/// Remembers which failure keys were already logged for one session.
///
/// The first failure for a key is logged at `warn` with a hex dump of the frame;
/// later failures for the same key only show up at `trace`.
#[derive(Debug, Default)]
pub struct DecodeReporter {
    seen: HashSet<String>,
    suppressed: usize,
}

impl DecodeReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log `err` for `frame`. Returns true when this was the first report for its key.
    pub fn report(&mut self, err: &DecodeError, frame: &[u8]) -> bool {
        let key = err.report_key();
        if self.seen.contains(key) {
            self.suppressed += 1;
            log::trace!("realtime: dropped frame: {}", err);
            return false;
        }
        self.seen.insert(key.to_string());
        log::warn!(
            "realtime: dropped frame: {} (further failures of this kind are not logged)\n{}",
            err,
            hex_dump(frame)
        );
        true
    }

    pub fn has_reported(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    /// Number of failures that were not logged because their key was already seen.
    pub fn suppressed(&self) -> usize {
        self.suppressed
    }
}

/// Classic 16-bytes-per-line dump: offset, hex bytes, printable ASCII.
fn hex_dump(frame: &[u8]) -> String {
    let shown = &frame[..frame.len().min(MAX_DUMP_BYTES)];
    let mut out = String::new();
    for (i, chunk) in shown.chunks(16).enumerate() {
        out.push_str(&format!("{:08x} ", i * 16));
        for j in 0..16 {
            match chunk.get(j) {
                Some(b) => out.push_str(&format!(" {:02x}", b)),
                None => out.push_str("   "),
            }
            if j == 7 {
                out.push(' ');
            }
        }
        out.push_str("  |");
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    if frame.len() > shown.len() {
        out.push_str(&format!("... {} more bytes", frame.len() - shown.len()));
    }
    out
}
