//! Line assembly over the byte-at-a-time serial read.
//!
//! Three modes are used by the response parsers:
//! - **line to EOL** — collect bytes until a terminator arrives, then hand
//!   back the buffered line;
//! - **dual EOL** — wait for a first terminator (`:` of the aux `CMD:`
//!   header), reset, then collect until a second terminator (the last byte
//!   of the echoed command);
//! - single bytes are read straight off the port by the callers.
//!
//! The buffer is fixed at [`MAX_LINE_LEN`] bytes. On overflow the write
//! index wraps to zero, an overflow flag is raised for the engine to record,
//! and assembly keeps going — a long unsolicited blurb must not wedge the
//! machine.

use super::command::MAX_LINE_LEN;

/// Outcome of feeding bytes to the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assembly {
    /// Terminator not seen yet; keep polling.
    Pending,
    /// A complete line is in the buffer.
    Complete,
}

pub struct LineBuffer {
    buf: [u8; MAX_LINE_LEN],
    len: usize,
    /// Dual-EOL phase: first terminator already consumed.
    past_first_eol: bool,
    overflowed: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buf: [0u8; MAX_LINE_LEN],
            len: 0,
            past_first_eol: false,
            overflowed: false,
        }
    }

    /// Drop buffered content and assembly phase, keeping the overflow flag
    /// for the engine to collect.
    pub fn clear(&mut self) {
        self.len = 0;
        self.past_first_eol = false;
        self.buf.fill(0);
    }

    /// Buffered bytes so far (or the completed line after `Complete`).
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Lossy text view of the buffer for prefix matching and logs.
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(self.bytes()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Collect the buffer-overflow event, clearing it.
    pub fn take_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }

    fn push(&mut self, byte: u8) {
        if self.len >= MAX_LINE_LEN {
            self.overflowed = true;
            self.len = 0;
        }
        self.buf[self.len] = byte;
        self.len += 1;
    }

    /// Feed one byte in line-to-EOL mode. CR/LF that are not the terminator
    /// are kept — the prefix comparisons need them.
    pub fn feed(&mut self, byte: u8, eol: u8) -> Assembly {
        if byte == eol {
            return Assembly::Complete;
        }
        self.push(byte);
        Assembly::Pending
    }

    /// Feed one byte in dual-EOL mode: discard through the first terminator,
    /// then collect until the second.
    pub fn feed_dual(&mut self, byte: u8, first_eol: u8, second_eol: u8) -> Assembly {
        if self.past_first_eol {
            self.push(byte);
            if byte == second_eol {
                self.past_first_eol = false;
                return Assembly::Complete;
            }
        } else {
            self.push(byte);
            if byte == first_eol {
                self.len = 0;
                self.past_first_eol = true;
            }
        }
        Assembly::Pending
    }
}

/// Incremental matcher for a pair of expected aux status strings (e.g.
/// `Ringer(s) On` / `Ringer(s) Off`). Each pattern advances independently on
/// a matching byte and holds its position otherwise; the first pattern to
/// complete wins. The echo and prompt noise ahead of the status text never
/// matches the capitalized reply strings, so held positions are safe for
/// this wire format.
pub struct PairMatcher {
    patterns: [&'static [u8]; 2],
    pos: [usize; 2],
}

impl PairMatcher {
    pub fn new(a: &'static str, b: &'static str) -> Self {
        Self {
            patterns: [a.as_bytes(), b.as_bytes()],
            pos: [0, 0],
        }
    }

    /// Feed one byte; returns the index (0 or 1) of a completed pattern.
    pub fn feed(&mut self, byte: u8) -> Option<usize> {
        for idx in 0..2 {
            let pat = self.patterns[idx];
            if byte == pat[self.pos[idx]] {
                self.pos[idx] += 1;
                if self.pos[idx] == pat.len() {
                    self.pos = [0, 0];
                    return Some(idx);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_to_eol() {
        let mut lb = LineBuffer::new();
        for &b in b"+CSQF:5" {
            assert_eq!(lb.feed(b, b'\n'), Assembly::Pending);
        }
        assert_eq!(lb.feed(b'\n', b'\n'), Assembly::Complete);
        assert_eq!(lb.bytes(), b"+CSQF:5");
    }

    #[test]
    fn test_keeps_cr_before_lf_terminator() {
        let mut lb = LineBuffer::new();
        for &b in b"READY\r" {
            lb.feed(b, b'\n');
        }
        assert_eq!(lb.feed(b'\n', b'\n'), Assembly::Complete);
        assert_eq!(lb.bytes(), b"READY\r");
    }

    #[test]
    fn test_overflow_wraps_and_flags() {
        let mut lb = LineBuffer::new();
        for _ in 0..MAX_LINE_LEN + 3 {
            lb.feed(b'x', b'\n');
        }
        assert!(lb.take_overflow());
        assert!(!lb.take_overflow());
        // Index wrapped: only the post-wrap bytes remain.
        assert_eq!(lb.len(), 3);
        assert_eq!(lb.feed(b'\n', b'\n'), Assembly::Complete);
    }

    #[test]
    fn test_dual_eol_discards_through_header() {
        let mut lb = LineBuffer::new();
        let mut done = Assembly::Pending;
        for &b in b"CMD: set relay 0\r" {
            done = lb.feed_dual(b, b':', b'\r');
        }
        assert_eq!(done, Assembly::Complete);
        assert_eq!(lb.bytes(), b" set relay 0\r");
    }

    #[test]
    fn test_pair_matcher_off_wins() {
        let mut m = PairMatcher::new("Ringer(s) Off", "Ringer(s) On");
        let mut hit = None;
        for &b in b"CMD: set ringer\r\nRinger(s) Off\r\n" {
            if let Some(i) = m.feed(b) {
                hit = Some(i);
                break;
            }
        }
        assert_eq!(hit, Some(0));
    }

    #[test]
    fn test_pair_matcher_on_wins() {
        let mut m = PairMatcher::new("Relay[0] Off", "Relay[0] On");
        let mut hit = None;
        for &b in b"garbage Relay[0] On\r" {
            if let Some(i) = m.feed(b) {
                hit = Some(i);
                break;
            }
        }
        assert_eq!(hit, Some(1));
    }

    #[test]
    fn test_pair_matcher_prefix_overlap() {
        // "Relay[0] On" shares its first ten bytes with "Relay[0] Off"; the
        // diverging byte must settle the winner.
        let mut m = PairMatcher::new("Relay[1] Off", "Relay[1] On");
        let mut hit = None;
        for &b in b"Relay[1] Off" {
            if let Some(i) = m.feed(b) {
                hit = Some(i);
            }
        }
        assert_eq!(hit, Some(0));
    }
}
