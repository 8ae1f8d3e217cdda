//! Small helpers shared across modules.

use std::fmt::Write;

/// Render a byte slice as contiguous uppercase hex, for wire-traffic debug
/// output.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02X}");
    }
    out
}

/// Printable rendering of a wire buffer: ASCII where possible, `\xNN`
/// elsewhere. CR and LF are shown as escapes so log lines stay single-line.
pub fn printable(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\x{b:02X}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x12, 0x34, 0xab]), "1234AB");
    }

    #[test]
    fn test_printable_escapes_control_bytes() {
        assert_eq!(printable(b"OK\r\n\x01"), "OK\\r\\n\\x01");
    }
}
