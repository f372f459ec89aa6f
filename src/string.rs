//! TEXT column codec: UTF-16LE storage, with an optional Unicode
//! compression scheme Jet uses to shrink mostly-ASCII columns.
//!
//! On disk a TEXT value is either:
//! - **Uncompressed**: plain UTF-16LE code units.
//! - **Compressed**: a 2-byte `0xFF 0xFE` marker followed by runs that
//!   alternate between a compressed run (each source UTF-16 code unit
//!   stored as a single byte, valid only when every code unit in the
//!   run is in `0x00..=0xFF`) and an uncompressed run (verbatim
//!   UTF-16LE), with a `0x00` separator byte between runs. A column is
//!   only eligible for compression if every character is ASCII,
//!   carriage return, line feed, or tab; anything else forces the
//!   whole value to stay uncompressed.

use crate::error::{Error, Result};

const COMPRESSION_MARKER: [u8; 2] = [0xFF, 0xFE];
const RUN_SEPARATOR: u8 = 0x00;

/// Returns true if every character in `s` can appear in a compressed
/// run: ASCII, or one of CR/LF/TAB (already ASCII, listed for clarity
/// since those are the three control characters Jet explicitly keeps
/// eligible).
fn is_compressible(s: &str) -> bool {
    s.chars().all(|c| {
        let code = c as u32;
        code <= 0x7F && (code >= 0x20 || c == '\r' || c == '\n' || c == '\t')
    })
}

/// Encodes a TEXT value, choosing compression when every character
/// qualifies and the compressed form is actually smaller.
pub fn encode_text(s: &str) -> Vec<u8> {
    if is_compressible(s) {
        let compressed = encode_compressed(s);
        if compressed.len() < encode_uncompressed(s).len() {
            return compressed;
        }
    }
    encode_uncompressed(s)
}

fn encode_uncompressed(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// A compressible string has every code unit `<= 0xFF`, so the whole
/// value is a single compressed run: the marker, then one byte per
/// code unit.
fn encode_compressed(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + s.len());
    out.extend_from_slice(&COMPRESSION_MARKER);
    for unit in s.encode_utf16() {
        out.push(unit as u8);
    }
    out
}

/// Decodes a TEXT value from its on-disk bytes.
pub fn decode_text(bytes: &[u8]) -> Result<String> {
    if bytes.len() >= 2 && bytes[0..2] == COMPRESSION_MARKER {
        decode_compressed(&bytes[2..])
    } else {
        decode_uncompressed(bytes)
    }
}

fn decode_uncompressed(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(Error::format(format!(
            "TEXT value has odd byte length {}",
            bytes.len()
        )));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|e| Error::format(format!("invalid UTF-16 in TEXT value: {e}")))
}

/// Decodes the run-alternating body that follows the compression
/// marker. Runs alternate compressed/uncompressed starting with a
/// compressed run, each terminated by a `0x00` separator except
/// possibly the last.
fn decode_compressed(mut body: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut compressed_run = true;
    while !body.is_empty() {
        let (run, rest) = match body.iter().position(|&b| b == RUN_SEPARATOR) {
            Some(idx) => (&body[..idx], &body[idx + 1..]),
            None => (body, &body[body.len()..]),
        };
        if compressed_run {
            for &b in run {
                out.push(b as char);
            }
        } else {
            out.push_str(&decode_uncompressed(run)?);
        }
        body = rest;
        compressed_run = !compressed_run;
    }
    Ok(out)
}

/// Upper bound on the encoded size of a compressed-eligible value,
/// used to reject a column write before it is known whether
/// compression will actually be applied.
pub fn encoded_length_upper_bound(s: &str) -> usize {
    4 + s.encode_utf16().count() * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_round_trips_compressed() {
        let encoded = encode_text("hello");
        assert_eq!(&encoded[0..2], &COMPRESSION_MARKER);
        assert_eq!(decode_text(&encoded).unwrap(), "hello");
    }

    #[test]
    fn non_ascii_forces_uncompressed() {
        let encoded = encode_text("日本語");
        assert_ne!(&encoded[0..2.min(encoded.len())], &COMPRESSION_MARKER[..2.min(encoded.len())]);
        assert_eq!(decode_text(&encoded).unwrap(), "日本語");
    }

    #[test]
    fn control_characters_stay_eligible() {
        assert!(is_compressible("a\r\nb\tc"));
        let encoded = encode_text("a\r\nb\tc");
        assert_eq!(decode_text(&encoded).unwrap(), "a\r\nb\tc");
    }

    #[test]
    fn other_control_characters_disqualify_compression() {
        assert!(!is_compressible("a\u{0007}b"));
    }

    #[test]
    fn empty_string_round_trips() {
        let encoded = encode_text("");
        assert_eq!(decode_text(&encoded).unwrap(), "");
    }

    #[test]
    fn uncompressed_round_trips() {
        let encoded = encode_uncompressed("mixed日本");
        assert_eq!(decode_uncompressed(&encoded).unwrap(), "mixed日本");
    }
}
