//! Modified UTF-8, the string encoding of `CONSTANT_Utf8_info`.
//!
//! See [JVMS §4.4.7][0]. The differences from standard UTF-8:
//!
//!   * the null character is encoded in 2-byte form (`C0 80`) so encoded
//!     strings never contain an embedded zero byte;
//!   * only the 1-, 2-, and 3-byte forms are used;
//!   * supplementary characters are represented as surrogate pairs, each
//!     surrogate encoded separately in 3-byte form.
//!
//! [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.4.7

use crate::error::{Error, Result};

/// Encode a string into Modified UTF-8 bytes.
pub fn encode(string: &str) -> Vec<u8> {
    let mut buffer: Vec<u8> = Vec::with_capacity(string.len());
    for c in string.chars() {
        let code = c as u32;
        match code {
            // Null is the exception to the 1-byte range
            0x0001..=0x007F => buffer.push(code as u8),
            0x0000 | 0x0080..=0x07FF => {
                buffer.push((code >> 6 & 0x1F) as u8 | 0b1100_0000);
                buffer.push((code & 0x3F) as u8 | 0b1000_0000);
            }
            0x0800..=0xFFFF => encode_unit(code as u16, &mut buffer),
            // Supplementary characters become a surrogate pair
            _ => {
                let shifted = code - 0x1_0000;
                encode_unit(0xD800 | (shifted >> 10) as u16, &mut buffer);
                encode_unit(0xDC00 | (shifted & 0x3FF) as u16, &mut buffer);
            }
        }
    }
    buffer
}

fn encode_unit(unit: u16, buffer: &mut Vec<u8>) {
    buffer.push((unit >> 12 & 0x0F) as u8 | 0b1110_0000);
    buffer.push((unit >> 6 & 0x3F) as u8 | 0b1000_0000);
    buffer.push((unit & 0x3F) as u8 | 0b1000_0000);
}

/// Decode Modified UTF-8 bytes back into a string.
///
/// Decoding is strict: embedded zero bytes, bytes in the `F0..FF` range,
/// truncated sequences, bad continuation bytes, and unpaired surrogates all
/// report [`Error::Malformed`].
pub fn decode(bytes: &[u8]) -> Result<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let unit = match b {
            0x01..=0x7F => {
                i += 1;
                b as u16
            }
            0xC0..=0xDF => {
                let b2 = continuation(bytes, i + 1)?;
                i += 2;
                ((b as u16 & 0x1F) << 6) | b2 as u16
            }
            0xE0..=0xEF => {
                let b2 = continuation(bytes, i + 1)?;
                let b3 = continuation(bytes, i + 2)?;
                i += 3;
                ((b as u16 & 0x0F) << 12) | ((b2 as u16) << 6) | b3 as u16
            }
            _ => {
                return Err(Error::Malformed(format!(
                    "invalid modified UTF-8 byte 0x{b:02X} at offset {i}"
                )))
            }
        };
        units.push(unit);
    }
    String::from_utf16(&units)
        .map_err(|_| Error::Malformed("unpaired surrogate in modified UTF-8".to_string()))
}

fn continuation(bytes: &[u8], at: usize) -> Result<u8> {
    match bytes.get(at) {
        Some(b) if b & 0xC0 == 0x80 => Ok(b & 0x3F),
        Some(b) => Err(Error::Malformed(format!(
            "invalid modified UTF-8 continuation byte 0x{b:02X} at offset {at}"
        ))),
        None => Err(Error::Malformed("truncated modified UTF-8 sequence".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_two_bytes() {
        assert_eq!(encode("a\x00a"), vec![97, 192, 128, 97]);
        assert_eq!(decode(&[97, 192, 128, 97]).unwrap(), "a\x00a");
    }

    #[test]
    fn simple_ascii() {
        assert_eq!(encode("foo"), vec![102, 111, 111]);
        assert_eq!(encode("java/lang/Object"), b"java/lang/Object".to_vec());
    }

    #[test]
    fn two_and_three_byte_forms() {
        assert_eq!(encode("é"), vec![0xC3, 0xA9]);
        assert_eq!(encode("ࠀ"), vec![0xE0, 0xA0, 0x80]);
        assert_eq!(decode(&[0xC3, 0xA9]).unwrap(), "é");
        assert_eq!(decode(&[0xE0, 0xA0, 0x80]).unwrap(), "ࠀ");
    }

    #[test]
    fn supplementary_characters_are_surrogate_pairs() {
        // U+10000 = D800 DC00
        assert_eq!(
            encode("\u{10000}"),
            vec![0xED, 0xA0, 0x80, 0xED, 0xB0, 0x80]
        );
        assert_eq!(
            encode("\u{10FFFF}"),
            vec![0xED, 0xAF, 0xBF, 0xED, 0xBF, 0xBF]
        );
    }

    #[test]
    fn round_trips() {
        for s in ["", "hello", "a\u{0}b", "π ≈ 3", "\u{10348}\u{10FFFF}", "ऄअॲঅ"] {
            assert_eq!(decode(&encode(s)).unwrap(), s, "round trip of {s:?}");
        }
    }

    #[test]
    fn rejects_embedded_zero_and_four_byte_forms() {
        assert!(decode(&[0x00]).is_err());
        assert!(decode(&[0xF0, 0x90, 0x80, 0x80]).is_err());
        assert!(decode(&[0xC3]).is_err());
        assert!(decode(&[0xE0, 0x20, 0x80]).is_err());
    }
}
