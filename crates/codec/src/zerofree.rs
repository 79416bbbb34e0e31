//! Zero-free byte escaping.
//!
//! Escapes 0x00 as `0x01 0x01` and 0x01 as `0x01 0x02`; every other byte
//! passes through unchanged. The encoded form therefore never contains a raw
//! 0x00, and `decode(encode(x)) == x` holds for every byte sequence.

use crate::{CodecError, Result};

const ESCAPE: u8 = 0x01;
const ESCAPED_ZERO: u8 = 0x01;
const ESCAPED_ONE: u8 = 0x02;

/// Append the zero-free encoding of `src` to `out`.
///
/// The output buffer is not cleared; callers compose larger keys by encoding
/// into a shared scratch buffer.
pub fn encode_into(src: &[u8], out: &mut Vec<u8>) {
    out.reserve(src.len());
    for &byte in src {
        match byte {
            0x00 => out.extend_from_slice(&[ESCAPE, ESCAPED_ZERO]),
            0x01 => out.extend_from_slice(&[ESCAPE, ESCAPED_ONE]),
            other => out.push(other),
        }
    }
}

/// Convenience form of [`encode_into`] allocating a fresh buffer.
pub fn encode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    encode_into(src, &mut out);
    out
}

/// Decode a zero-free encoded byte sequence.
///
/// A raw 0x00 anywhere, an escape byte with no second byte, or an escape
/// second byte outside {0x01, 0x02} is a decode error: such bytes cannot have
/// been produced by [`encode_into`].
pub fn decode(src: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            0x00 => return Err(CodecError::RawZero { offset: i }),
            ESCAPE => {
                let Some(&second) = src.get(i + 1) else {
                    return Err(CodecError::TruncatedEscape);
                };
                match second {
                    ESCAPED_ZERO => out.push(0x00),
                    ESCAPED_ONE => out.push(0x01),
                    byte => {
                        return Err(CodecError::InvalidEscape {
                            byte,
                            offset: i + 1,
                        })
                    }
                }
                i += 2;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_single_bytes() {
        for byte in 0u8..=255 {
            let input = [byte];
            let encoded = encode(&input);
            assert!(!encoded.contains(&0x00), "byte {byte:#04x} leaked a zero");
            assert_eq!(decode(&encoded).unwrap(), input);
        }
    }

    #[test]
    fn test_roundtrip_mixed_sequences() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x00],
            vec![0x01],
            vec![0x00, 0x01, 0x00, 0x01],
            vec![0x01, 0x01, 0x01],
            vec![0xFF, 0x00, 0x7F, 0x01, 0x80],
            (0u8..=255).collect(),
        ];
        for case in cases {
            let encoded = encode(&case);
            assert!(!encoded.contains(&0x00));
            assert_eq!(decode(&encoded).unwrap(), case, "case {case:?}");
        }
    }

    #[test]
    fn test_decode_rejects_raw_zero() {
        assert_eq!(
            decode(&[0x42, 0x00, 0x42]),
            Err(CodecError::RawZero { offset: 1 })
        );
    }

    #[test]
    fn test_decode_rejects_truncated_escape() {
        assert_eq!(decode(&[0x42, 0x01]), Err(CodecError::TruncatedEscape));
    }

    #[test]
    fn test_decode_rejects_bad_escape_byte() {
        assert_eq!(
            decode(&[0x01, 0x03]),
            Err(CodecError::InvalidEscape {
                byte: 0x03,
                offset: 1
            })
        );
    }
}
