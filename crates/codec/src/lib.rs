//! Byte-level codecs for the document store keyspaces.
//!
//! Two concerns live here, both pure and stateless:
//!
//! - [`zerofree`]: an escaping scheme guaranteeing that an encoded qualifier
//!   never contains a raw 0x00 byte, so a single 0x00 can act as an
//!   unambiguous separator before a trailing version suffix.
//! - [`keys`]: packing (root key, property reference, version) tuples into
//!   ordered byte keys for the latest, historic, index and unique tables.

pub mod keys;
pub mod zerofree;

use thiserror::Error;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors raised while decoding byte keys or escaped qualifiers.
///
/// All of these indicate corrupt or foreign bytes; a well-formed store never
/// produces them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("raw 0x00 byte at offset {offset} in zero-free encoded input")]
    RawZero { offset: usize },

    #[error("truncated escape sequence at end of zero-free encoded input")]
    TruncatedEscape,

    #[error("invalid escape second byte 0x{byte:02x} at offset {offset}")]
    InvalidEscape { byte: u8, offset: usize },

    #[error("key too short: expected at least {expected} bytes, got {actual}")]
    KeyTooShort { expected: usize, actual: usize },

    #[error("missing separator before version suffix")]
    MissingSeparator,
}
