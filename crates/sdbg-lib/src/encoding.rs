//! DNA nucleotide encoding
//!
//! 2-bit encoding used throughout the builder:
//! A -> 0, C -> 1, G -> 2, T -> 3.
//!
//! The complement of a base is `3 - base`, so reverse complements reduce to
//! bitwise NOT plus base-order reversal on packed words.

use thiserror::Error;

/// Error type for encoding operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The input byte is not a valid DNA base (A/C/G/T)
    #[error("Invalid DNA base: {0:?}")]
    InvalidBase(u8),
}

/// Encode a single DNA nucleotide to 2 bits
#[inline]
pub const fn encode_base(base: u8) -> Result<u8, EncodingError> {
    match base {
        b'A' | b'a' => Ok(0),
        b'C' | b'c' => Ok(1),
        b'G' | b'g' => Ok(2),
        b'T' | b't' => Ok(3),
        _ => Err(EncodingError::InvalidBase(base)),
    }
}

/// Decode a 2-bit value to an uppercase DNA nucleotide
#[inline]
pub const fn decode_base(bits: u8) -> u8 {
    match bits & 0b11 {
        0 => b'A',
        1 => b'C',
        2 => b'G',
        _ => b'T',
    }
}

/// Complement of an encoded base (A<->T, C<->G)
#[inline]
pub const fn complement_base(bits: u8) -> u8 {
    3 - (bits & 0b11)
}
