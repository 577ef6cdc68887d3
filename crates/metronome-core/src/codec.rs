//! Fixed-width integer array codec.
//!
//! Every persisted record and every command payload is a flat array of
//! fixed-width integers. Decoding is strict: a buffer whose length is not a
//! whole number of words is rejected, and encoding refuses values that do not
//! fit the requested width instead of truncating them.

use crate::error::{MetronomeError, Result};

/// Width of one wire word for record and command payloads.
pub const WORD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Signedness {
    #[default]
    Unsigned,
    Signed,
}

impl Signedness {
    fn label(self) -> &'static str {
        match self {
            Self::Unsigned => "unsigned",
            Self::Signed => "signed",
        }
    }

    /// Inclusive bounds representable in `width` bytes.
    fn bounds(self, width: usize) -> (i128, i128) {
        let bits = (width * 8) as u32;
        match self {
            Self::Unsigned => (0, (1i128 << bits) - 1),
            Self::Signed => (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1),
        }
    }
}

fn check_width(width: usize) -> Result<()> {
    if width == 0 || width > 8 {
        return Err(MetronomeError::InvalidWidth(width));
    }
    Ok(())
}

/// Decode `data` as a sequence of `width`-byte integers.
pub fn bytes_to_ints(
    data: &[u8],
    width: usize,
    order: ByteOrder,
    signedness: Signedness,
) -> Result<Vec<i128>> {
    check_width(width)?;
    if data.len() % width != 0 {
        return Err(MetronomeError::LengthMismatch {
            len: data.len(),
            width,
        });
    }

    let shift = (64 - width * 8) as u32;
    let values = data
        .chunks_exact(width)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            let raw = match order {
                ByteOrder::BigEndian => {
                    buf[8 - width..].copy_from_slice(chunk);
                    u64::from_be_bytes(buf)
                }
                ByteOrder::LittleEndian => {
                    buf[..width].copy_from_slice(chunk);
                    u64::from_le_bytes(buf)
                }
            };
            match signedness {
                Signedness::Unsigned => raw as i128,
                // Sign-extend from the top bit of the word.
                Signedness::Signed => (((raw << shift) as i64) >> shift) as i128,
            }
        })
        .collect();
    Ok(values)
}

/// Encode `values` as consecutive `width`-byte integers.
pub fn ints_to_bytes(
    values: &[i128],
    width: usize,
    order: ByteOrder,
    signedness: Signedness,
) -> Result<Vec<u8>> {
    check_width(width)?;
    let (min, max) = signedness.bounds(width);

    let mut out = Vec::with_capacity(values.len() * width);
    for &value in values {
        if value < min || value > max {
            return Err(MetronomeError::OutOfRange {
                value,
                width,
                signedness: signedness.label(),
            });
        }
        let raw = value as u128 as u64;
        match order {
            ByteOrder::BigEndian => out.extend_from_slice(&raw.to_be_bytes()[8 - width..]),
            ByteOrder::LittleEndian => out.extend_from_slice(&raw.to_le_bytes()[..width]),
        }
    }
    Ok(out)
}

/// Decode exactly `N` big-endian unsigned 8-byte words.
pub fn decode_words<const N: usize>(data: &[u8]) -> Result<[u64; N]> {
    if data.len() != N * WORD {
        return Err(MetronomeError::LengthMismatch {
            len: data.len(),
            width: N * WORD,
        });
    }
    let mut words = [0u64; N];
    for (slot, value) in words.iter_mut().zip(bytes_to_ints(
        data,
        WORD,
        ByteOrder::BigEndian,
        Signedness::Unsigned,
    )?) {
        *slot = value as u64;
    }
    Ok(words)
}

/// Encode big-endian unsigned 8-byte words. Every `u64` fits, so this cannot fail.
pub fn encode_words(words: &[u64]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}
