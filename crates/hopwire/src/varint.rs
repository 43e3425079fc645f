//! Variable-length integer codec for the binary control plane.
//!
//! The two high bits of the first byte select the encoded width:
//!
//! | tag | bytes | significant bits | range                  |
//! |-----|-------|------------------|------------------------|
//! | 0   | 1     | 6                | 0..=63                 |
//! | 1   | 2     | 14               | 0..=16_383             |
//! | 2   | 4     | 30               | 0..=1_073_741_823      |
//! | 3   | 8     | 62               | 0..=2^62 - 1           |
//!
//! The remaining bits are the value in big-endian order. Writing ORs the
//! width tag's offset into the big-endian word; reading subtracts it again.
//!
//! Every function here works on caller-provided slices: nothing allocates and
//! truncated input is reported as `None`, never as a partial result.

/// Largest value that fits in the 8-byte form.
pub const MAX_VALUE: u64 = (1 << 62) - 1;

const ONE_BYTE_LIMIT: u64 = (1 << 6) - 1;
const TWO_BYTE_LIMIT: u64 = (1 << 14) - 1;
const FOUR_BYTE_LIMIT: u64 = (1 << 30) - 1;

const TWO_BYTE_TAG: u16 = 0x4000;
const FOUR_BYTE_TAG: u32 = 0x8000_0000;
const EIGHT_BYTE_TAG: u64 = 0xC000_0000_0000_0000;

/// Number of bytes `value` occupies when encoded, or `None` above [`MAX_VALUE`].
pub fn encoded_len(value: u64) -> Option<usize> {
    if value <= ONE_BYTE_LIMIT {
        Some(1)
    } else if value <= TWO_BYTE_LIMIT {
        Some(2)
    } else if value <= FOUR_BYTE_LIMIT {
        Some(4)
    } else if value <= MAX_VALUE {
        Some(8)
    } else {
        None
    }
}

/// Width in bytes announced by a first byte.
pub fn len_from_first_byte(first: u8) -> usize {
    1 << (first >> 6)
}

/// Decodes one integer from the front of `buf`.
///
/// Returns the value and the number of bytes consumed.
pub fn try_read(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = len_from_first_byte(first);
    let bytes = buf.get(..len)?;

    let value = match len {
        1 => u64::from(first),
        2 => {
            let raw = u16::from_be_bytes([bytes[0], bytes[1]]);
            u64::from(raw - TWO_BYTE_TAG)
        }
        4 => {
            let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            u64::from(raw - FOUR_BYTE_TAG)
        }
        _ => {
            let mut word = [0u8; 8];
            word.copy_from_slice(bytes);
            u64::from_be_bytes(word) - EIGHT_BYTE_TAG
        }
    };

    Some((value, len))
}

/// Encodes `value` in its smallest width at the front of `buf`.
///
/// Returns the number of bytes written. Nothing is written when `value`
/// exceeds [`MAX_VALUE`] or `buf` is too short.
pub fn try_write(buf: &mut [u8], value: u64) -> Option<usize> {
    let len = encoded_len(value)?;
    let dst = buf.get_mut(..len)?;

    match len {
        1 => dst[0] = value as u8,
        2 => dst.copy_from_slice(&(value as u16 | TWO_BYTE_TAG).to_be_bytes()),
        4 => dst.copy_from_slice(&(value as u32 | FOUR_BYTE_TAG).to_be_bytes()),
        _ => dst.copy_from_slice(&(value | EIGHT_BYTE_TAG).to_be_bytes()),
    }

    Some(len)
}

/// Decodes two consecutive integers, e.g. a settings identifier and its value.
///
/// Fails as a whole if either read fails; the consumed count covers both.
pub fn try_read_integer_pair(buf: &[u8]) -> Option<((u64, u64), usize)> {
    let (first, n1) = try_read(buf)?;
    let (second, n2) = try_read(&buf[n1..])?;
    Some(((first, second), n1 + n2))
}
