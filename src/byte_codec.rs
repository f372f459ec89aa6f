//! Little-endian primitives and other byte-range helpers shared by the
//! column, page, and index codecs.
//!
//! Every function here takes an explicit `(bytes, offset)` pair and
//! returns a plain value or writes into a caller-owned slice; none of
//! them carry implicit cursor state or assume a byte order beyond what
//! their name says. This keeps endianness a property of the call site,
//! not of some shared buffer.

use crate::error::{Error, Result};

/// Reads a 2-byte little-endian unsigned integer at `offset`.
pub fn read_u16_le(bytes: &[u8], offset: usize) -> Result<u16> {
    let chunk = get_range(bytes, offset, 2)?;
    Ok(u16::from_le_bytes([chunk[0], chunk[1]]))
}

pub fn read_u16_be(bytes: &[u8], offset: usize) -> Result<u16> {
    let chunk = get_range(bytes, offset, 2)?;
    Ok(u16::from_be_bytes([chunk[0], chunk[1]]))
}

/// Reads a 4-byte little-endian unsigned integer at `offset`.
pub fn read_u32_le(bytes: &[u8], offset: usize) -> Result<u32> {
    let chunk = get_range(bytes, offset, 4)?;
    Ok(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

pub fn read_i32_le(bytes: &[u8], offset: usize) -> Result<i32> {
    Ok(read_u32_le(bytes, offset)? as i32)
}

pub fn read_u32_be(bytes: &[u8], offset: usize) -> Result<u32> {
    let chunk = get_range(bytes, offset, 4)?;
    Ok(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

pub fn read_u64_le(bytes: &[u8], offset: usize) -> Result<u64> {
    let chunk = get_range(bytes, offset, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(chunk);
    Ok(u64::from_le_bytes(buf))
}

pub fn read_i64_le(bytes: &[u8], offset: usize) -> Result<i64> {
    Ok(read_u64_le(bytes, offset)? as i64)
}

pub fn read_f32_le(bytes: &[u8], offset: usize) -> Result<f32> {
    Ok(f32::from_bits(read_u32_le(bytes, offset)?))
}

pub fn read_f64_le(bytes: &[u8], offset: usize) -> Result<f64> {
    Ok(f64::from_bits(read_u64_le(bytes, offset)?))
}

/// Reads an unsigned 3-byte ("tri-byte") little-endian integer, used
/// for LVAL overflow-row page pointers and the row-count bitfield that
/// is packed into 3 bytes on a data page header.
pub fn read_u24_le(bytes: &[u8], offset: usize) -> Result<u32> {
    let chunk = get_range(bytes, offset, 3)?;
    Ok(chunk[0] as u32 | (chunk[1] as u32) << 8 | (chunk[2] as u32) << 16)
}

pub fn write_u16_le(buf: &mut [u8], offset: usize, value: u16) -> Result<()> {
    get_range_mut(buf, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
    get_range_mut(buf, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_u32_be(buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
    get_range_mut(buf, offset, 4)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

pub fn write_u64_le(buf: &mut [u8], offset: usize, value: u64) -> Result<()> {
    get_range_mut(buf, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_f64_le(buf: &mut [u8], offset: usize, value: f64) -> Result<()> {
    write_u64_le(buf, offset, value.to_bits())
}

pub fn write_u24_le(buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let dst = get_range_mut(buf, offset, 3)?;
    dst[0] = (value & 0xFF) as u8;
    dst[1] = ((value >> 8) & 0xFF) as u8;
    dst[2] = ((value >> 16) & 0xFF) as u8;
    Ok(())
}

/// Bounds-checked immutable sub-slice; every reader in this module
/// routes through here so a truncated page always surfaces as
/// [`Error::FormatViolation`] rather than a panic.
pub fn get_range(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    bytes.get(offset..offset + len).ok_or_else(|| {
        Error::format(format!(
            "short read: wanted {} bytes at offset {} in a {}-byte buffer",
            len,
            offset,
            bytes.len()
        ))
    })
}

/// Bounds-checked mutable sub-slice counterpart of [`get_range`].
pub fn get_range_mut(bytes: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8]> {
    let total = bytes.len();
    bytes.get_mut(offset..offset + len).ok_or_else(|| {
        Error::format(format!(
            "short write: wanted {} bytes at offset {} in a {}-byte buffer",
            len, offset, total
        ))
    })
}

/// Swaps the byte order of a fixed-size buffer in place. Used by the
/// GUID codec, which stores its first three components little-endian
/// but the trailing eight bytes big-endian.
pub fn swap_endian(bytes: &mut [u8]) {
    bytes.reverse();
}

/// Renders a byte slice as a space-separated hex string, for embedding
/// in format-violation error messages.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_u32() {
        let mut buf = [0u8; 8];
        write_u32_le(&mut buf, 2, 0xDEAD_BEEF).unwrap();
        assert_eq!(read_u32_le(&buf, 2).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn tri_byte_round_trips() {
        let mut buf = [0u8; 4];
        write_u24_le(&mut buf, 0, 0x01_02_03).unwrap();
        assert_eq!(read_u24_le(&buf, 0).unwrap(), 0x01_02_03);
        assert_eq!(buf[3], 0);
    }

    #[test]
    fn short_read_is_format_violation() {
        let buf = [0u8; 2];
        let err = read_u32_le(&buf, 0).unwrap_err();
        assert!(matches!(err, Error::FormatViolation(_)));
    }

    #[test]
    fn hex_dump_formats_lowercase_pairs() {
        assert_eq!(hex_dump(&[0xAB, 0x01]), "ab 01");
    }
}
