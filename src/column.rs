//! Column type metadata and per-type value codecs.
//!
//! A [`Column`] describes one field of a [`crate::table::Table`]: its
//! data type, whether it is fixed- or variable-length, and where its
//! value lives in a row (a fixed-area offset, a slot in the
//! variable-offset table, or an LVAL descriptor). The codec functions
//! in this module translate between a decoded [`Value`] and the bytes
//! a [`Column`] occupies; row assembly (null mask, variable-offset
//! table, LVAL chain allocation) is [`crate::row`]'s job.

use crate::byte_codec::*;
use crate::error::{Error, Result};
use crate::row::RowState;
use crate::string;

/// Days between the Julian epoch Access anchors dates to (1899-12-30)
/// and the Unix epoch, used only for human-readable conversions at
/// the API boundary; storage itself keeps the raw `f64` day count.
pub const DATE_EPOCH_OFFSET_DAYS: f64 = 25569.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    Byte,
    Int16,
    Int32,
    Money,
    Float32,
    Float64,
    ShortDateTime,
    Binary,
    Text,
    Ole,
    Memo,
    Guid,
    Numeric,
    Complex,
    BigInt,
}

impl DataType {
    /// Fixed on-disk width in bytes, or `None` for variable-length and
    /// long-value types.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            DataType::Boolean => Some(0), // lives entirely in the null mask
            DataType::Byte => Some(1),
            DataType::Int16 => Some(2),
            DataType::Int32 => Some(4),
            DataType::Money => Some(8),
            DataType::Float32 => Some(4),
            DataType::Float64 => Some(8),
            DataType::ShortDateTime => Some(8),
            DataType::Guid => Some(16),
            DataType::BigInt => Some(8),
            DataType::Numeric => Some(17),
            DataType::Binary | DataType::Text | DataType::Ole | DataType::Memo | DataType::Complex => None,
        }
    }

    pub fn is_long_value(self) -> bool {
        matches!(self, DataType::Ole | DataType::Memo)
    }

    pub fn is_variable_length(self) -> bool {
        self.fixed_size().is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutoNumberGenerator {
    /// Monotonically increasing 32-bit LONG, persisted on the table.
    LongCounter,
    /// UUID v4, generated fresh per insert.
    Guid,
    /// Synthetic complex-value id, persisted on the table.
    ComplexCounter,
    /// A generator flavor this engine does not know how to drive.
    Unsupported,
}

#[derive(Debug, Clone, Copy)]
pub struct NumericInfo {
    pub precision: u8,
    pub scale: u8,
}

/// One field of a table's row layout.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    /// Ordinal among all columns, fixed and variable alike; matches
    /// catalog storage order, not necessarily declaration order.
    pub column_number: u16,
    pub nullable: bool,
    pub compressed_unicode: bool,
    pub numeric_info: Option<NumericInfo>,
    pub auto_number: Option<AutoNumberGenerator>,
    /// Offset into the row's fixed-data area; `None` for variable and
    /// long-value columns.
    pub fixed_offset: Option<usize>,
    /// Index into the row's variable-offset table; `None` for fixed
    /// and (handled separately) long-value columns.
    pub variable_index: Option<usize>,
    /// Bit position in the row's null mask. Every nullable column
    /// gets one; every BOOLEAN column gets one too, since its value
    /// *is* that bit (inverted) rather than a separate null indicator.
    pub null_mask_index: Option<usize>,
}

impl Column {
    pub fn is_fixed_length(&self) -> bool {
        self.data_type.fixed_size().is_some()
    }
}

/// A decoded column value. `Null` is distinct from e.g. an empty
/// string so a caller can round-trip either.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(u8),
    Int16(i16),
    Int32(i32),
    BigInt(i64),
    Money(i64),
    Float32(f32),
    Float64(f64),
    /// Days since 1899-12-30 (integer part) plus time-of-day fraction.
    ShortDateTime(f64),
    Text(String),
    Binary(Vec<u8>),
    Guid([u8; 16]),
    /// Sign byte plus the 16-byte big-endian unsigned magnitude.
    Numeric { sign: bool, magnitude: [u8; 16] },
    LongValue(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Decodes a BOOLEAN value from the row's null mask: the bit is
/// inverted, so a *set* bit means `false`.
pub fn decode_boolean(null_mask_bit_set: bool) -> Value {
    Value::Boolean(!null_mask_bit_set)
}

pub fn encode_boolean(value: bool) -> bool {
    !value
}

pub fn decode_byte(bytes: &[u8], offset: usize) -> Result<Value> {
    Ok(Value::Byte(*get_range(bytes, offset, 1)?.first().unwrap()))
}

pub fn encode_byte(buf: &mut [u8], offset: usize, v: u8) -> Result<()> {
    get_range_mut(buf, offset, 1)?[0] = v;
    Ok(())
}

pub fn decode_int16(bytes: &[u8], offset: usize) -> Result<Value> {
    Ok(Value::Int16(read_u16_le(bytes, offset)? as i16))
}

pub fn encode_int16(buf: &mut [u8], offset: usize, v: i16) -> Result<()> {
    write_u16_le(buf, offset, v as u16)
}

pub fn decode_int32(bytes: &[u8], offset: usize) -> Result<Value> {
    Ok(Value::Int32(read_i32_le(bytes, offset)?))
}

pub fn encode_int32(buf: &mut [u8], offset: usize, v: i32) -> Result<()> {
    write_u32_le(buf, offset, v as u32)
}

pub fn decode_bigint(bytes: &[u8], offset: usize) -> Result<Value> {
    Ok(Value::BigInt(read_i64_le(bytes, offset)?))
}

pub fn decode_float32(bytes: &[u8], offset: usize) -> Result<Value> {
    Ok(Value::Float32(read_f32_le(bytes, offset)?))
}

pub fn decode_float64(bytes: &[u8], offset: usize) -> Result<Value> {
    Ok(Value::Float64(read_f64_le(bytes, offset)?))
}

pub fn encode_float64(buf: &mut [u8], offset: usize, v: f64) -> Result<()> {
    write_f64_le(buf, offset, v)
}

/// MONEY is a signed 64-bit integer scaled by 10^4; decoding keeps the
/// raw scaled integer since currency math should stay exact.
pub fn decode_money(bytes: &[u8], offset: usize) -> Result<Value> {
    Ok(Value::Money(read_i64_le(bytes, offset)?))
}

pub fn encode_money(buf: &mut [u8], offset: usize, scaled: i64) -> Result<()> {
    write_u64_le(buf, offset, scaled as u64)
}

/// SHORT_DATE_TIME is an IEEE-754 double: the integer part is days
/// since 1899-12-30 in local time, the fractional part is the
/// fraction of a day elapsed.
pub fn decode_short_date_time(bytes: &[u8], offset: usize) -> Result<Value> {
    Ok(Value::ShortDateTime(read_f64_le(bytes, offset)?))
}

pub fn encode_short_date_time(buf: &mut [u8], offset: usize, days: f64) -> Result<()> {
    write_f64_le(buf, offset, days)
}

/// NUMERIC: 1 sign byte followed by 16 bytes that are stored as a
/// sequence of little-endian 4-byte quad-word groups but whose
/// concatenation (group 3, group 2, group 1, group 0, each internally
/// byte-reversed) forms a single big-endian unsigned integer magnitude.
pub fn decode_numeric(bytes: &[u8], offset: usize) -> Result<Value> {
    let chunk = get_range(bytes, offset, 17)?;
    let sign = chunk[0] != 0;
    let mut magnitude = [0u8; 16];
    // Four 4-byte little-endian groups, most-significant group last in
    // storage order; reassemble into one big-endian 16-byte integer.
    for group in 0..4 {
        let src = &chunk[1 + group * 4..1 + group * 4 + 4];
        let dst_start = (3 - group) * 4;
        for i in 0..4 {
            magnitude[dst_start + i] = src[3 - i];
        }
    }
    Ok(Value::Numeric { sign, magnitude })
}

pub fn encode_numeric(buf: &mut [u8], offset: usize, sign: bool, magnitude: &[u8; 16]) -> Result<()> {
    let dst = get_range_mut(buf, offset, 17)?;
    dst[0] = sign as u8;
    for group in 0..4 {
        let src_start = (3 - group) * 4;
        for i in 0..4 {
            dst[1 + group * 4 + i] = magnitude[src_start + 3 - i];
        }
    }
    Ok(())
}

/// GUID: 16 raw bytes, but the first three components (a 4-byte
/// `Data1`, 2-byte `Data2`, 2-byte `Data3`) are little-endian within
/// themselves when the row is little-endian, matching the standard
/// Windows GUID wire format; the trailing 8-byte `Data4` is stored
/// byte-for-byte. We keep the raw 16 bytes as-is and leave
/// component-aware swapping to a formatting layer, since the storage
/// round-trip never needs to interpret the fields.
pub fn decode_guid(bytes: &[u8], offset: usize) -> Result<Value> {
    let chunk = get_range(bytes, offset, 16)?;
    let mut guid = [0u8; 16];
    guid.copy_from_slice(chunk);
    Ok(Value::Guid(guid))
}

pub fn encode_guid(buf: &mut [u8], offset: usize, guid: &[u8; 16]) -> Result<()> {
    get_range_mut(buf, offset, 16)?.copy_from_slice(guid);
    Ok(())
}

/// Renders a GUID's raw bytes as the canonical
/// `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}` text form.
pub fn format_guid(guid: &[u8; 16]) -> String {
    format!(
        "{{{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
        guid[3], guid[2], guid[1], guid[0],
        guid[5], guid[4],
        guid[7], guid[6],
        guid[8], guid[9],
        guid[10], guid[11], guid[12], guid[13], guid[14], guid[15],
    )
}

/// Decodes a TEXT value stored in the variable-data region.
pub fn decode_text(bytes: &[u8]) -> Result<Value> {
    Ok(Value::Text(string::decode_text(bytes)?))
}

pub fn encode_text(s: &str) -> Vec<u8> {
    string::encode_text(s)
}

pub fn decode_binary(bytes: &[u8]) -> Value {
    Value::Binary(bytes.to_vec())
}

/// Type tag stored in the top byte of an LVAL descriptor's length word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LvalKind {
    /// Payload is inline, immediately following the descriptor.
    Inline,
    /// Payload lives entirely on one overflow row.
    SingleOverflow,
    /// Payload is the head of a multi-row overflow chain.
    ChainHead,
}

impl LvalKind {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0x80 => Ok(LvalKind::Inline),
            0x40 => Ok(LvalKind::SingleOverflow),
            0x00 => Ok(LvalKind::ChainHead),
            other => Err(Error::format(format!("unrecognized LVAL type tag 0x{other:02x}"))),
        }
    }

    fn to_tag(self) -> u8 {
        match self {
            LvalKind::Inline => 0x80,
            LvalKind::SingleOverflow => 0x40,
            LvalKind::ChainHead => 0x00,
        }
    }
}

/// The fixed 12-byte LVAL descriptor: `(length | (kind << 24))` plus
/// an 8-byte payload whose interpretation depends on `kind`.
#[derive(Debug, Clone, Copy)]
pub struct LvalDescriptor {
    pub kind: LvalKind,
    pub total_length: u32,
    /// For `SingleOverflow`/`ChainHead`: the first overflow row's row
    /// number and page number. Unused for `Inline`.
    pub first_row_number: u8,
    pub first_page_number: u32,
}

impl LvalDescriptor {
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self> {
        let chunk = get_range(bytes, offset, 12)?;
        let length_and_tag = read_u32_le(chunk, 0)?;
        let kind = LvalKind::from_tag((length_and_tag >> 24) as u8)?;
        let total_length = length_and_tag & 0x00FF_FFFF;
        let (first_row_number, first_page_number) = match kind {
            LvalKind::Inline => (0, 0),
            LvalKind::SingleOverflow | LvalKind::ChainHead => {
                let row_number = chunk[4];
                let page_number = read_u24_le(chunk, 5)?;
                (row_number, page_number)
            }
        };
        Ok(LvalDescriptor {
            kind,
            total_length,
            first_row_number,
            first_page_number,
        })
    }

    pub fn encode(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        let dst = get_range_mut(buf, offset, 12)?;
        let length_and_tag = (self.total_length & 0x00FF_FFFF) | ((self.kind.to_tag() as u32) << 24);
        dst[0..4].copy_from_slice(&length_and_tag.to_le_bytes());
        if self.kind != LvalKind::Inline {
            dst[4] = self.first_row_number;
            write_u24_le(&mut dst[5..8], 0, self.first_page_number)?;
        }
        Ok(())
    }
}

/// One overflow row in an LVAL chain: the first 4 bytes give the next
/// row/page pointer (ignored on the last row), the remainder is
/// payload. `RowState` supplies each overflow row's bytes; this
/// function only interprets one row's worth.
pub struct OverflowRowView<'a> {
    pub next_row_number: u8,
    pub next_page_number: u32,
    pub payload: &'a [u8],
    pub is_last: bool,
}

pub fn decode_overflow_row(bytes: &[u8], is_last: bool) -> Result<OverflowRowView<'_>> {
    let header = get_range(bytes, 0, 4)?;
    let next_row_number = header[0];
    let next_page_number = read_u24_le(header, 1)?;
    Ok(OverflowRowView {
        next_row_number,
        next_page_number,
        payload: &bytes[4..],
        is_last,
    })
}

/// Walks an LVAL chain to completion given a row-fetch callback,
/// returning the reassembled payload truncated to the descriptor's
/// declared total length.
pub fn read_long_value(
    descriptor: &LvalDescriptor,
    inline_tail: &[u8],
    mut fetch_row: impl FnMut(u32, u8) -> Result<Vec<u8>>,
) -> Result<Vec<u8>> {
    match descriptor.kind {
        LvalKind::Inline => {
            let mut data = inline_tail.to_vec();
            data.truncate(descriptor.total_length as usize);
            Ok(data)
        }
        LvalKind::SingleOverflow => {
            let row = fetch_row(descriptor.first_page_number, descriptor.first_row_number)?;
            let view = decode_overflow_row(&row, true)?;
            let mut data = view.payload.to_vec();
            data.truncate(descriptor.total_length as usize);
            Ok(data)
        }
        LvalKind::ChainHead => {
            let mut data = Vec::with_capacity(descriptor.total_length as usize);
            let mut page = descriptor.first_page_number;
            let mut row_number = descriptor.first_row_number;
            loop {
                let row = fetch_row(page, row_number)?;
                let remaining = descriptor.total_length as usize - data.len();
                let is_last = row.len().saturating_sub(4) >= remaining;
                let view = decode_overflow_row(&row, is_last)?;
                if is_last {
                    data.extend_from_slice(&view.payload[..remaining.min(view.payload.len())]);
                    break;
                }
                data.extend_from_slice(view.payload);
                page = view.next_page_number;
                row_number = view.next_row_number;
                if page == 0 {
                    return Err(Error::format("LVAL chain terminated before reaching declared length"));
                }
            }
            Ok(data)
        }
    }
}

/// Completes a long-value read: `raw` is a [`Value::LongValue`]'s
/// bytes as decoded straight off the row (the 12-byte descriptor plus
/// whatever inline tail followed it), `fetch_row` retrieves a
/// `(page, row_number)` overflow row's bytes from the owning
/// `PageChannel`. Kept separate from [`decode_column`] because row
/// decoding has no access to the page channel needed to walk a chain.
pub fn materialize_long_value(raw: &[u8], fetch_row: impl FnMut(u32, u8) -> Result<Vec<u8>>) -> Result<Vec<u8>> {
    let descriptor = LvalDescriptor::decode(raw, 0)?;
    read_long_value(&descriptor, &raw[12.min(raw.len())..], fetch_row)
}

/// Entry point used by [`RowState`] to decode a column's value out of
/// a positioned row; dispatches on [`DataType`] and the column's
/// storage location (fixed offset vs. variable-offset slot).
pub fn decode_column(column: &Column, row: &RowState) -> Result<Value> {
    if column.nullable && row.is_null(column)? {
        return Ok(Value::Null);
    }
    match column.data_type {
        DataType::Boolean => Ok(decode_boolean(row.null_mask_bit(column)?)),
        DataType::Byte => decode_byte(row.fixed_data(), column.fixed_offset.unwrap_or(0)),
        DataType::Int16 => decode_int16(row.fixed_data(), column.fixed_offset.unwrap_or(0)),
        DataType::Int32 => decode_int32(row.fixed_data(), column.fixed_offset.unwrap_or(0)),
        DataType::BigInt => decode_bigint(row.fixed_data(), column.fixed_offset.unwrap_or(0)),
        DataType::Money => decode_money(row.fixed_data(), column.fixed_offset.unwrap_or(0)),
        DataType::Float32 => decode_float32(row.fixed_data(), column.fixed_offset.unwrap_or(0)),
        DataType::Float64 => decode_float64(row.fixed_data(), column.fixed_offset.unwrap_or(0)),
        DataType::ShortDateTime => decode_short_date_time(row.fixed_data(), column.fixed_offset.unwrap_or(0)),
        DataType::Numeric => decode_numeric(row.fixed_data(), column.fixed_offset.unwrap_or(0)),
        DataType::Guid => decode_guid(row.fixed_data(), column.fixed_offset.unwrap_or(0)),
        DataType::Text => {
            let idx = column.variable_index.ok_or_else(|| Error::format("text column missing variable slot"))?;
            decode_text(row.variable_slice(idx)?)
        }
        DataType::Binary => {
            let idx = column.variable_index.ok_or_else(|| Error::format("binary column missing variable slot"))?;
            Ok(decode_binary(row.variable_slice(idx)?))
        }
        DataType::Memo | DataType::Ole => {
            // Returns the raw descriptor-plus-inline-tail bytes; the
            // caller (`Table::read_row`) runs these through
            // `materialize_long_value` once it has a page channel to
            // walk an overflow chain with.
            let idx = column.variable_index.ok_or_else(|| Error::format("long-value column missing variable slot"))?;
            Ok(Value::LongValue(row.variable_slice(idx)?.to_vec()))
        }
        DataType::Complex => Err(Error::Unsupported("complex columns are not decoded".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_bit_is_inverted() {
        assert_eq!(decode_boolean(true), Value::Boolean(false));
        assert_eq!(decode_boolean(false), Value::Boolean(true));
        assert!(encode_boolean(false));
        assert!(!encode_boolean(true));
    }

    #[test]
    fn int32_round_trips() {
        let mut buf = [0u8; 4];
        encode_int32(&mut buf, 0, -42).unwrap();
        assert_eq!(decode_int32(&buf, 0).unwrap(), Value::Int32(-42));
    }

    #[test]
    fn money_keeps_scaled_integer() {
        let mut buf = [0u8; 8];
        encode_money(&mut buf, 0, 123_4567).unwrap();
        assert_eq!(decode_money(&buf, 0).unwrap(), Value::Money(123_4567));
    }

    #[test]
    fn numeric_round_trips_magnitude() {
        let mut buf = [0u8; 17];
        let mut magnitude = [0u8; 16];
        magnitude[15] = 0x7B; // 123
        encode_numeric(&mut buf, 0, false, &magnitude).unwrap();
        let decoded = decode_numeric(&buf, 0).unwrap();
        assert_eq!(decoded, Value::Numeric { sign: false, magnitude });
    }

    #[test]
    fn guid_round_trips_raw_bytes() {
        let mut buf = [0u8; 16];
        let guid = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
        encode_guid(&mut buf, 0, &guid).unwrap();
        assert_eq!(decode_guid(&buf, 0).unwrap(), Value::Guid(guid));
    }

    #[test]
    fn guid_formats_canonically() {
        let guid = [0xEF, 0xCD, 0xAB, 0x89, 0x67, 0x45, 0x23, 0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(format_guid(&guid), "{89ABCDEF-4567-0123-0102-030405060708}");
    }

    #[test]
    fn lval_descriptor_round_trips_inline() {
        let descriptor = LvalDescriptor {
            kind: LvalKind::Inline,
            total_length: 10,
            first_row_number: 0,
            first_page_number: 0,
        };
        let mut buf = [0u8; 12];
        descriptor.encode(&mut buf, 0).unwrap();
        let decoded = LvalDescriptor::decode(&buf, 0).unwrap();
        assert_eq!(decoded.kind, LvalKind::Inline);
        assert_eq!(decoded.total_length, 10);
    }

    #[test]
    fn lval_descriptor_round_trips_chain_head() {
        let descriptor = LvalDescriptor {
            kind: LvalKind::ChainHead,
            total_length: 5000,
            first_row_number: 3,
            first_page_number: 77,
        };
        let mut buf = [0u8; 12];
        descriptor.encode(&mut buf, 0).unwrap();
        let decoded = LvalDescriptor::decode(&buf, 0).unwrap();
        assert_eq!(decoded.first_row_number, 3);
        assert_eq!(decoded.first_page_number, 77);
    }

    #[test]
    fn reads_inline_long_value() {
        let descriptor = LvalDescriptor {
            kind: LvalKind::Inline,
            total_length: 3,
            first_row_number: 0,
            first_page_number: 0,
        };
        let data = read_long_value(&descriptor, b"abcXX", |_, _| unreachable!()).unwrap();
        assert_eq!(data, b"abc");
    }

    #[test]
    fn walks_single_overflow_row() {
        let descriptor = LvalDescriptor {
            kind: LvalKind::SingleOverflow,
            total_length: 3,
            first_row_number: 1,
            first_page_number: 50,
        };
        let data = read_long_value(&descriptor, &[], |page, row| {
            assert_eq!(page, 50);
            assert_eq!(row, 1);
            Ok(vec![0, 0, 0, b'x', b'y', b'z'])
        })
        .unwrap();
        assert_eq!(data, b"xyz");
    }

    #[test]
    fn materializes_inline_long_value_from_raw_row_bytes() {
        let descriptor = LvalDescriptor {
            kind: LvalKind::Inline,
            total_length: 3,
            first_row_number: 0,
            first_page_number: 0,
        };
        let mut raw = vec![0u8; 12];
        descriptor.encode(&mut raw, 0).unwrap();
        raw.extend_from_slice(b"abc");
        let data = materialize_long_value(&raw, |_, _| unreachable!()).unwrap();
        assert_eq!(data, b"abc");
    }

    #[test]
    fn walks_chain_across_two_rows() {
        let descriptor = LvalDescriptor {
            kind: LvalKind::ChainHead,
            total_length: 6,
            first_row_number: 0,
            first_page_number: 10,
        };
        let data = read_long_value(&descriptor, &[], |page, row| {
            if page == 10 && row == 0 {
                Ok(vec![1, 11, 0, 0, b'a', b'b', b'c'])
            } else if page == 11 && row == 1 {
                Ok(vec![0, 0, 0, 0, b'd', b'e', b'f'])
            } else {
                panic!("unexpected fetch ({page}, {row})")
            }
        })
        .unwrap();
        assert_eq!(data, b"abcdef");
    }
}
