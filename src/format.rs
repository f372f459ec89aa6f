//! Per-version Jet format constants.
//!
//! Every Jet/ACE release shares the same page-engine shape (page 0 is
//! the header, page 1 the global usage map, page 2 the system
//! catalog) but differs in page size, offsets, and default charset.
//! `JetFormat` is the single source of truth for those differences;
//! the rest of the engine reads from it instead of hard-coding a page
//! size or offset.

use crate::error::{Error, Result};

/// Major Jet/ACE release, identified by the 4-byte marker stored right
/// after the page-0 XOR mask seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JetVersion {
    Jet3,
    Jet4,
    Jet12,
    Jet14,
    Jet16,
    Jet17,
    /// MSISAM (Money/Streets & Trips); shares the Jet4 page layout.
    Msisam,
}

impl JetVersion {
    /// Detects the version from the 4-byte marker found at page-0
    /// offset 0x14 (after the 8-byte header-date mask seed at 0x04).
    pub fn from_marker(marker: &[u8]) -> Result<Self> {
        match marker {
            b"\x00\x01\x00\x00" => Ok(JetVersion::Jet3),
            b"\x00\x01\x00\x01" => Ok(JetVersion::Jet4),
            b"\x00\x02\x00\x01" => Ok(JetVersion::Jet12),
            b"\x00\x03\x00\x01" => Ok(JetVersion::Jet14),
            b"\x00\x05\x00\x01" => Ok(JetVersion::Jet16),
            b"\x00\x06\x00\x01" => Ok(JetVersion::Jet17),
            b"\x00\x01\x00\x02" => Ok(JetVersion::Msisam),
            other => Err(Error::format(format!(
                "unrecognized Jet version marker: {}",
                crate::byte_codec::hex_dump(other)
            ))),
        }
    }
}

/// Sort-order identifier stored in the page-0 header; only the
/// identity matters to the engine, collation tables live in
/// [`crate::index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortOrder {
    pub id: u16,
    pub version: u8,
}

/// All the per-release knobs the rest of the engine needs. One
/// `const` instance per [`JetVersion`], looked up via
/// [`JetFormat::for_version`].
#[derive(Debug, Clone, Copy)]
pub struct JetFormat {
    pub version: JetVersion,
    pub page_size: usize,
    /// Maximum encoded row size in bytes (not counting LVAL overflow).
    pub max_row_size: usize,
    /// Maximum number of pages a database of this format may contain;
    /// `page_size * max_pages` is `MAX_DATABASE_SIZE`.
    pub max_pages: u32,
    pub default_code_page: u16,
    pub default_sort_order: SortOrder,
    /// Byte offset within page 0 where the header-date (used as the
    /// password-mask seed) is stored.
    pub header_date_offset: usize,
    /// Byte offset within page 0 where the password block begins.
    pub password_offset: usize,
    pub password_length: usize,
    /// XOR mask applied to the header span of page 0 (offsets
    /// `xor_mask_start..xor_mask_start + xor_mask.len()`), repeating.
    pub xor_mask: &'static [u8],
    pub xor_mask_start: usize,
    pub xor_mask_end: usize,
}

impl JetFormat {
    pub fn for_version(version: JetVersion) -> &'static JetFormat {
        match version {
            JetVersion::Jet3 => &JET3,
            JetVersion::Jet4 => &JET4,
            JetVersion::Jet12 => &JET12,
            JetVersion::Jet14 => &JET14,
            JetVersion::Jet16 => &JET16,
            JetVersion::Jet17 => &JET17,
            JetVersion::Msisam => &MSISAM,
        }
    }

    pub fn max_database_size(&self) -> u64 {
        self.page_size as u64 * self.max_pages as u64
    }
}

const JET3_XOR_MASK: &[u8] = &[
    0xC7, 0xDA, 0x39, 0x6B, 0x2F, 0x9D, 0x68, 0xB5, 0x0C, 0x86, 0x15, 0x03, 0x7A, 0x3A, 0x19,
    0xD1,
];
const JET4_XOR_MASK: &[u8] = &[
    0x6D, 0xF9, 0xD9, 0x67, 0xA8, 0xCF, 0x2E, 0x56, 0xCD, 0x77, 0x8C, 0x49, 0x5E, 0x79, 0x09,
    0x1A,
];

const JET3: JetFormat = JetFormat {
    version: JetVersion::Jet3,
    page_size: 2048,
    max_row_size: 1900,
    max_pages: 0x0080_0000,
    default_code_page: 1252,
    default_sort_order: SortOrder { id: 0x409, version: 1 },
    header_date_offset: 0x04,
    password_offset: 0x2E,
    password_length: 20,
    xor_mask: JET3_XOR_MASK,
    xor_mask_start: 0x18,
    xor_mask_end: 0x18 + 0x7C,
};

const JET4: JetFormat = JetFormat {
    version: JetVersion::Jet4,
    page_size: 4096,
    max_row_size: 4060,
    max_pages: 0x0100_0000,
    default_code_page: 1252,
    default_sort_order: SortOrder { id: 0x409, version: 1 },
    header_date_offset: 0x04,
    password_offset: 0x42,
    password_length: 40,
    xor_mask: JET4_XOR_MASK,
    xor_mask_start: 0x18,
    xor_mask_end: 0x18 + 0x7C,
};

const JET12: JetFormat = JetFormat {
    version: JetVersion::Jet12,
    ..JET4
};
const JET14: JetFormat = JetFormat {
    version: JetVersion::Jet14,
    ..JET4
};
const JET16: JetFormat = JetFormat {
    version: JetVersion::Jet16,
    ..JET4
};
const JET17: JetFormat = JetFormat {
    version: JetVersion::Jet17,
    ..JET4
};
const MSISAM: JetFormat = JetFormat {
    version: JetVersion::Msisam,
    ..JET4
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_jet4_marker() {
        let v = JetVersion::from_marker(b"\x00\x01\x00\x01").unwrap();
        assert_eq!(v, JetVersion::Jet4);
    }

    #[test]
    fn rejects_unknown_marker() {
        assert!(JetVersion::from_marker(b"\xff\xff\xff\xff").is_err());
    }

    #[test]
    fn jet4_page_size_is_4096() {
        let fmt = JetFormat::for_version(JetVersion::Jet4);
        assert_eq!(fmt.page_size, 4096);
        assert_eq!(fmt.max_database_size(), 4096 * 0x0100_0000);
    }

    #[test]
    fn jet3_page_size_is_2048() {
        let fmt = JetFormat::for_version(JetVersion::Jet3);
        assert_eq!(fmt.page_size, 2048);
    }
}
