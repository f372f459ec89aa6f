//! Paged I/O over a random-access database file.
//!
//! Pages are fixed-size (2048 or 4096 bytes, per [`JetFormat`]),
//! addressed by a non-negative page number. Page 0 is the header
//! (read/written through a special path that applies the header XOR
//! mask); page 1 is the global usage map; page 2 is the system
//! catalog table definition. Every other page declares its own type
//! as its first byte.
//!
//! [`PageChannel`] is a single-writer, many-reader façade: callers
//! bracket mutation with [`PageChannel::start_write`] /
//! [`PageChannel::finish_write`], which nest by reference count, and
//! `finish_write` on the outermost scope fsyncs iff `auto_sync` is set.

use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::byte_codec::hex_dump;
use crate::error::{Error, Result};
use crate::format::JetFormat;

/// First byte of every non-header page; mis-typed pages are fatal on
/// access rather than silently reinterpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Invalid = 0,
    Data = 1,
    TableDef = 2,
    /// Recognized by `from_byte` but never produced by this engine's
    /// own allocator: `IndexData` keeps its entries in memory rather
    /// than paging a physical B-tree out to INTERMEDIATE_INDEX/
    /// LEAF_INDEX pages (see DESIGN.md's index.rs entry).
    IntermediateIndex = 3,
    /// See `IntermediateIndex`.
    LeafIndex = 4,
    UsageMap = 5,
}

impl PageType {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(PageType::Invalid),
            1 => Ok(PageType::Data),
            2 => Ok(PageType::TableDef),
            3 => Ok(PageType::IntermediateIndex),
            4 => Ok(PageType::LeafIndex),
            5 => Ok(PageType::UsageMap),
            other => Err(Error::format(format!("unrecognized page type byte 0x{other:02x}"))),
        }
    }

    /// Checks the first byte of `page` against `self`, producing a
    /// [`Error::FormatViolation`] naming both the expected and actual
    /// type on mismatch.
    pub fn expect(self, page: &[u8], page_number: u32) -> Result<()> {
        let actual = PageType::from_byte(page[0])?;
        if actual != self {
            return Err(Error::format(format!(
                "page {page_number} is type {actual:?}, expected {self:?}"
            )));
        }
        Ok(())
    }
}

/// Row number, an unsigned byte index into the row-offset table at the
/// tail of a data page.
pub type RowNumber = u16;

/// Identifies a row by (page, row-within-page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId {
    pub page_number: u32,
    pub row_number: RowNumber,
}

impl RowId {
    pub fn new(page_number: u32, row_number: RowNumber) -> Self {
        Self { page_number, row_number }
    }
}

/// Sentinel used as a cursor's "before the start of the table" bound.
pub const FIRST_ROW_ID: RowId = RowId { page_number: 0, row_number: 0 };
/// Sentinel used as a cursor's "after the end of the table" bound.
pub const LAST_ROW_ID: RowId = RowId {
    page_number: u32::MAX,
    row_number: RowNumber::MAX,
};

/// Hook for whole-page encryption/decoding. Most databases are
/// unencrypted and use [`IdentityPageCodec`]; a password-protected
/// database installs a codec that XORs or RC4-decodes each page after
/// it's read and before it's written.
pub trait PageCodec: std::fmt::Debug {
    fn decode_page(&self, buf: &mut [u8], page_number: u32) -> Result<()>;
    fn encode_page(&self, buf: &mut [u8], page_number: u32) -> Result<()>;

    /// Whether [`PageChannel::write_page`] may write a sub-range of a
    /// page directly. Codecs that depend on the whole-page plaintext
    /// (stream ciphers keyed by page number) must return `false`, which
    /// makes the channel read-modify-write the full page instead.
    fn supports_partial_write(&self) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityPageCodec;

impl PageCodec for IdentityPageCodec {
    fn decode_page(&self, _buf: &mut [u8], _page_number: u32) -> Result<()> {
        Ok(())
    }
    fn encode_page(&self, _buf: &mut [u8], _page_number: u32) -> Result<()> {
        Ok(())
    }
}

/// Single-writer, many-reader façade over a random-access database
/// file. Not `Sync`; per the concurrency model, one `PageChannel`
/// (and the `Database` that owns it) belongs to one thread at a time.
#[derive(Debug)]
pub struct PageChannel {
    file: RefCell<File>,
    format: &'static JetFormat,
    codec: Box<dyn PageCodec>,
    write_depth: RefCell<u32>,
    auto_sync: bool,
    /// One scratch buffer, lent out via [`PageChannel::take_shared_buffer`]
    /// so nested operations that both need a page-sized buffer don't
    /// stomp on each other; `None` while on loan.
    shared_buffer: RefCell<Option<Vec<u8>>>,
}

impl PageChannel {
    pub fn new(file: File, format: &'static JetFormat, auto_sync: bool) -> Self {
        Self::with_codec(file, format, auto_sync, Box::new(IdentityPageCodec))
    }

    pub fn with_codec(
        file: File,
        format: &'static JetFormat,
        auto_sync: bool,
        codec: Box<dyn PageCodec>,
    ) -> Self {
        Self {
            file: RefCell::new(file),
            format,
            codec,
            write_depth: RefCell::new(0),
            auto_sync,
            shared_buffer: RefCell::new(Some(vec![0u8; format.page_size])),
        }
    }

    pub fn format(&self) -> &'static JetFormat {
        self.format
    }

    fn take_shared_buffer(&self) -> Vec<u8> {
        self.shared_buffer
            .borrow_mut()
            .take()
            .unwrap_or_else(|| vec![0u8; self.format.page_size])
    }

    fn release_shared_buffer(&self, mut buf: Vec<u8>) {
        buf.iter_mut().for_each(|b| *b = 0);
        *self.shared_buffer.borrow_mut() = Some(buf);
    }

    /// Reads page `n` in full, applying the codec's `decode_page` hook
    /// (page 0 instead applies the XOR header mask and bypasses the
    /// codec; see [`PageChannel::read_header_page`]).
    pub fn read_page(&self, buf: &mut [u8], n: u32) -> Result<()> {
        if n == 0 {
            return self.read_header_page(buf);
        }
        if buf.len() != self.format.page_size {
            return Err(Error::format(format!(
                "read_page buffer is {} bytes, page size is {}",
                buf.len(),
                self.format.page_size
            )));
        }
        let offset = (n as u64) * (self.format.page_size as u64);
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        drop(file);
        self.codec.decode_page(buf, n)?;
        Ok(())
    }

    /// Page 0 is read unencoded but with the XOR header mask applied
    /// over the format's masked span.
    fn read_header_page(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.format.page_size {
            return Err(Error::format("header page buffer size mismatch"));
        }
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(buf)?;
        drop(file);
        apply_xor_mask(buf, self.format);
        Ok(())
    }

    /// Writes `data` into page `n` starting at `offset` within the
    /// page. Must be called within a `start_write`/`finish_write`
    /// scope. If `offset`/`data.len()` don't cover the whole page and
    /// the codec cannot encode a partial page, the current on-disk
    /// page is fetched into the shared scratch buffer and the write is
    /// overlaid onto it before encoding.
    pub fn write_page(&self, data: &[u8], n: u32, offset: usize) -> Result<()> {
        if *self.write_depth.borrow() == 0 {
            return Err(Error::format("write_page called outside a write scope"));
        }
        if n == 0 {
            return self.write_header_page(data, offset);
        }
        let whole_page = offset == 0 && data.len() == self.format.page_size;
        if whole_page {
            let mut page_buf = data.to_vec();
            self.codec.encode_page(&mut page_buf, n)?;
            return self.write_raw(&page_buf, n, 0);
        }
        if self.codec.supports_partial_write() {
            let mut fragment = data.to_vec();
            self.codec.encode_page(&mut fragment, n)?;
            return self.write_raw(&fragment, n, offset);
        }
        // The codec needs the full plaintext to encode even a single
        // modified range (e.g. a stream cipher keyed by page number),
        // so fetch the current on-disk contents and overlay the write
        // before encoding the whole page.
        let mut full = self.take_shared_buffer();
        self.read_page(&mut full, n)?;
        full[offset..offset + data.len()].copy_from_slice(data);
        self.codec.encode_page(&mut full, n)?;
        let result = self.write_raw(&full, n, 0);
        self.release_shared_buffer(full);
        result
    }

    fn write_raw(&self, encoded: &[u8], n: u32, offset: usize) -> Result<()> {
        let file_offset = (n as u64) * (self.format.page_size as u64) + offset as u64;
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(file_offset))?;
        file.write_all(encoded)?;
        Ok(())
    }

    fn write_header_page(&self, data: &[u8], offset: usize) -> Result<()> {
        let mut full = self.take_shared_buffer();
        self.read_header_page(&mut full)?;
        full[offset..offset + data.len()].copy_from_slice(data);
        apply_xor_mask(&mut full, self.format);
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&full)?;
        drop(file);
        self.release_shared_buffer(full);
        Ok(())
    }

    /// Extends the file by one page (all zeros save a single
    /// tail-offset byte write) and returns the new page number.
    /// Callers are expected to clear the page's bit in the global
    /// usage map themselves via [`crate::usage_map::UsageMap`]; this
    /// only performs the file extension.
    pub fn allocate_new_page(&self) -> Result<u32> {
        let len = self.file.borrow().metadata()?.len();
        let page_size = self.format.page_size as u64;
        if len % page_size != 0 {
            return Err(Error::format("database file length is not page-aligned"));
        }
        let new_len = len + page_size;
        if new_len > self.format.max_database_size() {
            return Err(Error::format(format!(
                "allocating page would exceed MAX_DATABASE_SIZE ({} bytes)",
                self.format.max_database_size()
            )));
        }
        let mut file = self.file.borrow_mut();
        file.set_len(new_len)?;
        file.seek(SeekFrom::Start(new_len - 1))?;
        file.write_all(&[0u8])?;
        drop(file);
        Ok((len / page_size) as u32)
    }

    /// Overwrites the first 4 bytes of page `n` with the INVALID
    /// header; the global usage map bit for `n` must be set by the
    /// caller.
    pub fn deallocate_page(&self, n: u32) -> Result<()> {
        let invalid = [PageType::Invalid as u8, 0, 0, 0];
        self.write_page(&invalid, n, 0)
    }

    /// Enters a write scope; scopes nest by reference count.
    pub fn start_write(&self) {
        *self.write_depth.borrow_mut() += 1;
    }

    /// Leaves a write scope. fsyncs when the outermost scope ends, iff
    /// `auto_sync` was configured. Per the failure-atomicity design,
    /// an error raised mid-scope does not roll back already-written
    /// pages; this still attempts to close the scope (without a
    /// flush) so later operations aren't permanently blocked.
    pub fn finish_write(&self) -> Result<()> {
        let mut depth = self.write_depth.borrow_mut();
        if *depth == 0 {
            return Err(Error::format("finish_write with no matching start_write"));
        }
        *depth -= 1;
        let outermost = *depth == 0;
        drop(depth);
        if outermost && self.auto_sync {
            self.file.borrow().sync_all()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.file.borrow_mut().flush()?;
        Ok(())
    }

    pub fn page_count(&self) -> Result<u32> {
        let len = self.file.borrow().metadata()?.len();
        Ok((len / self.format.page_size as u64) as u32)
    }
}

fn apply_xor_mask(page: &mut [u8], format: &JetFormat) {
    let seed = &page[format.header_date_offset..format.header_date_offset + 8];
    let seed: [u8; 8] = seed.try_into().expect("8-byte slice");
    let mask = derive_mask(&seed, format);
    let span = &mut page[format.xor_mask_start..format.xor_mask_end];
    for (i, b) in span.iter_mut().enumerate() {
        *b ^= mask[i % mask.len()];
    }
}

/// The password-mask seed (the header date) is itself XORed with the
/// format's static mask before being used as the repeating key for the
/// header span -- applying `apply_xor_mask` twice restores the
/// original bytes, which is what both the read and write paths rely on.
fn derive_mask(seed: &[u8; 8], format: &JetFormat) -> Vec<u8> {
    let mut mask = format.xor_mask.to_vec();
    for (i, b) in mask.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }
    if mask.is_empty() {
        mask.push(0);
    }
    mask
}

pub fn describe_page_head(page: &[u8]) -> String {
    hex_dump(&page[..page.len().min(16)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::JetVersion;

    fn new_channel(pages: u32) -> (PageChannel, &'static JetFormat) {
        let format = JetFormat::for_version(JetVersion::Jet4);
        let file = tempfile::tempfile().unwrap();
        file.set_len(pages as u64 * format.page_size as u64).unwrap();
        (PageChannel::new(file, format, false), format)
    }

    #[test]
    fn allocate_new_page_extends_file_by_one_page() {
        let (chan, format) = new_channel(1);
        let n = chan.allocate_new_page().unwrap();
        assert_eq!(n, 1);
        assert_eq!(chan.page_count().unwrap(), 2);
        let _ = format;
    }

    #[test]
    fn write_page_requires_write_scope() {
        let (chan, format) = new_channel(2);
        let buf = vec![0u8; format.page_size];
        let err = chan.write_page(&buf, 1, 0).unwrap_err();
        assert!(matches!(err, Error::FormatViolation(_)));
    }

    #[test]
    fn write_then_read_round_trips_a_data_page() {
        let (chan, format) = new_channel(2);
        let mut page = vec![0u8; format.page_size];
        page[0] = PageType::Data as u8;
        page[10] = 0xAB;
        chan.start_write();
        chan.write_page(&page, 1, 0).unwrap();
        chan.finish_write().unwrap();

        let mut read_back = vec![0u8; format.page_size];
        chan.read_page(&mut read_back, 1).unwrap();
        assert_eq!(read_back, page);
    }

    #[test]
    fn deallocate_page_marks_invalid_type() {
        let (chan, format) = new_channel(2);
        let mut page = vec![0u8; format.page_size];
        page[0] = PageType::Data as u8;
        chan.start_write();
        chan.write_page(&page, 1, 0).unwrap();
        chan.deallocate_page(1).unwrap();
        chan.finish_write().unwrap();

        let mut read_back = vec![0u8; format.page_size];
        chan.read_page(&mut read_back, 1).unwrap();
        assert_eq!(read_back[0], PageType::Invalid as u8);
    }

    #[test]
    fn header_page_xor_mask_round_trips() {
        let (chan, format) = new_channel(1);
        let mut header = vec![0u8; format.page_size];
        header[format.header_date_offset..format.header_date_offset + 8]
            .copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        header[format.xor_mask_start] = 0x42;
        chan.start_write();
        chan.write_page(&header[..8], 0, 0).unwrap(); // touch unmasked prefix only
        chan.finish_write().unwrap();

        let mut read_back = vec![0u8; format.page_size];
        chan.read_page(&mut read_back, 0).unwrap();
        assert_eq!(
            &read_back[format.header_date_offset..format.header_date_offset + 8],
            &0x1122_3344_5566_7788u64.to_le_bytes()
        );
    }

    #[test]
    fn row_id_sentinels_are_ordered() {
        assert!(FIRST_ROW_ID < RowId::new(1, 0));
        assert!(RowId::new(1, 0) < LAST_ROW_ID);
    }
}
