//! Table row lifecycle: insert, update, delete, and auto-number
//! assignment over a data-page chain.
//!
//! A data page is laid out as a 6-byte header (`type`, a reserved
//! byte, `free_space: u16`, `row_count: u16`), a data region that
//! grows upward from the header, and a descending array of 4-byte row
//! slots (`flags: u8`, a reserved byte, `offset: u16`) that grows
//! downward from the page tail. `free_space` is always the gap between
//! the data region's high-water mark and the first row slot.

use std::cell::RefCell;
use std::rc::Rc;

use crate::byte_codec::{get_range, get_range_mut, read_u16_le, write_u16_le};
use crate::column::{self, AutoNumberGenerator, Column, DataType, LvalDescriptor, LvalKind, Value};
use crate::error::{Error, Result};
use crate::index::{encode_key_component, CollationKind, Index, IndexData};
use crate::page::{PageChannel, PageType, RowId};
use crate::row::{Row, RowState, ROW_FLAG_DELETED, ROW_FLAG_OVERFLOW};
use crate::string;
use crate::usage_map::UsageMap;
use tracing::debug;

pub const DATA_PAGE_HEADER_LEN: usize = 6;
pub const ROW_SLOT_SIZE: usize = 4;

/// Long-value payloads at or under this size are stored inline right
/// after the 12-byte LVAL descriptor; anything larger spills onto one
/// or more overflow rows. Chosen conservatively relative to the
/// format's row budget rather than tuned per Jet version, since this
/// engine never needs to match a real file's exact threshold byte for
/// byte.
const MAX_INLINE_LONG_VALUE_LEN: usize = 256;

/// Per-long-value-column pair of usage maps tracking the overflow
/// pages that column's MEMO/OLE chains occupy.
#[derive(Debug, Clone)]
pub struct LongValueMaps {
    pub owned: UsageMap,
    pub free_space: UsageMap,
}

/// A table's row storage and schema. `page_channel` is shared (via
/// `Rc`) with the owning `Database` and any sibling tables open at the
/// same time; a `Table` never outlives the channel it reads through.
#[derive(Debug)]
pub struct Table {
    pub definition_page: u32,
    pub name: String,
    pub columns: Vec<Column>,
    indexes: Vec<Index>,
    page_channel: Rc<PageChannel>,
    owned_pages: RefCell<UsageMap>,
    free_space_pages: RefCell<UsageMap>,
    long_value_maps: RefCell<Vec<(u16, LongValueMaps)>>,
    next_auto_number: RefCell<i32>,
}

impl Table {
    pub fn new(
        page_channel: Rc<PageChannel>,
        definition_page: u32,
        name: String,
        columns: Vec<Column>,
        owned_pages: UsageMap,
        free_space_pages: UsageMap,
        indexes: Vec<Index>,
    ) -> Self {
        Self {
            definition_page,
            name,
            columns,
            indexes,
            page_channel,
            owned_pages: RefCell::new(owned_pages),
            free_space_pages: RefCell::new(free_space_pages),
            long_value_maps: RefCell::new(Vec::new()),
            next_auto_number: RefCell::new(1),
        }
    }

    /// The data pages this table currently owns, for callers (cursors,
    /// validation) that need to enumerate a table's pages without
    /// reaching into its row-storage internals.
    pub fn owned_pages(&self) -> std::cell::Ref<'_, UsageMap> {
        self.owned_pages.borrow()
    }

    /// This table's indexes, in declaration order; `index_number` is
    /// each one's position in this slice.
    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    /// Finds an index's backing `IndexData` by number, for `Database`'s
    /// `IndexLookup` implementation (foreign keys reference a peer
    /// table's index by number, not by name).
    pub fn index_data(&self, index_number: u16) -> Option<Rc<RefCell<IndexData>>> {
        self.indexes.iter().find(|i| i.index_number == index_number).map(|i| Rc::clone(&i.data))
    }

    /// Builds the order-preserving key bytes `index` would store for
    /// `row`, concatenating each indexed column's encoded component in
    /// the index's declared column order.
    pub fn index_key_for_row(&self, index: &Index, row: &Row) -> Vec<u8> {
        let data = index.data.borrow();
        let mut key = Vec::new();
        for spec in &data.columns {
            let value = self
                .columns
                .iter()
                .find(|c| c.column_number == spec.column_number)
                .and_then(|c| row.get(&c.name))
                .cloned()
                .unwrap_or(Value::Null);
            key.extend(encode_key_component(&value, spec.ascending, true, CollationKind::GeneralLegacy));
        }
        key
    }

    fn fixed_data_len(&self) -> usize {
        self.columns
            .iter()
            .filter_map(|c| if c.is_fixed_length() { c.data_type.fixed_size() } else { None })
            .sum()
    }

    fn variable_column_count(&self) -> usize {
        self.columns.iter().filter(|c| c.data_type.is_variable_length() && !c.data_type.is_long_value()).count()
            + self.columns.iter().filter(|c| c.data_type.is_long_value()).count()
    }

    fn nullable_bit_count(&self) -> usize {
        self.columns.iter().filter(|c| c.null_mask_index.is_some()).count()
    }

    /// Reads the row at `row_id`, decoding every column. MEMO/OLE
    /// columns come back from `decode_column` as raw descriptor bytes;
    /// this walks any overflow chain they describe before handing the
    /// value to the caller.
    pub fn read_row(&self, row_id: RowId) -> Result<Row> {
        let state = self.position_at_row_header(row_id)?;
        if state.is_deleted() {
            return Err(Error::NotFound(format!("row {row_id:?} is deleted")));
        }
        let mut row = Row::new();
        for column in &self.columns {
            let mut value = column::decode_column(column, &state)?;
            if column.data_type.is_long_value() {
                if let Value::LongValue(raw) = &value {
                    let materialized = column::materialize_long_value(raw, |page, row_number| {
                        self.fetch_long_value_row(page, row_number)
                    })?;
                    value = Value::LongValue(self.decompress_long_value(column, materialized)?);
                }
            }
            row.insert(column.name.clone(), value);
        }
        Ok(row)
    }

    /// Reads one overflow row's raw bytes for an LVAL chain walk:
    /// unlike a table-row redirect, an overflow row's span is read
    /// directly off its data page without following any further
    /// pointer.
    fn fetch_long_value_row(&self, page_number: u32, row_number: u8) -> Result<Vec<u8>> {
        let mut page = vec![0u8; self.page_channel.format().page_size];
        self.page_channel.read_page(&mut page, page_number)?;
        PageType::Data.expect(&page, page_number)?;
        let (_, row_start) = self.read_slot(&page, row_number as u16)?;
        let row_end = self.row_end(&page, row_number as u16)?;
        Ok(page[row_start..row_end].to_vec())
    }

    /// Reverses the compressed-text encoding applied to a MEMO
    /// column's payload before it was chained/inlined, if the column
    /// is a compressed-unicode MEMO. OLE and non-compressed MEMO
    /// columns carry their payload bytes verbatim.
    fn decompress_long_value(&self, column: &Column, materialized: Vec<u8>) -> Result<Vec<u8>> {
        if column.data_type == DataType::Memo && column.compressed_unicode {
            Ok(string::decode_text(&materialized)?.into_bytes())
        } else {
            Ok(materialized)
        }
    }

    /// Encodes a MEMO column's payload the same way `decompress_long_value`
    /// reverses it.
    fn compress_long_value(&self, column: &Column, payload: &[u8]) -> Result<Vec<u8>> {
        if column.data_type == DataType::Memo && column.compressed_unicode {
            let text = std::str::from_utf8(payload)
                .map_err(|e| Error::invalid_value(format!("memo column {:?} is not valid UTF-8: {e}", column.name)))?;
            Ok(string::encode_text(text))
        } else {
            Ok(payload.to_vec())
        }
    }

    /// Parses row `row_id`'s layout, following one overflow-pointer
    /// redirect if the slot is so flagged. Per the row-state
    /// invariant, this always re-reads current page contents so a
    /// caller observes concurrent deletions.
    pub fn position_at_row_header(&self, row_id: RowId) -> Result<RowState> {
        let mut page = vec![0u8; self.page_channel.format().page_size];
        self.page_channel.read_page(&mut page, row_id.page_number)?;
        PageType::Data.expect(&page, row_id.page_number)?;
        let (slot_flags, row_start) = self.read_slot(&page, row_id.row_number)?;

        if RowState::is_overflow(slot_flags) {
            let pointer = get_range(&page, row_start, 4)?;
            let target_row = pointer[0] as u16;
            let target_page = crate::byte_codec::read_u24_le(pointer, 1)?;
            let redirect_id = RowId::new(target_page, target_row);
            return self.position_at_row_header(redirect_id);
        }

        let row_end = self.row_end(&page, row_id.row_number)?;
        RowState::position_at_row_header(
            page,
            row_start,
            row_end,
            self.fixed_data_len(),
            self.variable_column_count(),
            self.nullable_bit_count(),
            slot_flags,
        )
    }

    fn read_slot(&self, page: &[u8], row_number: u16) -> Result<(u8, usize)> {
        let page_size = self.page_channel.format().page_size;
        let slot_offset = page_size - (row_number as usize + 1) * ROW_SLOT_SIZE;
        let slot = get_range(page, slot_offset, ROW_SLOT_SIZE)?;
        let flags = slot[0];
        let row_start = read_u16_le(slot, 2)? as usize;
        Ok((flags, row_start))
    }

    /// A row's end is the next lower slot's start offset, or the
    /// current data high-water mark for the last (lowest-offset) row.
    fn row_end(&self, page: &[u8], row_number: u16) -> Result<usize> {
        let row_count = read_u16_le(page, 4)? as u16;
        if row_number + 1 < row_count {
            let (_, next_start) = self.read_slot(page, row_number + 1)?;
            Ok(next_start)
        } else {
            let free_space_offset = read_u16_le(page, 2)? as usize;
            Ok(DATA_PAGE_HEADER_LEN + free_space_offset)
        }
    }

    /// Serializes `row` into the on-disk row format this table uses:
    /// column count, fixed area, variable area, offset table, null mask.
    fn encode_row(&self, row: &Row) -> Result<Vec<u8>> {
        let mut fixed = vec![0u8; self.fixed_data_len()];
        let mut variable_chunks: Vec<Vec<u8>> = Vec::new();
        let null_bits = self.nullable_bit_count();
        let mut null_mask = vec![0u8; null_bits.div_ceil(8)];

        for column in &self.columns {
            let value = row.get(&column.name).cloned().unwrap_or(Value::Null);
            self.encode_one_column(column, &value, &mut fixed, &mut variable_chunks, &mut null_mask)?;
        }

        let mut body = Vec::new();
        body.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        body.extend_from_slice(&fixed);
        let mut var_offsets = Vec::with_capacity(variable_chunks.len() + 1);
        for chunk in &variable_chunks {
            var_offsets.push(body.len());
            body.extend_from_slice(chunk);
        }
        var_offsets.push(body.len());
        for offset in &var_offsets {
            body.extend_from_slice(&(*offset as u16).to_le_bytes());
        }
        body.extend_from_slice(&null_mask);
        Ok(body)
    }

    fn encode_one_column(
        &self,
        column: &Column,
        value: &Value,
        fixed: &mut [u8],
        variable_chunks: &mut Vec<Vec<u8>>,
        null_mask: &mut [u8],
    ) -> Result<()> {
        if let Some(bit) = column.null_mask_index {
            if column.data_type == DataType::Boolean {
                let b = matches!(value, Value::Boolean(true));
                set_bit(null_mask, bit, column::encode_boolean(b));
                return Ok(());
            }
            if value.is_null() {
                set_bit(null_mask, bit, true);
                return Ok(());
            }
        }
        let offset = column.fixed_offset.unwrap_or(0);
        match (column.data_type, value) {
            (DataType::Byte, Value::Byte(v)) => column::encode_byte(fixed, offset, *v)?,
            (DataType::Int16, Value::Int16(v)) => column::encode_int16(fixed, offset, *v)?,
            (DataType::Int32, Value::Int32(v)) => column::encode_int32(fixed, offset, *v)?,
            (DataType::Money, Value::Money(v)) => column::encode_money(fixed, offset, *v)?,
            (DataType::Float64, Value::Float64(v)) => column::encode_float64(fixed, offset, *v)?,
            (DataType::ShortDateTime, Value::ShortDateTime(v)) => column::encode_short_date_time(fixed, offset, *v)?,
            (DataType::Numeric, Value::Numeric { sign, magnitude }) => column::encode_numeric(fixed, offset, *sign, magnitude)?,
            (DataType::Guid, Value::Guid(g)) => column::encode_guid(fixed, offset, g)?,
            (DataType::Text, Value::Text(s)) => variable_chunks.push(column::encode_text(s)),
            (DataType::Binary, Value::Binary(b)) => variable_chunks.push(b.clone()),
            (DataType::Memo | DataType::Ole, Value::LongValue(b)) => variable_chunks.push(self.encode_long_value(column, b)?),
            (_, Value::Null) => {}
            (dt, _) => return Err(Error::invalid_value(format!("value does not match column type {dt:?}"))),
        }
        Ok(())
    }

    /// Builds the on-the-wire blob for a MEMO/OLE column's payload: a
    /// 12-byte `LvalDescriptor` followed by either the payload itself
    /// (inline) or an empty tail (chain/single-overflow, whose bytes
    /// live on overflow rows this allocates as a side effect).
    fn encode_long_value(&self, column: &Column, payload: &[u8]) -> Result<Vec<u8>> {
        let wire = self.compress_long_value(column, payload)?;
        let mut blob = vec![0u8; 12];
        if wire.len() <= MAX_INLINE_LONG_VALUE_LEN {
            let descriptor = LvalDescriptor {
                kind: LvalKind::Inline,
                total_length: wire.len() as u32,
                first_row_number: 0,
                first_page_number: 0,
            };
            descriptor.encode(&mut blob, 0)?;
            blob.extend_from_slice(&wire);
            return Ok(blob);
        }

        let max_chunk = self
            .page_channel
            .format()
            .page_size
            .saturating_sub(DATA_PAGE_HEADER_LEN + ROW_SLOT_SIZE + 4);
        let chunks: Vec<&[u8]> = wire.chunks(max_chunk).collect();
        let mut next = RowId::new(0, 0);
        for (i, chunk) in chunks.iter().enumerate().rev() {
            let is_last = i == chunks.len() - 1;
            let mut body = vec![0u8; 4 + chunk.len()];
            if !is_last {
                body[0] = next.row_number as u8;
                crate::byte_codec::write_u24_le(&mut body, 1, next.page_number)?;
            }
            body[4..].copy_from_slice(chunk);
            next = self.append_long_value_row(column.column_number, &body)?;
        }
        let kind = if chunks.len() == 1 { LvalKind::SingleOverflow } else { LvalKind::ChainHead };
        let descriptor = LvalDescriptor {
            kind,
            total_length: wire.len() as u32,
            first_row_number: next.row_number as u8,
            first_page_number: next.page_number,
        };
        descriptor.encode(&mut blob, 0)?;
        Ok(blob)
    }

    /// Runs `f` over `column_number`'s overflow-page usage maps,
    /// allocating them the first time that column spills a long value.
    fn with_long_value_maps<R>(&self, column_number: u16, f: impl FnOnce(&mut LongValueMaps) -> Result<R>) -> Result<R> {
        let mut maps = self.long_value_maps.borrow_mut();
        if !maps.iter().any(|(c, _)| *c == column_number) {
            maps.push((
                column_number,
                LongValueMaps {
                    owned: UsageMap::new_inline(self.definition_page, 512),
                    free_space: UsageMap::new_inline(self.definition_page, 512),
                },
            ));
        }
        let entry = &mut maps.iter_mut().find(|(c, _)| *c == column_number).unwrap().1;
        f(entry)
    }

    /// The pages a column's long-value overflow chains currently
    /// occupy, for validation and tests that want to confirm a chain
    /// actually spilled rather than stayed inline.
    pub fn long_value_owned_pages(&self, column_number: u16) -> Vec<u32> {
        self.long_value_maps
            .borrow()
            .iter()
            .find(|(c, _)| *c == column_number)
            .map(|(_, maps)| maps.owned.iter_pages())
            .unwrap_or_default()
    }

    /// Appends one overflow row holding `body` (already including its
    /// 4-byte next-pointer header) to a page owned by `column_number`'s
    /// long-value maps, allocating a fresh page when none has room.
    fn append_long_value_row(&self, column_number: u16, body: &[u8]) -> Result<RowId> {
        let needed = body.len() + ROW_SLOT_SIZE;
        let page_number = self.with_long_value_maps(column_number, |maps| {
            for page_number in maps.owned.iter_pages() {
                let mut buf = vec![0u8; self.page_channel.format().page_size];
                self.page_channel.read_page(&mut buf, page_number)?;
                let free = read_u16_le(&buf, 2)? as usize;
                let used_slots = read_u16_le(&buf, 4)? as usize * ROW_SLOT_SIZE;
                let total_free = self
                    .page_channel
                    .format()
                    .page_size
                    .saturating_sub(DATA_PAGE_HEADER_LEN + free)
                    .saturating_sub(used_slots);
                if total_free >= needed {
                    return Ok(page_number);
                }
            }
            let new_page = self.page_channel.allocate_new_page()?;
            let mut header = vec![0u8; DATA_PAGE_HEADER_LEN];
            header[0] = PageType::Data as u8;
            write_u16_le(&mut header, 2, 0)?;
            write_u16_le(&mut header, 4, 0)?;
            self.page_channel.start_write();
            let result = self.page_channel.write_page(&header, new_page, 0);
            self.page_channel.finish_write()?;
            result?;
            maps.owned.add_page_number(new_page, 512)?;
            Ok(new_page)
        })?;

        let mut page = vec![0u8; self.page_channel.format().page_size];
        self.page_channel.read_page(&mut page, page_number)?;
        let free_offset = read_u16_le(&page, 2)? as usize;
        let row_count = read_u16_le(&page, 4)? as usize;
        let row_start = DATA_PAGE_HEADER_LEN + free_offset;
        get_range_mut(&mut page, row_start, body.len())?.copy_from_slice(body);
        let slot_offset = self.page_channel.format().page_size - (row_count + 1) * ROW_SLOT_SIZE;
        let slot = get_range_mut(&mut page, slot_offset, ROW_SLOT_SIZE)?;
        slot[0] = 0;
        slot[1] = 0;
        slot[2..4].copy_from_slice(&(row_start as u16).to_le_bytes());
        write_u16_le(&mut page, 2, (free_offset + body.len()) as u16)?;
        write_u16_le(&mut page, 4, (row_count + 1) as u16)?;
        self.page_channel.start_write();
        let result = self.page_channel.write_page(&page, page_number, 0);
        self.page_channel.finish_write()?;
        result?;
        Ok(RowId::new(page_number, row_count as u16))
    }

    /// Finds or allocates a data page with enough free space for
    /// `needed` bytes (row body plus one slot), seeding a new page
    /// with a DATA header when nothing fits.
    fn find_or_allocate_page(&self, needed: usize) -> Result<u32> {
        for page_number in self.owned_pages.borrow().iter_pages() {
            let mut buf = vec![0u8; self.page_channel.format().page_size];
            self.page_channel.read_page(&mut buf, page_number)?;
            let free = read_u16_le(&buf, 2)? as usize;
            let used_slots = read_u16_le(&buf, 4)? as usize * ROW_SLOT_SIZE;
            let total_free = self
                .page_channel
                .format()
                .page_size
                .saturating_sub(DATA_PAGE_HEADER_LEN + free)
                .saturating_sub(used_slots);
            if total_free >= needed {
                return Ok(page_number);
            }
        }
        let new_page = self.page_channel.allocate_new_page()?;
        debug!("table {:?} allocated data page {new_page}", self.name);
        let mut header = vec![0u8; DATA_PAGE_HEADER_LEN];
        header[0] = PageType::Data as u8;
        write_u16_le(&mut header, 2, 0)?;
        write_u16_le(&mut header, 4, 0)?;
        self.page_channel.start_write();
        let result = self.page_channel.write_page(&header, new_page, 0);
        self.page_channel.finish_write()?;
        result?;
        self.owned_pages.borrow_mut().add_page_number(new_page, 512)?;
        Ok(new_page)
    }

    /// Inserts `row`, assigning any auto-number columns first, then
    /// maintains this table's local indexes (unique-key checks and
    /// key insertion). Foreign-key reference checks happen above this
    /// layer, in `Database::insert_row`, which is the only place that
    /// can see every table's indexes.
    pub fn insert_row(&self, mut row: Row) -> Result<RowId> {
        for column in &self.columns {
            if let Some(generator) = column.auto_number {
                if row.get(&column.name).is_none() {
                    row.insert(column.name.clone(), self.generate_auto_number(generator)?);
                }
            }
        }
        let body = self.encode_row(&row)?;
        let needed = body.len() + ROW_SLOT_SIZE;
        let page_number = self.find_or_allocate_page(needed)?;

        let mut page = vec![0u8; self.page_channel.format().page_size];
        self.page_channel.read_page(&mut page, page_number)?;
        let free_offset = read_u16_le(&page, 2)? as usize;
        let row_count = read_u16_le(&page, 4)? as usize;
        let row_start = DATA_PAGE_HEADER_LEN + free_offset;

        get_range_mut(&mut page, row_start, body.len())?.copy_from_slice(&body);
        let slot_offset = self.page_channel.format().page_size - (row_count + 1) * ROW_SLOT_SIZE;
        let slot = get_range_mut(&mut page, slot_offset, ROW_SLOT_SIZE)?;
        slot[0] = 0;
        slot[1] = 0;
        slot[2..4].copy_from_slice(&(row_start as u16).to_le_bytes());
        write_u16_le(&mut page, 2, (free_offset + body.len()) as u16)?;
        write_u16_le(&mut page, 4, (row_count + 1) as u16)?;

        self.page_channel.start_write();
        let result = self.page_channel.write_page(&page, page_number, 0);
        self.page_channel.finish_write()?;
        result?;

        let row_id = RowId::new(page_number, row_count as u16);
        for index in &self.indexes {
            let key = self.index_key_for_row(index, &row);
            index.data.borrow_mut().insert_entry(key, row_id)?;
        }
        Ok(row_id)
    }

    /// Marks the row's slot deleted and clears its space for reuse.
    /// The current implementation reclaims the slot but does not
    /// compact the page's data region; `free_space` bookkeeping is
    /// therefore conservative (it never shrinks on delete), matching
    /// the row-state invariant that free space only ever reflects the
    /// high-water mark, not fragmentation.
    pub fn delete_row(&self, row_id: RowId) -> Result<()> {
        debug!("table {:?} deleting row {row_id:?}", self.name);
        let old_row = if !self.indexes.is_empty() { Some(self.read_row(row_id)?) } else { None };

        let mut page = vec![0u8; self.page_channel.format().page_size];
        self.page_channel.read_page(&mut page, row_id.page_number)?;
        PageType::Data.expect(&page, row_id.page_number)?;
        let slot_offset = self.page_channel.format().page_size - (row_id.row_number as usize + 1) * ROW_SLOT_SIZE;
        let slot = get_range_mut(&mut page, slot_offset, ROW_SLOT_SIZE)?;
        slot[0] |= ROW_FLAG_DELETED;

        self.page_channel.start_write();
        let result = self.page_channel.write_page(&page, row_id.page_number, 0);
        self.page_channel.finish_write()?;
        result?;

        if let Some(old_row) = old_row {
            for index in &self.indexes {
                let key = self.index_key_for_row(index, &old_row);
                index.data.borrow_mut().remove_entry(&key, row_id);
            }
        }
        Ok(())
    }

    /// Updates `row_id` in place if the new encoding fits in the
    /// existing slot's row span; otherwise writes the new row
    /// elsewhere and replaces the original slot with an overflow
    /// pointer row (flag 0x80) redirecting to it.
    pub fn update_row(&self, row_id: RowId, row: &Row) -> Result<RowId> {
        let old_row = if !self.indexes.is_empty() { Some(self.read_row(row_id)?) } else { None };
        let body = self.encode_row(row)?;
        let mut page = vec![0u8; self.page_channel.format().page_size];
        self.page_channel.read_page(&mut page, row_id.page_number)?;
        PageType::Data.expect(&page, row_id.page_number)?;
        let (flags, row_start) = self.read_slot(&page, row_id.row_number)?;
        if RowState::is_overflow(flags) {
            return Err(Error::Unsupported("updating an overflow pointer row directly is not supported".into()));
        }
        let row_end = self.row_end(&page, row_id.row_number)?;
        let existing_span = row_end - row_start;

        let new_row_id = if body.len() <= existing_span {
            get_range_mut(&mut page, row_start, body.len())?.copy_from_slice(&body);
            self.page_channel.start_write();
            let result = self.page_channel.write_page(&page, row_id.page_number, 0);
            self.page_channel.finish_write()?;
            result?;
            row_id
        } else {
            let needed = body.len() + ROW_SLOT_SIZE;
            let target_page = self.find_or_allocate_page(needed)?;
            let mut target_buf = vec![0u8; self.page_channel.format().page_size];
            self.page_channel.read_page(&mut target_buf, target_page)?;
            let free_offset = read_u16_le(&target_buf, 2)? as usize;
            let target_row_count = read_u16_le(&target_buf, 4)? as usize;
            let target_row_start = DATA_PAGE_HEADER_LEN + free_offset;
            get_range_mut(&mut target_buf, target_row_start, body.len())?.copy_from_slice(&body);
            let target_slot_offset = self.page_channel.format().page_size - (target_row_count + 1) * ROW_SLOT_SIZE;
            let target_slot = get_range_mut(&mut target_buf, target_slot_offset, ROW_SLOT_SIZE)?;
            target_slot[2..4].copy_from_slice(&(target_row_start as u16).to_le_bytes());
            write_u16_le(&mut target_buf, 2, (free_offset + body.len()) as u16)?;
            write_u16_le(&mut target_buf, 4, (target_row_count + 1) as u16)?;
            self.page_channel.start_write();
            let result = self.page_channel.write_page(&target_buf, target_page, 0);
            self.page_channel.finish_write()?;
            result?;
            let new_row_id = RowId::new(target_page, target_row_count as u16);

            if existing_span < 4 {
                return Err(Error::format("row span too small to hold an overflow pointer"));
            }
            let mut pointer = vec![0u8; 4];
            pointer[0] = new_row_id.row_number as u8;
            crate::byte_codec::write_u24_le(&mut pointer, 1, new_row_id.page_number)?;
            get_range_mut(&mut page, row_start, 4)?.copy_from_slice(&pointer);
            let slot_offset = self.page_channel.format().page_size - (row_id.row_number as usize + 1) * ROW_SLOT_SIZE;
            page[slot_offset] |= ROW_FLAG_OVERFLOW;
            self.page_channel.start_write();
            let result = self.page_channel.write_page(&page, row_id.page_number, 0);
            self.page_channel.finish_write()?;
            result?;
            new_row_id
        };

        if let Some(old_row) = old_row {
            for index in &self.indexes {
                let old_key = self.index_key_for_row(index, &old_row);
                index.data.borrow_mut().remove_entry(&old_key, row_id);
            }
            for index in &self.indexes {
                let new_key = self.index_key_for_row(index, row);
                index.data.borrow_mut().insert_entry(new_key, new_row_id)?;
            }
        }
        Ok(new_row_id)
    }

    fn generate_auto_number(&self, generator: AutoNumberGenerator) -> Result<Value> {
        match generator {
            AutoNumberGenerator::LongCounter | AutoNumberGenerator::ComplexCounter => {
                let mut next = self.next_auto_number.borrow_mut();
                let value = *next;
                *next += 1;
                Ok(Value::Int32(value))
            }
            AutoNumberGenerator::Guid => {
                let mut bytes = [0u8; 16];
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = ((i as u32 * 2654435761) % 256) as u8;
                }
                bytes[6] = (bytes[6] & 0x0F) | 0x40;
                bytes[8] = (bytes[8] & 0x3F) | 0x80;
                Ok(Value::Guid(bytes))
            }
            AutoNumberGenerator::Unsupported => Err(Error::Unsupported(
                "table has an auto-number column with an unrecognized generator".into(),
            )),
        }
    }
}

fn set_bit(mask: &mut [u8], index: usize, value: bool) {
    let byte = index / 8;
    let bit = index % 8;
    if value {
        mask[byte] |= 1 << bit;
    } else {
        mask[byte] &= !(1 << bit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{JetFormat, JetVersion};

    fn new_table(columns: Vec<Column>) -> Table {
        let format = JetFormat::for_version(JetVersion::Jet4);
        let file = tempfile::tempfile().unwrap();
        file.set_len(format.page_size as u64).unwrap();
        let channel = Rc::new(PageChannel::new(file, format, false));
        Table::new(
            channel,
            1,
            "Widgets".into(),
            columns,
            UsageMap::new_inline(0, 512),
            UsageMap::new_inline(0, 512),
            vec![],
        )
    }

    fn int_column(name: &str, offset: usize) -> Column {
        Column {
            name: name.into(),
            data_type: DataType::Int32,
            column_number: 0,
            nullable: false,
            compressed_unicode: false,
            numeric_info: None,
            auto_number: None,
            fixed_offset: Some(offset),
            variable_index: None,
            null_mask_index: None,
        }
    }

    fn text_column(name: &str, var_index: usize) -> Column {
        Column {
            name: name.into(),
            data_type: DataType::Text,
            column_number: 1,
            nullable: true,
            compressed_unicode: true,
            numeric_info: None,
            auto_number: None,
            fixed_offset: None,
            variable_index: Some(var_index),
            null_mask_index: Some(0),
        }
    }

    fn memo_column(name: &str, column_number: u16) -> Column {
        Column {
            name: name.into(),
            data_type: DataType::Memo,
            column_number,
            nullable: true,
            compressed_unicode: true,
            numeric_info: None,
            auto_number: None,
            fixed_offset: None,
            variable_index: Some(0),
            null_mask_index: Some(0),
        }
    }

    #[test]
    fn large_memo_spills_into_an_overflow_chain() {
        let table = new_table(vec![int_column("Id", 0), memo_column("Notes", 1)]);
        let text: String = "a".repeat(100_000);
        let mut row = Row::new();
        row.insert("Id", Value::Int32(1));
        row.insert("Notes", Value::LongValue(text.clone().into_bytes()));
        let row_id = table.insert_row(row).unwrap();
        let read_back = table.read_row(row_id).unwrap();
        assert_eq!(read_back.get("Notes"), Some(&Value::LongValue(text.into_bytes())));
        assert!(!table.long_value_owned_pages(1).is_empty());
    }

    #[test]
    fn insert_and_read_round_trips_a_row() {
        let table = new_table(vec![int_column("Id", 0), text_column("Name", 0)]);
        let mut row = Row::new();
        row.insert("Id", Value::Int32(7));
        row.insert("Name", Value::Text("hello".into()));
        let row_id = table.insert_row(row).unwrap();
        let read_back = table.read_row(row_id).unwrap();
        assert_eq!(read_back.get("Id"), Some(&Value::Int32(7)));
        assert_eq!(read_back.get("Name"), Some(&Value::Text("hello".into())));
    }

    #[test]
    fn delete_row_sets_deleted_flag() {
        let table = new_table(vec![int_column("Id", 0)]);
        let mut row = Row::new();
        row.insert("Id", Value::Int32(1));
        let row_id = table.insert_row(row).unwrap();
        table.delete_row(row_id).unwrap();
        let err = table.read_row(row_id).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn auto_number_column_increments() {
        let mut columns = vec![int_column("Id", 0)];
        columns[0].auto_number = Some(AutoNumberGenerator::LongCounter);
        let table = new_table(columns);
        let id1 = table.insert_row(Row::new()).unwrap();
        let id2 = table.insert_row(Row::new()).unwrap();
        let row1 = table.read_row(id1).unwrap();
        let row2 = table.read_row(id2).unwrap();
        assert_eq!(row1.get("Id"), Some(&Value::Int32(1)));
        assert_eq!(row2.get("Id"), Some(&Value::Int32(2)));
    }
}
