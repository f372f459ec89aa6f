//! Cursor state machine shared by table-scan and index-backed
//! traversal.
//!
//! Both concrete cursors are a thin driver over the same three-state
//! machine (`BeforeFirst` / `AtRow` / `AfterLast`); what differs is how
//! each resolves "the next row" -- a table scan walks the owned-pages
//! usage map and then row slots, an index cursor walks `IndexData` in
//! key order.

use std::cell::Cell;
use std::rc::Rc;

use crate::column::Value;
use crate::error::{Error, Result};
use crate::index::IndexData;
use crate::page::RowId;
use crate::row::Row;
use crate::table::Table;
use std::cell::RefCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    BeforeFirst,
    AtRow(RowId),
    AfterLast,
}

/// Matches a candidate row against a search pattern. The default
/// mirrors the common "null-sensible equality" behavior: `Value::Null`
/// only matches `Value::Null`, everything else is plain equality.
pub trait ColumnMatcher {
    fn matches(&self, candidate: &Value, pattern: &Value) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultColumnMatcher;

impl ColumnMatcher for DefaultColumnMatcher {
    fn matches(&self, candidate: &Value, pattern: &Value) -> bool {
        candidate == pattern
    }
}

/// A single-column or whole-row search pattern.
pub enum SearchPattern<'a> {
    Column { name: &'a str, value: Value },
    Row(&'a Row),
}

/// Opaque identity for a cursor, used by [`Savepoint::restore`] to
/// reject restoring into a cursor other than the one that captured it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(u64);

/// Captures a cursor's current and previous position so a caller can
/// undo a speculative move.
#[derive(Debug, Clone, Copy)]
pub struct Savepoint {
    cursor_id: CursorId,
    current: CursorPosition,
    previous: CursorPosition,
}

struct CursorState {
    id: CursorId,
    current: Cell<CursorPosition>,
    previous: Cell<CursorPosition>,
}

impl CursorState {
    fn new(id: CursorId) -> Self {
        Self {
            id,
            current: Cell::new(CursorPosition::BeforeFirst),
            previous: Cell::new(CursorPosition::BeforeFirst),
        }
    }

    fn save(&self) -> Savepoint {
        Savepoint {
            cursor_id: self.id,
            current: self.current.get(),
            previous: self.previous.get(),
        }
    }

    fn restore(&self, savepoint: &Savepoint) -> Result<()> {
        if savepoint.cursor_id != self.id {
            return Err(Error::InvalidValue("savepoint belongs to a different cursor".into()));
        }
        self.current.set(savepoint.current);
        self.previous.set(savepoint.previous);
        Ok(())
    }

    fn set(&self, position: CursorPosition) {
        self.previous.set(self.current.get());
        self.current.set(position);
    }
}

static NEXT_CURSOR_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn fresh_cursor_id() -> CursorId {
    CursorId(NEXT_CURSOR_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
}

/// Iterates a table's owned data pages in row-slot order.
pub struct TableScanCursor {
    table: Rc<Table>,
    state: CursorState,
    matcher: Box<dyn ColumnMatcher>,
}

impl TableScanCursor {
    pub fn new(table: Rc<Table>) -> Self {
        Self {
            table,
            state: CursorState::new(fresh_cursor_id()),
            matcher: Box::new(DefaultColumnMatcher),
        }
    }

    pub fn position(&self) -> CursorPosition {
        self.state.current.get()
    }

    pub fn save(&self) -> Savepoint {
        self.state.save()
    }

    pub fn restore_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        self.state.restore(savepoint)
    }

    /// Candidate row ids in scan order. The owned-pages usage map
    /// gives page numbers; row numbers within a page are discovered by
    /// probing sequentially until `position_at_row_header` reports the
    /// page has no more slots -- modeled here as a fixed probe cap per
    /// page, since this engine doesn't track a page's row count
    /// independent of its header.
    fn candidate_row_ids(&self) -> Vec<RowId> {
        let mut ids = Vec::new();
        for page_number in self.table_owned_pages() {
            let mut row_number = 0u16;
            loop {
                match self.table.position_at_row_header(RowId::new(page_number, row_number)) {
                    Ok(_) => {
                        ids.push(RowId::new(page_number, row_number));
                        row_number += 1;
                    }
                    Err(_) => break,
                }
                if row_number > 4096 {
                    break;
                }
            }
        }
        ids
    }

    fn table_owned_pages(&self) -> Vec<u32> {
        self.table.owned_pages().iter_pages()
    }

    pub fn move_to_next_row(&self) -> Result<bool> {
        self.step(true)
    }

    pub fn move_to_previous_row(&self) -> Result<bool> {
        self.step(false)
    }

    fn step(&self, forward: bool) -> Result<bool> {
        let ids = self.candidate_row_ids();
        let mut ordered = ids;
        if !forward {
            ordered.reverse();
        }
        let next = match self.state.current.get() {
            CursorPosition::BeforeFirst if forward => ordered.first().copied(),
            CursorPosition::AfterLast if !forward => ordered.first().copied(),
            CursorPosition::AtRow(current) => {
                let pos = ordered.iter().position(|id| *id == current);
                match pos {
                    Some(i) => ordered.get(i + 1).copied(),
                    None => return self.retry_after_invalidation(forward),
                }
            }
            _ => None,
        };
        match next {
            Some(id) => {
                if self.row_is_deleted(id)? {
                    self.state.set(CursorPosition::AtRow(id));
                    return self.step(forward);
                }
                self.state.set(CursorPosition::AtRow(id));
                Ok(true)
            }
            None => {
                self.state.set(if forward { CursorPosition::AfterLast } else { CursorPosition::BeforeFirst });
                Ok(false)
            }
        }
    }

    /// Idempotent retry-once: if the current row vanished out from
    /// under the cursor (concurrent delete/compaction), restore the
    /// previous position and attempt the step again exactly once.
    fn retry_after_invalidation(&self, forward: bool) -> Result<bool> {
        let previous = self.state.previous.get();
        self.state.current.set(previous);
        self.step(forward)
    }

    fn row_is_deleted(&self, id: RowId) -> Result<bool> {
        Ok(self.table.position_at_row_header(id)?.is_deleted())
    }

    pub fn find_row(&self, row_id: RowId) -> Result<bool> {
        if self.row_is_deleted(row_id)? {
            return Ok(false);
        }
        self.state.set(CursorPosition::AtRow(row_id));
        Ok(true)
    }

    pub fn find_first_row(&self, pattern: &SearchPattern) -> Result<bool> {
        self.state.set(CursorPosition::BeforeFirst);
        while self.move_to_next_row()? {
            if let CursorPosition::AtRow(id) = self.state.current.get() {
                let row = self.table.read_row(id)?;
                if self.row_matches(&row, pattern) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn row_matches(&self, row: &Row, pattern: &SearchPattern) -> bool {
        match pattern {
            SearchPattern::Column { name, value } => {
                row.get(name).map(|v| self.matcher.matches(v, value)).unwrap_or(false)
            }
            SearchPattern::Row(pattern_row) => pattern_row
                .iter()
                .all(|(name, value)| row.get(name).map(|v| self.matcher.matches(v, value)).unwrap_or(false)),
        }
    }

    pub fn current_row(&self) -> Result<Option<Row>> {
        match self.state.current.get() {
            CursorPosition::AtRow(id) => Ok(Some(self.table.read_row(id)?)),
            _ => Ok(None),
        }
    }
}

/// Walks `IndexData` in key order.
pub struct IndexCursor {
    index_data: Rc<RefCell<IndexData>>,
    state: CursorState,
}

impl IndexCursor {
    pub fn new(index_data: Rc<RefCell<IndexData>>) -> Self {
        Self {
            index_data,
            state: CursorState::new(fresh_cursor_id()),
        }
    }

    pub fn position(&self) -> CursorPosition {
        self.state.current.get()
    }

    pub fn save(&self) -> Savepoint {
        self.state.save()
    }

    pub fn restore_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        self.state.restore(savepoint)
    }

    fn entries_snapshot(&self) -> Vec<(Vec<u8>, RowId)> {
        let data = self.index_data.borrow();
        data.iter_forward().map(|(k, r)| (k.to_vec(), r)).collect()
    }

    pub fn move_to_next_row(&self) -> Result<bool> {
        let entries = self.entries_snapshot();
        let next = match self.state.current.get() {
            CursorPosition::BeforeFirst => entries.first().cloned(),
            CursorPosition::AtRow(current) => {
                let pos = entries.iter().position(|(_, r)| *r == current);
                match pos {
                    Some(i) => entries.get(i + 1).cloned(),
                    None => {
                        self.state.current.set(self.state.previous.get());
                        return self.move_to_next_row();
                    }
                }
            }
            CursorPosition::AfterLast => None,
        };
        match next {
            Some((_, row_id)) => {
                self.state.set(CursorPosition::AtRow(row_id));
                Ok(true)
            }
            None => {
                self.state.set(CursorPosition::AfterLast);
                Ok(false)
            }
        }
    }

    pub fn move_to_previous_row(&self) -> Result<bool> {
        let mut entries = self.entries_snapshot();
        entries.reverse();
        let next = match self.state.current.get() {
            CursorPosition::AfterLast => entries.first().cloned(),
            CursorPosition::AtRow(current) => {
                let pos = entries.iter().position(|(_, r)| *r == current);
                pos.and_then(|i| entries.get(i + 1).cloned())
            }
            CursorPosition::BeforeFirst => None,
        };
        match next {
            Some((_, row_id)) => {
                self.state.set(CursorPosition::AtRow(row_id));
                Ok(true)
            }
            None => {
                self.state.set(CursorPosition::BeforeFirst);
                Ok(false)
            }
        }
    }

    /// Finds the first entry exactly matching `key`.
    pub fn find_first_by_entry(&self, key: &[u8]) -> Result<bool> {
        match self.index_data.borrow().find_first_by_entry(key) {
            Some(row_id) => {
                self.state.set(CursorPosition::AtRow(row_id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Finds the closest entry at or after `key`.
    pub fn find_closest_by_entry(&self, key: &[u8]) -> Result<bool> {
        let found = self.index_data.borrow().find_closest_by_entry(key).map(|(_, r)| r);
        match found {
            Some(row_id) => {
                self.state.set(CursorPosition::AtRow(row_id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// A backward scan may stop early once the key has left the
    /// pattern's range: `upper_bound` is the largest key still worth
    /// visiting (exclusive search patterns pass the pattern key
    /// itself). Returns `false` once `candidate` sorts above it,
    /// letting the caller short-circuit rather than walk to the table
    /// start.
    pub fn keep_searching(candidate: &[u8], upper_bound: &[u8]) -> bool {
        candidate <= upper_bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexData;

    #[test]
    fn savepoint_rejects_foreign_cursor() {
        let a = CursorState::new(fresh_cursor_id());
        let b = CursorState::new(fresh_cursor_id());
        a.set(CursorPosition::AtRow(RowId::new(1, 0)));
        let savepoint = a.save();
        assert!(b.restore(&savepoint).is_err());
    }

    #[test]
    fn savepoint_restores_own_cursor() {
        let a = CursorState::new(fresh_cursor_id());
        a.set(CursorPosition::AtRow(RowId::new(1, 0)));
        let savepoint = a.save();
        a.set(CursorPosition::AtRow(RowId::new(2, 0)));
        a.restore(&savepoint).unwrap();
        assert_eq!(a.current.get(), CursorPosition::AtRow(RowId::new(1, 0)));
    }

    #[test]
    fn index_cursor_walks_entries_in_order() {
        let data = Rc::new(RefCell::new(IndexData::new(1, vec![], false)));
        data.borrow_mut().insert_entry(vec![1], RowId::new(1, 0)).unwrap();
        data.borrow_mut().insert_entry(vec![2], RowId::new(1, 1)).unwrap();
        let cursor = IndexCursor::new(data);
        assert!(cursor.move_to_next_row().unwrap());
        assert_eq!(cursor.position(), CursorPosition::AtRow(RowId::new(1, 0)));
        assert!(cursor.move_to_next_row().unwrap());
        assert_eq!(cursor.position(), CursorPosition::AtRow(RowId::new(1, 1)));
        assert!(!cursor.move_to_next_row().unwrap());
        assert_eq!(cursor.position(), CursorPosition::AfterLast);
    }

    #[test]
    fn keep_searching_stops_outside_range() {
        assert!(IndexCursor::keep_searching(&[3], &[5]));
        assert!(!IndexCursor::keep_searching(&[7], &[5]));
    }

    #[test]
    fn default_matcher_treats_null_as_only_matching_null() {
        let matcher = DefaultColumnMatcher;
        assert!(matcher.matches(&Value::Null, &Value::Null));
        assert!(!matcher.matches(&Value::Null, &Value::Int32(0)));
    }
}
