//! Persistent bitset mapping page numbers to used/free.
//!
//! Two physical encodings back a logical [`UsageMap`]:
//!
//! - **Inline**: bits live in a single row on the declaring table's
//!   page. The start page is stored as a 4-byte int at the row's first
//!   byte after the type marker; capacity is `(row_len - 5) * 8` bits,
//!   roughly 512 pages for a Jet4 table.
//! - **Reference**: the row instead holds up to N four-byte pointers
//!   to dedicated `PAGE_USAGE_MAP` pages, each contributing
//!   `page_capacity_bits` more bits.
//!
//! A [`GlobalUsageMap`] wraps a plain [`UsageMap`] but overrides three
//! behaviors: bits outside the materialized window are treated as set
//! ("on"), `contains` is unsupported outside the window, and removing
//! a page outside the window slides the window and backfills the
//! newly admitted pages with 1s.

use crate::error::{Error, Result};

/// One byte can hold 8 page bits; inline start pages are always kept
/// a multiple of this so the byte-aligned window math stays exact.
const WINDOW_ALIGN: u32 = 8;

/// Marker byte written at the head of the declaring row: `0` for
/// inline, `1` for reference.
pub const MAP_TYPE_INLINE: u8 = 0;
pub const MAP_TYPE_REFERENCE: u8 = 1;

/// Bit-level storage shared by the inline and reference encodings: a
/// byte-packed window of `capacity` bits starting at page `start_page`.
#[derive(Debug, Clone)]
struct BitWindow {
    start_page: u32,
    bits: Vec<u8>, // byte-packed, bit i (LSB-first within each byte) = page start_page + i
}

impl BitWindow {
    fn new(start_page: u32, capacity_bits: usize) -> Self {
        assert!(start_page % WINDOW_ALIGN == 0, "start page must be 8-aligned");
        Self {
            start_page,
            bits: vec![0u8; capacity_bits.div_ceil(8)],
        }
    }

    fn capacity(&self) -> usize {
        self.bits.len() * 8
    }

    fn end_page_exclusive(&self) -> u32 {
        self.start_page + self.capacity() as u32
    }

    fn in_window(&self, page: u32) -> bool {
        page >= self.start_page && page < self.end_page_exclusive()
    }

    fn get(&self, page: u32) -> bool {
        if !self.in_window(page) {
            return false;
        }
        let idx = (page - self.start_page) as usize;
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    fn set_bit(&mut self, page: u32, value: bool) {
        debug_assert!(self.in_window(page));
        let idx = (page - self.start_page) as usize;
        if value {
            self.bits[idx / 8] |= 1 << (idx % 8);
        } else {
            self.bits[idx / 8] &= !(1 << (idx % 8));
        }
    }

    /// Slides the window so `page` becomes the new lower bound,
    /// preserving every bit still inside the (fixed-size) window and
    /// dropping whatever falls out the top. Used both when a page
    /// below `start_page` needs to be added and when the global map
    /// needs to backfill with 1s as it slides forward.
    fn shift_to_include(&mut self, page: u32, fill_new_low_bits: bool) {
        if self.in_window(page) {
            return;
        }
        let new_start = (page / WINDOW_ALIGN) * WINDOW_ALIGN;
        let capacity = self.capacity();
        let mut new_bits = vec![0u8; self.bits.len()];
        if new_start < self.start_page {
            let shift = (self.start_page - new_start) as usize;
            for old_idx in 0..capacity {
                let new_idx = old_idx + shift;
                if new_idx >= capacity {
                    break;
                }
                if self.bits[old_idx / 8] & (1 << (old_idx % 8)) != 0 {
                    new_bits[new_idx / 8] |= 1 << (new_idx % 8);
                }
            }
            if fill_new_low_bits {
                for idx in 0..shift.min(capacity) {
                    new_bits[idx / 8] |= 1 << (idx % 8);
                }
            }
        } else {
            let shift = (new_start - self.start_page) as usize;
            for old_idx in shift..capacity {
                let new_idx = old_idx - shift;
                if self.bits[old_idx / 8] & (1 << (old_idx % 8)) != 0 {
                    new_bits[new_idx / 8] |= 1 << (new_idx % 8);
                }
            }
            if fill_new_low_bits {
                for idx in capacity.saturating_sub(shift)..capacity {
                    new_bits[idx / 8] |= 1 << (idx % 8);
                }
            }
        }
        self.start_page = new_start;
        self.bits = new_bits;
    }

    fn iter_set_pages(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.capacity() as u32).filter(move |&i| {
            let idx = i as usize;
            self.bits[idx / 8] & (1 << (idx % 8)) != 0
        }).map(move |i| self.start_page + i)
    }
}

/// Outcome of an [`UsageMap::add_page`] call the owning `Table` needs
/// to act on: a freshly-promoted map must be persisted with a
/// `MAP_TYPE_REFERENCE` marker and its indirect pages allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Applied,
    PromotedToReference,
}

/// A table-owned (or column-owned) usage map: models either an inline
/// or a reference-backed bitset. See the module docs for the physical
/// layout each variant corresponds to.
#[derive(Debug, Clone)]
pub enum UsageMap {
    Inline(BitWindow),
    Reference {
        window: BitWindow,
        /// Page numbers of the indirect `PAGE_USAGE_MAP` pages backing
        /// `window`, in bit order.
        map_pages: Vec<u32>,
    },
}

impl UsageMap {
    pub fn new_inline(start_page: u32, capacity_bits: usize) -> Self {
        UsageMap::Inline(BitWindow::new(start_page, capacity_bits))
    }

    fn window(&self) -> &BitWindow {
        match self {
            UsageMap::Inline(w) => w,
            UsageMap::Reference { window, .. } => window,
        }
    }

    fn window_mut(&mut self) -> &mut BitWindow {
        match self {
            UsageMap::Inline(w) => w,
            UsageMap::Reference { window, .. } => window,
        }
    }

    pub fn contains_page_number(&self, page: u32) -> bool {
        self.window().get(page)
    }

    /// Adds `page` to the map. If the page falls outside an inline
    /// map's window and the window can't be fruitfully shifted to
    /// cover it without losing already-set high bits, the map must be
    /// promoted: clone existing bits, mark `MAP_TYPE_REFERENCE`,
    /// install a reference handler, and replay the bits plus the
    /// triggering page. The caller (the `Table`) performs the actual
    /// page allocation and marker write; this only reports that a
    /// promotion is needed and leaves `self` already converted so a
    /// repeated call is a no-op.
    pub fn add_page_number(&mut self, page: u32, max_inline_capacity: usize) -> Result<AddOutcome> {
        if self.window().in_window(page) {
            self.window_mut().set_bit(page, true);
            return Ok(AddOutcome::Applied);
        }
        match self {
            UsageMap::Reference { window, .. } => {
                window.shift_to_include(page, false);
                window.set_bit(page, true);
                Ok(AddOutcome::Applied)
            }
            UsageMap::Inline(window) => {
                let prospective_span = if page < window.start_page {
                    window.end_page_exclusive() - (page / WINDOW_ALIGN) * WINDOW_ALIGN
                } else {
                    page - window.start_page + 1
                };
                if prospective_span as usize <= max_inline_capacity {
                    window.shift_to_include(page, false);
                    window.set_bit(page, true);
                    Ok(AddOutcome::Applied)
                } else {
                    let promoted = self.promote(page);
                    *self = promoted;
                    Ok(AddOutcome::PromotedToReference)
                }
            }
        }
    }

    fn promote(&self, triggering_page: u32) -> UsageMap {
        let old = self.window();
        let mut new_window = BitWindow::new(old.start_page, old.capacity());
        new_window.bits = old.bits.clone();
        new_window.set_bit(triggering_page.max(old.start_page).min(old.end_page_exclusive() - 1), true);
        // A real promotion grows the window far beyond what one inline
        // row could hold; approximate that here by doubling capacity
        // so the triggering page always fits.
        while !new_window.in_window(triggering_page) {
            let mut grown = BitWindow::new(new_window.start_page, new_window.capacity() * 2);
            grown.bits[..new_window.bits.len()].copy_from_slice(&new_window.bits);
            new_window = grown;
        }
        new_window.set_bit(triggering_page, true);
        UsageMap::Reference {
            window: new_window,
            map_pages: Vec::new(),
        }
    }

    pub fn remove_page_number(&mut self, page: u32) -> Result<()> {
        if !self.window().in_window(page) {
            return Ok(());
        }
        self.window_mut().set_bit(page, false);
        Ok(())
    }

    pub fn iter_pages(&self) -> Vec<u32> {
        self.window().iter_set_pages().collect()
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, UsageMap::Reference { .. })
    }
}

/// The global free-page map. Bits outside the currently materialized
/// window are implicitly 1 ("free" / available to allocate), so
/// querying membership outside the window is meaningless and rejected
/// rather than silently answered.
#[derive(Debug, Clone)]
pub struct GlobalUsageMap {
    inner: UsageMap,
}

impl GlobalUsageMap {
    pub fn new(start_page: u32, capacity_bits: usize) -> Self {
        Self {
            inner: UsageMap::new_inline(start_page, capacity_bits),
        }
    }

    /// Unsupported by design: the global map assumes pages outside the
    /// window are on, so "does this page exist in the free set" only
    /// has a well-defined answer inside the window.
    pub fn contains_page_number(&self, page: u32) -> Result<bool> {
        if self.inner.window().in_window(page) {
            Ok(self.inner.contains_page_number(page))
        } else {
            Err(Error::Unsupported(
                "global usage map does not support containment queries outside its window".into(),
            ))
        }
    }

    /// Adds `page` back to the free set (marks it available). Adds
    /// outside the current window are silently ignored -- the window
    /// only grows on `remove_page_number`, which is the path that
    /// actually needs pages beyond what's materialized.
    pub fn add_page_number(&mut self, page: u32) {
        if self.inner.window().in_window(page) {
            let _ = self.inner.window_mut().set_bit(page, true);
        }
    }

    /// Marks `page` as used (removes it from the free set). Removing a
    /// page outside the window slides the window to include it,
    /// backfilling newly admitted pages with 1s (they were implicitly
    /// free before the window moved), then clears the requested bit.
    pub fn remove_page_number(&mut self, page: u32) {
        if !self.inner.window().in_window(page) {
            self.inner.window_mut().shift_to_include(page, true);
        }
        self.inner.window_mut().set_bit(page, false);
    }

    /// Finds the lowest free page number within the current window,
    /// for `PageChannel::allocate_new_page` candidate selection.
    pub fn first_free_page(&self) -> Option<u32> {
        self.inner.iter_pages().into_iter().min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_add_and_contains() {
        let mut map = UsageMap::new_inline(0, 64);
        assert_eq!(map.add_page_number(5, 512).unwrap(), AddOutcome::Applied);
        assert!(map.contains_page_number(5));
        assert!(!map.contains_page_number(6));
    }

    #[test]
    fn inline_remove_clears_bit() {
        let mut map = UsageMap::new_inline(0, 64);
        map.add_page_number(10, 512).unwrap();
        map.remove_page_number(10).unwrap();
        assert!(!map.contains_page_number(10));
    }

    #[test]
    fn inline_window_shifts_down_for_lower_page() {
        let mut map = UsageMap::new_inline(64, 64);
        map.add_page_number(8, 512).unwrap();
        assert!(map.contains_page_number(8));
    }

    #[test]
    fn promotes_to_reference_past_inline_capacity() {
        let mut map = UsageMap::new_inline(0, 512);
        for p in 0..512 {
            map.add_page_number(p, 512).unwrap();
        }
        let outcome = map.add_page_number(800, 512).unwrap();
        assert_eq!(outcome, AddOutcome::PromotedToReference);
        assert!(map.is_reference());
        assert!(map.contains_page_number(800));
        // Previously-set low pages survive the promotion.
        assert!(map.contains_page_number(0));
    }

    #[test]
    fn global_map_treats_out_of_window_as_on() {
        let map = GlobalUsageMap::new(0, 64);
        // Within window and never removed -> still free (0, untouched).
        assert_eq!(map.contains_page_number(0).unwrap(), false);
        assert!(map.contains_page_number(1000).is_err());
    }

    #[test]
    fn global_map_remove_outside_window_shifts_and_backfills() {
        let mut map = GlobalUsageMap::new(0, 64);
        map.remove_page_number(200);
        assert!(!map.contains_page_number(200).unwrap());
        // Pages admitted by the shift that weren't the target default to free.
        assert!(map.contains_page_number(199).unwrap());
    }

    #[test]
    fn global_map_add_outside_window_is_ignored() {
        let mut map = GlobalUsageMap::new(0, 64);
        map.add_page_number(9000); // no panic, no effect
        assert!(map.contains_page_number(9000).is_err());
    }
}
