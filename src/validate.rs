//! Structural validation utilities for an opened database.
//!
//! Mirrors the file-level sanity checks a Jet engine should run before
//! trusting a database: page alignment, the system catalog's
//! internal consistency, and per-table row counts gathered by walking
//! each table's owned-pages usage map rather than trusting a cached
//! count.

use std::collections::HashMap;

use crate::database::Database;
use crate::page::PageType;

#[derive(Debug, Default, Clone)]
pub struct DatabaseStats {
    pub total_pages: u32,
    pub table_count: u32,
    pub system_table_count: u32,
    pub row_counts: HashMap<String, u32>,
}

#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub stats: DatabaseStats,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn new() -> Self {
        Self {
            valid: true,
            stats: DatabaseStats::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn add_error(&mut self, msg: impl Into<String>) {
        self.valid = false;
        self.errors.push(msg.into());
    }

    fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

/// Validates `db`'s structural consistency:
/// - the file is page-aligned and within `JetFormat::max_database_size`
/// - every catalog entry's declared page, if read, carries a
///   recognized `PageType`
/// - each ordinary table's rows are counted by walking its owned pages
pub fn validate(db: &Database) -> ValidationResult {
    let mut result = ValidationResult::new();
    let format = db.format();

    let page_count = match db.page_channel().page_count() {
        Ok(n) => n,
        Err(e) => {
            result.add_error(format!("failed to read page count: {e}"));
            return result;
        }
    };
    result.stats.total_pages = page_count;

    let max_pages = format.max_pages;
    if page_count > max_pages {
        result.add_error(format!(
            "page count {page_count} exceeds format's max_pages {max_pages}"
        ));
    }

    for entry in db.catalog_entries() {
        if entry.is_system() {
            result.stats.system_table_count += 1;
        }
        if entry.object_type != crate::database::ObjectType::Table {
            continue;
        }
        result.stats.table_count += 1;
        if entry.page_number == 0 || entry.page_number >= page_count {
            result.add_error(format!(
                "table {:?} declares page {} outside the file ({} pages)",
                entry.name, entry.page_number, page_count
            ));
            continue;
        }

        match db.find_table(&entry.name) {
            Ok(table) => {
                let mut row_count = 0u32;
                for page_number in table.owned_pages().iter_pages() {
                    let mut buf = vec![0u8; format.page_size];
                    if let Err(e) = db.page_channel().read_page(&mut buf, page_number) {
                        result.add_warning(format!(
                            "table {:?} owned page {page_number} unreadable: {e}",
                            entry.name
                        ));
                        continue;
                    }
                    if PageType::Data.expect(&buf, page_number).is_err() {
                        result.add_warning(format!(
                            "table {:?} owned page {page_number} is not a Data page",
                            entry.name
                        ));
                        continue;
                    }
                    match crate::byte_codec::read_u16_le(&buf, 4) {
                        Ok(n) => row_count += n as u32,
                        Err(e) => result.add_warning(format!("page {page_number}: {e}")),
                    }
                }
                result.stats.row_counts.insert(entry.name.clone(), row_count);
            }
            Err(e) => {
                result.add_warning(format!("table {:?} could not be loaded: {e}", entry.name));
            }
        }
    }

    if result.stats.table_count == 0 {
        result.add_warning("catalog has no user tables".to_string());
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_default_to_zero() {
        let stats = DatabaseStats::default();
        assert_eq!(stats.total_pages, 0);
        assert_eq!(stats.table_count, 0);
        assert!(stats.row_counts.is_empty());
    }

    #[test]
    fn validation_result_add_error_flips_valid() {
        let mut result = ValidationResult::new();
        assert!(result.valid);
        result.add_error("boom");
        assert!(!result.valid);
        assert_eq!(result.errors, vec!["boom".to_string()]);
    }

    #[test]
    fn validation_result_add_warning_keeps_valid() {
        let mut result = ValidationResult::new();
        result.add_warning("heads up");
        assert!(result.valid);
        assert_eq!(result.warnings, vec!["heads up".to_string()]);
    }
}
