//! A Jet/ACE (Microsoft Access `.mdb`/`.accdb`) database engine:
//! page-level I/O, the usage-map allocator, row and long-value codecs,
//! table row storage, B-tree-backed indexes with collation-aware keys,
//! table-scan/index cursors, and database bootstrap over the system
//! catalog.

pub mod byte_codec;
pub mod column;
pub mod cursor;
pub mod database;
pub mod error;
pub mod format;
pub mod index;
pub mod page;
pub mod row;
pub mod string;
pub mod table;
pub mod usage_map;
pub mod validate;

pub use column::{AutoNumberGenerator, Column, DataType, Value};
pub use cursor::{ColumnMatcher, CursorPosition, IndexCursor, SearchPattern, TableScanCursor};
pub use database::{CatalogEntry, ColumnOrder, Database, DatabaseConfig, DateTimeType, LinkResolver, ObjectType};
pub use error::{Error, ErrorHandler, Result};
pub use format::{JetFormat, JetVersion};
pub use index::{FKEnforcer, ForeignKeyReference, Index, IndexColumnSpec, IndexData, IndexLookup, IndexSpec, IndexType};
pub use page::{PageChannel, PageType, RowId};
pub use row::Row;
pub use table::Table;
pub use validate::{validate, DatabaseStats, ValidationResult};
