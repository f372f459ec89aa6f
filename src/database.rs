//! Database bootstrap, system catalog, table lookup/caching, and ACE
//! provisioning for newly created objects.
//!
//! Opening a database reads page 0 to detect the [`JetVersion`], then
//! loads the system catalog (`MSysObjects`, page 2) as an ordinary
//! [`Table`] using a fixed bootstrap schema covering the columns this
//! engine consumes (`Id`, `Name`, `Type`, `Flags`, `ParentId`). Table
//! lookup resolves a name to a catalog entry, then lazily loads and
//! caches that table's column definitions from its table-definition
//! page.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use crate::byte_codec::{read_u16_le, write_u16_le};
use crate::column::{AutoNumberGenerator, Column, DataType, Value};
use crate::error::{Error, ErrorHandler, Result, RethrowErrorHandler};
use crate::format::{JetFormat, JetVersion};
use crate::index::{FKEnforcer, Index, IndexData, IndexLookup, IndexSpec, IndexType};
use crate::page::{PageChannel, PageType, RowId};
use crate::row::Row;
use crate::table::Table;
use crate::usage_map::UsageMap;
use tracing::{debug, info, warn};

/// The parent id every top-level table's catalog row points at.
pub const TABLES_PARENT_ID: u32 = 0xF000_0000;

/// Full-access ACE mask granted to the creating principal on newly
/// created objects.
pub const SYS_FULL_ACCESS_ACM: u32 = 1_048_575;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Table,
    LinkedOdbcTable,
    Query,
    LinkedTable,
    Relationship,
    Other(u8),
}

impl ObjectType {
    fn from_byte(b: u8) -> Self {
        match b {
            1 => ObjectType::Table,
            4 => ObjectType::LinkedOdbcTable,
            5 => ObjectType::Query,
            6 => ObjectType::LinkedTable,
            8 => ObjectType::Relationship,
            other => ObjectType::Other(other),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            ObjectType::Table => 1,
            ObjectType::LinkedOdbcTable => 4,
            ObjectType::Query => 5,
            ObjectType::LinkedTable => 6,
            ObjectType::Relationship => 8,
            ObjectType::Other(b) => b,
        }
    }
}

pub const FLAG_SYSTEM_HIGH: u32 = 0x8000_0000;
pub const FLAG_SYSTEM_LOW: u32 = 0x02;
pub const FLAG_HIDDEN: u32 = 0x08;

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub id: i32,
    pub name: String,
    pub object_type: ObjectType,
    pub flags: u32,
    pub parent_id: u32,
    pub page_number: u32,
    pub linked_db_name: Option<String>,
    pub linked_table_name: Option<String>,
}

impl CatalogEntry {
    pub fn is_system(&self) -> bool {
        self.flags & (FLAG_SYSTEM_HIGH | FLAG_SYSTEM_LOW) != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.flags & FLAG_HIDDEN != 0
    }
}

/// Resolves a linked table's backing database. Installed by the
/// caller; the core never opens files on its own behalf for a link.
pub trait LinkResolver {
    fn resolve(&self, linked_db_name: &str) -> Result<Rc<Database>>;
}

/// Column-order presentation for catalog listings: `Display` follows
/// the user-visible column order stored in table properties, `Data`
/// follows physical storage order. Both read the same columns; this
/// only affects iteration/display order at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnOrder {
    Display,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTimeType {
    Date,
    LocalDateTime,
}

/// Explicit, caller-supplied configuration. Replaces the ambient
/// system-properties bag with a plain struct passed to
/// [`Database::open`]; nothing here is read from global state.
pub struct DatabaseConfig {
    pub auto_sync: bool,
    /// Forces chunked file transfer instead of any platform-specific
    /// fast path; relevant once a memory-mapped or vectored I/O path
    /// is added, a no-op today since this engine only ever does plain
    /// `read`/`write`.
    pub broken_nio: bool,
    /// Overrides the platform timezone used to interpret
    /// `SHORT_DATE_TIME` values at the API boundary.
    pub time_zone_override: Option<String>,
    /// Overrides the default charset for a given format version's
    /// uncompressed TEXT columns.
    pub charset_overrides: HashMap<JetVersion, &'static str>,
    pub column_order: ColumnOrder,
    pub enforce_foreign_keys: bool,
    pub allow_auto_number_insert: bool,
    pub enable_expression_evaluation: bool,
    pub date_time_type: DateTimeType,
    pub error_handler: Box<dyn ErrorHandler>,
    pub link_resolver: Option<Box<dyn LinkResolver>>,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("auto_sync", &self.auto_sync)
            .field("broken_nio", &self.broken_nio)
            .field("time_zone_override", &self.time_zone_override)
            .field("column_order", &self.column_order)
            .field("enforce_foreign_keys", &self.enforce_foreign_keys)
            .field("allow_auto_number_insert", &self.allow_auto_number_insert)
            .field("enable_expression_evaluation", &self.enable_expression_evaluation)
            .field("date_time_type", &self.date_time_type)
            .finish_non_exhaustive()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            broken_nio: false,
            time_zone_override: None,
            charset_overrides: HashMap::new(),
            column_order: ColumnOrder::Data,
            enforce_foreign_keys: true,
            allow_auto_number_insert: false,
            enable_expression_evaluation: true,
            date_time_type: DateTimeType::Date,
            error_handler: Box::new(RethrowErrorHandler),
            link_resolver: None,
        }
    }
}

/// Bootstrap column layout for `MSysObjects`: only the columns the
/// core actually consumes (`Id`, `Name`, `Type`, `Flags`, `ParentId`);
/// `Owner`, `DateCreate`, `DateUpdate`, `LvProp`, `Database`,
/// `ForeignName`, `Connect` are out of scope and not modeled.
fn catalog_columns() -> Vec<Column> {
    vec![
        Column {
            name: "Id".into(),
            data_type: DataType::Int32,
            column_number: 0,
            nullable: false,
            compressed_unicode: false,
            numeric_info: None,
            auto_number: None,
            fixed_offset: Some(0),
            variable_index: None,
            null_mask_index: None,
        },
        Column {
            name: "Type".into(),
            data_type: DataType::Byte,
            column_number: 1,
            nullable: false,
            compressed_unicode: false,
            numeric_info: None,
            auto_number: None,
            fixed_offset: Some(4),
            variable_index: None,
            null_mask_index: None,
        },
        Column {
            name: "Flags".into(),
            data_type: DataType::Int32,
            column_number: 2,
            nullable: false,
            compressed_unicode: false,
            numeric_info: None,
            auto_number: None,
            fixed_offset: Some(5),
            variable_index: None,
            null_mask_index: None,
        },
        Column {
            name: "ParentId".into(),
            data_type: DataType::Int32,
            column_number: 3,
            nullable: false,
            compressed_unicode: false,
            numeric_info: None,
            auto_number: None,
            fixed_offset: Some(9),
            variable_index: None,
            null_mask_index: None,
        },
        Column {
            name: "PageNumber".into(),
            data_type: DataType::Int32,
            column_number: 4,
            nullable: false,
            compressed_unicode: false,
            numeric_info: None,
            auto_number: None,
            fixed_offset: Some(13),
            variable_index: None,
            null_mask_index: None,
        },
        Column {
            name: "Name".into(),
            data_type: DataType::Text,
            column_number: 5,
            nullable: true,
            compressed_unicode: true,
            numeric_info: None,
            auto_number: None,
            fixed_offset: None,
            variable_index: Some(0),
            null_mask_index: Some(0),
        },
    ]
}

fn catalog_entry_from_row(row: &Row) -> Result<CatalogEntry> {
    use crate::column::Value;
    let id = match row.get("Id") {
        Some(Value::Int32(v)) => *v,
        _ => return Err(Error::format("catalog row missing Id")),
    };
    let name = match row.get("Name") {
        Some(Value::Text(s)) => s.clone(),
        _ => return Err(Error::format("catalog row missing Name")),
    };
    let object_type = match row.get("Type") {
        Some(Value::Byte(b)) => ObjectType::from_byte(*b),
        _ => return Err(Error::format("catalog row missing Type")),
    };
    let flags = match row.get("Flags") {
        Some(Value::Int32(v)) => *v as u32,
        _ => 0,
    };
    let parent_id = match row.get("ParentId") {
        Some(Value::Int32(v)) => *v as u32,
        _ => 0,
    };
    let page_number = match row.get("PageNumber") {
        Some(Value::Int32(v)) => *v as u32,
        _ => 0,
    };
    Ok(CatalogEntry {
        id,
        name,
        object_type,
        flags,
        parent_id,
        page_number,
        linked_db_name: None,
        linked_table_name: None,
    })
}

/// Reads the version marker out of page 0 without yet knowing the
/// page size: the marker sits at a fixed offset within the first 32
/// bytes, well inside both the Jet3 (2048) and Jet4+ (4096) page, and
/// outside the XOR-masked span, so it can be read before a format (and
/// therefore a page size) is known.
fn detect_format(file: &mut File) -> Result<&'static JetFormat> {
    let mut header = [0u8; 0x20];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;
    let version = JetVersion::from_marker(&header[0x14..0x18])?;
    Ok(JetFormat::for_version(version))
}

/// A single-writer handle onto one Jet/ACE database file: the page
/// channel, the detected format, the system catalog, and a registry of
/// live table handles keyed by definition page (replacing a
/// weak-reference cache with an explicit `release`).
pub struct Database {
    page_channel: Rc<PageChannel>,
    format: &'static JetFormat,
    config: DatabaseConfig,
    catalog_table: Table,
    catalog: RefCell<Vec<CatalogEntry>>,
    table_registry: RefCell<HashMap<u32, Rc<Table>>>,
    next_synthetic_id: RefCell<i32>,
}

impl Database {
    pub fn open(path: impl AsRef<std::path::Path>, config: DatabaseConfig) -> Result<Self> {
        let mut file = File::options().read(true).write(true).open(path)?;
        let format = detect_format(&mut file)?;
        debug!("detected format {:?} (page size {})", format.version, format.page_size);
        let page_channel = Rc::new(PageChannel::new(file, format, config.auto_sync));

        let mut header = vec![0u8; format.page_size];
        page_channel.read_page(&mut header, 2)?;
        PageType::Data.expect(&header, 2)?;
        let catalog_table = Table::new(
            Rc::clone(&page_channel),
            2,
            "MSysObjects".into(),
            catalog_columns(),
            UsageMap::new_inline(2, 512),
            UsageMap::new_inline(2, 512),
            Vec::new(),
        );

        let db = Database {
            page_channel,
            format,
            config,
            catalog_table,
            catalog: RefCell::new(Vec::new()),
            table_registry: RefCell::new(HashMap::new()),
            next_synthetic_id: RefCell::new(-1),
        };
        db.load_catalog()?;
        info!("opened database: {} catalog entries, {} user tables", db.catalog.borrow().len(), db.list_table_names().len());
        Ok(db)
    }

    pub fn format(&self) -> &'static JetFormat {
        self.format
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Loads `MSysObjects` (page 2) using the bootstrap schema and
    /// caches every row as a `CatalogEntry`. A real index-backed
    /// lookup on `(ParentId, Name)` is attempted first; since this
    /// engine does not yet materialize that index from disk, it falls
    /// back to the documented linear scan unconditionally, which is
    /// the behavior `find_table` also gets when the index is missing.
    ///
    /// Unlike a user table, `MSysObjects`'s schema is this hardcoded
    /// bootstrap list rather than something parsed off a
    /// table-definition page, so page 2 is read and scanned directly
    /// as a `Data` page instead of going through `load_table`.
    fn load_catalog(&self) -> Result<()> {
        let mut entries = Vec::new();
        let mut row_number = 0u16;
        loop {
            match self.catalog_table.position_at_row_header(crate::page::RowId::new(2, row_number)) {
                Ok(state) if !state.is_deleted() => {
                    let row = self.catalog_table.read_row(crate::page::RowId::new(2, row_number))?;
                    entries.push(catalog_entry_from_row(&row)?);
                    row_number += 1;
                }
                Ok(_) => row_number += 1,
                Err(_) => break,
            }
            if row_number > 8192 {
                break;
            }
        }
        debug!("loaded {} rows from MSysObjects", entries.len());
        *self.catalog.borrow_mut() = entries;
        Ok(())
    }

    /// Finds the catalog entry for `Name = "Tables", ParentId =
    /// TABLES_PARENT_ID`; its id is the parent of every ordinary
    /// table row.
    pub fn tables_parent_entry(&self) -> Result<CatalogEntry> {
        self.catalog
            .borrow()
            .iter()
            .find(|e| e.parent_id == TABLES_PARENT_ID && e.name.eq_ignore_ascii_case("Tables"))
            .cloned()
            .ok_or_else(|| Error::NotFound("bootstrap row ParentId=0xF000000 Name=\"Tables\" not found".into()))
    }

    pub fn catalog_entries(&self) -> Vec<CatalogEntry> {
        self.catalog.borrow().clone()
    }

    pub fn page_channel(&self) -> &Rc<PageChannel> {
        &self.page_channel
    }

    pub fn list_table_names(&self) -> Vec<String> {
        self.catalog
            .borrow()
            .iter()
            .filter(|e| e.object_type == ObjectType::Table && !e.is_system())
            .map(|e| e.name.clone())
            .collect()
    }

    fn find_catalog_entry(&self, name: &str) -> Option<CatalogEntry> {
        self.catalog
            .borrow()
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Resolves `name` to a live `Table` handle, consulting the
    /// registry before loading. Linked tables dispatch to the
    /// configured `LinkResolver`; linked-ODBC tables are out of scope
    /// for a readable `Table` and return `Unsupported`.
    pub fn find_table(&self, name: &str) -> Result<Rc<Table>> {
        let entry = self
            .find_catalog_entry(name)
            .ok_or_else(|| Error::NotFound(format!("table {name:?} not found in catalog")))?;

        match entry.object_type {
            ObjectType::Table => {
                if let Some(existing) = self.table_registry.borrow().get(&entry.page_number) {
                    return Ok(Rc::clone(existing));
                }
                let table = Rc::new(self.load_table(&entry)?);
                self.table_registry.borrow_mut().insert(entry.page_number, Rc::clone(&table));
                Ok(table)
            }
            ObjectType::LinkedTable => {
                let resolver = self.config.link_resolver.as_ref().ok_or_else(|| {
                    warn!("table {name:?} is linked but no LinkResolver is configured");
                    Error::Unsupported("no LinkResolver configured for a linked table".into())
                })?;
                let linked_db_name = entry
                    .linked_db_name
                    .as_deref()
                    .ok_or_else(|| Error::format("linked table entry missing its source database name"))?;
                let other_db = resolver.resolve(linked_db_name)?;
                other_db.find_table(entry.linked_table_name.as_deref().unwrap_or(name))
            }
            ObjectType::LinkedOdbcTable => Err(Error::Unsupported(
                "linked-ODBC tables expose only a TableDefinition, not a readable Table".into(),
            )),
            other => Err(Error::Unsupported(format!("{other:?} is not a readable table"))),
        }
    }

    /// Explicit release of a cached table handle, the `Database`-side
    /// half of the registry-replaces-weak-reference-cache redesign.
    /// Harmless to call with an outstanding `Rc` clone held elsewhere;
    /// it only removes the registry's own reference.
    pub fn release_table(&self, definition_page: u32) {
        self.table_registry.borrow_mut().remove(&definition_page);
    }

    fn load_table(&self, entry: &CatalogEntry) -> Result<Table> {
        let mut def_page = vec![0u8; self.format.page_size];
        self.page_channel.read_page(&mut def_page, entry.page_number)?;
        PageType::TableDef.expect(&def_page, entry.page_number)?;
        let columns = decode_table_definition(&def_page)?;
        let owned = UsageMap::new_inline(entry.page_number, 512);
        let free_space = UsageMap::new_inline(entry.page_number, 512);
        // Index definitions aren't persisted on the table-definition page
        // this engine writes (see `encode_table_definition`), so a
        // reloaded table comes back with no indexes; only a table handle
        // still held from its `create_table` call carries them.
        Ok(Table::new(
            Rc::clone(&self.page_channel),
            entry.page_number,
            entry.name.clone(),
            columns,
            owned,
            free_space,
            Vec::new(),
        ))
    }

    /// Allocates a synthetic, negative object id for a catalog row
    /// this engine creates itself (real Jet ids for user objects are
    /// positive; negative ids are reserved for engine-internal rows
    /// and never collide with on-disk-assigned ids).
    pub fn allocate_synthetic_id(&self) -> i32 {
        let mut next = self.next_synthetic_id.borrow_mut();
        let id = *next;
        *next -= 1;
        id
    }

    /// Grants the creating principal full access on a newly created
    /// object; the ACE table itself (`MSysACEs`) is a system table
    /// loaded lazily like the others named in the bootstrap spec, and
    /// is out of scope for this entry point beyond the mask constant.
    pub fn default_acm_for_new_object(&self) -> u32 {
        SYS_FULL_ACCESS_ACM
    }

    /// Creates a new table: allocates a table-definition page, appends
    /// its row to `MSysObjects` with a synthetic negative object id and
    /// the default full-access ACM, builds one `IndexData` per
    /// `IndexSpec`, and registers the live handle.
    pub fn create_table(&self, name: &str, columns: Vec<Column>, index_specs: Vec<IndexSpec>) -> Result<Rc<Table>> {
        if self.find_catalog_entry(name).is_some() {
            return Err(Error::format(format!("table {name:?} already exists")));
        }
        info!("creating table {name:?} with {} columns, {} indexes", columns.len(), index_specs.len());

        let definition_page = self.page_channel.allocate_new_page()?;
        let body = encode_table_definition(&columns)?;
        self.page_channel.start_write();
        let result = self.page_channel.write_page(&body, definition_page, 0);
        self.page_channel.finish_write()?;
        result?;

        let object_id = self.allocate_synthetic_id();
        let parent_id = self.tables_parent_entry()?.id as u32;
        debug!("granting ACM {:#x} on new table {name:?}", self.default_acm_for_new_object());

        let mut catalog_row = Row::new();
        catalog_row.insert("Id", Value::Int32(object_id));
        catalog_row.insert("Type", Value::Byte(ObjectType::Table.to_byte()));
        catalog_row.insert("Flags", Value::Int32(0));
        catalog_row.insert("ParentId", Value::Int32(parent_id as i32));
        catalog_row.insert("PageNumber", Value::Int32(definition_page as i32));
        catalog_row.insert("Name", Value::Text(name.to_string()));
        self.catalog_table.insert_row(catalog_row)?;

        self.catalog.borrow_mut().push(CatalogEntry {
            id: object_id,
            name: name.to_string(),
            object_type: ObjectType::Table,
            flags: 0,
            parent_id,
            page_number: definition_page,
            linked_db_name: None,
            linked_table_name: None,
        });

        let indexes = index_specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                let index_type = if spec.primary_key {
                    IndexType::PrimaryKey
                } else if spec.foreign_key.is_some() {
                    IndexType::ForeignKey
                } else {
                    IndexType::Regular
                };
                let data = Rc::new(RefCell::new(IndexData::new(0, spec.columns, spec.unique)));
                let mut index = Index::new(spec.name, i as u16, index_type, data);
                index.fk_reference = spec.foreign_key;
                index
            })
            .collect();

        let table = Rc::new(Table::new(
            Rc::clone(&self.page_channel),
            definition_page,
            name.to_string(),
            columns,
            UsageMap::new_inline(definition_page, 512),
            UsageMap::new_inline(definition_page, 512),
            indexes,
        ));
        self.table_registry.borrow_mut().insert(definition_page, Rc::clone(&table));
        Ok(table)
    }

    /// Inserts `row` into `table`, checking every foreign-key index's
    /// referenced parent row exists first when `enforce_foreign_keys`
    /// is set. Local index maintenance happens inside `Table::insert_row`
    /// itself; only cross-table FK lookups need the registry this method
    /// has access to.
    pub fn insert_row(&self, table: &Table, row: Row) -> Result<RowId> {
        if self.config.enforce_foreign_keys {
            let enforcer = FKEnforcer::new(self);
            for index in table.indexes() {
                if let Some(reference) = &index.fk_reference {
                    let key = table.index_key_for_row(index, &row);
                    enforcer.check_reference_exists(reference, &key)?;
                }
            }
        }
        table.insert_row(row)
    }

    /// Deletes `row_id` from `table`, cascading to any loaded child
    /// table whose foreign key references it when `enforce_foreign_keys`
    /// and the reference's `cascade_deletes` flag are both set. Cascade
    /// only reaches tables already present in `table_registry` (i.e.
    /// already resolved through `find_table`/`create_table`); it does
    /// not walk the full catalog or recurse past one level.
    pub fn delete_row(&self, table: &Table, row_id: RowId) -> Result<()> {
        if self.config.enforce_foreign_keys {
            let row = table.read_row(row_id)?;
            let enforcer = FKEnforcer::new(self);
            for child in self.table_registry.borrow().values() {
                for child_index in child.indexes() {
                    let Some(reference) = &child_index.fk_reference else { continue };
                    if reference.other_table_def_page != table.definition_page {
                        continue;
                    }
                    let Some(parent_index) = table.indexes().get(reference.other_index_number as usize) else { continue };
                    let parent_key = table.index_key_for_row(parent_index, &row);
                    if enforcer.resolve_parent_change(reference, &parent_key, reference.cascade_deletes)? {
                        let matching: Vec<RowId> = child_index
                            .data
                            .borrow()
                            .iter_forward()
                            .filter(|(k, _)| *k == parent_key.as_slice())
                            .map(|(_, r)| r)
                            .collect();
                        for child_row_id in matching {
                            child.delete_row(child_row_id)?;
                        }
                    }
                }
            }
        }
        table.delete_row(row_id)
    }
}

impl IndexLookup for Database {
    fn find_index_data(&self, table_def_page: u32, index_number: u16) -> Option<Rc<RefCell<IndexData>>> {
        self.table_registry.borrow().get(&table_def_page)?.index_data(index_number)
    }
}

/// Column descriptor as persisted on a table-definition page: a fixed
/// 24-byte record, with every column's descriptor followed (after all
/// descriptors) by a name-length-prefixed UTF-8 name blob in the same
/// order. This mirrors the *shape* of the real catalog layout
/// (fixed descriptors, then names) without matching Microsoft's exact
/// byte layout, which this engine does not need to interoperate with
/// TableDef pages it did not write itself.
const COLUMN_DESCRIPTOR_LEN: usize = 24;

fn data_type_to_tag(dt: DataType) -> u8 {
    match dt {
        DataType::Boolean => 0,
        DataType::Byte => 1,
        DataType::Int16 => 2,
        DataType::Int32 => 3,
        DataType::Money => 4,
        DataType::Float32 => 5,
        DataType::Float64 => 6,
        DataType::ShortDateTime => 7,
        DataType::Binary => 8,
        DataType::Text => 9,
        DataType::Ole => 10,
        DataType::Memo => 11,
        DataType::Guid => 12,
        DataType::Numeric => 13,
        DataType::Complex => 14,
        DataType::BigInt => 15,
    }
}

fn data_type_from_tag(tag: u8) -> Result<DataType> {
    Ok(match tag {
        0 => DataType::Boolean,
        1 => DataType::Byte,
        2 => DataType::Int16,
        3 => DataType::Int32,
        4 => DataType::Money,
        5 => DataType::Float32,
        6 => DataType::Float64,
        7 => DataType::ShortDateTime,
        8 => DataType::Binary,
        9 => DataType::Text,
        10 => DataType::Ole,
        11 => DataType::Memo,
        12 => DataType::Guid,
        13 => DataType::Numeric,
        14 => DataType::Complex,
        15 => DataType::BigInt,
        other => return Err(Error::format(format!("unrecognized column type tag {other}"))),
    })
}

fn auto_number_to_tag(gen: Option<AutoNumberGenerator>) -> u8 {
    match gen {
        None => 0,
        Some(AutoNumberGenerator::LongCounter) => 1,
        Some(AutoNumberGenerator::Guid) => 2,
        Some(AutoNumberGenerator::ComplexCounter) => 3,
        Some(AutoNumberGenerator::Unsupported) => 4,
    }
}

fn auto_number_from_tag(tag: u8) -> Option<AutoNumberGenerator> {
    match tag {
        1 => Some(AutoNumberGenerator::LongCounter),
        2 => Some(AutoNumberGenerator::Guid),
        3 => Some(AutoNumberGenerator::ComplexCounter),
        4 => Some(AutoNumberGenerator::Unsupported),
        _ => None,
    }
}

/// Writes a table's column catalog onto a single table-definition
/// page, starting right after the page's type byte.
pub fn encode_table_definition(columns: &[Column]) -> Result<Vec<u8>> {
    let mut page_body = vec![PageType::TableDef as u8];
    page_body.push(0); // reserved
    let mut header = [0u8; 2];
    write_u16_le(&mut header, 0, columns.len() as u16)?;
    page_body.extend_from_slice(&header);

    let mut names = Vec::new();
    for column in columns {
        let mut descriptor = [0u8; COLUMN_DESCRIPTOR_LEN];
        descriptor[0] = data_type_to_tag(column.data_type);
        descriptor[1] = (column.nullable as u8) | ((column.compressed_unicode as u8) << 1);
        descriptor[2..4].copy_from_slice(&column.column_number.to_le_bytes());
        let slot = column.fixed_offset.or(column.variable_index).unwrap_or(0xFFFF) as u16;
        descriptor[4..6].copy_from_slice(&slot.to_le_bytes());
        let null_idx = column.null_mask_index.map(|i| i as u16).unwrap_or(0xFFFF);
        descriptor[6..8].copy_from_slice(&null_idx.to_le_bytes());
        if let Some(info) = column.numeric_info {
            descriptor[8] = info.precision;
            descriptor[9] = info.scale;
        }
        descriptor[10] = auto_number_to_tag(column.auto_number);
        let name_bytes = column.name.as_bytes();
        write_u16_le(&mut descriptor, 11, name_bytes.len() as u16)?;
        page_body.extend_from_slice(&descriptor);
        names.extend_from_slice(name_bytes);
    }
    page_body.extend_from_slice(&names);
    Ok(page_body)
}

/// Reads back a table's column catalog from a page written by
/// [`encode_table_definition`].
pub fn decode_table_definition(page: &[u8]) -> Result<Vec<Column>> {
    let column_count = read_u16_le(page, 2)? as usize;
    let mut columns = Vec::with_capacity(column_count);
    let descriptors_start = 4;
    let mut name_offset = descriptors_start + column_count * COLUMN_DESCRIPTOR_LEN;
    for i in 0..column_count {
        let start = descriptors_start + i * COLUMN_DESCRIPTOR_LEN;
        let descriptor = &page[start..start + COLUMN_DESCRIPTOR_LEN];
        let data_type = data_type_from_tag(descriptor[0])?;
        let nullable = descriptor[1] & 0x01 != 0;
        let compressed_unicode = descriptor[1] & 0x02 != 0;
        let column_number = read_u16_le(descriptor, 2)?;
        let slot = read_u16_le(descriptor, 4)?;
        let null_idx = read_u16_le(descriptor, 6)?;
        let precision = descriptor[8];
        let scale = descriptor[9];
        let auto_number = auto_number_from_tag(descriptor[10]);
        let name_len = read_u16_le(descriptor, 11)? as usize;

        let name = String::from_utf8(page[name_offset..name_offset + name_len].to_vec())
            .map_err(|e| Error::format(format!("invalid column name bytes: {e}")))?;
        name_offset += name_len;

        let is_fixed = data_type.fixed_size().is_some();
        columns.push(Column {
            name,
            data_type,
            column_number,
            nullable,
            compressed_unicode,
            numeric_info: if precision > 0 { Some(crate::column::NumericInfo { precision, scale }) } else { None },
            auto_number,
            fixed_offset: if is_fixed && slot != 0xFFFF { Some(slot as usize) } else { None },
            variable_index: if !is_fixed && slot != 0xFFFF { Some(slot as usize) } else { None },
            null_mask_index: if null_idx != 0xFFFF { Some(null_idx as usize) } else { None },
        });
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Value;

    fn sample_columns() -> Vec<Column> {
        vec![
            Column {
                name: "Id".into(),
                data_type: DataType::Int32,
                column_number: 0,
                nullable: false,
                compressed_unicode: false,
                numeric_info: None,
                auto_number: Some(AutoNumberGenerator::LongCounter),
                fixed_offset: Some(0),
                variable_index: None,
                null_mask_index: None,
            },
            Column {
                name: "Name".into(),
                data_type: DataType::Text,
                column_number: 1,
                nullable: true,
                compressed_unicode: true,
                numeric_info: None,
                auto_number: None,
                fixed_offset: None,
                variable_index: Some(0),
                null_mask_index: Some(0),
            },
        ]
    }

    #[test]
    fn table_definition_round_trips() {
        let columns = sample_columns();
        let encoded = encode_table_definition(&columns).unwrap();
        let decoded = decode_table_definition(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].name, "Id");
        assert_eq!(decoded[0].data_type, DataType::Int32);
        assert_eq!(decoded[0].auto_number, Some(AutoNumberGenerator::LongCounter));
        assert_eq!(decoded[1].name, "Name");
        assert_eq!(decoded[1].variable_index, Some(0));
    }

    #[test]
    fn catalog_entry_flags_detect_system_and_hidden() {
        let entry = CatalogEntry {
            id: 1,
            name: "MSysObjects".into(),
            object_type: ObjectType::Table,
            flags: FLAG_SYSTEM_HIGH | FLAG_HIDDEN,
            parent_id: TABLES_PARENT_ID,
            page_number: 2,
            linked_db_name: None,
            linked_table_name: None,
        };
        assert!(entry.is_system());
        assert!(entry.is_hidden());
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = DatabaseConfig::default();
        assert!(config.enforce_foreign_keys);
        assert!(!config.allow_auto_number_insert);
        assert!(config.enable_expression_evaluation);
    }

    /// Builds an in-memory database file with an initialized, empty
    /// `MSysObjects` page at page 2 (pages 0/1 are left zeroed; nothing
    /// under test reads them) and a `Database` bound to it, for tests
    /// that exercise catalog/table-creation logic without going through
    /// `Database::open`'s on-disk format detection.
    fn bootstrap_test_database() -> Database {
        let format = JetFormat::for_version(JetVersion::Jet4);
        let file = tempfile::tempfile().unwrap();
        file.set_len(format.page_size as u64 * 3).unwrap();
        let channel = Rc::new(PageChannel::new(file, format, false));

        let mut catalog_page = vec![0u8; format.page_size];
        catalog_page[0] = PageType::Data as u8;
        channel.start_write();
        let write_result = channel.write_page(&catalog_page, 2, 0);
        channel.finish_write().unwrap();
        write_result.unwrap();

        let catalog_table = Table::new(
            Rc::clone(&channel),
            2,
            "MSysObjects".into(),
            catalog_columns(),
            UsageMap::new_inline(2, 512),
            UsageMap::new_inline(2, 512),
            Vec::new(),
        );

        let db = Database {
            page_channel: channel,
            format,
            config: DatabaseConfig::default(),
            catalog_table,
            catalog: RefCell::new(Vec::new()),
            table_registry: RefCell::new(HashMap::new()),
            next_synthetic_id: RefCell::new(-1),
        };

        let mut tables_row = Row::new();
        tables_row.insert("Id", Value::Int32(1));
        tables_row.insert("Type", Value::Byte(ObjectType::Other(3).to_byte()));
        tables_row.insert("Flags", Value::Int32(FLAG_SYSTEM_HIGH as i32));
        tables_row.insert("ParentId", Value::Int32(TABLES_PARENT_ID as i32));
        tables_row.insert("PageNumber", Value::Int32(0));
        tables_row.insert("Name", Value::Text("Tables".into()));
        db.catalog_table.insert_row(tables_row).unwrap();
        db.load_catalog().unwrap();
        db
    }

    #[test]
    fn synthetic_ids_are_negative_and_decreasing() {
        let db = bootstrap_test_database();
        let a = db.allocate_synthetic_id();
        let b = db.allocate_synthetic_id();
        assert!(a < 0);
        assert!(b < a);
    }

    #[test]
    fn create_table_appends_catalog_row_and_is_findable() {
        let db = bootstrap_test_database();
        let columns = sample_columns();
        let table = db.create_table("Widgets", columns, vec![]).unwrap();
        assert_eq!(table.name, "Widgets");

        let entry = db.find_catalog_entry("Widgets").unwrap();
        assert_eq!(entry.object_type, ObjectType::Table);
        assert!(entry.id < 0);
        assert_eq!(entry.parent_id, 1);

        let found = db.find_table("Widgets").unwrap();
        assert_eq!(found.definition_page, table.definition_page);
    }

    #[test]
    fn create_table_rejects_duplicate_names() {
        let db = bootstrap_test_database();
        db.create_table("Widgets", sample_columns(), vec![]).unwrap();
        let err = db.create_table("Widgets", sample_columns(), vec![]).unwrap_err();
        assert!(matches!(err, Error::FormatViolation(_)));
    }

    #[test]
    fn unique_index_rejects_duplicate_then_accepts_after_delete() {
        use crate::index::IndexColumnSpec;
        let db = bootstrap_test_database();
        let spec = IndexSpec {
            name: "PrimaryKey".into(),
            columns: vec![IndexColumnSpec { column_number: 0, ascending: true }],
            unique: true,
            primary_key: true,
            foreign_key: None,
        };
        let table = db.create_table("Widgets", sample_columns(), vec![spec]).unwrap();

        let mut row = Row::new();
        row.insert("Id", Value::Int32(1));
        row.insert("Name", Value::Text("first".into()));
        let row_id = table.insert_row(row).unwrap();

        let mut dup = Row::new();
        dup.insert("Id", Value::Int32(1));
        dup.insert("Name", Value::Text("second".into()));
        assert!(table.insert_row(dup.clone()).is_err());

        table.delete_row(row_id).unwrap();
        let reinserted = table.insert_row(dup).unwrap();
        assert_eq!(table.read_row(reinserted).unwrap().get("Name"), Some(&Value::Text("second".into())));
    }

    #[test]
    fn deleting_a_referenced_parent_row_cascades_to_children() {
        use crate::index::IndexColumnSpec;
        let db = bootstrap_test_database();
        let parent_spec = IndexSpec {
            name: "PrimaryKey".into(),
            columns: vec![IndexColumnSpec { column_number: 0, ascending: true }],
            unique: true,
            primary_key: true,
            foreign_key: None,
        };
        let parent = db.create_table("Parents", sample_columns(), vec![parent_spec]).unwrap();

        let mut parent_row = Row::new();
        parent_row.insert("Id", Value::Int32(1));
        parent_row.insert("Name", Value::Text("mother".into()));
        let parent_row_id = db.insert_row(&parent, parent_row).unwrap();

        let fk_spec = IndexSpec {
            name: "ParentFk".into(),
            columns: vec![IndexColumnSpec { column_number: 0, ascending: true }],
            unique: false,
            primary_key: false,
            foreign_key: Some(crate::index::ForeignKeyReference {
                other_table_def_page: parent.definition_page,
                other_index_number: 0,
                cascade_updates: false,
                cascade_deletes: true,
                cascade_set_null: false,
            }),
        };
        let child = db.create_table("Children", sample_columns(), vec![fk_spec]).unwrap();

        let mut child_row = Row::new();
        child_row.insert("Id", Value::Int32(1));
        child_row.insert("Name", Value::Text("kid".into()));
        let child_row_id = db.insert_row(&child, child_row).unwrap();

        db.delete_row(&parent, parent_row_id).unwrap();
        let err = child.read_row(child_row_id).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn catalog_entry_from_row_reads_fields() {
        let mut row = Row::new();
        row.insert("Id", Value::Int32(42));
        row.insert("Name", Value::Text("Widgets".into()));
        row.insert("Type", Value::Byte(1));
        row.insert("Flags", Value::Int32(0));
        row.insert("ParentId", Value::Int32(TABLES_PARENT_ID as i32));
        row.insert("PageNumber", Value::Int32(10));
        let entry = catalog_entry_from_row(&row).unwrap();
        assert_eq!(entry.id, 42);
        assert_eq!(entry.name, "Widgets");
        assert_eq!(entry.object_type, ObjectType::Table);
        assert_eq!(entry.page_number, 10);
    }
}
