//! Reads the schema table and materialises table, index and view metadata.
//!
//! Page 1 is always the root of the schema table, whose rows are
//! `(type, name, tbl_name, rootpage, sql)`.  The stored `sql` text is the
//! source of truth for column names and index definitions.

use crate::btree::cursor::BTreeCursor;
use crate::btree::{Error as BtreeError, Pager};
use crate::parser::{self, CreateStatement};
use crate::record;
use crate::value::Collation;
use crate::vfs::PageNum;

/// Root page of the schema b-tree, fixed by the file format.
pub const SCHEMA_ROOT_PAGE: PageNum = 1;

/// The schema of the schema table itself.
pub const SCHEMA_TABLE_SQL: &str =
    "CREATE TABLE sqlite_schema (type text, name text, tbl_name text, rootpage integer, sql text)";

const TYPE_COL: usize = 0;
const NAME_COL: usize = 1;
const TBL_NAME_COL: usize = 2;
const ROOTPAGE_COL: usize = 3;
const SQL_COL: usize = 4;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Btree(#[from] BtreeError),
    #[error(transparent)]
    Record(#[from] record::Error),
    #[error("Schema row is malformed: {0}.")]
    BadSchemaRow(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: Option<String>,
    pub ordinal: usize,
    pub collation: Collation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub root_page: PageNum,
    pub columns: Vec<ColumnInfo>,
    /// Ordinal of an `INTEGER PRIMARY KEY` column aliasing the rowid.
    pub rowid_alias: Option<usize>,
    /// Primary-key column ordinals, declaration order.
    pub primary_key: Vec<usize>,
    pub without_rowid: bool,
    pub sql: String,
}

impl TableInfo {
    pub fn column_ordinal(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexColumn {
    pub name: String,
    pub table_ordinal: usize,
    pub collation: Collation,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    pub root_page: PageNum,
    pub unique: bool,
    pub columns: Vec<IndexColumn>,
    pub sql: String,
}

impl IndexInfo {
    /// Per-key-column collations; the trailing rowid column compares
    /// binary, which is what comparators default to past this slice.
    pub fn collations(&self) -> Vec<Collation> {
        self.columns.iter().map(|c| c.collation).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewInfo {
    pub name: String,
    pub sql: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    pub tables: Vec<TableInfo>,
    pub indexes: Vec<IndexInfo>,
    pub views: Vec<ViewInfo>,
}

pub(crate) fn table_info_from_create(
    t: parser::CreateTable,
    root_page: PageNum,
    sql: String,
) -> TableInfo {
    let columns: Vec<ColumnInfo> = t
        .columns
        .iter()
        .enumerate()
        .map(|(ordinal, c)| ColumnInfo {
            name: c.name.clone(),
            decl_type: c.decl_type.clone(),
            ordinal,
            collation: c
                .collation
                .as_deref()
                .and_then(Collation::from_name)
                .unwrap_or_default(),
        })
        .collect();
    let primary_key: Vec<usize> = t
        .primary_key
        .iter()
        .filter_map(|name| columns.iter().position(|c| c.name.eq_ignore_ascii_case(name)))
        .collect();
    // The rowid alias: a lone INTEGER primary key on a rowid table.
    let rowid_alias = if !t.without_rowid && primary_key.len() == 1 {
        let ord = primary_key[0];
        match &columns[ord].decl_type {
            Some(ty) if ty.eq_ignore_ascii_case("integer") => Some(ord),
            _ => None,
        }
    } else {
        None
    };
    TableInfo {
        name: t.name,
        root_page,
        columns,
        rowid_alias,
        primary_key,
        without_rowid: t.without_rowid,
        sql,
    }
}

/// Binds a parsed index definition to its table, resolving column
/// ordinals and collations.  Columns the table does not have are dropped
/// with a warning.
pub(crate) fn resolve_index_info(
    parsed: parser::CreateIndex,
    table: &TableInfo,
    root_page: PageNum,
    sql: String,
) -> IndexInfo {
    let mut columns = Vec::with_capacity(parsed.columns.len());
    for c in &parsed.columns {
        let table_ordinal = match table.column_ordinal(&c.name) {
            Some(o) => o,
            None => {
                log::warn!("index {} names unknown column {}", parsed.name, c.name);
                continue;
            }
        };
        // Collation resolution: the index column's COLLATE wins, then the
        // table column's, then binary.
        let collation = c
            .collation
            .as_deref()
            .and_then(Collation::from_name)
            .unwrap_or(table.columns[table_ordinal].collation);
        columns.push(IndexColumn {
            name: c.name.clone(),
            table_ordinal,
            collation,
            descending: c.descending,
        });
    }
    IndexInfo {
        name: parsed.name,
        table: table.name.clone(),
        root_page,
        unique: parsed.unique,
        columns,
        sql,
    }
}

impl Schema {
    /// The synthetic entry for the schema table itself.
    pub fn schema_table_info() -> TableInfo {
        match parser::parse_create_statement(SCHEMA_TABLE_SQL) {
            Ok(CreateStatement::Table(t)) => {
                table_info_from_create(t, SCHEMA_ROOT_PAGE, SCHEMA_TABLE_SQL.to_string())
            }
            _ => unreachable!("the built-in schema DDL parses"),
        }
    }

    /// Scans page 1 and materialises every table, index and view.
    pub fn load(pager: &dyn Pager) -> Result<Schema, Error> {
        struct RawRow {
            kind: String,
            name: String,
            tbl_name: String,
            root_page: PageNum,
            sql: Option<String>,
        }

        let mut rows = Vec::new();
        let mut cursor = BTreeCursor::new(pager, SCHEMA_ROOT_PAGE);
        while cursor.move_next()? {
            let payload = cursor.payload().expect("cursor is positioned");
            let values = record::decode_record(payload)?;
            if values.len() < 5 {
                return Err(Error::BadSchemaRow("fewer than five columns"));
            }
            let text = |i: usize| -> Result<String, Error> {
                values[i]
                    .as_str()
                    .map(str::to_string)
                    .ok_or(Error::BadSchemaRow("expected text column"))
            };
            let kind = text(TYPE_COL)?;
            let name = text(NAME_COL)?;
            let tbl_name = text(TBL_NAME_COL)?;
            let root_page = values[ROOTPAGE_COL]
                .as_int()
                .copied()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or(Error::BadSchemaRow("bad root page"))?;
            let sql = values[SQL_COL].as_str().map(str::to_string);
            rows.push(RawRow {
                kind,
                name,
                tbl_name,
                root_page,
                sql,
            });
        }

        let mut schema = Schema::default();
        // Tables first: index definitions resolve against their columns.
        for row in rows.iter().filter(|r| r.kind == "table") {
            let sql = match &row.sql {
                Some(s) => s,
                None => continue,
            };
            match parser::parse_create_statement(sql) {
                Ok(CreateStatement::Table(t)) => {
                    schema
                        .tables
                        .push(table_info_from_create(t, row.root_page, sql.clone()));
                }
                Ok(_) => return Err(Error::BadSchemaRow("table row holds non-table DDL")),
                Err(e) => {
                    log::warn!("skipping table {} with unparsable DDL: {}", row.name, e);
                }
            }
        }
        for row in rows.iter().filter(|r| r.kind == "index") {
            let sql = match &row.sql {
                // Auto-indexes (UNIQUE constraints) store no DDL; without
                // it the key layout is unknown, so they are not maintained.
                None => {
                    log::warn!("skipping auto-index {} on {}", row.name, row.tbl_name);
                    continue;
                }
                Some(s) => s,
            };
            let parsed = match parser::parse_create_statement(sql) {
                Ok(CreateStatement::Index(i)) => i,
                Ok(_) => return Err(Error::BadSchemaRow("index row holds non-index DDL")),
                Err(e) => {
                    log::warn!("skipping index {} with unparsable DDL: {}", row.name, e);
                    continue;
                }
            };
            let table = match schema
                .tables
                .iter()
                .find(|t| t.name.eq_ignore_ascii_case(&parsed.table))
            {
                Some(t) => t,
                None => {
                    log::warn!("index {} names unknown table {}", parsed.name, parsed.table);
                    continue;
                }
            };
            schema
                .indexes
                .push(resolve_index_info(parsed, table, row.root_page, sql.clone()));
        }
        for row in rows.iter().filter(|r| r.kind == "view") {
            schema.views.push(ViewInfo {
                name: row.name.clone(),
                sql: row.sql.clone().unwrap_or_default(),
            });
        }
        Ok(schema)
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn index(&self, name: &str) -> Option<&IndexInfo> {
        self.indexes
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
    }

    pub fn indexes_for(&self, table: &str) -> Vec<&IndexInfo> {
        self.indexes
            .iter()
            .filter(|i| i.table.eq_ignore_ascii_case(table))
            .collect()
    }
}
