//! The row writer: typed mutation with transactional atomicity.
//!
//! Each mutating call runs inside a transaction.  Without an explicit
//! `begin_transaction`, every call opens one, commits before returning,
//! and rolls back on error; batching work inside one explicit transaction
//! turns N commits into one, which is the entire trick to fast bulk
//! loads.

use crate::btree::mutator::BTreeMutator;
use crate::btree::PageType;
use crate::database::{Database, SourceHandle};
use crate::index::IndexMaintainer;
use crate::parser::{self, CreateStatement};
use crate::record::{decode_record, encode_record};
use crate::schema::{
    resolve_index_info, table_info_from_create, IndexInfo, Schema, TableInfo, SCHEMA_ROOT_PAGE,
};
use crate::transaction::{self, ShadowState, ShadowView};
use crate::value::ColumnValue;
use crate::{Error, Result};

pub struct Writer<'db> {
    db: &'db mut Database,
    shadow: Option<ShadowState>,
    schema_dirty: bool,
}

impl<'db> Writer<'db> {
    pub(crate) fn new(db: &'db mut Database) -> Writer<'db> {
        Writer {
            db,
            shadow: None,
            schema_dirty: false,
        }
    }

    /// Starts an explicit transaction.  Mutations go through the returned
    /// handle; dropping it without `commit` rolls everything back.
    pub fn begin_transaction(&mut self) -> Result<Transaction<'_, 'db>> {
        self.begin_internal()?;
        Ok(Transaction {
            writer: self,
            finished: false,
        })
    }

    /// Inserts a row, assigning the rowid (or taking it from an INTEGER
    /// PRIMARY KEY value).  Returns the rowid.
    pub fn insert(&mut self, table: &str, values: &[ColumnValue]) -> Result<i64> {
        self.with_auto_tx(|w| w.do_insert(table, values, None))
    }

    /// Inserts many rows inside one transaction.
    pub fn insert_batch(&mut self, table: &str, rows: &[Vec<ColumnValue>]) -> Result<Vec<i64>> {
        self.with_auto_tx(|w| {
            rows.iter()
                .map(|values| w.do_insert(table, values, None))
                .collect()
        })
    }

    /// Replaces the row `row_id`; `false` when it does not exist.
    pub fn update(&mut self, table: &str, row_id: i64, values: &[ColumnValue]) -> Result<bool> {
        self.with_auto_tx(|w| w.do_update(table, row_id, values))
    }

    /// Deletes the row `row_id`; `false` when it does not exist.
    pub fn delete(&mut self, table: &str, row_id: i64) -> Result<bool> {
        self.with_auto_tx(|w| w.do_delete(table, row_id))
    }

    /// Creates a table from its `CREATE TABLE` text: a fresh root page
    /// plus a schema-table row.
    pub fn create_table(&mut self, sql: &str) -> Result<()> {
        let parsed = match parser::parse_create_statement(sql)? {
            CreateStatement::Table(t) => t,
            _ => {
                return Err(Error::Parse(parser::Error::Syntax(
                    "expected a CREATE TABLE statement".into(),
                )))
            }
        };
        if self.db.schema.table(&parsed.name).is_some() {
            return Err(Error::TableExists(parsed.name));
        }
        let root = self.with_auto_tx(|w| {
            let mut view = w.view();
            let root = {
                use crate::btree::WritePager;
                view.allocate_page()?
            };
            let mut m = BTreeMutator::new(&mut view);
            // A without-rowid table stores its rows in an index b-tree
            // keyed by primary key.
            let root_type = if parsed.without_rowid {
                PageType::IndexLeaf
            } else {
                PageType::TableLeaf
            };
            m.format_page(root, root_type)?;
            let schema_rowid = m.max_row_id(SCHEMA_ROOT_PAGE)?.unwrap_or(0) + 1;
            let row = encode_record(&[
                ColumnValue::Text(b"table"),
                ColumnValue::Text(parsed.name.as_bytes()),
                ColumnValue::Text(parsed.name.as_bytes()),
                ColumnValue::Int(root as i64),
                ColumnValue::Text(sql.as_bytes()),
            ]);
            m.insert(SCHEMA_ROOT_PAGE, schema_rowid, &row)?;
            view.state.header.schema_cookie += 1;
            Ok(root)
        })?;
        log::info!("created table {} with root page {}", parsed.name, root);
        self.db
            .schema
            .tables
            .push(table_info_from_create(parsed, root, sql.to_string()));
        self.schema_dirty = true;
        Ok(())
    }

    /// Creates an index from its `CREATE INDEX` text and backfills it
    /// from the table's existing rows.
    pub fn create_index(&mut self, sql: &str) -> Result<()> {
        let parsed = match parser::parse_create_statement(sql)? {
            CreateStatement::Index(i) => i,
            _ => {
                return Err(Error::Parse(parser::Error::Syntax(
                    "expected a CREATE INDEX statement".into(),
                )))
            }
        };
        if self.db.schema.index(&parsed.name).is_some() {
            return Err(Error::IndexExists(parsed.name));
        }
        let table = self
            .db
            .schema
            .table(&parsed.table)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(parsed.table.clone()))?;
        let name = parsed.name.clone();
        let info_root = self.with_auto_tx(|w| {
            let mut view = w.view();
            let root = {
                use crate::btree::WritePager;
                view.allocate_page()?
            };
            let mut m = BTreeMutator::new(&mut view);
            m.format_page(root, PageType::IndexLeaf)?;
            let schema_rowid = m.max_row_id(SCHEMA_ROOT_PAGE)?.unwrap_or(0) + 1;
            let row = encode_record(&[
                ColumnValue::Text(b"index"),
                ColumnValue::Text(parsed.name.as_bytes()),
                ColumnValue::Text(parsed.table.as_bytes()),
                ColumnValue::Int(root as i64),
                ColumnValue::Text(sql.as_bytes()),
            ]);
            m.insert(SCHEMA_ROOT_PAGE, schema_rowid, &row)?;

            // Backfill from the table's current rows.
            let info = resolve_index_info(parsed.clone(), &table, root, sql.to_string());
            let indexes = std::slice::from_ref(&info);
            let maintainer = IndexMaintainer::new(&table, indexes);
            for (row_id, payload) in m.scan_all(table.root_page)? {
                let values = decode_record(&payload)?;
                maintainer.on_insert(&mut m, row_id, &values)?;
            }
            view.state.header.schema_cookie += 1;
            Ok(info)
        })?;
        log::info!("created index {} with root page {}", name, info_root.root_page);
        self.db.schema.indexes.push(info_root);
        self.schema_dirty = true;
        Ok(())
    }

    /// Pushes buffered writes to durable storage.  The engine never syncs
    /// on its own; durability policy is the caller's.
    pub fn flush(&mut self) -> Result<()> {
        match &mut self.db.source {
            SourceHandle::Writable(base) => {
                base.flush()?;
                Ok(())
            }
            SourceHandle::ReadOnly(_) => Err(Error::ReadOnly),
        }
    }

    // ------------------------------------------------------------------
    // Internals.
    // ------------------------------------------------------------------

    fn begin_internal(&mut self) -> Result<()> {
        if self.shadow.is_some() {
            return Err(Error::TransactionAlreadyOpen);
        }
        self.shadow = Some(ShadowState::begin(
            self.db.header.clone(),
            self.db.source.page_count(),
        ));
        Ok(())
    }

    fn commit_internal(&mut self) -> Result<()> {
        let mut state = match self.shadow.take() {
            None => return Ok(()),
            Some(s) => s,
        };
        let base = match &mut self.db.source {
            SourceHandle::Writable(b) => b,
            SourceHandle::ReadOnly(_) => return Err(Error::ReadOnly),
        };
        match transaction::commit(&mut state, base, self.db.transform.as_ref()) {
            Ok((dirty, header)) => {
                self.db.header = header;
                self.db.invalidate_pages(&dirty);
                self.schema_dirty = false;
                Ok(())
            }
            Err(e) => {
                // Keep the shadow so the caller can roll back explicitly.
                self.shadow = Some(state);
                Err(e.into())
            }
        }
    }

    fn rollback_internal(&mut self) {
        self.shadow = None;
        if self.schema_dirty {
            // Optimistic in-memory schema registrations are unwound by
            // re-reading the committed schema.
            match Schema::load(&*self.db) {
                Ok(schema) => self.db.schema = schema,
                Err(e) => log::error!("schema reload after rollback failed: {}", e),
            }
            self.schema_dirty = false;
        }
    }

    fn with_auto_tx<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let implicit = self.shadow.is_none();
        if implicit {
            self.begin_internal()?;
        }
        match f(self) {
            Ok(value) => {
                if implicit {
                    self.commit_internal()?;
                }
                Ok(value)
            }
            Err(e) => {
                if implicit {
                    self.rollback_internal();
                }
                Err(e)
            }
        }
    }

    fn view(&mut self) -> ShadowView<'_> {
        let state = self
            .shadow
            .as_mut()
            .expect("mutating calls run inside a transaction");
        let base = match &mut self.db.source {
            SourceHandle::Writable(b) => b,
            SourceHandle::ReadOnly(_) => unreachable!("writers require a writable source"),
        };
        ShadowView {
            state,
            base,
            transform: self.db.transform.as_ref(),
        }
    }

    fn table_and_indexes(&self, table: &str) -> Result<(TableInfo, Vec<IndexInfo>)> {
        let info = self
            .db
            .schema
            .table(table)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        if info.without_rowid {
            return Err(Error::Unsupported("mutating a without-rowid table"));
        }
        let indexes = self
            .db
            .schema
            .indexes_for(table)
            .into_iter()
            .cloned()
            .collect();
        Ok((info, indexes))
    }

    fn check_arity(table: &TableInfo, values: &[ColumnValue]) -> Result<()> {
        if values.len() != table.columns.len() {
            return Err(Error::ColumnCountMismatch {
                expected: table.columns.len(),
                got: values.len(),
            });
        }
        Ok(())
    }

    // The record image of a row: the rowid-alias column stores NULL.
    fn record_values<'v>(table: &TableInfo, values: &'v [ColumnValue]) -> Vec<ColumnValue<'v>> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                if table.rowid_alias == Some(i) {
                    ColumnValue::Null
                } else {
                    *v
                }
            })
            .collect()
    }

    fn do_insert(
        &mut self,
        table: &str,
        values: &[ColumnValue],
        explicit_row_id: Option<i64>,
    ) -> Result<i64> {
        let (info, indexes) = self.table_and_indexes(table)?;
        Self::check_arity(&info, values)?;
        let payload = encode_record(&Self::record_values(&info, values));

        let mut view = self.view();
        let mut m = BTreeMutator::new(&mut view);
        let row_id = match explicit_row_id {
            Some(r) => r,
            None => match info
                .rowid_alias
                .and_then(|ord| values[ord].as_int().copied())
            {
                Some(v) => v,
                None => m.max_row_id(info.root_page)?.unwrap_or(0) + 1,
            },
        };
        m.insert(info.root_page, row_id, &payload)?;
        let maintainer = IndexMaintainer::new(&info, &indexes);
        maintainer.on_insert(&mut m, row_id, values)?;
        Ok(row_id)
    }

    fn do_update(&mut self, table: &str, row_id: i64, values: &[ColumnValue]) -> Result<bool> {
        let (info, indexes) = self.table_and_indexes(table)?;
        Self::check_arity(&info, values)?;
        let payload = encode_record(&Self::record_values(&info, values));

        let mut view = self.view();
        let mut m = BTreeMutator::new(&mut view);
        let before_payload = match m.read_row(info.root_page, row_id)? {
            None => return Ok(false),
            Some(p) => p,
        };
        m.update(info.root_page, row_id, &payload)?;
        if !indexes.is_empty() {
            let before = decode_record(&before_payload)?;
            let maintainer = IndexMaintainer::new(&info, &indexes);
            maintainer.on_update(&mut m, row_id, &before, values)?;
        }
        Ok(true)
    }

    fn do_delete(&mut self, table: &str, row_id: i64) -> Result<bool> {
        let (info, indexes) = self.table_and_indexes(table)?;

        let mut view = self.view();
        let mut m = BTreeMutator::new(&mut view);
        let before_payload = match m.read_row(info.root_page, row_id)? {
            None => return Ok(false),
            Some(p) => p,
        };
        m.delete(info.root_page, row_id)?;
        if !indexes.is_empty() {
            let before = decode_record(&before_payload)?;
            let maintainer = IndexMaintainer::new(&info, &indexes);
            maintainer.on_delete(&mut m, row_id, &before)?;
        }
        Ok(true)
    }
}

/// An explicit transaction.  Mutations accumulate in the shadow overlay;
/// `commit` makes them durable in one flush, and dropping the handle
/// without committing rolls them back.
pub struct Transaction<'w, 'db> {
    writer: &'w mut Writer<'db>,
    finished: bool,
}

impl<'w, 'db> Transaction<'w, 'db> {
    pub fn insert(&mut self, table: &str, values: &[ColumnValue]) -> Result<i64> {
        self.writer.do_insert(table, values, None)
    }

    pub fn insert_batch(&mut self, table: &str, rows: &[Vec<ColumnValue>]) -> Result<Vec<i64>> {
        rows.iter()
            .map(|values| self.writer.do_insert(table, values, None))
            .collect()
    }

    pub fn update(&mut self, table: &str, row_id: i64, values: &[ColumnValue]) -> Result<bool> {
        self.writer.do_update(table, row_id, values)
    }

    pub fn delete(&mut self, table: &str, row_id: i64) -> Result<bool> {
        self.writer.do_delete(table, row_id)
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.writer.commit_internal()
    }

    pub fn rollback(mut self) {
        self.finished = true;
        self.writer.rollback_internal();
    }
}

impl<'w, 'db> Drop for Transaction<'w, 'db> {
    fn drop(&mut self) {
        if !self.finished {
            self.writer.rollback_internal();
        }
    }
}
