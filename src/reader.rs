//! The typed row reader: forward scan, rowid seek, lazy column access.
//!
//! A `Reader` wraps a b-tree cursor and decodes projected columns straight
//! from the current payload span.  Rowid tables scan their table b-tree;
//! without-rowid tables scan the index b-tree that stores their rows,
//! with an adapter that maps stored key order back to declared column
//! order and synthesises rowids.

use crate::btree::cursor::BTreeCursor;
use crate::btree::index_cursor::IndexBTreeCursor;
use crate::database::Database;
use crate::record::{encode_record, ValueIterator};
use crate::schema::TableInfo;
use crate::serial_type;
use crate::value::{Collation, ColumnValue};
use crate::{Error, Result};

/// Consulted between cursor advance and value exposure; rows it rejects
/// are silently skipped.  Row-level entitlement layers hang off this.
pub trait RowAccessEvaluator {
    fn allow_row(&self, row_id: i64, payload: &[u8]) -> bool;
}

enum Underlying<'db> {
    Table(BTreeCursor<'db>),
    WithoutRowid {
        cursor: IndexBTreeCursor<'db>,
        // Declared ordinal -> position in the stored key record.
        declared_to_stored: Vec<usize>,
        // Stored position of a lone INTEGER primary key, if any.
        int_pk_stored: Option<usize>,
        next_synthetic: i64,
    },
}

pub struct Reader<'db> {
    db: &'db Database,
    table: TableInfo,
    // Projected column ordinals, in caller order.
    projection: Vec<usize>,
    cursor: Underlying<'db>,
    // Per stored column: (serial type, body start, body len) in the payload.
    offsets: Vec<(i64, usize, usize)>,
    offsets_valid: bool,
    current_row_id: Option<i64>,
    evaluator: Option<Box<dyn RowAccessEvaluator + 'db>>,
}

// Stored layout of a without-rowid table: primary-key columns in key
// order, then the remaining columns in declaration order.
fn without_rowid_layout(table: &TableInfo) -> Vec<usize> {
    let mut stored: Vec<usize> = table.primary_key.clone();
    for c in &table.columns {
        if !table.primary_key.contains(&c.ordinal) {
            stored.push(c.ordinal);
        }
    }
    // Invert: declared ordinal -> stored position.
    let mut declared_to_stored = vec![0; stored.len()];
    for (pos, &ordinal) in stored.iter().enumerate() {
        declared_to_stored[ordinal] = pos;
    }
    declared_to_stored
}

impl<'db> Reader<'db> {
    pub(crate) fn new(
        db: &'db Database,
        table_name: &str,
        columns: Option<&[&str]>,
    ) -> Result<Reader<'db>> {
        let table = db
            .schema
            .table(table_name)
            .cloned()
            .or_else(|| {
                // The schema table itself is always readable by name.
                if table_name.eq_ignore_ascii_case("sqlite_schema")
                    || table_name.eq_ignore_ascii_case("sqlite_master")
                {
                    Some(crate::schema::Schema::schema_table_info())
                } else {
                    None
                }
            })
            .ok_or_else(|| Error::TableNotFound(table_name.to_string()))?;
        let projection = match columns {
            None => (0..table.columns.len()).collect(),
            Some(names) => names
                .iter()
                .map(|name| {
                    table
                        .column_ordinal(name)
                        .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
                })
                .collect::<Result<Vec<usize>>>()?,
        };
        let cursor = if table.without_rowid {
            let declared_to_stored = without_rowid_layout(&table);
            let int_pk_stored = match table.primary_key.as_slice() {
                [ord] => match &table.columns[*ord].decl_type {
                    Some(t) if t.eq_ignore_ascii_case("integer") => {
                        Some(declared_to_stored[*ord])
                    }
                    _ => None,
                },
                _ => None,
            };
            let collations: Vec<Collation> = table
                .primary_key
                .iter()
                .map(|&ord| table.columns[ord].collation)
                .collect();
            Underlying::WithoutRowid {
                cursor: IndexBTreeCursor::new(db, table.root_page, collations),
                declared_to_stored,
                int_pk_stored,
                next_synthetic: 0,
            }
        } else {
            Underlying::Table(BTreeCursor::new(db, table.root_page))
        };
        Ok(Reader {
            db,
            table,
            projection,
            cursor,
            offsets: Vec::new(),
            offsets_valid: false,
            current_row_id: None,
            evaluator: None,
        })
    }

    /// Installs a row-access evaluator for the remainder of this reader's
    /// life.  Rows it rejects disappear from the scan.
    pub fn set_evaluator(&mut self, evaluator: Box<dyn RowAccessEvaluator + 'db>) {
        self.evaluator = Some(evaluator);
    }

    fn payload_span(&self) -> Result<&[u8]> {
        let payload = match &self.cursor {
            Underlying::Table(c) => c.payload(),
            Underlying::WithoutRowid { cursor, .. } => cursor.payload(),
        };
        payload.ok_or(Error::NotPositioned)
    }

    /// Advances to the next visible row.  Returns `false` at the end.
    pub fn read(&mut self) -> Result<bool> {
        loop {
            self.offsets_valid = false;
            self.current_row_id = None;
            let advanced = match &mut self.cursor {
                Underlying::Table(c) => c.move_next()?,
                Underlying::WithoutRowid { cursor, .. } => cursor.move_next()?,
            };
            if !advanced {
                return Ok(false);
            }
            let row_id = match &mut self.cursor {
                Underlying::Table(c) => c.row_id().ok_or(Error::NotPositioned)?,
                Underlying::WithoutRowid {
                    cursor,
                    int_pk_stored,
                    next_synthetic,
                    ..
                } => {
                    let payload = cursor.payload().ok_or(Error::NotPositioned)?;
                    let from_pk = match int_pk_stored {
                        Some(pos) => crate::record::decode_column(payload, *pos)?
                            .as_int()
                            .copied(),
                        None => None,
                    };
                    match from_pk {
                        Some(v) => v,
                        None => {
                            *next_synthetic += 1;
                            *next_synthetic
                        }
                    }
                }
            };
            if let Some(evaluator) = &self.evaluator {
                let payload = self.payload_span()?;
                if !evaluator.allow_row(row_id, payload) {
                    continue;
                }
            }
            self.current_row_id = Some(row_id);
            return Ok(true);
        }
    }

    /// Positions at `row_id` exactly; `false` on a miss.  Rowid tables
    /// seek their b-tree; a without-rowid table with an integer primary
    /// key seeks by key.
    pub fn seek(&mut self, row_id: i64) -> Result<bool> {
        self.offsets_valid = false;
        self.current_row_id = None;
        let found = match &mut self.cursor {
            Underlying::Table(c) => c.seek(row_id)?,
            Underlying::WithoutRowid {
                cursor,
                int_pk_stored,
                ..
            } => {
                if *int_pk_stored != Some(0) {
                    return Err(Error::Unsupported(
                        "seek on a without-rowid table without an integer primary key",
                    ));
                }
                let probe = encode_record(&[ColumnValue::Int(row_id)]);
                cursor.seek_first(&probe)?
            }
        };
        if found {
            self.current_row_id = Some(row_id);
            if let Some(evaluator) = &self.evaluator {
                let payload = self.payload_span()?;
                if !evaluator.allow_row(row_id, payload) {
                    self.current_row_id = None;
                    return Ok(false);
                }
            }
        }
        Ok(found)
    }

    /// Resets all navigation state; the next `read` starts over.
    pub fn reset(&mut self) {
        self.offsets_valid = false;
        self.current_row_id = None;
        match &mut self.cursor {
            Underlying::Table(c) => c.reset(),
            Underlying::WithoutRowid {
                cursor,
                next_synthetic,
                ..
            } => {
                cursor.reset();
                *next_synthetic = 0;
            }
        }
    }

    /// True when a writer committed after this reader's last `reset` or
    /// `seek`; advancing with `read` does not clear it.
    pub fn is_stale(&self) -> bool {
        match &self.cursor {
            Underlying::Table(c) => c.is_stale(),
            Underlying::WithoutRowid { cursor, .. } => cursor.is_stale(),
        }
    }

    pub fn row_id(&self) -> Option<i64> {
        self.current_row_id
    }

    /// Number of projected columns.
    pub fn column_count(&self) -> usize {
        self.projection.len()
    }

    fn ensure_offsets(&mut self) -> Result<()> {
        if self.offsets_valid {
            return Ok(());
        }
        self.offsets.clear();
        let payload = match &self.cursor {
            Underlying::Table(c) => c.payload(),
            Underlying::WithoutRowid { cursor, .. } => cursor.payload(),
        }
        .ok_or(Error::NotPositioned)?;
        let mut body = 0;
        for item in ValueIterator::new(payload)? {
            let (st, bytes) = item?;
            let _ = bytes;
            let len = serial_type::content_size(st)?;
            self.offsets.push((st, body, len));
            body += len;
        }
        // Body offsets above are relative to the body start; shift them.
        let header_len = payload.len()
            - self
                .offsets
                .iter()
                .map(|(_, _, len)| len)
                .sum::<usize>();
        for o in &mut self.offsets {
            o.1 += header_len;
        }
        self.offsets_valid = true;
        Ok(())
    }

    // Stored-record position of projected column `i`.
    fn stored_position(&self, i: usize) -> Result<usize> {
        let ordinal = *self
            .projection
            .get(i)
            .ok_or_else(|| Error::ColumnNotFound(i.to_string()))?;
        Ok(match &self.cursor {
            Underlying::Table(_) => ordinal,
            Underlying::WithoutRowid {
                declared_to_stored, ..
            } => declared_to_stored[ordinal],
        })
    }

    // Decodes projected column `i` from the current payload.
    fn value(&mut self, i: usize) -> Result<(usize, ColumnValue<'_>)> {
        self.ensure_offsets()?;
        let pos = self.stored_position(i)?;
        let (st, start, len) = *self
            .offsets
            .get(pos)
            .ok_or_else(|| Error::ColumnNotFound(i.to_string()))?;
        let payload = self.payload_span()?;
        let value = serial_type::decode_value(st, &payload[start..start + len])?;
        Ok((self.projection[i], value))
    }

    pub fn is_null(&mut self, i: usize) -> Result<bool> {
        let alias = self.table.rowid_alias;
        let (ordinal, value) = self.value(i)?;
        // The rowid alias column stores NULL but reads as the rowid.
        if alias == Some(ordinal) && value.is_null() {
            return Ok(false);
        }
        Ok(value.is_null())
    }

    pub fn get_int64(&mut self, i: usize) -> Result<i64> {
        let row_id = self.current_row_id;
        let alias = self.table.rowid_alias;
        let (ordinal, value) = self.value(i)?;
        match value {
            ColumnValue::Int(v) => Ok(v),
            ColumnValue::Null if alias == Some(ordinal) => row_id.ok_or(Error::NotPositioned),
            _ => Err(Error::TypeMismatch),
        }
    }

    pub fn get_double(&mut self, i: usize) -> Result<f64> {
        let (_, value) = self.value(i)?;
        match value {
            ColumnValue::Real(v) => Ok(v),
            // Integral storage of a REAL column round-trips through int.
            ColumnValue::Int(v) => Ok(v as f64),
            _ => Err(Error::TypeMismatch),
        }
    }

    pub fn get_string(&mut self, i: usize) -> Result<&str> {
        let (_, value) = self.value(i)?;
        match value {
            ColumnValue::Text(bytes) => Ok(std::str::from_utf8(bytes)?),
            _ => Err(Error::TypeMismatch),
        }
    }

    pub fn get_blob(&mut self, i: usize) -> Result<&[u8]> {
        let (_, value) = self.value(i)?;
        match value {
            ColumnValue::Blob(bytes) => Ok(bytes),
            _ => Err(Error::TypeMismatch),
        }
    }

    /// The column's decoded value, whatever its storage class.
    pub fn get_value(&mut self, i: usize) -> Result<ColumnValue<'_>> {
        let row_id = self.current_row_id;
        let alias = self.table.rowid_alias;
        let (ordinal, value) = self.value(i)?;
        if value.is_null() && alias == Some(ordinal) {
            return Ok(ColumnValue::Int(row_id.ok_or(Error::NotPositioned)?));
        }
        Ok(value)
    }

    /// The database this reader scans.
    pub fn database(&self) -> &'db Database {
        self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::mutator::BTreeMutator;
    use crate::database::SourceHandle;
    use crate::transaction::{self, ShadowState, ShadowView};
    use crate::value::ColumnValue::{Int, Null, Text};
    use crate::Database;

    // Writes index entries straight into a without-rowid table's key tree
    // and commits, since the row writer targets rowid tables.
    fn fill_key_tree(db: &mut Database, root: u32, rows: &[Vec<ColumnValue>]) {
        let mut state = ShadowState::begin(db.header.clone(), db.source.page_count());
        let Database {
            source, transform, ..
        } = db;
        let base = match source {
            SourceHandle::Writable(b) => b,
            SourceHandle::ReadOnly(_) => unreachable!("test databases are writable"),
        };
        {
            let mut view = ShadowView {
                state: &mut state,
                base,
                transform: transform.as_ref(),
            };
            let mut m = BTreeMutator::new(&mut view);
            for row in rows {
                m.index_insert(root, &encode_record(row), &[Collation::Binary])
                    .unwrap();
            }
        }
        transaction::commit(&mut state, base, transform.as_ref()).unwrap();
    }

    #[test]
    fn test_without_rowid_reads_in_declared_order() {
        let mut db = Database::create_memory(4096).unwrap();
        {
            let mut w = db.writer().unwrap();
            w.create_table("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT) WITHOUT ROWID")
                .unwrap();
        }
        let root = db.schema().table("kv").unwrap().root_page;
        fill_key_tree(
            &mut db,
            root,
            &[
                vec![Text(b"beta"), Text(b"2")],
                vec![Text(b"alpha"), Text(b"1")],
            ],
        );

        let mut r = db.reader("kv").unwrap();
        assert!(r.read().unwrap());
        // Key order, synthetic rowids counting up per scan.
        assert_eq!(r.get_string(0).unwrap(), "alpha");
        assert_eq!(r.get_string(1).unwrap(), "1");
        assert_eq!(r.row_id(), Some(1));
        assert!(r.read().unwrap());
        assert_eq!(r.get_string(0).unwrap(), "beta");
        assert_eq!(r.row_id(), Some(2));
        assert!(!r.read().unwrap());

        // The counter restarts with the scan.
        r.reset();
        assert!(r.read().unwrap());
        assert_eq!(r.row_id(), Some(1));
    }

    #[test]
    fn test_without_rowid_integer_pk_rowid_and_seek() {
        let mut db = Database::create_memory(4096).unwrap();
        {
            let mut w = db.writer().unwrap();
            w.create_table("CREATE TABLE c (id INTEGER PRIMARY KEY, v TEXT) WITHOUT ROWID")
                .unwrap();
        }
        let root = db.schema().table("c").unwrap().root_page;
        fill_key_tree(
            &mut db,
            root,
            &[
                vec![Int(10), Text(b"ten")],
                vec![Int(20), Text(b"twenty")],
            ],
        );

        let mut r = db.reader("c").unwrap();
        assert!(r.read().unwrap());
        // The integer primary key doubles as the rowid.
        assert_eq!(r.row_id(), Some(10));
        assert!(r.seek(20).unwrap());
        assert_eq!(r.get_string(1).unwrap(), "twenty");
        assert!(!r.seek(15).unwrap());
    }

    #[test]
    fn test_without_rowid_pk_not_first_column() {
        let mut db = Database::create_memory(4096).unwrap();
        {
            let mut w = db.writer().unwrap();
            w.create_table("CREATE TABLE m (v TEXT, k TEXT PRIMARY KEY) WITHOUT ROWID")
                .unwrap();
        }
        let root = db.schema().table("m").unwrap().root_page;
        // Stored layout is key first: (k, v).
        fill_key_tree(&mut db, root, &[vec![Text(b"key1"), Text(b"value1")]]);

        let mut r = db.reader("m").unwrap();
        assert!(r.read().unwrap());
        // Declared order maps back over the stored order.
        assert_eq!(r.get_string(0).unwrap(), "value1");
        assert_eq!(r.get_string(1).unwrap(), "key1");
    }

    #[test]
    fn test_rowid_alias_column_reads_as_rowid() {
        let mut db = Database::create_memory(4096).unwrap();
        {
            let mut w = db.writer().unwrap();
            w.create_table("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
                .unwrap();
            w.insert("t", &[Null, Text(b"x")]).unwrap();
        }
        let mut r = db.reader("t").unwrap();
        assert!(r.read().unwrap());
        // Stored as NULL, surfaced as the rowid.
        assert!(!r.is_null(0).unwrap());
        assert_eq!(r.get_int64(0).unwrap(), 1);
        assert_eq!(r.get_value(0).unwrap(), ColumnValue::Int(1));
    }

    #[test]
    fn test_type_mismatch_errors() {
        let mut db = Database::create_memory(4096).unwrap();
        {
            let mut w = db.writer().unwrap();
            w.create_table("CREATE TABLE t (a INTEGER, b TEXT)").unwrap();
            w.insert("t", &[Int(5), Text(b"five")]).unwrap();
        }
        let mut r = db.reader("t").unwrap();
        assert!(r.read().unwrap());
        assert!(matches!(r.get_string(0), Err(Error::TypeMismatch)));
        assert!(matches!(r.get_int64(1), Err(Error::TypeMismatch)));
        assert!(matches!(r.get_blob(1), Err(Error::TypeMismatch)));
        // Ints widen to doubles.
        assert_eq!(r.get_double(0).unwrap(), 5.0);
    }
}
