//! Keeps secondary index b-trees consistent with table mutations.
//!
//! An index entry is a record of the indexed column values followed by the
//! rowid.  Table mutations report their before/after images here; the
//! maintainer derives the key deltas and drives the b-tree mutator.

use crate::btree::mutator::BTreeMutator;
use crate::btree::{Error, WritePager};
use crate::record::encode_record;
use crate::schema::{IndexInfo, TableInfo};
use crate::value::ColumnValue;

pub struct IndexMaintainer<'s> {
    table: &'s TableInfo,
    indexes: &'s [IndexInfo],
}

impl<'s> IndexMaintainer<'s> {
    pub fn new(table: &'s TableInfo, indexes: &'s [IndexInfo]) -> IndexMaintainer<'s> {
        IndexMaintainer { table, indexes }
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    // The index entry for one row: key columns then the rowid.  A
    // rowid-alias column reads as the rowid, matching how the table row
    // stores it as NULL.
    fn key_record(&self, index: &IndexInfo, values: &[ColumnValue], row_id: i64) -> Vec<u8> {
        let mut columns: Vec<ColumnValue> = index
            .columns
            .iter()
            .map(|c| {
                if self.table.rowid_alias == Some(c.table_ordinal) {
                    ColumnValue::Int(row_id)
                } else {
                    values[c.table_ordinal]
                }
            })
            .collect();
        columns.push(ColumnValue::Int(row_id));
        encode_record(&columns)
    }

    pub fn on_insert<P: WritePager>(
        &self,
        mutator: &mut BTreeMutator<P>,
        row_id: i64,
        after: &[ColumnValue],
    ) -> Result<(), Error> {
        for index in self.indexes {
            let key = self.key_record(index, after, row_id);
            mutator.index_insert(index.root_page, &key, &index.collations())?;
        }
        Ok(())
    }

    pub fn on_delete<P: WritePager>(
        &self,
        mutator: &mut BTreeMutator<P>,
        row_id: i64,
        before: &[ColumnValue],
    ) -> Result<(), Error> {
        for index in self.indexes {
            let key = self.key_record(index, before, row_id);
            if !mutator.index_delete(index.root_page, &key, &index.collations())? {
                log::warn!(
                    "index {} had no entry for rowid {} on delete",
                    index.name,
                    row_id
                );
            }
        }
        Ok(())
    }

    pub fn on_update<P: WritePager>(
        &self,
        mutator: &mut BTreeMutator<P>,
        row_id: i64,
        before: &[ColumnValue],
        after: &[ColumnValue],
    ) -> Result<(), Error> {
        for index in self.indexes {
            let old_key = self.key_record(index, before, row_id);
            let new_key = self.key_record(index, after, row_id);
            // Indexes whose referenced columns did not change are skipped.
            if old_key == new_key {
                continue;
            }
            if !mutator.index_delete(index.root_page, &old_key, &index.collations())? {
                log::warn!(
                    "index {} had no entry for rowid {} on update",
                    index.name,
                    row_id
                );
            }
            mutator.index_insert(index.root_page, &new_key, &index.collations())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::mutator::tests::MemWritePager;
    use crate::btree::{PageType, Pager};
    use crate::record::{compare_records, decode_record};
    use crate::schema::{ColumnInfo, IndexColumn};
    use crate::value::Collation;
    use crate::value::ColumnValue::{Int, Null, Text};
    use std::sync::Arc;

    fn test_table(root: u32) -> TableInfo {
        TableInfo {
            name: "t".into(),
            root_page: root,
            columns: vec![
                ColumnInfo {
                    name: "id".into(),
                    decl_type: Some("INTEGER".into()),
                    ordinal: 0,
                    collation: Collation::Binary,
                },
                ColumnInfo {
                    name: "k".into(),
                    decl_type: Some("TEXT".into()),
                    ordinal: 1,
                    collation: Collation::Binary,
                },
            ],
            rowid_alias: Some(0),
            primary_key: vec![0],
            without_rowid: false,
            sql: String::new(),
        }
    }

    fn test_index(root: u32) -> IndexInfo {
        IndexInfo {
            name: "idx_k".into(),
            table: "t".into(),
            root_page: root,
            unique: false,
            columns: vec![IndexColumn {
                name: "k".into(),
                table_ordinal: 1,
                collation: Collation::Binary,
                descending: false,
            }],
            sql: String::new(),
        }
    }

    struct ReadAdapter<'a>(&'a MemWritePager);

    impl<'a> Pager for ReadAdapter<'a> {
        fn page_size(&self) -> u32 {
            self.0.page_size
        }
        fn usable_size(&self) -> u32 {
            self.0.page_size
        }
        fn page(&self, pn: u32) -> Result<Arc<Vec<u8>>, Error> {
            Ok(Arc::new(self.0.pages[pn as usize - 1].clone()))
        }
        fn data_version(&self) -> u64 {
            0
        }
    }

    // The (key bytes, rowid) set in an index must equal the projection of
    // the table through the index columns.
    fn assert_index_consistent(pager: &MemWritePager, table: &TableInfo, index: &IndexInfo) {
        use crate::btree::cursor::BTreeCursor;
        use crate::btree::index_cursor::IndexBTreeCursor;

        let adapter = ReadAdapter(pager);
        let mut expected: Vec<Vec<u8>> = Vec::new();
        let mut table_cursor = BTreeCursor::new(&adapter, table.root_page);
        while table_cursor.move_next().unwrap() {
            let row_id = table_cursor.row_id().unwrap();
            let payload = table_cursor.payload().unwrap();
            let values = decode_record(payload).unwrap();
            let maintainer = IndexMaintainer::new(table, std::slice::from_ref(index));
            expected.push(maintainer.key_record(index, &values, row_id));
        }
        expected.sort_by(|a, b| compare_records(a, b, &index.collations()).unwrap());

        let mut actual: Vec<Vec<u8>> = Vec::new();
        let mut index_cursor = IndexBTreeCursor::new(&adapter, index.root_page, index.collations());
        while index_cursor.move_next().unwrap() {
            actual.push(index_cursor.payload().unwrap().to_vec());
        }
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_index_follows_insert_update_delete() {
        let mut pager = MemWritePager::new(512);
        let table_root = pager.new_root(PageType::TableLeaf);
        let index_root = pager.new_root(PageType::IndexLeaf);
        let table = test_table(table_root);
        let index = test_index(index_root);
        let indexes = vec![index.clone()];

        {
            let mut m = BTreeMutator::new(&mut pager);
            let maintainer = IndexMaintainer::new(&table, &indexes);
            for (rid, k) in [(1_i64, "b"), (2, "a"), (3, "c")] {
                let values = [Null, Text(k.as_bytes())];
                let payload = encode_record(&values);
                m.insert(table_root, rid, &payload).unwrap();
                let typed = [Int(rid), Text(k.as_bytes())];
                maintainer.on_insert(&mut m, rid, &typed).unwrap();
            }
        }
        assert_index_consistent(&pager, &table, &index);

        // Update row 2's key.
        {
            let mut m = BTreeMutator::new(&mut pager);
            let maintainer = IndexMaintainer::new(&table, &indexes);
            let before = [Int(2), Text(b"a")];
            let after = [Int(2), Text(b"z")];
            m.update(table_root, 2, &encode_record(&[Null, Text(b"z")])).unwrap();
            maintainer.on_update(&mut m, 2, &before, &after).unwrap();
        }
        assert_index_consistent(&pager, &table, &index);

        // Update that leaves the key unchanged takes the skip path.
        {
            let mut m = BTreeMutator::new(&mut pager);
            let maintainer = IndexMaintainer::new(&table, &indexes);
            let same = [Int(3), Text(b"c")];
            maintainer.on_update(&mut m, 3, &same, &same).unwrap();
        }
        assert_index_consistent(&pager, &table, &index);

        // Delete row 1.
        {
            let mut m = BTreeMutator::new(&mut pager);
            let maintainer = IndexMaintainer::new(&table, &indexes);
            let before = [Int(1), Text(b"b")];
            m.delete(table_root, 1).unwrap();
            maintainer.on_delete(&mut m, 1, &before).unwrap();
        }
        assert_index_consistent(&pager, &table, &index);
    }

    #[test]
    fn test_bulk_scramble_stays_consistent() {
        let mut pager = MemWritePager::new(512);
        let table_root = pager.new_root(PageType::TableLeaf);
        let index_root = pager.new_root(PageType::IndexLeaf);
        let table = test_table(table_root);
        let index = test_index(index_root);
        let indexes = vec![index.clone()];

        {
            let mut m = BTreeMutator::new(&mut pager);
            let maintainer = IndexMaintainer::new(&table, &indexes);
            for i in 0..150_i64 {
                let k = format!("key-{:03}", (i * 89) % 150);
                let payload = encode_record(&[Null, Text(k.as_bytes())]);
                m.insert(table_root, i + 1, &payload).unwrap();
                maintainer
                    .on_insert(&mut m, i + 1, &[Int(i + 1), Text(k.as_bytes())])
                    .unwrap();
            }
            // Thin the table out again.
            for i in (0..150_i64).step_by(3) {
                let k = format!("key-{:03}", (i * 89) % 150);
                m.delete(table_root, i + 1).unwrap();
                maintainer
                    .on_delete(&mut m, i + 1, &[Int(i + 1), Text(k.as_bytes())])
                    .unwrap();
            }
        }
        assert_index_consistent(&pager, &table, &index);
    }
}
