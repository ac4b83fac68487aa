//! A scan-optimised reader over a table b-tree.
//!
//! One descent collects the ordered leaf page numbers up front; iteration
//! then walks cells with no navigation stack at all.  Supports `move_next`
//! and `reset` only — random access stays with [`super::cursor::BTreeCursor`].

use std::sync::Arc;

use streaming_iterator::StreamingIterator;

use super::cell::Cell;
use super::cursor::assemble_overflow;
use super::header::PageHeader;
use super::{start_offset, Error, PageType, Pager, RowId};
use crate::vfs::PageNum;

const MAX_DEPTH: usize = 40;

pub struct LeafPageScanner<'p> {
    pager: &'p dyn Pager,
    leaves: Vec<PageNum>,
    leaf_idx: usize,
    cell_idx: usize,
    loaded: Option<(PageNum, Arc<Vec<u8>>, PageHeader)>,
    current: Option<(RowId, usize, PayloadLoc)>,
}

enum PayloadLoc {
    Inline { start: usize, len: usize },
    Assembled(Vec<u8>),
}

// Collects leaf page numbers of the subtree at `pn`, left to right.
fn collect_leaves(
    pager: &dyn Pager,
    pn: PageNum,
    out: &mut Vec<PageNum>,
    depth: usize,
) -> Result<(), Error> {
    if depth >= MAX_DEPTH {
        return Err(Error::corrupt(pn, "b-tree deeper than supported"));
    }
    let page = pager.page(pn)?;
    let hdr_offset = start_offset(pn);
    let header = PageHeader::parse(&page, hdr_offset, pn)?;
    match header.page_type {
        PageType::TableLeaf => {
            out.push(pn);
            Ok(())
        }
        PageType::TableInterior => {
            for i in 0..header.cell_count {
                let off = super::header::cell_pointer(&page, hdr_offset, header.size(), i);
                match super::cell::parse_cell(&page, off, header.page_type, pager.usable_size(), pn)? {
                    Cell::TableInterior(c) => collect_leaves(pager, c.left_child, out, depth + 1)?,
                    _ => return Err(Error::corrupt(pn, "bad interior cell")),
                }
            }
            let right = header
                .right_child
                .ok_or_else(|| Error::corrupt(pn, "interior page missing right child"))?;
            collect_leaves(pager, right, out, depth + 1)
        }
        _ => Err(Error::corrupt(pn, "index page inside table b-tree")),
    }
}

impl<'p> LeafPageScanner<'p> {
    pub fn new(pager: &'p dyn Pager, root: PageNum) -> Result<LeafPageScanner<'p>, Error> {
        let mut leaves = Vec::new();
        collect_leaves(pager, root, &mut leaves, 0)?;
        Ok(LeafPageScanner {
            pager,
            leaves,
            leaf_idx: 0,
            cell_idx: 0,
            loaded: None,
            current: None,
        })
    }

    /// Rewinds to the first row.  The leaf list collected at construction
    /// is kept; a scanner does not track concurrent writers.
    pub fn reset(&mut self) {
        self.leaf_idx = 0;
        self.cell_idx = 0;
        self.loaded = None;
        self.current = None;
    }

    pub fn row_id(&self) -> Option<RowId> {
        self.current.as_ref().map(|c| c.0)
    }

    pub fn payload_size(&self) -> Option<usize> {
        self.current.as_ref().map(|c| c.1)
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, _, loc)| match loc {
            PayloadLoc::Inline { start, len } => {
                let (_, page, _) = self.loaded.as_ref().expect("inline payload pins its leaf");
                &page[*start..*start + *len]
            }
            PayloadLoc::Assembled(buf) => &buf[..],
        })
    }

    fn ensure_leaf_loaded(&mut self) -> Result<(), Error> {
        let pn = self.leaves[self.leaf_idx];
        if self.loaded.as_ref().map(|(loaded_pn, _, _)| *loaded_pn) == Some(pn) {
            return Ok(());
        }
        let page = self.pager.page(pn)?;
        let header = PageHeader::parse(&page, start_offset(pn), pn)?;
        self.loaded = Some((pn, page, header));
        Ok(())
    }

    pub fn move_next(&mut self) -> Result<bool, Error> {
        if self.current.is_some() {
            self.cell_idx += 1;
        }
        self.current = None;
        loop {
            if self.leaf_idx >= self.leaves.len() {
                return Ok(false);
            }
            self.ensure_leaf_loaded()?;
            let (pn, page, header) = self.loaded.as_ref().unwrap();
            if self.cell_idx >= header.cell_count {
                self.leaf_idx += 1;
                self.cell_idx = 0;
                self.loaded = None;
                continue;
            }
            let hdr_offset = start_offset(*pn);
            let off = super::header::cell_pointer(page, hdr_offset, header.size(), self.cell_idx);
            let usable = self.pager.usable_size();
            let c = match super::cell::parse_cell(page, off, header.page_type, usable, *pn)? {
                Cell::TableLeaf(c) => c,
                _ => return Err(Error::corrupt(*pn, "non-leaf cell in leaf page")),
            };
            let loc = match c.overflow_page {
                None => PayloadLoc::Inline {
                    start: off + (c.size - c.inline_payload.len()),
                    len: c.inline_payload.len(),
                },
                Some(first) => {
                    let pager = self.pager;
                    PayloadLoc::Assembled(assemble_overflow(
                        c.payload_size,
                        c.inline_payload,
                        first,
                        usable,
                        |p| pager.page(p),
                    )?)
                }
            };
            self.current = Some((c.row_id, c.payload_size, loc));
            return Ok(true);
        }
    }
}

/// Adapts a scanner to `StreamingIterator`, yielding owned
/// `(row_id, payload)` items.  A decoding failure parks in `error` and
/// ends the stream.
pub struct RowStream<'p> {
    scanner: LeafPageScanner<'p>,
    item: Option<(RowId, Vec<u8>)>,
    error: Option<Error>,
}

impl<'p> RowStream<'p> {
    pub fn new(scanner: LeafPageScanner<'p>) -> RowStream<'p> {
        RowStream {
            scanner,
            item: None,
            error: None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
}

impl<'p> StreamingIterator for RowStream<'p> {
    type Item = (RowId, Vec<u8>);

    #[inline]
    fn advance(&mut self) {
        if self.error.is_some() {
            self.item = None;
            return;
        }
        self.item = match self.scanner.move_next() {
            Ok(true) => Some((
                self.scanner.row_id().unwrap(),
                self.scanner.payload().unwrap().to_vec(),
            )),
            Ok(false) => None,
            Err(e) => {
                self.error = Some(e);
                None
            }
        };
    }

    #[inline]
    fn get(&self) -> Option<&Self::Item> {
        self.item.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::cell::{build_table_interior, build_table_leaf};
    use crate::btree::cursor::tests::TestPager;

    fn build_two_level(pager: &mut TestPager) -> u32 {
        let cells1 = vec![
            build_table_leaf(1, b"a", 512, 0),
            build_table_leaf(2, b"b", 512, 0),
        ];
        let l1 = pager.add_page(PageType::TableLeaf, &cells1, None);
        let cells2 = vec![build_table_leaf(5, b"c", 512, 0)];
        let l2 = pager.add_page(PageType::TableLeaf, &cells2, None);
        pager.add_page(
            PageType::TableInterior,
            &[build_table_interior(l1, 2)],
            Some(l2),
        )
    }

    #[test]
    fn test_scanner_visits_all_rows_in_order() {
        let mut pager = TestPager::new(512);
        let root = build_two_level(&mut pager);
        let mut scan = LeafPageScanner::new(&pager, root).unwrap();
        assert_eq!(scan.leaves.len(), 2);

        let mut rows = Vec::new();
        while scan.move_next().unwrap() {
            rows.push((scan.row_id().unwrap(), scan.payload().unwrap().to_vec()));
        }
        assert_eq!(
            rows,
            vec![(1, b"a".to_vec()), (2, b"b".to_vec()), (5, b"c".to_vec())]
        );

        scan.reset();
        assert!(scan.move_next().unwrap());
        assert_eq!(scan.row_id(), Some(1));
    }

    #[test]
    fn test_row_stream_adapter() {
        let mut pager = TestPager::new(512);
        let root = build_two_level(&mut pager);
        let scan = LeafPageScanner::new(&pager, root).unwrap();
        let mut stream = RowStream::new(scan);

        let mut ids = Vec::new();
        stream.advance();
        while let Some((rid, _)) = stream.get() {
            ids.push(*rid);
            stream.advance();
        }
        assert_eq!(ids, vec![1, 2, 5]);
        assert!(stream.error().is_none());
    }
}
