//! A cursor over a table b-tree: in-order traversal and rowid seek.
//!
//! The cursor keeps a descent breadcrumb (one frame per level) rather than
//! borrowing child iterators from parent pages; frames hold shared page
//! views so the pager's cache can recycle underneath.

use std::sync::Arc;

use super::cell::{self, Cell};
use super::header::PageHeader;
use super::{start_offset, Error, Pager, RowId};
use crate::vfs::PageNum;

// One level of the descent breadcrumb.  For interior pages `cell_idx` is
// the child most recently descended into (cell_count means the right
// child); for leaves it is the cell the cursor rests on.
struct Frame {
    pn: PageNum,
    page: Arc<Vec<u8>>,
    header: PageHeader,
    hdr_offset: usize,
    cell_idx: usize,
}

impl Frame {
    fn cell_offset(&self, i: usize) -> Result<usize, Error> {
        let off = super::header::cell_pointer(&self.page, self.hdr_offset, self.header.size(), i);
        if off < self.hdr_offset + self.header.size() || off >= self.page.len() {
            return Err(Error::corrupt(self.pn, "cell pointer out of range"));
        }
        Ok(off)
    }

    fn cell(&self, i: usize, usable_size: u32) -> Result<Cell<'_>, Error> {
        let off = self.cell_offset(i)?;
        cell::parse_cell(&self.page, off, self.header.page_type, usable_size, self.pn)
    }

    // The page number of child `i`; `cell_count` designates the right child.
    fn child(&self, i: usize, usable_size: u32) -> Result<PageNum, Error> {
        if i < self.header.cell_count {
            match self.cell(i, usable_size)? {
                Cell::TableInterior(c) => Ok(c.left_child),
                Cell::IndexInterior(c) => Ok(c.left_child),
                _ => Err(Error::corrupt(self.pn, "leaf cell on interior page")),
            }
        } else {
            self.header
                .right_child
                .ok_or_else(|| Error::corrupt(self.pn, "interior page missing right child"))
        }
    }
}

// Where the current row's payload lives.
enum PayloadLoc {
    // Fully inline: borrow straight out of the pinned leaf page.
    Inline {
        page: Arc<Vec<u8>>,
        start: usize,
        len: usize,
    },
    // Spilled: assembled from the overflow chain into a scratch buffer.
    Assembled(Vec<u8>),
}

struct CurrentRow {
    row_id: RowId,
    payload_size: usize,
    loc: PayloadLoc,
}

/// Walks an overflow chain and concatenates `inline` with the spilled
/// bytes.  Revisiting a page number means the chain is cyclic.
pub(crate) fn assemble_overflow<F>(
    payload_size: usize,
    inline: &[u8],
    first: PageNum,
    usable_size: u32,
    mut page: F,
) -> Result<Vec<u8>, Error>
where
    F: FnMut(PageNum) -> Result<Arc<Vec<u8>>, Error>,
{
    let mut out = Vec::with_capacity(payload_size);
    out.extend_from_slice(inline);
    let capacity = cell::overflow_capacity(usable_size);
    let mut visited: Vec<PageNum> = Vec::new();
    let mut next = first;
    while out.len() < payload_size {
        if next == 0 {
            return Err(Error::corrupt(first, "overflow chain ends early"));
        }
        if visited.contains(&next) {
            return Err(Error::OverflowCycle(next));
        }
        visited.push(next);
        let ovf = page(next)?;
        if ovf.len() < 4 {
            return Err(Error::corrupt(next, "overflow page too short"));
        }
        let take = capacity.min(payload_size - out.len());
        if 4 + take > ovf.len() {
            return Err(Error::corrupt(next, "overflow page shorter than usable size"));
        }
        out.extend_from_slice(&ovf[4..4 + take]);
        next = u32::from_be_bytes(ovf[0..4].try_into().unwrap());
    }
    Ok(out)
}

/// A forward cursor over one table b-tree.
pub struct BTreeCursor<'p> {
    pager: &'p dyn Pager,
    root: PageNum,
    stack: Vec<Frame>,
    started: bool,
    exhausted: bool,
    current: Option<CurrentRow>,
    snapshot_version: u64,
}

// Keeps runaway descents (a corrupt tree with a child cycle) from
// recursing forever; a healthy tree of depth 40 would be beyond huge.
const MAX_DEPTH: usize = 40;

impl<'p> BTreeCursor<'p> {
    pub fn new(pager: &'p dyn Pager, root: PageNum) -> BTreeCursor<'p> {
        let snapshot_version = pager.data_version();
        BTreeCursor {
            pager,
            root,
            stack: Vec::new(),
            started: false,
            exhausted: false,
            current: None,
            snapshot_version,
        }
    }

    /// Clears all navigation state and refreshes the staleness snapshot.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.started = false;
        self.exhausted = false;
        self.current = None;
        self.snapshot_version = self.pager.data_version();
    }

    /// True when a writer has committed since this cursor's snapshot was
    /// last refreshed by `reset` or `seek`.
    pub fn is_stale(&self) -> bool {
        self.snapshot_version < self.pager.data_version()
    }

    pub fn row_id(&self) -> Option<RowId> {
        self.current.as_ref().map(|c| c.row_id)
    }

    pub fn payload_size(&self) -> Option<usize> {
        self.current.as_ref().map(|c| c.payload_size)
    }

    /// The current row's full payload, valid while the cursor is positioned.
    pub fn payload(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|c| match &c.loc {
            PayloadLoc::Inline { page, start, len } => &page[*start..*start + *len],
            PayloadLoc::Assembled(buf) => &buf[..],
        })
    }

    fn push_frame(&mut self, pn: PageNum, cell_idx: usize) -> Result<(), Error> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(Error::corrupt(pn, "b-tree deeper than supported"));
        }
        let page = self.pager.page(pn)?;
        let hdr_offset = start_offset(pn);
        let header = PageHeader::parse(&page, hdr_offset, pn)?;
        self.stack.push(Frame {
            pn,
            page,
            header,
            hdr_offset,
            cell_idx,
        });
        Ok(())
    }

    // Pushes frames from `pn` down to the leftmost leaf of its subtree.
    fn descend_leftmost(&mut self, mut pn: PageNum) -> Result<(), Error> {
        loop {
            self.push_frame(pn, 0)?;
            let top = self.stack.last().unwrap();
            if top.header.page_type.is_leaf() {
                return Ok(());
            }
            pn = top.child(0, self.pager.usable_size())?;
        }
    }

    fn descend_rightmost(&mut self, mut pn: PageNum) -> Result<(), Error> {
        loop {
            let page = self.pager.page(pn)?;
            let header = PageHeader::parse(&page, start_offset(pn), pn)?;
            if header.page_type.is_leaf() {
                let idx = header.cell_count.saturating_sub(1);
                self.push_frame(pn, idx)?;
                return Ok(());
            }
            self.push_frame(pn, header.cell_count)?;
            pn = self.stack.last().unwrap().child(
                header.cell_count,
                self.pager.usable_size(),
            )?;
        }
    }

    fn load_current(&mut self) -> Result<(), Error> {
        let usable = self.pager.usable_size();
        let top = self.stack.last().unwrap();
        let c = match top.cell(top.cell_idx, usable)? {
            Cell::TableLeaf(c) => c,
            _ => return Err(Error::corrupt(top.pn, "non-leaf cell at cursor position")),
        };
        let loc = match c.overflow_page {
            None => {
                let off = top.cell_offset(top.cell_idx)?;
                // Inline payload starts after the two leading varints.
                let body_start = off + (c.size - c.inline_payload.len());
                PayloadLoc::Inline {
                    page: top.page.clone(),
                    start: body_start,
                    len: c.inline_payload.len(),
                }
            }
            Some(first) => {
                let pager = self.pager;
                PayloadLoc::Assembled(assemble_overflow(
                    c.payload_size,
                    c.inline_payload,
                    first,
                    usable,
                    |pn| pager.page(pn),
                )?)
            }
        };
        self.current = Some(CurrentRow {
            row_id: c.row_id,
            payload_size: c.payload_size,
            loc,
        });
        Ok(())
    }

    // Settles the cursor on the cell the top-of-stack indices point at,
    // popping exhausted leaves and advancing interior levels as needed.
    fn settle(&mut self) -> Result<bool, Error> {
        loop {
            enum Action {
                Exhausted,
                Load,
                Pop,
                Descend(PageNum),
            }
            let action = match self.stack.last() {
                None => Action::Exhausted,
                Some(top) if top.header.page_type.is_leaf() => {
                    if top.cell_idx < top.header.cell_count {
                        Action::Load
                    } else {
                        Action::Pop
                    }
                }
                Some(top) => {
                    if top.cell_idx + 1 <= top.header.cell_count {
                        Action::Descend(top.child(top.cell_idx + 1, self.pager.usable_size())?)
                    } else {
                        Action::Pop
                    }
                }
            };
            match action {
                Action::Exhausted => {
                    self.exhausted = true;
                    self.current = None;
                    return Ok(false);
                }
                Action::Load => {
                    self.load_current()?;
                    return Ok(true);
                }
                Action::Pop => {
                    self.stack.pop();
                }
                Action::Descend(child) => {
                    self.stack.last_mut().unwrap().cell_idx += 1;
                    self.descend_leftmost(child)?;
                }
            }
        }
    }

    /// Advances to the next row in rowid order.  Returns `false` once the
    /// tree is exhausted.
    ///
    /// The staleness snapshot is left alone: once a writer commits under
    /// a positioned cursor, `is_stale` stays `true` until `reset` or
    /// `seek`.
    pub fn move_next(&mut self) -> Result<bool, Error> {
        if self.exhausted {
            return Ok(false);
        }
        if !self.started {
            self.started = true;
            self.descend_leftmost(self.root)?;
        } else if let Some(top) = self.stack.last_mut() {
            top.cell_idx += 1;
        }
        self.settle()
    }

    /// Positions at the last row of the tree.  Returns `false` when empty.
    pub fn move_last(&mut self) -> Result<bool, Error> {
        self.reset();
        self.started = true;
        self.descend_rightmost(self.root)?;
        loop {
            let top = match self.stack.last() {
                None => {
                    self.exhausted = true;
                    return Ok(false);
                }
                Some(t) => t,
            };
            if top.header.page_type.is_leaf() && top.header.cell_count > 0 {
                self.load_current()?;
                return Ok(true);
            }
            // An empty rightmost leaf: walk back to the previous sibling.
            self.stack.pop();
            let parent = match self.stack.last_mut() {
                None => {
                    self.exhausted = true;
                    return Ok(false);
                }
                Some(p) => p,
            };
            if parent.cell_idx == 0 {
                self.stack.pop();
                if let Some(gp) = self.stack.last_mut() {
                    // Step the grandparent back one child on the next pass.
                    if gp.cell_idx == 0 {
                        continue;
                    }
                    gp.cell_idx -= 1;
                    let child = gp.child(gp.cell_idx, self.pager.usable_size())?;
                    self.descend_rightmost(child)?;
                }
                continue;
            }
            parent.cell_idx -= 1;
            let child = {
                let p = self.stack.last().unwrap();
                p.child(p.cell_idx, self.pager.usable_size())?
            };
            self.descend_rightmost(child)?;
        }
    }

    /// Descent-only binary search by rowid.  Returns `true` on an exact
    /// match; otherwise the cursor rests on the next larger row (if any)
    /// so a following `move_next` continues from there.
    pub fn seek(&mut self, row_id: RowId) -> Result<bool, Error> {
        self.reset();
        self.started = true;
        let usable = self.pager.usable_size();
        let mut pn = self.root;
        loop {
            self.push_frame(pn, 0)?;
            let top = self.stack.last_mut().unwrap();
            let count = top.header.cell_count;
            if top.header.page_type.is_leaf() {
                let mut lo = 0;
                let mut hi = count;
                let mut exact = false;
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    let key = match top.cell(mid, usable)? {
                        Cell::TableLeaf(c) => c.row_id,
                        _ => return Err(Error::corrupt(top.pn, "bad leaf cell")),
                    };
                    match key.cmp(&row_id) {
                        std::cmp::Ordering::Less => lo = mid + 1,
                        std::cmp::Ordering::Equal => {
                            lo = mid;
                            exact = true;
                            break;
                        }
                        std::cmp::Ordering::Greater => hi = mid,
                    }
                }
                top.cell_idx = lo;
                if exact {
                    self.load_current()?;
                    return Ok(true);
                }
                self.settle()?;
                return Ok(false);
            }
            // Interior: first cell whose key bounds row_id from above.
            let mut lo = 0;
            let mut hi = count;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let key = match top.cell(mid, usable)? {
                    Cell::TableInterior(c) => c.row_id,
                    _ => return Err(Error::corrupt(top.pn, "bad interior cell")),
                };
                if key < row_id {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            top.cell_idx = lo;
            pn = top.child(lo, usable)?;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::btree::cell::{build_table_interior, build_table_leaf};
    use crate::btree::PageType;

    // A pager over plain in-memory pages, no transform, fixed version.
    pub(crate) struct TestPager {
        pub pages: Vec<Arc<Vec<u8>>>, // pages[0] is page number 1
        pub page_size: u32,
        pub version: std::cell::Cell<u64>,
    }

    impl TestPager {
        pub fn new(page_size: u32) -> TestPager {
            TestPager {
                pages: Vec::new(),
                page_size,
                version: std::cell::Cell::new(0),
            }
        }

        // Appends a page built from `cells`, returning its page number.
        pub fn add_page(&mut self, page_type: PageType, cells: &[Vec<u8>], right_child: Option<u32>) -> u32 {
            let pn = self.pages.len() as u32 + 1;
            let off = super::super::start_offset(pn);
            let mut page = vec![0_u8; self.page_size as usize];
            let mut hdr = PageHeader::empty(page_type, self.page_size);
            hdr.right_child = right_child;
            let mut content = self.page_size as usize;
            for (i, c) in cells.iter().enumerate() {
                content -= c.len();
                page[content..content + c.len()].copy_from_slice(c);
                super::super::header::set_cell_pointer(&mut page, off, hdr.size(), i, content);
            }
            hdr.cell_count = cells.len();
            hdr.cell_content_start = content;
            hdr.write(&mut page, off);
            self.pages.push(Arc::new(page));
            pn
        }

        pub fn add_raw_page(&mut self, page: Vec<u8>) -> u32 {
            self.pages.push(Arc::new(page));
            self.pages.len() as u32
        }
    }

    impl Pager for TestPager {
        fn page_size(&self) -> u32 {
            self.page_size
        }
        fn usable_size(&self) -> u32 {
            self.page_size
        }
        fn page(&self, pn: PageNum) -> Result<Arc<Vec<u8>>, Error> {
            self.pages
                .get(pn as usize - 1)
                .cloned()
                .ok_or(Error::Source(crate::vfs::Error::PageNumberBeyondLimits(pn)))
        }
        fn data_version(&self) -> u64 {
            self.version.get()
        }
    }

    fn leaf_cells(rows: &[(i64, &[u8])], usable: u32) -> Vec<Vec<u8>> {
        rows.iter()
            .map(|(rid, p)| build_table_leaf(*rid, p, usable, 0))
            .collect()
    }

    #[test]
    fn test_scan_single_leaf() {
        let mut pager = TestPager::new(512);
        let root = pager.add_page(
            PageType::TableLeaf,
            &leaf_cells(&[(1, b"one"), (2, b"two"), (5, b"five")], 512),
            None,
        );
        let mut cur = BTreeCursor::new(&pager, root);
        let mut seen = Vec::new();
        while cur.move_next().unwrap() {
            seen.push((cur.row_id().unwrap(), cur.payload().unwrap().to_vec()));
        }
        assert_eq!(
            seen,
            vec![
                (1, b"one".to_vec()),
                (2, b"two".to_vec()),
                (5, b"five".to_vec())
            ]
        );
        assert!(!cur.move_next().unwrap());
    }

    #[test]
    fn test_scan_two_levels_in_order() {
        let mut pager = TestPager::new(512);
        let l1 = pager.add_page(PageType::TableLeaf, &leaf_cells(&[(1, b"a"), (2, b"b")], 512), None);
        let l2 = pager.add_page(PageType::TableLeaf, &leaf_cells(&[(3, b"c")], 512), None);
        let l3 = pager.add_page(PageType::TableLeaf, &leaf_cells(&[(7, b"d"), (9, b"e")], 512), None);
        let root = pager.add_page(
            PageType::TableInterior,
            &[build_table_interior(l1, 2), build_table_interior(l2, 3)],
            Some(l3),
        );
        let mut cur = BTreeCursor::new(&pager, root);
        let mut rows = Vec::new();
        while cur.move_next().unwrap() {
            rows.push(cur.row_id().unwrap());
        }
        assert_eq!(rows, vec![1, 2, 3, 7, 9]);
    }

    #[test]
    fn test_seek_exact_and_miss() {
        let mut pager = TestPager::new(512);
        let l1 = pager.add_page(PageType::TableLeaf, &leaf_cells(&[(1, b"a"), (4, b"b")], 512), None);
        let l2 = pager.add_page(PageType::TableLeaf, &leaf_cells(&[(9, b"c")], 512), None);
        let root = pager.add_page(
            PageType::TableInterior,
            &[build_table_interior(l1, 4)],
            Some(l2),
        );

        let mut cur = BTreeCursor::new(&pager, root);
        assert!(cur.seek(4).unwrap());
        assert_eq!(cur.row_id(), Some(4));

        // Miss lands on the next larger row.
        assert!(!cur.seek(5).unwrap());
        assert_eq!(cur.row_id(), Some(9));

        // Miss past the end exhausts.
        assert!(!cur.seek(100).unwrap());
        assert_eq!(cur.row_id(), None);

        // Seek continues to scan correctly afterwards.
        assert!(cur.seek(1).unwrap());
        assert!(cur.move_next().unwrap());
        assert_eq!(cur.row_id(), Some(4));
    }

    #[test]
    fn test_move_last() {
        let mut pager = TestPager::new(512);
        let l1 = pager.add_page(PageType::TableLeaf, &leaf_cells(&[(1, b"a")], 512), None);
        let l2 = pager.add_page(PageType::TableLeaf, &leaf_cells(&[(6, b"z")], 512), None);
        let root = pager.add_page(
            PageType::TableInterior,
            &[build_table_interior(l1, 1)],
            Some(l2),
        );
        let mut cur = BTreeCursor::new(&pager, root);
        assert!(cur.move_last().unwrap());
        assert_eq!(cur.row_id(), Some(6));
    }

    #[test]
    fn test_move_last_skips_empty_rightmost_leaf() {
        let mut pager = TestPager::new(512);
        let l1 = pager.add_page(PageType::TableLeaf, &leaf_cells(&[(1, b"a"), (2, b"b")], 512), None);
        let l2 = pager.add_page(PageType::TableLeaf, &[], None);
        let root = pager.add_page(
            PageType::TableInterior,
            &[build_table_interior(l1, 2)],
            Some(l2),
        );
        let mut cur = BTreeCursor::new(&pager, root);
        assert!(cur.move_last().unwrap());
        assert_eq!(cur.row_id(), Some(2));
    }

    #[test]
    fn test_empty_root_leaf() {
        let mut pager = TestPager::new(512);
        let root = pager.add_page(PageType::TableLeaf, &[], None);
        let mut cur = BTreeCursor::new(&pager, root);
        assert!(!cur.move_next().unwrap());
        assert!(!cur.move_last().unwrap());
        assert!(!cur.seek(1).unwrap());
    }

    #[test]
    fn test_overflow_payload_assembled() {
        let page_size = 512_u32;
        let mut pager = TestPager::new(page_size);
        let payload: Vec<u8> = (0..1000_u32).map(|i| (i % 251) as u8).collect();
        let inline = cell::table_inline_size(payload.len(), page_size);
        let spill = &payload[inline..];
        let cap = cell::overflow_capacity(page_size);

        // Two overflow pages: first full, second holds the tail.
        let mut ovf2 = vec![0_u8; page_size as usize];
        ovf2[4..4 + (spill.len() - cap)].copy_from_slice(&spill[cap..]);
        let ovf2_pn = pager.add_raw_page(ovf2);
        let mut ovf1 = vec![0_u8; page_size as usize];
        ovf1[0..4].copy_from_slice(&ovf2_pn.to_be_bytes());
        ovf1[4..4 + cap].copy_from_slice(&spill[..cap]);
        let ovf1_pn = pager.add_raw_page(ovf1);

        let cell_bytes = build_table_leaf(3, &payload, page_size, ovf1_pn);
        let root = pager.add_page(PageType::TableLeaf, &[cell_bytes], None);

        let mut cur = BTreeCursor::new(&pager, root);
        assert!(cur.move_next().unwrap());
        assert_eq!(cur.payload_size(), Some(1000));
        assert_eq!(cur.payload().unwrap(), &payload[..]);
    }

    #[test]
    fn test_overflow_cycle_detected() {
        let page_size = 512_u32;
        let mut pager = TestPager::new(page_size);
        let payload = vec![0x66_u8; 2000];
        // A self-referencing overflow page.
        let mut ovf = vec![0_u8; page_size as usize];
        ovf[0..4].copy_from_slice(&1_u32.to_be_bytes());
        let ovf_pn = pager.add_raw_page(ovf);
        assert_eq!(ovf_pn, 1);

        let cell_bytes = build_table_leaf(1, &payload, page_size, ovf_pn);
        let root = pager.add_page(PageType::TableLeaf, &[cell_bytes], None);
        let mut cur = BTreeCursor::new(&pager, root);
        assert!(matches!(cur.move_next(), Err(Error::OverflowCycle(1))));
    }

    #[test]
    fn test_staleness_snapshot() {
        let mut pager = TestPager::new(512);
        let root = pager.add_page(
            PageType::TableLeaf,
            &leaf_cells(&[(1, b"a"), (2, b"b")], 512),
            None,
        );
        let mut cur = BTreeCursor::new(&pager, root);
        assert!(cur.move_next().unwrap());
        assert!(!cur.is_stale());

        pager.version.set(3);
        assert!(cur.is_stale());

        // Advancing does NOT clear staleness; it holds until reset/seek.
        assert!(cur.move_next().unwrap());
        assert!(cur.is_stale());
        assert!(!cur.move_next().unwrap());
        assert!(cur.is_stale());

        // Seek refreshes the snapshot.
        cur.seek(1).unwrap();
        assert!(!cur.is_stale());
        pager.version.set(4);
        assert!(cur.is_stale());
        cur.reset();
        assert!(!cur.is_stale());
    }
}
