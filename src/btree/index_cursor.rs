//! A cursor over an index b-tree: key-ordered traversal and key seek.
//!
//! Unlike table b-trees, index interior pages carry real entries, so the
//! in-order walk interleaves them between their child subtrees, and a
//! cursor can come to rest on an interior cell.

use std::sync::Arc;

use super::cell::{self, Cell};
use super::cursor::assemble_overflow;
use super::header::PageHeader;
use super::{start_offset, Error, Pager, RowId};
use crate::record::compare_records;
use crate::value::Collation;
use crate::vfs::PageNum;

// For interior frames, `cell_idx` is the next cell of this page to yield.
// `InChild` means the walk is (or is about to be) inside the subtree left
// of that cell; `AtCell` means the cursor rests on the cell itself.
#[derive(Debug, Clone, Copy, PartialEq)]
enum FrameState {
    InChild,
    AtCell,
}

struct Frame {
    pn: PageNum,
    page: Arc<Vec<u8>>,
    header: PageHeader,
    hdr_offset: usize,
    cell_idx: usize,
    state: FrameState,
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

    fn child(&self, i: usize, usable_size: u32) -> Result<PageNum, Error> {
        if i < self.header.cell_count {
            match self.cell(i, usable_size)? {
                Cell::IndexInterior(c) => Ok(c.left_child),
                _ => Err(Error::corrupt(self.pn, "expected index interior cell")),
            }
        } else {
            self.header
                .right_child
                .ok_or_else(|| Error::corrupt(self.pn, "interior page missing right child"))
        }
    }
}

enum PayloadLoc {
    Inline {
        page: Arc<Vec<u8>>,
        start: usize,
        len: usize,
    },
    Assembled(Vec<u8>),
}

struct CurrentKey {
    payload_size: usize,
    loc: PayloadLoc,
}

/// A forward cursor over one index b-tree, comparing record keys under the
/// index's per-column collations.
pub struct IndexBTreeCursor<'p> {
    pager: &'p dyn Pager,
    root: PageNum,
    collations: Vec<Collation>,
    stack: Vec<Frame>,
    started: bool,
    exhausted: bool,
    current: Option<CurrentKey>,
    snapshot_version: u64,
}

const MAX_DEPTH: usize = 40;

impl<'p> IndexBTreeCursor<'p> {
    pub fn new(pager: &'p dyn Pager, root: PageNum, collations: Vec<Collation>) -> Self {
        let snapshot_version = pager.data_version();
        IndexBTreeCursor {
            pager,
            root,
            collations,
            stack: Vec::new(),
            started: false,
            exhausted: false,
            current: None,
            snapshot_version,
        }
    }

    pub fn reset(&mut self) {
        self.stack.clear();
        self.started = false;
        self.exhausted = false;
        self.current = None;
        self.snapshot_version = self.pager.data_version();
    }

    /// True when a writer has committed since this cursor's snapshot was
    /// last refreshed by `reset` or `seek_first`.
    pub fn is_stale(&self) -> bool {
        self.snapshot_version < self.pager.data_version()
    }

    /// The current entry's full key record.
    pub fn payload(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|c| match &c.loc {
            PayloadLoc::Inline { page, start, len } => &page[*start..*start + *len],
            PayloadLoc::Assembled(buf) => &buf[..],
        })
    }

    pub fn payload_size(&self) -> Option<usize> {
        self.current.as_ref().map(|c| c.payload_size)
    }

    /// The rowid stored as the trailing column of the current entry, when
    /// it is an integer (it always is for entries the engine writes).
    pub fn row_id_suffix(&self) -> Result<Option<RowId>, Error> {
        let payload = match self.payload() {
            None => return Ok(None),
            Some(p) => p,
        };
        let n = crate::record::column_count(payload)?;
        if n == 0 {
            return Ok(None);
        }
        let v = crate::record::decode_column(payload, n - 1)?;
        Ok(v.as_int().copied())
    }

    fn push_frame(&mut self, pn: PageNum, cell_idx: usize) -> Result<(), Error> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(Error::corrupt(pn, "b-tree deeper than supported"));
        }
        let page = self.pager.page(pn)?;
        let hdr_offset = start_offset(pn);
        let header = PageHeader::parse(&page, hdr_offset, pn)?;
        if header.page_type.is_table() {
            return Err(Error::corrupt(pn, "table page inside index b-tree"));
        }
        self.stack.push(Frame {
            pn,
            page,
            header,
            hdr_offset,
            cell_idx,
            state: FrameState::InChild,
        });
        Ok(())
    }

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

    // Loads the payload of the cell the top frame rests on.
    fn load_current(&mut self) -> Result<(), Error> {
        let usable = self.pager.usable_size();
        let top = self.stack.last().unwrap();
        let (payload_size, inline, overflow, off, size) = match top.cell(top.cell_idx, usable)? {
            Cell::IndexLeaf(c) => {
                let off = top.cell_offset(top.cell_idx)?;
                (c.payload_size, c.inline_payload, c.overflow_page, off, c.size)
            }
            Cell::IndexInterior(c) => {
                let off = top.cell_offset(top.cell_idx)?;
                (c.payload_size, c.inline_payload, c.overflow_page, off, c.size)
            }
            _ => return Err(Error::corrupt(top.pn, "table cell in index b-tree")),
        };
        let loc = match overflow {
            None => {
                let overflow_ptr = 0;
                let body_start = off + (size - inline.len() - overflow_ptr);
                PayloadLoc::Inline {
                    page: top.page.clone(),
                    start: body_start,
                    len: inline.len(),
                }
            }
            Some(first) => {
                let inline = inline.to_vec();
                let pager = self.pager;
                PayloadLoc::Assembled(assemble_overflow(
                    payload_size,
                    &inline,
                    first,
                    usable,
                    |pn| pager.page(pn),
                )?)
            }
        };
        self.current = Some(CurrentKey { payload_size, loc });
        Ok(())
    }

    // Settles on the next entry, assuming the top frame is freshly
    // descended or freshly advanced.
    fn settle(&mut self) -> Result<bool, Error> {
        loop {
            enum Action {
                Exhausted,
                LoadLeaf,
                YieldInterior,
                Pop,
            }
            let action = match self.stack.last() {
                None => Action::Exhausted,
                Some(top) if top.header.page_type.is_leaf() => {
                    if top.cell_idx < top.header.cell_count {
                        Action::LoadLeaf
                    } else {
                        Action::Pop
                    }
                }
                Some(top) => {
                    debug_assert_eq!(top.state, FrameState::InChild);
                    if top.cell_idx < top.header.cell_count {
                        Action::YieldInterior
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
                Action::LoadLeaf => {
                    self.load_current()?;
                    return Ok(true);
                }
                Action::YieldInterior => {
                    self.stack.last_mut().unwrap().state = FrameState::AtCell;
                    self.load_current()?;
                    return Ok(true);
                }
                Action::Pop => {
                    self.stack.pop();
                }
            }
        }
    }

    /// Advances in key order.  Returns `false` once exhausted.
    ///
    /// The staleness snapshot is left alone: once a writer commits under
    /// a positioned cursor, `is_stale` stays `true` until `reset` or
    /// `seek_first`.
    pub fn move_next(&mut self) -> Result<bool, Error> {
        if self.exhausted {
            return Ok(false);
        }
        if !self.started {
            self.started = true;
            self.descend_leftmost(self.root)?;
            return self.settle();
        }
        enum Advance {
            Leaf,
            Interior(PageNum),
            Nothing,
        }
        let advance = match self.stack.last() {
            None => Advance::Nothing,
            Some(top) if top.header.page_type.is_leaf() => Advance::Leaf,
            Some(top) => {
                debug_assert_eq!(top.state, FrameState::AtCell);
                Advance::Interior(top.child(top.cell_idx + 1, self.pager.usable_size())?)
            }
        };
        match advance {
            Advance::Nothing => {
                self.exhausted = true;
                Ok(false)
            }
            Advance::Leaf => {
                self.stack.last_mut().unwrap().cell_idx += 1;
                self.settle()
            }
            Advance::Interior(child) => {
                let top = self.stack.last_mut().unwrap();
                top.cell_idx += 1;
                top.state = FrameState::InChild;
                self.descend_leftmost(child)?;
                self.settle()
            }
        }
    }

    // The full key record of cell `i` on the top frame, assembling its
    // overflow chain when present.
    fn key_of(&self, frame: &Frame, i: usize) -> Result<Vec<u8>, Error> {
        let usable = self.pager.usable_size();
        let (payload_size, inline, overflow) = match frame.cell(i, usable)? {
            Cell::IndexLeaf(c) => (c.payload_size, c.inline_payload, c.overflow_page),
            Cell::IndexInterior(c) => (c.payload_size, c.inline_payload, c.overflow_page),
            _ => return Err(Error::corrupt(frame.pn, "table cell in index b-tree")),
        };
        match overflow {
            None => Ok(inline.to_vec()),
            Some(first) => {
                let pager = self.pager;
                assemble_overflow(payload_size, inline, first, usable, |pn| pager.page(pn))
            }
        }
    }

    /// Seeks the first entry whose key is >= `key` under the cursor's
    /// collations.  Returns `true` when that entry matches `key` exactly
    /// (prefix match for a probe with fewer columns); otherwise the cursor
    /// rests on the next larger entry, or exhausts.
    pub fn seek_first(&mut self, key: &[u8]) -> Result<bool, Error> {
        self.reset();
        self.started = true;
        let usable = self.pager.usable_size();
        let mut pn = self.root;
        loop {
            self.push_frame(pn, 0)?;
            let top_index = self.stack.len() - 1;
            let count = self.stack[top_index].header.cell_count;
            let is_leaf = self.stack[top_index].header.page_type.is_leaf();

            // First cell whose stored key is >= the probe.
            let mut lo = 0;
            let mut hi = count;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let stored = self.key_of(&self.stack[top_index], mid)?;
                if compare_records(key, &stored, &self.collations)? == std::cmp::Ordering::Greater {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            if is_leaf {
                self.stack[top_index].cell_idx = lo;
                if !self.settle()? {
                    return Ok(false);
                }
                let payload = self.payload().expect("cursor is positioned");
                return Ok(compare_records(key, payload, &self.collations)?
                    == std::cmp::Ordering::Equal);
            }
            // Descend the subtree left of the bounding cell; equal entries
            // in that subtree come first in key order.
            self.stack[top_index].cell_idx = lo;
            pn = self.stack[top_index].child(lo, usable)?;
        }
    }
}
