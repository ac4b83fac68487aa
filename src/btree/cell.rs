//! Parses and builds the four b-tree cell variants.
//!
//! Cell formats, from https://www.sqlite.org/fileformat.html#b_tree_pages:
//!
//! Table b-tree leaf cell (page type 0x0d):
//!   payload size varint | rowid varint | inline payload | overflow page u32 (omitted when all payload is inline)
//!
//! Table b-tree interior cell (page type 0x05):
//!   left child u32 | rowid varint
//!
//! Index b-tree leaf cell (page type 0x0a):
//!   payload size varint | inline payload | overflow page u32 (omitted when inline)
//!
//! Index b-tree interior cell (page type 0x02):
//!   left child u32 | payload size varint | inline payload | overflow page u32 (omitted when inline)
//!
//! How much payload stays inline is fixed by the format: with usable page
//! size U and total payload P, let M = ((U-12)*32/255)-23 and
//! X = U-35 for table leaves or ((U-12)*64/255)-23 for index cells, and
//! K = M + (P-M) mod (U-4).  The inline portion is P when P <= X, else K
//! when K <= X, else M.  The remainder spills to an overflow chain.

use byteorder::{BigEndian, ByteOrder};

use super::{Error, PageType, RowId};
use crate::varint::{read_varint, varint_len, write_varint, MAX_VARINT_LEN};
use crate::vfs::PageNum;

/// Largest payload stored fully inline on a table leaf page.
pub fn max_local_table(usable_size: u32) -> usize {
    usable_size as usize - 35
}

/// Largest payload stored fully inline in an index cell.
pub fn max_local_index(usable_size: u32) -> usize {
    ((usable_size as usize - 12) * 64 / 255) - 23
}

/// Minimum number of payload bytes embedded when a payload spills.
pub fn min_local(usable_size: u32) -> usize {
    ((usable_size as usize - 12) * 32 / 255) - 23
}

/// Payload bytes per overflow page: a 4-byte next pointer, then data.
pub fn overflow_capacity(usable_size: u32) -> usize {
    usable_size as usize - 4
}

fn inline_size(payload_size: usize, usable_size: u32, max_local: usize) -> usize {
    if payload_size <= max_local {
        return payload_size;
    }
    let m = min_local(usable_size);
    let k = m + (payload_size - m) % overflow_capacity(usable_size);
    if k <= max_local {
        k
    } else {
        m
    }
}

/// Inline bytes of a table-leaf payload of `payload_size` total bytes.
pub fn table_inline_size(payload_size: usize, usable_size: u32) -> usize {
    inline_size(payload_size, usable_size, max_local_table(usable_size))
}

/// Inline bytes of an index payload of `payload_size` total bytes.
pub fn index_inline_size(payload_size: usize, usable_size: u32) -> usize {
    inline_size(payload_size, usable_size, max_local_index(usable_size))
}

/// A table leaf cell: one row.
#[derive(Debug, Clone, PartialEq)]
pub struct TableLeafCell<'a> {
    pub payload_size: usize,
    pub row_id: RowId,
    pub inline_payload: &'a [u8],
    pub overflow_page: Option<PageNum>,
    /// Total serialised size of the cell.
    pub size: usize,
}

/// A table interior cell: a child pointer bounded by the largest rowid in
/// its subtree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableInteriorCell {
    pub left_child: PageNum,
    pub row_id: RowId,
    pub size: usize,
}

/// An index leaf cell: one key record.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexLeafCell<'a> {
    pub payload_size: usize,
    pub inline_payload: &'a [u8],
    pub overflow_page: Option<PageNum>,
    pub size: usize,
}

/// An index interior cell: a child pointer plus its own key record.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInteriorCell<'a> {
    pub left_child: PageNum,
    pub payload_size: usize,
    pub inline_payload: &'a [u8],
    pub overflow_page: Option<PageNum>,
    pub size: usize,
}

/// Any cell, tagged by the page type it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell<'a> {
    TableLeaf(TableLeafCell<'a>),
    TableInterior(TableInteriorCell),
    IndexLeaf(IndexLeafCell<'a>),
    IndexInterior(IndexInteriorCell<'a>),
}

impl<'a> Cell<'a> {
    pub fn size(&self) -> usize {
        match self {
            Cell::TableLeaf(c) => c.size,
            Cell::TableInterior(c) => c.size,
            Cell::IndexLeaf(c) => c.size,
            Cell::IndexInterior(c) => c.size,
        }
    }
}

// Parses `[payload_size varint][inline payload][overflow u32?]` starting at
// `pos`, shared by the three payload-bearing variants.
fn parse_payload<'a>(
    data: &'a [u8],
    mut pos: usize,
    usable_size: u32,
    index: bool,
    pn: PageNum,
) -> Result<(usize, &'a [u8], Option<PageNum>, usize), Error> {
    let (payload_size, n) = read_varint(&data[pos.min(data.len())..])?;
    let payload_size = usize::try_from(payload_size)
        .map_err(|_| Error::corrupt(pn, "negative payload size"))?;
    pos += n;
    let inline = if index {
        index_inline_size(payload_size, usable_size)
    } else {
        table_inline_size(payload_size, usable_size)
    };
    if pos + inline > data.len() {
        return Err(Error::corrupt(pn, "cell payload overruns page"));
    }
    let inline_payload = &data[pos..pos + inline];
    pos += inline;
    let overflow_page = if inline < payload_size {
        if pos + 4 > data.len() {
            return Err(Error::corrupt(pn, "cell overflow pointer overruns page"));
        }
        let ovf = BigEndian::read_u32(&data[pos..]);
        pos += 4;
        Some(ovf)
    } else {
        None
    };
    Ok((payload_size, inline_payload, overflow_page, pos))
}

/// Parses the cell starting at offset `pos` of `page`.  The slice extends
/// to the end of the page; the parsed `size` tells how much of it the cell
/// occupies.
pub fn parse_cell<'a>(
    page: &'a [u8],
    pos: usize,
    page_type: PageType,
    usable_size: u32,
    pn: PageNum,
) -> Result<Cell<'a>, Error> {
    if pos >= page.len() {
        return Err(Error::corrupt(pn, "cell pointer out of range"));
    }
    match page_type {
        PageType::TableLeaf => {
            let (payload_size, n) = read_varint(&page[pos..])?;
            let payload_size = usize::try_from(payload_size)
                .map_err(|_| Error::corrupt(pn, "negative payload size"))?;
            let (row_id, m) = read_varint(&page[pos + n..])?;
            let inline = table_inline_size(payload_size, usable_size);
            let body_start = pos + n + m;
            if body_start + inline > page.len() {
                return Err(Error::corrupt(pn, "cell payload overruns page"));
            }
            let inline_payload = &page[body_start..body_start + inline];
            let (overflow_page, end) = if inline < payload_size {
                if body_start + inline + 4 > page.len() {
                    return Err(Error::corrupt(pn, "cell overflow pointer overruns page"));
                }
                (
                    Some(BigEndian::read_u32(&page[body_start + inline..])),
                    body_start + inline + 4,
                )
            } else {
                (None, body_start + inline)
            };
            Ok(Cell::TableLeaf(TableLeafCell {
                payload_size,
                row_id,
                inline_payload,
                overflow_page,
                size: end - pos,
            }))
        }
        PageType::TableInterior => {
            if pos + 4 > page.len() {
                return Err(Error::corrupt(pn, "cell pointer out of range"));
            }
            let left_child = BigEndian::read_u32(&page[pos..]);
            let (row_id, n) = read_varint(&page[pos + 4..])?;
            Ok(Cell::TableInterior(TableInteriorCell {
                left_child,
                row_id,
                size: 4 + n,
            }))
        }
        PageType::IndexLeaf => {
            let (payload_size, inline_payload, overflow_page, end) =
                parse_payload(page, pos, usable_size, true, pn)?;
            Ok(Cell::IndexLeaf(IndexLeafCell {
                payload_size,
                inline_payload,
                overflow_page,
                size: end - pos,
            }))
        }
        PageType::IndexInterior => {
            if pos + 4 > page.len() {
                return Err(Error::corrupt(pn, "cell pointer out of range"));
            }
            let left_child = BigEndian::read_u32(&page[pos..]);
            let (payload_size, inline_payload, overflow_page, end) =
                parse_payload(page, pos + 4, usable_size, true, pn)?;
            Ok(Cell::IndexInterior(IndexInteriorCell {
                left_child,
                payload_size,
                inline_payload,
                overflow_page,
                size: end - pos,
            }))
        }
    }
}

/// Exact serialised size of a table leaf cell before building it, so the
/// mutator can space-check first.
pub fn table_leaf_cell_size(row_id: RowId, payload_size: usize, usable_size: u32) -> usize {
    let inline = table_inline_size(payload_size, usable_size);
    let overflow_ptr = if inline < payload_size { 4 } else { 0 };
    varint_len(payload_size as i64) + varint_len(row_id) + inline + overflow_ptr
}

pub fn table_interior_cell_size(row_id: RowId) -> usize {
    4 + varint_len(row_id)
}

pub fn index_leaf_cell_size(payload_size: usize, usable_size: u32) -> usize {
    let inline = index_inline_size(payload_size, usable_size);
    let overflow_ptr = if inline < payload_size { 4 } else { 0 };
    varint_len(payload_size as i64) + inline + overflow_ptr
}

pub fn index_interior_cell_size(payload_size: usize, usable_size: u32) -> usize {
    4 + index_leaf_cell_size(payload_size, usable_size)
}

/// Builds a table leaf cell.  When the payload spills, only its inline
/// prefix is embedded and `overflow_page` goes in the trailing pointer
/// slot; the caller allocates the chain (pass 0 while it is pending).
pub fn build_table_leaf(
    row_id: RowId,
    payload: &[u8],
    usable_size: u32,
    overflow_page: PageNum,
) -> Vec<u8> {
    let inline = table_inline_size(payload.len(), usable_size);
    let mut out = Vec::with_capacity(table_leaf_cell_size(row_id, payload.len(), usable_size));
    let mut varint_buf = [0_u8; MAX_VARINT_LEN];
    let n = write_varint(&mut varint_buf, payload.len() as i64);
    out.extend_from_slice(&varint_buf[..n]);
    let n = write_varint(&mut varint_buf, row_id);
    out.extend_from_slice(&varint_buf[..n]);
    out.extend_from_slice(&payload[..inline]);
    if inline < payload.len() {
        out.extend_from_slice(&overflow_page.to_be_bytes());
    }
    out
}

pub fn build_table_interior(left_child: PageNum, row_id: RowId) -> Vec<u8> {
    let mut out = Vec::with_capacity(table_interior_cell_size(row_id));
    out.extend_from_slice(&left_child.to_be_bytes());
    let mut varint_buf = [0_u8; MAX_VARINT_LEN];
    let n = write_varint(&mut varint_buf, row_id);
    out.extend_from_slice(&varint_buf[..n]);
    out
}

pub fn build_index_leaf(payload: &[u8], usable_size: u32, overflow_page: PageNum) -> Vec<u8> {
    let inline = index_inline_size(payload.len(), usable_size);
    let mut out = Vec::with_capacity(index_leaf_cell_size(payload.len(), usable_size));
    let mut varint_buf = [0_u8; MAX_VARINT_LEN];
    let n = write_varint(&mut varint_buf, payload.len() as i64);
    out.extend_from_slice(&varint_buf[..n]);
    out.extend_from_slice(&payload[..inline]);
    if inline < payload.len() {
        out.extend_from_slice(&overflow_page.to_be_bytes());
    }
    out
}

pub fn build_index_interior(
    left_child: PageNum,
    payload: &[u8],
    usable_size: u32,
    overflow_page: PageNum,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(index_interior_cell_size(payload.len(), usable_size));
    out.extend_from_slice(&left_child.to_be_bytes());
    out.extend_from_slice(&build_index_leaf(payload, usable_size, overflow_page));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_split_formula_spec_values() {
        // A 5000 byte payload on a 4096 byte page keeps 908 bytes inline
        // and spills exactly one overflow page.
        assert_eq!(max_local_table(4096), 4061);
        assert_eq!(min_local(4096), 489);
        assert_eq!(table_inline_size(5000, 4096), 908);
        assert_eq!(5000 - 908, overflow_capacity(4096));
    }

    #[test]
    fn test_inline_split_formula_bounds() {
        for usable in [512_u32, 1024, 4096, 65536] {
            let x_table = max_local_table(usable);
            let x_index = max_local_index(usable);
            for p in (0..100_000).step_by(97) {
                let t = table_inline_size(p, usable);
                assert!(t <= p, "inline {} exceeds payload {}", t, p);
                assert_eq!(t == p, p <= x_table);
                let i = index_inline_size(p, usable);
                assert_eq!(i == p, p <= x_index);
                if i != p {
                    assert!(i <= x_index);
                }
            }
        }
    }

    #[test]
    fn test_table_leaf_round_trip_inline() {
        let payload = vec![0x11_u8; 40];
        let cell = build_table_leaf(42, &payload, 512, 0);
        assert_eq!(cell.len(), table_leaf_cell_size(42, 40, 512));

        let mut page = vec![0_u8; 512];
        page[100..100 + cell.len()].copy_from_slice(&cell);
        match parse_cell(&page, 100, PageType::TableLeaf, 512, 2).unwrap() {
            Cell::TableLeaf(c) => {
                assert_eq!(c.row_id, 42);
                assert_eq!(c.payload_size, 40);
                assert_eq!(c.inline_payload, &payload[..]);
                assert_eq!(c.overflow_page, None);
                assert_eq!(c.size, cell.len());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_table_leaf_round_trip_overflow() {
        let payload = vec![0x22_u8; 5000];
        let cell = build_table_leaf(7, &payload, 4096, 99);
        assert_eq!(cell.len(), table_leaf_cell_size(7, 5000, 4096));

        let mut page = vec![0_u8; 4096];
        page[0..cell.len()].copy_from_slice(&cell);
        match parse_cell(&page, 0, PageType::TableLeaf, 4096, 3).unwrap() {
            Cell::TableLeaf(c) => {
                assert_eq!(c.payload_size, 5000);
                assert_eq!(c.inline_payload.len(), 908);
                assert_eq!(c.overflow_page, Some(99));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_table_interior_round_trip() {
        let cell = build_table_interior(12, 100_000);
        let mut page = vec![0_u8; 512];
        page[20..20 + cell.len()].copy_from_slice(&cell);
        match parse_cell(&page, 20, PageType::TableInterior, 512, 4).unwrap() {
            Cell::TableInterior(c) => {
                assert_eq!(c.left_child, 12);
                assert_eq!(c.row_id, 100_000);
                assert_eq!(c.size, cell.len());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_index_cells_round_trip() {
        let key = vec![0x33_u8; 60];
        let leaf = build_index_leaf(&key, 512, 0);
        assert_eq!(leaf.len(), index_leaf_cell_size(60, 512));
        let interior = build_index_interior(9, &key, 512, 0);
        assert_eq!(interior.len(), index_interior_cell_size(60, 512));

        let mut page = vec![0_u8; 512];
        page[0..leaf.len()].copy_from_slice(&leaf);
        match parse_cell(&page, 0, PageType::IndexLeaf, 512, 5).unwrap() {
            Cell::IndexLeaf(c) => {
                assert_eq!(c.inline_payload, &key[..]);
                assert_eq!(c.overflow_page, None);
            }
            other => panic!("wrong variant: {:?}", other),
        }

        let mut page = vec![0_u8; 512];
        page[0..interior.len()].copy_from_slice(&interior);
        match parse_cell(&page, 0, PageType::IndexInterior, 512, 6).unwrap() {
            Cell::IndexInterior(c) => {
                assert_eq!(c.left_child, 9);
                assert_eq!(c.inline_payload, &key[..]);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_index_cell_spills_sooner_than_table_cell() {
        // 512 usable: X is 477 for table leaves but only 102 for index cells.
        assert_eq!(max_local_table(512), 477);
        assert_eq!(max_local_index(512), 102);
        let key = vec![0x44_u8; 200];
        let cell = build_index_leaf(&key, 512, 31);
        let mut page = vec![0_u8; 512];
        page[0..cell.len()].copy_from_slice(&cell);
        match parse_cell(&page, 0, PageType::IndexLeaf, 512, 7).unwrap() {
            Cell::IndexLeaf(c) => {
                assert!(c.inline_payload.len() < 200);
                assert_eq!(c.overflow_page, Some(31));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_cell_out_of_range() {
        let page = vec![0_u8; 512];
        assert!(parse_cell(&page, 600, PageType::TableLeaf, 512, 8).is_err());
    }
}
