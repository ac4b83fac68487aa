//! Parses and builds the header of a b-tree page.
//!
//! A b-tree page is divided into regions in the following order:
//! 1. The 100-byte database file header (page 1 only)
//! 2. The 8 or 12 byte b-tree page header
//! 3. The cell pointer array
//! 4. Unallocated space
//! 5. The cell content area
//! 6. The reserved region

use byteorder::{BigEndian, ByteOrder};

use super::{Error, PageType};
use crate::vfs::PageNum;

/// The parsed b-tree page header.
#[derive(Debug, Clone, PartialEq)]
pub struct PageHeader {
    pub page_type: PageType,
    /// Offset of the first freeblock on the page, or zero.
    pub first_freeblock: usize,
    pub cell_count: usize,
    /// Start of the cell content area.  The stored value 0 means 65536.
    pub cell_content_start: usize,
    pub fragmented_free_bytes: u8,
    /// Interior pages only: the child holding keys above every cell.
    pub right_child: Option<PageNum>,
}

impl PageHeader {
    /// A header for a freshly formatted empty page.
    pub fn empty(page_type: PageType, usable_size: u32) -> PageHeader {
        PageHeader {
            page_type,
            first_freeblock: 0,
            cell_count: 0,
            cell_content_start: usable_size as usize,
            fragmented_free_bytes: 0,
            right_child: if page_type.is_leaf() { None } else { Some(0) },
        }
    }

    /// Size of the serialised header: 12 for interior pages (the right
    /// child pointer), 8 for leaves.
    pub fn size(&self) -> usize {
        if self.page_type.is_leaf() {
            8
        } else {
            12
        }
    }

    /// Parses the header found at `offset` within `page` (100 on page 1,
    /// 0 elsewhere).  `pn` is used in error reports only.
    pub fn parse(page: &[u8], offset: usize, pn: PageNum) -> Result<PageHeader, Error> {
        if page.len() < offset + 8 {
            return Err(Error::corrupt(pn, "page too short for b-tree header"));
        }
        let page_type = PageType::from_byte(page[offset], pn)?;
        let first_freeblock = BigEndian::read_u16(&page[offset + 1..]) as usize;
        let cell_count = BigEndian::read_u16(&page[offset + 3..]) as usize;
        let cell_content_start = match BigEndian::read_u16(&page[offset + 5..]) {
            0 => 65536,
            x => x as usize,
        };
        let fragmented_free_bytes = page[offset + 7];
        let right_child = if page_type.is_leaf() {
            None
        } else {
            if page.len() < offset + 12 {
                return Err(Error::corrupt(pn, "interior page too short for right child"));
            }
            Some(BigEndian::read_u32(&page[offset + 8..]))
        };

        let hdr = PageHeader {
            page_type,
            first_freeblock,
            cell_count,
            cell_content_start,
            fragmented_free_bytes,
            right_child,
        };
        if offset + hdr.size() + 2 * cell_count > page.len() {
            return Err(Error::corrupt(pn, "cell pointer array overruns page"));
        }
        if cell_content_start < offset + hdr.size() + 2 * cell_count && cell_count > 0 {
            return Err(Error::corrupt(pn, "cell content overlaps pointer array"));
        }
        Ok(hdr)
    }

    /// Serialises the header at `offset` within `page`.
    pub fn write(&self, page: &mut [u8], offset: usize) {
        page[offset] = self.page_type.to_byte();
        BigEndian::write_u16(&mut page[offset + 1..], self.first_freeblock as u16);
        BigEndian::write_u16(&mut page[offset + 3..], self.cell_count as u16);
        let stored_content_start = if self.cell_content_start == 65536 {
            0
        } else {
            self.cell_content_start as u16
        };
        BigEndian::write_u16(&mut page[offset + 5..], stored_content_start);
        page[offset + 7] = self.fragmented_free_bytes;
        if let Some(rc) = self.right_child {
            BigEndian::write_u32(&mut page[offset + 8..], rc);
        }
    }
}

/// Reads the `i`-th entry of the cell pointer array.
pub fn cell_pointer(page: &[u8], offset: usize, hdr_size: usize, i: usize) -> usize {
    BigEndian::read_u16(&page[offset + hdr_size + 2 * i..]) as usize
}

/// Writes the `i`-th entry of the cell pointer array.
pub fn set_cell_pointer(page: &mut [u8], offset: usize, hdr_size: usize, i: usize, ptr: usize) {
    BigEndian::write_u16(&mut page[offset + hdr_size + 2 * i..], ptr as u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip_leaf() {
        let hdr = PageHeader {
            page_type: PageType::TableLeaf,
            first_freeblock: 0,
            cell_count: 3,
            cell_content_start: 400,
            fragmented_free_bytes: 2,
            right_child: None,
        };
        let mut page = vec![0_u8; 512];
        hdr.write(&mut page, 0);
        assert_eq!(PageHeader::parse(&page, 0, 2).unwrap(), hdr);
        assert_eq!(hdr.size(), 8);
    }

    #[test]
    fn test_header_round_trip_interior_at_db_header_offset() {
        let hdr = PageHeader {
            page_type: PageType::TableInterior,
            first_freeblock: 0,
            cell_count: 1,
            cell_content_start: 500,
            fragmented_free_bytes: 0,
            right_child: Some(7),
        };
        let mut page = vec![0_u8; 512];
        hdr.write(&mut page, 100);
        assert_eq!(PageHeader::parse(&page, 100, 1).unwrap(), hdr);
        assert_eq!(hdr.size(), 12);
    }

    #[test]
    fn test_header_content_start_sentinel() {
        let hdr = PageHeader::empty(PageType::TableLeaf, 65536);
        let mut page = vec![0_u8; 65536];
        hdr.write(&mut page, 0);
        // 65536 is stored as the sentinel 0.
        assert_eq!(&page[5..7], &[0, 0]);
        assert_eq!(
            PageHeader::parse(&page, 0, 2).unwrap().cell_content_start,
            65536
        );
    }

    #[test]
    fn test_header_rejects_bad_type() {
        let mut page = vec![0_u8; 512];
        page[0] = 0x42;
        assert!(PageHeader::parse(&page, 0, 9).is_err());
    }

    #[test]
    fn test_cell_pointer_accessors() {
        let mut page = vec![0_u8; 512];
        set_cell_pointer(&mut page, 0, 8, 0, 500);
        set_cell_pointer(&mut page, 0, 8, 1, 480);
        assert_eq!(cell_pointer(&page, 0, 8, 0), 500);
        assert_eq!(cell_pointer(&page, 0, 8, 1), 480);
    }
}
