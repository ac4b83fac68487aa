//! The freelist: pages released by deletes and merges, kept for reuse.
//!
//! The list is a chain of trunk pages.  A trunk holds
//! `[next trunk: u32][leaf count N: u32][N leaf page numbers: u32 ...]`,
//! all big-endian.  Leaves hold nothing.  The database header stores the
//! head trunk and the total page count of the list.

use byteorder::{BigEndian, ByteOrder};

use crate::btree::{Error, WritePager};
use crate::vfs::PageNum;

// Leaf slots available on one trunk page.
fn trunk_capacity(usable_size: u32) -> usize {
    usable_size as usize / 4 - 2
}

/// Takes one page off the freelist, or `None` when it is empty.
/// `head` / `count` are the database-header fields, updated in place.
pub fn pop_page<P: WritePager>(
    pager: &mut P,
    head: &mut PageNum,
    count: &mut u32,
) -> Result<Option<PageNum>, Error> {
    if *head == 0 {
        return Ok(None);
    }
    let trunk = *head;
    let (next, n) = {
        let page = pager.page(trunk)?;
        (BigEndian::read_u32(&page[0..4]), BigEndian::read_u32(&page[4..8]))
    };
    if n as usize > trunk_capacity(pager.usable_size()) {
        return Err(Error::corrupt(trunk, "freelist trunk leaf count out of range"));
    }
    if n > 0 {
        // Take the last leaf slot.
        let leaf = {
            let page = pager.page(trunk)?;
            BigEndian::read_u32(&page[8 + 4 * (n as usize - 1)..])
        };
        if leaf == 0 {
            return Err(Error::corrupt(trunk, "freelist leaf slot is zero"));
        }
        let page = pager.page_mut(trunk)?;
        BigEndian::write_u32(&mut page[4..8], n - 1);
        *count -= 1;
        log::trace!("freelist pop leaf {}", leaf);
        return Ok(Some(leaf));
    }
    // No leaves left: the trunk page itself is the allocation.
    *head = next;
    *count -= 1;
    log::trace!("freelist pop trunk {}", trunk);
    Ok(Some(trunk))
}

/// Puts `pn` on the freelist.
pub fn push_page<P: WritePager>(
    pager: &mut P,
    head: &mut PageNum,
    count: &mut u32,
    pn: PageNum,
) -> Result<(), Error> {
    if *head != 0 {
        let n = {
            let page = pager.page(*head)?;
            BigEndian::read_u32(&page[4..8])
        };
        if (n as usize) < trunk_capacity(pager.usable_size()) {
            let page = pager.page_mut(*head)?;
            BigEndian::write_u32(&mut page[8 + 4 * n as usize..], pn);
            BigEndian::write_u32(&mut page[4..8], n + 1);
            *count += 1;
            log::trace!("freelist push leaf {}", pn);
            return Ok(());
        }
    }
    // Start a new trunk in front of the chain.
    let old_head = *head;
    let page = pager.page_mut(pn)?;
    for b in page.iter_mut() {
        *b = 0;
    }
    BigEndian::write_u32(&mut page[0..4], old_head);
    BigEndian::write_u32(&mut page[4..8], 0);
    *head = pn;
    *count += 1;
    log::trace!("freelist push trunk {}", pn);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::mutator::tests::MemWritePager;

    fn grow(pager: &mut MemWritePager, n: usize) -> Vec<PageNum> {
        (0..n)
            .map(|_| {
                use crate::btree::WritePager;
                pager.allocate_page().unwrap()
            })
            .collect()
    }

    #[test]
    fn test_push_pop_round_trip() {
        let mut pager = MemWritePager::new(512);
        let pages = grow(&mut pager, 3);
        let mut head = 0;
        let mut count = 0;

        for &pn in &pages {
            push_page(&mut pager, &mut head, &mut count, pn).unwrap();
        }
        assert_eq!(count, 3);
        assert_ne!(head, 0);

        let mut popped = Vec::new();
        while let Some(pn) = pop_page(&mut pager, &mut head, &mut count).unwrap() {
            popped.push(pn);
        }
        assert_eq!(count, 0);
        assert_eq!(head, 0);
        let mut expected = pages;
        expected.sort_unstable();
        popped.sort_unstable();
        assert_eq!(popped, expected);
    }

    #[test]
    fn test_trunk_overflow_starts_new_trunk() {
        // A tiny page keeps the trunk capacity small: 512/4 - 2 = 126.
        let mut pager = MemWritePager::new(512);
        let pages = grow(&mut pager, 130);
        let mut head = 0;
        let mut count = 0;
        for &pn in &pages {
            push_page(&mut pager, &mut head, &mut count, pn).unwrap();
        }
        assert_eq!(count, 130);

        let mut n = 0;
        while pop_page(&mut pager, &mut head, &mut count).unwrap().is_some() {
            n += 1;
        }
        assert_eq!(n, 130);
    }

    #[test]
    fn test_pop_empty_list() {
        let mut pager = MemWritePager::new(512);
        let mut head = 0;
        let mut count = 0;
        assert!(pop_page(&mut pager, &mut head, &mut count).unwrap().is_none());
    }
}
