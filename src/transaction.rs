//! The transaction overlay: shadow pages, journal, commit and rollback.
//!
//! A live transaction owns a [`ShadowState`]: copies of every page it has
//! touched (`dirty`), the original image of each (`journal`), and a working
//! copy of the database header.  Reads check the shadow first and fall
//! through to the base source; the first write to a page copies it.
//! Nothing reaches the base source until commit, so rollback is a drop.
//!
//! Commit writes dirty pages in ascending order with page 1 — carrying the
//! bumped file change counter and the new page count — last.  Every
//! `write_page` bumps the source's data version, and the header write is
//! the one a reader's staleness check keys off, so ordering it last makes
//! the commit visible all-or-nothing.

use std::collections::BTreeMap;

use crate::btree::{Error, WritePager};
use crate::dbheader::DbHeader;
use crate::freelist;
use crate::transform::PageTransform;
use crate::vfs::{PageNum, WritablePageSource};

pub(crate) struct ShadowState {
    dirty: BTreeMap<PageNum, Box<[u8]>>,
    journal: BTreeMap<PageNum, Box<[u8]>>,
    clean: BTreeMap<PageNum, Box<[u8]>>,
    pub header: DbHeader,
    begin_header: DbHeader,
    base_page_count: u32,
}

impl ShadowState {
    pub fn begin(header: DbHeader, base_page_count: u32) -> ShadowState {
        ShadowState {
            dirty: BTreeMap::new(),
            journal: BTreeMap::new(),
            clean: BTreeMap::new(),
            begin_header: header.clone(),
            header,
            base_page_count,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.dirty.is_empty() && self.header == self.begin_header
    }

    pub fn dirty_pages(&self) -> impl Iterator<Item = PageNum> + '_ {
        self.dirty.keys().copied()
    }
}

/// Combines a shadow with its base source and transform into the
/// [`WritePager`] the mutator drives.
pub(crate) struct ShadowView<'a> {
    pub state: &'a mut ShadowState,
    pub base: &'a mut Box<dyn WritablePageSource>,
    pub transform: &'a dyn PageTransform,
}

impl<'a> ShadowView<'a> {
    fn read_base(&self, pn: PageNum) -> Result<Box<[u8]>, Error> {
        let ps = self.state.header.page_size as usize;
        let mut raw = vec![0_u8; ps];
        self.base.read_page(pn, &mut raw)?;
        let mut plain = vec![0_u8; ps];
        self.transform.transform_read(&raw, &mut plain, pn)?;
        Ok(plain.into_boxed_slice())
    }
}

impl<'a> WritePager for ShadowView<'a> {
    fn page_size(&self) -> u32 {
        self.state.header.page_size
    }

    fn usable_size(&self) -> u32 {
        self.state.header.usable_page_size()
    }

    fn page(&mut self, pn: PageNum) -> Result<&[u8], Error> {
        if pn == 0 || pn > self.state.header.page_count {
            return Err(Error::Source(crate::vfs::Error::PageNumberBeyondLimits(pn)));
        }
        if self.state.dirty.contains_key(&pn) {
            return Ok(&self.state.dirty[&pn]);
        }
        if !self.state.clean.contains_key(&pn) {
            if pn > self.state.base_page_count {
                return Err(Error::corrupt(pn, "allocated page missing from shadow"));
            }
            let bytes = self.read_base(pn)?;
            self.state.clean.insert(pn, bytes);
        }
        Ok(&self.state.clean[&pn])
    }

    fn page_mut(&mut self, pn: PageNum) -> Result<&mut [u8], Error> {
        if pn == 0 || pn > self.state.header.page_count {
            return Err(Error::Source(crate::vfs::Error::PageNumberBeyondLimits(pn)));
        }
        if !self.state.dirty.contains_key(&pn) {
            let bytes = match self.state.clean.remove(&pn) {
                Some(b) => b,
                None => {
                    if pn > self.state.base_page_count {
                        return Err(Error::corrupt(pn, "allocated page missing from shadow"));
                    }
                    self.read_base(pn)?
                }
            };
            // Copy-on-first-write: the journal keeps the original image.
            if pn <= self.state.base_page_count {
                self.state.journal.entry(pn).or_insert_with(|| bytes.clone());
            }
            self.state.dirty.insert(pn, bytes);
        }
        Ok(self.state.dirty.get_mut(&pn).unwrap())
    }

    fn allocate_page(&mut self) -> Result<PageNum, Error> {
        let mut head = self.state.header.freelist_head;
        let mut count = self.state.header.freelist_count;
        if let Some(pn) = freelist::pop_page(self, &mut head, &mut count)? {
            self.state.header.freelist_head = head;
            self.state.header.freelist_count = count;
            let page = self.page_mut(pn)?;
            page.fill(0);
            return Ok(pn);
        }
        let pn = self.state.header.page_count + 1;
        self.state.header.page_count = pn;
        let ps = self.state.header.page_size as usize;
        self.state.dirty.insert(pn, vec![0_u8; ps].into_boxed_slice());
        log::debug!("transaction grew database to {} pages", pn);
        Ok(pn)
    }

    fn free_page(&mut self, pn: PageNum) -> Result<(), Error> {
        let mut head = self.state.header.freelist_head;
        let mut count = self.state.header.freelist_count;
        freelist::push_page(self, &mut head, &mut count, pn)?;
        self.state.header.freelist_head = head;
        self.state.header.freelist_count = count;
        Ok(())
    }
}

/// Flushes a shadow into the base source.  Returns the pages written so
/// the caller can invalidate read caches, and the committed header.
///
/// All-or-nothing: any failure rewrites the journalled originals of pages
/// already flushed, leaves the header page untouched, and hands the error
/// back with the shadow preserved for rollback.
pub(crate) fn commit(
    state: &mut ShadowState,
    base: &mut Box<dyn WritablePageSource>,
    transform: &dyn PageTransform,
) -> Result<(Vec<PageNum>, DbHeader), Error> {
    if state.is_clean() {
        return Ok((Vec::new(), state.header.clone()));
    }

    state.header.file_change_counter = state.header.file_change_counter.wrapping_add(1);
    state.header.version_valid_for = state.header.file_change_counter;

    // Fold the header into the page 1 image inside the shadow.
    {
        let header = state.header.clone();
        let mut view = ShadowView {
            state,
            base,
            transform,
        };
        let page1 = view.page_mut(1)?;
        header.write(page1);
    }

    while base.page_count() < state.header.page_count {
        base.allocate()?;
    }

    let ps = state.header.page_size as usize;
    let mut scratch = vec![0_u8; ps];
    let mut written: Vec<PageNum> = Vec::new();
    let pages: Vec<PageNum> = state
        .dirty
        .keys()
        .copied()
        .filter(|&pn| pn != 1)
        .chain(std::iter::once(1))
        .collect();

    for &pn in &pages {
        let data = &state.dirty[&pn];
        let result = transform
            .transform_write(data, &mut scratch, pn)
            .map_err(Error::from)
            .and_then(|()| base.write_page(pn, &scratch).map_err(Error::from));
        if let Err(e) = result {
            log::error!("commit failed writing page {}: {}; restoring originals", pn, e);
            for &wpn in &written {
                if let Some(original) = state.journal.get(&wpn) {
                    if transform.transform_write(original, &mut scratch, wpn).is_ok() {
                        let _ = base.write_page(wpn, &scratch);
                    }
                }
            }
            // Undo the change-counter bump so a retried commit re-bumps.
            state.header.file_change_counter = state.header.file_change_counter.wrapping_sub(1);
            state.header.version_valid_for = state.header.file_change_counter;
            return Err(e);
        }
        written.push(pn);
    }

    log::debug!(
        "committed {} pages, change counter {}",
        written.len(),
        state.header.file_change_counter
    );
    let header = state.header.clone();
    let dirty: Vec<PageNum> = state.dirty_pages().collect();
    state.dirty.clear();
    state.journal.clear();
    state.clean.clear();
    Ok((dirty, header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::mutator::BTreeMutator;
    use crate::btree::PageType;
    use crate::record::encode_record;
    use crate::transform::IdentityTransform;
    use crate::value::ColumnValue::Int;
    use crate::vfs::{MemorySource, PageSource};

    fn empty_image(page_size: u32, pages: u32) -> Vec<u8> {
        let mut image = vec![0_u8; (page_size * pages) as usize];
        let mut h = DbHeader::new(page_size, 0);
        h.page_count = pages;
        h.write(&mut image);
        image
    }

    fn open_base(page_size: u32, pages: u32) -> Box<dyn WritablePageSource> {
        Box::new(MemorySource::from_image(empty_image(page_size, pages)).unwrap())
    }

    fn base_bytes(base: &dyn WritablePageSource) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0_u8; base.page_size() as usize];
        for pn in 1..=base.page_count() {
            base.read_page(pn, &mut buf).unwrap();
            out.extend_from_slice(&buf);
        }
        out
    }

    #[test]
    fn test_reads_fall_through_writes_shadow() {
        let mut base = open_base(512, 2);
        let header = DbHeader::parse(&base.page(1).unwrap()).unwrap();
        let mut state = ShadowState::begin(header, 2);
        let transform = IdentityTransform;
        let mut view = ShadowView {
            state: &mut state,
            base: &mut base,
            transform: &transform,
        };
        assert_eq!(view.page(2).unwrap().len(), 512);
        view.page_mut(2).unwrap()[0] = 0xee;
        assert_eq!(view.page(2).unwrap()[0], 0xee);
        // The base has not changed and its version has not moved.
        assert_eq!(base.page(2).unwrap()[0], 0x00);
        assert_eq!(base.data_version(), 0);
    }

    #[test]
    fn test_rollback_is_byte_identical() {
        let mut base = open_base(512, 2);
        let before = base_bytes(base.as_ref());
        let header = DbHeader::parse(&base.page(1).unwrap()).unwrap();
        let mut state = ShadowState::begin(header, 2);
        let transform = IdentityTransform;
        {
            let mut view = ShadowView {
                state: &mut state,
                base: &mut base,
                transform: &transform,
            };
            let root = {
                let mut m = BTreeMutator::new(&mut view);
                m.format_page(2, PageType::TableLeaf).unwrap();
                2
            };
            let mut m = BTreeMutator::new(&mut view);
            for i in 1..=50 {
                m.insert(root, i, &encode_record(&[Int(i)])).unwrap();
            }
        }
        drop(state); // rollback
        assert_eq!(base_bytes(base.as_ref()), before);
        assert_eq!(base.data_version(), 0);
    }

    #[test]
    fn test_commit_flushes_and_bumps_version() {
        let mut base = open_base(512, 2);
        let header = DbHeader::parse(&base.page(1).unwrap()).unwrap();
        let mut state = ShadowState::begin(header, 2);
        let transform = IdentityTransform;
        {
            let mut view = ShadowView {
                state: &mut state,
                base: &mut base,
                transform: &transform,
            };
            view.page_mut(2).unwrap()[100] = 0x42;
        }
        let v0 = base.data_version();
        let (dirty, header) = commit(&mut state, &mut base, &transform).unwrap();
        assert_eq!(dirty, vec![1, 2]);
        assert!(base.data_version() > v0);
        assert_eq!(base.page(2).unwrap()[100], 0x42);
        assert_eq!(header.file_change_counter, 2);
        // The stored header reflects the bumped change counter.
        let on_disk = DbHeader::parse(&base.page(1).unwrap()).unwrap();
        assert_eq!(on_disk.file_change_counter, 2);
    }

    #[test]
    fn test_commit_empty_transaction_is_noop() {
        let mut base = open_base(512, 2);
        let header = DbHeader::parse(&base.page(1).unwrap()).unwrap();
        let mut state = ShadowState::begin(header, 2);
        let transform = IdentityTransform;
        let (dirty, _) = commit(&mut state, &mut base, &transform).unwrap();
        assert!(dirty.is_empty());
        assert_eq!(base.data_version(), 0);
    }

    #[test]
    fn test_commit_growth_extends_base() {
        let mut base = open_base(512, 2);
        let header = DbHeader::parse(&base.page(1).unwrap()).unwrap();
        let mut state = ShadowState::begin(header, 2);
        let transform = IdentityTransform;
        {
            let mut view = ShadowView {
                state: &mut state,
                base: &mut base,
                transform: &transform,
            };
            let pn = view.allocate_page().unwrap();
            assert_eq!(pn, 3);
            view.page_mut(pn).unwrap()[9] = 9;
        }
        commit(&mut state, &mut base, &transform).unwrap();
        assert_eq!(base.page_count(), 3);
        assert_eq!(base.page(3).unwrap()[9], 9);
        let on_disk = DbHeader::parse(&base.page(1).unwrap()).unwrap();
        assert_eq!(on_disk.page_count, 3);
    }

    // A transform whose write side fails on one page, to exercise the
    // all-or-nothing path.
    struct FailOn(PageNum);

    impl PageTransform for FailOn {
        fn transform_read(
            &self,
            src: &[u8],
            dst: &mut [u8],
            _pn: PageNum,
        ) -> Result<(), crate::transform::Error> {
            dst.copy_from_slice(src);
            Ok(())
        }
        fn transform_write(
            &self,
            src: &[u8],
            dst: &mut [u8],
            pn: PageNum,
        ) -> Result<(), crate::transform::Error> {
            if pn == self.0 {
                return Err(crate::transform::Error::WriteFailed(pn, "injected".into()));
            }
            dst.copy_from_slice(src);
            Ok(())
        }
    }

    #[test]
    fn test_failed_commit_restores_written_pages() {
        let mut base = open_base(512, 3);
        let before = base_bytes(base.as_ref());
        let header = DbHeader::parse(&base.page(1).unwrap()).unwrap();
        let mut state = ShadowState::begin(header, 3);
        // Page 3 fails; page 2 will already have been written and must be
        // rolled back.  Page 1 is written last so the header never lands.
        let transform = FailOn(3);
        {
            let mut view = ShadowView {
                state: &mut state,
                base: &mut base,
                transform: &transform,
            };
            view.page_mut(2).unwrap()[50] = 1;
            view.page_mut(3).unwrap()[50] = 2;
        }
        assert!(commit(&mut state, &mut base, &transform).is_err());
        assert_eq!(base_bytes(base.as_ref()), before);
        // The shadow survives for rollback-or-retry.
        assert!(!state.is_clean());
    }
}
