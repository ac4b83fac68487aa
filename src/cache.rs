//! A capacity-bounded read cache of recently touched pages.
//!
//! The cache holds immutable views only; dirty pages live in the
//! transaction overlay and never enter the cache.  Cursors from the same
//! database share one cache, which is why entries are reference counted.

use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::vfs::PageNum;

pub struct PageCache {
    inner: RefCell<LruCache<PageNum, Arc<Vec<u8>>>>,
}

impl PageCache {
    /// A cache holding at most `capacity` pages.  Callers disable caching
    /// by not constructing one; capacity must be non-zero.
    pub fn new(capacity: usize) -> PageCache {
        PageCache {
            inner: RefCell::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("cache capacity must be non-zero"),
            )),
        }
    }

    pub fn get(&self, pn: PageNum) -> Option<Arc<Vec<u8>>> {
        self.inner.borrow_mut().get(&pn).cloned()
    }

    pub fn put(&self, pn: PageNum, page: Arc<Vec<u8>>) {
        self.inner.borrow_mut().put(pn, page);
    }

    /// Drops the entry for `pn`.  Mandatory after any write to that page.
    pub fn invalidate(&self, pn: PageNum) {
        self.inner.borrow_mut().pop(&pn);
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit_and_eviction() {
        let cache = PageCache::new(2);
        cache.put(1, Arc::new(vec![1]));
        cache.put(2, Arc::new(vec![2]));
        assert_eq!(cache.get(1).unwrap().as_ref(), &vec![1]);

        // 2 is now least recently used; inserting 3 evicts it.
        cache.put(3, Arc::new(vec![3]));
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn test_cache_invalidate() {
        let cache = PageCache::new(4);
        cache.put(7, Arc::new(vec![7]));
        cache.invalidate(7);
        assert!(cache.get(7).is_none());
        assert_eq!(cache.len(), 0);
    }
}
