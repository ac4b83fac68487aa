//! Defines the `Database` type: one open database image and its schema.
//!
//! A `Database` composes a page source, the transform pipeline and the
//! read cache, parses the file header and schema on open, and hands out
//! typed readers and writers.  It is bound to its creating thread and not
//! internally synchronised; concurrent readers open their own instances.

use std::path::Path;
use std::sync::Arc;

use crate::btree::{self, Pager, PageType};
use crate::cache::PageCache;
use crate::dbheader::DbHeader;
use crate::reader::Reader;
use crate::schema::Schema;
use crate::transform::{IdentityTransform, PageTransform};
use crate::vfs::{FileSource, MemorySource, MmapSource, PageNum, PageSource, WritablePageSource};
use crate::writer::Writer;
use crate::{Error, Result};

/// Default reader-cache capacity in pages.
pub const DEFAULT_PAGE_CACHE_SIZE: usize = 64;

/// How to open a database.
pub struct OpenOptions {
    pub(crate) writable: bool,
    pub(crate) page_cache_size: usize,
    pub(crate) transform: Box<dyn PageTransform>,
    pub(crate) allow_format_downgrade: bool,
}

impl Default for OpenOptions {
    fn default() -> OpenOptions {
        OpenOptions {
            writable: false,
            page_cache_size: DEFAULT_PAGE_CACHE_SIZE,
            transform: Box::new(IdentityTransform),
            allow_format_downgrade: false,
        }
    }
}

impl OpenOptions {
    pub fn new() -> OpenOptions {
        OpenOptions::default()
    }

    pub fn writable(mut self, writable: bool) -> OpenOptions {
        self.writable = writable;
        self
    }

    /// Reader-cache capacity in pages; 0 disables the cache.
    pub fn page_cache_size(mut self, pages: usize) -> OpenOptions {
        self.page_cache_size = pages;
        self
    }

    pub fn page_transform(mut self, transform: Box<dyn PageTransform>) -> OpenOptions {
        self.transform = transform;
        self
    }

    /// Permit opening databases with schema formats 1-3.
    pub fn allow_format_downgrade(mut self, allow: bool) -> OpenOptions {
        self.allow_format_downgrade = allow;
        self
    }
}

pub(crate) enum SourceHandle {
    ReadOnly(Box<dyn PageSource>),
    Writable(Box<dyn WritablePageSource>),
}

impl SourceHandle {
    pub(crate) fn page_count(&self) -> u32 {
        match self {
            SourceHandle::ReadOnly(s) => s.page_count(),
            SourceHandle::Writable(s) => s.page_count(),
        }
    }

    pub(crate) fn data_version(&self) -> u64 {
        match self {
            SourceHandle::ReadOnly(s) => s.data_version(),
            SourceHandle::Writable(s) => s.data_version(),
        }
    }

    fn read_page(&self, pn: PageNum, buf: &mut [u8]) -> std::result::Result<(), crate::vfs::Error> {
        match self {
            SourceHandle::ReadOnly(s) => s.read_page(pn, buf),
            SourceHandle::Writable(s) => s.read_page(pn, buf),
        }
    }
}

/// One open database.
pub struct Database {
    pub(crate) source: SourceHandle,
    pub(crate) header: DbHeader,
    pub(crate) schema: Schema,
    pub(crate) cache: Option<PageCache>,
    pub(crate) transform: Box<dyn PageTransform>,
}

impl Database {
    /// Opens a database file through plain file I/O.
    pub fn open<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Database> {
        let source = if options.writable {
            SourceHandle::Writable(Box::new(FileSource::open(path, true)?))
        } else {
            SourceHandle::ReadOnly(Box::new(FileSource::open(path, false)?))
        };
        Database::from_source(source, options)
    }

    /// Opens a database file through a shared memory map.
    pub fn open_mmap<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Database> {
        let source = if options.writable {
            SourceHandle::Writable(Box::new(MmapSource::open(path, true)?))
        } else {
            SourceHandle::ReadOnly(Box::new(MmapSource::open(path, false)?))
        };
        Database::from_source(source, options)
    }

    /// Opens a database image held in memory.
    pub fn open_memory(image: Vec<u8>, options: OpenOptions) -> Result<Database> {
        let source = if options.writable {
            SourceHandle::Writable(Box::new(MemorySource::from_image(image)?))
        } else {
            SourceHandle::ReadOnly(Box::new(MemorySource::from_image(image)?))
        };
        Database::from_source(source, options)
    }

    /// Creates a new empty database file and opens it writable.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Database> {
        let image = empty_database_image(4096, 0);
        let source = SourceHandle::Writable(Box::new(FileSource::create(path, &image)?));
        Database::from_source(source, OpenOptions::new().writable(true))
    }

    /// Creates a new empty in-memory database, writable.
    pub fn create_memory(page_size: u32) -> Result<Database> {
        let image = empty_database_image(page_size, 0);
        let source = SourceHandle::Writable(Box::new(MemorySource::from_image(image)?));
        Database::from_source(source, OpenOptions::new().writable(true))
    }

    fn from_source(source: SourceHandle, options: OpenOptions) -> Result<Database> {
        // The header is parsed above the transform pipeline.
        let mut page1 = vec![0_u8; page_size_of(&source)? as usize];
        {
            let mut raw = vec![0_u8; page1.len()];
            source.read_page(1, &mut raw)?;
            options.transform.transform_read(&raw, &mut page1, 1)?;
        }
        let header = DbHeader::parse(&page1)?;
        if header.schema_format < 4 && !options.allow_format_downgrade {
            return Err(Error::FormatDowngrade(header.schema_format));
        }
        let cache = if options.page_cache_size > 0 {
            Some(PageCache::new(options.page_cache_size))
        } else {
            None
        };
        let mut db = Database {
            source,
            header,
            schema: Schema::default(),
            cache,
            transform: options.transform,
        };
        db.schema = Schema::load(&db)?;
        log::debug!(
            "opened database: {} pages of {} bytes, {} tables, {} indexes",
            db.header.page_count,
            db.header.page_size,
            db.schema.tables.len(),
            db.schema.indexes.len()
        );
        Ok(db)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn header(&self) -> &DbHeader {
        &self.header
    }

    pub fn page_count(&self) -> u32 {
        self.header.page_count
    }

    /// Bumped by every committed write; cursors key staleness off it.
    pub fn data_version(&self) -> u64 {
        self.source.data_version()
    }

    /// A reader over every column of `table`.
    pub fn reader(&self, table: &str) -> Result<Reader<'_>> {
        Reader::new(self, table, None)
    }

    /// A reader projecting only the named columns, in the given order.
    pub fn reader_with_columns(&self, table: &str, columns: &[&str]) -> Result<Reader<'_>> {
        Reader::new(self, table, Some(columns))
    }

    /// The single writer for this database instance.
    pub fn writer(&mut self) -> Result<Writer<'_>> {
        match self.source {
            SourceHandle::Writable(_) => Ok(Writer::new(self)),
            SourceHandle::ReadOnly(_) => Err(Error::ReadOnly),
        }
    }

    pub(crate) fn invalidate_pages(&self, pages: &[PageNum]) {
        if let Some(cache) = &self.cache {
            for &pn in pages {
                cache.invalidate(pn);
            }
        }
    }
}

fn page_size_of(source: &SourceHandle) -> Result<u32> {
    Ok(match source {
        SourceHandle::ReadOnly(s) => s.page_size(),
        SourceHandle::Writable(s) => s.page_size(),
    })
}

impl Pager for Database {
    fn page_size(&self) -> u32 {
        self.header.page_size
    }

    fn usable_size(&self) -> u32 {
        self.header.usable_page_size()
    }

    fn page(&self, pn: PageNum) -> std::result::Result<Arc<Vec<u8>>, btree::Error> {
        if let Some(cache) = &self.cache {
            if let Some(page) = cache.get(pn) {
                return Ok(page);
            }
        }
        let ps = self.header.page_size as usize;
        let mut raw = vec![0_u8; ps];
        self.source.read_page(pn, &mut raw)?;
        let mut plain = vec![0_u8; ps];
        self.transform.transform_read(&raw, &mut plain, pn)?;
        let page = Arc::new(plain);
        if let Some(cache) = &self.cache {
            cache.put(pn, page.clone());
        }
        Ok(page)
    }

    fn data_version(&self) -> u64 {
        self.source.data_version()
    }
}

/// A minimal valid database image: page 1 holds the header and the empty
/// schema-table root; page 2 sits on the freelist so the image round-trips
/// through tools that account for every page.
pub(crate) fn empty_database_image(page_size: u32, reserved_bytes: u8) -> Vec<u8> {
    let mut image = vec![0_u8; 2 * page_size as usize];
    let mut header = DbHeader::new(page_size, reserved_bytes);
    header.page_count = 2;
    header.freelist_head = 2;
    header.freelist_count = 1;
    let usable = header.usable_page_size();
    header.write(&mut image);
    let hdr = crate::btree::header::PageHeader::empty(PageType::TableLeaf, usable);
    hdr.write(&mut image, crate::dbheader::DB_HEADER_SIZE);
    // Page 2 is a freelist trunk with no next pointer and no leaves, which
    // is all zeroes, so nothing further to write.
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_memory_is_empty_and_valid() {
        let db = Database::create_memory(4096).unwrap();
        assert_eq!(db.page_count(), 2);
        assert_eq!(db.header().page_size, 4096);
        assert!(db.schema().tables.is_empty());
        assert!(db.schema().indexes.is_empty());
    }

    #[test]
    fn test_empty_image_reopens() {
        let image = empty_database_image(512, 0);
        let db = Database::open_memory(image, OpenOptions::new()).unwrap();
        assert_eq!(db.page_count(), 2);
        assert_eq!(db.header().freelist_count, 1);
    }

    #[test]
    fn test_open_unknown_table_fails() {
        let db = Database::create_memory(4096).unwrap();
        assert!(matches!(db.reader("missing"), Err(Error::TableNotFound(_))));
    }

    #[test]
    fn test_writer_requires_writable() {
        let image = empty_database_image(4096, 0);
        let mut db = Database::open_memory(image, OpenOptions::new()).unwrap();
        assert!(matches!(db.writer(), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_format_downgrade_gate() {
        let mut image = empty_database_image(4096, 0);
        // Patch the schema format down to 1.
        image[47] = 1;
        assert!(matches!(
            Database::open_memory(image.clone(), OpenOptions::new()),
            Err(Error::FormatDowngrade(1))
        ));
        let db =
            Database::open_memory(image, OpenOptions::new().allow_format_downgrade(true)).unwrap();
        assert_eq!(db.header().schema_format, 1);
    }

    #[test]
    fn test_cache_can_be_disabled() {
        let image = empty_database_image(4096, 0);
        let db = Database::open_memory(image, OpenOptions::new().page_cache_size(0)).unwrap();
        assert!(db.cache.is_none());
        // Reads still work without the cache.
        assert_eq!(db.page(1).unwrap().len(), 4096);
    }
}
