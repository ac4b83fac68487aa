//! Page sources: the capability to read (and optionally write) fixed-size
//! pages of one database image.
//!
//! The complete state of a database lives in a single image, partitioned
//! into 1-based pages of one power-of-two size.  Everything above this
//! module addresses pages by number; everything below it is a byte store.
//! Three implementations are provided: an owned in-memory buffer, a file
//! handle, and a read-optimised memory map with a companion file handle
//! for writes.

use std::borrow::Cow;
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use memmap2::Mmap;

pub type PageNum = u32;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Page number {0} is beyond the end of the database.")]
    PageNumberBeyondLimits(PageNum),
    #[error("Error accessing database file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database image length {0} is not a multiple of the page size.")]
    MisalignedLength(u64),
    #[error("Page size {0} is not a power of two in 512..=65536.")]
    UnsupportedPageSize(u32),
    #[error("The file is too short to hold a database header.")]
    Truncated,
    #[error("The buffer passed to read_page has the wrong length.")]
    BadBufferLength,
}

/// Read-only random access to the pages of one database image.
///
/// `data_version` is 0 for sources that can never change underneath the
/// caller; writable sources bump it on every write so cursors can detect
/// staleness passively.
pub trait PageSource {
    fn page_size(&self) -> u32;
    fn page_count(&self) -> u32;

    /// Copies page `pn` into `buf`, which must be exactly one page long.
    fn read_page(&self, pn: PageNum, buf: &mut [u8]) -> Result<(), Error>;

    /// Borrows page `pn` when the source can hand out a view without
    /// copying, and copies otherwise.
    fn page(&self, pn: PageNum) -> Result<Cow<'_, [u8]>, Error> {
        let mut buf = vec![0_u8; self.page_size() as usize];
        self.read_page(pn, &mut buf)?;
        Ok(Cow::Owned(buf))
    }

    fn data_version(&self) -> u64 {
        0
    }
}

/// Random write access on top of [`PageSource`].
pub trait WritablePageSource: PageSource {
    /// Replaces page `pn`.  Bumps `data_version`.
    fn write_page(&mut self, pn: PageNum, data: &[u8]) -> Result<(), Error>;

    /// Extends the image by one page of zeroes, returning its page number.
    fn allocate(&mut self) -> Result<PageNum, Error>;

    /// Drops any internal read state held for page `pn`.  Sources without
    /// internal caching ignore this.
    fn invalidate(&mut self, _pn: PageNum) {}

    /// Pushes buffered writes to durable storage.  The engine never calls
    /// this itself; durability policy belongs to the caller.
    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

fn check_page_bounds(pn: PageNum, page_count: u32) -> Result<(), Error> {
    if pn == 0 || pn > page_count {
        return Err(Error::PageNumberBeyondLimits(pn));
    }
    Ok(())
}

// Reads the page size out of a raw header prefix.  Only offsets 16-17 are
// consulted; the full header is validated later, above the transform
// pipeline.
fn page_size_from_raw_header(prefix: &[u8]) -> Result<u32, Error> {
    if prefix.len() < 18 {
        return Err(Error::Truncated);
    }
    let page_size = match BigEndian::read_u16(&prefix[16..18]) {
        1 => 65536,
        x => x as u32,
    };
    if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
        return Err(Error::UnsupportedPageSize(page_size));
    }
    Ok(page_size)
}

/// A database image held in an owned byte buffer.
pub struct MemorySource {
    buf: Vec<u8>,
    page_size: u32,
    data_version: u64,
}

impl MemorySource {
    pub fn new(buf: Vec<u8>, page_size: u32) -> Result<MemorySource, Error> {
        if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
            return Err(Error::UnsupportedPageSize(page_size));
        }
        if buf.len() as u64 % page_size as u64 != 0 {
            return Err(Error::MisalignedLength(buf.len() as u64));
        }
        Ok(MemorySource {
            buf,
            page_size,
            data_version: 0,
        })
    }

    /// Builds a source from a serialised database image, taking the page
    /// size from the image header.
    pub fn from_image(buf: Vec<u8>) -> Result<MemorySource, Error> {
        let page_size = page_size_from_raw_header(&buf)?;
        MemorySource::new(buf, page_size)
    }

    /// The full image, e.g. for byte-for-byte comparison in tests.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn page_range(&self, pn: PageNum) -> std::ops::Range<usize> {
        let start = (pn as usize - 1) * self.page_size as usize;
        start..start + self.page_size as usize
    }
}

impl PageSource for MemorySource {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        (self.buf.len() / self.page_size as usize) as u32
    }

    fn read_page(&self, pn: PageNum, buf: &mut [u8]) -> Result<(), Error> {
        check_page_bounds(pn, self.page_count())?;
        if buf.len() != self.page_size as usize {
            return Err(Error::BadBufferLength);
        }
        buf.copy_from_slice(&self.buf[self.page_range(pn)]);
        Ok(())
    }

    fn page(&self, pn: PageNum) -> Result<Cow<'_, [u8]>, Error> {
        check_page_bounds(pn, self.page_count())?;
        Ok(Cow::Borrowed(&self.buf[self.page_range(pn)]))
    }

    fn data_version(&self) -> u64 {
        self.data_version
    }
}

impl WritablePageSource for MemorySource {
    fn write_page(&mut self, pn: PageNum, data: &[u8]) -> Result<(), Error> {
        check_page_bounds(pn, self.page_count())?;
        if data.len() != self.page_size as usize {
            return Err(Error::BadBufferLength);
        }
        let range = self.page_range(pn);
        self.buf[range].copy_from_slice(data);
        self.data_version += 1;
        Ok(())
    }

    fn allocate(&mut self) -> Result<PageNum, Error> {
        self.buf.extend(std::iter::repeat(0).take(self.page_size as usize));
        let pn = self.page_count();
        log::debug!("memory source grew to {} pages", pn);
        Ok(pn)
    }
}

// The on-disk file change counter at header offset 24.  A committing
// writer rewrites the header page last, so another instance watching this
// counter sees a commit exactly when all of its pages are in place.
fn read_change_counter(file: &RefCell<File>) -> u64 {
    let mut file = file.borrow_mut();
    let mut buf = [0_u8; 4];
    let ok = file
        .seek(SeekFrom::Start(24))
        .and_then(|_| file.read_exact(&mut buf));
    match ok {
        Ok(()) => BigEndian::read_u32(&buf) as u64,
        Err(_) => 0,
    }
}

/// A database file accessed through seek + read/write.
///
/// `data_version` combines this instance's own write count with the
/// on-disk change counter, so a read-only instance still observes commits
/// made by a writer instance on the same file.
pub struct FileSource {
    file: RefCell<File>,
    page_size: u32,
    page_count: u32,
    write_counter: u64,
    writable: bool,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<FileSource, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        let mut prefix = [0_u8; 18];
        file.read_exact(&mut prefix).map_err(|_| Error::Truncated)?;
        let page_size = page_size_from_raw_header(&prefix)?;
        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(Error::MisalignedLength(len));
        }
        Ok(FileSource {
            file: RefCell::new(file),
            page_size,
            page_count: (len / page_size as u64) as u32,
            write_counter: 0,
            writable,
        })
    }

    /// Creates a new file holding `image` and opens it writable.
    pub fn create<P: AsRef<Path>>(path: P, image: &[u8]) -> Result<FileSource, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(image)?;
        drop(file);
        FileSource::open(path, true)
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl PageSource for FileSource {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn read_page(&self, pn: PageNum, buf: &mut [u8]) -> Result<(), Error> {
        check_page_bounds(pn, self.page_count)?;
        if buf.len() != self.page_size as usize {
            return Err(Error::BadBufferLength);
        }
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start((pn as u64 - 1) * self.page_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn data_version(&self) -> u64 {
        self.write_counter + read_change_counter(&self.file)
    }
}

impl WritablePageSource for FileSource {
    fn write_page(&mut self, pn: PageNum, data: &[u8]) -> Result<(), Error> {
        check_page_bounds(pn, self.page_count)?;
        if data.len() != self.page_size as usize {
            return Err(Error::BadBufferLength);
        }
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start((pn as u64 - 1) * self.page_size as u64))?;
        file.write_all(data)?;
        drop(file);
        self.write_counter += 1;
        Ok(())
    }

    fn allocate(&mut self) -> Result<PageNum, Error> {
        let new_count = self.page_count + 1;
        self.file
            .borrow_mut()
            .set_len(new_count as u64 * self.page_size as u64)?;
        self.page_count = new_count;
        log::debug!("file source grew to {} pages", new_count);
        Ok(new_count)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.file.borrow_mut().sync_all()?;
        Ok(())
    }
}

/// A database file read through a shared memory map.
///
/// Reads borrow straight from the mapping.  Writes go through the companion
/// file handle, never through the mapping, and are visible in the map
/// because it is a shared mapping of the same file.  Growth remaps.
pub struct MmapSource {
    file: RefCell<File>,
    map: Mmap,
    page_size: u32,
    page_count: u32,
    write_counter: u64,
}

impl MmapSource {
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<MmapSource, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        let page_size = page_size_from_raw_header(&map)?;
        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(Error::MisalignedLength(len));
        }
        Ok(MmapSource {
            file: RefCell::new(file),
            map,
            page_size,
            page_count: (len / page_size as u64) as u32,
            write_counter: 0,
        })
    }

    fn page_range(&self, pn: PageNum) -> std::ops::Range<usize> {
        let start = (pn as usize - 1) * self.page_size as usize;
        start..start + self.page_size as usize
    }

    fn remap(&mut self) -> Result<(), Error> {
        self.map = unsafe { Mmap::map(&*self.file.borrow())? };
        Ok(())
    }
}

impl PageSource for MmapSource {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn read_page(&self, pn: PageNum, buf: &mut [u8]) -> Result<(), Error> {
        check_page_bounds(pn, self.page_count)?;
        if buf.len() != self.page_size as usize {
            return Err(Error::BadBufferLength);
        }
        buf.copy_from_slice(&self.map[self.page_range(pn)]);
        Ok(())
    }

    fn page(&self, pn: PageNum) -> Result<Cow<'_, [u8]>, Error> {
        check_page_bounds(pn, self.page_count)?;
        Ok(Cow::Borrowed(&self.map[self.page_range(pn)]))
    }

    fn data_version(&self) -> u64 {
        // The shared mapping always shows the current on-disk counter.
        let counter = if self.map.len() >= 28 {
            BigEndian::read_u32(&self.map[24..28]) as u64
        } else {
            0
        };
        self.write_counter + counter
    }
}

impl WritablePageSource for MmapSource {
    fn write_page(&mut self, pn: PageNum, data: &[u8]) -> Result<(), Error> {
        check_page_bounds(pn, self.page_count)?;
        if data.len() != self.page_size as usize {
            return Err(Error::BadBufferLength);
        }
        {
            let mut file = self.file.borrow_mut();
            file.seek(SeekFrom::Start((pn as u64 - 1) * self.page_size as u64))?;
            file.write_all(data)?;
        }
        self.write_counter += 1;
        Ok(())
    }

    fn allocate(&mut self) -> Result<PageNum, Error> {
        let new_count = self.page_count + 1;
        self.file
            .borrow_mut()
            .set_len(new_count as u64 * self.page_size as u64)?;
        self.page_count = new_count;
        self.remap()?;
        log::debug!("mmap source grew to {} pages, remapped", new_count);
        Ok(new_count)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.file.borrow_mut().sync_all()?;
        Ok(())
    }
}
