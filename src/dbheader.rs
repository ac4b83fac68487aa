//! Parses and builds the 100 byte database file header.
//!
//! The header occupies the start of page 1; the page's b-tree content
//! begins at offset 100.  Layout per https://www.sqlite.org/fileformat.html

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("The magic bytes for this file are wrong.")]
    BadMagic,
    #[error("Page size {0} is not a power of two in 512..=65536.")]
    UnsupportedPageSize(u32),
    #[error("A field value is invalid per the format spec: {0}.")]
    Invalid(&'static str),
    #[error("Header is shorter than 100 bytes.")]
    Truncated,
}

const MAGIC: &[u8; 16] = b"SQLite format 3\0";
const SQLITE_VERSION_NUMBER: u32 = 3037000;

/// Size of the database file header at the start of page 1.
pub const DB_HEADER_SIZE: usize = 100;

/// The parsed database file header.
#[derive(Debug, Clone, PartialEq)]
pub struct DbHeader {
    pub page_size: u32,
    pub write_version: u8,
    pub read_version: u8,
    pub reserved_bytes_per_page: u8,
    pub file_change_counter: u32,
    pub page_count: u32,
    pub freelist_head: u32,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_cache_size: u32,
    pub largest_root_page: u32,
    pub text_encoding: u32,
    pub user_version: u32,
    pub incremental_vacuum: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub sqlite_version_number: u32,
}

impl DbHeader {
    /// A fresh header for a newly created database.
    pub fn new(page_size: u32, reserved_bytes_per_page: u8) -> DbHeader {
        DbHeader {
            page_size,
            write_version: 1,
            read_version: 1,
            reserved_bytes_per_page,
            file_change_counter: 1,
            page_count: 1,
            freelist_head: 0,
            freelist_count: 0,
            schema_cookie: 0,
            schema_format: 4,
            default_cache_size: 0,
            largest_root_page: 0,
            text_encoding: 1, // UTF-8
            user_version: 0,
            incremental_vacuum: 0,
            application_id: 0,
            version_valid_for: 1,
            sqlite_version_number: SQLITE_VERSION_NUMBER,
        }
    }

    /// The page capacity available to cell storage.
    pub fn usable_page_size(&self) -> u32 {
        self.page_size - self.reserved_bytes_per_page as u32
    }

    /// Parses a header from the start of page 1.
    pub fn parse(page: &[u8]) -> Result<DbHeader, Error> {
        if page.len() < DB_HEADER_SIZE {
            return Err(Error::Truncated);
        }
        let mut c = Cursor::new(page);

        // Offset 0, size 16: the header string "SQLite format 3\0".
        let mut magic = [0_u8; 16];
        c.read_exact(&mut magic).map_err(|_| Error::Truncated)?;
        if &magic != MAGIC {
            return Err(Error::BadMagic);
        }

        // Offset 16, size 2: page size; the value 1 represents 65536.
        let page_size = match c.read_u16::<BigEndian>().unwrap() {
            1 => 65536,
            x => x as u32,
        };
        if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
            return Err(Error::UnsupportedPageSize(page_size));
        }

        // Offset 18: write version; 19: read version.  1 legacy, 2 WAL.
        let write_version = c.read_u8().unwrap();
        let read_version = c.read_u8().unwrap();
        // Offset 20: reserved bytes per page.
        let reserved_bytes_per_page = c.read_u8().unwrap();
        if reserved_bytes_per_page as u32 >= page_size {
            return Err(Error::Invalid("reserved bytes exceed page size"));
        }
        // Offsets 21-23: payload fractions, fixed at 64 / 32 / 32.
        if c.read_u8().unwrap() != 64 {
            return Err(Error::Invalid("max payload fraction"));
        }
        if c.read_u8().unwrap() != 32 {
            return Err(Error::Invalid("min payload fraction"));
        }
        if c.read_u8().unwrap() != 32 {
            return Err(Error::Invalid("leaf payload fraction"));
        }

        // Offset 24: file change counter; 28: page count.
        let file_change_counter = c.read_u32::<BigEndian>().unwrap();
        let page_count = c.read_u32::<BigEndian>().unwrap();
        // Offset 32: first freelist trunk; 36: freelist page count.
        let freelist_head = c.read_u32::<BigEndian>().unwrap();
        let freelist_count = c.read_u32::<BigEndian>().unwrap();
        // Offset 40: schema cookie; 44: schema format (1-4).
        let schema_cookie = c.read_u32::<BigEndian>().unwrap();
        let schema_format = c.read_u32::<BigEndian>().unwrap();
        if !(1..=4).contains(&schema_format) {
            return Err(Error::Invalid("schema format"));
        }
        // Offset 48: default cache size; 52: largest root page (vacuum modes).
        let default_cache_size = c.read_u32::<BigEndian>().unwrap();
        let largest_root_page = c.read_u32::<BigEndian>().unwrap();
        // Offset 56: text encoding.  1 UTF-8, 2 UTF-16le, 3 UTF-16be.
        let text_encoding = c.read_u32::<BigEndian>().unwrap();
        if !(1..=3).contains(&text_encoding) {
            return Err(Error::Invalid("text encoding"));
        }
        // Offset 60: user version; 64: incremental vacuum; 68: application id.
        let user_version = c.read_u32::<BigEndian>().unwrap();
        let incremental_vacuum = c.read_u32::<BigEndian>().unwrap();
        let application_id = c.read_u32::<BigEndian>().unwrap();
        // Offset 72, size 20: reserved for expansion.
        let mut reserved = [0_u8; 20];
        c.read_exact(&mut reserved).unwrap();
        // Offset 92: version-valid-for; 96: sqlite version number.
        let version_valid_for = c.read_u32::<BigEndian>().unwrap();
        let sqlite_version_number = c.read_u32::<BigEndian>().unwrap();

        Ok(DbHeader {
            page_size,
            write_version,
            read_version,
            reserved_bytes_per_page,
            file_change_counter,
            page_count,
            freelist_head,
            freelist_count,
            schema_cookie,
            schema_format,
            default_cache_size,
            largest_root_page,
            text_encoding,
            user_version,
            incremental_vacuum,
            application_id,
            version_valid_for,
            sqlite_version_number,
        })
    }

    /// Serialises the header into the first 100 bytes of `page`.
    pub fn write(&self, page: &mut [u8]) {
        let mut c = Cursor::new(&mut page[..DB_HEADER_SIZE]);
        c.write_all(MAGIC).unwrap();
        let stored_page_size = if self.page_size == 65536 {
            1
        } else {
            self.page_size as u16
        };
        c.write_u16::<BigEndian>(stored_page_size).unwrap();
        c.write_u8(self.write_version).unwrap();
        c.write_u8(self.read_version).unwrap();
        c.write_u8(self.reserved_bytes_per_page).unwrap();
        c.write_u8(64).unwrap();
        c.write_u8(32).unwrap();
        c.write_u8(32).unwrap();
        c.write_u32::<BigEndian>(self.file_change_counter).unwrap();
        c.write_u32::<BigEndian>(self.page_count).unwrap();
        c.write_u32::<BigEndian>(self.freelist_head).unwrap();
        c.write_u32::<BigEndian>(self.freelist_count).unwrap();
        c.write_u32::<BigEndian>(self.schema_cookie).unwrap();
        c.write_u32::<BigEndian>(self.schema_format).unwrap();
        c.write_u32::<BigEndian>(self.default_cache_size).unwrap();
        c.write_u32::<BigEndian>(self.largest_root_page).unwrap();
        c.write_u32::<BigEndian>(self.text_encoding).unwrap();
        c.write_u32::<BigEndian>(self.user_version).unwrap();
        c.write_u32::<BigEndian>(self.incremental_vacuum).unwrap();
        c.write_u32::<BigEndian>(self.application_id).unwrap();
        c.write_all(&[0_u8; 20]).unwrap();
        c.write_u32::<BigEndian>(self.version_valid_for).unwrap();
        c.write_u32::<BigEndian>(self.sqlite_version_number).unwrap();
    }
}

#[test]
fn test_header_round_trip() {
    let mut h = DbHeader::new(4096, 0);
    h.page_count = 7;
    h.freelist_head = 5;
    h.freelist_count = 2;
    h.file_change_counter = 42;
    let mut page = vec![0_u8; 4096];
    h.write(&mut page);
    assert_eq!(DbHeader::parse(&page).unwrap(), h);
}

#[test]
fn test_header_64k_page_size_sentinel() {
    let h = DbHeader::new(65536, 0);
    let mut page = vec![0_u8; DB_HEADER_SIZE];
    h.write(&mut page);
    // Stored as the sentinel value 1.
    assert_eq!(&page[16..18], &[0x00, 0x01]);
    assert_eq!(DbHeader::parse(&page).unwrap().page_size, 65536);
}

#[test]
fn test_header_bad_magic() {
    let mut page = vec![0_u8; DB_HEADER_SIZE];
    DbHeader::new(4096, 0).write(&mut page);
    page[0] = b'X';
    assert_eq!(DbHeader::parse(&page), Err(Error::BadMagic));
}

#[test]
fn test_header_bad_page_size() {
    let mut page = vec![0_u8; DB_HEADER_SIZE];
    DbHeader::new(4096, 0).write(&mut page);
    page[16] = 0x00;
    page[17] = 0x03; // 3 is not a power of two
    assert_eq!(DbHeader::parse(&page), Err(Error::UnsupportedPageSize(3)));
}

#[test]
fn test_header_truncated() {
    assert_eq!(DbHeader::parse(&[0_u8; 50]), Err(Error::Truncated));
}
