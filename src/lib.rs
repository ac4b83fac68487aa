//! Sharc is an embedded storage engine for the on-disk format pioneered by
//! SQLite ("format 3"): a paged file organised as b-trees of
//! variable-length records, addressed by 64-bit rowids.
//!
//! There is no SQL surface here.  Callers open a [`Database`], name tables
//! and columns directly, and get decoded values back through cursors:
//!
//! ```no_run
//! use sharc::{ColumnValue, Database};
//!
//! # fn main() -> sharc::Result<()> {
//! let mut db = Database::create("inventory.db")?;
//! {
//!     let mut writer = db.writer()?;
//!     writer.create_table("CREATE TABLE part (id INTEGER PRIMARY KEY, name TEXT)")?;
//!     writer.insert("part", &[ColumnValue::Null, ColumnValue::Text(b"flux capacitor")])?;
//! }
//! let mut reader = db.reader("part")?;
//! while reader.read()? {
//!     println!("{}: {}", reader.get_int64(0)?, reader.get_string(1)?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Databases written here open under any conforming reader and
//! vice-versa; compatibility with the format is bit-exact.

pub mod btree;
pub mod cache;
pub mod database;
pub mod dbheader;
pub mod freelist;
pub mod index;
pub mod parser;
pub mod reader;
pub mod record;
pub mod schema;
pub mod serial_type;
mod transaction;
pub mod transform;
pub mod value;
pub mod varint;
pub mod vfs;
pub mod writer;

extern crate pest;
#[macro_use]
extern crate pest_derive;

pub use database::{Database, OpenOptions};
pub use reader::{Reader, RowAccessEvaluator};
pub use value::{Collation, ColumnValue};
pub use writer::{Transaction, Writer};

/// Everything that can go wrong across the engine, aggregated from the
/// per-layer error types.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Table {0} not found in database.")]
    TableNotFound(String),
    #[error("Column {0} not found in table.")]
    ColumnNotFound(String),
    #[error("Table {0} already exists.")]
    TableExists(String),
    #[error("Index {0} already exists.")]
    IndexExists(String),
    #[error("The database was opened read-only.")]
    ReadOnly,
    #[error("A transaction is already open on this writer.")]
    TransactionAlreadyOpen,
    #[error("Expected {expected} column values, got {got}.")]
    ColumnCountMismatch { expected: usize, got: usize },
    #[error("Vector dimension mismatch: expected {expected}, got {got}.")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Schema format {0} requires allow_format_downgrade.")]
    FormatDowngrade(u32),
    #[error("Requested type does not match the stored value.")]
    TypeMismatch,
    #[error("Cursor is not positioned on a row.")]
    NotPositioned,
    #[error("Unsupported operation: {0}.")]
    Unsupported(&'static str),
    #[error("Text bytes are not valid UTF-8.")]
    InvalidStringEncoding(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Header(#[from] dbheader::Error),
    #[error(transparent)]
    Source(#[from] vfs::Error),
    #[error(transparent)]
    Btree(#[from] btree::Error),
    #[error(transparent)]
    Record(#[from] record::Error),
    #[error(transparent)]
    Schema(#[from] schema::Error),
    #[error(transparent)]
    Parse(#[from] parser::Error),
    #[error(transparent)]
    Transform(#[from] transform::Error),
    #[error(transparent)]
    SerialType(#[from] serial_type::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
