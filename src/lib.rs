//! An embeddable, persistent key-value store built on the
//! [Bitcask](https://riak.com/assets/bitcask-intro.pdf) model.
//!
//! Writes are absorbed by a double-buffered in-memory cache and handed to a
//! background pipeline that appends them to immutable data files, then
//! publishes `(hashed key, file location)` pairs into an in-memory index.
//! Reads consult the cache first and fall back to the index, decoding
//! records straight out of memory-mapped data files. On restart, the index
//! is rebuilt from the hint footer sealed into every data file.
//!
//! ```no_run
//! use bytes::Bytes;
//! use cuckoodb::{Config, ReadOptions, WriteOptions};
//!
//! # fn main() -> Result<(), cuckoodb::Error> {
//! let db = Config::default().open("my-database")?;
//! db.put(
//!     WriteOptions::default(),
//!     Bytes::from("hello"),
//!     Bytes::from("world"),
//! )?;
//! let value = db.get(ReadOptions::default(), b"hello")?;
//! assert_eq!(value, Some(Bytes::from("world")));
//! db.close()?;
//! # Ok(())
//! # }
//! ```

pub mod storage;

pub use storage::cuckoo::{Config, CuckooDb, Error, ReadOptions, WriteOptions};
pub use storage::KeyValueStorage;
