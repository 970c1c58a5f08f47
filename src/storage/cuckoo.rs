//! An embeddable, persistent key-value store built on the Bitcask model:
//! an append-only, log-structured data layout with an in-memory hash index
//! pointing into immutable data files.
//!
//! A write is absorbed by the double-buffered cache and acknowledged
//! immediately. A background flusher freezes a full buffer and hands it to
//! the storage engine's data worker, which appends the entries to the
//! active data file; the index worker then publishes the `(hashed key,
//! location)` pairs and finally releases the frozen buffer. The three
//! stages are connected by synchronous event rendezvous, so a batch is
//! resolvable through the index before the cache is allowed to drop it,
//! and the cache cannot outrun the pipeline.
//!
//! A read checks the cache first (the newest occurrence of the key wins)
//! and otherwise walks the index candidates for the key's hash from the
//! newest to the oldest, decoding records out of memory-mapped data files.

mod cache;
mod config;
mod datafile;
mod engine;
mod event;
mod keydir;
mod manager;
mod pool;
mod utils;

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error};

pub use self::config::{Config, ReadOptions, WriteOptions};
use self::{cache::Cache, engine::StorageEngine, event::EventManager};
use super::KeyValueStorage;

/// Error returned by CuckooDB.
#[derive(Error, Debug)]
pub enum Error {
    /// Error from I/O operations.
    #[error("I/O error - {0}")]
    Io(#[from] io::Error),

    /// Data on disk did not decode or failed its checksum.
    #[error("corruption error - {0}")]
    Corruption(String),

    /// The operation was given an argument it cannot work with.
    #[error("invalid argument - {0}")]
    InvalidArgument(String),
}

/// The kind of operation an [`Entry`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Put,
    Delete,
}

/// One user-level write operation, as buffered by the cache and serialized
/// into a data file. Deletes carry an empty value and are regular records;
/// the log never forgets, it appends.
#[derive(Debug, Clone)]
struct Entry {
    /// The thread that issued the write; diagnostic only.
    origin: thread::ThreadId,
    write_options: WriteOptions,
    kind: EntryKind,
    key: Bytes,
    value: Bytes,
    /// Checksum over the key and value bytes, computed at ingest.
    checksum: u32,
}

impl Entry {
    fn put(write_options: WriteOptions, key: Bytes, value: Bytes) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&key);
        hasher.update(&value);
        Self {
            origin: thread::current().id(),
            write_options,
            kind: EntryKind::Put,
            checksum: hasher.finalize(),
            key,
            value,
        }
    }

    fn delete(write_options: WriteOptions, key: Bytes) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&key);
        Self {
            origin: thread::current().id(),
            write_options,
            kind: EntryKind::Delete,
            checksum: hasher.finalize(),
            key,
            value: Bytes::new(),
        }
    }

    fn is_delete(&self) -> bool {
        self.kind == EntryKind::Delete
    }

    /// Number of key and value bytes, as accounted by the cache threshold.
    fn kv_size(&self) -> u64 {
        self.key.len() as u64 + self.value.len() as u64
    }
}

/// The result of looking a key up in the cache or through the index.
#[derive(Debug)]
enum Lookup {
    /// The newest record for the key holds this value.
    Value(Bytes),
    /// The newest record for the key is a delete.
    Tombstone,
    /// The key is not known.
    Miss,
}

/// The background threads owned by a database instance.
#[derive(Debug)]
struct Workers {
    flusher: JoinHandle<()>,
    run_data: JoinHandle<()>,
    run_index: JoinHandle<()>,
}

/// A CuckooDB instance: a directory of append-only data files fronted by a
/// double-buffered write cache. Create one through [`Config::open`]; share
/// it across threads behind an [`Arc`].
///
/// Writes are acknowledged once cached. They become durable when their
/// batch is flushed — guaranteed against process crash only for batches
/// that asked for [`WriteOptions::sync`] — and they become recoverable
/// across restarts once their data file is sealed, which [`CuckooDb::close`]
/// does for the active file.
#[derive(Debug)]
pub struct CuckooDb {
    path: PathBuf,
    cache: Cache,
    engine: StorageEngine,
    workers: Mutex<Option<Workers>>,
    closed: AtomicBool,
}

impl CuckooDb {
    /// Open the database at `path`, rebuilding the index from the data
    /// files found there, and start the background pipeline.
    fn open<P>(path: P, conf: Config) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        let exists = path.is_dir();
        if exists && conf.error_if_exists {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("database directory {} already exists", path.display()),
            )));
        }
        if !exists {
            if !conf.create_if_missing {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("database directory {} does not exist", path.display()),
                )));
            }
            fs::create_dir_all(&path)?;
        }

        let events = Arc::new(EventManager::new());
        let engine = StorageEngine::new(conf.clone(), path.clone(), Arc::clone(&events));
        // Recovery runs strictly before any worker starts.
        engine.load()?;
        let cache = Cache::new(&conf, Arc::clone(&events));

        let (run_data, run_index) = engine.start()?;
        let flusher = cache.start()?;
        debug!(path = %path.display(), "opened database");

        Ok(Self {
            path,
            cache,
            engine,
            workers: Mutex::new(Some(Workers {
                flusher,
                run_data,
                run_index,
            })),
            closed: AtomicBool::new(false),
        })
    }

    /// Set the value of a key. Returns as soon as the write is cached; see
    /// [`WriteOptions::sync`] for the durability contract.
    pub fn put(&self, write_options: WriteOptions, key: Bytes, value: Bytes) -> Result<(), Error> {
        self.check_open()?;
        check_key(&key)?;
        self.cache.push(Entry::put(write_options, key, value));
        Ok(())
    }

    /// Delete a key. Later reads return nothing for it until it is put
    /// again; the delete itself is one more record in the log.
    pub fn delete(&self, write_options: WriteOptions, key: Bytes) -> Result<(), Error> {
        self.check_open()?;
        check_key(&key)?;
        self.cache.push(Entry::delete(write_options, key));
        Ok(())
    }

    /// Get the newest value of a key, from the cache if it is still there
    /// or from the data files through the index.
    pub fn get(&self, read_options: ReadOptions, key: &[u8]) -> Result<Option<Bytes>, Error> {
        self.check_open()?;
        check_key(key)?;
        match self.cache.get(key) {
            Lookup::Value(value) => return Ok(Some(value)),
            Lookup::Tombstone => return Ok(None),
            Lookup::Miss => {}
        }
        match self.engine.get(read_options, key)? {
            Lookup::Value(value) => Ok(Some(value)),
            Lookup::Tombstone | Lookup::Miss => Ok(None),
        }
    }

    /// Block until every write issued so far has been persisted and is
    /// resolvable through the index.
    pub fn flush(&self) -> Result<(), Error> {
        self.check_open()?;
        self.cache.drain();
        Ok(())
    }

    /// Shut the database down: drain the cache, seal the active data file,
    /// and join the background threads. Idempotent; also run on drop.
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cache.close();
        let workers = match self.workers.lock().take() {
            Some(workers) => workers,
            None => return Ok(()),
        };
        // The flusher exits once both buffers are empty; everything it had
        // in flight has passed through the still-running pipeline by then.
        if workers.flusher.join().is_err() {
            error!("cache flusher panicked");
        }
        let result = self.engine.close();
        if workers.run_data.join().is_err() {
            error!("data worker panicked");
        }
        if workers.run_index.join().is_err() {
            error!("index worker panicked");
        }
        debug!(path = %self.path.display(), "closed database");
        result
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidArgument("database is closed".to_string()));
        }
        Ok(())
    }
}

fn check_key(key: &[u8]) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key must not be empty".to_string()));
    }
    Ok(())
}

impl Drop for CuckooDb {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(cause = %e, "error while closing database");
        }
    }
}

impl KeyValueStorage for CuckooDb {
    type Error = Error;

    fn set(&self, key: Bytes, value: Bytes) -> Result<(), Self::Error> {
        self.put(WriteOptions::default(), key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Self::Error> {
        self.get(ReadOptions::default(), key)
    }

    fn del(&self, key: Bytes) -> Result<(), Self::Error> {
        self.delete(WriteOptions::default(), key)
    }
}
