use std::{path::Path, time::Duration};

use bytesize::ByteSize;

use super::{datafile::DataFileHeader, CuckooDb, Error};

/// Configuration for a [`CuckooDb`] instance.
#[derive(Debug, Clone)]
pub struct Config {
    pub(super) create_if_missing: bool,
    pub(super) error_if_exists: bool,
    pub(super) datafile_header_size: u32,
    pub(super) write_buffer_size: ByteSize,
    pub(super) max_file_size: ByteSize,
    pub(super) num_iterations_per_lock: usize,
    pub(super) close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            datafile_header_size: 4096,
            write_buffer_size: ByteSize::b(4096),
            max_file_size: ByteSize::mib(32),
            num_iterations_per_lock: 20,
            close_timeout: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Open a `CuckooDb` instance at the given path with the available
    /// options.
    pub fn open<P>(self, path: P) -> Result<CuckooDb, Error>
    where
        P: AsRef<Path>,
    {
        CuckooDb::open(path, self)
    }

    /// Set whether the database directory is created when it does not exist.
    /// Default to `true`.
    pub fn create_if_missing(&mut self, create_if_missing: bool) -> &mut Self {
        self.create_if_missing = create_if_missing;
        self
    }

    /// Set whether opening fails when the database directory already exists.
    /// Default to `false`.
    pub fn error_if_exists(&mut self, error_if_exists: bool) -> &mut Self {
        self.error_if_exists = error_if_exists;
        self
    }

    /// Set the number of bytes reserved at the start of every data file for
    /// the file header. Default to `4096`.
    ///
    /// # Panics
    ///
    /// If the given size cannot hold an encoded data file header then panics.
    pub fn datafile_header_size(&mut self, datafile_header_size: u32) -> &mut Self {
        assert!(datafile_header_size as usize >= DataFileHeader::FIXED_SIZE);
        self.datafile_header_size = datafile_header_size;
        self
    }

    /// Set the number of buffered bytes past which the write cache hands its
    /// contents to the persistence pipeline. Default to `4KiBs`.
    pub fn write_buffer_size(&mut self, write_buffer_size: ByteSize) -> &mut Self {
        self.write_buffer_size = write_buffer_size;
        self
    }

    /// Set the size past which the active data file is sealed and a new one
    /// is opened. Default to `32MiBs`.
    ///
    /// # Panics
    ///
    /// If the given size is not within `(0, 1GiB]` then panics. Record
    /// offsets are packed into 32 bits, so data files must stay well below
    /// that bound.
    pub fn max_file_size(&mut self, max_file_size: ByteSize) -> &mut Self {
        assert!(max_file_size.as_u64() > 0 && max_file_size <= ByteSize::gib(1));
        self.max_file_size = max_file_size;
        self
    }

    /// Set the number of index insertions performed per acquisition of the
    /// index write latch when a batch is published. Default to `20`.
    ///
    /// # Panics
    ///
    /// If the given count is zero then panics.
    pub fn num_iterations_per_lock(&mut self, num_iterations_per_lock: usize) -> &mut Self {
        assert!(num_iterations_per_lock > 0);
        self.num_iterations_per_lock = num_iterations_per_lock;
        self
    }

    /// Set how long `close` waits for each of the final cache flush cycles.
    /// Default to `500ms`.
    pub fn close_timeout(&mut self, close_timeout: Duration) -> &mut Self {
        self.close_timeout = close_timeout;
        self
    }
}

/// Options controlling a single write operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Synchronize the data file once the batch containing this write is
    /// flushed. A write is only a durability guarantee when this is set and
    /// the database is later closed cleanly; without it, bytes reach the
    /// kernel page cache only. Default to `false`.
    pub sync: bool,
}

/// Options controlling a single read operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Verify the stored checksum of an entry when decoding it from a data
    /// file. Default to `false`.
    pub checksum: bool,
}
