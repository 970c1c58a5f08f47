//! Management of the append-only data files. At any point in time at most
//! one file is open for writing; entries are serialized into a write buffer
//! and appended to it, and the file is sealed with a hint footer once it
//! grows past the configured size limit. Sealed files are immutable and the
//! in-memory index is rebuilt from their footers when the database opens.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::PathBuf,
    thread,
    time::Duration,
};

use dashmap::DashMap;
use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::{debug, error, warn};
use xxhash_rust::xxh64::xxh64;

use super::{
    config::Config,
    datafile::{
        DataFileFooter, DataFileHeader, EntryHeader, HintRecord, DATAFILE_VERSION,
        FILETYPE_UNCOMPACTED,
    },
    keydir::{pack_location, IndexBatch, KeyDir},
    utils, Entry, Error,
};

/// Interval between attempts to create a new data file after a failure.
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(5000);

/// The monotonic counters assigning file IDs and logical timestamps.
#[derive(Debug, Default)]
struct Sequences {
    fileid: u32,
    timestamp: u64,
}

/// The currently open data file together with its write buffer. The buffer
/// holds the bytes for the file range `[offset_start, offset_end)` that have
/// not reached the file yet.
#[derive(Debug)]
struct ActiveFile {
    file: File,
    fileid: u32,
    timestamp: u64,
    offset_start: u64,
    offset_end: u64,
    buffer: Vec<u8>,
    hints: Vec<HintRecord>,
    num_entries: u64,
    wants_sync: bool,
}

#[derive(Debug)]
pub(super) struct DataFileManager {
    conf: Config,
    dir: PathBuf,
    sequences: Mutex<Sequences>,
    active: Mutex<Option<ActiveFile>>,

    /// Current size of every data file, as of its last flush; the read
    /// path sizes its mappings from this.
    resources: DashMap<u32, u64>,
}

impl DataFileManager {
    pub(super) fn new(conf: Config, dir: PathBuf) -> Self {
        Self {
            conf,
            dir,
            sequences: Mutex::default(),
            active: Mutex::new(None),
            resources: DashMap::default(),
        }
    }

    /// Size of the file with the given ID, as of its last flush.
    pub(super) fn file_size(&self, fileid: u32) -> Option<u64> {
        self.resources.get(&fileid).map(|entry| *entry.value())
    }

    /// Append a batch of entries to the active data file, rotating files on
    /// the size limit, and return the `(hashed key, location)` pairs to be
    /// published into the index. Pairs appear in batch order, so records of
    /// one key keep the order in which the user wrote them.
    #[tracing::instrument(level = "debug", skip(self, entries))]
    pub(super) fn write_entries(&self, entries: &[Entry]) -> Result<IndexBatch, Error> {
        let mut batch = IndexBatch::with_capacity(entries.len());
        let mut active = self.active.lock();

        for entry in entries {
            let needs_rotation = active
                .as_ref()
                .map_or(false, |file| file.offset_end > self.conf.max_file_size.as_u64());
            if needs_rotation {
                if let Err(e) = self.flush_current(&mut active, true) {
                    // Abandon the broken file; the next entry starts fresh.
                    *active = None;
                    return Err(e);
                }
            }
            if active.is_none() {
                *active = Some(self.open_new_file());
            }

            let file = active.as_mut().expect("a data file is open");
            let hashed_key = xxh64(&entry.key, 0);
            let offset = file.offset_end;
            let offset32 = u32::try_from(offset).map_err(|_| {
                Error::InvalidArgument("entry exceeds the maximum data file offset".to_string())
            })?;

            let mut header = EntryHeader {
                crc32: entry.checksum,
                flags: 0,
                timestamp: file.timestamp,
                size_key: entry.key.len() as u64,
                size_value: entry.value.len() as u64,
                hash: hashed_key,
            };
            if entry.is_delete() {
                header.set_delete();
            }
            let header_size = header.encode_to(&mut file.buffer);
            file.buffer.extend_from_slice(&entry.key);
            file.buffer.extend_from_slice(&entry.value);

            batch.push((hashed_key, pack_location(file.fileid, offset32)));
            file.hints.push(HintRecord {
                hashed_key,
                offset_entry: offset32,
            });
            file.num_entries += 1;
            file.wants_sync |= entry.write_options.sync;
            file.offset_end =
                offset + header_size as u64 + entry.key.len() as u64 + entry.value.len() as u64;

            debug!(
                fileid = file.fileid,
                offset,
                hashed_key,
                origin = ?entry.origin,
                delete = entry.is_delete(),
                "appended entry record"
            );
        }

        if let Err(e) = self.flush_current(&mut active, false) {
            *active = None;
            return Err(e);
        }
        Ok(batch)
    }

    /// Seal the active data file, if there is one.
    pub(super) fn close(&self) -> Result<(), Error> {
        let mut active = self.active.lock();
        self.flush_current(&mut active, true)
    }

    /// Write the buffered bytes of the active file out, synchronize it when
    /// the batch asked for it, and seal the file when it passed the size
    /// limit or rotation is forced.
    fn flush_current(&self, active: &mut Option<ActiveFile>, force: bool) -> Result<(), Error> {
        let file = match active.as_mut() {
            Some(file) => file,
            None => return Ok(()),
        };

        if !file.buffer.is_empty() {
            file.file.write_all(&file.buffer)?;
            file.buffer.clear();
            file.offset_start = file.offset_end;
            if file.wants_sync {
                file.file.sync_data()?;
                file.wants_sync = false;
            }
            self.resources.insert(file.fileid, file.offset_end);
            debug!(
                fileid = file.fileid,
                size = file.offset_end,
                "flushed data file buffer"
            );
        }

        if force || file.offset_end >= self.conf.max_file_size.as_u64() {
            let file = active.take().expect("a data file is open");
            self.seal_file(file)?;
        }
        Ok(())
    }

    /// Seal a data file: cut it to its exact data size, append the hint
    /// records and the footer, and close it.
    fn seal_file(&self, file: ActiveFile) -> Result<(), Error> {
        debug_assert!(file.buffer.is_empty());
        file.file.set_len(file.offset_end)?;

        let offset_indexes = file.offset_end;
        let mut blob = Vec::with_capacity(file.hints.len() * 12 + DataFileFooter::FIXED_SIZE);
        for hint in &file.hints {
            hint.encode_to(&mut blob);
        }
        let footer = DataFileFooter {
            filetype: FILETYPE_UNCOMPACTED,
            flags: 0,
            offset_indexes,
            num_entries: file.num_entries,
            crc32: 0,
        };
        footer.encode_to(&mut blob);
        // The trailing 4 bytes guard the whole hint region and the footer.
        let crc32 = crc32fast::hash(&blob[..blob.len() - 4]);
        let len = blob.len();
        blob[len - 4..].copy_from_slice(&crc32.to_le_bytes());

        let mut fd = file.file;
        fd.write_all(&blob)?;
        let final_size = offset_indexes + blob.len() as u64;
        fd.set_len(final_size)?;
        drop(fd);

        self.resources.insert(file.fileid, final_size);
        debug!(
            fileid = file.fileid,
            num_entries = file.num_entries,
            size = final_size,
            "sealed data file"
        );
        Ok(())
    }

    /// Open the next data file and stamp its header into the write buffer.
    /// Failure to create the file is retried indefinitely; the pipeline (and
    /// through its backpressure, the write cache) stalls until it succeeds.
    fn open_new_file(&self) -> ActiveFile {
        let (fileid, timestamp) = {
            let mut sequences = self.sequences.lock();
            sequences.fileid += 1;
            sequences.timestamp += 1;
            (sequences.fileid, sequences.timestamp)
        };
        let path = utils::datafile_name(&self.dir, fileid);
        let file = loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break file,
                Err(e) => {
                    error!(
                        cause = %e,
                        path = %path.display(),
                        "could not create data file, retrying"
                    );
                    thread::sleep(OPEN_RETRY_INTERVAL);
                }
            }
        };

        let header_size = self.conf.datafile_header_size as usize;
        let mut buffer = vec![0u8; header_size];
        let header = DataFileHeader {
            version: DATAFILE_VERSION,
            filetype: FILETYPE_UNCOMPACTED,
            timestamp,
        };
        header.encode_to(&mut buffer[..DataFileHeader::FIXED_SIZE]);

        debug!(fileid, timestamp, path = %path.display(), "opened new data file");
        ActiveFile {
            file,
            fileid,
            timestamp,
            offset_start: 0,
            offset_end: header_size as u64,
            buffer,
            hints: Vec::new(),
            num_entries: 0,
            wants_sync: false,
        }
    }

    /// Rebuild the in-memory index from the hint footers of every data file
    /// in the database directory. Files whose header or footer does not
    /// validate are skipped: losing the tail of a crashed write is expected
    /// and tolerated. Must run before any background worker starts.
    pub(super) fn load_database(&self) -> Result<KeyDir, Error> {
        self.clean_stale_files()?;

        struct Candidate {
            fileid: u32,
            timestamp: u64,
            size: u64,
            mmap: Mmap,
        }

        let header_size = u64::from(self.conf.datafile_header_size);
        let mut candidates = Vec::new();
        let mut max_fileid = 0u32;
        for (fileid, path) in utils::datafile_ids(&self.dir)? {
            // Every id ever assigned is retired, loadable or not: a crash
            // between creating a file and writing to it leaves an empty
            // file whose name must not be handed out again.
            max_fileid = max_fileid.max(fileid);
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!(cause = %e, path = %path.display(), "skipping unreadable data file");
                    continue;
                }
            };
            let size = file.metadata()?.len();
            if size <= header_size {
                warn!(path = %path.display(), size, "skipping truncated data file");
                continue;
            }
            // SAFETY: files under the database directory are owned by this
            // instance and are not mutated while it is being opened.
            let mmap = unsafe { Mmap::map(&file)? };
            match DataFileHeader::decode_from(&mmap) {
                Ok(header) => candidates.push(Candidate {
                    fileid,
                    timestamp: header.timestamp,
                    size,
                    mmap,
                }),
                Err(e) => {
                    warn!(cause = %e, path = %path.display(), "skipping data file with invalid header");
                }
            }
        }

        // Replaying files in the order they were written lets newer records
        // land behind older ones under a shared hashed key.
        candidates.sort_by_key(|candidate| (candidate.timestamp, candidate.fileid));

        let mut keydir = KeyDir::default();
        let mut max_timestamp = 0u64;
        'files: for candidate in candidates {
            max_timestamp = max_timestamp.max(candidate.timestamp);

            let size = candidate.size as usize;
            if size < DataFileFooter::FIXED_SIZE {
                warn!(fileid = candidate.fileid, "skipping data file without a footer");
                continue;
            }
            let footer = match DataFileFooter::decode_from(&candidate.mmap[size - DataFileFooter::FIXED_SIZE..]) {
                Ok(footer) => footer,
                Err(e) => {
                    warn!(cause = %e, fileid = candidate.fileid, "skipping data file with invalid footer");
                    continue;
                }
            };
            let offset_indexes = footer.offset_indexes as usize;
            if offset_indexes > size - DataFileFooter::FIXED_SIZE {
                warn!(fileid = candidate.fileid, "skipping data file with invalid hint offset");
                continue;
            }
            let crc32 = crc32fast::hash(&candidate.mmap[offset_indexes..size - 4]);
            if crc32 != footer.crc32 {
                warn!(fileid = candidate.fileid, "skipping data file with footer checksum mismatch");
                continue;
            }

            let mut region = &candidate.mmap[offset_indexes..size - DataFileFooter::FIXED_SIZE];
            let mut hints = Vec::with_capacity(footer.num_entries as usize);
            for _ in 0..footer.num_entries {
                match HintRecord::decode_from(&mut region) {
                    Ok(hint) => hints.push(hint),
                    Err(e) => {
                        warn!(cause = %e, fileid = candidate.fileid, "skipping data file with invalid hint record");
                        continue 'files;
                    }
                }
            }
            for hint in hints {
                keydir.insert(
                    hint.hashed_key,
                    pack_location(candidate.fileid, hint.offset_entry),
                );
            }
            self.resources.insert(candidate.fileid, candidate.size);
            debug!(
                fileid = candidate.fileid,
                num_entries = footer.num_entries,
                compacted = footer.is_compacted(),
                has_invalid_entries = footer.has_invalid_entries(),
                "loaded data file"
            );
        }

        {
            let mut sequences = self.sequences.lock();
            sequences.fileid = max_fileid;
            sequences.timestamp = max_timestamp;
        }
        debug!(
            num_locations = keydir.len(),
            next_fileid = max_fileid + 1,
            "rebuilt index from data files"
        );
        Ok(keydir)
    }

    /// Make sure the lock directory exists and delete leftovers of an
    /// interrupted merge pass and stale lock files.
    fn clean_stale_files(&self) -> Result<(), Error> {
        let locks_dir = self.dir.join(utils::LOCKS_DIR);
        fs::create_dir_all(&locks_dir)?;
        for dirent in fs::read_dir(&locks_dir)? {
            let dirent = dirent?;
            if dirent.file_type()?.is_file() {
                if let Err(e) = fs::remove_file(dirent.path()) {
                    warn!(cause = %e, path = %dirent.path().display(), "could not remove stale lock file");
                }
            }
        }
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let is_compaction_leftover = name
                .to_str()
                .map_or(false, |name| name.starts_with(utils::COMPACTION_PREFIX));
            if is_compaction_leftover && dirent.file_type()?.is_file() {
                if let Err(e) = fs::remove_file(dirent.path()) {
                    warn!(cause = %e, path = %dirent.path().display(), "could not remove stale compaction file");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use bytesize::ByteSize;

    use super::super::WriteOptions;
    use super::*;

    fn test_manager(dir: &std::path::Path, max_file_size: ByteSize) -> DataFileManager {
        let conf = Config::default()
            .datafile_header_size(64)
            .max_file_size(max_file_size)
            .to_owned();
        DataFileManager::new(conf, dir.to_path_buf())
    }

    fn put(key: &str, value: &str) -> Entry {
        Entry::put(
            WriteOptions::default(),
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        )
    }

    #[test]
    fn batch_locations_keep_user_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), ByteSize::mib(1));

        let entries = vec![put("a", "1"), put("b", "2"), put("a", "3")];
        let batch = manager.write_entries(&entries).unwrap();
        assert_eq!(3, batch.len());
        // Offsets are strictly increasing within a batch.
        for window in batch.windows(2) {
            assert!(window[0].1 < window[1].1);
        }
        // Both writes of "a" hash identically and keep their order.
        assert_eq!(batch[0].0, batch[2].0);
        assert_eq!(xxh64(b"a", 0), batch[0].0);
    }

    #[test]
    fn sealed_file_rebuilds_the_same_index() {
        let dir = tempfile::tempdir().unwrap();
        let written = {
            let manager = test_manager(dir.path(), ByteSize::mib(1));
            let entries: Vec<Entry> = (0..100)
                .map(|i| put(&format!("key{}", i), &format!("value{}", i)))
                .collect();
            let batch = manager.write_entries(&entries).unwrap();
            manager.close().unwrap();
            batch
        };

        let manager = test_manager(dir.path(), ByteSize::mib(1));
        let keydir = manager.load_database().unwrap();
        assert_eq!(written.len(), keydir.len());
        for (hashed_key, location) in written {
            assert!(keydir.locations(hashed_key).contains(&location));
        }
        // Sequences resume past the recovered file.
        assert_eq!(1, manager.sequences.lock().fileid);
    }

    #[test]
    fn files_rotate_past_the_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), ByteSize::b(256));

        let entries: Vec<Entry> = (0..50)
            .map(|i| put(&format!("key{}", i), &format!("value{}", i)))
            .collect();
        manager.write_entries(&entries).unwrap();
        manager.close().unwrap();

        let files = utils::datafile_ids(dir.path()).unwrap();
        assert!(files.len() > 1, "expected multiple data files");

        // All records from all files come back on load.
        let keydir = manager.load_database().unwrap();
        assert_eq!(50, keydir.len());
    }

    #[test]
    fn corrupted_file_is_skipped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let filler = "x".repeat(128);
        {
            let manager = test_manager(dir.path(), ByteSize::b(128));
            // Two files: one per batch, since each batch exceeds the limit.
            manager.write_entries(&[put("first", &filler)]).unwrap();
            manager.write_entries(&[put("second", &filler)]).unwrap();
            manager.close().unwrap();
        }

        let files = utils::datafile_ids(dir.path()).unwrap();
        assert_eq!(2, files.len());

        // Flip a byte inside the footer checksum of the first file.
        let (_, path) = files.iter().min_by_key(|(fileid, _)| *fileid).unwrap();
        let mut bytes = fs::read(path).unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0xff;
        fs::write(path, bytes).unwrap();

        let manager = test_manager(dir.path(), ByteSize::b(128));
        let keydir = manager.load_database().unwrap();
        assert_eq!(1, keydir.len());
        assert!(keydir.locations(xxh64(b"second", 0)).len() == 1);
        assert!(keydir.locations(xxh64(b"first", 0)).is_empty());
        // The corrupted file still seeds the sequences.
        assert_eq!(2, manager.sequences.lock().fileid);
    }

    #[test]
    fn crash_artifact_at_highest_id_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = test_manager(dir.path(), ByteSize::mib(1));
            manager.write_entries(&[put("k", "v")]).unwrap();
            manager.close().unwrap();
        }
        // A crash between creating a data file and writing to it leaves an
        // empty file at the highest id.
        fs::write(utils::datafile_name(dir.path(), 2), b"").unwrap();

        let manager = test_manager(dir.path(), ByteSize::mib(1));
        let keydir = manager.load_database().unwrap();
        assert_eq!(1, keydir.len());
        // The unloadable file still retires its id.
        assert_eq!(2, manager.sequences.lock().fileid);

        // The next write completes and lands in a fresh file past it.
        manager.write_entries(&[put("k2", "v2")]).unwrap();
        assert!(utils::datafile_name(dir.path(), 3).exists());
        assert_eq!(3, manager.sequences.lock().fileid);
    }

    #[test]
    fn recovery_cleans_stale_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let locks_dir = dir.path().join(utils::LOCKS_DIR);
        fs::create_dir_all(&locks_dir).unwrap();
        fs::write(locks_dir.join("00000001"), b"stale").unwrap();
        fs::write(dir.path().join("compaction-00000001"), b"stale").unwrap();

        let manager = test_manager(dir.path(), ByteSize::mib(1));
        let keydir = manager.load_database().unwrap();
        assert_eq!(0, keydir.len());
        assert!(!dir.path().join("compaction-00000001").exists());
        assert!(!locks_dir.join("00000001").exists());
    }
}
