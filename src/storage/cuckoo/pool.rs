//! A pool of read-only file mappings shared by the read path. Data files
//! are immutable below their recorded size, so mappings can be cached and
//! handed to concurrent readers; a mapping is identified by its file ID
//! *and* the file size it was created for, since sealing a file appends a
//! hint footer and grows it.

use std::{collections::HashMap, fs::File, path::Path, sync::Arc};

use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use tracing::debug;

use super::Error;

/// Soft cap on the number of mappings kept alive; unused mappings are
/// evicted past it.
const MAX_NUM_FILES: usize = 2048;

#[derive(Debug)]
struct FileResource {
    fileid: u32,
    filesize: u64,
    mmap: Arc<Mmap>,
    num_references: u32,
}

#[derive(Debug, Default)]
struct PoolInner {
    /// Mappings with no outstanding references, retained for reuse.
    unused: Vec<FileResource>,

    /// Mappings currently referenced by at least one reader.
    used: HashMap<(u32, u64), FileResource>,
}

/// A reference-counted cache of memory-mapped data files.
#[derive(Debug, Default)]
pub(super) struct FilePool {
    inner: Mutex<PoolInner>,
}

/// A borrowed mapping; the reference is released back to the pool on drop.
#[derive(Debug)]
pub(super) struct FileGuard {
    pool: Arc<FilePool>,
    fileid: u32,
    filesize: u64,
    mmap: Arc<Mmap>,
}

impl FileGuard {
    /// The mapped bytes, valid for `[0, filesize)`.
    pub(super) fn bytes(&self) -> &[u8] {
        &self.mmap
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        self.pool.release(self.fileid, self.filesize);
    }
}

impl FilePool {
    /// Get a mapping of the file at `path` valid for `[0, filesize)` reads.
    /// A cached mapping of the same file with a different size is discarded
    /// first: the file has grown since and the stale mapping must not be
    /// handed out again.
    pub(super) fn get(
        self: &Arc<Self>,
        fileid: u32,
        path: &Path,
        filesize: u64,
    ) -> Result<FileGuard, Error> {
        let mut inner = self.inner.lock();

        inner
            .unused
            .retain(|resource| resource.fileid != fileid || resource.filesize == filesize);

        if let Some(pos) = inner
            .unused
            .iter()
            .position(|resource| resource.fileid == fileid && resource.filesize == filesize)
        {
            let mut resource = inner.unused.swap_remove(pos);
            resource.num_references = 1;
            let mmap = Arc::clone(&resource.mmap);
            inner.used.insert((fileid, filesize), resource);
            return Ok(self.guard(fileid, filesize, mmap));
        }

        if let Some(resource) = inner.used.get_mut(&(fileid, filesize)) {
            resource.num_references += 1;
            let mmap = Arc::clone(&resource.mmap);
            return Ok(self.guard(fileid, filesize, mmap));
        }

        if inner.used.len() + inner.unused.len() >= MAX_NUM_FILES && !inner.unused.is_empty() {
            let evicted = inner.unused.remove(0);
            debug!(
                fileid = evicted.fileid,
                filesize = evicted.filesize,
                "evicted unused file mapping"
            );
        }

        let file = File::open(path)?;
        // SAFETY: data files are append-only and never truncated below the
        // size recorded for them, so the mapped range stays valid for the
        // lifetime of the mapping.
        let mmap = unsafe { MmapOptions::new().len(filesize as usize).map(&file)? };
        let mmap = Arc::new(mmap);
        inner.used.insert(
            (fileid, filesize),
            FileResource {
                fileid,
                filesize,
                mmap: Arc::clone(&mmap),
                num_references: 1,
            },
        );
        debug!(fileid, filesize, "mapped data file");
        Ok(self.guard(fileid, filesize, mmap))
    }

    fn guard(self: &Arc<Self>, fileid: u32, filesize: u64, mmap: Arc<Mmap>) -> FileGuard {
        FileGuard {
            pool: Arc::clone(self),
            fileid,
            filesize,
            mmap,
        }
    }

    fn release(&self, fileid: u32, filesize: u64) {
        let mut inner = self.inner.lock();
        let key = (fileid, filesize);
        let drained = match inner.used.get_mut(&key) {
            Some(resource) if resource.num_references > 1 => {
                resource.num_references -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if drained {
            if let Some(mut resource) = inner.used.remove(&key) {
                resource.num_references = 0;
                inner.unused.push(resource);
            }
        }
    }
}
