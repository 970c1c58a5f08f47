//! The double-buffered write cache. One buffer is "live" and absorbs
//! writes; once it grows past the configured threshold the roles are
//! swapped and the frozen buffer is handed to the persistence pipeline,
//! which releases it again only after the batch is resolvable through the
//! index. Writers therefore never contend with the pipeline for the live
//! buffer, and a reader scanning the frozen buffer blocks its clearing but
//! not the ingest of new writes.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{config::Config, event::EventManager, Entry, Lookup};

/// Byte sizes and role assignment of the two buffer slots.
#[derive(Debug)]
struct SlotState {
    live: usize,
    copy: usize,
    sizes: [u64; 2],
}

#[derive(Debug)]
struct CacheShared {
    max_size: u64,
    close_timeout: Duration,

    /// Role indices and byte sizes; also the producer-side lock.
    state: Mutex<SlotState>,

    /// Wakes the flusher once the live buffer passed the threshold.
    cond_flush: Condvar,

    /// Signalled at the end of every flush cycle, for `drain` and `close`.
    cond_flushed: Condvar,

    /// The two entry buffers; `state` decides which one is live.
    slots: [Mutex<Vec<Entry>>; 2],

    /// Readers of the frozen buffer enter through this gate; the flusher
    /// holds it while waiting for them to drain, keeping new readers out.
    swap_gate: Mutex<()>,

    /// Number of readers currently scanning the frozen buffer.
    num_readers: Mutex<u32>,

    /// Signalled when a frozen-buffer reader leaves.
    cond_reader: Condvar,

    stop: AtomicBool,
}

/// The double-buffered write cache and its flusher loop.
#[derive(Debug)]
pub(super) struct Cache {
    shared: Arc<CacheShared>,
    events: Arc<EventManager>,
}

impl Cache {
    pub(super) fn new(conf: &Config, events: Arc<EventManager>) -> Self {
        let shared = Arc::new(CacheShared {
            max_size: conf.write_buffer_size.as_u64(),
            close_timeout: conf.close_timeout,
            state: Mutex::new(SlotState {
                live: 0,
                copy: 1,
                sizes: [0, 0],
            }),
            cond_flush: Condvar::new(),
            cond_flushed: Condvar::new(),
            slots: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            swap_gate: Mutex::new(()),
            num_readers: Mutex::new(0),
            cond_reader: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        Self { shared, events }
    }

    /// Start the flusher loop.
    pub(super) fn start(&self) -> std::io::Result<JoinHandle<()>> {
        let shared = Arc::clone(&self.shared);
        let events = Arc::clone(&self.events);
        thread::Builder::new()
            .name("cuckoodb-flush".to_string())
            .spawn(move || run_flusher(&shared, &events))
    }

    /// Append an entry to the live buffer. The entry is acknowledged before
    /// it is durable; the flusher is signalled once the buffer passed the
    /// threshold.
    pub(super) fn push(&self, entry: Entry) {
        let kv_size = entry.kv_size();
        debug!(origin = ?entry.origin, kv_size, "caching entry");
        let mut state = self.shared.state.lock();
        let live = state.live;
        self.shared.slots[live].lock().push(entry);
        state.sizes[live] += kv_size;
        if state.sizes[live] > self.shared.max_size {
            self.shared.cond_flush.notify_one();
        }
    }

    /// Look up the newest cached version of `key`, scanning the live buffer
    /// first and falling back to the frozen one. Within a buffer the last
    /// match wins, so the user's latest write is returned.
    pub(super) fn get(&self, key: &[u8]) -> Lookup {
        let hit = {
            let state = self.shared.state.lock();
            let slot = self.shared.slots[state.live].lock();
            drop(state);
            scan_last_match(&slot, key)
        };
        if !matches!(hit, Lookup::Miss) {
            return hit;
        }

        // Enter the frozen side as a counted reader so the flusher cannot
        // clear the buffer mid-scan.
        {
            let _gate = self.shared.swap_gate.lock();
            *self.shared.num_readers.lock() += 1;
        }
        let hit = {
            let state = self.shared.state.lock();
            let slot = self.shared.slots[state.copy].lock();
            drop(state);
            scan_last_match(&slot, key)
        };
        {
            let mut num_readers = self.shared.num_readers.lock();
            *num_readers -= 1;
            self.shared.cond_reader.notify_one();
        }
        hit
    }

    /// Block until both buffers have been flushed through the pipeline and
    /// cleared.
    pub(super) fn drain(&self) {
        let mut state = self.shared.state.lock();
        while state.sizes[0] != 0 || state.sizes[1] != 0 {
            self.shared.cond_flush.notify_one();
            let _ = self
                .shared
                .cond_flushed
                .wait_for(&mut state, Duration::from_millis(50));
        }
    }

    /// Stop the flusher, giving a flush-in-progress and a final drain a
    /// bounded chance to complete. The flusher thread exits once both
    /// buffers are empty; the caller joins it.
    pub(super) fn close(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cond_flush.notify_one();

        let mut state = self.shared.state.lock();
        for _ in 0..2 {
            if state.sizes[0] == 0 && state.sizes[1] == 0 {
                break;
            }
            self.shared.cond_flush.notify_one();
            let _ = self
                .shared
                .cond_flushed
                .wait_for(&mut state, self.shared.close_timeout);
        }
    }
}

fn scan_last_match(entries: &[Entry], key: &[u8]) -> Lookup {
    let mut hit = Lookup::Miss;
    for entry in entries {
        // No early break: a later entry for the same key supersedes.
        if entry.key == key {
            hit = if entry.is_delete() {
                Lookup::Tombstone
            } else {
                Lookup::Value(entry.value.clone())
            };
        }
    }
    hit
}

/// The flusher loop: freeze a full live buffer, hand it to the pipeline,
/// wait for the index to be published, then drain readers and clear it.
fn run_flusher(shared: &CacheShared, events: &EventManager) {
    loop {
        let copy = {
            let mut state = shared.state.lock();
            loop {
                if state.sizes[state.live] != 0 {
                    break;
                }
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                shared.cond_flush.wait(&mut state);
            }
            // Swap roles unless the previous flush has not drained yet.
            if state.sizes[state.copy] == 0 {
                let state = &mut *state;
                std::mem::swap(&mut state.live, &mut state.copy);
                debug!("swapped cache buffers");
            }
            state.copy
        };

        let batch = shared.slots[copy].lock().clone();
        debug!(num_entries = batch.len(), "handing frozen buffer to pipeline");
        events.flush_cache.notify_and_wait(batch);

        // The index worker reports back once the batch is resolvable
        // through the index; only then may the frozen buffer go away.
        events.clear_cache.wait();
        events.clear_cache.done();

        {
            let _gate = shared.swap_gate.lock();
            let mut num_readers = shared.num_readers.lock();
            while *num_readers != 0 {
                shared.cond_reader.wait(&mut num_readers);
            }
            drop(num_readers);
            shared.slots[copy].lock().clear();
        }

        let mut state = shared.state.lock();
        state.sizes[copy] = 0;
        shared.cond_flushed.notify_all();
        let empty = state.sizes[0] == 0 && state.sizes[1] == 0;
        drop(state);
        if shared.stop.load(Ordering::Acquire) && empty {
            return;
        }
    }
}
