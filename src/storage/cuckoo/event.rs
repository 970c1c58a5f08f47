//! Rendezvous primitives connecting the stages of the persistence pipeline.

use parking_lot::{Condvar, Mutex};

use super::{keydir::IndexBatch, Entry};

/// A one-slot rendezvous between a single producer and a single consumer.
///
/// The producer publishes a payload with [`notify_and_wait`] and blocks
/// until the consumer acknowledges it with [`done`]. The consumer blocks in
/// [`wait`] until a payload is available and receives a copy of it; the slot
/// is only cleared by `done`. This is a synchronous handshake, not a queue:
/// the producer cannot publish again until the previous payload has been
/// acknowledged, which is what backpressures the write cache.
///
/// [`notify_and_wait`]: Event::notify_and_wait
/// [`done`]: Event::done
/// [`wait`]: Event::wait
#[derive(Debug, Default)]
pub(super) struct Event<T> {
    /// Serializes producers so only one payload is in flight at a time.
    producer: Mutex<()>,

    /// The payload slot; `Some` while a payload is published and
    /// unacknowledged.
    slot: Mutex<Option<T>>,

    /// Signalled when a payload becomes available, or by `notify`.
    cv_ready: Condvar,

    /// Signalled when the consumer acknowledges the payload.
    cv_done: Condvar,
}

impl<T: Clone> Event<T> {
    /// Publish `data`, wake the consumer, and block until it calls
    /// [`Event::done`]. A producer that finds a previous payload still
    /// unacknowledged blocks until the slot is free.
    pub(super) fn notify_and_wait(&self, data: T) {
        let _turn = self.producer.lock();
        let mut slot = self.slot.lock();
        *slot = Some(data);
        self.cv_ready.notify_one();
        while slot.is_some() {
            self.cv_done.wait(&mut slot);
        }
    }

    /// Block until a payload is available and return a copy of it without
    /// consuming it. Returns `None` when woken by [`Event::notify`] with
    /// nothing published, so background loops can observe their stop flag.
    pub(super) fn wait(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            self.cv_ready.wait(&mut slot);
        }
        slot.clone()
    }

    /// Acknowledge the current payload: clear the slot and release the
    /// producer blocked in [`Event::notify_and_wait`].
    pub(super) fn done(&self) {
        let mut slot = self.slot.lock();
        *slot = None;
        self.cv_done.notify_one();
    }

    /// Wake a thread blocked in [`Event::wait`] even though no payload has
    /// been published. Used during shutdown.
    pub(super) fn notify(&self) {
        let _slot = self.slot.lock();
        self.cv_ready.notify_one();
    }
}

/// The events registered for the ingest → persist → index pipeline. A
/// merge pass would register a compaction-status event here as well.
#[derive(Debug, Default)]
pub(super) struct EventManager {
    /// Cache flusher → data worker: a frozen buffer of entries to persist.
    pub(super) flush_cache: Event<Vec<Entry>>,

    /// Data worker → index worker: the locations assigned to a batch.
    pub(super) update_index: Event<IndexBatch>,

    /// Index worker → cache flusher: the batch is resolvable through the
    /// index, the frozen buffer may be cleared.
    pub(super) clear_cache: Event<()>,
}

impl EventManager {
    pub(super) fn new() -> Self {
        Self::default()
    }
}
