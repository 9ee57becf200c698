use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters and stage flags shared by every stage of one pipeline run.
///
/// `items_loaded` is raised before a request enters the request queue, so
/// `items_completed <= items_loaded` holds whenever `items_completed` is read
/// before `items_loaded`. Readers tolerate stale values; the predicates below
/// are re-evaluated on every poll.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    items_loaded: AtomicU64,
    items_completed: AtomicU64,
    loading_finished: AtomicBool,
    replies_finished: AtomicBool,
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more loaded item, returning the new total.
    pub fn record_loaded(&self) -> u64 {
        self.items_loaded.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Undo a [`record_loaded`](Self::record_loaded) for an item that never
    /// entered the queue.
    pub fn revoke_loaded(&self) {
        self.items_loaded.fetch_sub(1, Ordering::AcqRel);
    }

    /// Count one more completed item, returning the new total.
    pub fn record_completed(&self) -> u64 {
        self.items_completed.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn items_loaded(&self) -> u64 {
        self.items_loaded.load(Ordering::Acquire)
    }

    pub fn items_completed(&self) -> u64 {
        self.items_completed.load(Ordering::Acquire)
    }

    /// Mark the record source as exhausted. No more items will be loaded.
    pub fn finish_loading(&self) {
        self.loading_finished.store(true, Ordering::Release);
    }

    pub fn loading_finished(&self) -> bool {
        self.loading_finished.load(Ordering::Acquire)
    }

    /// Mark the reply stream as ended. No more replies will be enqueued.
    pub fn finish_replies(&self) {
        self.replies_finished.store(true, Ordering::Release);
    }

    pub fn replies_finished(&self) -> bool {
        self.replies_finished.load(Ordering::Acquire)
    }

    /// Every loaded item has been completed and loading is over.
    pub fn is_drained(&self) -> bool {
        if !self.loading_finished() {
            return false;
        }
        let completed = self.items_completed();
        completed >= self.items_loaded()
    }
}
