//! Timer-flushed batch writing.
//!
//! Each underlying table gets a [`BatchWriter`] that coalesces puts and
//! flushes either explicitly or when the write delay elapses without new
//! traffic. Write failures are logged and the affected items dropped;
//! retry is the producer's concern.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::kv::{Item, KvBatch, KvError};
use crate::pool::{ScheduledPool, TaskHandle};

struct WriterState<B: KvBatch> {
    batch: B,
    pending_flush: Option<TaskHandle>,
}

pub struct BatchWriter<B: KvBatch> {
    state: Arc<Mutex<WriterState<B>>>,
    pool: Arc<ScheduledPool>,
    delay: Duration,
}

impl<B: KvBatch> BatchWriter<B> {
    pub fn new(batch: B, pool: Arc<ScheduledPool>, delay: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(WriterState {
                batch,
                pending_flush: None,
            })),
            pool,
            delay,
        }
    }

    /// Append an item and (re)arm the flush timer. A put that fails at
    /// the batch layer is reported and dropped.
    pub fn put(&self, item: Item) {
        let mut state = self.state.lock().unwrap();

        if let Some(handle) = state.pending_flush.take() {
            self.pool.cancel(handle);
        }

        if let Err(error) = state.batch.put(item) {
            warn!(%error, "dropping datapoint, batch put failed");
            return;
        }

        let timer_state = Arc::clone(&self.state);
        let handle = self.pool.schedule(self.delay, move || {
            Self::timed_flush(&timer_state);
        });
        state.pending_flush = Some(handle);
    }

    /// Drain the batch immediately.
    pub fn flush(&self) -> Result<(), KvError> {
        let mut state = self.state.lock().unwrap();

        if let Some(handle) = state.pending_flush.take() {
            self.pool.cancel(handle);
        }

        state.batch.flush()
    }

    fn timed_flush(state: &Mutex<WriterState<B>>) {
        let mut state = state.lock().unwrap();
        state.pending_flush = None;

        if let Err(error) = state.batch.flush() {
            warn!(%error, "timed batch flush failed");
        }
    }
}

impl<B: KvBatch> Clone for BatchWriter<B> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            pool: Arc::clone(&self.pool),
            delay: self.delay,
        }
    }
}
