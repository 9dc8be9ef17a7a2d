//! The block ring: a fixed cyclic array of blocks implementing rolling
//! retention, plus the maintenance worker that rotates it.

use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info};

use tempo_core::{
    Item, KeySchema, KvStore, MaintenanceConfig, TableSpec, Throughput, Timestamp,
};

use super::block::{Block, BlockState};
use super::{wait_for_active, SchemaContext, SchemaError};

/// Maintenance cadence.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

pub struct BlockRing<S: KvStore> {
    ctx: Arc<SchemaContext<S>>,
    master: String,
    slots: Vec<RwLock<Block<S>>>,
    mx: MaintenanceConfig,
}

impl<S: KvStore> BlockRing<S> {
    pub fn master_name(storage: &tempo_core::StorageConfig) -> String {
        storage.table_name("dp_master")
    }

    /// Create the master table and seed one INITIAL slot record per ring
    /// position, starting from the current block.
    pub fn create(ctx: &SchemaContext<S>) -> Result<(), SchemaError> {
        let master = Self::master_name(&ctx.storage);

        ctx.store.create_table(TableSpec {
            name: master.clone(),
            hash: KeySchema::number("n"),
            range: Some(KeySchema::number("tbase")),
            throughput: Throughput::new(5, 5),
        })?;
        wait_for_active(&ctx.store, &master)?;

        let now = ctx.clock.now();
        for i in 0..ctx.bucketing.blocks() {
            let t = now + i as Timestamp * ctx.bucketing.block_size();
            let item = Item::new()
                .with_n("n", ctx.bucketing.block_pos(t) as i64)
                .with_n("tbase", ctx.bucketing.base_time(t))
                .with_s("state", BlockState::Initial.as_str());
            ctx.store.put_item(&master, item, true)?;
        }

        Ok(())
    }

    /// Bind every slot from the persisted master records.
    pub fn open(ctx: Arc<SchemaContext<S>>, mx: MaintenanceConfig) -> Result<Self, SchemaError> {
        let master = Self::master_name(&ctx.storage);

        let slots = (0..ctx.bucketing.blocks())
            .map(|n| Block::load(Arc::clone(&ctx), &master, n).map(RwLock::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            ctx,
            master,
            slots,
            mx,
        })
    }

    pub fn master(&self) -> &str {
        &self.master
    }

    /// The slot covering `t`, or `None` while its block belongs to a
    /// different window.
    pub fn get(&self, t: Timestamp) -> Option<RwLockReadGuard<'_, Block<S>>> {
        let slot = self.ctx.bucketing.block_pos(t);
        let block = self.slots[slot].read().unwrap();

        if block.tbase() == self.ctx.bucketing.base_time(t) {
            Some(block)
        } else {
            None
        }
    }

    pub fn current(&self) -> Option<RwLockReadGuard<'_, Block<S>>> {
        self.get(self.ctx.clock.now())
    }

    pub fn next(&self) -> Option<RwLockReadGuard<'_, Block<S>>> {
        self.get(self.ctx.clock.now() + self.ctx.bucketing.block_size())
    }

    pub fn previous(&self) -> Option<RwLockReadGuard<'_, Block<S>>> {
        self.get(self.ctx.clock.now() - self.ctx.bucketing.block_size())
    }

    /// Milliseconds elapsed in the current block.
    fn time_expired(&self) -> Timestamp {
        let now = self.ctx.clock.now();
        now - self.ctx.bucketing.base_time(now)
    }

    /// Milliseconds remaining in the current block.
    fn time_remaining(&self) -> Timestamp {
        let now = self.ctx.clock.now();
        self.ctx.bucketing.base_time(now) + self.ctx.bucketing.block_size() - now
    }

    /// Rotate the slot for `t` to its window (if needed) and create its
    /// tables.
    pub fn create_block(&self, t: Timestamp) -> Result<(), SchemaError> {
        let slot = self.ctx.bucketing.block_pos(t);
        let mut block = self.slots[slot].write().unwrap();

        block.replace(t)?;
        block.create_tables()?;

        Ok(())
    }

    fn should_create_next(&self) -> bool {
        if let Some(next) = self.next() {
            if next.state() == BlockState::Active {
                return false;
            }
        }

        self.time_remaining() < self.mx.create_next_threshold(self.ctx.bucketing.block_size())
    }

    fn should_turndown_previous(&self) -> bool {
        let Some(previous) = self.previous() else {
            return false;
        };
        if previous.state() != BlockState::Active {
            return false;
        }
        drop(previous);

        self.time_expired() > self.mx.turndown_threshold(self.ctx.bucketing.block_size())
    }

    /// One maintenance pass: create the next block ahead of rollover,
    /// turn down the previous one after it, and make sure the current
    /// block exists.
    pub fn perform_maintenance(&self) {
        let block_size = self.ctx.bucketing.block_size();

        if self.should_create_next() {
            debug!("maintenance: creating next block");
            if let Err(error) = self.create_block(self.ctx.clock.now() + block_size) {
                error!(%error, "creating next block failed");
            }
        }

        if self.should_turndown_previous() {
            debug!("maintenance: turning down previous block");
            let t = self.ctx.clock.now() - block_size;
            let slot = self.ctx.bucketing.block_pos(t);
            let mut block = self.slots[slot].write().unwrap();
            if block.tbase() == self.ctx.bucketing.base_time(t) {
                block.turndown_tables();
            }
        }

        let needs_current = match self.current() {
            Some(current) => current.state() == BlockState::Initial,
            None => true,
        };
        if needs_current {
            debug!("maintenance: creating current block");
            if let Err(error) = self.create_block(self.ctx.clock.now()) {
                error!(%error, "creating current block failed");
            }
        }
    }

    /// Drain pending writes on every bound block.
    pub fn flush_all(&self) {
        for slot in &self.slots {
            slot.read().unwrap().flush_writes();
        }
    }

    /// How many slots currently report ACTIVE; at most two during a
    /// rollover window.
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.read().unwrap().state() == BlockState::Active)
            .count()
    }
}

/// Daemon thread driving [`BlockRing::perform_maintenance`] on a fixed
/// interval.
pub struct MaintenanceWorker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    pub fn start<S: KvStore>(ring: Arc<BlockRing<S>>) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));

        let handle = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                info!("maintenance worker started");
                loop {
                    {
                        let (lock, cond) = &*stop;
                        let stopped = lock.lock().unwrap();
                        let (stopped, _) =
                            cond.wait_timeout(stopped, MAINTENANCE_INTERVAL).unwrap();
                        if *stopped {
                            break;
                        }
                    }
                    ring.perform_maintenance();
                }
                info!("maintenance worker stopped");
            })
        };

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn shutdown(&mut self) {
        let (lock, cond) = &*self.stop;
        *lock.lock().unwrap() = true;
        cond.notify_all();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
