//! Background flush pipeline.
//!
//! One scanner walks the small-object database in key order and feeds
//! batches into the flush lane; a second, slower scanner walks the
//! large-object fstree with lazy readers. A fixed pool of workers drains
//! three priority lanes: flush (scanned small objects), meta (header-only
//! index updates) and direct (bypass puts). Every worker prefers its own
//! lane but steals from the others, with the direct lane first so bypass
//! puts keep bounded latency under heavy flushing.

use crate::writecache::{Mode, WriteCache, OBJECTS};
use amphora_common::{Object, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Keys read from the small-object database per scan batch, bounding the
/// contention between cache puts and cache flushing.
const FLUSH_BATCH_SIZE: usize = 512;

/// Big-object scans run every this many flush ticks.
const BIG_FLUSH_TICK_MULTIPLIER: u32 = 10;

/// Attempts per object before a storage fault is handed to the error
/// budget and retried on a later scan.
const WRITE_RETRIES: usize = 3;

pub(crate) const LANE_FLUSH: usize = 0;
pub(crate) const LANE_META: usize = 1;
pub(crate) const LANE_DIRECT: usize = 2;

const LANE_CAPS: [usize; 3] = [512, 256, 256];

/// Close-check granularity for waits and sleeps.
const WAIT_STEP: Duration = Duration::from_millis(100);

/// Three bounded priority lanes feeding the worker pool.
pub(crate) struct Lanes {
    queues: Mutex<[VecDeque<Object>; 3]>,
    cond: Condvar,
}

impl Lanes {
    pub(crate) fn new() -> Self {
        Self {
            queues: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            cond: Condvar::new(),
        }
    }

    /// Bounded blocking push. A full lane blocks the caller, pausing the
    /// producer in favor of the workers. Returns `false` when the cache
    /// closed before space appeared.
    pub(crate) fn push(&self, lane: usize, obj: Object, closed: &AtomicBool) -> bool {
        let mut queues = self.queues.lock();
        while queues[lane].len() >= LANE_CAPS[lane] {
            if closed.load(Ordering::Relaxed) {
                return false;
            }
            let _ = self.cond.wait_for(&mut queues, WAIT_STEP);
        }
        queues[lane].push_back(obj);
        self.cond.notify_all();
        true
    }

    /// Worker-side pop: a non-blocking read of the worker's own lane
    /// first, then any lane with the direct lane ahead, then wait.
    /// Returns `None` once the cache is closed and every lane is drained.
    pub(crate) fn pop(&self, priority: usize, closed: &AtomicBool) -> Option<(usize, Object)> {
        let mut queues = self.queues.lock();
        loop {
            if let Some(obj) = queues[priority].pop_front() {
                self.cond.notify_all();
                return Some((priority, obj));
            }
            for lane in [LANE_DIRECT, LANE_FLUSH, LANE_META] {
                if let Some(obj) = queues[lane].pop_front() {
                    self.cond.notify_all();
                    return Some((lane, obj));
                }
            }
            if closed.load(Ordering::Relaxed) {
                return None;
            }
            let _ = self.cond.wait_for(&mut queues, WAIT_STEP);
        }
    }

    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }
}

impl WriteCache {
    /// Spawn the worker pool and both scanners.
    pub(crate) fn start_background(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        for num in 0..self.cfg.workers_count.max(1) {
            let me = Arc::clone(self);
            handles.push(std::thread::spawn(move || me.flush_worker(num)));
        }

        let me = Arc::clone(self);
        handles.push(std::thread::spawn(move || me.scan_loop()));

        let me = Arc::clone(self);
        handles.push(std::thread::spawn(move || me.big_scan_loop()));
    }

    // Ticker: persist the memory buffer and scan the small-object database.
    fn scan_loop(&self) {
        while self.sleep_interruptible(self.cfg.flush_interval) {
            if self.mode() == Mode::ReadOnly {
                continue;
            }
            if let Err(e) = self.persist_mem() {
                error!(error = %e, "failed to persist in-memory objects");
                self.report_error(&e);
            }
            self.flush_small_pass();
        }
    }

    fn big_scan_loop(&self) {
        let interval = self.cfg.flush_interval * BIG_FLUSH_TICK_MULTIPLIER;
        while self.sleep_interruptible(interval) {
            self.flush_big_pass();
        }
    }

    // Sleep in close-checking steps; false once the cache closed.
    fn sleep_interruptible(&self, total: Duration) -> bool {
        let mut left = total;
        while !left.is_zero() {
            if self.closed.load(Ordering::Relaxed) {
                return false;
            }
            let step = left.min(WAIT_STEP);
            std::thread::sleep(step);
            left -= step;
        }
        !self.closed.load(Ordering::Relaxed)
    }

    fn flush_worker(&self, num: usize) {
        let priority = match num % 3 {
            0 => LANE_FLUSH,
            1 => LANE_META,
            _ => LANE_DIRECT,
        };

        while let Some((lane, obj)) = self.lanes.pop(priority, &self.closed) {
            let meta_only = lane == LANE_META;
            let key = obj.address().encode_to_string();

            match self.write_object(&obj, meta_only) {
                Ok(()) => {
                    if lane == LANE_FLUSH {
                        if let Err(e) = self.evict_small(&key) {
                            error!(address = %key, error = %e, "failed to evict flushed object");
                            self.report_error(&e);
                        }
                    }
                }
                Err(e) => {
                    error!(address = %key, error = %e, "cannot flush object to the main storage");
                    self.report_error(&e);
                    if lane == LANE_FLUSH {
                        // Unmark so the next scan retries this address.
                        self.flushed.remove(&key);
                    }
                }
            }
        }
    }

    /// Write an object to the main storage: blob store put (unless the
    /// update is header-only) followed by the metabase index update.
    fn write_object(&self, obj: &Object, meta_only: bool) -> Result<()> {
        let mut attempt = 0;
        loop {
            let result = (|| {
                let hint = if meta_only {
                    None
                } else {
                    self.blobstor.put(obj)?
                };
                self.metabase.put(obj, hint.as_deref())
            })();

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_storage_fault() && attempt + 1 < WRITE_RETRIES => {
                    attempt += 1;
                    debug!(address = %obj.address(), attempt, error = %e, "retrying flush write");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Scan the small-object database in key order, batching unflushed
    /// records into the flush lane. Loops until a full walk finds nothing
    /// left to flush.
    pub(crate) fn flush_small_pass(&self) {
        let mut last_key = String::new();
        loop {
            if self.mode() == Mode::ReadOnly || self.closed.load(Ordering::Relaxed) {
                return;
            }

            let batch = match self.collect_batch(&last_key) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "flush scan failed");
                    self.report_error(&e);
                    return;
                }
            };
            let Some((tail, _)) = batch.last() else {
                return;
            };
            last_key = tail.clone();
            let count = batch.len();

            for (key, data) in batch {
                match Object::unmarshal(&data) {
                    Ok(obj) => {
                        self.flushed.add(&key);
                        if !self.lanes.push(LANE_FLUSH, obj, &self.closed) {
                            return;
                        }
                    }
                    Err(e) => {
                        // Corrupted entries are dropped, not retried.
                        error!(address = %key, error = %e, "dropping corrupted cache entry");
                        self.report_error(&e);
                        self.flushed.add(&key);
                        if let Err(e) = self.evict_small(&key) {
                            self.report_error(&e);
                        }
                    }
                }
            }
            debug!(count, "flushed items from write-cache");
        }
    }

    /// Walk the large-object fstree with lazy readers, pushing each
    /// unflushed object to the blob store and evicting it on success.
    pub(crate) fn flush_big_pass(&self) {
        if self.mode() == Mode::ReadOnly {
            return;
        }

        let result = self.fstree.iterate_lazy(|addr, read| {
            if self.closed.load(Ordering::Relaxed) {
                return Ok(false);
            }
            let key = addr.encode_to_string();
            if self.flushed.contains(&key) {
                return Ok(true);
            }

            let data = match read() {
                Ok(data) => data,
                Err(e) => {
                    error!(address = %key, error = %e, "cannot read cached file");
                    self.report_error(&e.into());
                    return Ok(true);
                }
            };

            let compress = self.mem.lock().compress_flags.contains(&key);
            match self.blobstor.put_raw(addr, &data, compress) {
                Ok(_) => {
                    if compress {
                        self.mem.lock().compress_flags.remove(&key);
                    }
                    self.flushed.add(&key);
                    if let Err(e) = self.fstree.delete(addr) {
                        if !e.is_not_found() {
                            self.report_error(&e);
                        }
                    }
                }
                Err(e) => {
                    error!(address = %key, error = %e, "cannot flush object to blob store");
                    self.report_error(&e);
                }
            }
            Ok(true)
        });
        if let Err(e) = result {
            error!(error = %e, "big-object scan failed");
            self.report_error(&e);
        }
    }

    // Read up to one batch of unflushed records following `after`.
    fn collect_batch(&self, after: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(OBJECTS)?;
        let mut out = Vec::new();
        for entry in table.range(after..)? {
            let (k, v) = entry?;
            let key = k.value().to_string();
            if key == after {
                continue;
            }
            if self.flushed.contains(&key) {
                continue;
            }
            out.push((key, v.value().to_vec()));
            if out.len() >= FLUSH_BATCH_SIZE {
                break;
            }
        }
        Ok(out)
    }

    // Remove one flushed record from the small-object database.
    fn evict_small(&self, key: &str) -> Result<()> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(OBJECTS)?;
            table.remove(key)?;
        }
        wtx.commit()?;
        Ok(())
    }
}
