//! Write-cache: the admission tier in front of the blob store and metabase.
//!
//! Incoming objects land in one of three co-managed stores: an in-memory
//! list capped by `max_mem_size`, a small-object database, or a large-object
//! fstree. Background flushers migrate persisted objects to the blob store
//! and index them in the metabase; a bounded flushed-set suppresses
//! duplicate flushes.

mod flush;
mod store;

use crate::blobstor::BlobStor;
use crate::fstree::FsTree;
use crate::metabase::Metabase;
use crate::writecache::flush::{Lanes, LANE_DIRECT, LANE_META};
use crate::writecache::store::{FlushedSet, FLUSHED_KEYS_LIMIT};
use amphora_common::{Address, Error, Object, ObjectHeader, Result, WriteCacheConfig};
use parking_lot::{Mutex, RwLock};
use redb::{Database, TableDefinition};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

pub(crate) const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

const SMALL_DB_NAME: &str = "small.db";
const FSTREE_DIR_NAME: &str = "fstree";
const CACHE_FSTREE_DEPTH: usize = 1;

/// Operating mode of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Normal operation.
    ReadWrite,
    /// Puts are rejected and flush scanning pauses; queued flushes drain.
    ReadOnly,
    /// The cache stores are bypassed; puts go straight to the blob store
    /// and metabase through the direct lane.
    Degraded,
}

/// Callback invoked for every storage fault observed by the flush pipeline.
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

struct MemObject {
    key: String,
    data: Vec<u8>,
}

struct MemState {
    objs: Vec<MemObject>,
    cur_size: u64,
    /// Large-object addresses whose records should be compressed when they
    /// reach the blob store.
    compress_flags: HashSet<String>,
}

/// Tiered admission cache with background flushing.
pub struct WriteCache {
    cfg: WriteCacheConfig,
    mode: RwLock<Mode>,
    mem: Mutex<MemState>,
    db: Database,
    fstree: FsTree,
    flushed: FlushedSet,
    blobstor: Arc<BlobStor>,
    metabase: Arc<Metabase>,
    lanes: Lanes,
    closed: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    on_error: Option<ErrorCallback>,
}

impl WriteCache {
    /// Open the cache under `cfg.path` and start its background flushers.
    pub fn open(
        cfg: WriteCacheConfig,
        blobstor: Arc<BlobStor>,
        metabase: Arc<Metabase>,
        on_error: Option<ErrorCallback>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&cfg.path)?;
        let db = Database::create(cfg.path.join(SMALL_DB_NAME))?;
        {
            let wtx = db.begin_write()?;
            wtx.open_table(OBJECTS)?;
            wtx.commit()?;
        }
        let fstree = FsTree::open(cfg.path.join(FSTREE_DIR_NAME), CACHE_FSTREE_DEPTH)?;

        info!(path = %cfg.path.display(), workers = cfg.workers_count, "opened write-cache");

        let cache = Arc::new(Self {
            cfg,
            mode: RwLock::new(Mode::ReadWrite),
            mem: Mutex::new(MemState {
                objs: Vec::new(),
                cur_size: 0,
                compress_flags: HashSet::new(),
            }),
            db,
            fstree,
            flushed: FlushedSet::new(FLUSHED_KEYS_LIMIT),
            blobstor,
            metabase,
            lanes: Lanes::new(),
            closed: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            on_error,
        });
        cache.start_background();
        Ok(cache)
    }

    /// Current operating mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    /// Switch the operating mode. Blocks until in-flight data-path
    /// operations complete.
    pub fn set_mode(&self, mode: Mode) {
        let mut cur = self.mode.write();
        if *cur != mode {
            info!(from = ?*cur, to = ?mode, "write-cache mode transition");
            *cur = mode;
        }
    }

    /// Admit an object.
    ///
    /// Small objects that fit the memory budget are buffered; everything
    /// else is persisted synchronously. An address already present is
    /// overwritten (same content under content addressing).
    pub fn put(&self, obj: &Object) -> Result<()> {
        let mode = self.mode.read();
        match *mode {
            Mode::ReadOnly => return Err(Error::ReadOnly),
            Mode::Degraded => return self.put_direct(obj),
            Mode::ReadWrite => {}
        }

        let data = obj.marshal();
        let sz = data.len() as u64;
        if sz > self.cfg.max_object_size {
            return Err(Error::BigObject);
        }
        let key = obj.address().encode_to_string();

        if sz <= self.cfg.small_object_size {
            {
                let mut mem = self.mem.lock();
                if mem.cur_size + sz <= self.cfg.max_mem_size {
                    mem.cur_size += sz;
                    mem.objs.push(MemObject { key, data });
                    return Ok(());
                }
            }
            self.persist_small(&key, &data)
        } else {
            self.persist_big(obj, &key, &data)
        }
    }

    /// Read an object from the cache stores: memory, then the small-object
    /// database, then the fstree.
    pub fn get(&self, addr: &Address) -> Result<Object> {
        let mode = self.mode.read();
        if *mode == Mode::Degraded {
            return Err(Error::NotFound);
        }

        let key = addr.encode_to_string();
        {
            let mem = self.mem.lock();
            if let Some(found) = mem.objs.iter().rev().find(|m| m.key == key) {
                return Object::unmarshal(&found.data);
            }
        }

        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(OBJECTS)?;
        if let Some(value) = table.get(key.as_str())? {
            let data = value.value().to_vec();
            return Object::unmarshal(&data);
        }

        match self.fstree.get(addr) {
            Ok(data) => Object::unmarshal(&data),
            Err(e) => Err(e),
        }
    }

    /// Read an object header from the cache stores.
    pub fn head(&self, addr: &Address) -> Result<ObjectHeader> {
        self.get(addr).map(|obj| obj.header)
    }

    /// Remove an object from whichever cache store holds it. Used by the
    /// shard for best-effort cleanup after a delete.
    pub fn delete(&self, addr: &Address) -> Result<()> {
        let mode = self.mode.read();
        if *mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }

        let key = addr.encode_to_string();
        {
            let mut mem = self.mem.lock();
            if let Some(pos) = mem.objs.iter().position(|m| m.key == key) {
                let removed = mem.objs.remove(pos);
                mem.cur_size = mem.cur_size.saturating_sub(removed.data.len() as u64);
                debug!(address = %key, "in-mem DELETE");
                return Ok(());
            }
        }

        let removed;
        {
            let wtx = self.db.begin_write()?;
            {
                let mut table = wtx.open_table(OBJECTS)?;
                removed = table.remove(key.as_str())?.is_some();
            }
            wtx.commit()?;
        }
        if removed {
            debug!(address = %key, "db DELETE");
            return Ok(());
        }

        self.fstree.delete(addr)
    }

    /// Run one synchronous flush pass over all three cache stores. The
    /// produced work drains through the background workers.
    pub fn flush(&self) -> Result<()> {
        if self.mode() == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        self.persist_mem()?;
        self.flush_small_pass();
        self.flush_big_pass();
        Ok(())
    }

    /// Stop the background flushers, drain their queues and persist the
    /// in-memory buffer.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lanes.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }

        if self.mode() == Mode::ReadWrite {
            if let Err(e) = self.persist_mem() {
                error!(error = %e, "failed to persist in-memory objects on close");
            }
        }
        info!("closed write-cache");
    }

    // Degraded mode: hand the object to the direct lane; a worker writes it
    // to the blob store and metabase.
    fn put_direct(&self, obj: &Object) -> Result<()> {
        if self.lanes.push(LANE_DIRECT, obj.clone(), &self.closed) {
            Ok(())
        } else {
            Err(Error::configuration("write-cache is closed"))
        }
    }

    fn persist_small(&self, key: &str, data: &[u8]) -> Result<()> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(OBJECTS)?;
            table.insert(key, data)?;
        }
        wtx.commit()?;
        debug!(address = %key, "db PUT");
        Ok(())
    }

    fn persist_big(&self, obj: &Object, key: &str, data: &[u8]) -> Result<()> {
        self.fstree.put(&obj.address(), data)?;
        if self.cfg.compress {
            self.mem.lock().compress_flags.insert(key.to_string());
        }
        debug!(address = %key, "fstree PUT");

        // Index the header right away; the payload reaches the blob store
        // on the next big-object pass.
        self.lanes.push(LANE_META, obj.clone(), &self.closed);
        Ok(())
    }

    /// Move the in-memory buffer into the small-object database.
    pub(crate) fn persist_mem(&self) -> Result<()> {
        let drained: Vec<MemObject> = {
            let mut mem = self.mem.lock();
            mem.cur_size = 0;
            std::mem::take(&mut mem.objs)
        };
        if drained.is_empty() {
            return Ok(());
        }

        let result = (|| -> Result<()> {
            let wtx = self.db.begin_write()?;
            {
                let mut table = wtx.open_table(OBJECTS)?;
                for mo in &drained {
                    table.insert(mo.key.as_str(), mo.data.as_slice())?;
                }
            }
            wtx.commit()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                debug!(count = drained.len(), "persisted in-memory objects");
                Ok(())
            }
            Err(e) => {
                // Put the batch back so nothing is lost.
                let mut mem = self.mem.lock();
                for mo in drained {
                    mem.cur_size += mo.data.len() as u64;
                    mem.objs.push(mo);
                }
                Err(e)
            }
        }
    }

    pub(crate) fn report_error(&self, e: &Error) {
        if !e.is_storage_fault() {
            return;
        }
        if let Some(cb) = &self.on_error {
            cb(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amphora_common::{BlobStorConfig, BlobovniczaConfig, ContainerId};
    use bytes::Bytes;
    use redb::ReadableTable;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn test_setup(root: &std::path::Path, cache_cfg: WriteCacheConfig) -> (Arc<WriteCache>, Arc<BlobStor>, Arc<Metabase>) {
        let bs_cfg = BlobStorConfig {
            path: root.join("blob"),
            small_object_size: 4 * 1024,
            compress: false,
            fstree_depth: 2,
            blobovnicza: BlobovniczaConfig {
                size: 4 * 1024 * 1024,
                object_size: 64 * 1024,
                depth: 1,
                width: 16,
                opened_cache_size: 8,
            },
        };
        let blobstor = Arc::new(BlobStor::open(&bs_cfg).unwrap());
        let metabase = Arc::new(Metabase::open(root.join("meta.db")).unwrap());
        let cache = WriteCache::open(
            cache_cfg,
            Arc::clone(&blobstor),
            Arc::clone(&metabase),
            None,
        )
        .unwrap();
        (cache, blobstor, metabase)
    }

    // A tick this long never fires during a test; flushing is driven
    // explicitly through `flush()`.
    fn cache_cfg(root: &std::path::Path) -> WriteCacheConfig {
        WriteCacheConfig {
            path: root.join("cache"),
            max_mem_size: 128 * 1024,
            small_object_size: 64 * 1024,
            max_object_size: 256 * 1024,
            workers_count: 4,
            flush_interval: Duration::from_secs(3600),
            compress: false,
        }
    }

    fn obj_with_payload(size: usize, fill: u8) -> Object {
        Object::new_regular(ContainerId::from_bytes([7; 32]), Bytes::from(vec![fill; size]))
    }

    #[test]
    fn test_admission_routing() {
        let dir = tempdir().unwrap();
        let (cache, _bs, _meta) = test_setup(dir.path(), cache_cfg(dir.path()));

        // Three 32 KiB objects fit the 128 KiB memory budget.
        let a = obj_with_payload(32 * 1024, 1);
        let b = obj_with_payload(32 * 1024, 2);
        let c = obj_with_payload(32 * 1024, 3);
        cache.put(&a).unwrap();
        cache.put(&b).unwrap();
        cache.put(&c).unwrap();
        {
            let mem = cache.mem.lock();
            assert_eq!(mem.objs.len(), 3);
        }

        // A 65 KiB object exceeds small_object_size: straight to the fstree.
        let big = obj_with_payload(65 * 1024, 4);
        cache.put(&big).unwrap();
        {
            let mem = cache.mem.lock();
            assert_eq!(mem.objs.len(), 3);
        }
        assert!(cache.fstree.exists(&big.address()));

        // All four are readable through the cache.
        for obj in [&a, &b, &c, &big] {
            assert_eq!(&cache.get(&obj.address()).unwrap(), obj);
        }
        cache.close();
    }

    #[test]
    fn test_mem_overflow_persists_synchronously() {
        let dir = tempdir().unwrap();
        let mut cfg = cache_cfg(dir.path());
        cfg.max_mem_size = 40 * 1024;
        let (cache, _bs, _meta) = test_setup(dir.path(), cfg);

        let a = obj_with_payload(32 * 1024, 1);
        let b = obj_with_payload(32 * 1024, 2);
        cache.put(&a).unwrap();
        // The second does not fit the memory budget; it lands in small.db.
        cache.put(&b).unwrap();

        {
            let mem = cache.mem.lock();
            assert_eq!(mem.objs.len(), 1);
        }
        assert_eq!(cache.get(&b.address()).unwrap(), b);
        cache.close();
    }

    #[test]
    fn test_big_object_rejected() {
        let dir = tempdir().unwrap();
        let (cache, _bs, _meta) = test_setup(dir.path(), cache_cfg(dir.path()));

        let huge = obj_with_payload(300 * 1024, 5);
        assert!(matches!(cache.put(&huge), Err(Error::BigObject)));
        cache.close();
    }

    #[test]
    fn test_read_only_rejects_puts() {
        let dir = tempdir().unwrap();
        let (cache, _bs, _meta) = test_setup(dir.path(), cache_cfg(dir.path()));

        cache.set_mode(Mode::ReadOnly);
        let obj = obj_with_payload(1024, 6);
        assert!(matches!(cache.put(&obj), Err(Error::ReadOnly)));
        assert!(matches!(cache.delete(&obj.address()), Err(Error::ReadOnly)));

        cache.set_mode(Mode::ReadWrite);
        cache.put(&obj).unwrap();
        cache.close();
    }

    #[test]
    fn test_flush_pipeline_moves_objects_to_blobstor_and_metabase() {
        let dir = tempdir().unwrap();
        // A short tick so the background scanner participates too.
        let mut cfg = cache_cfg(dir.path());
        cfg.flush_interval = Duration::from_millis(50);
        let (cache, blobstor, metabase) = test_setup(dir.path(), cfg);

        let count = 1000;
        let mut addrs = Vec::new();
        for i in 0..count {
            let obj = Object::new_regular(
                ContainerId::from_bytes([7; 32]),
                Bytes::from(format!("payload-{i}").into_bytes()),
            );
            cache.put(&obj).unwrap();
            addrs.push(obj.address());
        }

        cache.flush().unwrap();

        // Wait for the workers to drain; every record costs its own
        // database commits, so allow generous time on slow disks.
        let deadline = Instant::now() + Duration::from_secs(60);
        loop {
            let done = addrs
                .iter()
                .all(|addr| metabase.exists(addr).unwrap_or(false));
            if done {
                break;
            }
            assert!(Instant::now() < deadline, "flush did not finish in time");
            std::thread::sleep(Duration::from_millis(20));
        }

        for addr in &addrs {
            assert!(blobstor.exists(addr).unwrap());
            assert!(cache.flushed.contains(&addr.encode_to_string()));
        }

        // Wait until the workers evicted every flushed record.
        loop {
            let rtx = cache.db.begin_read().unwrap();
            let table = rtx.open_table(OBJECTS).unwrap();
            let left = table.iter().unwrap().count();
            if left == 0 {
                break;
            }
            assert!(Instant::now() < deadline, "cache eviction did not finish");
            std::thread::sleep(Duration::from_millis(20));
        }
        cache.close();
    }

    #[test]
    fn test_big_objects_flush_through_put_raw() {
        let dir = tempdir().unwrap();
        let (cache, blobstor, metabase) = test_setup(dir.path(), cache_cfg(dir.path()));

        let big = obj_with_payload(65 * 1024, 8);
        cache.put(&big).unwrap();
        cache.flush().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if blobstor.exists(&big.address()).unwrap()
                && metabase.exists(&big.address()).unwrap()
            {
                break;
            }
            assert!(Instant::now() < deadline, "big flush did not finish in time");
            std::thread::sleep(Duration::from_millis(20));
        }

        // The payload left the cache fstree and has no location hint.
        assert!(!cache.fstree.exists(&big.address()));
        assert_eq!(metabase.blobovnicza_id(&big.address()).unwrap(), None);
        assert_eq!(blobstor.get(&big.address(), None).unwrap(), big);
        cache.close();
    }

    #[test]
    fn test_survives_restart_before_flush() {
        let dir = tempdir().unwrap();
        let cfg = cache_cfg(dir.path());

        let obj = obj_with_payload(1024, 9);
        {
            let (cache, _bs, _meta) = test_setup(dir.path(), cfg.clone());
            cache.put(&obj).unwrap();
            cache.close();
        }

        // A new cache over the same directory sees the unflushed object.
        let bs = Arc::new(
            BlobStor::open(&BlobStorConfig {
                path: dir.path().join("blob"),
                small_object_size: 4 * 1024,
                compress: false,
                fstree_depth: 2,
                blobovnicza: BlobovniczaConfig::default(),
            })
            .unwrap(),
        );
        let meta = Arc::new(Metabase::open(dir.path().join("meta2.db")).unwrap());
        let cache = WriteCache::open(cfg, bs, meta, None).unwrap();
        assert_eq!(cache.get(&obj.address()).unwrap(), obj);
        cache.close();
    }

    #[test]
    fn test_delete_from_each_store() {
        let dir = tempdir().unwrap();
        let (cache, _bs, _meta) = test_setup(dir.path(), cache_cfg(dir.path()));

        let in_mem = obj_with_payload(1024, 10);
        cache.put(&in_mem).unwrap();
        cache.delete(&in_mem.address()).unwrap();
        assert!(cache.get(&in_mem.address()).unwrap_err().is_not_found());

        let big = obj_with_payload(65 * 1024, 11);
        cache.put(&big).unwrap();
        cache.delete(&big.address()).unwrap();
        assert!(cache.get(&big.address()).unwrap_err().is_not_found());

        assert!(cache
            .delete(&obj_with_payload(8, 12).address())
            .unwrap_err()
            .is_not_found());
        cache.close();
    }
}
