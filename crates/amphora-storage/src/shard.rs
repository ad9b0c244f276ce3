//! Shard: a single-disk unit composing the write-cache, blob store and
//! metabase behind one Put/Get/Head/Delete surface.
//!
//! The shard tracks storage faults in an error budget; once the count
//! crosses the configured threshold the whole shard flips to read-only.

use crate::blobstor::BlobStor;
use crate::metabase::{HeadRecord, Metabase};
use crate::writecache::{ErrorCallback, Mode, WriteCache};
use amphora_common::{Address, ContainerId, Error, Object, ObjectHeader, Result, ShardConfig, SplitInfo};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Result of a shard-level object fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetResult {
    /// The materialized object.
    Object(Object),
    /// The address names a virtual (split) object; only its split info is
    /// available.
    Virtual(SplitInfo),
}

/// Result of a shard-level header fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadResult {
    /// Object header.
    Header(ObjectHeader),
    /// Raw split info of a virtual object.
    Virtual(SplitInfo),
}

/// Storage-fault budget; crossing the threshold degrades the shard to
/// read-only.
struct ErrorBudget {
    count: AtomicU32,
    threshold: u32,
    cache: OnceLock<Arc<WriteCache>>,
}

impl ErrorBudget {
    fn bump(&self) {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.threshold > 0 && n == self.threshold {
            warn!(errors = n, "error threshold reached, switching shard to read-only");
            if let Some(cache) = self.cache.get() {
                cache.set_mode(Mode::ReadOnly);
            }
        }
    }
}

/// Single-disk storage shard.
pub struct Shard {
    metabase: Arc<Metabase>,
    blobstor: Arc<BlobStor>,
    writecache: Arc<WriteCache>,
    budget: Arc<ErrorBudget>,
}

impl Shard {
    /// Open every tier of the shard and start the flush pipeline.
    pub fn open(cfg: ShardConfig) -> Result<Self> {
        let metabase = Arc::new(Metabase::open(&cfg.metabase_path)?);
        let blobstor = Arc::new(BlobStor::open(&cfg.blobstor)?);

        let budget = Arc::new(ErrorBudget {
            count: AtomicU32::new(0),
            threshold: cfg.ro_error_threshold,
            cache: OnceLock::new(),
        });
        let on_error: ErrorCallback = {
            let budget = Arc::clone(&budget);
            Arc::new(move |_: &Error| budget.bump())
        };

        let mut wc_cfg = cfg.writecache;
        wc_cfg.workers_count = cfg.pool_size.max(1);
        let writecache = WriteCache::open(
            wc_cfg,
            Arc::clone(&blobstor),
            Arc::clone(&metabase),
            Some(on_error),
        )?;
        let _ = budget.cache.set(Arc::clone(&writecache));

        info!("opened shard");
        Ok(Self {
            metabase,
            blobstor,
            writecache,
            budget,
        })
    }

    /// Current mode of the shard.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.writecache.mode()
    }

    /// Switch the shard's mode.
    pub fn set_mode(&self, mode: Mode) {
        self.writecache.set_mode(mode);
    }

    /// Number of storage faults observed so far.
    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.budget.count.load(Ordering::Relaxed)
    }

    /// Store an object. The write lands in the write-cache; flushing to the
    /// blob store and metabase is asynchronous.
    pub fn put(&self, obj: &Object) -> Result<()> {
        self.writecache.put(obj).inspect_err(|e| self.count_fault(e))
    }

    /// Fetch an object: write-cache first, then metabase plus blob store.
    pub fn get(&self, addr: &Address) -> Result<GetResult> {
        match self.writecache.get(addr) {
            Ok(obj) => return Ok(GetResult::Object(obj)),
            Err(Error::NotFound) => {}
            Err(e) => {
                self.count_fault(&e);
                return Err(e);
            }
        }

        match self.metabase.get(addr, true)? {
            HeadRecord::Virtual(info) => Ok(GetResult::Virtual(info)),
            HeadRecord::Header { hint, .. } => {
                let obj = self
                    .blobstor
                    .get(addr, hint.as_deref())
                    .inspect_err(|e| self.count_fault(e))?;
                Ok(GetResult::Object(obj))
            }
        }
    }

    /// Fetch an object header.
    ///
    /// With `raw` unset a virtual object yields its reconstructed parent
    /// header; with `raw` set its split info is surfaced instead. A
    /// non-miss error from the write-cache means a corrupt entry and is
    /// fatal.
    pub fn head(&self, addr: &Address, raw: bool) -> Result<HeadResult> {
        match self.writecache.head(addr) {
            Ok(header) => return Ok(HeadResult::Header(header)),
            Err(Error::NotFound) => {}
            Err(e) => {
                self.count_fault(&e);
                return Err(e);
            }
        }

        match self.metabase.head(addr, raw)? {
            HeadRecord::Header { header, .. } => Ok(HeadResult::Header(header)),
            HeadRecord::Virtual(info) => Ok(HeadResult::Virtual(info)),
        }
    }

    /// Tombstone an address in the metabase and remove its data from the
    /// write-cache and blob store, best-effort.
    pub fn delete(&self, addr: &Address) -> Result<()> {
        let hint = self.metabase.blobovnicza_id(addr).ok().flatten();
        let meta_result = self.metabase.delete(addr);

        let cache_removed = match self.writecache.delete(addr) {
            Ok(()) => true,
            Err(Error::NotFound) | Err(Error::ReadOnly) => false,
            Err(e) => {
                warn!(address = %addr, error = %e, "write-cache cleanup failed");
                self.count_fault(&e);
                false
            }
        };
        match self.blobstor.delete(addr, hint.as_deref()) {
            Ok(()) | Err(Error::NotFound) => {}
            Err(e) => {
                warn!(address = %addr, error = %e, "blob store cleanup failed");
                self.count_fault(&e);
            }
        }

        match meta_result {
            Ok(()) => Ok(()),
            // Not indexed yet, but its cached copy is gone.
            Err(Error::NotFound) if cache_removed => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Check whether the shard holds an object (cache or index).
    pub fn exists(&self, addr: &Address) -> Result<bool> {
        match self.writecache.get(addr) {
            Ok(_) => return Ok(true),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.metabase.exists(addr)
    }

    /// All indexed addresses.
    pub fn list(&self) -> Result<Vec<Address>> {
        self.metabase.list()
    }

    /// Addresses of every indexed object of a container.
    pub fn container_objects(&self, container: &ContainerId) -> Result<Vec<Address>> {
        self.metabase.container_objects(container)
    }

    /// Force one synchronous flush pass of the write-cache.
    pub fn flush_writecache(&self) -> Result<()> {
        self.writecache.flush()
    }

    /// Stop background work and close every tier.
    pub fn close(&self) {
        self.writecache.close();
        self.blobstor.close();
        info!("closed shard");
    }

    fn count_fault(&self, e: &Error) {
        if e.is_storage_fault() {
            self.budget.bump();
        }
    }

    #[cfg(test)]
    fn inject_fault(&self) {
        self.budget.bump();
    }
}
