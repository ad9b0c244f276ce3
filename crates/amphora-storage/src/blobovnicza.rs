//! Blobovnicza: a single-file, size-bounded container for small objects.
//!
//! The file is an embedded key/value database with one table per size
//! class: bucket `k` holds objects whose marshaled size falls in
//! `[2^(k-1), 2^k)`. A `meta` table persists the running byte total, the
//! configured limits and the full marker; on open the limits are validated
//! against the current configuration.
//!
//! Once the stored total reaches the full-size limit the container is
//! sealed for good: the full marker is persisted and never cleared, so a
//! container that has reported `Full` never accepts puts again, even after
//! deletes free space or the process restarts.

use amphora_common::{Address, Error, Result};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const META_TOTAL: &str = "total_size";
const META_OBJECT_LIMIT: &str = "object_size_limit";
const META_FULL_LIMIT: &str = "full_size_limit";
const META_FULL_FLAG: &str = "full";

fn bucket_name(k: usize) -> String {
    format!("size_{k}")
}

fn ceil_log2(v: u64) -> usize {
    if v <= 1 {
        0
    } else {
        (64 - (v - 1).leading_zeros()) as usize
    }
}

struct State {
    db: Database,
    filled: u64,
    full: bool,
}

/// Size-capped single-file object container.
pub struct Blobovnicza {
    path: PathBuf,
    object_size_limit: u64,
    full_size_limit: u64,
    bucket_count: usize,
    state: RwLock<Option<State>>,
}

impl Blobovnicza {
    /// Create a handle over `path` with the given limits. The file is not
    /// touched until [`Blobovnicza::open`].
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, object_size_limit: u64, full_size_limit: u64) -> Self {
        Self {
            path: path.into(),
            object_size_limit,
            full_size_limit,
            bucket_count: ceil_log2(object_size_limit) + 1,
            state: RwLock::new(None),
        }
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the database file, creating it empty on first use. Stored
    /// limits, when present, must match the configured ones.
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&self.path)?;

        let mut filled = 0;
        let mut full = false;
        let rtx = db.begin_read()?;
        match rtx.open_table(META) {
            Ok(meta) => {
                if let Some(total) = meta.get(META_TOTAL)? {
                    filled = total.value();
                }
                if let Some(flag) = meta.get(META_FULL_FLAG)? {
                    full = flag.value() != 0;
                }
                self.validate_limit(&meta, META_OBJECT_LIMIT, self.object_size_limit)?;
                self.validate_limit(&meta, META_FULL_LIMIT, self.full_size_limit)?;
            }
            // Fresh file: no metadata until init.
            Err(redb::TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(e.into()),
        }
        // Files written before the marker existed seal by their total.
        full = full || filled >= self.full_size_limit;

        *state = Some(State { db, filled, full });
        debug!(path = %self.path.display(), filled, full, "opened blobovnicza");
        Ok(())
    }

    /// Create all bucket tables and persist the configured limits.
    pub fn init(&self) -> Result<()> {
        let state = self.state.read();
        let state = state.as_ref().ok_or_else(not_opened)?;

        let wtx = state.db.begin_write()?;
        for k in 0..self.bucket_count {
            let name = bucket_name(k);
            let def = TableDefinition::<&str, &[u8]>::new(&name);
            wtx.open_table(def)?;
        }
        {
            let mut meta = wtx.open_table(META)?;
            if meta.get(META_TOTAL)?.is_none() {
                meta.insert(META_TOTAL, 0)?;
            }
            meta.insert(META_OBJECT_LIMIT, self.object_size_limit)?;
            meta.insert(META_FULL_LIMIT, self.full_size_limit)?;
        }
        wtx.commit()?;
        Ok(())
    }

    /// Close the file, releasing the handle.
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.take().is_some() {
            debug!(path = %self.path.display(), "closed blobovnicza");
        }
    }

    /// Running total of stored bytes.
    #[must_use]
    pub fn stored_bytes(&self) -> u64 {
        self.state.read().as_ref().map_or(0, |s| s.filled)
    }

    /// Check whether the container is sealed. The marker is sticky: it is
    /// set once the stored total reaches the full-size limit and survives
    /// both deletes and restarts.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.state.read().as_ref().is_some_and(|s| s.full)
    }

    /// Store marshaled object bytes under `addr`.
    ///
    /// Returns `BigObject` when the record exceeds the per-object limit and
    /// `Full` once the container is sealed; a sealed container never
    /// accepts puts again. A put of an existing address overwrites it (same
    /// content under content addressing).
    pub fn put(&self, addr: &Address, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        if size > self.object_size_limit {
            return Err(Error::BigObject);
        }

        let mut state = self.state.write();
        let state = state.as_mut().ok_or_else(not_opened)?;
        if state.full {
            return Err(Error::Full);
        }

        let key = addr.encode_to_string();
        let k = self.bucket_index(size);
        let prev_len;
        let new_total;
        {
            let wtx = state.db.begin_write()?;
            {
                let name = bucket_name(k);
                let def = TableDefinition::<&str, &[u8]>::new(&name);
                let mut bucket = wtx.open_table(def)?;
                prev_len = bucket
                    .insert(key.as_str(), data)?
                    .map_or(0, |prev| prev.value().len() as u64);

                new_total = state.filled - prev_len + size;
                let mut meta = wtx.open_table(META)?;
                meta.insert(META_TOTAL, new_total)?;
                if new_total >= self.full_size_limit {
                    // Seal for good; deletes never clear this.
                    meta.insert(META_FULL_FLAG, 1)?;
                }
            }
            wtx.commit()?;
        }
        state.filled = new_total;
        if new_total >= self.full_size_limit {
            state.full = true;
            debug!(path = %self.path.display(), total = new_total, "blobovnicza sealed");
        }
        Ok(())
    }

    /// Read marshaled object bytes by address.
    ///
    /// Buckets are scanned smallest to largest and the smallest match wins.
    /// A second match in a larger bucket cannot happen under normal
    /// operation; it is logged as corruption and the first match is still
    /// returned.
    pub fn get(&self, addr: &Address) -> Result<Vec<u8>> {
        let state = self.state.read();
        let state = state.as_ref().ok_or_else(not_opened)?;

        let key = addr.encode_to_string();
        let rtx = state.db.begin_read()?;
        let mut found: Option<Vec<u8>> = None;
        for k in 0..self.bucket_count {
            let name = bucket_name(k);
            let def = TableDefinition::<&str, &[u8]>::new(&name);
            let bucket = match rtx.open_table(def) {
                Ok(b) => b,
                Err(redb::TableError::TableDoesNotExist(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            if let Some(value) = bucket.get(key.as_str())? {
                if found.is_some() {
                    warn!(
                        path = %self.path.display(),
                        address = %addr,
                        bucket = k,
                        "duplicate address in a larger size bucket, keeping the smallest"
                    );
                    break;
                }
                found = Some(value.value().to_vec());
            }
        }
        found.ok_or(Error::NotFound)
    }

    /// Remove the object stored under `addr`.
    ///
    /// The freed bytes lower the running total but never clear the full
    /// marker of a sealed container.
    pub fn delete(&self, addr: &Address) -> Result<()> {
        let mut state = self.state.write();
        let state = state.as_mut().ok_or_else(not_opened)?;

        let key = addr.encode_to_string();
        let mut removed = 0u64;
        {
            let wtx = state.db.begin_write()?;
            for k in 0..self.bucket_count {
                let name = bucket_name(k);
                let def = TableDefinition::<&str, &[u8]>::new(&name);
                let mut bucket = match wtx.open_table(def) {
                    Ok(b) => b,
                    Err(redb::TableError::TableDoesNotExist(_)) => continue,
                    Err(e) => return Err(e.into()),
                };
                let maybe_prev = bucket.remove(key.as_str())?;
                if let Some(prev) = maybe_prev {
                    removed = prev.value().len() as u64;
                    drop(prev);
                    break;
                }
            }
            if removed > 0 {
                let new_total = state.filled.saturating_sub(removed);
                let mut meta = wtx.open_table(META)?;
                meta.insert(META_TOTAL, new_total)?;
            }
            wtx.commit()?;
        }

        if removed == 0 {
            return Err(Error::NotFound);
        }
        state.filled = state.filled.saturating_sub(removed);
        Ok(())
    }

    /// Visit every `(address, bytes)` pair. The order is stable for one
    /// open handle; the visitor returns `false` to stop early.
    pub fn iterate<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&Address, &[u8]) -> Result<bool>,
    {
        let state = self.state.read();
        let state = state.as_ref().ok_or_else(not_opened)?;

        let rtx = state.db.begin_read()?;
        for k in 0..self.bucket_count {
            let name = bucket_name(k);
            let def = TableDefinition::<&str, &[u8]>::new(&name);
            let bucket = match rtx.open_table(def) {
                Ok(b) => b,
                Err(redb::TableError::TableDoesNotExist(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in bucket.iter()? {
                let (key, value) = entry?;
                let addr: Address = key.value().parse()?;
                if !visit(&addr, value.value())? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn bucket_index(&self, size: u64) -> usize {
        ceil_log2(size.max(1)).min(self.bucket_count - 1)
    }

    fn validate_limit(
        &self,
        meta: &impl ReadableTable<&'static str, u64>,
        key: &str,
        configured: u64,
    ) -> Result<()> {
        if let Some(stored) = meta.get(key)? {
            let stored = stored.value();
            if stored != configured {
                return Err(Error::configuration(format!(
                    "stored {key} ({stored}) does not match configured value ({configured})"
                )));
            }
        }
        Ok(())
    }
}

fn not_opened() -> Error {
    Error::configuration("blobovnicza is not opened")
}

#[cfg(test)]
mod tests {
    use super::*;
    use amphora_common::{ContainerId, ObjectId};
    use sha2::{Digest, Sha256};

    fn test_address(seed: u64) -> Address {
        let digest: [u8; 32] = Sha256::digest(seed.to_le_bytes()).into();
        Address::new(ContainerId::from_bytes([3; 32]), ObjectId::from_bytes(digest))
    }

    fn test_payload(seed: u64, size: usize) -> Vec<u8> {
        let mut data = vec![0u8; size];
        let fill: [u8; 32] = Sha256::digest(seed.to_le_bytes()).into();
        for (i, b) in data.iter_mut().enumerate() {
            *b = fill[i % 32];
        }
        data
    }

    fn open_blz(path: &Path, object_limit: u64, full_limit: u64) -> Blobovnicza {
        let blz = Blobovnicza::new(path, object_limit, full_limit);
        blz.open().unwrap();
        blz.init().unwrap();
        blz
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let full = 256 * 1024;
        let blz = open_blz(&dir.path().join("blz.db"), full / 2, full);

        // Reading a never-written address misses.
        assert!(blz.get(&test_address(0)).unwrap_err().is_not_found());

        let addr = test_address(1);
        let data = test_payload(1, 15 * 1024);
        blz.put(&addr, &data).unwrap();
        assert_eq!(blz.get(&addr).unwrap(), data);
        assert_eq!(blz.stored_bytes(), data.len() as u64);

        blz.delete(&addr).unwrap();
        assert!(blz.get(&addr).unwrap_err().is_not_found());
        assert!(blz.delete(&addr).unwrap_err().is_not_found());
        assert_eq!(blz.stored_bytes(), 0);
    }

    #[test]
    fn test_put_until_full() {
        let dir = tempfile::tempdir().unwrap();
        let full = 256 * 1024;
        let obj_limit = full / 2;
        let blz = open_blz(&dir.path().join("blz.db"), obj_limit, full);

        let mut filled = 15 * 1024u64;
        blz.put(&test_address(100), &test_payload(100, filled as usize))
            .unwrap();

        let mut seed = 101;
        while filled < full {
            blz.put(&test_address(seed), &test_payload(seed, obj_limit as usize))
                .unwrap();
            filled += obj_limit;
            seed += 1;
        }

        // The container is full: even a tiny object is rejected now.
        assert!(blz.is_full());
        assert!(matches!(
            blz.put(&test_address(999), &test_payload(999, 1024)),
            Err(Error::Full)
        ));

        // An object above the per-object cap is rejected regardless of room.
        assert!(matches!(
            blz.put(&test_address(998), &test_payload(998, obj_limit as usize + 1)),
            Err(Error::BigObject)
        ));

        // The seal is sticky: deletes free bytes for reads only.
        blz.delete(&test_address(100)).unwrap();
        blz.delete(&test_address(101)).unwrap();
        assert!(blz.stored_bytes() < full);
        assert!(blz.is_full());
        assert!(matches!(
            blz.put(&test_address(997), &test_payload(997, 1024)),
            Err(Error::Full)
        ));
    }

    #[test]
    fn test_seal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blz.db");
        let full = 8 * 1024;
        let obj_limit = 4 * 1024;

        let blz = open_blz(&path, obj_limit, full);
        blz.put(&test_address(1), &test_payload(1, obj_limit as usize))
            .unwrap();
        blz.put(&test_address(2), &test_payload(2, obj_limit as usize))
            .unwrap();
        assert!(blz.is_full());
        blz.delete(&test_address(1)).unwrap();
        blz.close();

        let again = open_blz(&path, obj_limit, full);
        assert!(again.is_full());
        assert!(matches!(
            again.put(&test_address(3), &test_payload(3, 64)),
            Err(Error::Full)
        ));
    }

    #[test]
    fn test_iterate_sees_every_pair() {
        let dir = tempfile::tempdir().unwrap();
        let blz = open_blz(&dir.path().join("blz.db"), 1 << 10, 100 << 10);

        let mut want = std::collections::HashMap::new();
        for i in 0u64..5 {
            let addr = test_address(i);
            let data = i.to_be_bytes().to_vec();
            blz.put(&addr, &data).unwrap();
            want.insert(addr, data);
        }

        blz.iterate(|addr, data| {
            assert_eq!(want.remove(addr).as_deref(), Some(data));
            Ok(true)
        })
        .unwrap();
        assert!(want.is_empty());
    }

    #[test]
    fn test_iterate_early_stop() {
        let dir = tempfile::tempdir().unwrap();
        let blz = open_blz(&dir.path().join("blz.db"), 1 << 10, 100 << 10);

        for i in 0u64..5 {
            blz.put(&test_address(i), &test_payload(i, 64)).unwrap();
        }

        let mut seen = 0;
        blz.iterate(|_, _| {
            seen += 1;
            Ok(false)
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_reopen_restores_total_and_validates_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blz.db");

        let blz = open_blz(&path, 64 * 1024, 256 * 1024);
        blz.put(&test_address(7), &test_payload(7, 10 * 1024)).unwrap();
        let total = blz.stored_bytes();
        blz.close();

        let again = Blobovnicza::new(&path, 64 * 1024, 256 * 1024);
        again.open().unwrap();
        assert_eq!(again.stored_bytes(), total);
        assert_eq!(again.get(&test_address(7)).unwrap(), test_payload(7, 10 * 1024));

        again.close();
        let mismatched = Blobovnicza::new(&path, 32 * 1024, 256 * 1024);
        assert!(matches!(
            mismatched.open(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_across_buckets_smallest_wins() {
        let dir = tempfile::tempdir().unwrap();
        let blz = open_blz(&dir.path().join("blz.db"), 1 << 20, 10 << 20);

        // Same address written with two different sizes lands in two
        // buckets; the smallest-bucket record wins the lookup.
        let addr = test_address(42);
        let small = test_payload(1, 100);
        let large = test_payload(2, 5_000);
        blz.put(&addr, &small).unwrap();
        blz.put(&addr, &large).unwrap();

        assert_eq!(blz.get(&addr).unwrap(), small);
    }

    #[test]
    fn test_size_class_separation() {
        let dir = tempfile::tempdir().unwrap();
        let blz = open_blz(&dir.path().join("blz.db"), 1 << 20, 10 << 20);

        // Objects of very different sizes land in different buckets but all
        // resolve through the same lookup path.
        for (seed, size) in [(1u64, 100usize), (2, 5_000), (3, 300_000)] {
            let data = test_payload(seed, size);
            blz.put(&test_address(seed), &data).unwrap();
            assert_eq!(blz.get(&test_address(seed)).unwrap(), data);
        }
    }
}
