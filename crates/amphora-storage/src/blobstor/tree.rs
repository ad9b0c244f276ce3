//! Shallow hash tree of blobovnicza files.
//!
//! Files live under `<root>/<n0>/.../<n(depth-1)>/<seq>.db`, where the
//! nibbles come from the object identifier. Every leaf directory has one
//! active file accepting puts; when it reports `Full` it is sealed and a
//! fresh file with the next sequence number takes over. The file's path
//! relative to the root is the location hint recorded in the metabase.

use crate::blobovnicza::Blobovnicza;
use amphora_common::{Address, BlobovniczaConfig, Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

struct ActiveLeaf {
    rel_path: String,
    seq: u64,
    blz: Arc<Blobovnicza>,
}

/// Clock-LRU of open handles, bounded by entry count.
struct OpenedCache {
    entries: HashMap<String, (Arc<Blobovnicza>, u64)>,
    clock: u64,
    cap: usize,
}

impl OpenedCache {
    fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            clock: 0,
            cap: cap.max(1),
        }
    }

    fn get(&mut self, rel: &str) -> Option<Arc<Blobovnicza>> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(rel).map(|(blz, access)| {
            *access = clock;
            Arc::clone(blz)
        })
    }

    fn insert(&mut self, rel: String, blz: Arc<Blobovnicza>) {
        while self.entries.len() >= self.cap {
            let lru = self
                .entries
                .iter()
                .min_by_key(|(_, (_, access))| *access)
                .map(|(k, _)| k.clone());
            match lru {
                Some(k) => {
                    if let Some((evicted, _)) = self.entries.remove(&k) {
                        evicted.close();
                    }
                }
                None => break,
            }
        }
        self.clock += 1;
        self.entries.insert(rel, (blz, self.clock));
    }

    /// Remove an entry without closing it; used when a file becomes the
    /// active one of its leaf and must outlive LRU eviction.
    fn take(&mut self, rel: &str) {
        self.entries.remove(rel);
    }

    fn clear(&mut self) {
        for (_, (blz, _)) in self.entries.drain() {
            blz.close();
        }
    }
}

pub(crate) struct BlobovniczaTree {
    root: PathBuf,
    cfg: BlobovniczaConfig,
    active: Mutex<HashMap<String, ActiveLeaf>>,
    opened: Mutex<OpenedCache>,
}

impl BlobovniczaTree {
    pub(crate) fn open(root: impl Into<PathBuf>, cfg: BlobovniczaConfig) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let opened = Mutex::new(OpenedCache::new(cfg.opened_cache_size));
        Ok(Self {
            root,
            cfg,
            active: Mutex::new(HashMap::new()),
            opened,
        })
    }

    /// Relative leaf directory for an address: one hex nibble per level.
    fn leaf_dir(&self, addr: &Address) -> String {
        let hex = addr.object.to_string();
        let width = self.cfg.width.clamp(1, 16) as u32;
        let mut parts = Vec::with_capacity(self.cfg.depth);
        for c in hex.chars().take(self.cfg.depth) {
            let nibble = c.to_digit(16).unwrap_or(0) % width;
            parts.push(format!("{nibble:x}"));
        }
        parts.join("/")
    }

    fn file_rel(leaf: &str, seq: u64) -> String {
        if leaf.is_empty() {
            format!("{seq:04}.db")
        } else {
            format!("{leaf}/{seq:04}.db")
        }
    }

    /// Store marshaled bytes, returning the location hint.
    pub(crate) fn put(&self, addr: &Address, data: &[u8]) -> Result<String> {
        let leaf = self.leaf_dir(addr);

        // One rotation per put: Full seals the active file and a fresh one
        // takes over.
        for _ in 0..2 {
            let (rel, blz) = self.active_handle(&leaf)?;
            match blz.put(addr, data) {
                Ok(()) => return Ok(rel),
                Err(Error::Full) => {
                    debug!(file = %rel, "blobovnicza is full, rotating");
                    self.rotate(&leaf, &rel)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Full)
    }

    /// Read marshaled bytes. A present hint is tried first; on a miss the
    /// address's leaf directory is scanned newest-first.
    pub(crate) fn get(&self, addr: &Address, hint: Option<&str>) -> Result<Vec<u8>> {
        if let Some(rel) = hint {
            match self.handle(rel)? {
                Some(blz) => match blz.get(addr) {
                    Ok(data) => return Ok(data),
                    Err(Error::NotFound) => {
                        warn!(address = %addr, hint = rel, "location hint missed");
                    }
                    Err(e) => return Err(e),
                },
                None => warn!(address = %addr, hint = rel, "hinted blobovnicza is gone"),
            }
        }

        for rel in self.leaf_files_newest_first(&self.leaf_dir(addr))? {
            if let Some(blz) = self.handle(&rel)? {
                match blz.get(addr) {
                    Ok(data) => return Ok(data),
                    Err(Error::NotFound) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(Error::NotFound)
    }

    /// Remove an object, resolving its file like [`BlobovniczaTree::get`].
    pub(crate) fn delete(&self, addr: &Address, hint: Option<&str>) -> Result<()> {
        if let Some(rel) = hint {
            if let Some(blz) = self.handle(rel)? {
                match blz.delete(addr) {
                    Err(Error::NotFound) => {}
                    other => return other,
                }
            }
        }

        for rel in self.leaf_files_newest_first(&self.leaf_dir(addr))? {
            if let Some(blz) = self.handle(&rel)? {
                match blz.delete(addr) {
                    Err(Error::NotFound) => continue,
                    other => return other,
                }
            }
        }
        Err(Error::NotFound)
    }

    pub(crate) fn exists(&self, addr: &Address) -> Result<bool> {
        for rel in self.leaf_files_newest_first(&self.leaf_dir(addr))? {
            if let Some(blz) = self.handle(&rel)? {
                match blz.get(addr) {
                    Ok(_) => return Ok(true),
                    Err(Error::NotFound) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(false)
    }

    /// Visit every `(address, bytes)` pair across all files.
    pub(crate) fn iterate<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&Address, &[u8]) -> Result<bool>,
    {
        for rel in self.all_files()? {
            if let Some(blz) = self.handle(&rel)? {
                let mut stopped = false;
                blz.iterate(|addr, data| {
                    let more = visit(addr, data)?;
                    stopped = !more;
                    Ok(more)
                })?;
                if stopped {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    pub(crate) fn close(&self) {
        for (_, leaf) in self.active.lock().drain() {
            leaf.blz.close();
        }
        self.opened.lock().clear();
    }

    /// Active file of a leaf, opening the lexicographically first writable
    /// file or creating the first one.
    fn active_handle(&self, leaf: &str) -> Result<(String, Arc<Blobovnicza>)> {
        let mut active = self.active.lock();
        if let Some(a) = active.get(leaf) {
            return Ok((a.rel_path.clone(), Arc::clone(&a.blz)));
        }

        let files = self.leaf_files_sorted(leaf)?;
        let mut last_seq = None;
        for (seq, rel) in &files {
            last_seq = Some(*seq);
            let blz = self.open_file(rel)?;
            if !blz.is_full() {
                self.opened.lock().take(rel);
                active.insert(
                    leaf.to_string(),
                    ActiveLeaf {
                        rel_path: rel.clone(),
                        seq: *seq,
                        blz: Arc::clone(&blz),
                    },
                );
                return Ok((rel.clone(), blz));
            }
        }

        let seq = last_seq.map_or(0, |s| s + 1);
        self.create_active(&mut active, leaf, seq)
    }

    /// Replace the active file of `leaf` if `sealed_rel` is still active.
    fn rotate(&self, leaf: &str, sealed_rel: &str) -> Result<()> {
        let mut active = self.active.lock();
        let next_seq = match active.get(leaf) {
            Some(a) if a.rel_path == sealed_rel => a.seq + 1,
            // Another caller already rotated this leaf.
            _ => return Ok(()),
        };
        if let Some(sealed) = active.remove(leaf) {
            // Keep the sealed handle warm for reads.
            self.opened.lock().insert(sealed.rel_path, sealed.blz);
        }
        self.create_active(&mut active, leaf, next_seq)?;
        Ok(())
    }

    fn create_active(
        &self,
        active: &mut HashMap<String, ActiveLeaf>,
        leaf: &str,
        seq: u64,
    ) -> Result<(String, Arc<Blobovnicza>)> {
        let rel = Self::file_rel(leaf, seq);
        let blz = self.open_file(&rel)?;
        self.opened.lock().take(&rel);
        active.insert(
            leaf.to_string(),
            ActiveLeaf {
                rel_path: rel.clone(),
                seq,
                blz: Arc::clone(&blz),
            },
        );
        debug!(file = %rel, "opened active blobovnicza");
        Ok((rel, blz))
    }

    /// Open (or create) the file at `rel`, caching the handle.
    fn open_file(&self, rel: &str) -> Result<Arc<Blobovnicza>> {
        if let Some(blz) = self.opened.lock().get(rel) {
            return Ok(blz);
        }
        let blz = Arc::new(Blobovnicza::new(
            self.root.join(rel),
            self.cfg.object_size,
            self.cfg.size,
        ));
        blz.open()?;
        blz.init()?;
        self.opened.lock().insert(rel.to_string(), Arc::clone(&blz));
        Ok(blz)
    }

    /// Open the file at `rel` only if it exists on disk.
    fn handle(&self, rel: &str) -> Result<Option<Arc<Blobovnicza>>> {
        // The active map holds the freshest handles.
        {
            let active = self.active.lock();
            for leaf in active.values() {
                if leaf.rel_path == rel {
                    return Ok(Some(Arc::clone(&leaf.blz)));
                }
            }
        }
        if let Some(blz) = self.opened.lock().get(rel) {
            return Ok(Some(blz));
        }
        if !self.root.join(rel).is_file() {
            return Ok(None);
        }
        self.open_file(rel).map(Some)
    }

    fn leaf_files_sorted(&self, leaf: &str) -> Result<Vec<(u64, String)>> {
        let dir = self.root.join(leaf);
        let mut files = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".db") else { continue };
            let Ok(seq) = stem.parse::<u64>() else { continue };
            files.push((seq, Self::file_rel(leaf, seq)));
        }
        files.sort();
        Ok(files)
    }

    fn leaf_files_newest_first(&self, leaf: &str) -> Result<Vec<String>> {
        let mut files = self.leaf_files_sorted(leaf)?;
        files.reverse();
        Ok(files.into_iter().map(|(_, rel)| rel).collect())
    }

    /// Every blobovnicza file in the tree, in path order.
    fn all_files(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries: Vec<_> = match fs::read_dir(&dir) {
                Ok(rd) => rd.collect::<std::io::Result<_>>()?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("db") {
                    if let Ok(rel) = path.strip_prefix(&self.root) {
                        out.push(rel.to_string_lossy().into_owned());
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }
}
