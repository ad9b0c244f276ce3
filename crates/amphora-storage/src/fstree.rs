//! Hashed-directory filesystem layout for large objects.
//!
//! Each object is stored as one file. The path is derived from the SHA-256
//! of the file name (the dot-separated address), one hex nibble per
//! directory level:
//!
//! ```text
//! <root>/<h0>/<h1>/.../<h(depth-1)>/<container_hex>.<object_hex>
//! ```
//!
//! Writes go through a temp file and an atomic rename, so readers never
//! observe partial files.

use amphora_common::{hex_encode, Address, Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Filesystem tree of large objects.
#[derive(Debug, Clone)]
pub struct FsTree {
    root: PathBuf,
    depth: usize,
}

impl FsTree {
    /// Create a tree rooted at `root` with the given directory depth.
    pub fn open(root: impl Into<PathBuf>, depth: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, depth })
    }

    /// Root directory of the tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name of an address: `<container_hex>.<object_hex>`.
    fn file_name(addr: &Address) -> String {
        format!("{}.{}", addr.container, addr.object)
    }

    fn parse_file_name(name: &str) -> Option<Address> {
        let (container, object) = name.split_once('.')?;
        Some(Address::new(
            container.parse().ok()?,
            object.parse().ok()?,
        ))
    }

    fn tree_path(&self, addr: &Address) -> PathBuf {
        let name = Self::file_name(addr);
        let digest = Sha256::digest(name.as_bytes());
        let hex = hex_encode(&digest);

        let mut path = self.root.clone();
        for nibble in hex.chars().take(self.depth) {
            path.push(nibble.to_string());
        }
        path.push(name);
        path
    }

    /// Store object bytes. The write is atomic: data lands in a temp file
    /// first and is renamed into place.
    pub fn put(&self, addr: &Address, data: &[u8]) -> Result<()> {
        let path = self.tree_path(addr);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_file_name(format!("{}.tmp", Self::file_name(addr)));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read object bytes.
    pub fn get(&self, addr: &Address) -> Result<Vec<u8>> {
        match fs::read(self.tree_path(addr)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Check whether an object file exists.
    pub fn exists(&self, addr: &Address) -> bool {
        self.tree_path(addr).is_file()
    }

    /// Remove an object file.
    pub fn delete(&self, addr: &Address) -> Result<()> {
        match fs::remove_file(self.tree_path(addr)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Walk the tree in dictionary order, reading every file eagerly.
    /// The visitor returns `false` to stop early.
    pub fn iterate<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&Address, Vec<u8>) -> Result<bool>,
    {
        self.iterate_lazy(|addr, read| {
            let data = match read() {
                Ok(data) => data,
                Err(e) => {
                    warn!(address = %addr, error = %e, "skipping unreadable file");
                    return Ok(true);
                }
            };
            visit(addr, data)
        })
    }

    /// Walk the tree in dictionary order, yielding a read thunk per file so
    /// consumers can skip reads they do not need. The visitor returns
    /// `false` to stop early.
    pub fn iterate_lazy<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&Address, &dyn Fn() -> std::io::Result<Vec<u8>>) -> Result<bool>,
    {
        self.walk_dir(&self.root.clone(), &mut visit)?;
        Ok(())
    }

    // Returns false once the visitor asked to stop.
    fn walk_dir<F>(&self, dir: &Path, visit: &mut F) -> Result<bool>
    where
        F: FnMut(&Address, &dyn Fn() -> std::io::Result<Vec<u8>>) -> Result<bool>,
    {
        let mut entries: Vec<_> = match fs::read_dir(dir) {
            Ok(rd) => rd.collect::<std::io::Result<_>>()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                if !self.walk_dir(&path, visit)? {
                    return Ok(false);
                }
                continue;
            }

            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Unfinished temp files are not objects.
            let Some(addr) = Self::parse_file_name(name) else {
                continue;
            };

            let read_path = path.clone();
            let thunk = move || fs::read(&read_path);
            if !visit(&addr, &thunk)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amphora_common::{ContainerId, Object};
    use bytes::Bytes;
    use tempfile::tempdir;

    fn addr_for(payload: &[u8]) -> Address {
        Object::new_regular(ContainerId::from_bytes([1; 32]), Bytes::copy_from_slice(payload))
            .address()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let tree = FsTree::open(dir.path(), 4).unwrap();

        let addr = addr_for(b"large object payload");
        tree.put(&addr, b"large object payload").unwrap();
        assert!(tree.exists(&addr));
        assert_eq!(tree.get(&addr).unwrap(), b"large object payload");

        tree.delete(&addr).unwrap();
        assert!(!tree.exists(&addr));
        assert!(tree.get(&addr).unwrap_err().is_not_found());
        assert!(tree.delete(&addr).unwrap_err().is_not_found());
    }

    #[test]
    fn test_overwrite_same_address() {
        let dir = tempdir().unwrap();
        let tree = FsTree::open(dir.path(), 2).unwrap();

        let addr = addr_for(b"payload");
        tree.put(&addr, b"payload").unwrap();
        tree.put(&addr, b"payload").unwrap();
        assert_eq!(tree.get(&addr).unwrap(), b"payload");
    }

    #[test]
    fn test_iterate_sees_all_objects() {
        let dir = tempdir().unwrap();
        let tree = FsTree::open(dir.path(), 3).unwrap();

        let mut want = std::collections::HashMap::new();
        for i in 0u8..10 {
            let payload = vec![i; 16];
            let addr = addr_for(&payload);
            tree.put(&addr, &payload).unwrap();
            want.insert(addr, payload);
        }

        tree.iterate(|addr, data| {
            assert_eq!(want.remove(addr).as_deref(), Some(data.as_slice()));
            Ok(true)
        })
        .unwrap();
        assert!(want.is_empty());
    }

    #[test]
    fn test_iterate_early_stop() {
        let dir = tempdir().unwrap();
        let tree = FsTree::open(dir.path(), 1).unwrap();

        for i in 0u8..5 {
            let payload = vec![i; 8];
            tree.put(&addr_for(&payload), &payload).unwrap();
        }

        let mut seen = 0;
        tree.iterate(|_, _| {
            seen += 1;
            Ok(seen < 2)
        })
        .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_lazy_iteration_skips_reads() {
        let dir = tempdir().unwrap();
        let tree = FsTree::open(dir.path(), 2).unwrap();

        for i in 0u8..4 {
            let payload = vec![i; 8];
            tree.put(&addr_for(&payload), &payload).unwrap();
        }

        // Visit every entry without ever invoking the thunk.
        let mut seen = 0;
        tree.iterate_lazy(|_, _read| {
            seen += 1;
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, 4);
    }
}
